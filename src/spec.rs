//! # Launch Spec Builder
//!
//! Composes the runtime options a host container is launched with. The
//! option set is built by [`build`], a pure function of the container ID and
//! the `superpowered` flag, and rendered into an OCI runtime spec by
//! [`SpecOptions::render`] once the image config is known.
//!
//! ## Option Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Base (always)                                                │
//! │   image config │ host network │ /etc/hosts │ resolv.conf     │
//! │   cgroup /runtime.slice/host-containers                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Launch profile (by container ID)                             │
//! │   control → /run/api.sock                                    │
//! │   admin   → /dev, /var/log                                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Privilege overlay (superpowered only)                        │
//! │   host PID │ parent cgroup devices │ privileged │ new privs  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! When `superpowered` is false the overlay contributes nothing to the set:
//! the options are absent, not present-but-disabled.

use crate::bundle::contained_path;
use crate::constants::{
    ADMIN_CONTAINER, API_SOCKET_PATH, CONTROL_CONTAINER, DEFAULT_PATH_ENV, HOST_CONTAINERS_CGROUP,
    HOST_DEV_PATH, HOST_HOSTS_FILE, HOST_LOG_PATH, HOST_RESOLV_CONF, OCI_RUNTIME_SPEC_VERSION,
};
use crate::error::{Error, Result};
use crate::registry::ImageConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// =============================================================================
// Spec Options
// =============================================================================

/// Linux namespace kinds that can be shared with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Pid,
    Network,
    Ipc,
    Uts,
    Mount,
}

impl Namespace {
    /// Namespace type as written in `config.json`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "network",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Mount => "mount",
        }
    }
}

/// A single composable runtime option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecOpt {
    /// Process args, env, cwd and user from the image config.
    ImageConfig,
    /// Join the host's namespace instead of creating one.
    HostNamespace(Namespace),
    /// Bind the host `/etc/hosts`.
    HostHostsFile,
    /// Bind the host `/etc/resolv.conf`.
    HostResolvConf,
    /// Place the container under a cgroup path.
    Cgroup(String),
    /// Additional mounts.
    Mounts(Vec<OciMount>),
    /// Allow access to all devices permitted to the parent cgroup.
    ParentCgroupDevices,
    /// Full capabilities, no masked or read-only paths.
    Privileged,
    /// Allow the process to gain privileges (`noNewPrivileges = false`).
    NewPrivileges,
}

impl SpecOpt {
    /// Returns true for options only granted to superpowered containers.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            Self::HostNamespace(Namespace::Pid)
                | Self::ParentCgroupDevices
                | Self::Privileged
                | Self::NewPrivileges
        )
    }
}

/// Composed runtime options for one host container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecOptions {
    opts: Vec<SpecOpt>,
}

/// Builds the launch options for `container_id`.
pub fn build(container_id: &str, superpowered: bool) -> SpecOptions {
    let mut opts = vec![
        SpecOpt::ImageConfig,
        SpecOpt::HostNamespace(Namespace::Network),
        SpecOpt::HostHostsFile,
        SpecOpt::HostResolvConf,
        SpecOpt::Cgroup(HOST_CONTAINERS_CGROUP.to_string()),
    ];

    let mounts = profile_mounts(container_id);
    if !mounts.is_empty() {
        opts.push(SpecOpt::Mounts(mounts));
    }

    opts.extend(privilege_overlay(superpowered));

    SpecOptions { opts }
}

/// Mounts granted to a host container by its launch profile.
///
/// `control` gets the API socket; `admin` gets the host device tree and log
/// directory. Every other ID gets nothing.
pub fn profile_mounts(container_id: &str) -> Vec<OciMount> {
    match container_id {
        CONTROL_CONTAINER => vec![OciMount::bind(API_SOCKET_PATH, &["bind", "rw"])],
        ADMIN_CONTAINER => vec![
            OciMount::bind(HOST_DEV_PATH, &["rbind", "rshared", "rw"]),
            OciMount::bind(HOST_LOG_PATH, &["rbind", "rw"]),
        ],
        _ => Vec::new(),
    }
}

/// Options added for superpowered containers; empty otherwise.
pub fn privilege_overlay(superpowered: bool) -> Vec<SpecOpt> {
    if !superpowered {
        return Vec::new();
    }
    vec![
        SpecOpt::HostNamespace(Namespace::Pid),
        SpecOpt::ParentCgroupDevices,
        SpecOpt::Privileged,
        SpecOpt::NewPrivileges,
    ]
}

impl SpecOptions {
    /// Returns the composed options in application order.
    pub fn options(&self) -> &[SpecOpt] {
        &self.opts
    }

    /// Returns all profile mounts in the set.
    pub fn mounts(&self) -> Vec<&OciMount> {
        self.opts
            .iter()
            .filter_map(|opt| match opt {
                SpecOpt::Mounts(mounts) => Some(mounts.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Returns the privilege options present in the set.
    pub fn privileged_options(&self) -> Vec<&SpecOpt> {
        self.opts.iter().filter(|opt| opt.is_privileged()).collect()
    }

    /// Returns true if `opt` is part of the set.
    pub fn contains(&self, opt: &SpecOpt) -> bool {
        self.opts.contains(opt)
    }

    /// Renders the options into an OCI runtime spec for container `id`.
    ///
    /// A named image user is resolved against `rootfs`; one that cannot be
    /// resolved fails with [`Error::InvalidUser`].
    pub fn render(&self, id: &str, image: &ImageConfig, rootfs: &Path) -> Result<OciSpec> {
        let mut spec = OciSpec::base(id);
        for opt in &self.opts {
            match opt {
                SpecOpt::ImageConfig => spec.apply_image_config(image, rootfs)?,
                SpecOpt::HostNamespace(ns) => spec.share_host_namespace(*ns),
                SpecOpt::HostHostsFile => {
                    spec.mounts
                        .push(OciMount::bind(HOST_HOSTS_FILE, &["rbind", "ro"]));
                }
                SpecOpt::HostResolvConf => {
                    spec.mounts
                        .push(OciMount::bind(HOST_RESOLV_CONF, &["rbind", "ro"]));
                }
                SpecOpt::Cgroup(path) => spec.linux.cgroups_path = Some(path.clone()),
                SpecOpt::Mounts(mounts) => spec.mounts.extend(mounts.iter().cloned()),
                SpecOpt::ParentCgroupDevices => {
                    spec.linux.resources.devices = vec![OciDeviceRule {
                        allow: true,
                        access: Some("rwm".to_string()),
                    }];
                }
                SpecOpt::Privileged => spec.make_privileged(),
                SpecOpt::NewPrivileges => spec.process.no_new_privileges = false,
            }
        }
        Ok(spec)
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Capabilities granted to unprivileged host containers.
const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Every capability known to the kernel, granted to privileged containers.
const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

const DEFAULT_MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    pub linux: OciLinux,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: OciCapabilities,
    pub no_new_privileges: bool,
}

/// OCI user config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

/// OCI process capability sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciCapabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
}

impl OciCapabilities {
    fn from_list(caps: &[&str]) -> Self {
        Self {
            bounding: strings(caps),
            effective: strings(caps),
            permitted: strings(caps),
        }
    }
}

/// OCI mount config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl OciMount {
    /// Bind mount of a host path at the same location in the container.
    pub fn bind(path: &str, options: &[&str]) -> Self {
        Self {
            destination: path.to_string(),
            mount_type: "bind".to_string(),
            source: path.to_string(),
            options: strings(options),
        }
    }
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    pub resources: OciResources,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
}

/// OCI namespace config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// OCI resource config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(default)]
    pub devices: Vec<OciDeviceRule>,
}

/// OCI device cgroup rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciDeviceRule {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

impl OciSpec {
    /// Default spec: isolated namespaces, standard mounts, default
    /// capabilities, no device access.
    fn base(id: &str) -> Self {
        let namespaces = [
            Namespace::Pid,
            Namespace::Network,
            Namespace::Ipc,
            Namespace::Uts,
            Namespace::Mount,
        ]
        .iter()
        .map(|ns| OciNamespace {
            ns_type: ns.as_str().to_string(),
            path: None,
        })
        .collect();

        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: OciRoot {
                path: "rootfs".to_string(),
                readonly: false,
            },
            process: OciProcess {
                terminal: false,
                user: OciUser::default(),
                args: vec!["/bin/sh".to_string()],
                env: vec![DEFAULT_PATH_ENV.to_string()],
                cwd: "/".to_string(),
                capabilities: OciCapabilities::from_list(DEFAULT_CAPABILITIES),
                no_new_privileges: true,
            },
            hostname: id.to_string(),
            mounts: default_mounts(),
            linux: OciLinux {
                namespaces,
                cgroups_path: None,
                resources: OciResources {
                    devices: vec![OciDeviceRule {
                        allow: false,
                        access: Some("rwm".to_string()),
                    }],
                },
                masked_paths: strings(DEFAULT_MASKED_PATHS),
                readonly_paths: strings(DEFAULT_READONLY_PATHS),
            },
        }
    }

    fn apply_image_config(&mut self, image: &ImageConfig, rootfs: &Path) -> Result<()> {
        let mut args: Vec<String> = image.entrypoint.clone().unwrap_or_default();
        args.extend(image.cmd.clone().unwrap_or_default());
        if !args.is_empty() {
            self.process.args = args;
        }

        if !image.env.is_empty() {
            self.process.env = image.env.clone();
            if !self.process.env.iter().any(|e| e.starts_with("PATH=")) {
                self.process.env.push(DEFAULT_PATH_ENV.to_string());
            }
        }

        if let Some(dir) = image.working_dir.as_deref().filter(|d| !d.is_empty()) {
            self.process.cwd = dir.to_string();
        }

        if let Some(user) = image.user.as_deref().filter(|u| !u.is_empty()) {
            self.process.user = resolve_user(rootfs, user)?;
        }
        Ok(())
    }

    fn share_host_namespace(&mut self, ns: Namespace) {
        self.linux.namespaces.retain(|n| n.ns_type != ns.as_str());
    }

    fn make_privileged(&mut self) {
        self.process.capabilities = OciCapabilities::from_list(ALL_CAPABILITIES);
        self.linux.masked_paths.clear();
        self.linux.readonly_paths.clear();
        for mount in &mut self.mounts {
            if mount.destination == "/sys" {
                mount.options.retain(|o| o != "ro");
                mount.options.push("rw".to_string());
            }
        }
    }

    /// Returns true if the container joins the host's `ns` namespace.
    pub fn shares_host_namespace(&self, ns: Namespace) -> bool {
        !self.linux.namespaces.iter().any(|n| n.ns_type == ns.as_str())
    }
}

// =============================================================================
// Image User
// =============================================================================

/// Resolves an image `USER` of the form `user[:group]` against `rootfs`.
///
/// Each part is numeric or a name. Names are looked up in the image's
/// `/etc/passwd` and `/etc/group`. A numeric user without a group takes the
/// primary group of its passwd entry, or 0 when there is none.
pub fn resolve_user(rootfs: &Path, user: &str) -> Result<OciUser> {
    let invalid = |reason: String| Error::InvalidUser {
        user: user.to_string(),
        reason,
    };

    let (name, group) = match user.split_once(':') {
        Some((name, group)) => (name, Some(group)),
        None => (user, None),
    };
    if name.is_empty() || group.is_some_and(str::is_empty) {
        return Err(invalid("empty user or group".to_string()));
    }

    let (uid, primary_gid) = match name.parse::<u32>() {
        Ok(uid) if group.is_some() => (uid, 0),
        Ok(uid) => {
            let gid = read_passwd(rootfs)?
                .into_iter()
                .find(|entry| entry.uid == uid)
                .map_or(0, |entry| entry.gid);
            (uid, gid)
        }
        Err(_) => read_passwd(rootfs)?
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| (entry.uid, entry.gid))
            .ok_or_else(|| invalid(format!("no passwd entry for '{}'", name)))?,
    };

    let gid = match group {
        None => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => read_group(rootfs)?
                .into_iter()
                .find(|(name, _)| name == group)
                .map(|(_, gid)| gid)
                .ok_or_else(|| invalid(format!("no group entry for '{}'", group)))?,
        },
    };

    Ok(OciUser { uid, gid })
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

fn read_passwd(rootfs: &Path) -> Result<Vec<PasswdEntry>> {
    Ok(read_user_db(rootfs, "etc/passwd")?
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 || line.starts_with('#') {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
            })
        })
        .collect())
}

fn read_group(rootfs: &Path) -> Result<Vec<(String, u32)>> {
    Ok(read_user_db(rootfs, "etc/group")?
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 || line.starts_with('#') {
                return None;
            }
            Some((fields[0].to_string(), fields[2].parse().ok()?))
        })
        .collect())
}

/// Reads a database file of the image, or nothing when it is absent.
fn read_user_db(rootfs: &Path, rel: &str) -> Result<String> {
    match contained_path(rootfs, Path::new(rel))? {
        Some(path) if path.is_file() => Ok(fs::read_to_string(path)?),
        _ => Ok(String::new()),
    }
}

/// Standard mounts every container receives.
fn default_mounts() -> Vec<OciMount> {
    let mount = |destination: &str, mount_type: &str, options: &[&str]| OciMount {
        destination: destination.to_string(),
        mount_type: mount_type.to_string(),
        source: mount_type.to_string(),
        options: strings(options),
    };
    vec![
        mount("/proc", "proc", &["nosuid", "noexec", "nodev"]),
        mount("/dev", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        mount(
            "/dev/pts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        ),
        mount("/dev/shm", "tmpfs", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        mount("/dev/mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        mount("/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ]
}
