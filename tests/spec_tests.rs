//! Tests for launch spec composition.
//!
//! Tests profile mounts, the privilege overlay, and rendering into an OCI
//! runtime spec.

use host_ctr::error::Error;
use host_ctr::registry::ImageConfig;
use host_ctr::spec::{self, Namespace, OciSpec, SpecOpt};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// =============================================================================
// Composition
// =============================================================================

#[test]
fn test_control_unprivileged() {
    let opts = spec::build("control", false);

    let mounts = opts.mounts();
    assert_eq!(mounts.len(), 1, "control should get the API socket only");
    assert_eq!(mounts[0].destination, "/run/api.sock");
    assert_eq!(mounts[0].source, "/run/api.sock");
    assert_eq!(mounts[0].options, vec!["bind", "rw"]);
    assert!(opts.privileged_options().is_empty());
}

#[test]
fn test_admin_superpowered() {
    let opts = spec::build("admin", true);

    let mounts = opts.mounts();
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].destination, "/dev");
    assert_eq!(mounts[0].options, vec!["rbind", "rshared", "rw"]);
    assert_eq!(mounts[1].destination, "/var/log");
    assert_eq!(mounts[1].options, vec!["rbind", "rw"]);

    assert_eq!(opts.privileged_options().len(), 4);
    assert!(opts.contains(&SpecOpt::HostNamespace(Namespace::Pid)));
    assert!(opts.contains(&SpecOpt::ParentCgroupDevices));
    assert!(opts.contains(&SpecOpt::Privileged));
    assert!(opts.contains(&SpecOpt::NewPrivileges));
}

#[test]
fn test_unknown_id_gets_nothing_extra() {
    let opts = spec::build("unknown", false);
    assert!(opts.mounts().is_empty());
    assert!(opts.privileged_options().is_empty());
}

#[test]
fn test_base_options_always_present() {
    for (id, superpowered) in [("control", false), ("admin", true), ("other", true)] {
        let opts = spec::build(id, superpowered);
        assert!(opts.contains(&SpecOpt::ImageConfig));
        assert!(opts.contains(&SpecOpt::HostNamespace(Namespace::Network)));
        assert!(opts.contains(&SpecOpt::HostHostsFile));
        assert!(opts.contains(&SpecOpt::HostResolvConf));
        assert!(opts.contains(&SpecOpt::Cgroup(
            "/runtime.slice/host-containers".to_string()
        )));
    }
}

#[test]
fn test_options_deterministic() {
    assert_eq!(spec::build("admin", true), spec::build("admin", true));
    assert_ne!(spec::build("admin", true), spec::build("admin", false));
}

// =============================================================================
// Rendering
// =============================================================================

fn render(id: &str, superpowered: bool, image: &ImageConfig) -> OciSpec {
    spec::build(id, superpowered)
        .render(id, image, Path::new("/nonexistent"))
        .unwrap()
}

fn image_config() -> ImageConfig {
    ImageConfig {
        env: vec!["LANG=C.UTF-8".to_string()],
        entrypoint: Some(vec!["/usr/bin/start".to_string()]),
        cmd: Some(vec!["--verbose".to_string()]),
        working_dir: Some("/home/ec2-user".to_string()),
        user: Some("1000:100".to_string()),
    }
}

#[test]
fn test_render_unprivileged() {
    let spec = render("control", false, &image_config());

    assert_eq!(spec.hostname, "control");
    assert_eq!(spec.process.args, vec!["/usr/bin/start", "--verbose"]);
    assert!(spec.process.env.contains(&"LANG=C.UTF-8".to_string()));
    assert!(
        spec.process.env.iter().any(|e| e.starts_with("PATH=")),
        "should fill in PATH"
    );
    assert_eq!(spec.process.cwd, "/home/ec2-user");
    assert_eq!((spec.process.user.uid, spec.process.user.gid), (1000, 100));
    assert!(spec.process.no_new_privileges);

    assert!(spec.shares_host_namespace(Namespace::Network));
    assert!(!spec.shares_host_namespace(Namespace::Pid));
    assert_eq!(
        spec.linux.cgroups_path.as_deref(),
        Some("/runtime.slice/host-containers")
    );
    assert!(!spec.linux.masked_paths.is_empty());

    let destinations: Vec<&str> = spec.mounts.iter().map(|m| m.destination.as_str()).collect();
    assert!(destinations.contains(&"/etc/hosts"));
    assert!(destinations.contains(&"/etc/resolv.conf"));
    assert!(destinations.contains(&"/run/api.sock"));
}

#[test]
fn test_render_superpowered() {
    let spec = render("admin", true, &ImageConfig::default());

    assert!(spec.shares_host_namespace(Namespace::Pid));
    assert!(spec.shares_host_namespace(Namespace::Network));
    assert!(!spec.process.no_new_privileges);
    assert!(
        spec.process
            .capabilities
            .bounding
            .contains(&"CAP_SYS_ADMIN".to_string())
    );
    assert!(spec.linux.masked_paths.is_empty());
    assert!(spec.linux.readonly_paths.is_empty());
    assert!(spec.linux.resources.devices.iter().all(|d| d.allow));
    assert!(spec.mounts.iter().any(|m| m.destination == "/dev" && m.mount_type == "bind"));
}

#[test]
fn test_render_empty_image_config_keeps_defaults() {
    let spec = render("other", false, &ImageConfig::default());

    assert_eq!(spec.process.args, vec!["/bin/sh"]);
    assert_eq!(spec.process.cwd, "/");
    assert_eq!(spec.process.user.uid, 0);
    assert!(
        !spec
            .process
            .capabilities
            .bounding
            .contains(&"CAP_SYS_ADMIN".to_string())
    );
    assert!(spec.linux.resources.devices.iter().all(|d| !d.allow));
}

#[test]
fn test_render_serializes_camel_case() {
    let spec = render("admin", false, &ImageConfig::default());
    let json = serde_json::to_value(&spec).unwrap();

    assert_eq!(json["ociVersion"], "1.0.2");
    assert_eq!(json["linux"]["cgroupsPath"], "/runtime.slice/host-containers");
    assert_eq!(json["process"]["noNewPrivileges"], true);
    assert!(json["mounts"][0]["type"].is_string());
}

// =============================================================================
// Image User
// =============================================================================

fn rootfs_with_users() -> TempDir {
    let rootfs = TempDir::new().unwrap();
    fs::create_dir_all(rootfs.path().join("etc")).unwrap();
    fs::write(
        rootfs.path().join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/sh\nec2-user:x:1000:1000::/home/ec2-user:/bin/bash\n",
    )
    .unwrap();
    fs::write(
        rootfs.path().join("etc/group"),
        "root:x:0:\nec2-user:x:1000:\nwheel:x:10:ec2-user\n",
    )
    .unwrap();
    rootfs
}

#[test]
fn test_render_resolves_named_user() {
    let rootfs = rootfs_with_users();
    let image = ImageConfig {
        user: Some("ec2-user:wheel".to_string()),
        ..ImageConfig::default()
    };

    let spec = spec::build("admin", false)
        .render("admin", &image, rootfs.path())
        .unwrap();
    assert_eq!((spec.process.user.uid, spec.process.user.gid), (1000, 10));
}

#[test]
fn test_render_unknown_user_fails() {
    let rootfs = rootfs_with_users();
    let image = ImageConfig {
        user: Some("nobody".to_string()),
        ..ImageConfig::default()
    };

    let err = spec::build("admin", false)
        .render("admin", &image, rootfs.path())
        .unwrap_err();
    assert!(
        matches!(err, Error::InvalidUser { ref user, .. } if user == "nobody"),
        "an unknown user must not run as root: {:?}",
        err
    );
}

#[cfg(unix)]
#[test]
fn test_render_refuses_symlinked_passwd() {
    let rootfs = TempDir::new().unwrap();
    let host_etc = TempDir::new().unwrap();
    fs::write(host_etc.path().join("passwd"), "svc:x:0:0::/:/bin/sh\n").unwrap();
    std::os::unix::fs::symlink(host_etc.path(), rootfs.path().join("etc")).unwrap();
    let image = ImageConfig {
        user: Some("svc".to_string()),
        ..ImageConfig::default()
    };

    let result = spec::build("admin", false).render("admin", &image, rootfs.path());
    assert!(result.is_err(), "passwd outside the rootfs must not be read");
}
