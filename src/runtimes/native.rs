//! # Native Container Client - In-Process Runtime on libcontainer
//!
//! Implements [`ContainerClient`] in-process: images are pulled with the
//! registry client into the content store, unpacked into an overlayfs
//! snapshot, and tasks run under youki's `libcontainer`.
//!
//! ## Layout
//!
//! ```text
//! <runtime-root>/<namespace>/
//! ├── containers/<id>/    (libcontainer state, i.e. the task)
//! └── bundles/<id>/       (config.json)
//! <content-root>/
//! ├── blobs/...
//! └── snapshots/overlayfs/{committed,active/<namespace>}/...
//! ```
//!
//! The runtime root plays the role of the daemon endpoint: connecting fails
//! when it cannot be used, and the namespace scopes everything created
//! below it.
//!
//! ## Exit Reaping
//!
//! The launcher marks itself a child subreaper when connecting, so a task's
//! init process is reparented to it once libcontainer's intermediate process
//! exits. The exit waiter polls the task every `EXIT_POLL_INTERVAL` and
//! reaps the init process with `waitpid(WNOHANG)`.
//!
//! ## Platform Support
//!
//! Linux-only. On other platforms [`NativeClient::connect`] returns
//! [`Error::RuntimeUnavailable`].
//!
//! [`ContainerClient`]: crate::runtime::ContainerClient
//! [`Error::RuntimeUnavailable`]: crate::error::Error::RuntimeUnavailable

// =============================================================================
// Linux Implementation
// =============================================================================

#[cfg(target_os = "linux")]
mod linux {
    use crate::bundle::{unpack_layers, write_bundle};
    use crate::constants::{
        BUNDLE_DIR, CONTAINER_STATE_DIR, DEFAULT_SNAPSHOTTER, EXIT_POLL_INTERVAL,
        validate_container_id,
    };
    use crate::error::{Error, Result};
    use crate::image::Transport;
    use crate::registry::{ImageHandle, pull_image};
    use crate::runtime::{ContainerClient, ExitStatus, ExitWaiter, Signal};
    use crate::spec::SpecOptions;
    use crate::storage::{ActiveSnapshot, BlobStore, SnapshotStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::ffi::CString;
    use std::path::{Path, PathBuf};
    use std::sync::RwLock;
    use tokio::sync::oneshot;
    use tracing::{debug, info, warn};

    use libcontainer::container::builder::ContainerBuilder;
    use libcontainer::container::{Container, ContainerStatus as NativeStatus};
    use libcontainer::signal::Signal as LibcontainerSignal;
    use libcontainer::syscall::syscall::SyscallType;

    /// What the client knows about a container it created.
    #[derive(Debug, Clone)]
    struct ContainerRecord {
        /// Snapshot holding the container's rootfs.
        snapshot: ActiveSnapshot,
        /// Bundle directory.
        bundle: PathBuf,
        /// Init PID, captured at start.
        init_pid: Option<i32>,
    }

    /// In-process container client.
    ///
    /// Thread-safe; container records are protected by an internal `RwLock`.
    /// Containers are not cleaned up on drop.
    pub struct NativeClient {
        content_root: PathBuf,
        namespace: String,
        state_root: PathBuf,
        bundle_root: PathBuf,
        blobs: BlobStore,
        containers: RwLock<HashMap<String, ContainerRecord>>,
    }

    impl NativeClient {
        /// Connects to the runtime rooted at `runtime_root`, storing content
        /// under `content_root`, scoped to `namespace`.
        pub fn connect(runtime_root: &Path, content_root: &Path, namespace: &str) -> Result<Self> {
            let connect_failed = |reason: String| Error::ConnectFailed {
                endpoint: runtime_root.to_path_buf(),
                reason,
            };

            if namespace.is_empty() || namespace.contains('/') || namespace.contains("..") {
                return Err(connect_failed(format!("invalid namespace '{}'", namespace)));
            }

            if !Path::new("/proc/self/ns/pid").exists() {
                return Err(connect_failed("Linux namespaces not available".to_string()));
            }

            let ns_root = runtime_root.join(namespace);
            let state_root = ns_root.join(CONTAINER_STATE_DIR);
            let bundle_root = ns_root.join(BUNDLE_DIR);
            for dir in [&state_root, &bundle_root] {
                std::fs::create_dir_all(dir)
                    .map_err(|e| connect_failed(format!("cannot create {}: {}", dir.display(), e)))?;
            }

            let blobs = BlobStore::open(content_root).map_err(|e| connect_failed(e.to_string()))?;

            // SAFETY: prctl(PR_SET_CHILD_SUBREAPER) only changes this
            // process's reaping attribute.
            let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(error = %err, "failed to become child subreaper");
            }

            info!(
                root = %runtime_root.display(),
                namespace,
                "connected to native runtime"
            );

            Ok(Self {
                content_root: content_root.to_path_buf(),
                namespace: namespace.to_string(),
                state_root,
                bundle_root,
                blobs,
                containers: RwLock::new(HashMap::new()),
            })
        }

        fn snapshots(&self, snapshotter: &str) -> Result<SnapshotStore> {
            SnapshotStore::open(&self.content_root, snapshotter, &self.namespace)
        }

        fn record(&self, id: &str) -> Result<Option<ContainerRecord>> {
            let containers = self
                .containers
                .read()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            Ok(containers.get(id).cloned())
        }

        fn load_task(&self, id: &str) -> std::result::Result<Container, String> {
            load_task(&self.state_root, id)
        }

        /// Unmounts and removes a snapshot, logging failures.
        fn discard_snapshot(&self, snapshot: &ActiveSnapshot) -> Result<()> {
            unmount(&snapshot.rootfs);
            self.snapshots(DEFAULT_SNAPSHOTTER)?.remove(&snapshot.name)
        }
    }

    fn load_task(state_root: &Path, id: &str) -> std::result::Result<Container, String> {
        let dir = state_root.join(id);
        if !dir.exists() {
            return Err(format!("task {} not found", id));
        }
        Container::load(dir).map_err(|e| format!("failed to load task {}: {}", id, e))
    }

    /// Outcome of a non-blocking reap attempt.
    enum Reap {
        Exited(u32),
        Running,
        NotChild,
    }

    fn reap(pid: i32) -> Reap {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid with WNOHANG on a known PID does not block and
        // only writes to `status`.
        let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

        if result == 0 {
            Reap::Running
        } else if result > 0 && libc::WIFEXITED(status) {
            Reap::Exited(libc::WEXITSTATUS(status) as u32)
        } else if result > 0 && libc::WIFSIGNALED(status) {
            // Shell convention: 128 + signal number.
            Reap::Exited(128 + libc::WTERMSIG(status) as u32)
        } else {
            Reap::NotChild
        }
    }

    /// Polls task `id` until its init process exits.
    async fn watch_exit(state_root: PathBuf, id: String, tx: oneshot::Sender<ExitStatus>) {
        loop {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;

            if tx.is_closed() {
                debug!(id, "exit waiter dropped");
                return;
            }

            let container = match load_task(&state_root, &id) {
                Ok(container) => container,
                Err(reason) => {
                    let _ = tx.send(ExitStatus::failed(reason));
                    return;
                }
            };

            let Some(pid) = container.pid() else {
                continue;
            };

            match reap(pid.as_raw()) {
                Reap::Exited(code) => {
                    debug!(id, pid = pid.as_raw(), code, "task exited");
                    let _ = tx.send(ExitStatus::new(code));
                    return;
                }
                Reap::Running => {}
                Reap::NotChild => {
                    if container.state.status == NativeStatus::Stopped {
                        let _ = tx.send(ExitStatus::failed(format!(
                            "task {} stopped but PID {} could not be reaped",
                            id, pid
                        )));
                        return;
                    }
                }
            }
        }
    }

    fn mount_overlay(snapshot: &ActiveSnapshot) -> std::io::Result<()> {
        let to_cstring = |s: String| {
            CString::new(s)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        };
        let source = to_cstring("overlay".to_string())?;
        let target = to_cstring(snapshot.rootfs.to_string_lossy().into_owned())?;
        let fstype = to_cstring("overlay".to_string())?;
        let data = to_cstring(snapshot.overlay_options())?;

        // SAFETY: all pointers come from live CStrings.
        let ret = unsafe {
            libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                0,
                data.as_ptr() as *const libc::c_void,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn unmount(path: &Path) {
        let Ok(target) = CString::new(path.to_string_lossy().into_owned()) else {
            return;
        };
        // SAFETY: `target` is a live CString.
        let ret = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) && err.raw_os_error() != Some(libc::ENOENT)
            {
                warn!(path = %path.display(), error = %err, "failed to unmount");
            }
        }
    }

    /// Records `reason` unless an earlier failure was already recorded.
    fn keep_first(failure: &mut Option<String>, id: &str, reason: String) {
        warn!(id, error = %reason, "container cleanup step failed");
        failure.get_or_insert(reason);
    }

    /// Signals go to the init process only. Every host container runs in the
    /// same cgroup, so the cgroup's pid set spans sibling containers.
    const KILL_ALL_PROCESSES: bool = false;

    /// Interprets a kill result. A task that is already stopped counts as
    /// exited rather than failed; returns whether the signal was delivered.
    fn signal_outcome(
        result: std::result::Result<(), String>,
        status: NativeStatus,
    ) -> std::result::Result<bool, String> {
        match result {
            Ok(()) => Ok(true),
            Err(_) if status == NativeStatus::Stopped => Ok(false),
            Err(reason) => Err(reason),
        }
    }

    fn to_libcontainer_signal(signal: Signal) -> std::result::Result<LibcontainerSignal, String> {
        LibcontainerSignal::try_from(signal.to_string().as_str())
            .map_err(|e| format!("invalid signal: {}", e))
    }

    #[async_trait]
    impl ContainerClient for NativeClient {
        fn name(&self) -> &str {
            "native"
        }

        async fn pull(&self, reference: &str, transport: &Transport) -> Result<ImageHandle> {
            let target = transport.target(reference).await?;
            pull_image(reference, &target, &self.blobs).await
        }

        async fn unpack(&self, image: &ImageHandle, snapshotter: &str) -> Result<()> {
            let store = self.snapshots(snapshotter)?;
            let tree = store.commit(&image.digest, |dir| {
                unpack_layers(&image.layers, &self.blobs, dir)
            })?;
            debug!(reference = %image.reference, tree = %tree.display(), "image unpacked");
            Ok(())
        }

        async fn create_container(
            &self,
            id: &str,
            image: &ImageHandle,
            snapshot: &str,
            spec: &SpecOptions,
        ) -> Result<()> {
            let create_failed = |reason: String| Error::ContainerCreateFailed {
                id: id.to_string(),
                reason,
            };

            validate_container_id(id).map_err(|reason| create_failed(reason.to_string()))?;
            if self.record(id)?.is_some() {
                return Err(create_failed("container already exists".to_string()));
            }

            let store = self
                .snapshots(DEFAULT_SNAPSHOTTER)
                .map_err(|e| create_failed(e.to_string()))?;
            let active = store
                .prepare(snapshot, &image.digest)
                .map_err(|e| create_failed(e.to_string()))?;

            if let Err(e) = mount_overlay(&active) {
                let _ = store.remove(snapshot);
                return Err(create_failed(format!("failed to mount snapshot: {}", e)));
            }

            let oci_spec = match spec.render(id, &image.config, &active.rootfs) {
                Ok(oci_spec) => oci_spec,
                Err(e) => {
                    let _ = self.discard_snapshot(&active);
                    return Err(create_failed(e.to_string()));
                }
            };
            let bundle = match write_bundle(&self.bundle_root.join(id), &active.rootfs, &oci_spec) {
                Ok(bundle) => bundle,
                Err(e) => {
                    let _ = self.discard_snapshot(&active);
                    let _ = std::fs::remove_dir_all(self.bundle_root.join(id));
                    return Err(create_failed(e.to_string()));
                }
            };

            let mut containers = self
                .containers
                .write()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            containers.insert(
                id.to_string(),
                ContainerRecord {
                    snapshot: active,
                    bundle: bundle.path,
                    init_pid: None,
                },
            );

            info!(id, snapshot, "created container");
            Ok(())
        }

        async fn delete_container(&self, id: &str, cleanup_snapshot: bool) -> Result<()> {
            let delete_failed = |reason: String| Error::DeleteFailed {
                id: id.to_string(),
                reason,
            };

            let record = {
                let mut containers = self
                    .containers
                    .write()
                    .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
                containers.remove(id)
            }
            .ok_or_else(|| delete_failed("container not found".to_string()))?;

            // Every step runs even when an earlier one failed, so the
            // snapshot never outlives its container.
            let mut failure = None;

            // A task left behind is removed with its container.
            if let Ok(mut task) = self.load_task(id)
                && let Err(e) = task.delete(true)
            {
                keep_first(&mut failure, id, format!("failed to delete task: {}", e));
            }

            if record.bundle.exists()
                && let Err(e) = std::fs::remove_dir_all(&record.bundle)
            {
                keep_first(&mut failure, id, format!("failed to remove bundle: {}", e));
            }

            if cleanup_snapshot {
                if let Err(e) = self.discard_snapshot(&record.snapshot) {
                    keep_first(&mut failure, id, format!("failed to remove snapshot: {}", e));
                }
            } else {
                unmount(&record.snapshot.rootfs);
            }

            match failure {
                Some(reason) => Err(delete_failed(reason)),
                None => {
                    info!(id, "deleted container");
                    Ok(())
                }
            }
        }

        async fn create_task(&self, id: &str) -> Result<()> {
            let create_failed = |reason: String| Error::TaskCreateFailed {
                id: id.to_string(),
                reason,
            };

            let record = self
                .record(id)?
                .ok_or_else(|| create_failed("container not found".to_string()))?;

            // The init process inherits the launcher's stdio.
            ContainerBuilder::new(id.to_string(), SyscallType::default())
                .with_root_path(&self.state_root)
                .map_err(|e| create_failed(format!("invalid root path: {}", e)))?
                .validate_id()
                .map_err(|e| create_failed(format!("invalid container id: {}", e)))?
                .as_init(&record.bundle)
                .with_systemd(false)
                .build()
                .map_err(|e| create_failed(format!("build failed: {}", e)))?;

            info!(id, "created task");
            Ok(())
        }

        async fn wait_task(&self, id: &str) -> Result<ExitWaiter> {
            self.load_task(id).map_err(|reason| Error::TaskWaitSetupFailed {
                id: id.to_string(),
                reason,
            })?;

            let (tx, rx) = oneshot::channel();
            tokio::spawn(watch_exit(self.state_root.clone(), id.to_string(), tx));
            Ok(rx)
        }

        async fn start_task(&self, id: &str) -> Result<()> {
            let start_failed = |reason: String| Error::TaskStartFailed {
                id: id.to_string(),
                reason,
            };

            let mut task = self.load_task(id).map_err(start_failed)?;
            task.start().map_err(|e| start_failed(e.to_string()))?;

            if let Some(pid) = task.pid() {
                let mut containers = self
                    .containers
                    .write()
                    .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
                if let Some(record) = containers.get_mut(id) {
                    record.init_pid = Some(pid.as_raw());
                    debug!(id, pid = pid.as_raw(), "captured init PID");
                }
            }

            info!(id, "started task");
            Ok(())
        }

        async fn kill_task(&self, id: &str, signal: Signal) -> Result<()> {
            let signal_failed = |reason: String| Error::SignalFailed {
                id: id.to_string(),
                signal: signal.to_string(),
                reason,
            };

            debug!(id, %signal, "sending signal to task");
            let mut task = self.load_task(id).map_err(signal_failed)?;
            let lc_signal = to_libcontainer_signal(signal).map_err(signal_failed)?;
            let result = task
                .kill(lc_signal, KILL_ALL_PROCESSES)
                .map_err(|e| e.to_string());

            if signal_outcome(result, task.state.status).map_err(signal_failed)? {
                info!(id, %signal, "sent signal to task");
            } else {
                debug!(id, %signal, "task already stopped");
            }
            Ok(())
        }

        async fn delete_task(&self, id: &str) -> Result<()> {
            let mut task = self.load_task(id).map_err(|reason| Error::DeleteFailed {
                id: id.to_string(),
                reason,
            })?;
            task.delete(true).map_err(|e| Error::DeleteFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

            // Collect the zombie if the waiter never did.
            if let Some(pid) = self.record(id)?.and_then(|r| r.init_pid) {
                let _ = reap(pid);
            }

            info!(id, "deleted task");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_signal_mapping() {
            for signal in [Signal::Term, Signal::Kill, Signal::Int] {
                assert!(to_libcontainer_signal(signal).is_ok());
            }
        }

        #[test]
        fn test_signals_reach_init_only() {
            assert!(!KILL_ALL_PROCESSES);
        }

        #[test]
        fn test_signal_to_stopped_task_is_not_an_error() {
            assert_eq!(signal_outcome(Ok(()), NativeStatus::Running), Ok(true));
            assert_eq!(
                signal_outcome(Err("incorrect status".to_string()), NativeStatus::Stopped),
                Ok(false)
            );
            assert!(signal_outcome(Err("ESRCH".to_string()), NativeStatus::Running).is_err());
        }

        #[test]
        fn test_keep_first_failure() {
            let mut failure = None;
            keep_first(&mut failure, "admin", "bundle".to_string());
            keep_first(&mut failure, "admin", "snapshot".to_string());
            assert_eq!(failure.as_deref(), Some("bundle"));
        }

        #[tokio::test]
        async fn test_delete_container_removes_snapshot_after_failure() {
            let temp = tempfile::TempDir::new().unwrap();
            let content = temp.path().join("content");
            let client =
                NativeClient::connect(&temp.path().join("run"), &content, "default").unwrap();

            let digest = format!("sha256:{}", "a".repeat(64));
            let store = client.snapshots(DEFAULT_SNAPSHOTTER).unwrap();
            store.commit(&digest, |_| Ok(())).unwrap();
            let snapshot = store.prepare("admin-snapshot", &digest).unwrap();
            let snapshot_dir = snapshot.dir().to_path_buf();

            // A plain file where the bundle directory belongs cannot be
            // removed with remove_dir_all.
            let bundle = temp.path().join("bundle-file");
            std::fs::write(&bundle, b"not a directory").unwrap();

            client.containers.write().unwrap().insert(
                "admin".to_string(),
                ContainerRecord {
                    snapshot,
                    bundle,
                    init_pid: None,
                },
            );

            let err = client.delete_container("admin", true).await.unwrap_err();
            match err {
                Error::DeleteFailed { id, reason } => {
                    assert_eq!(id, "admin");
                    assert!(reason.contains("bundle"), "should report the first failure");
                }
                other => panic!("expected DeleteFailed, got {:?}", other),
            }
            assert!(!snapshot_dir.exists(), "snapshot must not leak");
            assert!(client.record("admin").unwrap().is_none());
            assert!(
                store.prepare("admin-snapshot", &digest).is_ok(),
                "the next run can prepare the same snapshot"
            );
        }

        #[test]
        fn test_connect_rejects_bad_namespace() {
            let temp = tempfile::TempDir::new().unwrap();
            let result = NativeClient::connect(
                &temp.path().join("run"),
                &temp.path().join("content"),
                "../escape",
            );
            assert!(matches!(result, Err(Error::ConnectFailed { .. })));
        }

        #[test]
        fn test_missing_task_fails_to_load() {
            let temp = tempfile::TempDir::new().unwrap();
            assert!(load_task(temp.path(), "admin").is_err());
        }
    }
}

// =============================================================================
// Non-Linux Stub
// =============================================================================

#[cfg(not(target_os = "linux"))]
mod stub {
    use crate::error::{Error, Result};
    use crate::image::Transport;
    use crate::registry::ImageHandle;
    use crate::runtime::{ContainerClient, ExitWaiter, Signal};
    use crate::spec::SpecOptions;
    use async_trait::async_trait;
    use std::path::Path;

    fn unavailable() -> Error {
        Error::RuntimeUnavailable {
            runtime: "native".to_string(),
            reason: "Linux required".to_string(),
        }
    }

    /// Stub client for non-Linux platforms; every operation fails with
    /// [`Error::RuntimeUnavailable`].
    pub struct NativeClient {
        _private: (),
    }

    impl NativeClient {
        /// Always fails: the native runtime requires Linux.
        pub fn connect(_runtime_root: &Path, _content_root: &Path, _namespace: &str) -> Result<Self> {
            Err(unavailable())
        }
    }

    #[async_trait]
    impl ContainerClient for NativeClient {
        fn name(&self) -> &str {
            "native"
        }

        async fn pull(&self, _reference: &str, _transport: &Transport) -> Result<ImageHandle> {
            Err(unavailable())
        }

        async fn unpack(&self, _image: &ImageHandle, _snapshotter: &str) -> Result<()> {
            Err(unavailable())
        }

        async fn create_container(
            &self,
            _id: &str,
            _image: &ImageHandle,
            _snapshot: &str,
            _spec: &SpecOptions,
        ) -> Result<()> {
            Err(unavailable())
        }

        async fn delete_container(&self, _id: &str, _cleanup_snapshot: bool) -> Result<()> {
            Err(unavailable())
        }

        async fn create_task(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }

        async fn wait_task(&self, _id: &str) -> Result<ExitWaiter> {
            Err(unavailable())
        }

        async fn start_task(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }

        async fn kill_task(&self, _id: &str, _signal: Signal) -> Result<()> {
            Err(unavailable())
        }

        async fn delete_task(&self, _id: &str) -> Result<()> {
            Err(unavailable())
        }
    }
}

// =============================================================================
// Re-exports
// =============================================================================

#[cfg(target_os = "linux")]
pub use linux::NativeClient;

#[cfg(not(target_os = "linux"))]
pub use stub::NativeClient;
