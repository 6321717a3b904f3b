//! # Host Container Constants
//!
//! Paths, timeouts, launch-profile mount points and reference-scheme
//! identifiers used by the launcher. These constants are the **single
//! source of truth** for the fixed touchpoints between `host-ctr` and the
//! container runtime it drives.
//!
//! ## Modification Guidelines
//!
//! Before modifying any constant:
//! 1. Check which launch profile or supervisor phase depends on it
//! 2. Update dependent tests (`tests/constants_tests.rs`)
//! 3. Remember that orchestrators re-launching `host-ctr` rely on the
//!    termination timings below when sizing their own stop timeouts
//!
//! ## Cross-References
//!
//! - [`crate::reference`]: Uses the ECR scheme prefix and partition names
//! - [`crate::image`]: Uses the snapshotter name and transport prefix
//! - [`crate::spec`]: Uses the cgroup path and profile mount points
//! - [`crate::supervisor`]: Uses the escalation timings

use std::time::Duration;

// =============================================================================
// Runtime Endpoints
// =============================================================================
//
// Host containers are launched through a dedicated runtime instance, not the
// one serving orchestrated workloads. The endpoint doubles as the state root
// for the native client.
// =============================================================================

/// Default runtime endpoint (state root of the host-container runtime).
pub const DEFAULT_RUNTIME_ROOT: &str = "/run/host-containerd";

/// Default content store location (blobs and unpacked snapshots).
pub const DEFAULT_CONTENT_ROOT: &str = "/var/lib/host-containerd";

/// Environment variable overriding [`DEFAULT_RUNTIME_ROOT`].
pub const RUNTIME_ROOT_ENV: &str = "HOST_CTR_RUNTIME_ROOT";

/// Environment variable overriding [`DEFAULT_CONTENT_ROOT`].
pub const CONTENT_ROOT_ENV: &str = "HOST_CTR_CONTENT_ROOT";

/// Environment variable selecting the runtime namespace.
pub const NAMESPACE_ENV: &str = "CONTAINERD_NAMESPACE";

/// Namespace used when [`NAMESPACE_ENV`] is unset.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Name of the default snapshotter images are unpacked into.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Suffix appended to the container ID to name its snapshot.
pub const SNAPSHOT_SUFFIX: &str = "-snapshot";

/// Subdirectory of the content root for blobs.
///
/// Structure: `blobs/sha256/<2-char-prefix>/<full-hash>`
pub const BLOB_STORE_DIR: &str = "blobs";

/// Subdirectory of the content root for unpacked snapshots.
///
/// Structure: `snapshots/<snapshotter>/<snapshot-name>/rootfs/`
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Subdirectory of the runtime root for container bundles.
///
/// Structure: `bundles/<namespace>/<container-id>/config.json`
pub const BUNDLE_DIR: &str = "bundles";

/// Subdirectory of the runtime root for runtime container state.
pub const CONTAINER_STATE_DIR: &str = "containers";

// =============================================================================
// Termination Timings
// =============================================================================

/// Escalation window between SIGTERM and SIGKILL (20 seconds).
///
/// A host container that has not exited this long after SIGTERM is
/// force-stopped.
pub const ESCALATION_WINDOW: Duration = Duration::from_secs(20);

/// Deadline for delivering SIGKILL to the task (45 seconds).
///
/// Bounds the forced-stop call itself so an unresponsive runtime cannot
/// block the launcher forever.
pub const KILL_DEADLINE: Duration = Duration::from_secs(45);

/// Interval at which the native client polls runtime state for task exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for image pull operations (5 minutes).
///
/// Covers manifest fetch and each individual blob download.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for obtaining an ECR authorization token, including credential
/// discovery.
pub const ECR_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Image References
// =============================================================================

/// Scheme prefix of references resolved through the ECR transport.
///
/// Example: `ecr.aws/arn:aws:ecr:us-west-2:777777777777:repository/my_image:latest`
pub const ECR_REFERENCE_PREFIX: &str = "ecr.aws/";

/// Service identifier embedded in ECR resource names.
pub const ECR_SERVICE: &str = "ecr";

/// Default AWS partition.
pub const PARTITION_AWS: &str = "aws";

/// Partition of the China regions (`.amazonaws.com.cn` endpoints).
pub const PARTITION_AWS_CN: &str = "aws-cn";

/// Partition of the GovCloud regions.
pub const PARTITION_AWS_US_GOV: &str = "aws-us-gov";

/// Regions that belong to [`PARTITION_AWS_US_GOV`].
pub const GOV_CLOUD_REGIONS: [&str; 2] = ["us-gov-west-1", "us-gov-east-1"];

/// Registry user for ECR basic auth.
pub const ECR_REGISTRY_USER: &str = "AWS";

/// Environment variable holding an ECR login password
/// (`aws ecr get-login-password`). When set it is used instead of a token
/// from the AWS credential chain.
pub const ECR_PASSWORD_ENV: &str = "ECR_LOGIN_PASSWORD";

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum number of layers in an image.
pub const MAX_LAYERS: usize = 128;

/// Maximum size of a single compressed layer (512 MiB).
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (4 GiB).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

// =============================================================================
// Launch Profiles
// =============================================================================

/// Container ID of the control host container.
pub const CONTROL_CONTAINER: &str = "control";

/// Container ID of the admin host container.
pub const ADMIN_CONTAINER: &str = "admin";

/// API socket exposed to the control container.
pub const API_SOCKET_PATH: &str = "/run/api.sock";

/// Device tree exposed to the admin container.
pub const HOST_DEV_PATH: &str = "/dev";

/// Log directory exposed to the admin container.
pub const HOST_LOG_PATH: &str = "/var/log";

/// Host file shared for name resolution.
pub const HOST_HOSTS_FILE: &str = "/etc/hosts";

/// Host resolver configuration.
pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Cgroup all host containers are placed under.
pub const HOST_CONTAINERS_CGROUP: &str = "/runtime.slice/host-containers";

// =============================================================================
// OCI
// =============================================================================

/// OCI Runtime Spec version for generated `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// PATH used when the image config does not set one.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Process Exit Codes
// =============================================================================

/// Exit code for malformed arguments.
pub const EXIT_USAGE: u8 = 2;

/// Exit code for any internal or supervisory failure.
pub const EXIT_FAILURE: u8 = 1;

// =============================================================================
// Validation
// =============================================================================

/// Valid characters for container IDs.
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal when container IDs are used in filesystem paths.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container ID length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container ID before it is used in runtime state paths.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
