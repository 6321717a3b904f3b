//! Error types for the host container launcher.

use crate::constants::{EXIT_FAILURE, EXIT_USAGE};
use std::path::PathBuf;

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while launching or supervising a host container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Argument Errors
    // =========================================================================
    /// Required input missing or malformed.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    // =========================================================================
    // Reference Resolution Errors
    // =========================================================================
    /// Hostname suffix and region imply different partitions.
    #[error("invalid ECR image name '{input}': ambiguous partition")]
    AmbiguousPartition { input: String },

    /// Path does not split into a repository and `name:tag` / `name@digest`.
    #[error("invalid ECR image name '{input}': no specified name and tag or digest")]
    MissingNameAndTag { input: String },

    /// Trailing path segment is neither `name:tag` nor `name@sha256:<hex>`.
    #[error("invalid ECR image name '{input}': malformed name and tag or digest")]
    MalformedNameAndTag { input: String },

    /// Reference is not a canonical ECR resolver reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    // =========================================================================
    // Image Acquisition Errors
    // =========================================================================
    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Registry credentials could not be obtained.
    #[error("failed to get registry credentials for {registry}: {reason}")]
    RegistryAuthFailed { registry: String, reason: String },

    /// Image unpack into the snapshotter failed.
    #[error("failed to unpack image '{reference}': {reason}")]
    UnpackFailed { reference: String, reason: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in a layer.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// The image user does not resolve inside the image.
    #[error("failed to resolve image user '{user}': {reason}")]
    InvalidUser { user: String, reason: String },

    // =========================================================================
    // Container and Task Lifecycle Errors
    // =========================================================================
    /// Could not reach the container runtime.
    #[error("failed to connect to container runtime at {endpoint}: {reason}")]
    ConnectFailed { endpoint: PathBuf, reason: String },

    /// Container object creation failed.
    #[error("failed to create container '{id}': {reason}")]
    ContainerCreateFailed { id: String, reason: String },

    /// Task creation failed.
    #[error("failed to create container task '{id}': {reason}")]
    TaskCreateFailed { id: String, reason: String },

    /// Registering the exit waiter failed.
    #[error("unexpected error during container task setup '{id}': {reason}")]
    TaskWaitSetupFailed { id: String, reason: String },

    /// Task start failed.
    #[error("failed to start container task '{id}': {reason}")]
    TaskStartFailed { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send {signal} to container '{id}': {reason}")]
    SignalFailed {
        id: String,
        signal: String,
        reason: String,
    },

    /// Exit status carried an error.
    #[error("failed to get container task exit status '{id}': {reason}")]
    TaskStatus { id: String, reason: String },

    /// Container or task delete failed.
    #[error("failed to delete '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Runtime not available on this platform.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code this error collapses to.
    ///
    /// Argument errors exit with 2; every other failure exits with 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArguments(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }

    /// Returns true for the reference resolution categories.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Self::AmbiguousPartition { .. }
                | Self::MissingNameAndTag { .. }
                | Self::MalformedNameAndTag { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
