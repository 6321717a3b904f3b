//! Container client trait - the seam between the supervisor and the runtime.
//!
//! The launcher never talks to an OCI runtime directly. Every runtime
//! interaction goes through [`ContainerClient`], which mirrors the object
//! model of a container runtime daemon:
//!
//! - **Images**: pulled through a [`Transport`] and unpacked into a snapshotter
//! - **Containers**: metadata plus a snapshot, created from an image and a
//!   launch spec; no process yet
//! - **Tasks**: the running process of a container, with its own lifecycle
//!
//! # Task Lifecycle
//!
//! ```text
//! create_task(id) → wait_task(id) → start_task(id) → [kill_task(id, sig)] → delete_task(id)
//! ```
//!
//! `wait_task` hands back an [`ExitWaiter`] *before* the task is started so an
//! exit that happens immediately after start is never missed.

use crate::error::{Error, Result};
use crate::image::Transport;
use crate::registry::ImageHandle;
use crate::spec::SpecOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a task, or received from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGINT (interrupt).
    Int,
}

impl Signal {
    /// Returns the signal number.
    #[cfg(unix)]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Int => libc::SIGINT,
        }
    }

    #[cfg(not(unix))]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => 15,
            Self::Kill => 9,
            Self::Int => 2,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Int => write!(f, "SIGINT"),
        }
    }
}

// =============================================================================
// Exit Status
// =============================================================================

/// Exit status reported by the runtime for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatus {
    /// Exit code of the task's init process.
    pub code: u32,
    /// When the runtime observed the exit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    /// Error retrieving the status, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExitStatus {
    /// A successfully observed exit.
    pub fn new(code: u32) -> Self {
        Self {
            code,
            exited_at: Some(Utc::now()),
            error: None,
        }
    }

    /// A status whose retrieval failed.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            code: u32::MAX,
            exited_at: None,
            error: Some(reason.into()),
        }
    }

    /// Returns the exit code, or the retrieval error for task `id`.
    pub fn result(&self, id: &str) -> Result<u32> {
        match &self.error {
            Some(reason) => Err(Error::TaskStatus {
                id: id.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(self.code),
        }
    }
}

/// Receives the task's exit status exactly once.
pub type ExitWaiter = oneshot::Receiver<ExitStatus>;

// =============================================================================
// Container Client Trait
// =============================================================================

/// Client of the container runtime a host container is launched under.
///
/// Implementations are thin pass-throughs to the runtime; they perform no
/// retries. Errors are reported in the categories of [`Error`] matching the
/// operation (e.g. [`Error::TaskStartFailed`] from `start_task`).
///
/// # Implementations
///
/// - `NativeClient`: in-process client built on libcontainer (Linux)
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Returns the client name.
    fn name(&self) -> &str;

    // =========================================================================
    // Images
    // =========================================================================

    /// Pulls `reference` through `transport`.
    async fn pull(&self, reference: &str, transport: &Transport) -> Result<ImageHandle>;

    /// Unpacks a pulled image into `snapshotter`.
    async fn unpack(&self, image: &ImageHandle, snapshotter: &str) -> Result<()>;

    // =========================================================================
    // Containers
    // =========================================================================

    /// Creates container `id` from `image` with a new snapshot named
    /// `snapshot` and the runtime spec composed from `spec`.
    async fn create_container(
        &self,
        id: &str,
        image: &ImageHandle,
        snapshot: &str,
        spec: &SpecOptions,
    ) -> Result<()>;

    /// Deletes container `id`, removing its snapshot when `cleanup_snapshot`.
    async fn delete_container(&self, id: &str, cleanup_snapshot: bool) -> Result<()>;

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Creates the task of container `id` with the launcher's stdio attached.
    async fn create_task(&self, id: &str) -> Result<()>;

    /// Registers interest in the task's exit.
    ///
    /// Must be called before [`start_task`](ContainerClient::start_task).
    async fn wait_task(&self, id: &str) -> Result<ExitWaiter>;

    /// Starts the task.
    async fn start_task(&self, id: &str) -> Result<()>;

    /// Sends `signal` to the task.
    async fn kill_task(&self, id: &str, signal: Signal) -> Result<()>;

    /// Deletes the task.
    async fn delete_task(&self, id: &str) -> Result<()>;
}
