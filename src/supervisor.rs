//! # Task Supervisor
//!
//! Drives one host container from creation to a reported exit code.
//!
//! ## State Machine
//!
//! ```text
//!              create_container
//!                     │
//!                     ▼
//!                ┌─────────┐  create_task, wait_task, start_task
//!                │ Created │──────────────────────────────┐
//!                └─────────┘                              ▼
//!                                                   ┌─────────┐
//!               exit notification ──────────────────│ Started │
//!                     │                             └─────────┘
//!                     │                     termination request
//!                     │                                   │
//!                     │                                SIGTERM
//!                     │                                   │
//!                     │            exit within window ◄───┴───► window expires
//!                     ▼                    │                        │
//!                ┌─────────┐               │                     SIGKILL
//!                │ Exited  │◄──────────────┘                  (bounded deadline)
//!                └─────────┘                                        │
//!                                                                   ▼
//!                                                              ┌─────────┐
//!                                                              │ Killed  │
//!                                                              └─────────┘
//! ```
//!
//! The exit waiter is registered before the task is started, and the exit
//! branch of every race is polled first, so an exit that is already known
//! never triggers a signal.
//!
//! ## Release
//!
//! Whatever happens after the container is created, the task (if created)
//! and then the container with its snapshot are deleted exactly once before
//! [`Supervisor::run`] returns.

use crate::constants::{ESCALATION_WINDOW, KILL_DEADLINE, SNAPSHOT_SUFFIX};
use crate::error::{Error, Result};
use crate::image;
use crate::reference::ImageReference;
use crate::registry::ImageHandle;
use crate::runtime::{ContainerClient, ExitStatus, ExitWaiter, Signal};
use crate::signals::TerminationRequests;
use crate::spec::{self, SpecOptions};
use std::time::Duration;
use tracing::{debug, error, info, warn};

// =============================================================================
// Supervised Task
// =============================================================================

/// Lifecycle state of the supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Container object exists; task not started.
    Created,
    /// Task start succeeded.
    Started,
    /// Task exited on its own or after SIGTERM.
    Exited,
    /// Task exited after SIGKILL.
    Killed,
}

impl TaskState {
    /// Returns true for `Exited` and `Killed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Killed)
    }

    /// Returns true if `next` may follow `self`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Started)
                | (Self::Started, Self::Exited)
                | (Self::Started, Self::Killed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Exited => write!(f, "exited"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Supervision record of the single task of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedTask {
    /// Container and task ID.
    pub id: String,
    /// Current state.
    pub state: TaskState,
    /// Exit code, once terminal.
    pub exit_code: Option<u32>,
    /// Error retrieving the exit status, once terminal.
    pub exit_err: Option<String>,
}

impl SupervisedTask {
    /// A task whose container was just created.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: TaskState::Created,
            exit_code: None,
            exit_err: None,
        }
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "invalid task transition for '{}': {} -> {}",
                self.id, self.state, next
            )));
        }
        debug!(id = %self.id, from = %self.state, to = %next, "task transition");
        self.state = next;
        Ok(())
    }

    /// Records the final status and enters terminal state `terminal`.
    fn finish(&mut self, terminal: TaskState, status: ExitStatus) -> Result<()> {
        self.transition(terminal)?;
        self.exit_code = Some(status.code);
        self.exit_err = status.error;
        Ok(())
    }

    /// Returns the exit code, or the status error recorded on exit.
    pub fn exit_result(&self) -> Result<u32> {
        if let Some(reason) = &self.exit_err {
            return Err(Error::TaskStatus {
                id: self.id.clone(),
                reason: reason.clone(),
            });
        }
        self.exit_code.ok_or_else(|| {
            Error::Internal(format!("task '{}' has not exited ({})", self.id, self.state))
        })
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Timing of the termination escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub escalation_window: Duration,
    /// Bound on the SIGKILL call itself.
    pub kill_deadline: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            escalation_window: ESCALATION_WINDOW,
            kill_deadline: KILL_DEADLINE,
        }
    }
}

/// Runs one container through the task state machine.
pub struct Supervisor<'a> {
    client: &'a dyn ContainerClient,
    config: SupervisorConfig,
}

impl<'a> Supervisor<'a> {
    /// Creates a supervisor with the default timings.
    pub fn new(client: &'a dyn ContainerClient) -> Self {
        Self::with_config(client, SupervisorConfig::default())
    }

    /// Creates a supervisor with explicit timings.
    pub fn with_config(client: &'a dyn ContainerClient, config: SupervisorConfig) -> Self {
        Self { client, config }
    }

    /// Creates container `id` from `image` and supervises its task until it
    /// reaches a terminal state.
    ///
    /// Returns the terminal task record. An exit status carrying an error is
    /// reported as [`Error::TaskStatus`].
    pub async fn run(
        &self,
        id: &str,
        image: &ImageHandle,
        spec: &SpecOptions,
        requests: &mut TerminationRequests,
    ) -> Result<SupervisedTask> {
        let snapshot = format!("{}{}", id, SNAPSHOT_SUFFIX);
        self.client
            .create_container(id, image, &snapshot, spec)
            .await
            .inspect_err(|e| error!(id, error = %e, "failed to create container"))?;
        info!(id, snapshot = %snapshot, "created container");

        let mut task = SupervisedTask::new(id);
        let mut task_created = false;
        let driven = self.drive(&mut task, &mut task_created, requests).await;

        self.release(id, task_created).await;

        driven?;
        task.exit_result()?;
        Ok(task)
    }

    async fn drive(
        &self,
        task: &mut SupervisedTask,
        task_created: &mut bool,
        requests: &mut TerminationRequests,
    ) -> Result<()> {
        let id = task.id.clone();

        self.client
            .create_task(&id)
            .await
            .inspect_err(|e| error!(id, error = %e, "failed to create container task"))?;
        *task_created = true;

        let mut exit = self.client.wait_task(&id).await.inspect_err(
            |e| error!(id, error = %e, "unexpected error during container task setup"),
        )?;

        self.client
            .start_task(&id)
            .await
            .inspect_err(|e| error!(id, error = %e, "failed to start container task"))?;
        task.transition(TaskState::Started)?;
        info!(id, "successfully started container task");

        tokio::select! {
            biased;
            status = &mut exit => {
                let status = received(status);
                info!(id, code = status.code, "container task exited");
                task.finish(TaskState::Exited, status)
            }
            Some(signal) = requests.recv() => {
                info!(id, %signal, "received termination request, stopping container task");
                self.escalate(task, &mut exit).await
            }
        }
    }

    /// SIGTERM, then SIGKILL once the escalation window passes.
    async fn escalate(&self, task: &mut SupervisedTask, exit: &mut ExitWaiter) -> Result<()> {
        let id = task.id.clone();

        self.send(&id, Signal::Term).await?;

        let window = tokio::time::sleep(self.config.escalation_window);
        tokio::pin!(window);

        tokio::select! {
            biased;
            status = &mut *exit => {
                let status = received(status);
                info!(id, code = status.code, "container task exited after SIGTERM");
                task.finish(TaskState::Exited, status)
            }
            () = &mut window => {
                warn!(
                    id,
                    window = ?self.config.escalation_window,
                    "container task did not exit, sending SIGKILL"
                );
                tokio::time::timeout(self.config.kill_deadline, self.send(&id, Signal::Kill))
                    .await
                    .map_err(|_| {
                        error!(id, deadline = ?self.config.kill_deadline, "SIGKILL timed out");
                        Error::Timeout {
                            operation: format!("send SIGKILL to container '{}'", id),
                            duration: self.config.kill_deadline,
                        }
                    })??;

                let status = received(exit.await);
                info!(id, code = status.code, "container task killed");
                task.finish(TaskState::Killed, status)
            }
        }
    }

    async fn send(&self, id: &str, signal: Signal) -> Result<()> {
        self.client
            .kill_task(id, signal)
            .await
            .map_err(|e| match e {
                Error::SignalFailed { .. } => e,
                other => Error::SignalFailed {
                    id: id.to_string(),
                    signal: signal.to_string(),
                    reason: other.to_string(),
                },
            })
            .inspect_err(|e| error!(id, %signal, error = %e, "failed to signal container task"))
    }

    /// Deletes the task (if created), then the container and its snapshot.
    ///
    /// Failures are logged; they never mask the supervision result.
    async fn release(&self, id: &str, task_created: bool) {
        if task_created {
            match self.client.delete_task(id).await {
                Ok(()) => debug!(id, "deleted container task"),
                Err(e) => warn!(id, error = %e, "failed to delete container task"),
            }
        }

        match self.client.delete_container(id, true).await {
            Ok(()) => debug!(id, "deleted container and snapshot"),
            Err(e) => warn!(id, error = %e, "failed to delete container"),
        }
    }
}

/// Flattens a closed exit channel into a status carrying the error.
fn received(status: std::result::Result<ExitStatus, tokio::sync::oneshot::error::RecvError>) -> ExitStatus {
    status.unwrap_or_else(|_| ExitStatus::failed("exit notification channel closed"))
}

// =============================================================================
// Launch
// =============================================================================

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Container identity, also selecting the launch profile.
    pub container_id: String,
    /// Image source as given by the caller.
    pub source: String,
    /// Whether the privilege overlay applies.
    pub superpowered: bool,
}

/// Resolves, acquires, builds and supervises one host container.
///
/// Returns the terminal task record; its exit code is the container's.
pub async fn launch(
    client: &dyn ContainerClient,
    request: &LaunchRequest,
    requests: &mut TerminationRequests,
    config: SupervisorConfig,
) -> Result<SupervisedTask> {
    if request.container_id.is_empty() || request.source.is_empty() {
        return Err(Error::InvalidArguments(
            "container ID and image source are required".to_string(),
        ));
    }

    let reference = ImageReference::resolve(&request.source)
        .inspect_err(|e| error!(source = %request.source, error = %e, "failed to resolve image reference"))?;
    if reference.is_rewritten() {
        info!(source = %reference.raw, reference = %reference.resolved, "resolved ECR image reference");
    }

    let image = image::acquire(client, &reference.resolved).await?;
    let spec = spec::build(&request.container_id, request.superpowered);

    Supervisor::with_config(client, config)
        .run(&request.container_id, &image, &spec, requests)
        .await
}
