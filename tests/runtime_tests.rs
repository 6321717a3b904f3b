//! Tests for the runtime seam types.
//!
//! Validates signals, exit statuses, the task state machine, and the
//! termination request channel.

use host_ctr::runtime::{ExitStatus, Signal};
use host_ctr::signals::TerminationRequests;
use host_ctr::supervisor::{SupervisedTask, TaskState};

// =============================================================================
// Signal Tests
// =============================================================================

#[test]
fn test_signal_display() {
    assert_eq!(Signal::Term.to_string(), "SIGTERM");
    assert_eq!(Signal::Kill.to_string(), "SIGKILL");
    assert_eq!(Signal::Int.to_string(), "SIGINT");
}

#[test]
fn test_signal_numbers() {
    assert_eq!(Signal::Term.as_i32(), 15);
    assert_eq!(Signal::Kill.as_i32(), 9);
    assert_eq!(Signal::Int.as_i32(), 2);
}

// =============================================================================
// ExitStatus Tests
// =============================================================================

#[test]
fn test_exit_status_code() {
    let status = ExitStatus::new(137);
    assert_eq!(status.result("admin").unwrap(), 137);
    assert!(status.exited_at.is_some());
    assert!(status.error.is_none());
}

#[test]
fn test_failed_exit_status() {
    let status = ExitStatus::failed("task vanished");
    let err = status.result("admin").unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains("admin"), "should include container ID");
    assert!(msg.contains("task vanished"), "should include reason");
}

#[test]
fn test_exit_status_json_omits_missing_error() {
    let json = serde_json::to_value(ExitStatus::new(0)).unwrap();
    assert_eq!(json["code"], 0);
    assert!(json.get("error").is_none());
}

// =============================================================================
// Task State Tests
// =============================================================================

#[test]
fn test_task_state_display() {
    assert_eq!(TaskState::Created.to_string(), "created");
    assert_eq!(TaskState::Started.to_string(), "started");
    assert_eq!(TaskState::Exited.to_string(), "exited");
    assert_eq!(TaskState::Killed.to_string(), "killed");
}

#[test]
fn test_task_cannot_skip_start() {
    let mut task = SupervisedTask::new("control");
    assert_eq!(task.state, TaskState::Created);

    assert!(task.transition(TaskState::Exited).is_err());
    assert!(task.transition(TaskState::Killed).is_err());
    assert_eq!(task.state, TaskState::Created, "rejected moves keep state");

    task.transition(TaskState::Started).unwrap();
    assert!(!task.state.is_terminal());
    assert!(task.exit_result().is_err(), "no exit code before exit");
}

// =============================================================================
// Termination Request Tests
// =============================================================================

#[tokio::test]
async fn test_request_held_until_received() {
    let (sender, mut requests) = TerminationRequests::channel();

    assert!(sender.request(Signal::Int));
    assert_eq!(requests.recv().await, Some(Signal::Int));

    // The slot frees once the request is taken.
    assert!(sender.request(Signal::Term));
    assert_eq!(requests.try_recv(), Some(Signal::Term));
}

#[tokio::test]
async fn test_recv_ends_when_senders_gone() {
    let (sender, mut requests) = TerminationRequests::channel();
    drop(sender);
    assert_eq!(requests.recv().await, None);
}

#[test]
fn test_sender_sees_closed_receiver() {
    let (sender, requests) = TerminationRequests::channel();
    drop(requests);

    assert!(sender.is_closed());
    assert!(!sender.request(Signal::Term));
}
