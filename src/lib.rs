//! # host-ctr
//!
//! **Host Container Launcher and Supervisor**
//!
//! Launches exactly one container under a container runtime, supervises it
//! until it exits, and reports its exit code as the process exit code.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             host-ctr                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  --source ──► reference ──► image ──► spec ──► supervisor ──► exit  │
//! │               (ECR ARN     (pull +    (mounts,  (SIGTERM →          │
//! │                rewrite)     unpack)    privs)    20s → SIGKILL)     │
//! │                                                      ▲              │
//! │                             signals (SIGINT/SIGTERM) ┘              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                  ContainerClient Trait                      │    │
//! │  │  pull → unpack → create_container → create_task →           │    │
//! │  │  wait_task → start_task → kill_task → delete_task →         │    │
//! │  │  delete_container                                           │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                         NativeClient (Linux)                        │
//! │  registry (oci-distribution) │ storage (blobs, overlay snapshots)   │
//! │  bundle (layers, config.json) │ libcontainer tasks                  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Exit Codes
//!
//! | Outcome                      | Code                          |
//! |------------------------------|-------------------------------|
//! | Container exited             | container's exit code         |
//! | Malformed arguments          | `2`                           |
//! | Any launcher failure         | `1`                           |
//!
//! # Example
//!
//! ```rust,ignore
//! use host_ctr::{LaunchRequest, NativeClient, SupervisorConfig, TerminationRequests, launch};
//!
//! #[tokio::main]
//! async fn main() -> host_ctr::Result<()> {
//!     let mut requests = TerminationRequests::install()?;
//!     let client = NativeClient::connect(
//!         "/run/host-containerd".as_ref(),
//!         "/var/lib/host-containerd".as_ref(),
//!         "default",
//!     )?;
//!
//!     let request = LaunchRequest {
//!         container_id: "admin".to_string(),
//!         source: "777777777777.dkr.ecr.us-west-2.amazonaws.com/admin:v1".to_string(),
//!         superpowered: true,
//!     };
//!     let task = launch(&client, &request, &mut requests, SupervisorConfig::default()).await?;
//!     println!("{} {:?}", task.state, task.exit_code);
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod image;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod signals;
pub mod spec;
pub mod storage;
pub mod supervisor;

pub mod runtimes;

// Re-exports
pub use config::Args;
pub use error::{Error, Result};
pub use image::{Transport, acquire};
pub use reference::{EcrReference, ImageReference, Partition, resolve};
pub use registry::{ImageConfig, ImageHandle};
pub use runtime::{ContainerClient, ExitStatus, ExitWaiter, Signal};
pub use runtimes::NativeClient;
pub use signals::{TerminationRequests, TerminationSender};
pub use spec::{SpecOpt, SpecOptions};
pub use storage::BlobStore;
pub use supervisor::{
    LaunchRequest, SupervisedTask, Supervisor, SupervisorConfig, TaskState, launch,
};
