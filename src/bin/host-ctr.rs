//! host-ctr: launches one host container and supervises it until exit.
//!
//! ```text
//! host-ctr --ctr-id admin --source <image> [--superpowered]
//! ```
//!
//! Exits with the container's own exit code, `2` on malformed arguments,
//! and `1` on any launcher failure.

use clap::Parser;
use host_ctr::constants::EXIT_FAILURE;
use host_ctr::{Args, NativeClient, SupervisorConfig, TerminationRequests, launch};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = e.exit_code();
            let _ = e.print();
            return ExitCode::from(code as u8);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        id = %args.container_id,
        source = %args.source,
        superpowered = args.superpowered,
        "host-ctr starting"
    );

    // Installed first so a request during the pull is not lost.
    let mut requests = match TerminationRequests::install() {
        Ok(requests) => requests,
        Err(e) => {
            error!(error = %e, "failed to install signal handlers");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let client = match NativeClient::connect(&args.runtime_root, &args.content_root, &args.namespace)
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to connect to container runtime");
            return ExitCode::from(e.exit_code());
        }
    };

    let request = args.launch_request();
    match launch(&client, &request, &mut requests, SupervisorConfig::default()).await {
        Ok(task) => {
            let code = task.exit_code.unwrap_or_default();
            info!(id = %task.id, state = %task.state, code, "container task finished");
            // The OS keeps the low 8 bits.
            ExitCode::from((code & 0xff) as u8)
        }
        Err(e) => {
            error!(id = %request.container_id, error = %e, "host container failed");
            ExitCode::from(e.exit_code())
        }
    }
}
