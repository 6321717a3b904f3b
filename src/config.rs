//! Command-line and environment configuration.
//!
//! | Flag / variable          | Default                    | Purpose                   |
//! |--------------------------|----------------------------|---------------------------|
//! | `--ctr-id`               | required                   | container ID and profile  |
//! | `--source`               | required                   | image source              |
//! | `--superpowered`         | false                      | privilege overlay         |
//! | `CONTAINERD_NAMESPACE`   | `default`                  | runtime namespace         |
//! | `HOST_CTR_RUNTIME_ROOT`  | `/run/host-containerd`     | runtime endpoint / state  |
//! | `HOST_CTR_CONTENT_ROOT`  | `/var/lib/host-containerd` | content store             |

use crate::constants::{
    CONTENT_ROOT_ENV, DEFAULT_CONTENT_ROOT, DEFAULT_NAMESPACE, DEFAULT_RUNTIME_ROOT,
    NAMESPACE_ENV, RUNTIME_ROOT_ENV,
};
use crate::supervisor::LaunchRequest;
use clap::Parser;
use std::path::PathBuf;

/// Launches and supervises a single host container
#[derive(Debug, Clone, Parser)]
#[command(name = "host-ctr", version, about)]
pub struct Args {
    /// The ID of the container to be started
    #[arg(long = "ctr-id", value_name = "ID")]
    pub container_id: String,

    /// The image to be pulled
    #[arg(long, value_name = "REF")]
    pub source: String,

    /// Specifies whether to launch the container in `superpowered` mode or not
    #[arg(long)]
    pub superpowered: bool,

    /// Runtime namespace the container is created in
    #[arg(long, env = NAMESPACE_ENV, default_value = DEFAULT_NAMESPACE, hide = true)]
    pub namespace: String,

    /// Runtime root holding task and bundle state
    #[arg(long, env = RUNTIME_ROOT_ENV, default_value = DEFAULT_RUNTIME_ROOT, hide = true)]
    pub runtime_root: PathBuf,

    /// Content root holding blobs and snapshots
    #[arg(long, env = CONTENT_ROOT_ENV, default_value = DEFAULT_CONTENT_ROOT, hide = true)]
    pub content_root: PathBuf,
}

impl Args {
    /// What the supervisor should launch.
    pub fn launch_request(&self) -> LaunchRequest {
        LaunchRequest {
            container_id: self.container_id.clone(),
            source: self.source.clone(),
            superpowered: self.superpowered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_parse_required_flags() {
        let args = Args::try_parse_from([
            "host-ctr",
            "--ctr-id",
            "admin",
            "--source",
            "public.ecr.aws/bottlerocket/admin:v1",
            "--superpowered",
        ])
        .unwrap();

        let request = args.launch_request();
        assert_eq!(request.container_id, "admin");
        assert_eq!(request.source, "public.ecr.aws/bottlerocket/admin:v1");
        assert!(request.superpowered);
    }

    #[test]
    fn test_superpowered_defaults_false() {
        let args =
            Args::try_parse_from(["host-ctr", "--ctr-id", "control", "--source", "x:1"]).unwrap();
        assert!(!args.superpowered);
    }

    #[test]
    fn test_missing_required_flag_is_usage_error() {
        let err = Args::try_parse_from(["host-ctr", "--ctr-id", "control"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);
    }
}
