//! # Image Acquirer
//!
//! Makes a host container image available in the runtime's content store
//! and unpacked into the default snapshotter.
//!
//! ```text
//! resolved reference
//!        │
//!        ▼
//! Transport::for_reference ──► "ecr.aws/..." → Ecr, anything else → Default
//!        │
//!        ▼
//! client.pull(reference, transport) ──► client.unpack(image, "overlayfs")
//!        │
//!        ▼
//!   ImageHandle
//! ```
//!
//! Pull and unpack failures are reported as [`Error::ImagePullFailed`] and
//! [`Error::UnpackFailed`]; nothing is retried.

use crate::constants::{DEFAULT_SNAPSHOTTER, ECR_REFERENCE_PREFIX};
use crate::error::{Error, Result};
use crate::registry::{ImageHandle, PullTarget};
use crate::runtime::ContainerClient;
use std::fmt;
use tracing::{error, info};

/// How an image reference is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The runtime's default resolver.
    Default,
    /// The ECR resolver, for canonical `ecr.aws/` references.
    Ecr,
}

impl Transport {
    /// Selects the transport for a resolved reference.
    pub fn for_reference(reference: &str) -> Self {
        if reference.starts_with(ECR_REFERENCE_PREFIX) {
            Self::Ecr
        } else {
            Self::Default
        }
    }

    /// Registry endpoint and credentials for `reference` under this transport.
    pub async fn target(&self, reference: &str) -> Result<PullTarget> {
        match self {
            Self::Default => Ok(PullTarget::anonymous(reference)),
            Self::Ecr => PullTarget::ecr(reference).await,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Ecr => f.write_str("ecr"),
        }
    }
}

/// Pulls and unpacks `reference` through `client`.
pub async fn acquire(client: &dyn ContainerClient, reference: &str) -> Result<ImageHandle> {
    let transport = Transport::for_reference(reference);
    info!(reference, %transport, "pulling image");

    let image = client
        .pull(reference, &transport)
        .await
        .map_err(|e| pull_failed(reference, e))?;

    info!(reference, digest = %image.digest, "pulled image");

    client
        .unpack(&image, DEFAULT_SNAPSHOTTER)
        .await
        .map_err(|e| unpack_failed(reference, e))?;

    info!(reference, snapshotter = DEFAULT_SNAPSHOTTER, "unpacked image");
    Ok(image)
}

fn pull_failed(reference: &str, e: Error) -> Error {
    error!(reference, error = %e, "failed to pull image");
    match e {
        Error::ImagePullFailed { .. } => e,
        other => Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: other.to_string(),
        },
    }
}

fn unpack_failed(reference: &str, e: Error) -> Error {
    error!(reference, error = %e, "failed to unpack image");
    match e {
        Error::UnpackFailed { .. } => e,
        other => Error::UnpackFailed {
            reference: reference.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_selection() {
        assert_eq!(
            Transport::for_reference(
                "ecr.aws/arn:aws:ecr:us-west-2:777777777777:repository/my_image:latest"
            ),
            Transport::Ecr
        );
        assert_eq!(
            Transport::for_reference("docker.io/library/alpine:3"),
            Transport::Default
        );
        assert_eq!(
            Transport::for_reference("public.ecr.aws/bottlerocket/admin:v1"),
            Transport::Default
        );
    }

    #[tokio::test]
    async fn test_default_target_is_reference() {
        let target = Transport::Default
            .target("docker.io/library/alpine:3")
            .await
            .unwrap();
        assert_eq!(target.reference, "docker.io/library/alpine:3");
    }
}
