//! Tests for image acquisition.
//!
//! Tests transport selection, pull targets, reference validation, image
//! config parsing, and the pull-then-unpack sequence against a recording
//! client.

use async_trait::async_trait;
use host_ctr::error::{Error, Result};
use host_ctr::image::{Transport, acquire};
use host_ctr::reference::EcrReference;
use host_ctr::registry::{
    ImageConfig, ImageHandle, PullTarget, decode_authorization_token, host_platform,
    validate_image_ref,
};
use host_ctr::runtime::{ContainerClient, ExitWaiter, Signal};
use oci_distribution::secrets::RegistryAuth;
use host_ctr::spec::SpecOptions;
use std::sync::Mutex;

// =============================================================================
// Transport Tests
// =============================================================================

#[test]
fn test_transport_for_canonical_ecr_reference() {
    let transport = Transport::for_reference(
        "ecr.aws/arn:aws:ecr:us-west-2:777777777777:repository/my_image:latest",
    );
    assert_eq!(transport, Transport::Ecr);
    assert_eq!(transport.to_string(), "ecr");
}

#[test]
fn test_transport_default_otherwise() {
    for reference in [
        "docker.io/library/alpine:3",
        "public.ecr.aws/bottlerocket/bottlerocket-admin:v0.11.0",
        "777777777777.dkr.ecr.us-west-2.amazonaws.com/my_image:latest",
    ] {
        assert_eq!(Transport::for_reference(reference), Transport::Default);
    }
}

#[test]
fn test_ecr_target_uses_regional_registry() {
    let ecr = EcrReference::parse(
        "ecr.aws/arn:aws-us-gov:ecr:us-gov-west-1:777777777777:repository/tool:2",
    )
    .unwrap();
    let target = PullTarget::for_ecr(&ecr, RegistryAuth::Anonymous);
    assert_eq!(
        target.reference,
        "777777777777.dkr.ecr.us-gov-west-1.amazonaws.com/tool:2"
    );
}

#[tokio::test]
async fn test_ecr_target_rejects_plain_reference() {
    let err = Transport::Ecr
        .target("docker.io/library/alpine:3")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidImageReference { .. }));
}

// =============================================================================
// ECR Credential Tests
// =============================================================================

#[test]
fn test_authorization_token_becomes_basic_auth() {
    // Tokens are base64("AWS:<password>").
    let auth = decode_authorization_token(
        "777777777777.dkr.ecr.us-west-2.amazonaws.com",
        "QVdTOmV5SndZWGxzYjJGa0lqb2lJbjA9",
    )
    .unwrap();

    match auth {
        RegistryAuth::Basic(user, password) => {
            assert_eq!(user, "AWS");
            assert_eq!(password, "eyJwYXlsb2FkIjoiIn0=", "password keeps its padding");
        }
        _ => panic!("expected basic auth"),
    }
}

#[test]
fn test_malformed_authorization_token() {
    let registry = "777777777777.dkr.ecr.us-west-2.amazonaws.com";
    for token in ["not base64!", "QVdT", "OnBhc3N3b3Jk"] {
        let err = decode_authorization_token(registry, token).unwrap_err();
        match err {
            Error::RegistryAuthFailed { registry: r, .. } => assert_eq!(r, registry),
            other => panic!("expected RegistryAuthFailed for {:?}, got {:?}", token, other),
        }
    }
}

#[test]
fn test_anonymous_target() {
    let target = PullTarget::anonymous("docker.io/library/alpine:3");
    assert_eq!(target.reference, "docker.io/library/alpine:3");
    assert!(matches!(target.auth, RegistryAuth::Anonymous));
}

// =============================================================================
// Validation and Config Tests
// =============================================================================

#[test]
fn test_validate_image_ref() {
    assert!(validate_image_ref("docker.io/library/alpine:3").is_ok());
    assert!(
        validate_image_ref("ecr.aws/arn:aws:ecr:us-west-2:777777777777:repository/x:1").is_ok()
    );

    assert!(validate_image_ref("").is_err(), "empty ref");
    assert!(validate_image_ref("alpine; rm -rf /").is_err(), "shell chars");
    assert!(validate_image_ref(&"a".repeat(1024)).is_err(), "too long");
}

#[test]
fn test_image_config_from_blob() {
    let blob = br#"{
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/bin", "LANG=C"],
            "Entrypoint": ["/entry"],
            "Cmd": ["serve"],
            "WorkingDir": "/srv",
            "User": "1000"
        },
        "rootfs": {"type": "layers", "diff_ids": []}
    }"#;

    let config = ImageConfig::from_blob(blob).unwrap();
    assert_eq!(config.env, vec!["PATH=/usr/bin", "LANG=C"]);
    assert_eq!(config.entrypoint, Some(vec!["/entry".to_string()]));
    assert_eq!(config.cmd, Some(vec!["serve".to_string()]));
    assert_eq!(config.working_dir.as_deref(), Some("/srv"));
    assert_eq!(config.user.as_deref(), Some("1000"));
}

#[test]
fn test_image_config_without_config_section() {
    let config = ImageConfig::from_blob(br#"{"os": "linux"}"#).unwrap();
    assert_eq!(config, ImageConfig::default());

    assert!(matches!(
        ImageConfig::from_blob(b"not json"),
        Err(Error::Serialization(_))
    ));
}

#[test]
fn test_host_platform_is_linux() {
    let (os, arch) = host_platform();
    assert_eq!(os, "linux");
    assert!(!arch.is_empty());
    assert_ne!(arch, "x86_64", "should use OCI architecture names");
}

// =============================================================================
// Acquisition Tests
// =============================================================================

#[derive(Default)]
struct RecordingClient {
    fail_unpack: bool,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerClient for RecordingClient {
    fn name(&self) -> &str {
        "recording"
    }

    async fn pull(&self, reference: &str, transport: &Transport) -> Result<ImageHandle> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("pull {} via {}", reference, transport));
        Ok(ImageHandle {
            reference: reference.to_string(),
            digest: "sha256:cccc".to_string(),
            platform: "linux/amd64".to_string(),
            layers: Vec::new(),
            config_digest: "sha256:dddd".to_string(),
            config: ImageConfig::default(),
        })
    }

    async fn unpack(&self, image: &ImageHandle, snapshotter: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("unpack {} into {}", image.digest, snapshotter));
        if self.fail_unpack {
            return Err(Error::StorageWriteFailed("disk full".to_string()));
        }
        Ok(())
    }

    async fn create_container(
        &self,
        _id: &str,
        _image: &ImageHandle,
        _snapshot: &str,
        _spec: &SpecOptions,
    ) -> Result<()> {
        unreachable!("acquisition never creates containers")
    }

    async fn delete_container(&self, _id: &str, _cleanup_snapshot: bool) -> Result<()> {
        unreachable!()
    }

    async fn create_task(&self, _id: &str) -> Result<()> {
        unreachable!()
    }

    async fn wait_task(&self, _id: &str) -> Result<ExitWaiter> {
        unreachable!()
    }

    async fn start_task(&self, _id: &str) -> Result<()> {
        unreachable!()
    }

    async fn kill_task(&self, _id: &str, _signal: Signal) -> Result<()> {
        unreachable!()
    }

    async fn delete_task(&self, _id: &str) -> Result<()> {
        unreachable!()
    }
}

#[tokio::test]
async fn test_acquire_pulls_then_unpacks() {
    let client = RecordingClient::default();
    let reference = "ecr.aws/arn:aws:ecr:us-west-2:777777777777:repository/my_image:latest";

    let image = acquire(&client, reference).await.unwrap();

    assert_eq!(image.reference, reference);
    assert_eq!(
        *client.calls.lock().unwrap(),
        vec![
            format!("pull {} via ecr", reference),
            "unpack sha256:cccc into overlayfs".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_acquire_wraps_unpack_failure() {
    let client = RecordingClient {
        fail_unpack: true,
        ..Default::default()
    };

    let err = acquire(&client, "docker.io/library/alpine:3")
        .await
        .unwrap_err();

    match err {
        Error::UnpackFailed { reference, reason } => {
            assert_eq!(reference, "docker.io/library/alpine:3");
            assert!(reason.contains("disk full"), "should keep the cause");
        }
        other => panic!("expected UnpackFailed, got {:?}", other),
    }
}
