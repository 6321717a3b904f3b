//! # OCI Registry Client for Image Pulling
//!
//! Pulls host container images into the [`BlobStore`]: the manifest is
//! resolved (picking the host platform out of an image index), every layer
//! and the image config are downloaded and verified, and the config is
//! parsed into the [`ImageConfig`] the launch spec takes its process
//! defaults from.
//!
//! ## Pull Targets
//!
//! The reference recorded on the [`ImageHandle`] is always the one the
//! caller asked for. What is actually contacted is a [`PullTarget`]:
//!
//! | Transport | Target reference                        | Auth                               |
//! |-----------|-----------------------------------------|------------------------------------|
//! | default   | the reference itself                    | anonymous                          |
//! | ECR       | `<acct>.dkr.ecr.<region>.<dns>/<name>`  | ECR token, or `ECR_LOGIN_PASSWORD` |
//!
//! ECR tokens come from `GetAuthorizationToken` in the reference's region,
//! signed with the default AWS credential chain (environment, profile,
//! instance role).
//!
//! ## Limits
//!
//! - Reference length bounded by `MAX_IMAGE_REF_LEN`
//! - Layer count bounded by `MAX_LAYERS`, layer size by `MAX_LAYER_SIZE`
//! - Every network operation bounded by `IMAGE_PULL_TIMEOUT`
//!
//! Docker schema 1 manifests are not supported by the distribution client
//! and fail the pull.

use crate::constants::{
    ECR_AUTH_TIMEOUT, ECR_PASSWORD_ENV, ECR_REGISTRY_USER, IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN,
    MAX_LAYER_SIZE, MAX_LAYERS,
};
use crate::error::{Error, Result};
use crate::reference::EcrReference;
use crate::storage::BlobStore;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecr::error::DisplayErrorContext;
use base64::Engine;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Handle to a pulled image.
///
/// `layers` is ordered bottom to top. All digests reference blobs in the
/// [`BlobStore`] the image was pulled into.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Reference as requested (canonical ECR form for ECR images).
    pub reference: String,
    /// Manifest digest.
    pub digest: String,
    /// Platform this image is for, e.g. `linux/amd64`.
    pub platform: String,
    /// Layer digests in order.
    pub layers: Vec<LayerInfo>,
    /// Config blob digest.
    pub config_digest: String,
    /// Process defaults from the image config.
    pub config: ImageConfig,
}

/// Metadata about an OCI image layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Layer digest.
    pub digest: String,
    /// Layer size in bytes.
    pub size: u64,
    /// Media type.
    pub media_type: String,
}

// =============================================================================
// Image Config
// =============================================================================

/// Runtime defaults carried in an image's config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Deserialize)]
struct ImageConfigFile {
    #[serde(default)]
    config: Option<ImageConfig>,
}

impl ImageConfig {
    /// Parses the `config` section of an OCI image config blob.
    ///
    /// A blob without a `config` section yields the empty config.
    pub fn from_blob(data: &[u8]) -> Result<Self> {
        let file: ImageConfigFile = serde_json::from_slice(data)?;
        Ok(file.config.unwrap_or_default())
    }
}

// =============================================================================
// Pull Target
// =============================================================================

/// Registry endpoint and credentials a pull is served from.
pub struct PullTarget {
    /// Distribution reference contacted.
    pub reference: String,
    /// Credentials presented to the registry.
    pub auth: RegistryAuth,
}

impl PullTarget {
    /// Pulls `reference` anonymously as written.
    pub fn anonymous(reference: &str) -> Self {
        Self {
            reference: reference.to_string(),
            auth: RegistryAuth::Anonymous,
        }
    }

    /// Pulls a canonical `ecr.aws/arn:...` reference from its regional
    /// registry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidImageReference`]: not a canonical ECR reference
    /// - [`Error::RegistryAuthFailed`]: no authorization token could be
    ///   obtained
    /// - [`Error::Timeout`]: the token request exceeded `ECR_AUTH_TIMEOUT`
    pub async fn ecr(reference: &str) -> Result<Self> {
        let ecr = EcrReference::parse(reference)?;
        let auth = ecr_auth(&ecr).await?;
        Ok(Self::for_ecr(&ecr, auth))
    }

    /// Pulls `ecr` from its regional registry with `auth`.
    pub fn for_ecr(ecr: &EcrReference, auth: RegistryAuth) -> Self {
        Self {
            reference: ecr.distribution_reference(),
            auth,
        }
    }
}

/// Credentials for the registry serving `ecr`.
///
/// `ECR_LOGIN_PASSWORD` wins when set; otherwise an authorization token is
/// requested in the reference's region.
async fn ecr_auth(ecr: &EcrReference) -> Result<RegistryAuth> {
    if let Ok(password) = std::env::var(ECR_PASSWORD_ENV)
        && !password.is_empty()
    {
        debug!(registry = %ecr.registry_host(), "using ECR password from environment");
        return Ok(RegistryAuth::Basic(ECR_REGISTRY_USER.to_string(), password));
    }

    let registry = ecr.registry_host();
    let auth_failed = |reason: String| Error::RegistryAuthFailed {
        registry: registry.clone(),
        reason,
    };

    let output = tokio::time::timeout(ECR_AUTH_TIMEOUT, async {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(ecr.region.clone()))
            .load()
            .await;
        aws_sdk_ecr::Client::new(&config)
            .get_authorization_token()
            .send()
            .await
    })
    .await
    .map_err(|_| Error::Timeout {
        operation: format!("get ECR authorization token for {}", registry),
        duration: ECR_AUTH_TIMEOUT,
    })?
    .map_err(|e| auth_failed(DisplayErrorContext(&e).to_string()))?;

    let token = output
        .authorization_data()
        .first()
        .and_then(|data| data.authorization_token())
        .ok_or_else(|| auth_failed("no authorization data returned".to_string()))?;

    debug!(registry = %registry, "obtained ECR authorization token");
    decode_authorization_token(&registry, token)
}

/// Decodes an ECR authorization token (base64 of `user:password`) into
/// basic auth for `registry`.
pub fn decode_authorization_token(registry: &str, token: &str) -> Result<RegistryAuth> {
    let auth_failed = |reason: &str| Error::RegistryAuthFailed {
        registry: registry.to_string(),
        reason: reason.to_string(),
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(|_| auth_failed("authorization token is not base64"))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| auth_failed("authorization token is not UTF-8"))?;

    match decoded.split_once(':') {
        Some((user, password)) if !user.is_empty() && !password.is_empty() => {
            Ok(RegistryAuth::Basic(user.to_string(), password.to_string()))
        }
        _ => Err(auth_failed("authorization token is not user:password")),
    }
}

// =============================================================================
// Pulling
// =============================================================================

/// Validates an image reference before it reaches the registry client.
pub fn validate_image_ref(image_ref: &str) -> Result<()> {
    if image_ref.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "empty image reference".to_string(),
        });
    }

    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: image_ref.chars().take(50).collect::<String>() + "...",
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }

    if !image_ref
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }

    Ok(())
}

/// Pulls `image_ref` from `target` into `storage`.
///
/// Already-stored layers are not downloaded again.
///
/// # Errors
///
/// - [`Error::InvalidImageReference`]: malformed or overly long reference
/// - [`Error::ImagePullFailed`]: registry unreachable, image not found, or
///   unsupported manifest
/// - [`Error::ImageTooLarge`]: layer exceeds size limit
/// - [`Error::Timeout`]: operation exceeded `IMAGE_PULL_TIMEOUT`
pub async fn pull_image(
    image_ref: &str,
    target: &PullTarget,
    storage: &BlobStore,
) -> Result<ImageHandle> {
    validate_image_ref(image_ref)?;
    validate_image_ref(&target.reference)?;

    info!(reference = image_ref, "pulling image");

    let reference: Reference =
        target
            .reference
            .parse()
            .map_err(|e| Error::InvalidImageReference {
                reference: target.reference.clone(),
                reason: format!("{}", e),
            })?;

    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });

    let (manifest, digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_manifest(&reference, &target.auth).await
    })
    .await
    .map_err(|_| Error::Timeout {
        operation: format!("pull manifest for {}", image_ref),
        duration: IMAGE_PULL_TIMEOUT,
    })?
    .map_err(|e| Error::ImagePullFailed {
        reference: image_ref.to_string(),
        reason: e.to_string(),
    })?;

    let (os, arch) = host_platform();
    let (layers, config_desc) =
        resolve_manifest(&client, &reference, &target.auth, manifest, os, arch).await?;

    if layers.len() > MAX_LAYERS {
        return Err(Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: format!("too many layers: {} > {}", layers.len(), MAX_LAYERS),
        });
    }

    for layer in &layers {
        if storage.has_blob(&layer.digest) {
            debug!(digest = %layer.digest, "layer already cached");
            continue;
        }

        debug!(digest = %layer.digest, size = layer.size, "pulling layer");

        if layer.size > MAX_LAYER_SIZE as u64 {
            return Err(Error::ImageTooLarge {
                size: layer.size,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        let desc = OciDescriptor {
            digest: layer.digest.clone(),
            size: layer.size as i64,
            media_type: layer.media_type.clone(),
            urls: None,
            annotations: None,
        };
        let data = pull_blob(&client, &reference, &desc).await?;
        storage.put_blob(&layer.digest, &data)?;
    }

    let config_blob = if storage.has_blob(&config_desc.digest) {
        storage.get_blob(&config_desc.digest)?
    } else {
        let data = pull_blob(&client, &reference, &config_desc).await?;
        storage.put_blob(&config_desc.digest, &data)?;
        data
    };
    let config = ImageConfig::from_blob(&config_blob).map_err(|e| Error::ImagePullFailed {
        reference: image_ref.to_string(),
        reason: format!("invalid image config: {}", e),
    })?;

    info!(
        reference = image_ref,
        layers = layers.len(),
        digest = %digest,
        "pulled image"
    );

    Ok(ImageHandle {
        reference: image_ref.to_string(),
        digest,
        platform: format!("{}/{}", os, arch),
        layers,
        config_digest: config_desc.digest,
        config,
    })
}

async fn pull_blob(client: &Client, reference: &Reference, desc: &OciDescriptor) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_blob(reference, desc, &mut data).await
    })
    .await
    .map_err(|_| Error::Timeout {
        operation: format!("pull blob {}", desc.digest),
        duration: IMAGE_PULL_TIMEOUT,
    })?
    .map_err(|e| Error::LayerExtractionFailed {
        digest: desc.digest.clone(),
        reason: e.to_string(),
    })?;
    Ok(data)
}

/// OCI `(os, architecture)` of the host.
pub fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    };
    ("linux", arch)
}

fn layers_of(descriptors: Vec<OciDescriptor>) -> Vec<LayerInfo> {
    descriptors
        .into_iter()
        .map(|l| LayerInfo {
            digest: l.digest,
            size: l.size as u64,
            media_type: l.media_type,
        })
        .collect()
}

/// Resolves a manifest (handling multi-arch index).
async fn resolve_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    manifest: OciManifest,
    os: &str,
    arch: &str,
) -> Result<(Vec<LayerInfo>, OciDescriptor)> {
    let index = match manifest {
        OciManifest::Image(img) => return Ok((layers_of(img.layers), img.config)),
        OciManifest::ImageIndex(index) => index,
    };

    let manifest_desc = index
        .manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == arch)
        })
        .ok_or_else(|| {
            let available: Vec<String> = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();

            Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: format!(
                    "no manifest for {}/{}. Available: {}",
                    os,
                    arch,
                    available.join(", ")
                ),
            }
        })?;

    let platform_ref: Reference = format!(
        "{}/{}@{}",
        reference.registry(),
        reference.repository(),
        manifest_desc.digest
    )
    .parse()
    .map_err(|e| Error::ImagePullFailed {
        reference: reference.to_string(),
        reason: format!("failed to build digest reference: {}", e),
    })?;

    let (platform_manifest, _) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_manifest(&platform_ref, auth).await
    })
    .await
    .map_err(|_| Error::Timeout {
        operation: format!("pull platform manifest for {}", reference),
        duration: IMAGE_PULL_TIMEOUT,
    })?
    .map_err(|e| Error::ImagePullFailed {
        reference: reference.to_string(),
        reason: format!("failed to pull platform manifest: {}", e),
    })?;

    match platform_manifest {
        OciManifest::Image(img) => Ok((layers_of(img.layers), img.config)),
        OciManifest::ImageIndex(_) => Err(Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: "nested image index not supported".to_string(),
        }),
    }
}
