//! # Image Reference Resolution
//!
//! Host container sources are plain image references, except for images
//! hosted in Amazon ECR. Those are written the way users copy them out of the
//! console (`<account>.dkr.ecr.<region>.amazonaws.com[.cn]/<name>:<tag>`) and
//! are rewritten into a canonical resolver reference built around the
//! repository ARN:
//!
//! ```text
//! 777777777777.dkr.ecr.us-west-2.amazonaws.com/my_image:latest
//!         │
//!         ▼
//! ecr.aws/arn:aws:ecr:us-west-2:777777777777:repository/my_image:latest
//! ```
//!
//! The `ecr.aws/` prefix is what later selects the ECR transport in
//! [`crate::image`]. [`EcrReference::parse`] performs the inverse mapping so
//! the transport can derive the registry endpoint again.
//!
//! ## Partitions
//!
//! | Endpoint suffix | Region            | Partition    |
//! |-----------------|-------------------|--------------|
//! | `.com`          | any non-GovCloud  | `aws`        |
//! | `.com.cn`       | any non-GovCloud  | `aws-cn`     |
//! | `.com`          | `us-gov-*-1`      | `aws-us-gov` |
//! | `.com.cn`       | `us-gov-*-1`      | error        |

use crate::constants::{
    ECR_REFERENCE_PREFIX, ECR_SERVICE, GOV_CLOUD_REGIONS, PARTITION_AWS, PARTITION_AWS_CN,
    PARTITION_AWS_US_GOV,
};
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

static ECR_HOST_REGEX: OnceLock<Regex> = OnceLock::new();
static DIGEST_REGEX: OnceLock<Regex> = OnceLock::new();
static TAG_REGEX: OnceLock<Regex> = OnceLock::new();

/// Matches ECR image names, capturing account, region and the `.cn` TLD.
///
/// Example 1: `777777777777.dkr.ecr.us-west-2.amazonaws.com/my_image:latest`
/// Example 2: `777777777777.dkr.ecr.cn-north-1.amazonaws.com.cn/my_image:latest`
fn ecr_host_regex() -> &'static Regex {
    ECR_HOST_REGEX.get_or_init(|| {
        Regex::new(
            r"^([a-zA-Z0-9][a-zA-Z0-9_-]*)\.dkr\.ecr\.([a-zA-Z0-9][a-zA-Z0-9_-]*)\.amazonaws\.com(\.cn)?.*",
        )
        .expect("ECR hostname pattern is valid")
    })
}

fn digest_regex() -> &'static Regex {
    DIGEST_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_-]+@sha256:[A-Fa-f0-9]{64}$").expect("digest pattern is valid")
    })
}

fn tag_regex() -> &'static Regex {
    TAG_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_-]+:[a-zA-Z0-9._-]{1,128}$").expect("tag pattern is valid")
    })
}

// =============================================================================
// Image Reference
// =============================================================================

/// An image source together with the reference actually pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Source as given on the command line.
    pub raw: String,
    /// `raw` unchanged, or the canonical ECR resolver reference.
    pub resolved: String,
}

impl ImageReference {
    /// Resolves `raw` into an image reference.
    pub fn resolve(raw: &str) -> Result<Self> {
        Ok(Self {
            raw: raw.to_string(),
            resolved: resolve(raw)?,
        })
    }

    /// Returns true if the source was rewritten into an ECR reference.
    pub fn is_rewritten(&self) -> bool {
        self.raw != self.resolved
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resolved)
    }
}

/// Resolves an image source into the reference to pull.
///
/// Sources that are not ECR image names pass through unchanged.
///
/// # Errors
///
/// - [`Error::AmbiguousPartition`] for a `.cn` endpoint in a GovCloud region
/// - [`Error::MissingNameAndTag`] if the path is not a single `name:tag`
/// - [`Error::MalformedNameAndTag`] if the name, tag or digest is invalid
pub fn resolve(raw: &str) -> Result<String> {
    if !is_ecr_image_name(raw) {
        return Ok(raw.to_string());
    }
    let resolved = ecr_image_name_to_ref(raw)?;
    debug!(source = raw, reference = %resolved, "resolved ECR image name");
    Ok(resolved)
}

/// Returns true if `raw` looks like an ECR image name.
pub fn is_ecr_image_name(raw: &str) -> bool {
    ecr_host_regex().is_match(raw)
}

/// Transforms an ECR image name into a reference resolvable by the ECR
/// transport, e.g. `ecr.aws/arn:<partition>:ecr:<region>:<account>:repository/<name>:<tag>`.
pub fn ecr_image_name_to_ref(input: &str) -> Result<String> {
    let input = input.strip_prefix("https://").unwrap_or(input);

    let captures = ecr_host_regex()
        .captures(input)
        .ok_or_else(|| Error::InvalidImageReference {
            reference: input.to_string(),
            reason: "invalid ECR image name".to_string(),
        })?;
    let account = &captures[1];
    let region = &captures[2];
    let is_cn_endpoint = captures.get(3).is_some();

    let partition = Partition::detect(is_cn_endpoint, region).ok_or_else(|| {
        Error::AmbiguousPartition {
            input: input.to_string(),
        }
    })?;

    // Separate out <name>:<tag>
    let tokens: Vec<&str> = input.split('/').collect();
    if tokens.len() != 2 {
        return Err(Error::MissingNameAndTag {
            input: input.to_string(),
        });
    }
    let image = ImageId::parse(tokens[1]).ok_or_else(|| Error::MalformedNameAndTag {
        input: input.to_string(),
    })?;

    let reference = EcrReference {
        partition,
        region: region.to_string(),
        account: account.to_string(),
        image,
    };
    Ok(reference.to_string())
}

// =============================================================================
// Partition
// =============================================================================

/// AWS partition an ECR registry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Commercial regions.
    Aws,
    /// China regions.
    AwsCn,
    /// GovCloud regions.
    AwsUsGov,
}

impl Partition {
    /// Determines the partition from the endpoint TLD and region.
    ///
    /// Returns `None` when both indicate a non-default partition.
    pub fn detect(is_cn_endpoint: bool, region: &str) -> Option<Self> {
        let is_gov_cloud = GOV_CLOUD_REGIONS.contains(&region);
        match (is_cn_endpoint, is_gov_cloud) {
            (true, true) => None,
            (true, false) => Some(Self::AwsCn),
            (false, true) => Some(Self::AwsUsGov),
            (false, false) => Some(Self::Aws),
        }
    }

    /// Partition identifier as used in ARNs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => PARTITION_AWS,
            Self::AwsCn => PARTITION_AWS_CN,
            Self::AwsUsGov => PARTITION_AWS_US_GOV,
        }
    }

    /// DNS suffix of registry endpoints in this partition.
    pub fn dns_suffix(&self) -> &'static str {
        match self {
            Self::AwsCn => "amazonaws.com.cn",
            Self::Aws | Self::AwsUsGov => "amazonaws.com",
        }
    }

    fn from_arn(s: &str) -> Option<Self> {
        match s {
            PARTITION_AWS => Some(Self::Aws),
            PARTITION_AWS_CN => Some(Self::AwsCn),
            PARTITION_AWS_US_GOV => Some(Self::AwsUsGov),
            _ => None,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Image Identity
// =============================================================================

/// Repository name plus exactly one of tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageId {
    /// `name:tag`
    Tag { name: String, tag: String },
    /// `name@sha256:<hex>`
    Digest { name: String, digest: String },
}

impl ImageId {
    /// Parses a `name:tag` or `name@sha256:<hex>` segment.
    pub fn parse(segment: &str) -> Option<Self> {
        if digest_regex().is_match(segment) {
            let (name, digest) = segment.split_once('@')?;
            return Some(Self::Digest {
                name: name.to_string(),
                digest: digest.to_string(),
            });
        }
        if tag_regex().is_match(segment) {
            let (name, tag) = segment.split_once(':')?;
            return Some(Self::Tag {
                name: name.to_string(),
                tag: tag.to_string(),
            });
        }
        None
    }

    /// Repository name.
    pub fn name(&self) -> &str {
        match self {
            Self::Tag { name, .. } | Self::Digest { name, .. } => name,
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag { name, tag } => write!(f, "{}:{}", name, tag),
            Self::Digest { name, digest } => write!(f, "{}@{}", name, digest),
        }
    }
}

// =============================================================================
// Canonical ECR Reference
// =============================================================================

/// Parsed form of an `ecr.aws/arn:...` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcrReference {
    pub partition: Partition,
    pub region: String,
    pub account: String,
    pub image: ImageId,
}

impl EcrReference {
    /// Parses a canonical ECR resolver reference.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let arn = reference
            .strip_prefix(ECR_REFERENCE_PREFIX)
            .ok_or_else(|| invalid("missing ECR scheme prefix"))?;

        // arn:<partition>:<service>:<region>:<account>:<resource>
        let parts: Vec<&str> = arn.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" {
            return Err(invalid("not an ARN"));
        }
        let partition = Partition::from_arn(parts[1]).ok_or_else(|| invalid("unknown partition"))?;
        if parts[2] != ECR_SERVICE {
            return Err(invalid("not an ECR resource"));
        }
        if parts[3].is_empty() || parts[4].is_empty() {
            return Err(invalid("missing region or account"));
        }
        let image = parts[5]
            .strip_prefix("repository/")
            .and_then(ImageId::parse)
            .ok_or_else(|| invalid("malformed repository resource"))?;

        Ok(Self {
            partition,
            region: parts[3].to_string(),
            account: parts[4].to_string(),
            image,
        })
    }

    /// Registry host serving this repository.
    pub fn registry_host(&self) -> String {
        format!(
            "{}.dkr.ecr.{}.{}",
            self.account,
            self.region,
            self.partition.dns_suffix()
        )
    }

    /// Plain distribution reference (`<host>/<name>:<tag>`) for the registry.
    pub fn distribution_reference(&self) -> String {
        format!("{}/{}", self.registry_host(), self.image)
    }
}

impl fmt::Display for EcrReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}arn:{}:{}:{}:{}:repository/{}",
            ECR_REFERENCE_PREFIX, self.partition, ECR_SERVICE, self.region, self.account, self.image
        )
    }
}
