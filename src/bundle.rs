//! OCI Runtime Bundle building.
//!
//! Two halves of turning a pulled image into something an OCI runtime can
//! start:
//!
//! - [`unpack_layers`] applies the image's gzip'd tar layers, bottom to top,
//!   onto a directory (the committed snapshot tree)
//! - [`write_bundle`] writes `config.json` next to the container's rootfs
//!
//! ## Whiteouts
//!
//! | Entry               | Effect                                        |
//! |---------------------|-----------------------------------------------|
//! | `dir/.wh.<name>`    | removes `dir/<name>` from lower layers        |
//! | `dir/.wh..wh..opq`  | removes everything lower layers put in `dir`  |

use crate::constants::{MAX_LAYER_SIZE, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use crate::registry::LayerInfo;
use crate::spec::OciSpec;
use crate::storage::BlobStore;
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Media types whose blobs are stored uncompressed.
const UNCOMPRESSED_LAYER_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.docker.image.rootfs.diff.tar",
];

// =============================================================================
// Bundle
// =============================================================================

/// An OCI runtime bundle on disk.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Bundle directory (holds `config.json`).
    pub path: PathBuf,
    /// Root filesystem referenced by `config.json`.
    pub rootfs: PathBuf,
}

impl Bundle {
    /// Path of the bundle's `config.json`.
    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.json")
    }
}

/// Writes a bundle for `spec` into `bundle_dir`, pointing at `rootfs`.
///
/// The rootfs lives in the container's snapshot, so `root.path` is written
/// as an absolute path.
pub fn write_bundle(bundle_dir: &Path, rootfs: &Path, spec: &OciSpec) -> Result<Bundle> {
    fs::create_dir_all(bundle_dir)?;

    let mut spec = spec.clone();
    spec.root.path = rootfs.to_string_lossy().into_owned();

    let config_json = serde_json::to_string_pretty(&spec)?;
    let bundle = Bundle {
        path: bundle_dir.to_path_buf(),
        rootfs: rootfs.to_path_buf(),
    };
    fs::write(bundle.config_path(), config_json)?;

    info!(bundle = %bundle_dir.display(), "wrote OCI bundle");
    Ok(bundle)
}

// =============================================================================
// Layer Extraction
// =============================================================================

/// Applies `layers` in order onto `dest`.
pub fn unpack_layers(layers: &[LayerInfo], storage: &BlobStore, dest: &Path) -> Result<()> {
    let mut total_size = 0u64;

    for layer in layers {
        debug!(digest = %layer.digest, "extracting layer");

        let data = storage.get_blob(&layer.digest)?;
        if data.len() > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }

        if UNCOMPRESSED_LAYER_TYPES.contains(&layer.media_type.as_str()) {
            apply_layer(&layer.digest, &data[..], dest, &mut total_size)?;
        } else {
            apply_layer(&layer.digest, GzDecoder::new(&data[..]), dest, &mut total_size)?;
        }
    }

    Ok(())
}

fn apply_layer<R: Read>(digest: &str, reader: R, dest: &Path, total_size: &mut u64) -> Result<()> {
    let extraction_failed = |e: std::io::Error| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: e.to_string(),
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);

    for entry in archive.entries().map_err(extraction_failed)? {
        let mut entry = entry.map_err(extraction_failed)?;
        let path = entry.path().map_err(extraction_failed)?.into_owned();

        check_entry_path(&path)?;

        let parent = path.parent().unwrap_or(Path::new(""));
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if filename == OPAQUE_WHITEOUT {
            if let Some(dir) = contained_path(dest, parent)? {
                clear_dir(&dir)?;
            }
            continue;
        }
        if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
            if target.is_empty() || target == "." || target == ".." {
                return Err(Error::PathTraversal {
                    path: path.to_string_lossy().into_owned(),
                });
            }
            if let Some(dir) = contained_path(dest, parent)? {
                remove_path(&dir.join(target));
            }
            continue;
        }

        *total_size += entry.size();
        if *total_size > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: *total_size,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        entry.unpack_in(dest).map_err(extraction_failed)?;
    }

    Ok(())
}

/// Rejects absolute paths and `..` components.
fn check_entry_path(path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::PathTraversal {
            path: path.to_string_lossy().into_owned(),
        });
    }
    Ok(())
}

/// Resolves `rel` below `root` without following symlinks.
///
/// Returns `None` when a component does not exist. A component that is a
/// symlink is rejected, since it may point outside `root`.
pub fn contained_path(root: &Path, rel: &Path) -> Result<Option<PathBuf>> {
    check_entry_path(rel)?;

    let mut path = root.to_path_buf();
    for component in rel.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        path.push(name);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: rel.to_string_lossy().into_owned(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(path))
}

fn remove_path(path: &Path) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let _ = fs::remove_dir_all(path);
        }
        Ok(_) => {
            let _ = fs::remove_file(path);
        }
        Err(_) => {}
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        remove_path(&entry?.path());
    }
    Ok(())
}
