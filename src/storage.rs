//! # Content Store and Snapshots
//!
//! Everything the launcher persists about images lives under the content
//! root (`HOST_CTR_CONTENT_ROOT`, default `/var/lib/host-containerd`):
//!
//! ```text
//! <content-root>/
//! ├── blobs/
//! │   └── sha256/
//! │       └── ab/abcd1234...            (layer or config blob)
//! └── snapshots/
//!     └── overlayfs/
//!         ├── committed/<image-hex>/    (unpacked image tree)
//!         └── active/<namespace>/<name>/
//!             ├── upper/
//!             ├── work/
//!             └── rootfs/               (container root filesystem)
//! ```
//!
//! ## Blobs
//!
//! [`BlobStore`] is content-addressed. [`BlobStore::put_blob`] verifies the
//! SHA-256 of the data against the digest before writing, and writes go
//! through a unique temp file followed by a rename so a crash never leaves a
//! partial blob behind.
//!
//! ## Snapshots
//!
//! [`SnapshotStore`] manages one snapshotter's directories. An image is
//! unpacked once into a committed tree; each container then gets an active
//! snapshot whose lower layer is that tree. Committing goes through a temp
//! directory and a rename, so a committed tree is either complete or absent.

use crate::constants::{BLOB_STORE_DIR, SNAPSHOT_DIR};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Blob Store
// =============================================================================

/// Content-addressed blob store for image layers and configs.
pub struct BlobStore {
    /// Base directory for blob storage.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Opens the blob store under `content_root`.
    pub fn open(content_root: &Path) -> Result<Self> {
        Self::with_path(content_root.join(BLOB_STORE_DIR))
    }

    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        debug!(path = %base_dir.display(), "blob store initialized");

        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Gets a blob by digest.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Gets a blob path without reading it.
    ///
    /// # Security
    ///
    /// The digest is sanitized before it becomes a path:
    /// - Algorithm must be sha256, sha384, or sha512
    /// - Hash must contain only hexadecimal characters
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        // sha256:abcd1234... is stored as blobs/sha256/ab/abcd1234...
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!(algo, "invalid digest algorithm, defaulting to sha256");
                "sha256"
            }
        };

        let safe_hash = sanitize_hex(hash);
        if safe_hash.is_empty() {
            return self.base_dir.join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(safe_algo).join(prefix).join(&safe_hash)
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// Only SHA-256 digests are accepted.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected_hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        if algo != "sha256" {
            return Err(Error::StorageWriteFailed(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                algo
            )));
        }

        let computed_hash = hex::encode(Sha256::digest(data));
        if computed_hash != expected_hash {
            return Err(Error::StorageWriteFailed(format!(
                "digest mismatch: expected {}, computed {}",
                expected_hash, computed_hash
            )));
        }

        let path = self.blob_path(digest);
        if path.exists() {
            debug!(digest, "blob already exists");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // Concurrent writers of the same blob use distinct temp files; the
        // rename is atomic and the content identical.
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!(digest, size = data.len(), "stored verified blob");
        Ok(())
    }

    /// Removes a blob.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn sanitize_hex(hash: &str) -> String {
    let safe: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if safe.len() != hash.len() {
        warn!(hash, sanitized = %safe, "digest hash contained non-hex characters");
    }
    safe
}

// =============================================================================
// Snapshot Store
// =============================================================================

/// Directories of an active (writable) snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSnapshot {
    /// Snapshot name.
    pub name: String,
    /// Committed image tree the snapshot is layered on.
    pub lower: PathBuf,
    /// Writable upper directory.
    pub upper: PathBuf,
    /// Overlay work directory.
    pub work: PathBuf,
    /// Mount point of the container root filesystem.
    pub rootfs: PathBuf,
}

impl ActiveSnapshot {
    /// Directory holding all of the snapshot's state.
    pub fn dir(&self) -> &Path {
        self.rootfs.parent().unwrap_or(&self.rootfs)
    }

    /// Overlay mount options for this snapshot.
    pub fn overlay_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }
}

/// Snapshot directories of one snapshotter, scoped to a namespace.
pub struct SnapshotStore {
    /// `<content-root>/snapshots/<snapshotter>`.
    base_dir: PathBuf,
    /// Namespace active snapshots are created in.
    namespace: String,
}

impl SnapshotStore {
    /// Opens the snapshot store of `snapshotter` under `content_root`.
    pub fn open(content_root: &Path, snapshotter: &str, namespace: &str) -> Result<Self> {
        if snapshotter.is_empty() || snapshotter.contains('/') || snapshotter.contains("..") {
            return Err(Error::StorageInitFailed {
                path: content_root.join(SNAPSHOT_DIR),
                reason: format!("invalid snapshotter name '{}'", snapshotter),
            });
        }

        let base_dir = content_root.join(SNAPSHOT_DIR).join(snapshotter);
        for dir in [base_dir.join("committed"), base_dir.join("active").join(namespace)] {
            fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(Self {
            base_dir,
            namespace: namespace.to_string(),
        })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the committed tree for an image digest.
    pub fn committed_path(&self, image_digest: &str) -> PathBuf {
        let (_, hash) = image_digest
            .split_once(':')
            .unwrap_or(("sha256", image_digest));
        self.base_dir.join("committed").join(sanitize_hex(hash))
    }

    /// Returns true if the image has been unpacked into this snapshotter.
    pub fn is_committed(&self, image_digest: &str) -> bool {
        self.committed_path(image_digest).is_dir()
    }

    /// Populates the committed tree for `image_digest` with `fill`.
    ///
    /// `fill` writes into a temp directory which is renamed into place when
    /// it succeeds, and removed when it fails. Already committed images are
    /// left untouched.
    pub fn commit<F>(&self, image_digest: &str, fill: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let target = self.committed_path(image_digest);
        if target.is_dir() {
            debug!(digest = image_digest, "snapshot already committed");
            return Ok(target);
        }

        let staging = self
            .base_dir
            .join("committed")
            .join(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::create_dir_all(&staging).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        if let Err(e) = fill(&staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            // Lost a race with another unpack of the same image.
            if target.is_dir() {
                return Ok(target);
            }
            return Err(Error::StorageWriteFailed(e.to_string()));
        }

        info!(digest = image_digest, "committed snapshot");
        Ok(target)
    }

    fn active_dir(&self, name: &str) -> PathBuf {
        self.base_dir
            .join("active")
            .join(&self.namespace)
            .join(name)
    }

    /// Returns the active snapshot `name` if it exists.
    pub fn active(&self, name: &str, image_digest: &str) -> Option<ActiveSnapshot> {
        let dir = self.active_dir(name);
        dir.is_dir().then(|| self.layout(name, image_digest, dir))
    }

    fn layout(&self, name: &str, image_digest: &str, dir: PathBuf) -> ActiveSnapshot {
        ActiveSnapshot {
            name: name.to_string(),
            lower: self.committed_path(image_digest),
            upper: dir.join("upper"),
            work: dir.join("work"),
            rootfs: dir.join("rootfs"),
        }
    }

    /// Creates the directories of a new active snapshot on top of a
    /// committed image.
    pub fn prepare(&self, name: &str, image_digest: &str) -> Result<ActiveSnapshot> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::StorageWriteFailed(format!(
                "invalid snapshot name '{}'",
                name
            )));
        }
        if !self.is_committed(image_digest) {
            return Err(Error::StorageWriteFailed(format!(
                "image {} is not unpacked",
                image_digest
            )));
        }

        let dir = self.active_dir(name);
        if dir.exists() {
            return Err(Error::StorageWriteFailed(format!(
                "snapshot '{}' already exists",
                name
            )));
        }

        let snapshot = self.layout(name, image_digest, dir);
        for d in [&snapshot.upper, &snapshot.work, &snapshot.rootfs] {
            fs::create_dir_all(d).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        debug!(name, "prepared snapshot");
        Ok(snapshot)
    }

    /// Removes the directories of active snapshot `name`.
    ///
    /// The caller unmounts the rootfs first. Missing snapshots are not an
    /// error.
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.active_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            debug!(name, "removed snapshot");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let data = b"hello world";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));

        store.put_blob(&digest, data).unwrap();
        assert!(store.has_blob(&digest));
        assert_eq!(store.get_blob(&digest).unwrap(), data);

        store.remove_blob(&digest).unwrap();
        assert!(!store.has_blob(&digest));
    }

    #[test]
    fn test_blob_digest_verification_fails() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let wrong_digest =
            "sha256:0000000000000000000000000000000000000000000000000000000000000000";
        assert!(store.put_blob(wrong_digest, b"hello world").is_err());
    }

    #[test]
    fn test_blob_path_sanitized() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open(temp.path()).unwrap();

        let path = store.blob_path("sha256:../../etc/passwd");
        assert!(path.starts_with(store.base_dir()));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_commit_failure_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp.path(), "overlayfs", "default").unwrap();

        let result = store.commit("sha256:abcd", |_| {
            Err(Error::Internal("layer broken".to_string()))
        });
        assert!(result.is_err());
        assert!(!store.is_committed("sha256:abcd"));

        let committed = fs::read_dir(store.base_dir().join("committed"))
            .unwrap()
            .count();
        assert_eq!(committed, 0);
    }

    #[test]
    fn test_invalid_snapshotter_rejected() {
        let temp = TempDir::new().unwrap();
        assert!(SnapshotStore::open(temp.path(), "../escape", "default").is_err());
        assert!(SnapshotStore::open(temp.path(), "", "default").is_err());
    }
}
