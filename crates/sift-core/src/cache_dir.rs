use crate::error::{Error, Result};
use crate::hash;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Configuration for selecting the on-disk cache root.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Override the global cache directory (the repo hash is still appended).
    pub cache_root_override: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os("SIFT_CACHE_DIR").map(PathBuf::from),
        }
    }
}

/// The repo-scoped cache directory holding builds, snapshots, and diffs.
#[derive(Clone, Debug)]
pub struct IndexCacheDir {
    repo_root: PathBuf,
    repo_hash: String,
    root: PathBuf,
}

impl IndexCacheDir {
    pub fn new(repo_root: impl AsRef<Path>, config: &CacheConfig) -> Result<Self> {
        let repo_root = std::fs::canonicalize(repo_root)?;
        let repo_hash = repo_id(&repo_root);

        let base = match &config.cache_root_override {
            Some(root) => root.clone(),
            None => default_cache_root()?,
        };
        let root = base.join(&repo_hash);

        std::fs::create_dir_all(root.join("builds"))?;
        std::fs::create_dir_all(root.join("snapshots"))?;
        std::fs::create_dir_all(root.join("diffs"))?;

        Ok(Self {
            repo_root,
            repo_hash,
            root,
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn repo_hash(&self) -> &str {
        &self.repo_hash
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn diffs_dir(&self) -> PathBuf {
        self.root.join("diffs")
    }

    pub fn current_build_path(&self) -> PathBuf {
        self.builds_dir().join("current.json")
    }

    pub fn snapshots_manifest_path(&self) -> PathBuf {
        self.snapshots_dir().join("manifest.json")
    }

    pub fn diffs_manifest_path(&self) -> PathBuf {
        self.diffs_dir().join("manifest.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("index.lock")
    }
}

/// Stable identifier for a repository root, used to key its cache directory
/// and recorded as snapshot provenance.
pub(crate) fn repo_id(repo_root: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_root.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

fn default_cache_root() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_else(|| {
            Error::internal("failed to determine home directory for default cache path")
        })?;
    Ok(home.join(".sift").join("index"))
}

impl IndexCacheDir {
    /// SHA-1 of the canonicalized repo root path, recorded in snapshot
    /// provenance alongside `repo_hash`.
    pub fn repo_root_hash(&self) -> String {
        hash::sha1_hex(self.repo_root.to_string_lossy().as_bytes())
    }
}
