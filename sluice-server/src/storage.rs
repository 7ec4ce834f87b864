use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Blob storage collaborator: stores an encoded image and returns a
/// retrievable URL for it.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

/// Filesystem-backed store. Uploads land under `root` and are served back by
/// this process under `{public_base}/images/{key}`.
pub struct FsBlobStore {
    root: PathBuf,
    public_base: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create storage root {}", root.display()))?;
        Ok(Self {
            root,
            public_base: public_base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write image to {}", path.display()))?;
        Ok(format!("{}/images/{}", self.public_base, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_writes_file_and_returns_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "http://localhost:8080/").unwrap();
        let url = store
            .put("generated_images/a_red_bicycle_0.png", b"png-bytes")
            .unwrap();
        assert_eq!(
            url,
            "http://localhost:8080/images/generated_images/a_red_bicycle_0.png"
        );
        let written = fs::read(dir.path().join("generated_images/a_red_bicycle_0.png")).unwrap();
        assert_eq!(written, b"png-bytes");
    }
}
