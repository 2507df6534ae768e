use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};

/// Blob storage for resources attached to model entities (blueprint files,
/// scripts, rendered artifacts)
pub trait ResourceStore: Send + Sync {
    /// Store a resource under `<kind>/<entry_id>/<path>`
    fn put(&self, kind: &str, entry_id: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Retrieve a resource
    fn get(&self, kind: &str, entry_id: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Check if a resource exists
    fn exists(&self, kind: &str, entry_id: &str, path: &str) -> Result<bool>;

    /// Delete a resource
    fn delete(&self, kind: &str, entry_id: &str, path: &str) -> Result<()>;
}

/// Filesystem-based resource store
#[derive(Clone)]
pub struct FilesystemResourceStore {
    base_path: PathBuf,
}

impl FilesystemResourceStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .context("Failed to create resource store directory")?;
        Ok(Self { base_path })
    }

    fn resource_path(&self, kind: &str, entry_id: &str, path: &str) -> Result<PathBuf> {
        for part in [kind, entry_id] {
            if part.is_empty() || part.contains(['/', '\\']) || part == ".." {
                bail!("invalid resource key segment '{}'", part);
            }
        }

        // Keep resources inside the entry directory
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("resource path '{}' must be relative and normalized", path);
        }

        Ok(self.base_path.join(kind).join(entry_id).join(relative))
    }
}

impl ResourceStore for FilesystemResourceStore {
    fn put(&self, kind: &str, entry_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.resource_path(kind, entry_id, path)?;

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create resource directory")?;
        }

        std::fs::write(&full_path, data)
            .with_context(|| format!("Failed to write resource {}", full_path.display()))?;
        Ok(())
    }

    fn get(&self, kind: &str, entry_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let full_path = self.resource_path(kind, entry_id, path)?;
        if !full_path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&full_path).context("Failed to read resource")?;
        Ok(Some(data))
    }

    fn exists(&self, kind: &str, entry_id: &str, path: &str) -> Result<bool> {
        Ok(self.resource_path(kind, entry_id, path)?.exists())
    }

    fn delete(&self, kind: &str, entry_id: &str, path: &str) -> Result<()> {
        let full_path = self.resource_path(kind, entry_id, path)?;
        if full_path.exists() {
            std::fs::remove_file(&full_path).context("Failed to delete resource")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resource_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemResourceStore::new(temp_dir.path().to_path_buf()).unwrap();

        store
            .put("blueprint", "bp-1", "scripts/create.sh", b"echo hi")
            .unwrap();
        assert!(store.exists("blueprint", "bp-1", "scripts/create.sh").unwrap());

        let data = store.get("blueprint", "bp-1", "scripts/create.sh").unwrap();
        assert_eq!(data.as_deref(), Some(&b"echo hi"[..]));

        store.delete("blueprint", "bp-1", "scripts/create.sh").unwrap();
        assert!(store.get("blueprint", "bp-1", "scripts/create.sh").unwrap().is_none());
    }

    #[test]
    fn rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemResourceStore::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(store.put("blueprint", "bp-1", "../escape", b"x").is_err());
        assert!(store.put("blueprint", "../bp", "file", b"x").is_err());
        assert!(store.get("blueprint", "bp-1", "/etc/passwd").is_err());
    }
}
