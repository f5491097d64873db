use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config;
use crate::error::Result;
use crate::reader::page::{PageIdentity, PublicationId};

/// Durable page image bytes, one file per page identity.
///
/// The files are the only record of what is cached, since a size trim can
/// delete any of them. `write` skips keys whose file still exists.
#[derive(Clone)]
pub struct PageCache {
    cache_dir: Arc<PathBuf>,
    max_bytes: u64,
}

impl PageCache {
    pub fn new(cache_dir: PathBuf, max_disk_cache_mb: u64) -> Self {
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            warn!("Failed to create cache directory {}: {}", cache_dir.display(), e);
        }

        Self {
            cache_dir: Arc::new(cache_dir),
            max_bytes: max_disk_cache_mb * 1024 * 1024,
        }
    }

    pub fn in_default_location(max_disk_cache_mb: u64) -> Self {
        Self::new(config::cache_dir().join("pages"), max_disk_cache_mb)
    }

    pub fn path_for(&self, id: &PageIdentity) -> PathBuf {
        self.publication_dir(&id.publication).join(id.number.to_string())
    }

    fn publication_dir(&self, id: &PublicationId) -> PathBuf {
        self.cache_dir.join(urlencoding::encode(id.as_str()).into_owned())
    }

    pub async fn has_page(&self, id: &PageIdentity) -> bool {
        tokio::fs::try_exists(self.path_for(id)).await.unwrap_or(false)
    }

    pub async fn read(&self, id: &PageIdentity) -> Option<Vec<u8>> {
        let bytes = tokio::fs::read(self.path_for(id)).await.ok()?;
        if bytes.is_empty() {
            return None;
        }
        debug!("disk cache hit for {}", id);
        Some(bytes)
    }

    pub async fn write(&self, id: &PageIdentity, bytes: &[u8]) -> Result<()> {
        if self.has_page(id).await {
            return Ok(());
        }

        let max_bytes = self.max_bytes;
        let root = Arc::clone(&self.cache_dir);
        // Cleanup walks the whole cache directory, keep it off the runtime threads.
        let _ = tokio::task::spawn_blocking(move || cleanup_old_cache(&root, max_bytes)).await;

        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove_publication(&self, id: &PublicationId) -> Result<()> {
        let dir = self.publication_dir(id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Deletes the oldest files until the cache is back under 80% of its budget.
fn cleanup_old_cache(cache_dir: &Path, max_bytes: u64) {
    let mut entries: Vec<_> = fs::read_dir(cache_dir)
        .ok()
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|dir| fs::read_dir(dir.path()).ok())
                .flat_map(|rd| rd.filter_map(|e| e.ok()))
                .filter_map(|e| {
                    let meta = e.metadata().ok()?;
                    let modified = meta.modified().ok()?;
                    Some((e.path(), meta.len(), modified))
                })
                .collect()
        })
        .unwrap_or_default();

    let total_size: u64 = entries.iter().map(|(_, size, _)| size).sum();
    if total_size <= max_bytes {
        return;
    }

    entries.sort_by_key(|(_, _, modified)| *modified);
    let mut current_size = total_size;
    for (path, size, _) in entries {
        if current_size <= max_bytes * 80 / 100 {
            break;
        }
        if fs::remove_file(&path).is_ok() {
            current_size -= size;
        }
    }
    debug!("disk cache trimmed from {} to {} bytes", total_size, current_size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let cache = PageCache::new(dir.path().to_path_buf(), 10);
        let id = PageIdentity::new("book/with:odd chars", 3);

        assert!(cache.read(&id).await.is_none());
        cache.write(&id, b"jpeg-bytes").await.unwrap();
        assert_eq!(cache.read(&id).await.as_deref(), Some(&b"jpeg-bytes"[..]));
        assert!(cache.has_page(&id).await);
    }

    #[tokio::test]
    async fn test_key_is_written_once() {
        let dir = tempdir().unwrap();
        let cache = PageCache::new(dir.path().to_path_buf(), 10);
        let id = PageIdentity::new("b", 1);

        cache.write(&id, b"first").await.unwrap();
        cache.write(&id, b"second").await.unwrap();
        assert_eq!(cache.read(&id).await.as_deref(), Some(&b"first"[..]));
    }

    #[tokio::test]
    async fn test_remove_publication() {
        let dir = tempdir().unwrap();
        let cache = PageCache::new(dir.path().to_path_buf(), 10);
        let id = PageIdentity::new("b", 1);
        cache.write(&id, b"x").await.unwrap();
        cache.remove_publication(&"b".into()).await.unwrap();
        assert!(!cache.has_page(&id).await);
    }

    #[tokio::test]
    async fn test_trimmed_page_is_no_longer_cached() {
        let dir = tempdir().unwrap();
        let cache = PageCache::new(dir.path().to_path_buf(), 0);
        let first = PageIdentity::new("b", 1);
        let second = PageIdentity::new("b", 2);

        cache.write(&first, b"aaaa").await.unwrap();
        cache.write(&second, b"bbbb").await.unwrap();
        assert!(!cache.has_page(&first).await);
        assert!(cache.read(&first).await.is_none());

        // Refetched after the trim, it is stored again.
        cache.write(&first, b"aaaa").await.unwrap();
        assert_eq!(cache.read(&first).await.as_deref(), Some(&b"aaaa"[..]));
    }

    #[test]
    fn test_cleanup_trims_oldest_files() {
        let dir = tempdir().unwrap();
        let book = dir.path().join("b");
        fs::create_dir_all(&book).unwrap();
        for n in 0..4 {
            fs::write(book.join(n.to_string()), vec![0u8; 100]).unwrap();
        }
        cleanup_old_cache(dir.path(), 250);
        let remaining = fs::read_dir(&book).unwrap().count();
        assert!(remaining <= 2);
    }
}
