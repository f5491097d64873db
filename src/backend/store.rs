use async_trait::async_trait;
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use super::PendingProgressQueue;
use crate::config;
use crate::error::Result;
use crate::reader::page::{BookPage, Publication, PublicationId};
use crate::reader::progress::PendingProgress;
use crate::reader::text::{Manifest, ManifestLink};
use crate::reader::view_items::IsolateSets;

const TEXT_LENGTHS: &str = "text-length.json";
const PAGE_COUNTS: &str = "page-counts.json";
const PENDING_PROGRESS: &str = "pending-progress.json";
const ISOLATE_PAGES: &str = "isolate-pages.json";

/// JSON files under the data directory: one folder per publication for its
/// pages, TOC and manifest, plus a few shared lookup maps.
pub struct LocalStore {
    root: PathBuf,
    // Serializes read-modify-write of the shared files.
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        fs::create_dir_all(&root).ok();
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_default_location() -> Self {
        Self::new(config::cache_dir().join("store"))
    }

    fn publication_dir(&self, id: &PublicationId) -> PathBuf {
        self.root.join(urlencoding::encode(id.as_str()).into_owned())
    }

    fn load<T: DeserializeOwned>(&self, path: PathBuf) -> Option<T> {
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    fn save<T: Serialize + ?Sized>(&self, path: PathBuf, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.part");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read_publication(&self, id: &PublicationId) -> Option<Publication> {
        self.load(self.publication_dir(id).join("publication.json"))
    }

    pub fn write_publication(&self, publication: &Publication) -> Result<()> {
        self.save(self.publication_dir(&publication.id).join("publication.json"), publication)
    }

    pub fn read_pages(&self, id: &PublicationId) -> Option<Vec<BookPage>> {
        self.load(self.publication_dir(id).join("pages.json"))
    }

    pub fn write_pages(&self, id: &PublicationId, pages: &[BookPage]) -> Result<()> {
        self.save(self.publication_dir(id).join("pages.json"), pages)
    }

    pub fn read_manifest(&self, id: &PublicationId) -> Option<Manifest> {
        self.load(self.publication_dir(id).join("manifest.json"))
    }

    pub fn write_manifest(&self, id: &PublicationId, manifest: &Manifest) -> Result<()> {
        self.save(self.publication_dir(id).join("manifest.json"), manifest)
    }

    pub fn read_toc(&self, id: &PublicationId) -> Option<Vec<ManifestLink>> {
        self.load(self.publication_dir(id).join("toc.json"))
    }

    pub fn write_toc(&self, id: &PublicationId, toc: &[ManifestLink]) -> Result<()> {
        self.save(self.publication_dir(id).join("toc.json"), toc)
    }

    /// Drops everything stored for one publication.
    pub fn remove(&self, id: &PublicationId) -> Result<()> {
        let dir = self.publication_dir(id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn isolate_pages(&self) -> IsolateSets {
        self.load::<HashMap<PublicationId, BTreeSet<usize>>>(self.root.join(ISOLATE_PAGES))
            .unwrap_or_default()
    }

    pub fn save_isolate_pages(&self, sets: &IsolateSets) -> Result<()> {
        let _guard = self.lock();
        self.save(self.root.join(ISOLATE_PAGES), sets)
    }

    /// Text lengths keyed by normalized resource href.
    pub fn text_lengths(&self) -> HashMap<String, u64> {
        self.load(self.root.join(TEXT_LENGTHS)).unwrap_or_default()
    }

    pub fn save_text_length(&self, key: &str, length: u64) -> Result<()> {
        self.update_map(TEXT_LENGTHS, key, length)
    }

    /// Page counts keyed by `resource|WxH|signature`.
    pub fn page_counts(&self) -> HashMap<String, usize> {
        self.load(self.root.join(PAGE_COUNTS)).unwrap_or_default()
    }

    pub fn save_page_count(&self, key: &str, count: usize) -> Result<()> {
        self.update_map(PAGE_COUNTS, key, count)
    }

    fn update_map<V: Serialize + DeserializeOwned + PartialEq>(&self, file: &str, key: &str, value: V) -> Result<()> {
        let _guard = self.lock();
        let path = self.root.join(file);
        let mut map: HashMap<String, V> = self.load(path.clone()).unwrap_or_default();
        if map.get(key) == Some(&value) {
            return Ok(());
        }
        map.insert(key.to_string(), value);
        self.save(path, &map)
    }

    fn pending(&self) -> Vec<PendingProgress> {
        self.load(self.root.join(PENDING_PROGRESS)).unwrap_or_default()
    }
}

#[async_trait]
impl PendingProgressQueue for LocalStore {
    /// Keeps only the newest entry per publication.
    async fn enqueue(&self, pending: PendingProgress) -> Result<()> {
        let _guard = self.lock();
        let mut queue = self.pending();
        queue.retain(|p| p.publication != pending.publication);
        queue.push(pending);
        self.save(self.root.join(PENDING_PROGRESS), &queue)
    }

    async fn drain(&self) -> Result<Vec<PendingProgress>> {
        let _guard = self.lock();
        let queue = self.pending();
        if !queue.is_empty() {
            self.save(self.root.join(PENDING_PROGRESS), &Vec::<PendingProgress>::new())?;
        }
        Ok(queue)
    }

    async fn requeue(&self, pending: PendingProgress) -> Result<()> {
        let _guard = self.lock();
        let mut queue = self.pending();
        if queue.iter().any(|p| p.publication == pending.publication) {
            return Ok(());
        }
        queue.insert(0, pending);
        self.save(self.root.join(PENDING_PROGRESS), &queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::progress::ProgressUpdate;
    use tempfile::tempdir;

    #[test]
    fn test_pages_round_trip_per_publication() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        let id = PublicationId::from("0A1B/2C");

        assert!(store.read_pages(&id).is_none());
        let pages = vec![BookPage::new(1).with_size(800, 1200), BookPage::new(2)];
        store.write_pages(&id, &pages).unwrap();
        assert_eq!(store.read_pages(&id), Some(pages));
        assert!(store.read_pages(&"other".into()).is_none());

        store.write_publication(&Publication::new(id.clone(), "Vol. 1")).unwrap();
        assert_eq!(store.read_publication(&id).map(|p| p.title), Some("Vol. 1".to_string()));

        store.remove(&id).unwrap();
        assert!(store.read_pages(&id).is_none());
        assert!(store.read_publication(&id).is_none());
    }

    #[test]
    fn test_shared_maps() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());

        store.save_text_length("OEBPS/ch1.xhtml", 1200).unwrap();
        store.save_page_count("ch1.xhtml|80x24|serif", 7).unwrap();
        store.save_page_count("ch1.xhtml|80x24|serif", 9).unwrap();

        assert_eq!(store.text_lengths().get("OEBPS/ch1.xhtml"), Some(&1200));
        assert_eq!(store.page_counts().get("ch1.xhtml|80x24|serif"), Some(&9));
    }

    #[test]
    fn test_isolate_pages_persist() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        let mut sets = IsolateSets::new();
        sets.insert("b".into(), BTreeSet::from([0, 4]));
        store.save_isolate_pages(&sets).unwrap();

        let reopened = LocalStore::new(dir.path().to_path_buf());
        assert_eq!(reopened.isolate_pages(), sets);
    }

    #[test]
    fn test_corrupt_file_reads_as_missing() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        fs::write(dir.path().join(TEXT_LENGTHS), "{not json").unwrap();
        assert!(store.text_lengths().is_empty());
    }

    #[tokio::test]
    async fn test_pending_queue_keeps_latest_per_publication() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        let update = |page| ProgressUpdate::Page { page, completed: false };

        for (book, page) in [("a", 1), ("b", 1), ("a", 5)] {
            store
                .enqueue(PendingProgress {
                    publication: book.into(),
                    update: update(page),
                })
                .await
                .unwrap();
        }

        let drained = store.drain().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].publication, PublicationId::from("b"));
        assert_eq!(drained[1].update, update(5));
        assert!(store.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_never_replaces_newer_entry() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        let entry = |book: &str, page| PendingProgress {
            publication: book.into(),
            update: ProgressUpdate::Page { page, completed: false },
        };

        store.enqueue(entry("a", 7)).await.unwrap();
        store.requeue(entry("a", 3)).await.unwrap();
        store.requeue(entry("b", 2)).await.unwrap();

        let drained = store.drain().await.unwrap();
        assert_eq!(drained, vec![entry("b", 2), entry("a", 7)]);
    }
}
