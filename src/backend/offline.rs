use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use super::cache::PageCache;
use super::store::LocalStore;
use super::{DownloadStatus, DownloadStatusSource};
use crate::error::{ReaderError, Result};
use crate::reader::page::{PageIdentity, PublicationId};

/// Download status derived from what is on disk: the stored page listing
/// and how many of those pages have bytes in the page cache.
pub struct DiskDownloads {
    store: Arc<LocalStore>,
    cache: PageCache,
}

impl DiskDownloads {
    pub fn new(store: Arc<LocalStore>, cache: PageCache) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl DownloadStatusSource for DiskDownloads {
    async fn status(&self, id: &PublicationId) -> DownloadStatus {
        let Some(pages) = self.store.read_pages(id) else {
            return DownloadStatus::NotDownloaded;
        };
        if pages.is_empty() {
            return DownloadStatus::Failed("publication has no pages".to_string());
        }
        let mut cached = 0;
        for page in &pages {
            if self.cache.has_page(&PageIdentity::new(id.clone(), page.number)).await {
                cached += 1;
            }
        }
        if cached == pages.len() {
            DownloadStatus::Downloaded
        } else {
            DownloadStatus::Pending {
                progress: cached as f64 / pages.len() as f64,
            }
        }
    }
}

/// Polls the download status of `id` until it is downloaded, failed, or
/// `max_polls` checks have been made. Anything but `Downloaded` is an
/// `Offline` error the reader shows as retryable.
pub async fn wait_until_ready(
    source: &dyn DownloadStatusSource,
    id: &PublicationId,
    poll_interval: Duration,
    max_polls: u32,
) -> Result<()> {
    for attempt in 1..=max_polls.max(1) {
        match source.status(id).await {
            DownloadStatus::Downloaded => {
                info!("{} is available offline", id);
                return Ok(());
            }
            DownloadStatus::Failed(reason) => {
                return Err(ReaderError::Offline(format!("download of {id} failed: {reason}")));
            }
            DownloadStatus::NotDownloaded => {
                return Err(ReaderError::Offline(format!("{id} is not downloaded")));
            }
            DownloadStatus::Pending { progress } => {
                debug!("{} downloading, {:.0}% (check {}/{})", id, progress * 100.0, attempt, max_polls);
            }
        }
        if attempt < max_polls {
            tokio::time::sleep(poll_interval).await;
        }
    }
    Err(ReaderError::Offline(format!("{id} is still downloading")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::page::BookPage;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Scripted(Mutex<Vec<DownloadStatus>>);

    impl Scripted {
        fn new(mut statuses: Vec<DownloadStatus>) -> Self {
            statuses.reverse();
            Self(Mutex::new(statuses))
        }

        fn remaining(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DownloadStatusSource for Scripted {
        async fn status(&self, _id: &PublicationId) -> DownloadStatus {
            self.0
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(DownloadStatus::Pending { progress: 0.99 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_through_pending() {
        let source = Scripted::new(vec![
            DownloadStatus::Pending { progress: 0.1 },
            DownloadStatus::Pending { progress: 0.6 },
            DownloadStatus::Downloaded,
        ]);
        let result = wait_until_ready(&source, &"b".into(), Duration::from_secs(1), 5).await;
        assert_eq!(result, Ok(()));
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_is_bounded() {
        let source = Scripted::new(Vec::new());
        let result = wait_until_ready(&source, &"b".into(), Duration::from_secs(1), 3).await;
        assert!(matches!(result, Err(ReaderError::Offline(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_stops_immediately() {
        let source = Scripted::new(vec![
            DownloadStatus::Failed("disk full".into()),
            DownloadStatus::Downloaded,
        ]);
        let result = wait_until_ready(&source, &"b".into(), Duration::from_secs(1), 5).await;
        assert_eq!(
            result,
            Err(ReaderError::Offline("download of b failed: disk full".into()))
        );
        assert_eq!(source.remaining(), 1);
    }

    #[tokio::test]
    async fn test_disk_downloads_status() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path().join("store")));
        let cache = PageCache::new(dir.path().join("pages"), 10);
        let downloads = DiskDownloads::new(Arc::clone(&store), cache.clone());
        let id = PublicationId::from("b");

        assert_eq!(downloads.status(&id).await, DownloadStatus::NotDownloaded);

        store.write_pages(&id, &[BookPage::new(1), BookPage::new(2)]).unwrap();
        cache.write(&PageIdentity::new("b", 1), b"bytes").await.unwrap();
        assert_eq!(downloads.status(&id).await, DownloadStatus::Pending { progress: 0.5 });

        cache.write(&PageIdentity::new("b", 2), b"bytes").await.unwrap();
        assert_eq!(downloads.status(&id).await, DownloadStatus::Downloaded);
    }
}
