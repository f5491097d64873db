//! Decoded page images kept around the reading position.
//!
//! Lookups go memory → in-flight fetch → disk bytes → network. Only one fetch
//! per page identity is ever outstanding; everything else joins it.

use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::page::{PageIdentity, ReaderPage};
use super::segments::SegmentStore;
use super::single_flight::SingleFlight;
use crate::backend::ImageByteSource;
use crate::backend::cache::PageCache;
use crate::config::OfflineFlag;
use crate::error::{ReaderError, Result};

#[derive(Debug, Clone)]
pub struct CachedImage {
    pub image: Arc<DynamicImage>,
    pub is_animated: bool,
    /// Local file to hand to an animated player.
    pub playback_path: Option<PathBuf>,
}

impl CachedImage {
    fn approx_bytes(&self) -> u64 {
        self.image.width() as u64 * self.image.height() as u64 * 4
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<PageIdentity, CachedImage>,
    animated: HashMap<PageIdentity, bool>,
    /// Pages of the last keep window; `None` until the first eviction.
    window: Option<HashSet<PageIdentity>>,
}

#[derive(Clone)]
pub struct ImageFetchCache {
    inner: Arc<RwLock<CacheInner>>,
    flights: SingleFlight<PageIdentity, CachedImage>,
    source: Arc<dyn ImageByteSource>,
    disk: PageCache,
    offline: OfflineFlag,
}

impl ImageFetchCache {
    pub fn new(source: Arc<dyn ImageByteSource>, disk: PageCache, offline: OfflineFlag) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            flights: SingleFlight::new(),
            source,
            disk,
            offline,
        }
    }

    /// Cached entry without triggering a fetch.
    pub async fn cached(&self, id: &PageIdentity) -> Option<CachedImage> {
        self.inner.read().await.entries.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_fetching(&self, id: &PageIdentity) -> bool {
        self.flights.is_in_flight(id)
    }

    /// Decoded image for `page`, or `None` when it cannot be produced right now.
    pub async fn get_or_fetch(&self, page: &ReaderPage) -> Option<CachedImage> {
        match self.try_get_or_fetch(page).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("page {} unavailable: {}", page.id, e);
                None
            }
        }
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch) but keeps the reason for a
    /// failure so the page can show the matching error state.
    pub async fn try_get_or_fetch(&self, page: &ReaderPage) -> Result<CachedImage> {
        if let Some(hit) = self.cached(&page.id).await {
            return Ok(hit);
        }

        let loader = PageLoader {
            inner: Arc::clone(&self.inner),
            source: Arc::clone(&self.source),
            disk: self.disk.clone(),
            offline: self.offline.clone(),
            page: page.clone(),
        };
        self.flights.run(page.id.clone(), move || loader.load()).await
    }

    /// Fetches every page in `pages`, concurrently, ignoring failures.
    pub async fn preload(&self, pages: &[ReaderPage]) {
        let loads = pages.iter().map(|page| self.get_or_fetch(page));
        futures::future::join_all(loads).await;
    }

    /// `Some(flag)` once the page has been decoded at least once.
    pub async fn is_animated(&self, id: &PageIdentity) -> Option<bool> {
        self.inner.read().await.animated.get(id).copied()
    }

    pub async fn animated_playback_path(&self, id: &PageIdentity) -> Option<PathBuf> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(id)
            .filter(|e| e.is_animated)
            .and_then(|e| e.playback_path.clone())
    }

    /// Drops every entry whose page is outside
    /// `[current - keep_before, current + keep_after]` or no longer part of
    /// the session. Loads finishing later are only cached if their page is
    /// inside this window. Returns the number of evicted entries.
    pub async fn evict_outside_window(
        &self,
        current: usize,
        keep_before: usize,
        keep_after: usize,
        store: &SegmentStore,
    ) -> usize {
        let low = current.saturating_sub(keep_before);
        let high = current.saturating_add(keep_after);

        let window: HashSet<PageIdentity> = (low..=high.min(store.len().saturating_sub(1)))
            .filter_map(|g| store.page_at(g))
            .map(|page| page.id.clone())
            .collect();

        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|id, _| window.contains(id));
        inner.animated.retain(|id, _| window.contains(id));
        let evicted = before - inner.entries.len();
        inner.window = Some(window);

        let total_bytes: u64 = inner.entries.values().map(CachedImage::approx_bytes).sum();
        debug!(
            "memory cache: {} images, approx. {:.2} MB ({} evicted)",
            inner.entries.len(),
            total_bytes as f64 / 1024.0 / 1024.0,
            evicted
        );
        evicted
    }

    pub fn cancel(&self, id: &PageIdentity) -> bool {
        self.flights.cancel(id)
    }

    pub async fn clear(&self) {
        self.flights.cancel_all();
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.animated.clear();
        inner.window = None;
        debug!("cleared image cache and cancelled fetches");
    }
}

/// Everything one fetch needs, owned so it can run on its own task.
struct PageLoader {
    inner: Arc<RwLock<CacheInner>>,
    source: Arc<dyn ImageByteSource>,
    disk: PageCache,
    offline: OfflineFlag,
    page: ReaderPage,
}

impl PageLoader {
    async fn load(self) -> Result<CachedImage> {
        let id = self.page.id.clone();

        // An earlier flight may have finished between the caller's lookup and
        // this one starting.
        if let Some(hit) = self.inner.read().await.entries.get(&id).cloned() {
            return Ok(hit);
        }

        let bytes = match self.disk.read(&id).await {
            Some(bytes) => bytes,
            None => {
                if self.offline.is_offline() {
                    return Err(ReaderError::Offline(format!("page {id} is not available offline")));
                }
                let url = self.source.page_url(&id);
                info!("downloading page {}", id);
                let bytes = self.source.fetch_bytes(&url).await?;
                info!("downloaded page {} ({} KiB)", id, bytes.len() / 1024);
                if let Err(e) = self.disk.write(&id, &bytes).await {
                    warn!("failed to persist page {}: {}", id, e);
                }
                bytes
            }
        };

        let candidate = self.page.page.is_animated_candidate();
        let (image, is_animated) = tokio::task::spawn_blocking(move || decode_page(&bytes, candidate))
            .await
            .map_err(|e| ReaderError::DecodeFailure(e.to_string()))??;

        let entry = CachedImage {
            image: Arc::new(image),
            is_animated,
            playback_path: is_animated.then(|| self.disk.path_for(&id)),
        };

        let mut inner = self.inner.write().await;
        if inner.window.as_ref().is_some_and(|window| !window.contains(&id)) {
            debug!("page {} left the keep window while loading", id);
            return Ok(entry);
        }
        inner.animated.insert(id.clone(), is_animated);
        inner.entries.insert(id, entry.clone());
        Ok(entry)
    }
}

fn decode_page(bytes: &[u8], animated_candidate: bool) -> Result<(DynamicImage, bool)> {
    let image = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    let is_animated = animated_candidate && has_multiple_frames(bytes);
    Ok((image, is_animated))
}

fn has_multiple_frames(bytes: &[u8]) -> bool {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Gif) => GifDecoder::new(Cursor::new(bytes))
            .map(|d| d.into_frames().take(2).count() > 1)
            .unwrap_or(false),
        Ok(ImageFormat::WebP) => WebPDecoder::new(Cursor::new(bytes))
            .map(|d| d.has_animation())
            .unwrap_or(false),
        Ok(ImageFormat::Png) => PngDecoder::new(Cursor::new(bytes))
            .and_then(|d| d.is_apng())
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reader::page::BookPage;
    use crate::reader::segments::tests::segment;
    use async_trait::async_trait;
    use image::{ImageBuffer, Rgba};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    pub(crate) fn png_bytes() -> Vec<u8> {
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 6, Rgba([200, 10, 10, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub fetches: AtomicUsize,
        pub fail: std::sync::atomic::AtomicBool,
        pub corrupt: bool,
    }

    #[async_trait]
    impl ImageByteSource for FakeSource {
        fn page_url(&self, page: &PageIdentity) -> String {
            format!("mem://{}/{}", page.publication, page.number)
        }

        async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(ReaderError::RemoteFailure("503".into()));
            }
            if self.corrupt {
                return Ok(b"not an image".to_vec());
            }
            Ok(png_bytes())
        }
    }

    fn cache_with(source: Arc<FakeSource>, offline: bool) -> (ImageFetchCache, TempDir) {
        let dir = tempdir().unwrap();
        let disk = PageCache::new(dir.path().to_path_buf(), 10);
        (ImageFetchCache::new(source, disk, OfflineFlag::new(offline)), dir)
    }

    fn reader_page(book: &str, n: u32) -> ReaderPage {
        ReaderPage {
            id: PageIdentity::new(book, n),
            page: BookPage::new(n),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_fetch_once() {
        let source = Arc::new(FakeSource::default());
        let (cache, _dir) = cache_with(Arc::clone(&source), false);
        let page = reader_page("b", 1);

        let calls = (0..6).map(|_| cache.get_or_fetch(&page));
        let results = futures::future::join_all(calls).await;

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(&result.as_ref().unwrap().image, &first.image));
        }
        assert!(!cache.is_fetching(&page.id));
        assert_eq!(cache.is_animated(&page.id).await, Some(false));
    }

    #[tokio::test]
    async fn test_failure_is_not_sticky() {
        let source = Arc::new(FakeSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let (cache, _dir) = cache_with(Arc::clone(&source), false);
        let page = reader_page("b", 2);

        assert!(cache.get_or_fetch(&page).await.is_none());
        assert!(!cache.is_fetching(&page.id));

        source.fail.store(false, Ordering::SeqCst);
        assert!(cache.get_or_fetch(&page).await.is_some());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offline_without_disk_copy_skips_network() {
        let source = Arc::new(FakeSource::default());
        let (cache, _dir) = cache_with(Arc::clone(&source), true);
        let result = cache.try_get_or_fetch(&reader_page("b", 1)).await;
        assert!(matches!(result, Err(ReaderError::Offline(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_offline_uses_disk_copy() {
        let source = Arc::new(FakeSource::default());
        let dir = tempdir().unwrap();
        let disk = PageCache::new(dir.path().to_path_buf(), 10);
        let page = reader_page("b", 1);
        disk.write(&page.id, &png_bytes()).await.unwrap();

        let cache = ImageFetchCache::new(source.clone(), disk, OfflineFlag::new(true));
        assert!(cache.get_or_fetch(&page).await.is_some());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported() {
        let source = Arc::new(FakeSource {
            corrupt: true,
            ..FakeSource::default()
        });
        let (cache, _dir) = cache_with(source, false);
        let result = cache.try_get_or_fetch(&reader_page("b", 1)).await;
        assert!(matches!(result, Err(ReaderError::DecodeFailure(_))));
    }

    #[tokio::test]
    async fn test_eviction_window() {
        let source = Arc::new(FakeSource::default());
        let (cache, _dir) = cache_with(source, false);
        let mut store = SegmentStore::new();
        store.replace_all(vec![segment("b", 10)]);

        let pages: Vec<ReaderPage> = store.reader_pages().to_vec();
        cache.preload(&pages).await;
        assert_eq!(cache.len().await, 10);

        let (current, before, after) = (5, 1, 2);
        let evicted = cache.evict_outside_window(current, before, after, &store).await;
        assert_eq!(evicted, 6);
        for page in &pages {
            let global = store.global_index_of(&page.id).unwrap();
            let kept = cache.cached(&page.id).await.is_some();
            assert_eq!(kept, global + before >= current && global <= current + after);
        }
    }

    #[tokio::test]
    async fn test_eviction_forgets_animation_flags() {
        let source = Arc::new(FakeSource::default());
        let (cache, _dir) = cache_with(source, false);
        let mut store = SegmentStore::new();
        store.replace_all(vec![segment("b", 6)]);
        cache.preload(store.reader_pages()).await;

        cache.evict_outside_window(0, 0, 1, &store).await;
        let first = store.page_at(0).unwrap().id.clone();
        let last = store.page_at(5).unwrap().id.clone();
        assert_eq!(cache.is_animated(&first).await, Some(false));
        assert_eq!(cache.is_animated(&last).await, None);
    }

    #[tokio::test]
    async fn test_load_finishing_outside_window_is_not_cached() {
        let source = Arc::new(FakeSource::default());
        let (cache, _dir) = cache_with(Arc::clone(&source), false);
        let mut store = SegmentStore::new();
        store.replace_all(vec![segment("b", 10)]);
        cache.evict_outside_window(0, 0, 1, &store).await;

        let far = store.page_at(8).unwrap().clone();
        let near = store.page_at(1).unwrap().clone();
        assert!(cache.get_or_fetch(&far).await.is_some());
        assert!(cache.get_or_fetch(&near).await.is_some());

        assert!(cache.cached(&far.id).await.is_none());
        assert!(cache.cached(&near.id).await.is_some());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_pages_leaving_the_session_are_evicted() {
        let source = Arc::new(FakeSource::default());
        let (cache, _dir) = cache_with(source, false);
        let mut store = SegmentStore::new();
        store.replace_all(vec![segment("a", 2)]);
        cache.preload(store.reader_pages()).await;

        store.replace_all(vec![segment("z", 2)]);
        assert_eq!(cache.evict_outside_window(0, 5, 5, &store).await, 2);
    }
}
