//! Collaborators the reader engine talks to: page listings, image bytes,
//! progress submission and offline download status. The engine only sees
//! these traits; `komga`, `store` and `cache` provide the concrete versions.

pub mod cache;
pub mod komga;
pub mod offline;
pub mod store;

use async_trait::async_trait;

use crate::error::{Missing, ReaderError, Result};
use crate::reader::page::{BookPage, PageIdentity, Publication, PublicationId};
use crate::reader::progress::{PendingProgress, ProgressionLocator};
use crate::reader::text::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sibling {
    Previous,
    Next,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_publication(&self, id: &PublicationId) -> Result<Publication>;

    async fn fetch_pages(&self, id: &PublicationId) -> Result<Vec<BookPage>>;

    async fn fetch_manifest(&self, id: &PublicationId) -> Result<Manifest>;

    /// The publication read before or after `id`, if there is one.
    async fn fetch_sibling(&self, id: &PublicationId, which: Sibling) -> Result<Option<Publication>>;

    /// Markup of one resource of a text publication.
    async fn fetch_resource(&self, id: &PublicationId, href: &str) -> Result<String> {
        Err(ReaderError::NotFound(Missing::Resource(format!("{id}/{href}"))))
    }

    /// The last position saved on the server for a text publication.
    async fn fetch_progression(&self, _id: &PublicationId) -> Result<Option<ProgressionLocator>> {
        Ok(None)
    }
}

#[async_trait]
pub trait ImageByteSource: Send + Sync {
    fn page_url(&self, page: &PageIdentity) -> String;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn submit_page_progress(&self, id: &PublicationId, page: u32, completed: bool) -> Result<()>;

    async fn submit_progression(&self, id: &PublicationId, locator: &ProgressionLocator) -> Result<()>;
}

/// Durable queue for progress recorded while offline.
#[async_trait]
pub trait PendingProgressQueue: Send + Sync {
    async fn enqueue(&self, pending: PendingProgress) -> Result<()>;

    /// Removes and returns everything queued, oldest first.
    async fn drain(&self) -> Result<Vec<PendingProgress>>;

    /// Puts back an entry that failed to send, unless a newer one for the
    /// same publication was queued in the meantime.
    async fn requeue(&self, pending: PendingProgress) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStatus {
    NotDownloaded,
    Pending { progress: f64 },
    Downloaded,
    Failed(String),
}

#[async_trait]
pub trait DownloadStatusSource: Send + Sync {
    async fn status(&self, id: &PublicationId) -> DownloadStatus;
}
