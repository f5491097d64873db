//! Best-effort reading progress reporting.
//!
//! Page changes are rate limited from the last successful send, with the
//! newest unsent position delivered once the interval runs out. End of book
//! and `flush` go out immediately. Nothing is sent in incognito mode or
//! without a publication, and sink failures never reach the reader.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::page::PublicationId;
use crate::backend::{PendingProgressQueue, ProgressSink};
use crate::config::OfflineFlag;
use crate::error::{ReaderError, Result};

/// Position inside a reflowable publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionLocator {
    pub href: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub title: Option<String>,
    pub chapter_progression: f64,
    pub total_progression: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProgressUpdate {
    Page { page: u32, completed: bool },
    Locator(ProgressionLocator),
}

/// An update that could not be sent while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingProgress {
    pub publication: PublicationId,
    pub update: ProgressUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    /// Held back by the throttle; will go out when the interval elapses.
    Deferred,
    Queued,
    Suppressed,
    Failed,
}

#[derive(Default)]
struct GateState {
    publication: PublicationId,
    incognito: bool,
    last_sent: Option<Instant>,
    last_known: Option<ProgressUpdate>,
    pending: Option<ProgressUpdate>,
    trailing: Option<AbortHandle>,
    trailing_generation: u64,
}

impl GateState {
    fn suppressed(&self) -> bool {
        self.incognito || self.publication.is_empty()
    }

    fn cancel_trailing(&mut self) {
        if let Some(handle) = self.trailing.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct ProgressDispatchGate {
    state: Arc<Mutex<GateState>>,
    sink: Arc<dyn ProgressSink>,
    queue: Option<Arc<dyn PendingProgressQueue>>,
    wake: Option<mpsc::UnboundedSender<u64>>,
    offline: OfflineFlag,
    interval: Duration,
}

impl ProgressDispatchGate {
    pub fn new(sink: Arc<dyn ProgressSink>, interval: Duration, offline: OfflineFlag) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::default())),
            sink,
            queue: None,
            wake: None,
            offline,
            interval,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn PendingProgressQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Delivers trailing sends as generations on `wake` instead of sending
    /// from the timer task. The owner passes each one to
    /// [`send_trailing`](Self::send_trailing) so trailing sends stay ordered
    /// with its other calls.
    pub fn with_trailing_wake(mut self, wake: mpsc::UnboundedSender<u64>) -> Self {
        self.wake = Some(wake);
        self
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switches to another publication, dropping any unsent position of the
    /// previous one. Call [`flush`](Self::flush) first to keep it.
    pub fn set_publication(&self, id: PublicationId) {
        let mut state = self.lock();
        state.cancel_trailing();
        state.publication = id;
        state.last_sent = None;
        state.last_known = None;
        state.pending = None;
    }

    pub fn set_incognito(&self, incognito: bool) {
        let mut state = self.lock();
        state.incognito = incognito;
        if incognito {
            state.cancel_trailing();
            state.pending = None;
        }
    }

    pub fn publication(&self) -> PublicationId {
        self.lock().publication.clone()
    }

    /// Records a new reading position and sends it if the throttle allows.
    pub async fn page_changed(&self, update: ProgressUpdate) -> Dispatch {
        let publication = {
            let mut state = self.lock();
            if state.suppressed() {
                return Dispatch::Suppressed;
            }
            state.last_known = Some(update.clone());

            let throttled = state
                .last_sent
                .is_some_and(|sent| sent.elapsed() < self.interval);
            if throttled {
                debug!("progress throttled for {}", state.publication);
                state.pending = Some(update);
                if state.trailing.is_none() {
                    let deadline = state.last_sent.map_or_else(Instant::now, |sent| sent + self.interval);
                    state.trailing_generation += 1;
                    let generation = state.trailing_generation;
                    let gate = self.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep_until(deadline).await;
                        match &gate.wake {
                            Some(wake) => {
                                let _ = wake.send(generation);
                            }
                            None => {
                                gate.send_trailing(generation).await;
                            }
                        }
                    });
                    state.trailing = Some(handle.abort_handle());
                }
                return Dispatch::Deferred;
            }
            state.cancel_trailing();
            state.pending = None;
            state.publication.clone()
        };
        self.dispatch(&publication, update).await
    }

    /// Sends the newest throttled position. A `generation` whose trailing
    /// send was cancelled or already superseded is ignored.
    pub async fn send_trailing(&self, generation: u64) -> Dispatch {
        let (publication, update) = {
            let mut state = self.lock();
            if state.trailing.is_none() || state.trailing_generation != generation {
                return Dispatch::Suppressed;
            }
            state.trailing = None;
            if state.suppressed() {
                return Dispatch::Suppressed;
            }
            match state.pending.take() {
                Some(update) => (state.publication.clone(), update),
                None => return Dispatch::Suppressed,
            }
        };
        self.dispatch(&publication, update).await
    }

    /// Sends `update` immediately, bypassing the throttle.
    pub async fn end_of_book(&self, update: ProgressUpdate) -> Dispatch {
        let publication = {
            let mut state = self.lock();
            if state.suppressed() {
                return Dispatch::Suppressed;
            }
            state.cancel_trailing();
            state.pending = None;
            state.last_known = Some(update.clone());
            state.publication.clone()
        };
        info!("reached end of {}", publication);
        self.dispatch(&publication, update).await
    }

    /// Sends the last known position regardless of the throttle.
    pub async fn flush(&self) -> Dispatch {
        let (publication, update) = {
            let mut state = self.lock();
            if state.suppressed() {
                return Dispatch::Suppressed;
            }
            state.cancel_trailing();
            state.pending = None;
            match state.last_known.clone() {
                Some(update) => (state.publication.clone(), update),
                None => return Dispatch::Suppressed,
            }
        };
        self.dispatch(&publication, update).await
    }

    async fn dispatch(&self, publication: &PublicationId, update: ProgressUpdate) -> Dispatch {
        if self.offline.is_offline() {
            return self.enqueue(publication, update).await;
        }

        match submit(self.sink.as_ref(), publication, &update).await {
            Ok(()) => {
                debug!("progress sent for {}: {:?}", publication, update);
                let mut state = self.lock();
                if &state.publication == publication {
                    state.last_sent = Some(Instant::now());
                }
                Dispatch::Sent
            }
            Err(ReaderError::Offline(reason)) => {
                debug!("progress for {} deferred, offline: {}", publication, reason);
                self.enqueue(publication, update).await
            }
            Err(e) => {
                warn!("failed to send progress for {}: {}", publication, e);
                Dispatch::Failed
            }
        }
    }

    async fn enqueue(&self, publication: &PublicationId, update: ProgressUpdate) -> Dispatch {
        let Some(queue) = &self.queue else {
            debug!("offline and no queue, dropping progress for {}", publication);
            return Dispatch::Failed;
        };
        let pending = PendingProgress {
            publication: publication.clone(),
            update,
        };
        match queue.enqueue(pending).await {
            Ok(()) => Dispatch::Queued,
            Err(e) => {
                warn!("failed to queue progress for {}: {}", publication, e);
                Dispatch::Failed
            }
        }
    }

    /// Replays progress queued while offline. Entries that fail again are
    /// queued back unless something newer for that publication arrived in
    /// the meantime. Returns how many were delivered.
    pub async fn drain_offline_queue(&self) -> usize {
        let Some(queue) = &self.queue else {
            return 0;
        };
        if self.offline.is_offline() {
            return 0;
        }
        let pending = match queue.drain().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("failed to read queued progress: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for item in pending {
            match submit(self.sink.as_ref(), &item.publication, &item.update).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("queued progress for {} still failing: {}", item.publication, e);
                    if let Err(e) = queue.requeue(item).await {
                        warn!("dropping queued progress: {}", e);
                    }
                }
            }
        }
        if delivered > 0 {
            info!("delivered {} queued progress updates", delivered);
        }
        delivered
    }
}

async fn submit(sink: &dyn ProgressSink, publication: &PublicationId, update: &ProgressUpdate) -> Result<()> {
    match update {
        ProgressUpdate::Page { page, completed } => sink.submit_page_progress(publication, *page, *completed).await,
        ProgressUpdate::Locator(locator) => sink.submit_progression(publication, locator).await,
    }
}
