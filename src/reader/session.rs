//! The reading session: every piece of mutable reader state in one place.
//!
//! All mutation goes through `ReaderSession` methods on the event loop. Each
//! structural change regenerates the view items, and the current position is
//! held as a page identity so it survives segments being added in front.

use log::{debug, info, warn};
use std::collections::BTreeSet;

use super::page::{PageIdentity, Publication, PublicationId, ReaderPage, Segment};
use super::progress::ProgressUpdate;
use super::progression::{self, Progression};
use super::segments::SegmentStore;
use super::view_items::{IsolateSets, LayoutPolicy, PageVirtualizer, ViewItem};
use crate::backend::store::LocalStore;
use crate::backend::{PageSource, Sibling};
use crate::config::OfflineFlag;
use crate::error::{ReaderError, Result};

/// How close to a segment edge (in view items) a sibling gets prefetched.
const SIBLING_PREFETCH_DISTANCE: usize = 2;

/// Global indices whose decoded images stay cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepWindow {
    pub current: usize,
    pub before: usize,
    pub after: usize,
}

impl KeepWindow {
    pub fn contains(&self, global: usize) -> bool {
        global + self.before >= self.current && global <= self.current + self.after
    }
}

pub struct ReaderSession {
    store: SegmentStore,
    isolated: IsolateSets,
    policy: LayoutPolicy,
    dual_page_active: bool,
    virtualizer: PageVirtualizer,
    current_page: Option<PageIdentity>,
    current_item: usize,
    keep_before: usize,
    keep_after: usize,
}

impl ReaderSession {
    pub fn new(policy: LayoutPolicy, dual_page_active: bool) -> Self {
        Self {
            store: SegmentStore::new(),
            isolated: IsolateSets::new(),
            policy,
            dual_page_active,
            virtualizer: PageVirtualizer::new(),
            current_page: None,
            current_item: 0,
            keep_before: 3,
            keep_after: 5,
        }
    }

    pub fn with_keep_window(mut self, before: usize, after: usize) -> Self {
        self.keep_before = before;
        self.keep_after = after;
        self
    }

    pub fn with_isolated(mut self, isolated: IsolateSets) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn items(&self) -> &[ViewItem] {
        self.virtualizer.items()
    }

    pub fn items_version(&self) -> u64 {
        self.virtualizer.version()
    }

    pub fn isolated(&self) -> &IsolateSets {
        &self.isolated
    }

    pub fn policy(&self) -> LayoutPolicy {
        self.policy
    }

    pub fn dual_page_active(&self) -> bool {
        self.dual_page_active
    }

    pub fn current_item_index(&self) -> usize {
        self.current_item
    }

    pub fn current_view_item(&self) -> Option<&ViewItem> {
        self.virtualizer.item(self.current_item)
    }

    pub fn current_page(&self) -> Option<&PageIdentity> {
        self.current_page.as_ref()
    }

    pub fn current_global_index(&self) -> Option<usize> {
        self.store.global_index_of(self.current_page.as_ref()?)
    }

    pub fn current_publication(&self) -> Option<&Publication> {
        let id = &self.current_page.as_ref()?.publication;
        self.store.segment_for_publication(id).map(|s| &s.publication)
    }

    pub fn is_at_end(&self) -> bool {
        self.current_view_item().is_some_and(ViewItem::is_end)
    }

    /// Replaces the session with `segment` and moves to `start_page` (a server
    /// page number) or the first page.
    pub fn load_publication(&mut self, segment: Segment, start_page: Option<u32>) {
        info!("opening {} ({} pages)", segment.id(), segment.pages.len());
        let publication = segment.id().clone();
        self.store.replace_all(vec![segment]);
        self.current_page = None;
        self.current_item = 0;
        self.regenerate();

        let start = start_page
            .map(|n| PageIdentity::new(publication.clone(), n))
            .filter(|id| self.store.global_index_of(id).is_some())
            .or_else(|| {
                let range = self.store.page_range_of(&publication)?;
                self.store.page_at(range.start).map(|p| p.id.clone())
            });
        match start {
            Some(id) => {
                self.navigate_to_page(&id);
            }
            None => self.navigate_to_view_item(0),
        }
    }

    pub fn append_sibling(&mut self, segment: Segment) -> bool {
        let added = self.store.append(segment);
        if added {
            self.regenerate();
        }
        added
    }

    pub fn prepend_sibling(&mut self, segment: Segment) -> bool {
        let added = self.store.prepend(segment);
        if added {
            self.regenerate();
        }
        added
    }

    pub fn set_layout(&mut self, policy: LayoutPolicy) {
        if self.policy != policy {
            self.policy = policy;
            self.regenerate();
        }
    }

    pub fn set_dual_page_active(&mut self, active: bool) {
        if self.dual_page_active != active {
            self.dual_page_active = active;
            self.regenerate();
        }
    }

    /// Flips whether `id` is kept out of spreads and splits. Returns the new
    /// state, or `None` for a page outside the session.
    pub fn toggle_isolate(&mut self, id: &PageIdentity) -> Option<bool> {
        let global = self.store.global_index_of(id)?;
        let range = self.store.page_range_of(&id.publication)?;
        let local = global - range.start;

        let set = self.isolated.entry(id.publication.clone()).or_default();
        let isolated = if set.remove(&local) {
            false
        } else {
            set.insert(local);
            true
        };
        if set.is_empty() {
            self.isolated.remove(&id.publication);
        }
        debug!("page {} isolated: {}", id, isolated);
        self.regenerate();
        Some(isolated)
    }

    pub fn isolated_pages(&self, id: &PublicationId) -> BTreeSet<usize> {
        self.isolated.get(id).cloned().unwrap_or_default()
    }

    fn regenerate(&mut self) {
        let at_end = match self.virtualizer.item(self.current_item) {
            Some(ViewItem::End(publication)) => Some(publication.clone()),
            _ => None,
        };
        let changed = self
            .virtualizer
            .rebuild(&self.store, &self.isolated, self.policy, self.dual_page_active);
        if changed {
            debug!(
                "view items rebuilt: {} items (version {})",
                self.virtualizer.len(),
                self.virtualizer.version()
            );
        }
        let end_item = at_end.and_then(|publication| {
            self.virtualizer
                .items()
                .iter()
                .position(|item| matches!(item, ViewItem::End(p) if *p == publication))
        });
        self.current_item = match (end_item, &self.current_page) {
            (Some(index), _) => index,
            (None, Some(page)) => self.virtualizer.view_item_index_for_page(page, &self.store),
            (None, None) => 0,
        };
    }

    /// Moves to a view item (clamped). An end marker keeps the last page of
    /// its segment as the current page.
    pub fn navigate_to_view_item(&mut self, index: usize) {
        if self.virtualizer.is_empty() {
            self.current_item = 0;
            return;
        }
        self.current_item = index.min(self.virtualizer.len() - 1);
        if let Some(page) = self.virtualizer.page_index_for_view_item(self.current_item, &self.store) {
            self.current_page = Some(page);
        }
    }

    pub fn navigate_to_page(&mut self, id: &PageIdentity) -> bool {
        if self.store.global_index_of(id).is_none() {
            debug!("page {} is not in the session", id);
            return false;
        }
        self.current_page = Some(id.clone());
        self.current_item = self.virtualizer.view_item_index_for_page(id, &self.store);
        true
    }

    pub fn navigate_to_global(&mut self, global: usize) -> bool {
        match self.store.page_at(global).map(|p| p.id.clone()) {
            Some(id) => self.navigate_to_page(&id),
            None => false,
        }
    }

    pub fn next_view_item(&mut self) -> bool {
        if self.current_item + 1 >= self.virtualizer.len() {
            return false;
        }
        self.navigate_to_view_item(self.current_item + 1);
        true
    }

    pub fn previous_view_item(&mut self) -> bool {
        if self.current_item == 0 {
            return false;
        }
        self.navigate_to_view_item(self.current_item - 1);
        true
    }

    /// Progress through the current publication. Image publications are a
    /// single chapter, so both values match.
    pub fn progression(&self) -> Option<Progression> {
        let page = self.current_page.as_ref()?;
        let global = self.store.global_index_of(page)?;
        let range = self.store.page_range_of(&page.publication)?;
        let local = global - range.start;
        Some(progression::progression(0, local, &[range.len()], None))
    }

    pub fn page_progress_update(&self) -> Option<(PublicationId, ProgressUpdate)> {
        let page = self.current_page.as_ref()?;
        let global = self.store.global_index_of(page)?;
        let range = self.store.page_range_of(&page.publication)?;
        let update = ProgressUpdate::Page {
            page: page.number,
            completed: global + 1 == range.end,
        };
        Some((page.publication.clone(), update))
    }

    /// Completion update for the segment whose end marker is current.
    pub fn end_of_book_update(&self) -> Option<(PublicationId, ProgressUpdate)> {
        let ViewItem::End(publication) = self.current_view_item()? else {
            return None;
        };
        let segment = self.store.segment_for_publication(publication)?;
        let last = segment.pages.last()?;
        let update = ProgressUpdate::Page {
            page: last.number,
            completed: true,
        };
        Some((publication.clone(), update))
    }

    pub fn keep_window(&self) -> Option<KeepWindow> {
        Some(KeepWindow {
            current: self.current_global_index()?,
            before: self.keep_before,
            after: self.keep_after,
        })
    }

    /// Pages around the current one, nearest first, the current page included.
    pub fn preload_pages(&self, before: usize, after: usize) -> Vec<ReaderPage> {
        let Some(current) = self.current_global_index() else {
            return Vec::new();
        };
        let mut order = vec![current];
        for distance in 1..=before.max(after) {
            if distance <= after {
                order.push(current + distance);
            }
            if distance <= before && distance <= current {
                order.push(current - distance);
            }
        }
        order
            .into_iter()
            .filter_map(|g| self.store.page_at(g).cloned())
            .collect()
    }

    /// A sibling worth loading because the reader is close to that edge of
    /// the session and it is not loaded yet.
    pub fn sibling_to_prefetch(&self) -> Option<(Sibling, Publication)> {
        let segments = self.store.segments();
        let (first, last) = (segments.first()?, segments.last()?);

        let near_end = self.current_item + SIBLING_PREFETCH_DISTANCE + 1 >= self.virtualizer.len();
        if near_end {
            if let Some(next) = last.next.as_ref().filter(|p| !self.store.contains_publication(&p.id)) {
                return Some((Sibling::Next, next.clone()));
            }
        }
        if self.current_item <= SIBLING_PREFETCH_DISTANCE {
            if let Some(prev) = first.previous.as_ref().filter(|p| !self.store.contains_publication(&p.id)) {
                return Some((Sibling::Previous, prev.clone()));
            }
        }
        None
    }
}

/// Loads the pages of `publication`: durable copy first, then the server
/// (persisting what it returns). Sibling references are looked up online only.
pub async fn fetch_segment(
    source: &dyn PageSource,
    store: &LocalStore,
    offline: &OfflineFlag,
    publication: Publication,
) -> Result<Segment> {
    let pages = match store.read_pages(&publication.id) {
        Some(pages) => {
            debug!("using stored pages for {}", publication.id);
            pages
        }
        None if offline.is_offline() => {
            return Err(ReaderError::Offline(format!("pages of {} are not downloaded", publication.id)));
        }
        None => {
            let pages = source.fetch_pages(&publication.id).await?;
            if let Err(e) = store.write_pages(&publication.id, &pages) {
                warn!("failed to store pages of {}: {}", publication.id, e);
            }
            pages
        }
    };

    let segment = Segment::new(publication, pages);
    if offline.is_offline() {
        return Ok(segment);
    }
    let id = segment.id().clone();
    let previous = sibling(source, &id, Sibling::Previous).await;
    let next = sibling(source, &id, Sibling::Next).await;
    Ok(segment.with_siblings(previous, next))
}

async fn sibling(source: &dyn PageSource, id: &PublicationId, which: Sibling) -> Option<Publication> {
    match source.fetch_sibling(id, which).await {
        Ok(sibling) => sibling,
        Err(ReaderError::NotFound(_)) => None,
        Err(e) => {
            warn!("failed to look up {:?} sibling of {}: {}", which, id, e);
            None
        }
    }
}
