//! Continuous vertical layout for long-strip reading.
//!
//! Content items are laid out top to bottom with heights derived from page
//! aspect ratios. Rebuilding the list keeps the reader's place: whatever was
//! `n` units into view before a reload is `n` units into view after it.

use log::debug;
use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use super::page::{PageIdentity, PublicationId};
use super::segments::SegmentStore;

/// Distance past the viewport bottom an item may reach and still count as read.
const CURRENT_ITEM_THRESHOLD: f64 = 8.0;

/// Height ratio used for pages whose dimensions the server did not report.
const DEFAULT_ASPECT_RATIO: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentItem {
    Page(PageIdentity),
    End(PublicationId),
}

/// Position of the viewport top relative to one item, captured before a reload.
#[derive(Debug, Clone, PartialEq)]
struct Anchor {
    item: ContentItem,
    index: usize,
    offset: f64,
}

/// Ticket for one delayed initial-scroll attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTicket {
    pub generation: u64,
    pub attempt: u32,
}

/// Bounded retry state: each `begin` starts a new generation, which turns
/// every ticket handed out before it into a stale one.
#[derive(Debug, Clone)]
pub struct InitialScrollRetrier {
    max_retries: u32,
    delay: Duration,
    attempts: u32,
    generation: u64,
}

impl InitialScrollRetrier {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            attempts: 0,
            generation: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.attempts = 0;
        self.generation
    }

    /// Next ticket, or `None` once the retry budget is spent.
    pub fn schedule(&mut self) -> Option<RetryTicket> {
        if self.attempts >= self.max_retries {
            return None;
        }
        self.attempts += 1;
        Some(RetryTicket {
            generation: self.generation,
            attempt: self.attempts,
        })
    }

    pub fn is_current(&self, ticket: &RetryTicket) -> bool {
        ticket.generation == self.generation
    }

    /// Invalidates outstanding tickets. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.attempts = self.max_retries;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAttempt {
    Done,
    /// Layout is not measured yet; deliver the ticket again after the delay.
    Retry(RetryTicket),
    /// Superseded by a newer attempt.
    Stale,
    GaveUp,
}

pub struct ScrollContentEngine {
    items: Vec<ContentItem>,
    index_by_item: HashMap<ContentItem, usize>,
    tops: Vec<f64>,
    heights: Vec<f64>,
    measured: HashMap<PageIdentity, f64>,
    width: f64,
    viewport_height: f64,
    scroll_top: f64,
    end_height: f64,
    built_pages_version: Option<u64>,
    layout_dirty: bool,
    version: u64,
    retrier: InitialScrollRetrier,
    pending_target: Option<PageIdentity>,
}

impl ScrollContentEngine {
    pub fn new(end_height: f64, retrier: InitialScrollRetrier) -> Self {
        Self {
            items: Vec::new(),
            index_by_item: HashMap::new(),
            tops: Vec::new(),
            heights: Vec::new(),
            measured: HashMap::new(),
            width: 0.0,
            viewport_height: 0.0,
            scroll_top: 0.0,
            end_height,
            built_pages_version: None,
            layout_dirty: true,
            version: 0,
            retrier,
            pending_target: None,
        }
    }

    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    pub fn viewport_height(&self) -> f64 {
        self.viewport_height
    }

    pub fn content_height(&self) -> f64 {
        match (self.tops.last(), self.heights.last()) {
            (Some(top), Some(height)) => top + height,
            _ => 0.0,
        }
    }

    pub fn max_scroll(&self) -> f64 {
        (self.content_height() - self.viewport_height).max(0.0)
    }

    pub fn item_top(&self, index: usize) -> Option<f64> {
        self.tops.get(index).copied()
    }

    pub fn item_height(&self, index: usize) -> Option<f64> {
        self.heights.get(index).copied()
    }

    pub fn index_of_page(&self, id: &PageIdentity) -> Option<usize> {
        self.index_by_item.get(&ContentItem::Page(id.clone())).copied()
    }

    fn is_measured(&self) -> bool {
        self.width > 0.0 && self.viewport_height > 0.0
    }

    /// Updates the viewport. A width change invalidates every item height.
    pub fn set_viewport(&mut self, width: f64, height: f64) {
        if (width - self.width).abs() > f64::EPSILON {
            self.width = width;
            self.layout_dirty = true;
        }
        self.viewport_height = height;
        self.scroll_top = self.scroll_top.clamp(0.0, self.max_scroll());
    }

    /// Records the rendered height of a page, replacing the aspect-ratio estimate.
    pub fn set_measured_height(&mut self, id: &PageIdentity, height: f64) {
        let changed = self
            .measured
            .insert(id.clone(), height)
            .is_none_or(|old| (old - height).abs() > f64::EPSILON);
        if changed {
            self.layout_dirty = true;
        }
    }

    pub fn needs_reload(&self, store: &SegmentStore) -> bool {
        self.layout_dirty || self.built_pages_version != Some(store.pages_version())
    }

    /// Reloads only when the page sequence or a height input changed.
    pub fn sync(&mut self, store: &SegmentStore) -> bool {
        if !self.needs_reload(store) {
            return false;
        }
        self.reload(store);
        true
    }

    /// Rebuilds the content list while keeping the current item at the same
    /// offset inside the viewport.
    pub fn reload(&mut self, store: &SegmentStore) {
        let anchor = self.capture_anchor();
        let old_items = std::mem::take(&mut self.items);

        self.rebuild(store);

        match anchor {
            Some(anchor) => {
                let target = match self.index_by_item.get(&anchor.item) {
                    Some(&index) => self.tops[index] + anchor.offset,
                    None => self.nearest_boundary(&old_items, anchor.index),
                };
                self.scroll_top = target.clamp(0.0, self.max_scroll());
            }
            None => self.scroll_top = 0.0,
        }

        if old_items != self.items {
            self.version += 1;
        }
        self.built_pages_version = Some(store.pages_version());
        self.layout_dirty = false;

        if let Some(target) = self.pending_target.clone() {
            if self.scroll_to_page(&target) {
                self.pending_target = None;
            }
        }
    }

    fn rebuild(&mut self, store: &SegmentStore) {
        self.items.clear();
        self.index_by_item.clear();
        self.tops.clear();
        self.heights.clear();

        let mut top = 0.0;
        for segment in store.segments() {
            for (local, page) in segment.pages.iter().enumerate() {
                let Some(id) = segment.page_identity(local) else {
                    continue;
                };
                let height = match self.measured.get(&id) {
                    Some(&measured) => measured,
                    None => self.width * page.aspect_ratio().unwrap_or(DEFAULT_ASPECT_RATIO),
                };
                self.push(ContentItem::Page(id), top, height);
                top += height;
            }
            self.push(ContentItem::End(segment.id().clone()), top, self.end_height);
            top += self.end_height;
        }
        debug!("scroll content rebuilt: {} items, {:.0} tall", self.items.len(), top);
    }

    fn push(&mut self, item: ContentItem, top: f64, height: f64) {
        self.index_by_item.insert(item.clone(), self.items.len());
        self.items.push(item);
        self.tops.push(top);
        self.heights.push(height);
    }

    fn capture_anchor(&self) -> Option<Anchor> {
        let index = self.item_at(self.scroll_top)?;
        Some(Anchor {
            item: self.items[index].clone(),
            index,
            offset: self.scroll_top - self.tops[index],
        })
    }

    /// Top of the first surviving item at or after `index` in the old list,
    /// otherwise the bottom of the closest surviving item before it.
    fn nearest_boundary(&self, old_items: &[ContentItem], index: usize) -> f64 {
        let after = old_items
            .iter()
            .skip(index)
            .find_map(|item| self.index_by_item.get(item).copied());
        if let Some(i) = after {
            return self.tops[i];
        }
        old_items
            .iter()
            .take(index)
            .rev()
            .find_map(|item| self.index_by_item.get(item).copied())
            .map(|i| self.tops[i] + self.heights[i])
            .unwrap_or(0.0)
    }

    /// Index of the item covering vertical position `y`.
    fn item_at(&self, y: f64) -> Option<usize> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.tops.partition_point(|&top| top <= y);
        Some(index.saturating_sub(1).min(self.items.len() - 1))
    }

    pub fn scroll_by(&mut self, delta: f64) {
        self.scroll_top = (self.scroll_top + delta).clamp(0.0, self.max_scroll());
    }

    /// Puts the top of `id` at the top of the viewport. Returns `false` when the
    /// layout has not been measured or the page is not laid out.
    pub fn scroll_to_page(&mut self, id: &PageIdentity) -> bool {
        if !self.is_measured() || self.layout_dirty {
            return false;
        }
        match self.index_of_page(id) {
            Some(index) => {
                self.scroll_top = self.tops[index].clamp(0.0, self.max_scroll());
                true
            }
            None => false,
        }
    }

    /// Offset of the viewport top inside `id`, if the page is laid out.
    pub fn offset_within_page(&self, id: &PageIdentity) -> Option<f64> {
        self.index_of_page(id).map(|i| self.scroll_top - self.tops[i])
    }

    /// First scroll to `target` after attaching to a viewport.
    pub fn attach(&mut self, target: PageIdentity) -> ScrollAttempt {
        self.retrier.begin();
        self.try_initial_scroll(target)
    }

    /// Handles a delivered retry ticket.
    pub fn retry(&mut self, ticket: RetryTicket) -> ScrollAttempt {
        if !self.retrier.is_current(&ticket) {
            debug!("ignoring stale initial scroll retry {:?}", ticket);
            return ScrollAttempt::Stale;
        }
        match self.pending_target.clone() {
            Some(target) => self.try_initial_scroll(target),
            None => ScrollAttempt::Done,
        }
    }

    pub fn cancel_initial_scroll(&mut self) {
        self.retrier.cancel();
        self.pending_target = None;
    }

    pub fn retry_delay(&self) -> Duration {
        self.retrier.delay()
    }

    fn try_initial_scroll(&mut self, target: PageIdentity) -> ScrollAttempt {
        if self.scroll_to_page(&target) {
            self.pending_target = None;
            return ScrollAttempt::Done;
        }
        self.pending_target = Some(target);
        match self.retrier.schedule() {
            Some(ticket) => ScrollAttempt::Retry(ticket),
            None => {
                debug!("initial scroll gave up after {} attempts", self.retrier.max_retries);
                self.pending_target = None;
                ScrollAttempt::GaveUp
            }
        }
    }

    /// Items intersecting the viewport.
    pub fn visible_range(&self) -> Range<usize> {
        let Some(first) = self.item_at(self.scroll_top) else {
            return 0..0;
        };
        let bottom = self.scroll_top + self.viewport_height;
        let end = self.tops.partition_point(|&top| top < bottom).max(first + 1);
        first..end
    }

    /// The last item whose bottom edge sits within the threshold below the
    /// viewport bottom, or the first visible item when none qualifies.
    pub fn current_item_index(&self) -> Option<usize> {
        let range = self.visible_range();
        if range.is_empty() {
            return None;
        }
        let limit = self.scroll_top + self.viewport_height + CURRENT_ITEM_THRESHOLD;
        range
            .clone()
            .rev()
            .find(|&i| self.tops[i] + self.heights[i] <= limit)
            .or(Some(range.start))
    }

    /// Page for the current item. End markers report their segment's last page.
    pub fn current_page(&self, store: &SegmentStore) -> Option<PageIdentity> {
        match self.items.get(self.current_item_index()?)? {
            ContentItem::Page(id) => Some(id.clone()),
            ContentItem::End(publication) => {
                let range = store.page_range_of(publication)?;
                let last = range.end.checked_sub(1)?;
                store.page_at(last).map(|p| p.id.clone())
            }
        }
    }

    /// Pages within `radius` items of the visible range, nearest first.
    pub fn preheat_pages(&self, radius: usize) -> Vec<PageIdentity> {
        let visible = self.visible_range();
        if visible.is_empty() {
            return Vec::new();
        }
        let start = visible.start.saturating_sub(radius);
        let end = (visible.end + radius).min(self.items.len());

        let mut indices: Vec<usize> = (start..end).collect();
        indices.sort_by_key(|&i| {
            if visible.contains(&i) {
                0
            } else if i < visible.start {
                visible.start - i
            } else {
                i + 1 - visible.end
            }
        });
        indices
            .into_iter()
            .filter_map(|i| match &self.items[i] {
                ContentItem::Page(id) => Some(id.clone()),
                ContentItem::End(_) => None,
            })
            .collect()
    }
}
