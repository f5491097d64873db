//! Ordered publications joined into one reading session, and the flattened
//! global page sequence derived from them.

use log::{debug, warn};
use std::collections::HashMap;
use std::ops::Range;

use super::page::{PageIdentity, PublicationId, ReaderPage, Segment};

#[derive(Debug, Default)]
pub struct SegmentStore {
    segments: Vec<Segment>,
    pages: Vec<ReaderPage>,
    global_index: HashMap<PageIdentity, usize>,
    segment_index: HashMap<PageIdentity, usize>,
    ranges: HashMap<PublicationId, Range<usize>>,
    pages_version: u64,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every mutation. Dependents compare this instead of the pages.
    pub fn pages_version(&self) -> u64 {
        self.pages_version
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn reader_pages(&self) -> &[ReaderPage] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page_at(&self, global: usize) -> Option<&ReaderPage> {
        self.pages.get(global)
    }

    pub fn contains_publication(&self, id: &PublicationId) -> bool {
        self.ranges.contains_key(id)
    }

    pub fn replace_all(&mut self, segments: Vec<Segment>) {
        self.segments.clear();
        for segment in segments {
            if self.segments.iter().any(|s| s.id() == segment.id()) {
                warn!("dropping duplicate segment for publication {}", segment.id());
                continue;
            }
            self.segments.push(segment);
        }
        self.reindex_from(0);
        self.pages_version += 1;
        debug!(
            "segments replaced: {} segments, {} pages, version {}",
            self.segments.len(),
            self.pages.len(),
            self.pages_version
        );
    }

    /// Returns false when the publication is already part of the session.
    pub fn append(&mut self, segment: Segment) -> bool {
        if self.contains_publication(segment.id()) {
            debug!("skip append: publication {} already loaded", segment.id());
            return false;
        }
        let segment_idx = self.segments.len();
        let start = self.pages.len();
        self.segments.push(segment);
        self.index_segment(segment_idx, start);
        self.pages_version += 1;
        true
    }

    /// Returns false when the publication is already part of the session.
    ///
    /// Every existing global index shifts, so the whole flattened view is
    /// rebuilt; prepends only happen at segment boundaries.
    pub fn prepend(&mut self, segment: Segment) -> bool {
        if self.contains_publication(segment.id()) {
            debug!("skip prepend: publication {} already loaded", segment.id());
            return false;
        }
        self.segments.insert(0, segment);
        self.reindex_from(0);
        self.pages_version += 1;
        true
    }

    pub fn global_index_of(&self, id: &PageIdentity) -> Option<usize> {
        self.global_index.get(id).copied()
    }

    pub fn segment_index_of(&self, id: &PageIdentity) -> Option<usize> {
        self.segment_index.get(id).copied()
    }

    pub fn page_range_of(&self, id: &PublicationId) -> Option<Range<usize>> {
        self.ranges.get(id).cloned()
    }

    pub fn segment_for_publication(&self, id: &PublicationId) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id() == id)
    }

    /// Index of the segment owning the page at `global`.
    pub fn segment_containing(&self, global: usize) -> Option<usize> {
        let page = self.pages.get(global)?;
        self.segment_index_of(&page.id)
    }

    fn reindex_from(&mut self, first_segment: usize) {
        let start = self
            .segments
            .get(..first_segment)
            .map(|before| before.iter().map(|s| s.pages.len()).sum())
            .unwrap_or(0);

        self.pages.truncate(start);
        self.global_index.retain(|_, g| *g < start);
        self.segment_index.retain(|_, s| *s < first_segment);
        let kept: Vec<PublicationId> = self.segments[..first_segment]
            .iter()
            .map(|s| s.id().clone())
            .collect();
        self.ranges.retain(|id, _| kept.contains(id));

        let mut offset = start;
        for idx in first_segment..self.segments.len() {
            self.index_segment(idx, offset);
            offset += self.segments[idx].pages.len();
        }
    }

    fn index_segment(&mut self, segment_idx: usize, start: usize) {
        let segment = &self.segments[segment_idx];
        let publication = segment.id().clone();
        for (local, page) in segment.pages.iter().enumerate() {
            let id = PageIdentity::new(publication.clone(), page.number);
            self.global_index.insert(id.clone(), start + local);
            self.segment_index.insert(id.clone(), segment_idx);
            self.pages.push(ReaderPage {
                id,
                page: page.clone(),
            });
        }
        self.ranges
            .insert(publication, start..start + segment.pages.len());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reader::page::{BookPage, Publication};

    pub(crate) fn segment(id: &str, pages: u32) -> Segment {
        Segment::new(
            Publication::new(id, format!("Book {id}")),
            (1..=pages).map(BookPage::new).collect(),
        )
    }

    fn assert_flattened(store: &SegmentStore) {
        let expected: Vec<PageIdentity> = store
            .segments()
            .iter()
            .flat_map(|s| (0..s.pages.len()).filter_map(move |i| s.page_identity(i)))
            .collect();
        let actual: Vec<PageIdentity> = store.reader_pages().iter().map(|p| p.id.clone()).collect();
        assert_eq!(expected, actual);

        let total: usize = store.segments().iter().map(|s| s.pages.len()).sum();
        assert_eq!(total, store.global_index.len());
        for (global, page) in store.reader_pages().iter().enumerate() {
            assert_eq!(store.global_index_of(&page.id), Some(global));
        }
    }

    #[test]
    fn test_flattening_across_mutations() {
        let mut store = SegmentStore::new();
        store.replace_all(vec![segment("b", 3)]);
        assert_flattened(&store);

        assert!(store.append(segment("c", 2)));
        assert_flattened(&store);

        assert!(store.prepend(segment("a", 4)));
        assert_flattened(&store);
        assert_eq!(store.page_range_of(&"a".into()), Some(0..4));
        assert_eq!(store.page_range_of(&"b".into()), Some(4..7));
        assert_eq!(store.page_range_of(&"c".into()), Some(7..9));
        assert_eq!(store.segment_index_of(&PageIdentity::new("c", 1)), Some(2));

        store.replace_all(vec![segment("z", 2), segment("empty", 0)]);
        assert_flattened(&store);
        assert_eq!(store.global_index_of(&PageIdentity::new("a", 1)), None);
        assert_eq!(store.page_range_of(&"empty".into()), Some(2..2));
    }

    #[test]
    fn test_version_bumps_on_every_mutation() {
        let mut store = SegmentStore::new();
        let v0 = store.pages_version();
        store.replace_all(vec![segment("a", 1)]);
        let v1 = store.pages_version();
        store.append(segment("b", 1));
        let v2 = store.pages_version();
        store.prepend(segment("c", 1));
        let v3 = store.pages_version();
        assert!(v0 < v1 && v1 < v2 && v2 < v3);
    }

    #[test]
    fn test_duplicate_publication_is_ignored() {
        let mut store = SegmentStore::new();
        store.replace_all(vec![segment("a", 2)]);
        let version = store.pages_version();
        assert!(!store.append(segment("a", 5)));
        assert!(!store.prepend(segment("a", 5)));
        assert_eq!(store.len(), 2);
        assert_eq!(store.pages_version(), version);
    }

    #[test]
    fn test_unknown_identity_is_not_found() {
        let store = SegmentStore::new();
        assert_eq!(store.global_index_of(&PageIdentity::new("x", 1)), None);
        assert_eq!(store.segment_index_of(&PageIdentity::new("x", 1)), None);
        assert_eq!(store.page_range_of(&"x".into()), None);
        assert!(store.segment_containing(0).is_none());
    }
}
