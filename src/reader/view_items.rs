//! Presentation units derived from the global page sequence.
//!
//! A view item is what the paginated reader shows at once: a lone page, one
//! half of a wide page, a two-page spread, or the end-of-book marker that
//! follows every segment.

use std::collections::{BTreeSet, HashMap};

use super::page::{PageIdentity, PublicationId};
use super::segments::SegmentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Half {
    First,
    Second,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ViewItem {
    Page(PageIdentity),
    SplitHalf(PageIdentity, Half),
    DualPair(PageIdentity, PageIdentity),
    End(PublicationId),
}

impl ViewItem {
    /// The first page this item shows, if any.
    pub fn primary_page(&self) -> Option<&PageIdentity> {
        match self {
            ViewItem::Page(id) | ViewItem::SplitHalf(id, _) | ViewItem::DualPair(id, _) => Some(id),
            ViewItem::End(_) => None,
        }
    }

    pub fn pages(&self) -> Vec<&PageIdentity> {
        match self {
            ViewItem::Page(id) | ViewItem::SplitHalf(id, _) => vec![id],
            ViewItem::DualPair(first, second) => vec![first, second],
            ViewItem::End(_) => Vec::new(),
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, ViewItem::End(_))
    }
}

/// User-facing layout switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayoutPolicy {
    /// Keep the first page of every publication alone.
    pub isolate_cover: bool,
    /// Always build two-page spreads where the boundaries allow it.
    pub force_dual_pairs: bool,
    /// Show landscape pages as two halves.
    pub split_wide_pages: bool,
}

/// Local page indices the user flagged to always render alone, per publication.
pub type IsolateSets = HashMap<PublicationId, BTreeSet<usize>>;

/// Flags after resolving the policy against the active rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EffectiveLayout {
    isolate_cover: bool,
    allow_dual: bool,
    force_dual: bool,
    split_wide: bool,
}

impl EffectiveLayout {
    fn resolve(policy: LayoutPolicy, dual_page_active: bool) -> Self {
        Self {
            // Single-page mode already isolates every page.
            isolate_cover: policy.isolate_cover && (policy.force_dual_pairs || dual_page_active),
            allow_dual: dual_page_active,
            force_dual: policy.force_dual_pairs && dual_page_active,
            // Splitting a page inside a spread makes no sense.
            split_wide: policy.split_wide_pages && !dual_page_active,
        }
    }
}

/// Regenerates view items from the segment store and keeps the page →
/// view item reverse map.
#[derive(Debug, Default)]
pub struct PageVirtualizer {
    items: Vec<ViewItem>,
    index_by_page: HashMap<PageIdentity, usize>,
    version: u64,
}

impl PageVirtualizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ViewItem] {
        &self.items
    }

    pub fn item(&self, index: usize) -> Option<&ViewItem> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bumped only when a rebuild produced a different list.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn index_of_page(&self, id: &PageIdentity) -> Option<usize> {
        self.index_by_page.get(id).copied()
    }

    /// Returns true if the item list changed.
    pub fn rebuild(
        &mut self,
        store: &SegmentStore,
        isolated: &IsolateSets,
        policy: LayoutPolicy,
        dual_page_active: bool,
    ) -> bool {
        let items = generate_view_items(store, isolated, policy, dual_page_active);
        if items == self.items {
            return false;
        }
        self.index_by_page = index_map(&items);
        self.items = items;
        self.version += 1;
        true
    }

    /// Page shown by a view item; `End` resolves to the last page of its
    /// segment, or `None` for an empty segment.
    pub fn page_index_for_view_item(&self, index: usize, store: &SegmentStore) -> Option<PageIdentity> {
        match self.items.get(index)? {
            ViewItem::End(publication) => {
                let range = store.page_range_of(publication)?;
                if range.is_empty() {
                    return None;
                }
                store.page_at(range.end - 1).map(|p| p.id.clone())
            }
            item => item.primary_page().cloned(),
        }
    }

    /// View item showing `id`, falling back to the clamped global index when
    /// the page is not mapped.
    pub fn view_item_index_for_page(&self, id: &PageIdentity, store: &SegmentStore) -> usize {
        if self.items.is_empty() {
            return 0;
        }
        if let Some(index) = self.index_of_page(id) {
            return index;
        }
        store
            .global_index_of(id)
            .unwrap_or(0)
            .min(self.items.len() - 1)
    }
}

pub fn generate_view_items(
    store: &SegmentStore,
    isolated: &IsolateSets,
    policy: LayoutPolicy,
    dual_page_active: bool,
) -> Vec<ViewItem> {
    let layout = EffectiveLayout::resolve(policy, dual_page_active);
    let empty = BTreeSet::new();
    let mut items = Vec::with_capacity(store.len() + store.segments().len());

    for segment in store.segments() {
        let isolate = isolated.get(segment.id()).unwrap_or(&empty);
        let pages = &segment.pages;
        let count = pages.len();
        let id_at = |i: usize| PageIdentity::new(segment.id().clone(), pages[i].number);

        let mut index = 0;
        while index < count {
            let is_cover = layout.isolate_cover && index == 0;
            let is_last = index == count - 1;

            if layout.force_dual {
                let single = is_cover
                    || is_last
                    || isolate.contains(&index)
                    || isolate.contains(&(index + 1));
                if single {
                    items.push(ViewItem::Page(id_at(index)));
                    index += 1;
                } else {
                    items.push(ViewItem::DualPair(id_at(index), id_at(index + 1)));
                    index += 2;
                }
                continue;
            }

            let page = &pages[index];
            let is_isolated = isolate.contains(&index);
            let split = !page.is_portrait() && layout.split_wide && !is_isolated && !is_cover;
            let single = (!page.is_portrait() && !split) || is_cover || is_isolated || is_last;

            if split {
                items.push(ViewItem::SplitHalf(id_at(index), Half::First));
                items.push(ViewItem::SplitHalf(id_at(index), Half::Second));
                index += 1;
            } else if single {
                items.push(ViewItem::Page(id_at(index)));
                index += 1;
            } else {
                let next = &pages[index + 1];
                if layout.allow_dual && next.is_portrait() && !isolate.contains(&(index + 1)) {
                    items.push(ViewItem::DualPair(id_at(index), id_at(index + 1)));
                    index += 2;
                } else {
                    items.push(ViewItem::Page(id_at(index)));
                    index += 1;
                }
            }
        }
        items.push(ViewItem::End(segment.id().clone()));
    }
    items
}

fn index_map(items: &[ViewItem]) -> HashMap<PageIdentity, usize> {
    let mut map = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        for id in item.pages() {
            map.entry(id.clone()).or_insert(index);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::page::{BookPage, Publication, Segment};
    use crate::reader::segments::tests::segment;

    fn p(book: &str, n: u32) -> PageIdentity {
        PageIdentity::new(book, n)
    }

    fn forced() -> LayoutPolicy {
        LayoutPolicy {
            isolate_cover: true,
            force_dual_pairs: true,
            split_wide_pages: false,
        }
    }

    fn store_with(segments: Vec<Segment>) -> SegmentStore {
        let mut store = SegmentStore::new();
        store.replace_all(segments);
        store
    }

    fn expand(items: &[ViewItem]) -> (Vec<PageIdentity>, Vec<PublicationId>) {
        let mut pages = Vec::new();
        let mut ends = Vec::new();
        for item in items {
            match item {
                ViewItem::SplitHalf(id, Half::Second) => {
                    assert_eq!(pages.last(), Some(id));
                }
                ViewItem::End(publication) => ends.push(publication.clone()),
                other => pages.extend(other.pages().into_iter().cloned()),
            }
        }
        (pages, ends)
    }

    #[test]
    fn test_forced_dual_five_pages_with_cover() {
        let store = store_with(vec![segment("b", 5)]);
        let items = generate_view_items(&store, &IsolateSets::new(), forced(), true);
        assert_eq!(
            items,
            vec![
                ViewItem::Page(p("b", 1)),
                ViewItem::DualPair(p("b", 2), p("b", 3)),
                ViewItem::DualPair(p("b", 4), p("b", 5)),
                ViewItem::End("b".into()),
            ]
        );
    }

    #[test]
    fn test_forced_dual_four_pages_leaves_last_single() {
        let store = store_with(vec![segment("b", 4)]);
        let items = generate_view_items(&store, &IsolateSets::new(), forced(), true);
        assert_eq!(
            items,
            vec![
                ViewItem::Page(p("b", 1)),
                ViewItem::DualPair(p("b", 2), p("b", 3)),
                ViewItem::Page(p("b", 4)),
                ViewItem::End("b".into()),
            ]
        );
    }

    #[test]
    fn test_forced_dual_respects_isolated_partner() {
        let store = store_with(vec![segment("b", 5)]);
        let mut isolated = IsolateSets::new();
        isolated.insert("b".into(), BTreeSet::from([2]));
        let items = generate_view_items(&store, &isolated, forced(), true);
        assert_eq!(
            items,
            vec![
                ViewItem::Page(p("b", 1)),
                ViewItem::Page(p("b", 2)),
                ViewItem::Page(p("b", 3)),
                ViewItem::DualPair(p("b", 4), p("b", 5)),
                ViewItem::End("b".into()),
            ]
        );
    }

    #[test]
    fn test_empty_segment_still_gets_end() {
        let store = store_with(vec![segment("a", 0), segment("b", 1)]);
        let items = generate_view_items(&store, &IsolateSets::new(), LayoutPolicy::default(), false);
        assert_eq!(
            items,
            vec![
                ViewItem::End("a".into()),
                ViewItem::Page(p("b", 1)),
                ViewItem::End("b".into()),
            ]
        );
    }

    #[test]
    fn test_split_wide_pages_in_single_mode() {
        let pages = vec![
            BookPage::new(1),
            BookPage::new(2).with_size(2000, 1400),
            BookPage::new(3),
        ];
        let store = store_with(vec![Segment::new(Publication::new("w", "Wide"), pages)]);
        let policy = LayoutPolicy {
            isolate_cover: true,
            force_dual_pairs: false,
            split_wide_pages: true,
        };
        let items = generate_view_items(&store, &IsolateSets::new(), policy, false);
        assert_eq!(
            items,
            vec![
                ViewItem::Page(p("w", 1)),
                ViewItem::SplitHalf(p("w", 2), Half::First),
                ViewItem::SplitHalf(p("w", 2), Half::Second),
                ViewItem::Page(p("w", 3)),
                ViewItem::End("w".into()),
            ]
        );

        // Splitting is disabled while spreads are shown.
        let items = generate_view_items(&store, &IsolateSets::new(), policy, true);
        assert!(!items.iter().any(|i| matches!(i, ViewItem::SplitHalf(..))));
    }

    #[test]
    fn test_opportunistic_pairing_skips_wide_and_isolated_next_page() {
        let pages = vec![
            BookPage::new(1),
            BookPage::new(2),
            BookPage::new(3).with_size(2000, 1000),
            BookPage::new(4),
            BookPage::new(5),
            BookPage::new(6),
        ];
        let store = store_with(vec![Segment::new(Publication::new("m", "Mixed"), pages)]);
        let mut isolated = IsolateSets::new();
        isolated.insert("m".into(), BTreeSet::from([4]));
        let policy = LayoutPolicy {
            isolate_cover: false,
            force_dual_pairs: false,
            split_wide_pages: false,
        };
        let items = generate_view_items(&store, &isolated, policy, true);
        assert_eq!(
            items,
            vec![
                ViewItem::DualPair(p("m", 1), p("m", 2)),
                ViewItem::Page(p("m", 3)),
                ViewItem::Page(p("m", 4)),
                ViewItem::Page(p("m", 5)),
                ViewItem::Page(p("m", 6)),
                ViewItem::End("m".into()),
            ]
        );
    }

    #[test]
    fn test_expansion_reproduces_global_sequence() {
        let store = store_with(vec![segment("a", 7), segment("b", 0), segment("c", 4)]);
        let mut isolated = IsolateSets::new();
        isolated.insert("a".into(), BTreeSet::from([3]));
        for policy in [LayoutPolicy::default(), forced()] {
            for dual in [false, true] {
                let items = generate_view_items(&store, &isolated, policy, dual);
                let (pages, ends) = expand(&items);
                let global: Vec<PageIdentity> =
                    store.reader_pages().iter().map(|r| r.id.clone()).collect();
                assert_eq!(pages, global);
                let expected: Vec<PublicationId> = vec!["a".into(), "b".into(), "c".into()];
                assert_eq!(ends, expected);
            }
        }
    }

    #[test]
    fn test_reverse_map_and_idempotent_rebuild() {
        let store = store_with(vec![segment("b", 5)]);
        let mut virtualizer = PageVirtualizer::new();
        assert!(virtualizer.rebuild(&store, &IsolateSets::new(), forced(), true));
        let version = virtualizer.version();
        assert!(!virtualizer.rebuild(&store, &IsolateSets::new(), forced(), true));
        assert_eq!(virtualizer.version(), version);

        assert_eq!(virtualizer.index_of_page(&p("b", 2)), Some(1));
        assert_eq!(virtualizer.index_of_page(&p("b", 3)), Some(1));
        assert_eq!(virtualizer.page_index_for_view_item(3, &store), Some(p("b", 5)));
        assert_eq!(virtualizer.view_item_index_for_page(&p("zz", 1), &store), 0);
    }
}
