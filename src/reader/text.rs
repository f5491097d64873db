//! Position tracking for reflowable (EPUB) publications.
//!
//! A chapter is one resource of the reading order. How many screens a chapter
//! takes depends on the viewport and the typesetting preferences, so page
//! counts are cached per [`PageCountKey`]. Text lengths give a better
//! whole-book progression than page counts once every chapter has one.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::page::PublicationId;
use super::progress::ProgressionLocator;
use super::progression::{self, ChapterWeights, Progression};

const DEFAULT_RESOURCE_TYPE: &str = "text/html";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestLink {
    pub href: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ManifestLink>,
}

impl ManifestLink {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            ..Self::default()
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Reading order and table of contents of a web publication manifest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub metadata: Option<ManifestMetadata>,
    #[serde(default)]
    pub reading_order: Vec<ManifestLink>,
    #[serde(default)]
    pub toc: Vec<ManifestLink>,
}

impl Manifest {
    /// The table of contents, or the reading order when the manifest has none.
    pub fn toc_or_reading_order(&self) -> &[ManifestLink] {
        if self.toc.is_empty() {
            &self.reading_order
        } else {
            &self.toc
        }
    }
}

/// Drops a Komga `/resource/` URL prefix, leaving the in-publication path.
pub fn strip_resource_prefix(href: &str) -> &str {
    match href.rfind("/resource/") {
        Some(pos) => &href[pos + "/resource/".len()..],
        None => href,
    }
}

/// Canonical form used to compare hrefs: no resource prefix, query,
/// fragment, surrounding whitespace or slashes.
pub fn normalized_href(href: &str) -> String {
    let trimmed = strip_resource_prefix(href.trim());
    let path = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    let path = if path.is_empty() { trimmed } else { path };
    path.trim_matches('/').to_string()
}

/// Length of the visible text in an XHTML resource: characters outside tags,
/// with runs of whitespace counted once.
pub fn text_length(markup: &str) -> u64 {
    let mut length = 0;
    let mut in_tag = false;
    let mut last_was_space = true;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            c if c.is_whitespace() => {
                if !last_was_space {
                    length += 1;
                    last_was_space = true;
                }
            }
            _ => {
                length += 1;
                last_was_space = false;
            }
        }
    }
    length
}

/// Cache key for the page count of one chapter under one layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCountKey {
    pub resource: String,
    pub width: u32,
    pub height: u32,
    /// Typesetting preferences that change pagination (font, size, theme, ...).
    pub signature: String,
}

impl fmt::Display for PageCountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}x{}|{}", self.resource, self.width, self.height, self.signature)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLocation {
    pub href: String,
    pub title: Option<String>,
    pub chapter_index: usize,
    pub page_index: usize,
    pub page_count: usize,
    pub progression: Progression,
}

pub struct TextPositionTracker {
    publication: PublicationId,
    reading_order: Vec<ManifestLink>,
    toc_titles: HashMap<String, String>,
    page_counts: Vec<usize>,
    weights: ChapterWeights,
    viewport: (u32, u32),
    signature: String,
    chapter: usize,
    page: usize,
    /// Chapter-relative progression to apply once that chapter is paginated.
    initial: Option<(usize, f64)>,
}

impl TextPositionTracker {
    pub fn new(publication: PublicationId, manifest: &Manifest) -> Self {
        let mut toc_titles = HashMap::new();
        collect_titles(manifest.toc_or_reading_order(), &mut toc_titles);
        Self {
            publication,
            page_counts: vec![1; manifest.reading_order.len()],
            reading_order: manifest.reading_order.clone(),
            toc_titles,
            weights: ChapterWeights::new(),
            viewport: (0, 0),
            signature: String::new(),
            chapter: 0,
            page: 0,
            initial: None,
        }
    }

    pub fn publication(&self) -> &PublicationId {
        &self.publication
    }

    pub fn chapter_count(&self) -> usize {
        self.reading_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reading_order.is_empty()
    }

    pub fn position(&self) -> (usize, usize) {
        (self.chapter, self.page)
    }

    pub fn chapter_page_count(&self, chapter: usize) -> Option<usize> {
        self.page_counts.get(chapter).copied()
    }

    pub fn has_full_text_weights(&self) -> bool {
        self.weights.is_complete(self.chapter_count())
    }

    pub fn chapter_index_for_href(&self, href: &str) -> Option<usize> {
        let wanted = normalized_href(href);
        self.reading_order
            .iter()
            .position(|link| normalized_href(&link.href) == wanted)
    }

    /// Starts at `locator`'s chapter; the page inside it is resolved once the
    /// chapter's page count is known.
    pub fn restore(&mut self, locator: &ProgressionLocator) {
        match self.chapter_index_for_href(&locator.href) {
            Some(chapter) => {
                self.chapter = chapter;
                self.page = 0;
                self.initial = Some((chapter, locator.chapter_progression.clamp(0.0, 1.0)));
            }
            None => debug!("saved position {} is not in the reading order", locator.href),
        }
    }

    pub fn page_count_key(&self, chapter: usize) -> Option<PageCountKey> {
        let link = self.reading_order.get(chapter)?;
        Some(PageCountKey {
            resource: link.href.clone(),
            width: self.viewport.0,
            height: self.viewport.1,
            signature: self.signature.clone(),
        })
    }

    /// Changes the layout and reloads every chapter's page count from `cached`.
    /// Chapters without a cached count fall back to one page.
    pub fn set_layout(
        &mut self,
        width: u32,
        height: u32,
        signature: impl Into<String>,
        cached: impl Fn(&PageCountKey) -> Option<usize>,
    ) {
        self.viewport = (width, height);
        self.signature = signature.into();
        for chapter in 0..self.chapter_count() {
            let count = self.page_count_key(chapter).and_then(|key| cached(&key)).unwrap_or(1);
            self.page_counts[chapter] = count.max(1);
        }
        self.page = self.page.min(self.page_counts.get(self.chapter).map_or(0, |c| c - 1));
    }

    /// Records a freshly measured page count. Returns the key to persist it
    /// under, or `None` when nothing changed.
    pub fn update_chapter_page_count(&mut self, chapter: usize, count: usize) -> Option<PageCountKey> {
        let count = count.max(1);
        let slot = self.page_counts.get_mut(chapter)?;
        let changed = *slot != count;
        *slot = count;

        if let Some((initial_chapter, progression)) = self.initial {
            if initial_chapter == chapter {
                let page = ((count as f64 * progression).floor() as usize).min(count - 1);
                debug!("applying saved progression to chapter {}: page {}/{}", chapter, page, count);
                self.chapter = chapter;
                self.page = page;
                self.initial = None;
            }
        }
        if self.chapter == chapter {
            self.page = self.page.min(count - 1);
        }
        changed.then(|| self.page_count_key(chapter)).flatten()
    }

    pub fn chapter_href(&self, chapter: usize) -> Option<&str> {
        self.reading_order.get(chapter).map(|link| link.href.as_str())
    }

    /// Loads cached text lengths keyed by normalized href.
    pub fn refresh_text_weights(&mut self, cached: impl Fn(&str) -> Option<u64>) {
        self.weights = self
            .reading_order
            .iter()
            .enumerate()
            .filter_map(|(i, link)| cached(&normalized_href(&link.href)).map(|w| (i, w)))
            .collect();
    }

    /// Chapters still lacking a text length, with the key to store it under.
    pub fn missing_text_weights(&self) -> Vec<(usize, String)> {
        self.reading_order
            .iter()
            .enumerate()
            .filter(|(i, _)| self.weights.get(*i).is_none())
            .map(|(i, link)| (i, normalized_href(&link.href)))
            .collect()
    }

    pub fn set_text_weight(&mut self, chapter: usize, length: u64) {
        if chapter < self.chapter_count() {
            self.weights.insert(chapter, length);
        }
    }

    /// Moves to `(chapter, page)`, clamped to the known layout.
    pub fn go_to(&mut self, chapter: usize, page: usize) {
        if self.is_empty() {
            return;
        }
        self.chapter = chapter.min(self.chapter_count() - 1);
        self.page = page.min(self.page_counts[self.chapter] - 1);
        self.initial = None;
    }

    /// Returns `false` at the last page of the last chapter.
    pub fn next_page(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.page + 1 < self.page_counts[self.chapter] {
            self.page += 1;
        } else if self.chapter + 1 < self.chapter_count() {
            self.chapter += 1;
            self.page = 0;
        } else {
            return false;
        }
        self.initial = None;
        true
    }

    pub fn previous_page(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.page > 0 {
            self.page -= 1;
        } else if self.chapter > 0 {
            self.chapter -= 1;
            self.page = self.page_counts[self.chapter] - 1;
        } else {
            return false;
        }
        self.initial = None;
        true
    }

    pub fn progression(&self) -> Progression {
        let weights = self.has_full_text_weights().then_some(&self.weights);
        progression::progression(self.chapter, self.page, &self.page_counts, weights)
    }

    pub fn location(&self) -> Option<TextLocation> {
        let link = self.reading_order.get(self.chapter)?;
        Some(TextLocation {
            href: link.href.clone(),
            title: self.title_for(link),
            chapter_index: self.chapter,
            page_index: self.page,
            page_count: self.page_counts[self.chapter],
            progression: self.progression(),
        })
    }

    pub fn last_page_position(&self) -> Option<(usize, usize)> {
        let chapter = self.chapter_count().checked_sub(1)?;
        Some((chapter, self.page_counts[chapter] - 1))
    }

    /// Locator to submit for `(chapter, page)`. `chapter_override` replaces the
    /// computed chapter progression, e.g. with the maximum progression the
    /// server accepts for the final resource.
    pub fn locator_for(&self, chapter: usize, page: usize, chapter_override: Option<f64>) -> Option<ProgressionLocator> {
        let link = self.reading_order.get(chapter)?;
        let count = self.page_counts[chapter];
        let page = page.min(count - 1);
        let chapter_progression = chapter_override.unwrap_or(page as f64 / count as f64);

        let total_progression = self
            .has_full_text_weights()
            .then(|| {
                progression::total_progress_weighted(chapter, chapter_progression, self.chapter_count(), &self.weights)
            })
            .flatten()
            .unwrap_or_else(|| progression::total_progress_by_pages(chapter, page, &self.page_counts));

        Some(ProgressionLocator {
            href: strip_resource_prefix(&link.href).to_string(),
            media_type: link
                .media_type
                .clone()
                .unwrap_or_else(|| DEFAULT_RESOURCE_TYPE.to_string()),
            title: self.title_for(link),
            chapter_progression,
            total_progression,
        })
    }

    pub fn current_locator(&self) -> Option<ProgressionLocator> {
        self.locator_for(self.chapter, self.page, None)
    }

    /// Jumps to the last page and returns the locator reporting it as finished.
    pub fn end_of_book_locator(&mut self, max_progression: f64) -> Option<ProgressionLocator> {
        let (chapter, page) = self.last_page_position()?;
        self.go_to(chapter, page);
        self.locator_for(chapter, page, Some(max_progression))
    }

    fn title_for(&self, link: &ManifestLink) -> Option<String> {
        link.title
            .clone()
            .or_else(|| self.toc_titles.get(&normalized_href(&link.href)).cloned())
    }
}

fn collect_titles(links: &[ManifestLink], titles: &mut HashMap<String, String>) {
    for link in links {
        if let Some(title) = link.title.as_deref().filter(|t| !t.is_empty()) {
            titles.insert(normalized_href(&link.href), title.to_string());
        }
        collect_titles(&link.children, titles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            metadata: None,
            reading_order: vec![
                ManifestLink::new("/api/v1/books/b/resource/OEBPS/ch1.xhtml"),
                ManifestLink::new("/api/v1/books/b/resource/OEBPS/ch2.xhtml"),
                ManifestLink::new("/api/v1/books/b/resource/OEBPS/ch3.xhtml"),
            ],
            toc: vec![ManifestLink {
                children: vec![ManifestLink::new("OEBPS/ch2.xhtml#start").titled("Two")],
                ..ManifestLink::new("OEBPS/ch1.xhtml").titled("One")
            }],
        }
    }

    fn tracker() -> TextPositionTracker {
        let mut tracker = TextPositionTracker::new("b".into(), &manifest());
        for (chapter, count) in [(0, 4), (1, 2), (2, 4)] {
            tracker.update_chapter_page_count(chapter, count);
        }
        tracker
    }

    #[test]
    fn test_normalized_href() {
        assert_eq!(normalized_href(" /api/v1/books/b/resource/OEBPS/ch1.xhtml?x=1 "), "OEBPS/ch1.xhtml");
        assert_eq!(normalized_href("/OEBPS/ch1.xhtml#frag"), "OEBPS/ch1.xhtml");
        assert_eq!(strip_resource_prefix("a/resource/b/resource/c.xhtml"), "c.xhtml");
    }

    #[test]
    fn test_titles_come_from_nested_toc() {
        let mut tracker = tracker();
        tracker.go_to(1, 0);
        assert_eq!(tracker.location().unwrap().title.as_deref(), Some("Two"));
        tracker.go_to(2, 0);
        assert_eq!(tracker.location().unwrap().title, None);
    }

    #[test]
    fn test_navigation_crosses_chapters() {
        let mut tracker = tracker();
        tracker.go_to(0, 3);
        assert!(tracker.next_page());
        assert_eq!(tracker.position(), (1, 0));
        assert!(tracker.previous_page());
        assert_eq!(tracker.position(), (0, 3));

        let (last_chapter, last_page) = tracker.last_page_position().unwrap();
        tracker.go_to(last_chapter, last_page);
        assert!(!tracker.next_page());
        assert_eq!(tracker.progression().total, 1.0);
    }

    #[test]
    fn test_total_uses_pages_until_weights_complete() {
        let mut tracker = tracker();
        tracker.go_to(1, 1);
        // 4 + 2 pages of 10.
        assert!((tracker.progression().total - 0.6).abs() < 1e-9);

        tracker.refresh_text_weights(|href| (href == "OEBPS/ch1.xhtml").then_some(100));
        assert!(!tracker.has_full_text_weights());
        assert_eq!(tracker.missing_text_weights().len(), 2);

        tracker.set_text_weight(1, 100);
        tracker.set_text_weight(2, 800);
        assert!(tracker.has_full_text_weights());
        // (100 + 1.0 * 100) / 1000
        assert!((tracker.progression().total - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_page_count_keys_and_layout_refresh() {
        let mut tracker = TextPositionTracker::new("b".into(), &manifest());
        let mut cache: HashMap<String, usize> = HashMap::new();

        tracker.set_layout(80, 24, "serif-16", |_| None);
        let key = tracker.update_chapter_page_count(0, 7).unwrap();
        assert_eq!(key.to_string(), "/api/v1/books/b/resource/OEBPS/ch1.xhtml|80x24|serif-16");
        cache.insert(key.to_string(), 7);
        assert!(tracker.update_chapter_page_count(0, 7).is_none());

        tracker.set_layout(120, 40, "serif-16", |key| cache.get(&key.to_string()).copied());
        assert_eq!(tracker.chapter_page_count(0), Some(1));
        tracker.set_layout(80, 24, "serif-16", |key| cache.get(&key.to_string()).copied());
        assert_eq!(tracker.chapter_page_count(0), Some(7));
    }

    #[test]
    fn test_restore_applies_once_chapter_is_paginated() {
        let mut tracker = TextPositionTracker::new("b".into(), &manifest());
        let saved = ProgressionLocator {
            href: "OEBPS/ch2.xhtml".into(),
            media_type: DEFAULT_RESOURCE_TYPE.into(),
            title: None,
            chapter_progression: 0.5,
            total_progression: 0.4,
        };
        tracker.restore(&saved);
        assert_eq!(tracker.position(), (1, 0));

        tracker.update_chapter_page_count(1, 10);
        assert_eq!(tracker.position(), (1, 5));
    }

    #[test]
    fn test_end_of_book_locator_uses_override() {
        let mut tracker = tracker();
        let locator = tracker.end_of_book_locator(0.9999).unwrap();
        assert_eq!(locator.href, "OEBPS/ch3.xhtml");
        assert_eq!(locator.media_type, "text/html");
        assert_eq!(locator.chapter_progression, 0.9999);
        assert_eq!(locator.total_progression, 1.0);
        assert_eq!(tracker.position(), (2, 3));
    }

    #[test]
    fn test_restore_with_unchanged_page_count() {
        let mut tracker = tracker();
        tracker.restore(&ProgressionLocator {
            href: "/api/v1/books/b/resource/OEBPS/ch3.xhtml".into(),
            media_type: DEFAULT_RESOURCE_TYPE.into(),
            title: None,
            chapter_progression: 0.75,
            total_progression: 0.9,
        });
        assert!(tracker.update_chapter_page_count(2, 4).is_none());
        assert_eq!(tracker.position(), (2, 3));
    }

    #[test]
    fn test_text_length_skips_markup() {
        assert_eq!(text_length("<p>Hello,\n   <em>world</em></p>"), 12);
        assert_eq!(text_length("<html><body></body></html>"), 0);
    }

    #[test]
    fn test_manifest_json() {
        let json = r#"{"readingOrder":[{"href":"a.xhtml","type":"application/xhtml+xml"}],"toc":[]}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.reading_order[0].media_type.as_deref(), Some("application/xhtml+xml"));
        assert_eq!(manifest.toc_or_reading_order().len(), 1);
    }
}
