//! Fractional reading progress at chapter and whole-book granularity.
//!
//! Everything here is a pure function of its inputs. Page counts of zero are
//! treated as one so no caller can divide by zero.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progression {
    /// Progress through the current chapter (or book, for image publications), in `(0, 1]`.
    pub chapter: f64,
    /// Progress through the whole publication, in `[0, 1]`.
    pub total: f64,
}

/// `(page_index + 1) / page_count`, with `page_count` normalized to at least one.
pub fn chapter_progress(page_index: usize, page_count: usize) -> f64 {
    let count = page_count.max(1);
    let index = page_index.min(count - 1);
    (index + 1) as f64 / count as f64
}

/// Per-chapter text weights (a character count or similar proxy).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterWeights {
    weights: HashMap<usize, u64>,
}

impl ChapterWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weights are normalized to at least one so an empty chapter still counts.
    pub fn insert(&mut self, chapter: usize, weight: u64) {
        self.weights.insert(chapter, weight.max(1));
    }

    pub fn get(&self, chapter: usize) -> Option<u64> {
        self.weights.get(&chapter).copied()
    }

    pub fn total(&self) -> u64 {
        self.weights.values().sum()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// True when every chapter in `0..chapter_count` has a weight.
    pub fn is_complete(&self, chapter_count: usize) -> bool {
        chapter_count > 0 && (0..chapter_count).all(|c| self.weights.contains_key(&c)) && self.total() > 0
    }
}

impl FromIterator<(usize, u64)> for ChapterWeights {
    fn from_iter<I: IntoIterator<Item = (usize, u64)>>(iter: I) -> Self {
        let mut weights = ChapterWeights::new();
        for (chapter, weight) in iter {
            weights.insert(chapter, weight);
        }
        weights
    }
}

/// Whole-book progress weighted by text length.
///
/// Returns `None` unless a weight is known for every chapter, in which case
/// the caller should fall back to [`total_progress_by_pages`].
pub fn total_progress_weighted(
    chapter_index: usize,
    chapter_progress: f64,
    chapter_count: usize,
    weights: &ChapterWeights,
) -> Option<f64> {
    if !weights.is_complete(chapter_count) || chapter_index >= chapter_count {
        return None;
    }
    let total = weights.total() as f64;
    let before: u64 = (0..chapter_index).filter_map(|c| weights.get(c)).sum();
    let current = weights.get(chapter_index)? as f64;
    let progressed = before as f64 + chapter_progress.clamp(0.0, 1.0) * current;
    Some((progressed / total).clamp(0.0, 1.0))
}

/// Whole-book progress from page counts alone.
pub fn total_progress_by_pages(chapter_index: usize, page_index: usize, page_counts: &[usize]) -> f64 {
    if page_counts.is_empty() {
        return 0.0;
    }
    let total: usize = page_counts.iter().map(|c| (*c).max(1)).sum();
    let chapter_index = chapter_index.min(page_counts.len() - 1);
    let before: usize = page_counts[..chapter_index].iter().map(|c| (*c).max(1)).sum();
    let local = page_index.min(page_counts[chapter_index].max(1) - 1);
    ((before + local + 1) as f64 / total as f64).clamp(0.0, 1.0)
}

/// Chapter-relative and whole-book progress for a position, using text
/// weights when they are complete and page counts otherwise.
pub fn progression(
    chapter_index: usize,
    page_index: usize,
    page_counts: &[usize],
    weights: Option<&ChapterWeights>,
) -> Progression {
    let count = page_counts.get(chapter_index).copied().unwrap_or(1);
    let chapter = chapter_progress(page_index, count);
    let total = weights
        .and_then(|w| total_progress_weighted(chapter_index, chapter, page_counts.len(), w))
        .unwrap_or_else(|| total_progress_by_pages(chapter_index, page_index, page_counts));
    Progression { chapter, total }
}
