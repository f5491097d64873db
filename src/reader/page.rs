use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-side identifier of a publication (a Komga book).
///
/// Equality and hashing are plain string equality on the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PublicationId(String);

impl PublicationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PublicationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PublicationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies one page of one publication. This is the key used by every
/// index, cache and in-flight map in the reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageIdentity {
    pub publication: PublicationId,
    /// 1-based page number as reported by the server.
    pub number: u32,
}

impl PageIdentity {
    pub fn new(publication: impl Into<PublicationId>, number: u32) -> Self {
        Self {
            publication: publication.into(),
            number,
        }
    }
}

impl fmt::Display for PageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.publication, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MediaProfile {
    #[default]
    Divina,
    Epub,
    Pdf,
}

/// Page metadata as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookPage {
    pub number: u32,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl BookPage {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            file_name: String::new(),
            media_type: String::new(),
            width: None,
            height: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Pages with unknown dimensions are treated as portrait.
    pub fn is_portrait(&self) -> bool {
        match (self.width, self.height) {
            (Some(w), Some(h)) => h >= w,
            _ => true,
        }
    }

    /// Height/width ratio, used to size pages in continuous scroll.
    pub fn aspect_ratio(&self) -> Option<f64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(h as f64 / w as f64),
            _ => None,
        }
    }

    /// Formats that may carry more than one frame.
    pub fn is_animated_candidate(&self) -> bool {
        let media = self.media_type.to_ascii_lowercase();
        let name = self.file_name.to_ascii_lowercase();
        media.contains("gif")
            || media.contains("webp")
            || media.contains("png")
            || name.ends_with(".gif")
            || name.ends_with(".webp")
            || name.ends_with(".png")
    }
}

/// A publication joined into the reading session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub id: PublicationId,
    pub title: String,
    #[serde(default)]
    pub media_profile: MediaProfile,
}

impl Publication {
    pub fn new(id: impl Into<PublicationId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            media_profile: MediaProfile::Divina,
        }
    }
}

/// One publication's pages plus the sibling references used for continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub publication: Publication,
    pub pages: Vec<BookPage>,
    pub previous: Option<Publication>,
    pub next: Option<Publication>,
}

impl Segment {
    pub fn new(publication: Publication, pages: Vec<BookPage>) -> Self {
        Self {
            publication,
            pages,
            previous: None,
            next: None,
        }
    }

    pub fn with_siblings(mut self, previous: Option<Publication>, next: Option<Publication>) -> Self {
        self.previous = previous;
        self.next = next;
        self
    }

    pub fn id(&self) -> &PublicationId {
        &self.publication.id
    }

    pub fn page_identity(&self, local_index: usize) -> Option<PageIdentity> {
        self.pages
            .get(local_index)
            .map(|p| PageIdentity::new(self.publication.id.clone(), p.number))
    }
}

/// A page placed in the flattened reading sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderPage {
    pub id: PageIdentity,
    pub page: BookPage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_dimensions_are_portrait() {
        assert!(BookPage::new(1).is_portrait());
        assert!(BookPage::new(1).with_size(800, 1200).is_portrait());
        assert!(!BookPage::new(1).with_size(1600, 1200).is_portrait());
    }

    #[test]
    fn test_page_identity_equality_is_structural() {
        let a = PageIdentity::new("b1", 3);
        let b = PageIdentity::new(String::from("b1"), 3);
        assert_eq!(a, b);
        assert_ne!(a, PageIdentity::new("b2", 3));
    }

    #[test]
    fn test_animated_candidates() {
        let mut page = BookPage::new(1);
        page.media_type = "image/gif".into();
        assert!(page.is_animated_candidate());
        page.media_type = "image/jpeg".into();
        assert!(!page.is_animated_candidate());
    }

    #[test]
    fn test_book_page_deserializes_server_shape() {
        let json = r#"{"number":2,"fileName":"002.jpg","mediaType":"image/jpeg","width":900,"height":1400,"sizeBytes":1234}"#;
        let page: BookPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.number, 2);
        assert_eq!(page.file_name, "002.jpg");
        assert_eq!(page.height, Some(1400));
    }
}
