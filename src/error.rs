use std::fmt;

use thiserror::Error;

use crate::reader::page::{PageIdentity, PublicationId};

pub type Result<T> = std::result::Result<T, ReaderError>;

/// Errors surfaced by the reader engine and its collaborators.
///
/// The type is `Clone` because a single fetch outcome is handed to every
/// caller waiting on the same page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReaderError {
    #[error("not found: {0}")]
    NotFound(Missing),
    #[error("offline: {0}")]
    Offline(String),
    #[error("failed to decode image: {0}")]
    DecodeFailure(String),
    #[error("remote request failed: {0}")]
    RemoteFailure(String),
    #[error("local storage error: {0}")]
    Storage(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// What a `NotFound` was looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Page(PageIdentity),
    Publication(PublicationId),
    Resource(String),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Page(id) => write!(f, "page {id}"),
            Missing::Publication(id) => write!(f, "publication {id}"),
            Missing::Resource(name) => write!(f, "resource {name}"),
        }
    }
}

impl ReaderError {
    /// Offline and remote failures are worth retrying on the next access.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReaderError::Offline(_) | ReaderError::RemoteFailure(_) | ReaderError::Cancelled
        )
    }
}

impl From<reqwest::Error> for ReaderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            ReaderError::Offline(e.to_string())
        } else {
            ReaderError::RemoteFailure(e.to_string())
        }
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(e: std::io::Error) -> Self {
        ReaderError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ReaderError {
    fn from(e: serde_json::Error) -> Self {
        ReaderError::Storage(e.to_string())
    }
}

impl From<image::ImageError> for ReaderError {
    fn from(e: image::ImageError) -> Self {
        ReaderError::DecodeFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReaderError::Offline("no route".into()).is_retryable());
        assert!(ReaderError::RemoteFailure("500".into()).is_retryable());
        assert!(!ReaderError::DecodeFailure("bad header".into()).is_retryable());
        assert!(
            !ReaderError::NotFound(Missing::Resource("chapter1.xhtml".into())).is_retryable()
        );
    }

    #[test]
    fn test_not_found_message_names_the_page() {
        let id = PageIdentity::new("book-1", 4);
        let err = ReaderError::NotFound(Missing::Page(id));
        assert_eq!(err.to_string(), "not found: page book-1#4");
    }
}
