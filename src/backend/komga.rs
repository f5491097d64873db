use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use super::{ImageByteSource, PageSource, ProgressSink, Sibling};
use crate::config::ReaderConfig;
use crate::error::{Missing, ReaderError, Result};
use crate::reader::page::{BookPage, MediaProfile, PageIdentity, Publication, PublicationId};
use crate::reader::progress::ProgressionLocator;
use crate::reader::text::{Manifest, strip_resource_prefix};

const USER_AGENT: &str = "komga-tui/0.1.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookDto {
    id: String,
    name: String,
    #[serde(default)]
    metadata: Option<BookMetadataDto>,
    #[serde(default)]
    media: Option<MediaDto>,
}

#[derive(Debug, Deserialize)]
struct BookMetadataDto {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaDto {
    #[serde(default)]
    media_profile: Option<String>,
}

impl From<BookDto> for Publication {
    fn from(book: BookDto) -> Self {
        let title = book
            .metadata
            .and_then(|m| m.title)
            .filter(|t| !t.is_empty())
            .unwrap_or(book.name);
        let media_profile = match book.media.and_then(|m| m.media_profile).as_deref() {
            Some("EPUB") => MediaProfile::Epub,
            Some("PDF") => MediaProfile::Pdf,
            _ => MediaProfile::Divina,
        };
        Publication {
            id: PublicationId::new(book.id),
            title,
            media_profile,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadProgressDto {
    page: u32,
    completed: bool,
}

#[derive(Debug, Serialize)]
struct ProgressionDto<'a> {
    modified: String,
    device: DeviceDto<'a>,
    locator: LocatorDto<'a>,
}

#[derive(Debug, Serialize)]
struct DeviceDto<'a> {
    id: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct LocatorDto<'a> {
    href: &'a str,
    #[serde(rename = "type")]
    media_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    locations: LocationsDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationsDto {
    progression: f64,
    total_progression: f64,
}

impl<'a> ProgressionDto<'a> {
    fn new(locator: &'a ProgressionLocator) -> Self {
        Self {
            modified: Utc::now().to_rfc3339(),
            device: DeviceDto {
                id: USER_AGENT,
                name: USER_AGENT,
            },
            locator: LocatorDto {
                href: &locator.href,
                media_type: &locator.media_type,
                title: locator.title.as_deref(),
                locations: LocationsDto {
                    progression: locator.chapter_progression,
                    total_progression: locator.total_progression,
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SavedProgressionDto {
    locator: SavedLocatorDto,
}

#[derive(Debug, Deserialize)]
struct SavedLocatorDto {
    href: String,
    #[serde(rename = "type")]
    media_type: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    locations: Option<SavedLocationsDto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedLocationsDto {
    #[serde(default)]
    progression: Option<f64>,
    #[serde(default)]
    total_progression: Option<f64>,
}

impl From<SavedProgressionDto> for ProgressionLocator {
    fn from(saved: SavedProgressionDto) -> Self {
        let locator = saved.locator;
        let locations = locator.locations.unwrap_or_default();
        ProgressionLocator {
            href: locator.href,
            media_type: locator.media_type,
            title: locator.title,
            chapter_progression: locations.progression.unwrap_or(0.0),
            total_progression: locations.total_progression.unwrap_or(0.0),
        }
    }
}

fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ReaderError::RemoteFailure(e.to_string()))
}

/// HTTP client for one Komga server.
pub struct KomgaClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl KomgaClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &ReaderConfig) -> Result<Self> {
        Self::new(&config.server_url, &config.api_key)
    }

    fn book_url(&self, id: &PublicationId, rest: &str) -> String {
        format!(
            "{}/api/v1/books/{}{}",
            self.base_url,
            urlencoding::encode(id.as_str()),
            rest
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.header("X-API-Key", &self.api_key)
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str, missing: Missing) -> Result<T> {
        let response = self.authorized(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ReaderError::NotFound(missing));
        }
        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl PageSource for KomgaClient {
    async fn fetch_publication(&self, id: &PublicationId) -> Result<Publication> {
        let book: BookDto = self
            .get_json(&self.book_url(id, ""), Missing::Publication(id.clone()))
            .await?;
        Ok(book.into())
    }

    async fn fetch_pages(&self, id: &PublicationId) -> Result<Vec<BookPage>> {
        let pages: Vec<BookPage> = self
            .get_json(&self.book_url(id, "/pages"), Missing::Publication(id.clone()))
            .await?;
        info!("fetched {} pages for {}", pages.len(), id);
        Ok(pages)
    }

    async fn fetch_manifest(&self, id: &PublicationId) -> Result<Manifest> {
        self.get_json(&self.book_url(id, "/manifest"), Missing::Resource(format!("{id}/manifest")))
            .await
    }

    async fn fetch_sibling(&self, id: &PublicationId, which: Sibling) -> Result<Option<Publication>> {
        let rest = match which {
            Sibling::Previous => "/previous",
            Sibling::Next => "/next",
        };
        match self
            .get_json::<BookDto>(&self.book_url(id, rest), Missing::Publication(id.clone()))
            .await
        {
            Ok(book) => Ok(Some(book.into())),
            Err(ReaderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_resource(&self, id: &PublicationId, href: &str) -> Result<String> {
        let path = strip_resource_prefix(href).trim_start_matches('/');
        let url = self.book_url(id, &format!("/resource/{}", path));
        let response = self.authorized(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ReaderError::NotFound(Missing::Resource(url)));
        }
        Ok(response.error_for_status()?.text().await?)
    }

    async fn fetch_progression(&self, id: &PublicationId) -> Result<Option<ProgressionLocator>> {
        let url = self.book_url(id, "/progression");
        let response = self.authorized(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            _ => {
                let saved: SavedProgressionDto = response.error_for_status()?.json().await?;
                Ok(Some(saved.into()))
            }
        }
    }
}

#[async_trait]
impl ImageByteSource for KomgaClient {
    fn page_url(&self, page: &PageIdentity) -> String {
        self.book_url(&page.publication, &format!("/pages/{}", page.number))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.authorized(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ReaderError::NotFound(Missing::Resource(url.to_string())));
        }
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ProgressSink for KomgaClient {
    async fn submit_page_progress(&self, id: &PublicationId, page: u32, completed: bool) -> Result<()> {
        debug!("PATCH read-progress {} page {} completed {}", id, page, completed);
        self.authorized(self.client.patch(self.book_url(id, "/read-progress")))
            .json(&ReadProgressDto { page, completed })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn submit_progression(&self, id: &PublicationId, locator: &ProgressionLocator) -> Result<()> {
        debug!("PUT progression {} {} {:.3}", id, locator.href, locator.total_progression);
        self.authorized(self.client.put(self.book_url(id, "/progression")))
            .json(&ProgressionDto::new(locator))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_built_from_the_server_root() {
        let client = KomgaClient::new("https://komga.example/", "").unwrap();
        let page = PageIdentity::new("0ABC", 12);
        assert_eq!(client.page_url(&page), "https://komga.example/api/v1/books/0ABC/pages/12");
        assert_eq!(
            client.book_url(&"0ABC".into(), "/read-progress"),
            "https://komga.example/api/v1/books/0ABC/read-progress"
        );
    }

    #[test]
    fn test_book_dto_to_publication() {
        let json = r#"{"id":"b1","name":"file-name","metadata":{"title":"Vol. 1"},"media":{"mediaProfile":"EPUB"}}"#;
        let book: BookDto = serde_json::from_str(json).unwrap();
        let publication = Publication::from(book);
        assert_eq!(publication.title, "Vol. 1");
        assert_eq!(publication.media_profile, MediaProfile::Epub);

        let bare: BookDto = serde_json::from_str(r#"{"id":"b2","name":"Only name"}"#).unwrap();
        let publication = Publication::from(bare);
        assert_eq!(publication.title, "Only name");
        assert_eq!(publication.media_profile, MediaProfile::Divina);
    }

    #[test]
    fn test_page_listing_parses() {
        let json = r#"[{"number":1,"fileName":"001.jpg","mediaType":"image/jpeg","width":800,"height":1200,"sizeBytes":1}]"#;
        let pages: Vec<BookPage> = serde_json::from_str(json).unwrap();
        assert_eq!(pages[0].number, 1);
        assert!(pages[0].is_portrait());
    }

    #[test]
    fn test_saved_progression_parses() {
        let json = r#"{"modified":"2024-05-01T10:00:00Z","device":{"id":"web","name":"web"},
            "locator":{"href":"OEBPS/ch2.xhtml","type":"application/xhtml+xml",
            "locations":{"progression":0.25,"totalProgression":0.4}}}"#;
        let saved: SavedProgressionDto = serde_json::from_str(json).unwrap();
        let locator = ProgressionLocator::from(saved);
        assert_eq!(locator.href, "OEBPS/ch2.xhtml");
        assert_eq!(locator.chapter_progression, 0.25);
        assert_eq!(locator.total_progression, 0.4);
        assert_eq!(locator.title, None);
    }

    #[test]
    fn test_progression_payload_shape() {
        let locator = ProgressionLocator {
            href: "OEBPS/ch3.xhtml".into(),
            media_type: "application/xhtml+xml".into(),
            title: None,
            chapter_progression: 0.5,
            total_progression: 0.75,
        };
        let value = serde_json::to_value(ProgressionDto::new(&locator)).unwrap();
        assert_eq!(value["locator"]["href"], "OEBPS/ch3.xhtml");
        assert_eq!(value["locator"]["type"], "application/xhtml+xml");
        assert_eq!(value["locator"]["locations"]["totalProgression"], 0.75);
        assert!(value["locator"].get("title").is_none());
        assert!(value["modified"].as_str().is_some());
    }
}
