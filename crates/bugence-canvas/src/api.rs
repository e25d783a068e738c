//! Content Service Seam
//!
//! [`ContentApi`] is everything the engine needs from the content service.
//! [`HttpContentApi`] talks to the real service over HTTP; tests substitute
//! mocks or an in-memory fake.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::model::{HistoryResponse, Section, SectionUpsert, SectionsResponse};

/// Header carrying the page concurrency token
pub const PAGE_ETAG_HEADER: &str = "X-Page-ETag";

/// Transport-level failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The supplied concurrency token no longer matches (HTTP 412)
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Server message
        message: String,
    },

    /// Non-success HTTP status
    #[error("{message} (status {status})")]
    Status {
        /// HTTP status code
        status: u16,
        /// Server message
        message: String,
    },

    /// Connection, timeout or request building failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP status, when a response was received
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::PreconditionFailed { .. } => Some(412),
            Self::Status { status, .. } => Some(*status),
            Self::Transport(_) | Self::Decode(_) => None,
        }
    }

    /// Message suitable for the store's error field
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::PreconditionFailed { message } | Self::Status { message, .. } => message.clone(),
            Self::Transport(message) | Self::Decode(message) => message.clone(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result type alias for content service calls
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Outcome of a conditional read
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    /// The prior token is still current (HTTP 304)
    NotModified,
    /// Fresh data and its token
    Modified {
        /// Response body
        data: T,
        /// Token of the returned data
        etag: Option<String>,
    },
}

/// Result of a create or update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionMutation {
    /// Server echo of the stored section
    pub section: Option<Section>,
    /// New section token
    pub section_etag: Option<String>,
    /// New page token
    pub page_etag: Option<String>,
}

/// Result of a delete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteReply {
    /// New page token
    pub page_etag: Option<String>,
}

/// Result of a publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReply {
    /// New page token
    pub etag: Option<String>,
}

/// Content service operations used by the engine.
///
/// Mutations must reject a stale `if_match` token with
/// [`ApiError::PreconditionFailed`], also when an accepted request is replayed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentApi: Send + Sync {
    /// Read the sections of a page, conditionally on the prior sections token
    async fn fetch_sections(
        &self,
        page_id: Uuid,
        if_none_match: Option<String>,
    ) -> ApiResult<Fetched<SectionsResponse>>;

    /// Read the content change log of a page
    async fn fetch_history(&self, page_id: Uuid) -> ApiResult<Fetched<HistoryResponse>>;

    /// Create (no `section_id`) or update a section
    async fn upsert_section(
        &self,
        page_id: Uuid,
        payload: SectionUpsert,
        if_match: Option<String>,
    ) -> ApiResult<SectionMutation>;

    /// Delete a section
    async fn delete_section(
        &self,
        page_id: Uuid,
        section_id: Uuid,
        if_match: Option<String>,
    ) -> ApiResult<DeleteReply>;

    /// Publish the page
    async fn publish_page(&self, page_id: Uuid, if_match: Option<String>)
        -> ApiResult<PublishReply>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationBody {
    #[serde(default)]
    section: Option<Section>,
    #[serde(default)]
    page_etag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PublishBody {
    #[serde(default)]
    etag: Option<String>,
}

/// HTTP implementation of [`ContentApi`]
#[derive(Debug, Clone)]
pub struct HttpContentApi {
    client: Client,
    root: String,
}

impl HttpContentApi {
    /// Create a client for the configured content service
    pub fn new(config: &SyncConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            root: config.api_root(),
        })
    }

    fn section_url(&self, page_id: Uuid) -> String {
        format!("{}/pages/{}/sections", self.root, page_id)
    }

    async fn send(&self, request: RequestBuilder) -> ApiResult<(StatusCode, HeaderMap, String)> {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        debug!(status = status.as_u16(), "Content service responded");

        if status == StatusCode::PRECONDITION_FAILED {
            return Err(ApiError::PreconditionFailed {
                message: extract_message(&body, status),
            });
        }
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: extract_message(&body, status),
            });
        }

        Ok((status, headers, body))
    }
}

fn header(headers: &HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn with_precondition(
    request: RequestBuilder,
    name: reqwest::header::HeaderName,
    token: Option<String>,
) -> RequestBuilder {
    match token {
        Some(token) => request.header(name, token),
        None => request,
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> ApiResult<T> {
    serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Message of an error response: JSON `message`/`Message`, then the raw
/// body, then a generic status line
pub fn extract_message(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = value
            .get("message")
            .or_else(|| value.get("Message"))
            .and_then(|m| m.as_str());
        if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("Request failed with status {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

fn upsert_form(payload: SectionUpsert) -> ApiResult<Form> {
    let mut form = Form::new();
    if let Some(section_id) = payload.section_id {
        form = form.text("SectionId", section_id.to_string());
    }
    if let Some(selector) = payload.selector {
        form = form.text("Selector", selector);
    }
    if let Some(content_type) = payload.content_type {
        form = form.text("ContentType", content_type.as_str());
    }
    if let Some(content_value) = payload.content_value {
        form = form.text("ContentValue", content_value);
    }
    if let Some(alt) = payload.media_alt_text {
        form = form.text("MediaAltText", alt);
    }
    if let Some(image) = payload.image {
        let part = Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str(&image.content_type)
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        form = form.part("Image", part);
    }
    Ok(form)
}

#[async_trait]
impl ContentApi for HttpContentApi {
    async fn fetch_sections(
        &self,
        page_id: Uuid,
        if_none_match: Option<String>,
    ) -> ApiResult<Fetched<SectionsResponse>> {
        let request = self
            .client
            .get(format!("{}/sections", self.root))
            .query(&[("pageId", page_id.to_string())]);
        let (status, headers, body) = self
            .send(with_precondition(request, IF_NONE_MATCH, if_none_match))
            .await?;

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }

        let mut data: SectionsResponse = decode(&body)?;
        let etag = header(&headers, ETAG).or_else(|| data.etag.clone());
        data.etag = etag.clone();
        data.page_etag = header(&headers, PAGE_ETAG_HEADER).or(data.page_etag);

        Ok(Fetched::Modified { data, etag })
    }

    async fn fetch_history(&self, page_id: Uuid) -> ApiResult<Fetched<HistoryResponse>> {
        let request = self
            .client
            .get(format!("{}/history", self.root))
            .query(&[("pageId", page_id.to_string())]);
        let (status, headers, body) = self.send(request).await?;

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }

        let mut data: HistoryResponse = decode(&body)?;
        let etag = header(&headers, ETAG).or_else(|| data.etag.clone());
        data.etag = etag.clone();

        Ok(Fetched::Modified { data, etag })
    }

    async fn upsert_section(
        &self,
        page_id: Uuid,
        payload: SectionUpsert,
        if_match: Option<String>,
    ) -> ApiResult<SectionMutation> {
        let request = self
            .client
            .post(self.section_url(page_id))
            .multipart(upsert_form(payload)?);
        let (_, headers, body) = self
            .send(with_precondition(request, IF_MATCH, if_match))
            .await?;

        let parsed: MutationBody = if body.trim().is_empty() {
            MutationBody::default()
        } else {
            decode(&body)?
        };
        let section_etag = header(&headers, ETAG)
            .or_else(|| parsed.section.as_ref().and_then(|s| s.etag.clone()));

        Ok(SectionMutation {
            section: parsed.section,
            section_etag,
            page_etag: header(&headers, PAGE_ETAG_HEADER).or(parsed.page_etag),
        })
    }

    async fn delete_section(
        &self,
        page_id: Uuid,
        section_id: Uuid,
        if_match: Option<String>,
    ) -> ApiResult<DeleteReply> {
        let request = self
            .client
            .delete(format!("{}/{}", self.section_url(page_id), section_id));
        let (_, headers, body) = self
            .send(with_precondition(request, IF_MATCH, if_match))
            .await?;

        let parsed: MutationBody = serde_json::from_str(&body).unwrap_or_default();
        let page_etag = header(&headers, ETAG)
            .or_else(|| header(&headers, PAGE_ETAG_HEADER))
            .or(parsed.page_etag);

        Ok(DeleteReply { page_etag })
    }

    async fn publish_page(
        &self,
        page_id: Uuid,
        if_match: Option<String>,
    ) -> ApiResult<PublishReply> {
        let request = self
            .client
            .post(format!("{}/pages/{}/publish", self.root, page_id));
        let (_, headers, body) = self
            .send(with_precondition(request, IF_MATCH, if_match))
            .await?;

        let parsed: PublishBody = serde_json::from_str(&body).unwrap_or_default();
        let etag = header(&headers, ETAG)
            .or_else(|| header(&headers, PAGE_ETAG_HEADER))
            .or(parsed.etag);

        Ok(PublishReply { etag })
    }
}
