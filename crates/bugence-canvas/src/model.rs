//! Canvas Content Types
//!
//! Pages, sections and point-in-time snapshots as exchanged with the content
//! service. Sections are treated as immutable values: every transition builds a
//! new `Section` and swaps it into a new snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of content a section renders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// Plain text
    Text,
    /// Raw HTML fragment
    Html,
    /// Image with alt text
    Image,
    /// Rich text (HTML produced by the editor)
    #[default]
    RichText,
}

impl ContentType {
    /// Wire representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Html => "Html",
            Self::Image => "Image",
            Self::RichText => "RichText",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "html" => Ok(Self::Html),
            "image" => Ok(Self::Image),
            "richtext" | "rich_text" => Ok(Self::RichText),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}

/// Reviewer verdict on a section; travels on the sync channel only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    /// Awaiting review
    Pending,
    /// Approved for publishing
    Approved,
    /// Sent back for changes
    Rejected,
}

/// Page-level fields of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Page identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// URL slug
    pub slug: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Last server-side modification
    #[serde(rename = "updatedAtUtc")]
    pub updated_at: DateTime<Utc>,
    /// Last publish, if any
    #[serde(rename = "lastPublishedAtUtc", default)]
    pub last_published_at: Option<DateTime<Utc>>,
}

/// An editable region of a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    /// Section identifier, unique within a page
    pub id: Uuid,
    /// Stable key assigned by the template
    pub section_key: String,
    /// Optional title
    #[serde(default)]
    pub title: Option<String>,
    /// Content kind
    pub content_type: ContentType,
    /// Text or HTML content
    #[serde(default)]
    pub content_value: Option<String>,
    /// CSS selector the section binds to
    #[serde(default)]
    pub css_selector: Option<String>,
    /// Stored media path for image sections
    #[serde(default)]
    pub media_path: Option<String>,
    /// Alt text for image sections
    #[serde(default)]
    pub media_alt_text: Option<String>,
    /// Ordering within the page
    #[serde(default)]
    pub display_order: i32,
    /// Locked sections are read-only in the editor
    #[serde(default)]
    pub is_locked: bool,
    /// Last modification
    #[serde(rename = "updatedAtUtc", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Last publish, if any
    #[serde(rename = "lastPublishedAtUtc", default)]
    pub last_published_at: Option<DateTime<Utc>>,
    /// Content value the last edit started from
    #[serde(default)]
    pub previous_content_value: Option<String>,
    /// Section concurrency token
    #[serde(default)]
    pub etag: Option<String>,
}

impl Section {
    /// Build a new section value with the edited fields applied and a fresh timestamp
    #[must_use]
    pub fn with_edit(&self, update: &SectionUpdate) -> Self {
        Self {
            content_value: update
                .content_value
                .clone()
                .or_else(|| self.content_value.clone()),
            media_alt_text: update
                .media_alt_text
                .clone()
                .or_else(|| self.media_alt_text.clone()),
            previous_content_value: self.content_value.clone(),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Build a new section value carrying the given concurrency token
    #[must_use]
    pub fn with_etag(&self, etag: Option<String>) -> Self {
        Self {
            etag,
            ..self.clone()
        }
    }
}

/// Point-in-time read of a page and its sections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    /// Page fields
    pub page: Page,
    /// Sections in server order
    pub sections: Vec<Section>,
    /// When the snapshot was taken
    pub retrieved_at: DateTime<Utc>,
}

impl CanvasSnapshot {
    /// Create a snapshot taken now
    #[must_use]
    pub fn new(page: Page, sections: Vec<Section>) -> Self {
        Self {
            page,
            sections,
            retrieved_at: Utc::now(),
        }
    }

    /// Get a section by ID
    #[must_use]
    pub fn section(&self, section_id: Uuid) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == section_id)
    }

    /// New snapshot with `section` replacing its namesake, or appended
    #[must_use]
    pub fn upsert_section(&self, section: Section) -> Self {
        let mut sections = self.sections.clone();
        match sections.iter().position(|s| s.id == section.id) {
            Some(pos) => sections[pos] = section,
            None => sections.push(section),
        }
        Self {
            page: self.page.clone(),
            sections,
            retrieved_at: Utc::now(),
        }
    }

    /// New snapshot without the given section
    #[must_use]
    pub fn remove_section(&self, section_id: Uuid) -> Self {
        Self {
            page: self.page.clone(),
            sections: self
                .sections
                .iter()
                .filter(|s| s.id != section_id)
                .cloned()
                .collect(),
            retrieved_at: Utc::now(),
        }
    }
}

/// Body of `GET sections`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionsResponse {
    /// Page fields
    pub page: Page,
    /// Sections of the page
    #[serde(default)]
    pub sections: Vec<Section>,
    /// Sections token (body fallback for the `ETag` header)
    #[serde(default)]
    pub etag: Option<String>,
    /// Page token
    #[serde(default)]
    pub page_etag: Option<String>,
}

/// Change classification attached to history entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDiff {
    /// added / modified / removed / unchanged
    pub change_type: String,
    /// Length before the change
    pub previous_length: usize,
    /// Length after the change
    pub current_length: usize,
    /// Signed character delta
    pub character_delta: i64,
    /// Whether either side contains markup
    pub contains_html: bool,
    /// Short excerpt of the new value
    #[serde(default)]
    pub snippet: Option<String>,
}

/// One entry of the content change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Entry identifier
    pub id: Uuid,
    /// Page the change belongs to
    pub site_page_id: Uuid,
    /// Section the change belongs to, if section-scoped
    #[serde(default)]
    pub page_section_id: Option<Uuid>,
    /// Changed field
    pub field_key: String,
    /// Value before the change
    #[serde(default)]
    pub previous_value: Option<String>,
    /// Value after the change
    #[serde(default)]
    pub new_value: Option<String>,
    /// Optional summary
    #[serde(default)]
    pub change_summary: Option<String>,
    /// Author
    pub performed_by_user_id: String,
    /// Author display name
    #[serde(default)]
    pub performed_by_display_name: Option<String>,
    /// When the change happened
    #[serde(rename = "performedAtUtc")]
    pub performed_at: DateTime<Utc>,
    /// Precomputed diff
    #[serde(default)]
    pub diff: Option<HistoryDiff>,
}

/// Body of `GET history`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Change log, newest first
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// History token
    #[serde(default)]
    pub etag: Option<String>,
}

/// Image file attached to a section upsert
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    /// Original file name
    pub file_name: String,
    /// MIME type
    pub content_type: String,
    /// Raw bytes
    pub bytes: Vec<u8>,
}

/// Input for creating a section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionCreate {
    /// CSS selector the new section binds to (required)
    pub selector: String,
    /// Content kind (defaults to rich text)
    pub content_type: Option<ContentType>,
    /// Initial content
    pub content_value: Option<String>,
    /// Initial alt text
    pub media_alt_text: Option<String>,
    /// Image file for image sections
    pub image: Option<ImageUpload>,
}

/// Partial update of an existing section; `None` leaves a field unchanged
#[derive(Debug, Clone, PartialEq)]
pub struct SectionUpdate {
    /// Target section
    pub section_id: Uuid,
    /// New content
    pub content_value: Option<String>,
    /// New alt text
    pub media_alt_text: Option<String>,
    /// Replacement image
    pub image: Option<ImageUpload>,
}

impl SectionUpdate {
    /// Update only the content value
    #[must_use]
    pub fn content(section_id: Uuid, value: impl Into<String>) -> Self {
        Self {
            section_id,
            content_value: Some(value.into()),
            media_alt_text: None,
            image: None,
        }
    }
}

/// Wire form of a create or update request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionUpsert {
    /// Present for updates
    pub section_id: Option<Uuid>,
    /// Present for creates
    pub selector: Option<String>,
    /// Content kind
    pub content_type: Option<ContentType>,
    /// Content value
    pub content_value: Option<String>,
    /// Alt text
    pub media_alt_text: Option<String>,
    /// Image file
    pub image: Option<ImageUpload>,
}

impl From<SectionCreate> for SectionUpsert {
    fn from(create: SectionCreate) -> Self {
        Self {
            section_id: None,
            selector: Some(create.selector),
            content_type: Some(create.content_type.unwrap_or_default()),
            content_value: create.content_value,
            media_alt_text: create.media_alt_text,
            image: create.image,
        }
    }
}

impl From<SectionUpdate> for SectionUpsert {
    fn from(update: SectionUpdate) -> Self {
        Self {
            section_id: Some(update.section_id),
            selector: None,
            content_type: None,
            content_value: update.content_value,
            media_alt_text: update.media_alt_text,
            image: update.image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(content: &str) -> Section {
        Section {
            id: Uuid::new_v4(),
            section_key: "hero".to_string(),
            title: None,
            content_type: ContentType::Text,
            content_value: Some(content.to_string()),
            css_selector: Some("#hero".to_string()),
            media_path: None,
            media_alt_text: None,
            display_order: 0,
            is_locked: false,
            updated_at: Utc::now(),
            last_published_at: None,
            previous_content_value: None,
            etag: Some("v1".to_string()),
        }
    }

    #[test]
    fn test_with_edit_builds_new_value() {
        let original = section("Hello");
        let edited = original.with_edit(&SectionUpdate::content(original.id, "Hello world"));

        assert_eq!(original.content_value.as_deref(), Some("Hello"));
        assert_eq!(edited.content_value.as_deref(), Some("Hello world"));
        assert_eq!(edited.previous_content_value.as_deref(), Some("Hello"));
        assert_eq!(edited.etag, original.etag);
        assert!(edited.updated_at >= original.updated_at);
    }

    #[test]
    fn test_snapshot_upsert_and_remove() {
        let page = Page {
            id: Uuid::new_v4(),
            name: "Home".to_string(),
            slug: "home".to_string(),
            description: None,
            updated_at: Utc::now(),
            last_published_at: None,
        };
        let first = section("A");
        let snapshot = CanvasSnapshot::new(page, vec![first.clone()]);

        let second = section("B");
        let grown = snapshot.upsert_section(second.clone());
        assert_eq!(grown.sections.len(), 2);
        assert_eq!(snapshot.sections.len(), 1);

        let replaced = grown.upsert_section(Section {
            content_value: Some("A2".to_string()),
            ..first.clone()
        });
        assert_eq!(replaced.sections[0].content_value.as_deref(), Some("A2"));

        let shrunk = replaced.remove_section(first.id);
        assert_eq!(shrunk.sections.len(), 1);
        assert_eq!(shrunk.sections[0].id, second.id);
    }

    #[test]
    fn test_section_wire_format() {
        let json = serde_json::json!({
            "id": Uuid::nil(),
            "sectionKey": "hero",
            "contentType": "RichText",
            "contentValue": "<p>Hi</p>",
            "cssSelector": "#hero",
            "displayOrder": 2,
            "isLocked": false,
            "etag": "\"abc\""
        });
        let parsed: Section = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.content_type, ContentType::RichText);
        assert_eq!(parsed.css_selector.as_deref(), Some("#hero"));
        assert_eq!(parsed.display_order, 2);
    }

    #[test]
    fn test_content_type_parse() {
        assert_eq!("richtext".parse::<ContentType>(), Ok(ContentType::RichText));
        assert_eq!("Image".parse::<ContentType>(), Ok(ContentType::Image));
        assert!("video".parse::<ContentType>().is_err());
    }
}
