//! Snapshot & Diff Engine
//!
//! Pure comparison functions. `diff_snapshots` classifies live sections
//! between two snapshots by identity and field values; `diff_envelope_sets`
//! compares hashable [`SnapshotEnvelope`]s and drives dirty tracking, publish
//! summaries and the `section.changed` stream.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::model::{CanvasSnapshot, ContentType, Page, ReviewStatus, Section};

/// Content changes above this many characters get an informational annotation
const LARGE_DELTA_CHARS: usize = 1024;

/// Identity-independent, hashable form of one section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Page the section belongs to
    pub page_id: Uuid,
    /// Section identifier
    pub section_id: Uuid,
    /// CSS selector at capture time
    pub selector: Option<String>,
    /// Section `updated_at` in milliseconds
    pub change_version: i64,
    /// When the envelope was built
    pub captured_at: DateTime<Utc>,
    /// Hash of the content fields
    pub content_hash: String,
    /// Section concurrency token at capture time
    pub etag: Option<String>,
    /// Token the local edits leading to this revision were based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_etag: Option<String>,
    /// Full section value
    pub payload: Section,
}

impl SnapshotEnvelope {
    /// Capture a section of the given page
    #[must_use]
    pub fn capture(page_id: Uuid, section: &Section) -> Self {
        Self {
            page_id,
            section_id: section.id,
            selector: section.css_selector.clone(),
            change_version: section.updated_at.timestamp_millis(),
            captured_at: Utc::now(),
            content_hash: content_hash(section),
            etag: section.etag.clone(),
            base_etag: None,
            payload: section.clone(),
        }
    }

    /// Mark the envelope as the result of local edits based on `base_etag`
    #[must_use]
    pub fn with_base_etag(mut self, base_etag: impl Into<String>) -> Self {
        self.base_etag = Some(base_etag.into());
        self
    }
}

/// Capture every section of a page
#[must_use]
pub fn capture_all(page_id: Uuid, sections: &[Section]) -> Vec<SnapshotEnvelope> {
    sections
        .iter()
        .map(|section| SnapshotEnvelope::capture(page_id, section))
        .collect()
}

/// Hash the content-bearing fields of a section.
///
/// Keys are rendered in sorted order so the hash only depends on values.
/// Neither the concurrency token nor publish metadata is part of the content.
#[must_use]
pub fn content_hash(section: &Section) -> String {
    let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    fields.insert("id", section.id.to_string().into());
    fields.insert("sectionKey", section.section_key.clone().into());
    fields.insert("contentType", section.content_type.as_str().into());
    fields.insert("contentValue", section.content_value.clone().into());
    fields.insert("mediaPath", section.media_path.clone().into());
    fields.insert("mediaAltText", section.media_alt_text.clone().into());
    fields.insert("displayOrder", section.display_order.into());
    fields.insert("isLocked", section.is_locked.into());
    fields.insert("updatedAtUtc", timestamp(&section.updated_at).into());

    let rendered = serde_json::to_string(&fields).unwrap_or_default();
    let digest = Sha256::digest(rendered.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("h:{hex}")
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

// ============================================================================
// Snapshot diff
// ============================================================================

/// A section present on both sides with differing fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionChange {
    /// Value in the previous snapshot
    pub previous: Section,
    /// Value in the next snapshot
    pub next: Section,
}

/// Result of comparing two snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Sections only in the next snapshot
    pub added: Vec<Section>,
    /// Sections whose fields changed
    pub updated: Vec<SectionChange>,
    /// Sections only in the previous snapshot
    pub removed: Vec<Section>,
    /// Sections present on both sides with identical fields
    pub unchanged: Vec<Uuid>,
    /// Page-level fields changed, or there was no previous snapshot
    pub page_changed: bool,
}

impl SnapshotDiff {
    /// True when nothing changed at section or page level
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && !self.page_changed
    }
}

fn section_changed(previous: &Section, next: &Section) -> bool {
    previous.updated_at != next.updated_at
        || previous.content_value != next.content_value
        || previous.media_path != next.media_path
        || previous.media_alt_text != next.media_alt_text
        || previous.display_order != next.display_order
        || previous.is_locked != next.is_locked
}

fn page_changed(previous: &Page, next: &Page) -> bool {
    previous.updated_at != next.updated_at
        || previous.name != next.name
        || previous.description != next.description
        || previous.slug != next.slug
}

/// Compare two snapshots; on first load everything in `next` is added
#[must_use]
pub fn diff_snapshots(previous: Option<&CanvasSnapshot>, next: &CanvasSnapshot) -> SnapshotDiff {
    let Some(previous) = previous else {
        return SnapshotDiff {
            added: next.sections.clone(),
            page_changed: true,
            ..SnapshotDiff::default()
        };
    };

    let mut lookup: HashMap<Uuid, &Section> =
        previous.sections.iter().map(|s| (s.id, s)).collect();
    let mut diff = SnapshotDiff {
        page_changed: page_changed(&previous.page, &next.page),
        ..SnapshotDiff::default()
    };

    for section in &next.sections {
        match lookup.remove(&section.id) {
            None => diff.added.push(section.clone()),
            Some(prior) if section_changed(prior, section) => diff.updated.push(SectionChange {
                previous: prior.clone(),
                next: section.clone(),
            }),
            Some(_) => diff.unchanged.push(section.id),
        }
    }

    // Preserve previous ordering for removals
    diff.removed = previous
        .sections
        .iter()
        .filter(|s| lookup.contains_key(&s.id))
        .cloned()
        .collect();

    diff
}

// ============================================================================
// Envelope diff
// ============================================================================

/// Classification of one envelope pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Only present after
    Added,
    /// Present on both sides with a different hash
    Updated,
    /// Only present before
    Removed,
    /// Same hash on both sides
    Unchanged,
    /// Both sides edited from diverging revisions
    Conflict,
}

impl ChangeType {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Unchanged => "unchanged",
            Self::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a diff annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationSeverity {
    /// Informational
    Info,
    /// Needs a reviewer's attention
    Warning,
    /// Blocks a clean merge
    Error,
}

/// Reviewer hint attached to a diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffAnnotation {
    /// Machine readable code
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Severity
    pub severity: AnnotationSeverity,
    /// Field the annotation refers to
    pub field: Option<String>,
}

impl DiffAnnotation {
    fn new(code: &str, message: &str, severity: AnnotationSeverity, field: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            severity,
            field: Some(field.to_string()),
        }
    }
}

/// Diff of a single section between two envelope sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEnvelope {
    /// Page identifier
    pub page_id: Uuid,
    /// Section identifier
    pub section_id: Uuid,
    /// Classification
    pub change_type: ChangeType,
    /// Envelope on the "before" side
    pub before: Option<SnapshotEnvelope>,
    /// Envelope on the "after" side
    pub after: Option<SnapshotEnvelope>,
    /// Reviewer hints
    #[serde(default)]
    pub annotations: Vec<DiffAnnotation>,
}

impl DiffEnvelope {
    /// The most recent payload of the pair
    #[must_use]
    pub fn latest_payload(&self) -> Option<&Section> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|envelope| &envelope.payload)
    }

    /// The most recent content hash of the pair
    #[must_use]
    pub fn latest_hash(&self) -> Option<&str> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|envelope| envelope.content_hash.as_str())
    }
}

/// Options for envelope comparison
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Classify diverging concurrent edits as [`ChangeType::Conflict`]
    pub detect_conflicts: bool,
}

impl DiffOptions {
    /// Options with conflict detection enabled
    #[must_use]
    pub fn detecting_conflicts() -> Self {
        Self {
            detect_conflicts: true,
        }
    }
}

/// Both sides carry diverging tokens and `after` was not written on top of
/// `before`. A known local base token decides; otherwise the content the edit
/// started from is compared with the `before` content.
fn is_conflicting(before: &SnapshotEnvelope, after: &SnapshotEnvelope) -> bool {
    let (Some(before_etag), Some(after_etag)) = (&before.etag, &after.etag) else {
        return false;
    };
    if before_etag == after_etag {
        return false;
    }
    if let Some(base) = &after.base_etag {
        return base != before_etag;
    }
    after
        .payload
        .previous_content_value
        .as_ref()
        .is_some_and(|origin| Some(origin) != before.payload.content_value.as_ref())
}

fn annotate(
    change_type: ChangeType,
    before: Option<&SnapshotEnvelope>,
    after: Option<&SnapshotEnvelope>,
) -> Vec<DiffAnnotation> {
    let mut annotations = Vec::new();
    let before_content = before
        .and_then(|e| e.payload.content_value.as_deref())
        .unwrap_or_default();
    let after_content = after
        .and_then(|e| e.payload.content_value.as_deref())
        .unwrap_or_default();

    match change_type {
        ChangeType::Updated | ChangeType::Conflict => {
            let (Some(before), Some(after)) = (before, after) else {
                return annotations;
            };
            if after_content.len().abs_diff(before_content.len()) > LARGE_DELTA_CHARS {
                annotations.push(DiffAnnotation::new(
                    "content.delta.large",
                    "Section content changed by more than 1KB.",
                    AnnotationSeverity::Info,
                    "contentValue",
                ));
            }
            if before.payload.media_path != after.payload.media_path
                && (before.payload.media_path.is_some() || after.payload.media_path.is_some())
            {
                annotations.push(DiffAnnotation::new(
                    "media.path.changed",
                    "Primary media asset replaced.",
                    AnnotationSeverity::Warning,
                    "mediaPath",
                ));
            }
            if before.payload.media_alt_text != after.payload.media_alt_text
                && after.payload.media_alt_text.as_deref() == Some("")
            {
                annotations.push(DiffAnnotation::new(
                    "media.alt.missing",
                    "Media alt text cleared during the update.",
                    AnnotationSeverity::Warning,
                    "mediaAltText",
                ));
            }
            if change_type == ChangeType::Conflict {
                annotations.push(DiffAnnotation::new(
                    "content.conflict",
                    "Remote update differs from local baseline.",
                    AnnotationSeverity::Error,
                    "contentValue",
                ));
            }
        }
        ChangeType::Added if after_content.is_empty() => {
            annotations.push(DiffAnnotation::new(
                "content.empty",
                "New section was introduced without content.",
                AnnotationSeverity::Warning,
                "contentValue",
            ));
        }
        ChangeType::Removed if !before_content.is_empty() => {
            annotations.push(DiffAnnotation::new(
                "content.removal",
                "Section with content was removed.",
                AnnotationSeverity::Warning,
                "contentValue",
            ));
        }
        _ => {}
    }

    annotations
}

/// Compare two envelopes of the same section; `None` when both are absent
#[must_use]
pub fn section_diff(
    before: Option<&SnapshotEnvelope>,
    after: Option<&SnapshotEnvelope>,
    options: DiffOptions,
) -> Option<DiffEnvelope> {
    let (page_id, section_id, change_type) = match (before, after) {
        (None, None) => return None,
        (None, Some(after)) => (after.page_id, after.section_id, ChangeType::Added),
        (Some(before), None) => (before.page_id, before.section_id, ChangeType::Removed),
        (Some(before), Some(after)) => {
            let change_type = if before.content_hash == after.content_hash {
                ChangeType::Unchanged
            } else if options.detect_conflicts && is_conflicting(before, after) {
                ChangeType::Conflict
            } else {
                ChangeType::Updated
            };
            (after.page_id, after.section_id, change_type)
        }
    };

    Some(DiffEnvelope {
        page_id,
        section_id,
        change_type,
        before: before.cloned(),
        after: after.cloned(),
        annotations: annotate(change_type, before, after),
    })
}

/// Compare two envelope sets by section id and content hash.
///
/// Only changed sections are returned: entries of `after` in their order,
/// then removals in the order of `before`.
#[must_use]
pub fn diff_envelope_sets<'a>(
    before: impl IntoIterator<Item = &'a SnapshotEnvelope>,
    after: &[SnapshotEnvelope],
    options: DiffOptions,
) -> Vec<DiffEnvelope> {
    let before: Vec<&SnapshotEnvelope> = before.into_iter().collect();
    let mut lookup: HashMap<Uuid, &SnapshotEnvelope> =
        before.iter().map(|e| (e.section_id, *e)).collect();
    let mut diffs = Vec::new();

    for envelope in after {
        let prior = lookup.remove(&envelope.section_id);
        if let Some(diff) = section_diff(prior, Some(envelope), options) {
            if diff.change_type != ChangeType::Unchanged {
                diffs.push(diff);
            }
        }
    }

    for envelope in before {
        if lookup.remove(&envelope.section_id).is_some() {
            diffs.extend(section_diff(Some(envelope), None, options));
        }
    }

    diffs
}

// ============================================================================
// Publish summary
// ============================================================================

/// One changed section in a publish summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishSummaryEntry {
    /// Section identifier
    pub section_id: Uuid,
    /// Template key of the section
    pub section_key: String,
    /// Content kind
    pub content_type: ContentType,
    /// How the section changed since the previous baseline
    pub change_type: ChangeType,
    /// Reviewer verdict at publish time
    pub reviewer_status: Option<ReviewStatus>,
    /// Stable identifier of the published revision
    pub diff_id: String,
}

/// Changes released by one publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishSummary {
    /// Page identifier
    pub page_id: Uuid,
    /// When the summary was built
    pub generated_at: DateTime<Utc>,
    /// Changed sections
    pub entries: Vec<PublishSummaryEntry>,
    /// Free-form notes
    pub notes: Option<String>,
}

impl PublishSummary {
    /// Build a summary from envelope diffs; unchanged sections are skipped
    #[must_use]
    pub fn build(
        page_id: Uuid,
        diffs: &[DiffEnvelope],
        review_statuses: &BTreeMap<Uuid, ReviewStatus>,
    ) -> Self {
        let generated_at = Utc::now();
        let entries = diffs
            .iter()
            .filter(|diff| diff.change_type != ChangeType::Unchanged)
            .map(|diff| {
                let payload = diff.latest_payload();
                PublishSummaryEntry {
                    section_id: diff.section_id,
                    section_key: payload
                        .map_or_else(|| "unknown".to_string(), |p| p.section_key.clone()),
                    content_type: payload.map_or(ContentType::Text, |p| p.content_type),
                    change_type: diff.change_type,
                    reviewer_status: review_statuses.get(&diff.section_id).copied(),
                    diff_id: diff.latest_hash().map_or_else(
                        || format!("{}:{}", diff.section_id, generated_at.to_rfc3339()),
                        str::to_string,
                    ),
                }
            })
            .collect();

        Self {
            page_id,
            generated_at,
            entries,
            notes: None,
        }
    }

    /// Check if the publish released no changes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
