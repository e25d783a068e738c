//! In-memory content service shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bugence_canvas::api::{
    ApiError, ApiResult, ContentApi, DeleteReply, Fetched, PublishReply, SectionMutation,
};
use bugence_canvas::model::{
    ContentType, HistoryResponse, Page, Section, SectionUpsert, SectionsResponse,
};
use bugence_canvas::{BaselineCache, CanvasEngine, KeyValueStore, SyncBus, SyncConfig};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const PAGE_ID: Uuid = Uuid::from_u128(0x100);
pub const S1: Uuid = Uuid::from_u128(0x1);
pub const S2: Uuid = Uuid::from_u128(0x2);

struct ServerState {
    page: Page,
    sections: Vec<Section>,
    revisions: HashMap<Uuid, u64>,
    sections_rev: u64,
    page_rev: u64,
}

impl ServerState {
    fn sections_token(&self) -> String {
        format!("s{}", self.sections_rev)
    }

    fn page_token(&self) -> String {
        format!("p{}", self.page_rev)
    }

    fn section_token(&self, section_id: Uuid) -> Option<String> {
        self.revisions.get(&section_id).map(|rev| format!("v{rev}"))
    }

    fn with_token(&self, section: &Section) -> Section {
        section.with_etag(self.section_token(section.id))
    }

    fn bump(&mut self) {
        self.sections_rev += 1;
        self.page_rev += 1;
    }

    /// Reject any token that is not the current one
    fn check(&self, expected: Option<String>, given: Option<&String>) -> ApiResult<()> {
        match given {
            Some(token) if Some(token) != expected.as_ref() => Err(ApiError::PreconditionFailed {
                message: "The resource has been modified.".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Content service double that enforces concurrency tokens like the real one
pub struct FakeContentService {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    fetches: AtomicUsize,
    publishes: AtomicUsize,
}

pub fn section(id: Uuid, key: &str, content: &str) -> Section {
    Section {
        id,
        section_key: key.to_string(),
        title: None,
        content_type: ContentType::Text,
        content_value: Some(content.to_string()),
        css_selector: Some(format!("#{key}")),
        media_path: None,
        media_alt_text: None,
        display_order: 0,
        is_locked: false,
        updated_at: DateTime::UNIX_EPOCH,
        last_published_at: None,
        previous_content_value: None,
        etag: None,
    }
}

impl FakeContentService {
    /// Page with S1 = "Hello" and S2 = "Footer"
    pub fn new() -> Arc<Self> {
        let sections = vec![section(S1, "hero", "Hello"), section(S2, "footer", "Footer")];
        let revisions = sections.iter().map(|s| (s.id, 1)).collect();
        Arc::new(Self {
            state: Mutex::new(ServerState {
                page: Page {
                    id: PAGE_ID,
                    name: "Home".to_string(),
                    slug: "home".to_string(),
                    description: None,
                    updated_at: DateTime::UNIX_EPOCH,
                    last_published_at: None,
                },
                sections,
                revisions,
                sections_rev: 1,
                page_rev: 1,
            }),
            offline: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            publishes: AtomicUsize::new(0),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn section_token(&self, section_id: Uuid) -> Option<String> {
        self.state.lock().unwrap().section_token(section_id)
    }

    pub fn content(&self, section_id: Uuid) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .sections
            .iter()
            .find(|s| s.id == section_id)
            .and_then(|s| s.content_value.clone())
    }

    /// Change a section the way another editor would
    pub fn remote_edit(&self, section_id: Uuid, content: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(section) = state.sections.iter_mut().find(|s| s.id == section_id) {
            section.previous_content_value = section.content_value.take();
            section.content_value = Some(content.to_string());
            section.updated_at = Utc::now();
        }
        *state.revisions.entry(section_id).or_insert(0) += 1;
        state.bump();
    }

    fn ensure_online(&self) -> ApiResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ApiError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContentApi for FakeContentService {
    async fn fetch_sections(
        &self,
        page_id: Uuid,
        if_none_match: Option<String>,
    ) -> ApiResult<Fetched<SectionsResponse>> {
        self.ensure_online()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock().unwrap();
        let token = state.sections_token();
        if if_none_match.as_ref() == Some(&token) {
            return Ok(Fetched::NotModified);
        }
        Ok(Fetched::Modified {
            data: SectionsResponse {
                page: Page {
                    id: page_id,
                    ..state.page.clone()
                },
                sections: state.sections.iter().map(|s| state.with_token(s)).collect(),
                etag: None,
                page_etag: Some(state.page_token()),
            },
            etag: Some(token),
        })
    }

    async fn fetch_history(&self, _page_id: Uuid) -> ApiResult<Fetched<HistoryResponse>> {
        self.ensure_online()?;
        Ok(Fetched::Modified {
            data: HistoryResponse::default(),
            etag: Some("h1".to_string()),
        })
    }

    async fn upsert_section(
        &self,
        _page_id: Uuid,
        payload: SectionUpsert,
        if_match: Option<String>,
    ) -> ApiResult<SectionMutation> {
        self.ensure_online()?;
        let mut state = self.state.lock().unwrap();

        let section_id = match payload.section_id {
            Some(section_id) => {
                state.check(state.section_token(section_id), if_match.as_ref())?;
                let section = state
                    .sections
                    .iter_mut()
                    .find(|s| s.id == section_id)
                    .ok_or_else(|| ApiError::Status {
                        status: 404,
                        message: "Section not found.".to_string(),
                    })?;
                if let Some(value) = payload.content_value {
                    section.previous_content_value = section.content_value.replace(value);
                }
                if let Some(alt) = payload.media_alt_text {
                    section.media_alt_text = Some(alt);
                }
                section.updated_at = Utc::now();
                section_id
            }
            None => {
                let selector = payload.selector.unwrap_or_default();
                let id = Uuid::new_v4();
                let mut created = section(id, selector.trim_start_matches('#'), "");
                created.content_type = payload.content_type.unwrap_or_default();
                created.content_value = payload.content_value;
                created.css_selector = Some(selector);
                created.display_order = state.sections.len() as i32;
                created.updated_at = Utc::now();
                state.sections.push(created);
                id
            }
        };

        *state.revisions.entry(section_id).or_insert(0) += 1;
        state.bump();

        let stored = state
            .sections
            .iter()
            .find(|s| s.id == section_id)
            .map(|s| state.with_token(s));
        Ok(SectionMutation {
            section_etag: state.section_token(section_id),
            page_etag: Some(state.page_token()),
            section: stored,
        })
    }

    async fn delete_section(
        &self,
        _page_id: Uuid,
        section_id: Uuid,
        if_match: Option<String>,
    ) -> ApiResult<DeleteReply> {
        self.ensure_online()?;
        let mut state = self.state.lock().unwrap();
        state.check(state.section_token(section_id), if_match.as_ref())?;

        state.sections.retain(|s| s.id != section_id);
        state.revisions.remove(&section_id);
        state.bump();
        Ok(DeleteReply {
            page_etag: Some(state.page_token()),
        })
    }

    async fn publish_page(
        &self,
        _page_id: Uuid,
        if_match: Option<String>,
    ) -> ApiResult<PublishReply> {
        self.ensure_online()?;
        let mut state = self.state.lock().unwrap();
        state.check(Some(state.page_token()), if_match.as_ref())?;

        self.publishes.fetch_add(1, Ordering::SeqCst);
        state.page.last_published_at = Some(Utc::now());
        state.page_rev += 1;
        Ok(PublishReply {
            etag: Some(state.page_token()),
        })
    }
}

pub fn unique_channel() -> String {
    format!("it:{}", Uuid::new_v4())
}

/// Engine over `api`, sharing `store` and `channel` with its siblings
pub fn engine(
    api: Arc<FakeContentService>,
    store: Arc<dyn KeyValueStore>,
    channel: &str,
) -> CanvasEngine {
    let config = SyncConfig::default().with_channel_name(channel);
    let bus = SyncBus::open(&config.channel_name, config.event_capacity);
    let baseline = BaselineCache::new(store, config.baseline_storage_key.clone());
    CanvasEngine::new(api, bus, baseline, config)
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
