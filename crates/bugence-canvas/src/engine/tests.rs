use super::*;
use crate::api::{
    ApiResult, DeleteReply, Fetched, MockContentApi, PublishReply, SectionMutation,
};
use crate::bus::{ReviewStatusPayload, SyncTopic, TelemetryResult};
use crate::diff::ChangeType;
use crate::kv::MemoryKvStore;
use crate::model::{
    ContentType, HistoryResponse, Page, ReviewStatus, Section, SectionCreate, SectionUpdate,
    SectionUpsert, SectionsResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::Semaphore;

fn page_id() -> Uuid {
    Uuid::from_u128(100)
}

fn s1() -> Uuid {
    Uuid::from_u128(1)
}

fn s2() -> Uuid {
    Uuid::from_u128(2)
}

fn page() -> Page {
    Page {
        id: page_id(),
        name: "Home".to_string(),
        slug: "home".to_string(),
        description: None,
        updated_at: DateTime::UNIX_EPOCH,
        last_published_at: None,
    }
}

fn section(id: Uuid, key: &str, content: &str, etag: &str) -> Section {
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
        etag: Some(etag.to_string()),
    }
}

fn sections_response() -> SectionsResponse {
    SectionsResponse {
        page: page(),
        sections: vec![
            section(s1(), "hero", "Hello", "v1"),
            section(s2(), "footer", "Bye", "v1"),
        ],
        etag: None,
        page_etag: Some("p1".to_string()),
    }
}

/// Mock that serves the initial load on any unconditional sections fetch
fn mock_with_load() -> MockContentApi {
    let mut api = MockContentApi::new();
    api.expect_fetch_sections()
        .withf(|_, if_none_match| if_none_match.is_none())
        .returning(|_, _| {
            Ok(Fetched::Modified {
                data: sections_response(),
                etag: Some("s1".to_string()),
            })
        });
    api
}

fn engine(api: MockContentApi) -> CanvasEngine {
    engine_over(Arc::new(api))
}

fn engine_over(api: Arc<dyn ContentApi>) -> CanvasEngine {
    let config = SyncConfig::default().with_channel_name(format!("test:{}", Uuid::new_v4()));
    let bus = SyncBus::open(&config.channel_name, config.event_capacity);
    let baseline = BaselineCache::new(
        Arc::new(MemoryKvStore::new()),
        config.baseline_storage_key.clone(),
    );
    CanvasEngine::new(api, bus, baseline, config)
}

async fn loaded(api: MockContentApi) -> CanvasEngine {
    let engine = engine(api);
    engine
        .load_sections(page_id(), LoadOptions::default())
        .await
        .unwrap();
    engine
}

/// Content service whose section writes wait until the test lets them through
struct GatedApi {
    gate: Semaphore,
    upserts: std::sync::Mutex<Vec<(Option<Uuid>, Option<String>)>>,
    arrived: watch::Sender<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    revision: AtomicU64,
}

impl GatedApi {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            upserts: std::sync::Mutex::new(Vec::new()),
            arrived: watch::channel(0).0,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            revision: AtomicU64::new(1),
        })
    }

    /// Let the oldest waiting write through
    fn release_one(&self) {
        self.gate.add_permits(1);
    }

    async fn wait_for_upserts(&self, count: usize) {
        let mut arrived = self.arrived.subscribe();
        tokio::time::timeout(Duration::from_secs(2), arrived.wait_for(|n| *n >= count))
            .await
            .unwrap()
            .unwrap();
    }

    fn upserts(&self) -> Vec<(Option<Uuid>, Option<String>)> {
        self.upserts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentApi for GatedApi {
    async fn fetch_sections(
        &self,
        page_id: Uuid,
        _if_none_match: Option<String>,
    ) -> ApiResult<Fetched<SectionsResponse>> {
        let mut data = sections_response();
        data.page.id = page_id;
        Ok(Fetched::Modified {
            data,
            etag: Some("s1".to_string()),
        })
    }

    async fn fetch_history(&self, _page_id: Uuid) -> ApiResult<Fetched<HistoryResponse>> {
        Ok(Fetched::NotModified)
    }

    async fn upsert_section(
        &self,
        _page_id: Uuid,
        payload: SectionUpsert,
        if_match: Option<String>,
    ) -> ApiResult<SectionMutation> {
        self.upserts
            .lock()
            .unwrap()
            .push((payload.section_id, if_match));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.arrived.send_modify(|n| *n += 1);

        self.gate.acquire().await.unwrap().forget();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let etag = format!("v{}", self.revision.fetch_add(1, Ordering::SeqCst) + 1);
        let section_id = payload.section_id.unwrap_or_else(Uuid::new_v4);
        let content = payload.content_value.unwrap_or_default();
        Ok(SectionMutation {
            section: Some(section(section_id, "hero", &content, &etag)),
            section_etag: Some(etag),
            page_etag: None,
        })
    }

    async fn delete_section(
        &self,
        _page_id: Uuid,
        _section_id: Uuid,
        _if_match: Option<String>,
    ) -> ApiResult<DeleteReply> {
        Ok(DeleteReply::default())
    }

    async fn publish_page(
        &self,
        _page_id: Uuid,
        _if_match: Option<String>,
    ) -> ApiResult<PublishReply> {
        Ok(PublishReply::default())
    }
}

fn content_of(engine: &CanvasEngine, section_id: Uuid) -> Option<String> {
    engine
        .state()
        .section(section_id)
        .and_then(|s| s.content_value.clone())
}

#[tokio::test]
async fn test_first_load_sets_baseline() {
    let engine = loaded(mock_with_load()).await;
    let state = engine.state();

    assert_eq!(state.page_id, Some(page_id()));
    assert_eq!(state.sections.len(), 2);
    assert_eq!(state.baseline.len(), 2);
    assert_eq!(state.baseline_version, 1);
    assert!(state.dirty_section_ids.is_empty());
    assert_eq!(state.sections_etag.as_deref(), Some("s1"));
    assert_eq!(state.page_etag.as_deref(), Some("p1"));
    assert!(!state.is_loading);
    assert!(state.last_synced_at.is_some());
    assert_eq!(engine.worker_page(), Some(page_id()));
}

#[tokio::test]
async fn test_load_failure_records_error() {
    let mut api = MockContentApi::new();
    api.expect_fetch_sections().returning(|_, _| {
        Err(ApiError::Status {
            status: 503,
            message: "Service unavailable".to_string(),
        })
    });
    let engine = engine(api);

    let err = engine
        .load_sections(page_id(), LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));

    let state = engine.state();
    assert!(!state.is_loading);
    assert_eq!(state.error.as_ref().and_then(|e| e.status), Some(503));
    assert_eq!(engine.worker_page(), None);
}

#[tokio::test]
async fn test_create_without_selector_makes_no_call() {
    // No upsert expectation: any call would panic
    let engine = loaded(mock_with_load()).await;

    let err = engine
        .create_section(
            page_id(),
            SectionCreate {
                selector: "   ".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(engine.state().pending_mutations, 0);
}

#[tokio::test]
async fn test_update_unknown_section() {
    let engine = loaded(mock_with_load()).await;
    let before = engine.state();

    let missing = Uuid::from_u128(99);
    let err = engine
        .update_section(page_id(), SectionUpdate::content(missing, "x"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SectionNotFound(id) if id == missing));
    assert_eq!(*engine.state(), *before);
}

#[tokio::test]
async fn test_update_before_load() {
    let engine = engine(MockContentApi::new());
    let err = engine
        .update_section(page_id(), SectionUpdate::content(s1(), "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PageNotLoaded(_)));
}

#[tokio::test]
async fn test_update_commits_and_stays_dirty() {
    let mut api = mock_with_load();
    api.expect_upsert_section()
        .withf(|_, payload, if_match| {
            payload.section_id == Some(s1()) && if_match.as_deref() == Some("v1")
        })
        .times(1)
        .returning(|_, _, _| {
            let mut stored = section(s1(), "hero", "Hello world", "v2");
            stored.previous_content_value = Some("Hello".to_string());
            Ok(SectionMutation {
                section: Some(stored),
                section_etag: Some("v2".to_string()),
                page_etag: Some("p2".to_string()),
            })
        });
    let engine = loaded(api).await;
    let baseline_before = engine.state().baseline.clone();
    let mut events = engine.subscribe_events();

    let saved = engine
        .update_section(page_id(), SectionUpdate::content(s1(), "Hello world"))
        .await
        .unwrap();

    assert_eq!(saved.etag.as_deref(), Some("v2"));
    let state = engine.state();
    assert_eq!(content_of(&engine, s1()).as_deref(), Some("Hello world"));
    assert_eq!(state.dirty_section_ids.iter().copied().collect::<Vec<_>>(), vec![s1()]);
    assert!(state.optimistic_section_ids.is_empty());
    assert_eq!(state.baseline, baseline_before);
    assert_eq!(state.page_etag.as_deref(), Some("p2"));
    assert_eq!(state.pending_mutations, 0);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert!(seen.contains(&CanvasEventType::SectionOptimistic));
    assert!(seen.contains(&CanvasEventType::SectionCommitted));
}

#[tokio::test]
async fn test_update_conflict_rolls_back() {
    let mut api = mock_with_load();
    api.expect_upsert_section().returning(|_, _, _| {
        Err(ApiError::PreconditionFailed {
            message: "stale".to_string(),
        })
    });
    let engine = loaded(api).await;
    let mut bus_rx = engine.bus().subscribe();

    let err = engine
        .update_section(page_id(), SectionUpdate::content(s1(), "Mine"))
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(err.status(), Some(412));

    let state = engine.state();
    assert_eq!(content_of(&engine, s1()).as_deref(), Some("Hello"));
    assert!(state.conflict_section_ids.contains(&s1()));
    assert!(state.dirty_section_ids.contains(&s1()));
    assert!(state.optimistic_section_ids.is_empty());
    assert_eq!(state.error.as_ref().and_then(|e| e.status), Some(412));
    assert_eq!(state.error.as_ref().and_then(|e| e.section_id), Some(s1()));

    let conflicted = crate::bus::next_matching(&mut bus_rx, |envelope| {
        envelope.event.topic() == SyncTopic::SectionConflicted
    })
    .await
    .unwrap();
    assert_eq!(conflicted.event.page_id(), page_id());
}

#[tokio::test]
async fn test_update_failure_reverts() {
    let mut api = mock_with_load();
    api.expect_upsert_section().returning(|_, _, _| {
        Err(ApiError::Status {
            status: 500,
            message: "boom".to_string(),
        })
    });
    let engine = loaded(api).await;

    let err = engine
        .update_section(page_id(), SectionUpdate::content(s1(), "Mine"))
        .await
        .unwrap_err();

    assert!(!err.is_conflict());
    assert_eq!(err.status(), Some(500));

    let state = engine.state();
    assert_eq!(content_of(&engine, s1()).as_deref(), Some("Hello"));
    assert!(state.conflict_section_ids.is_empty());
    assert!(state.optimistic_section_ids.is_empty());
    assert!(state.dirty_section_ids.is_empty());
    assert_eq!(state.error.as_ref().map(|e| e.message.as_str()), Some("boom"));
}

#[tokio::test]
async fn test_delete_failure_keeps_section() {
    let mut api = mock_with_load();
    api.expect_delete_section()
        .returning(|_, _, _| Err(ApiError::Transport("offline".to_string())));
    let engine = loaded(api).await;

    let err = engine.delete_section(page_id(), s2()).await.unwrap_err();

    assert!(matches!(err, Error::Network { .. }));
    let state = engine.state();
    assert!(state.section(s2()).is_some());
    assert_eq!(state.error.as_ref().and_then(|e| e.section_id), Some(s2()));
}

#[tokio::test]
async fn test_delete_removes_section() {
    let mut api = mock_with_load();
    api.expect_delete_section()
        .withf(|_, section_id, if_match| *section_id == s2() && if_match.as_deref() == Some("v1"))
        .returning(|_, _, _| {
            Ok(DeleteReply {
                page_etag: Some("p2".to_string()),
            })
        });
    let engine = loaded(api).await;

    engine.delete_section(page_id(), s2()).await.unwrap();

    let state = engine.state();
    assert!(state.section(s2()).is_none());
    assert_eq!(state.page_etag.as_deref(), Some("p2"));
    // Still in the baseline until published
    assert!(state.baseline.contains_key(&s2()));
}

#[tokio::test]
async fn test_duplicate_image_rejected() {
    let mut response = sections_response();
    response.sections[0].content_type = ContentType::Image;
    let mut api = MockContentApi::new();
    api.expect_fetch_sections().returning(move |_, _| {
        Ok(Fetched::Modified {
            data: response.clone(),
            etag: None,
        })
    });
    let engine = loaded(api).await;

    let err = engine
        .duplicate_section(page_id(), s1(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_duplicate_creates_copy() {
    let mut api = mock_with_load();
    api.expect_upsert_section()
        .withf(|_, payload, if_match| {
            payload.section_id.is_none()
                && payload.selector.as_deref() == Some("#hero")
                && payload.content_value.as_deref() == Some("Hello (Variant B)")
                && if_match.is_none()
        })
        .returning(|_, payload, _| {
            let mut created = section(Uuid::from_u128(3), "hero-b", "", "v1");
            created.content_value = payload.content_value;
            Ok(SectionMutation {
                section: Some(created),
                ..Default::default()
            })
        });
    let engine = loaded(api).await;

    let created = engine
        .duplicate_section(page_id(), s1(), Some("B"))
        .await
        .unwrap();

    assert_eq!(created.content_value.as_deref(), Some("Hello (Variant B)"));
    let state = engine.state();
    assert_eq!(state.sections.len(), 3);
    assert!(state.is_dirty(created.id));
}

#[tokio::test]
async fn test_publish_clears_dirty() {
    let mut api = mock_with_load();
    api.expect_upsert_section().returning(|_, _, _| {
        Ok(SectionMutation {
            section: Some(section(s1(), "hero", "Hello world", "v2")),
            section_etag: Some("v2".to_string()),
            page_etag: Some("p2".to_string()),
        })
    });
    api.expect_publish_page()
        .withf(|_, if_match| if_match.as_deref() == Some("p2"))
        .times(1)
        .returning(|_, _| {
            Ok(PublishReply {
                etag: Some("p3".to_string()),
            })
        });
    let engine = loaded(api).await;
    engine
        .update_section(page_id(), SectionUpdate::content(s1(), "Hello world"))
        .await
        .unwrap();
    let version_before = engine.state().baseline_version;

    let summary = engine.publish(page_id()).await.unwrap();

    assert_eq!(summary.entries.len(), 1);
    assert_eq!(summary.entries[0].section_id, s1());
    assert_eq!(summary.entries[0].change_type, ChangeType::Updated);

    let state = engine.state();
    assert!(state.dirty_section_ids.is_empty());
    assert!(!state.is_publishing);
    assert_eq!(state.page_etag.as_deref(), Some("p3"));
    assert_eq!(state.baseline_version, version_before + 1);
    let current = crate::diff::SnapshotEnvelope::capture(page_id(), &state.sections[0]);
    assert_eq!(state.baseline[&s1()].content_hash, current.content_hash);
}

#[tokio::test]
async fn test_publish_in_progress_rejected() {
    let engine = loaded(mock_with_load()).await;
    engine
        .inner
        .store
        .set_state(|state| state.is_publishing = true);

    let err = tokio_test::assert_err!(engine.publish(page_id()).await);
    assert!(matches!(err, Error::PublishInProgress(_)));
}

#[tokio::test]
async fn test_publish_conflict_reloads() {
    let mut api = mock_with_load();
    api.expect_publish_page().returning(|_, _| {
        Err(ApiError::PreconditionFailed {
            message: "stale".to_string(),
        })
    });
    let engine = loaded(api).await;

    let err = engine.publish(page_id()).await.unwrap_err();

    assert!(err.is_conflict());
    let state = engine.state();
    assert!(!state.is_publishing);
    assert_eq!(state.sections.len(), 2);
}

#[tokio::test]
async fn test_review_status_shared() {
    let engine = loaded(mock_with_load()).await;
    let mut bus_rx = engine.bus().subscribe();

    let payload = ReviewStatusPayload {
        page_id: page_id(),
        section_id: s1(),
        status: ReviewStatus::Approved,
        reviewer_id: Some(Uuid::from_u128(7)),
        reviewer_name: None,
        comment: None,
        updated_at: Utc::now(),
    };
    tokio_test::assert_ok!(engine.publish_review_status(payload.clone()));

    assert_eq!(
        engine.state().review_statuses.get(&s1()),
        Some(&ReviewStatus::Approved)
    );
    let received = bus_rx.recv().await.unwrap();
    assert_eq!(received.event.topic(), SyncTopic::ReviewStatusUpdated);

    let unknown = ReviewStatusPayload {
        section_id: Uuid::from_u128(42),
        ..payload
    };
    assert!(matches!(
        engine.publish_review_status(unknown),
        Err(Error::SectionNotFound(_))
    ));
}

#[tokio::test]
async fn test_reconcile_not_modified_only_touches_sync_time() {
    let mut api = mock_with_load();
    api.expect_fetch_sections()
        .withf(|_, if_none_match| if_none_match.as_deref() == Some("s1"))
        .times(1)
        .returning(|_, _| Ok(Fetched::NotModified));
    let engine = loaded(api).await;
    let before = engine.state();
    let mut events = engine.subscribe_events();
    let mut bus_rx = engine.bus().subscribe();

    let outcome = engine.reconcile(page_id()).await;

    assert_eq!(outcome, ReconcileOutcome::NotModified);
    let after = engine.state();
    let mut expected = (*before).clone();
    expected.last_synced_at = after.last_synced_at;
    assert_eq!(*after, expected);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    let telemetry = bus_rx.recv().await.unwrap();
    match telemetry.event {
        SyncEvent::Telemetry(payload) => assert_eq!(payload.result, TelemetryResult::Noop),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_reconcile_skipped_while_saving() {
    // Only the initial load may fetch
    let engine = loaded(mock_with_load()).await;
    engine
        .inner
        .store
        .set_state(|state| state.pending_mutations = 1);

    assert_eq!(engine.reconcile(page_id()).await, ReconcileOutcome::Skipped);
}

#[tokio::test]
async fn test_reconcile_applies_remote_change() {
    let mut api = mock_with_load();
    api.expect_fetch_sections()
        .withf(|_, if_none_match| if_none_match.is_some())
        .returning(|_, _| {
            let mut data = sections_response();
            data.sections[1] = section(s2(), "footer", "See you", "v2");
            Ok(Fetched::Modified {
                data,
                etag: Some("s2".to_string()),
            })
        });
    let engine = loaded(api).await;

    let outcome = engine.reconcile(page_id()).await;

    let ReconcileOutcome::Applied(diff) = outcome else {
        panic!("expected applied outcome, got {outcome:?}");
    };
    assert_eq!(diff.updated.len(), 1);
    let state = engine.state();
    assert_eq!(state.sections_etag.as_deref(), Some("s2"));
    assert_eq!(content_of(&engine, s2()).as_deref(), Some("See you"));
    assert!(state.is_dirty(s2()));
}

#[tokio::test]
async fn test_reconcile_error_is_contained() {
    let mut api = mock_with_load();
    api.expect_fetch_sections()
        .withf(|_, if_none_match| if_none_match.is_some())
        .returning(|_, _| Err(ApiError::Transport("offline".to_string())));
    let engine = loaded(api).await;
    let before = engine.state();

    let outcome = engine.reconcile(page_id()).await;

    assert_eq!(outcome, ReconcileOutcome::Failed("offline".to_string()));
    assert_eq!(*engine.state(), *before);
}

#[tokio::test]
async fn test_remote_review_status_applied() {
    let engine = loaded(mock_with_load()).await;
    let other = SyncBus::open(engine.bus().name(), 16);

    other.publish(SyncEvent::ReviewStatusUpdated(ReviewStatusPayload {
        page_id: page_id(),
        section_id: s2(),
        status: ReviewStatus::Rejected,
        reviewer_id: None,
        reviewer_name: Some("Ana".to_string()),
        comment: Some("Typo".to_string()),
        updated_at: Utc::now(),
    }));

    let mut rx = engine.subscribe_state();
    tokio::time::timeout(
        std::time::Duration::from_secs(2),
        rx.wait_for(|state| state.review_statuses.contains_key(&s2())),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_reset_clears_everything() {
    let engine = loaded(mock_with_load()).await;

    engine.reset().await;

    assert_eq!(*engine.state(), CanvasState::default());
    assert_eq!(engine.worker_page(), None);
}

#[tokio::test]
async fn test_updates_of_one_section_run_one_at_a_time() {
    let api = GatedApi::new();
    let engine = engine_over(api.clone());
    engine
        .load_sections(page_id(), LoadOptions::default())
        .await
        .unwrap();

    let first = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .update_section(page_id(), SectionUpdate::content(s1(), "A"))
                .await
        }
    });
    api.wait_for_upserts(1).await;
    let second = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .update_section(page_id(), SectionUpdate::content(s1(), "B"))
                .await
        }
    });

    // The second edit waits for the first round trip
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(api.upserts().len(), 1);
    assert_eq!(engine.state().pending_mutations, 1);

    api.release_one();
    let saved = first.await.unwrap().unwrap();
    assert_eq!(saved.etag.as_deref(), Some("v2"));

    api.wait_for_upserts(2).await;
    api.release_one();
    let saved = second.await.unwrap().unwrap();
    assert_eq!(saved.etag.as_deref(), Some("v3"));

    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(
        api.upserts(),
        vec![
            (Some(s1()), Some("v1".to_string())),
            (Some(s1()), Some("v2".to_string())),
        ]
    );
    assert_eq!(content_of(&engine, s1()).as_deref(), Some("B"));
    assert_eq!(engine.state().pending_mutations, 0);
}

#[tokio::test]
async fn test_update_reply_after_page_switch_is_discarded() {
    let other_page = Uuid::from_u128(200);
    let api = GatedApi::new();
    let engine = engine_over(api.clone());
    engine
        .load_sections(page_id(), LoadOptions::default())
        .await
        .unwrap();

    let pending = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .update_section(page_id(), SectionUpdate::content(s1(), "Stale"))
                .await
        }
    });
    api.wait_for_upserts(1).await;

    engine
        .load_sections(other_page, LoadOptions::default())
        .await
        .unwrap();
    let switched = engine.state();
    assert!(switched.is_active(other_page));
    assert_eq!(content_of(&engine, s1()).as_deref(), Some("Hello"));

    api.release_one();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Superseded(id) if id == page_id()));

    let mut expected = (*switched).clone();
    expected.pending_mutations = 0;
    assert_eq!(*engine.state(), expected);
}

#[tokio::test]
async fn test_reset_keeps_in_flight_mutations_counted() {
    let api = GatedApi::new();
    let engine = engine_over(api.clone());
    engine
        .load_sections(page_id(), LoadOptions::default())
        .await
        .unwrap();

    let before_reset = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .update_section(page_id(), SectionUpdate::content(s1(), "One"))
                .await
        }
    });
    api.wait_for_upserts(1).await;

    engine.reset().await;
    assert!(engine.state().is_saving());

    engine
        .load_sections(page_id(), LoadOptions::default())
        .await
        .unwrap();
    let after_reset = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .update_section(page_id(), SectionUpdate::content(s2(), "Two"))
                .await
        }
    });
    api.wait_for_upserts(2).await;

    // Only the mutation started before the reset finishes
    api.release_one();
    let _ = before_reset.await.unwrap();

    let state = engine.state();
    assert_eq!(state.pending_mutations, 1);
    assert!(state.optimistic_section_ids.contains(&s2()));
    assert_eq!(engine.reconcile(page_id()).await, ReconcileOutcome::Skipped);

    api.release_one();
    after_reset.await.unwrap().unwrap();
    assert_eq!(engine.state().pending_mutations, 0);
}
