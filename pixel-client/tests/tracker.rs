use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use httpmock::prelude::*;
use pixel_client::identity::{SESSION_ID_KEY, USER_ID_KEY};
use pixel_client::network::OnlineFlag;
use pixel_client::privacy::{ConsentPolicy, PrivacyUpdate};
use pixel_client::storage::{KeyValueStore, MemoryStore};
use pixel_client::tracker::{ClickTarget, FormField, FormSubmission, PageContext};
use pixel_client::transport::{Transport, TransportError};
use pixel_client::{Tracker, TrackerConfig, TrackerDeps};
use pixel_common::privacy::hash_user_id;
use pixel_common::{EventBatch, EventType, TrackedEvent};
use serde_json::{json, Map, Value};

#[derive(Default)]
struct RecordingTransport {
    batches: Mutex<Vec<EventBatch>>,
    opt_outs: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn events(&self) -> Vec<TrackedEvent> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.events.clone())
            .collect()
    }

    fn sends(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, batch: &EventBatch) -> Result<(), TransportError> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }

    async fn notify_opt_out(&self, hashed_user_id: &str) -> Result<(), TransportError> {
        self.opt_outs
            .lock()
            .unwrap()
            .push(hashed_user_id.to_string());
        Ok(())
    }
}

struct Harness {
    tracker: Arc<Tracker>,
    transport: Arc<RecordingTransport>,
    durable: Arc<MemoryStore>,
    session: Arc<MemoryStore>,
}

fn harness(config: TrackerConfig, durable: Arc<MemoryStore>) -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    let session = Arc::new(MemoryStore::new());
    let deps = TrackerDeps {
        durable: durable.clone(),
        session: session.clone(),
        transport: transport.clone(),
        network: Arc::new(OnlineFlag::default()),
    };

    Harness {
        tracker: Tracker::new(config, deps),
        transport,
        durable,
        session,
    }
}

fn setup(config: TrackerConfig) -> (Arc<Tracker>, Arc<RecordingTransport>) {
    let harness = harness(config, Arc::new(MemoryStore::new()));
    (harness.tracker, harness.transport)
}

fn consent(granted: bool) -> PrivacyUpdate {
    PrivacyUpdate {
        cookie_consent: Some(granted),
        ..Default::default()
    }
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

#[tokio::test]
async fn init_records_initialize_and_page_view_once() {
    let (tracker, transport) = setup(TrackerConfig::default());
    tracker.set_page(PageContext {
        url: "https://neuvera.ai/chat".to_string(),
        referrer: Some("https://search.example/".to_string()),
        title: Some("Chat".to_string()),
    });

    tracker.init().await;
    tracker.init().await;
    assert!(tracker.is_initialized());
    tracker.dispose().await;
    assert!(!tracker.is_initialized());

    let events = transport.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventType::Custom);
    assert_eq!(events[0].metadata_value("action"), Some(&json!("initialize")));
    assert_eq!(events[1].event_type, EventType::PageView);
    assert_eq!(events[1].current_url, "https://neuvera.ai/chat");
    assert_eq!(
        events[1].referrer_url.as_deref(),
        Some("https://search.example/")
    );
    assert_eq!(events[1].metadata_value("title"), Some(&json!("Chat")));
}

#[tokio::test]
async fn do_not_track_means_no_transport_calls() {
    let (tracker, transport) = setup(TrackerConfig::default());
    tracker
        .update_privacy_settings(PrivacyUpdate {
            do_not_track: Some(true),
            ..Default::default()
        })
        .await;

    tracker.init().await;
    for _ in 0..25 {
        tracker.track_button_click("send", None).await;
    }
    tracker.dispose().await;

    assert_eq!(transport.sends(), 0);
    assert_eq!(tracker.queued(), 0);
}

#[tokio::test]
async fn required_consent_blocks_until_granted() {
    let config = TrackerConfig {
        consent_policy: ConsentPolicy::Required,
        ..Default::default()
    };
    let (tracker, transport) = setup(config);

    tracker.track_engagement("page_focus", None).await;
    assert_eq!(tracker.queued(), 0);

    tracker
        .update_privacy_settings(PrivacyUpdate {
            cookie_consent: Some(true),
            ..Default::default()
        })
        .await;
    tracker
        .track_engagement("page_unload", Some(Duration::from_secs(3)))
        .await;
    tracker.dispose().await;

    let events = transport.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].metadata_value("action"), Some(&json!("privacy_update")));
    assert_eq!(events[1].event_type, EventType::Engagement);
    assert_eq!(events[1].metadata_value("duration"), Some(&json!(3000)));
}

#[tokio::test]
async fn sensitive_metadata_is_redacted_before_sending() {
    let (tracker, transport) = setup(TrackerConfig::default());

    tracker
        .track(
            "chat",
            "message",
            data(json!({
                "password": "hunter2",
                "message": "reach me at jane@example.com or 555-123-4567",
                "nested": { "token": "abc" },
            })),
        )
        .await;
    tracker.dispose().await;

    let events = transport.events();
    assert_eq!(events.len(), 1);
    let metadata = events[0].metadata.clone().unwrap();
    assert_eq!(metadata["password"], json!("[REDACTED]"));
    assert_eq!(
        metadata["message"],
        json!("reach me at [EMAIL REDACTED] or [PHONE REDACTED]")
    );
    assert_eq!(metadata["nested"]["token"], json!("[REDACTED]"));
    assert_eq!(metadata["category"], json!("chat"));
}

#[tokio::test]
async fn user_id_leaves_hashed() {
    let (tracker, transport) = setup(TrackerConfig::default());
    tracker.set_user_id("user-1").await;
    assert_eq!(tracker.user_id().as_deref(), Some("user-1"));

    tracker.track_page_view().await;
    tracker.dispose().await;

    let events = transport.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].metadata_value("action"), Some(&json!("identify")));
    for event in &events {
        assert_eq!(
            event.hashed_user_id.as_deref(),
            Some(hash_user_id("user-1").as_str())
        );
        let wire = serde_json::to_string(event).unwrap();
        assert!(!wire.contains("user-1"));
    }
}

#[tokio::test]
async fn raw_user_id_is_sent_when_anonymization_is_off() {
    let config = TrackerConfig {
        anonymize_user_id: false,
        ..Default::default()
    };
    let (tracker, transport) = setup(config);

    tracker.set_user_id("user-1").await;
    tracker.track_page_view().await;
    tracker.dispose().await;

    let events = transport.events();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| e.hashed_user_id.as_deref() == Some("user-1")));
}

#[tokio::test]
async fn user_id_reaches_storage_only_with_consent() {
    let Harness {
        tracker, durable, ..
    } = harness(TrackerConfig::default(), Arc::new(MemoryStore::new()));

    tracker.set_user_id("42").await;
    assert_eq!(tracker.user_id().as_deref(), Some("42"));
    assert_eq!(durable.get(USER_ID_KEY).unwrap(), None);

    tracker.update_privacy_settings(consent(true)).await;
    assert_eq!(durable.get(USER_ID_KEY).unwrap().as_deref(), Some("42"));

    tracker.set_user_id("43").await;
    assert_eq!(durable.get(USER_ID_KEY).unwrap().as_deref(), Some("43"));

    // a later tracker on the same profile picks the consented id up again
    let reopened = harness(TrackerConfig::default(), durable);
    assert_eq!(reopened.tracker.user_id().as_deref(), Some("43"));
}

#[tokio::test]
async fn withdrawing_consent_forgets_identity_and_queue() {
    let Harness {
        tracker,
        transport,
        durable,
        session,
    } = harness(TrackerConfig::default(), Arc::new(MemoryStore::new()));

    tracker.update_privacy_settings(consent(true)).await;
    tracker.set_user_id("42").await;
    tracker.track_button_click("send", None).await;
    assert_eq!(tracker.queued(), 3);
    let old_session = tracker.session_id();
    assert_eq!(durable.get(USER_ID_KEY).unwrap().as_deref(), Some("42"));

    tracker.update_privacy_settings(consent(false)).await;

    assert_eq!(durable.get(USER_ID_KEY).unwrap(), None);
    let new_session = tracker.session_id();
    assert_ne!(new_session, old_session);
    assert_eq!(
        session.get(SESSION_ID_KEY).unwrap(),
        Some(new_session.to_string())
    );

    // only the privacy update itself is left, under the new session
    assert_eq!(tracker.queued(), 1);
    tracker.dispose().await;
    let events = transport.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata_value("action"), Some(&json!("privacy_update")));
    assert_eq!(events[0].session_id, new_session);
}

#[tokio::test]
async fn opt_out_drops_queue_and_notifies_server() {
    let (tracker, transport) = setup(TrackerConfig::default());
    tracker.set_user_id("42").await;

    tracker.track_button_click("like", Some(json!({"pane": "left"}))).await;
    assert_eq!(tracker.queued(), 2);

    tracker.opt_out().await;
    assert!(tracker.is_opted_out());
    assert_eq!(tracker.queued(), 0);

    tracker.track_button_click("like", None).await;
    tracker.dispose().await;

    assert_eq!(transport.sends(), 0);
    assert_eq!(*transport.opt_outs.lock().unwrap(), vec![hash_user_id("42")]);

    tracker.opt_in().await;
    assert!(!tracker.is_opted_out());
}

#[tokio::test]
async fn queue_threshold_triggers_a_single_flush() {
    let (tracker, transport) = setup(TrackerConfig::default());

    for n in 0..12 {
        tracker
            .track_click(ClickTarget {
                element: "button".to_string(),
                id: Some(format!("b{n}")),
                ..Default::default()
            })
            .await;
    }

    assert_eq!(transport.sends(), 1);
    assert_eq!(transport.events().len(), 10);
    assert_eq!(tracker.queued(), 2);
}

#[tokio::test]
async fn forms_record_field_shape_only() {
    let (tracker, transport) = setup(TrackerConfig::default());

    tracker
        .track_form(FormSubmission {
            id: Some("signup".to_string()),
            fields: vec![
                FormField {
                    name: "email".to_string(),
                    field_type: "email".to_string(),
                    filled: true,
                    ..Default::default()
                },
                FormField {
                    name: "password".to_string(),
                    field_type: "password".to_string(),
                    filled: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
        .await;
    tracker.dispose().await;

    let events = transport.events();
    assert_eq!(events[0].event_type, EventType::FormSubmit);
    assert_eq!(
        events[0].metadata_value("formFields"),
        Some(&json!([{ "name": "email", "type": "email", "filled": true }]))
    );
}

#[tokio::test]
async fn clear_data_regenerates_identity() {
    let (tracker, _transport) = setup(TrackerConfig::default());
    let pixel_id = tracker.pixel_id();
    let session_id = tracker.session_id();
    tracker.set_user_id("7").await;
    tracker.opt_out().await;

    tracker.clear_data();

    assert_ne!(tracker.pixel_id(), pixel_id);
    assert_ne!(tracker.session_id(), session_id);
    assert_eq!(tracker.user_id(), None);
    assert!(!tracker.is_opted_out());
}

#[tokio::test]
async fn delivers_to_a_real_endpoint() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/track")
                .body_contains("\"eventType\":\"chat_interaction\"");
            then.status(200).json_body(json!({ "success": true }));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = TrackerConfig::with_endpoint(&server.base_url());
    let deps = TrackerDeps::with_profile(&config, dir.path().join("profile.json")).unwrap();
    let tracker = Tracker::new(config, deps);

    tracker
        .track_chat_interaction(pixel_client::tracker::ChatInteraction {
            role: pixel_client::tracker::ChatRole::AiResponse,
            message_length: Some(120),
            response_time_ms: Some(850),
        })
        .await;
    tracker.dispose().await;

    let mut hits = 0;
    for _ in 0..50 {
        hits = mock.hits_async().await;
        if hits > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hits, 1);
}
