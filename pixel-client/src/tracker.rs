use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pixel_common::event::now_millis;
use pixel_common::privacy::hash_user_id;
use pixel_common::sanitize::sanitize;
use pixel_common::{EventType, TrackedEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use crate::batcher::Batcher;
use crate::config::TrackerConfig;
use crate::identity::IdentityStore;
use crate::network::{NetworkStatus, OnlineFlag};
use crate::privacy::{PrivacyGate, PrivacySettings, PrivacyUpdate};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};
use crate::transport::{HttpTransport, Transport, TransportError};

/// Everything the tracker talks to, injected so hosts and tests choose.
#[derive(Clone)]
pub struct TrackerDeps {
    pub durable: Arc<dyn KeyValueStore + Send + Sync>,
    pub session: Arc<dyn KeyValueStore + Send + Sync>,
    pub transport: Arc<dyn Transport + Send + Sync>,
    pub network: Arc<dyn NetworkStatus + Send + Sync>,
}

impl TrackerDeps {
    /// Durable identity in a JSON profile file, session identity in memory,
    /// HTTP delivery to the configured endpoints.
    pub fn with_profile(
        config: &TrackerConfig,
        profile: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            durable: Arc::new(FileStore::open(profile)),
            session: Arc::new(MemoryStore::new()),
            transport: Arc::new(HttpTransport::new(config)?),
            network: Arc::new(OnlineFlag::default()),
        })
    }
}

/// Where the host currently is. Events carry the url and referrer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PageContext {
    pub url: String,
    pub referrer: Option<String>,
    pub title: Option<String>,
}

impl PageContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickTarget {
    pub element: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
}

const CLICK_TEXT_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub id: Option<String>,
    pub field_type: String,
    /// The value itself is never recorded
    pub filled: bool,
}

impl FormField {
    fn is_password_like(&self) -> bool {
        self.field_type.eq_ignore_ascii_case("password")
            || self.name.to_lowercase().contains("password")
            || self
                .id
                .as_deref()
                .is_some_and(|id| id.to_lowercase().contains("password"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormSubmission {
    pub id: Option<String>,
    pub action: Option<String>,
    pub method: Option<String>,
    pub classes: Vec<String>,
    pub fields: Vec<FormField>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    UserMessage,
    AiResponse,
}

/// Shape of a chat exchange. Message content is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInteraction {
    #[serde(rename = "type")]
    pub role: ChatRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

struct TrackerState {
    settings: PrivacySettings,
    page: PageContext,
    pixel_id: Uuid,
    session_id: Uuid,
    /// Raw id as the host gave it. On disk only while cookie consent holds.
    user_id: Option<String>,
}

struct Lifecycle {
    cancel: CancellationToken,
    timer: JoinHandle<()>,
}

/// Client-side entry point. Construct one per host, call [`Tracker::init`]
/// once the runtime is up and [`Tracker::dispose`] on the way out.
///
/// No `track*` call ever returns an error: when privacy settings deny
/// tracking the call does nothing, delivery problems are logged.
pub struct Tracker {
    config: TrackerConfig,
    identity: IdentityStore,
    gate: PrivacyGate,
    batcher: Arc<Batcher>,
    transport: Arc<dyn Transport + Send + Sync>,
    state: Mutex<TrackerState>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Tracker {
    pub fn new(config: TrackerConfig, deps: TrackerDeps) -> Arc<Self> {
        let identity = IdentityStore::new(deps.durable, deps.session);
        let batcher = Arc::new(Batcher::new(
            deps.transport.clone(),
            deps.network,
            config.max_queue_size,
            config.max_attempts,
        ));

        let state = TrackerState {
            settings: PrivacySettings {
                anonymize_user_id: config.anonymize_user_id,
                ..Default::default()
            },
            page: PageContext::default(),
            pixel_id: identity.get_or_create_pixel_id(),
            session_id: identity.get_or_create_session_id(),
            user_id: identity.user_id(),
        };

        Arc::new(Self {
            gate: PrivacyGate::new(config.consent_policy),
            config,
            identity,
            batcher,
            transport: deps.transport,
            state: Mutex::new(state),
            lifecycle: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<Lifecycle>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the periodic flush and record the initial events. Calling it
    /// again while initialized does nothing.
    pub async fn init(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.is_some() {
                return;
            }
            let cancel = CancellationToken::new();
            let timer = self
                .batcher
                .spawn_flush_timer(self.config.flush_interval, cancel.clone());
            *lifecycle = Some(Lifecycle { cancel, timer });
        }

        info!(pixel_id = %self.pixel_id(), "tracker initialized");
        self.track("system", "initialize", Map::new()).await;
        self.track_page_view().await;
    }

    /// Stop the timer and push out whatever is still queued, online or not,
    /// after any flush already running.
    pub async fn dispose(&self) {
        let lifecycle = self.lifecycle().take();
        if let Some(Lifecycle { cancel, timer }) = lifecycle {
            cancel.cancel();
            if let Err(err) = timer.await {
                debug!("flush timer ended abnormally: {}", err);
            }
        }

        let outcome = self.batcher.drain().await;
        debug!("final flush: {:?}", outcome);
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle().is_some()
    }

    /// Generic entry point. `page/view`, `interaction/click` and
    /// `interaction/form_submit` map onto their dedicated types, anything
    /// else is recorded as `custom` with the category and action in metadata.
    pub async fn track(&self, category: &str, action: &str, data: Map<String, Value>) {
        let mut metadata = data;
        let event_type = match (category, action) {
            ("page", "view") => EventType::PageView,
            ("interaction", "click") => EventType::Click,
            ("interaction", "form_submit") => EventType::FormSubmit,
            _ => {
                metadata.insert("category".to_string(), Value::from(category));
                metadata.insert("action".to_string(), Value::from(action));
                EventType::Custom
            }
        };

        self.record(event_type, metadata).await;
    }

    pub async fn track_page_view(&self) {
        let page = self.state().page.clone();
        let mut metadata = Map::new();
        metadata.insert("page".to_string(), Value::from(page.url));
        metadata.insert(
            "referrer".to_string(),
            Value::from(page.referrer.unwrap_or_default()),
        );
        metadata.insert(
            "title".to_string(),
            Value::from(page.title.unwrap_or_default()),
        );

        self.record(EventType::PageView, metadata).await;
    }

    pub async fn track_click(&self, target: ClickTarget) {
        let mut target = target;
        target.text = target
            .text
            .map(|text| text.chars().take(CLICK_TEXT_LIMIT).collect());

        self.record(EventType::Click, to_metadata(&target)).await;
    }

    pub async fn track_form(&self, form: FormSubmission) {
        let fields: Vec<Value> = form
            .fields
            .iter()
            .filter(|field| !field.name.is_empty() && !field.is_password_like())
            .map(|field| {
                json!({
                    "name": field.name,
                    "type": field.field_type,
                    "filled": field.filled,
                })
            })
            .collect();

        let mut metadata = Map::new();
        metadata.insert("formId".to_string(), Value::from(form.id.unwrap_or_default()));
        metadata.insert(
            "formAction".to_string(),
            Value::from(form.action.unwrap_or_default()),
        );
        metadata.insert(
            "formMethod".to_string(),
            Value::from(form.method.unwrap_or_else(|| "get".to_string())),
        );
        metadata.insert("formClasses".to_string(), Value::from(form.classes.join(" ")));
        metadata.insert("formFields".to_string(), Value::Array(fields));

        self.record(EventType::FormSubmit, metadata).await;
    }

    pub async fn track_chat_interaction(&self, interaction: ChatInteraction) {
        self.record(EventType::ChatInteraction, to_metadata(&interaction))
            .await;
    }

    pub async fn track_button_click(&self, name: &str, context: Option<Value>) {
        let mut metadata = Map::new();
        metadata.insert("buttonName".to_string(), Value::from(name));
        if let Some(context) = context {
            metadata.insert("context".to_string(), context);
        }

        self.record(EventType::ButtonClick, metadata).await;
    }

    pub async fn track_engagement(&self, kind: &str, duration: Option<Duration>) {
        let mut metadata = Map::new();
        metadata.insert("engagementType".to_string(), Value::from(kind));
        if let Some(duration) = duration {
            metadata.insert(
                "duration".to_string(),
                Value::from(duration.as_millis() as u64),
            );
        }

        self.record(EventType::Engagement, metadata).await;
    }

    /// Navigation reported by the host. Does not record anything by itself.
    pub fn set_page(&self, page: PageContext) {
        self.state().page = page;
    }

    /// Identify the user and record `user/identify`. The id is kept in
    /// memory, and written to durable storage only with cookie consent.
    pub async fn set_user_id(&self, user_id: &str) {
        {
            let mut state = self.state();
            state.user_id = Some(user_id.to_string());
            if state.settings.cookie_consent {
                self.identity.persist_user_id(user_id);
            }
        }

        self.track("user", "identify", Map::new()).await;
    }

    pub fn user_id(&self) -> Option<String> {
        self.state().user_id.clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.state().session_id
    }

    pub fn pixel_id(&self) -> Uuid {
        self.state().pixel_id
    }

    pub fn privacy_settings(&self) -> PrivacySettings {
        self.state().settings.clone()
    }

    /// Merge a partial update. Granting cookie consent persists the user id;
    /// withdrawing it forgets the stored user id and session and drops
    /// anything not yet sent.
    pub async fn update_privacy_settings(&self, update: PrivacyUpdate) {
        let settings = {
            let mut state = self.state();
            let had_consent = state.settings.cookie_consent;
            state.settings.apply(&update);

            if !had_consent && state.settings.cookie_consent {
                if let Some(user_id) = &state.user_id {
                    self.identity.persist_user_id(user_id);
                }
            }
            if had_consent && !state.settings.cookie_consent {
                self.identity.forget_consented();
                state.session_id = self.identity.get_or_create_session_id();
                let dropped = self.batcher.clear();
                debug!("consent withdrawn, dropped {} queued events", dropped);
            }
            state.settings.clone()
        };

        let mut metadata = Map::new();
        metadata.insert("settings".to_string(), json!(settings));
        self.track("system", "privacy_update", metadata).await;
    }

    /// Stop tracking for good on this profile and tell the server, so that
    /// events already in flight for this user are discarded there too.
    #[instrument(skip(self))]
    pub async fn opt_out(&self) {
        self.identity.set_opted_out(true);
        let dropped = self.batcher.clear();
        debug!("opted out, dropped {} queued events", dropped);

        if let Some(user_id) = self.outgoing_user_id() {
            if let Err(err) = self.transport.notify_opt_out(&user_id).await {
                debug!("failed to notify opt-out: {}", err);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn opt_in(&self) {
        self.identity.set_opted_out(false);

        if let Some(user_id) = self.outgoing_user_id() {
            if let Err(err) = self.transport.notify_opt_in(&user_id).await {
                debug!("failed to notify opt-in: {}", err);
            }
        }
    }

    pub fn is_opted_out(&self) -> bool {
        self.identity.is_opted_out()
    }

    /// Wipe stored identity and start over with fresh identifiers.
    pub fn clear_data(&self) {
        let (pixel_id, session_id) = self.identity.clear();
        let dropped = self.batcher.clear();

        let mut state = self.state();
        state.pixel_id = pixel_id;
        state.session_id = session_id;
        state.user_id = None;
        debug!("tracking data cleared, dropped {} queued events", dropped);
    }

    /// Events waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.batcher.len()
    }

    pub async fn flush(&self) {
        self.batcher.flush(false).await;
    }

    /// The identifier as it leaves the process: hashed unless anonymization
    /// was switched off.
    fn outgoing_user_id(&self) -> Option<String> {
        let (user_id, anonymize) = {
            let state = self.state();
            (state.user_id.clone(), state.settings.anonymize_user_id)
        };
        let user_id = user_id?;

        if anonymize {
            Some(hash_user_id(&user_id))
        } else {
            Some(user_id)
        }
    }

    fn build_event(
        &self,
        event_type: EventType,
        metadata: Map<String, Value>,
    ) -> Option<TrackedEvent> {
        let opted_out = self.identity.is_opted_out();
        let hashed_user_id = self.outgoing_user_id();
        let state = self.state();

        if !self.gate.should_track(&state.settings, opted_out) {
            trace!("tracking denied, skipping {}", event_type);
            return None;
        }

        let metadata = sanitize(metadata);
        Some(TrackedEvent {
            pixel_id: state.pixel_id,
            session_id: state.session_id,
            event_type,
            current_url: state.page.url.clone(),
            referrer_url: state.page.referrer.clone(),
            hashed_user_id,
            metadata: (!metadata.is_empty()).then_some(metadata),
            timestamp: now_millis(),
        })
    }

    async fn record(&self, event_type: EventType, metadata: Map<String, Value>) {
        if let Some(event) = self.build_event(event_type, metadata) {
            self.batcher.enqueue(event).await;
        }
    }
}

fn to_metadata<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
