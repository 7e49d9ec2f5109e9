use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::storage::KeyValueStore;

pub const PIXEL_ID_KEY: &str = "neura_pixel_id";
pub const SESSION_ID_KEY: &str = "neura_session_id";
pub const OPT_OUT_KEY: &str = "neura_tracking_opt_out";
pub const USER_ID_KEY: &str = "neura_user_id";

/// Pseudo-anonymous identifiers and the locally mirrored opt-out flag.
///
/// Storage failures never surface: an unreadable identifier is replaced by a
/// fresh one, a failed write is logged and otherwise ignored.
#[derive(Clone)]
pub struct IdentityStore {
    durable: Arc<dyn KeyValueStore + Send + Sync>,
    session: Arc<dyn KeyValueStore + Send + Sync>,
}

impl IdentityStore {
    pub fn new(
        durable: Arc<dyn KeyValueStore + Send + Sync>,
        session: Arc<dyn KeyValueStore + Send + Sync>,
    ) -> Self {
        Self { durable, session }
    }

    pub fn get_or_create_pixel_id(&self) -> Uuid {
        get_or_create(self.durable.as_ref(), PIXEL_ID_KEY)
    }

    pub fn get_or_create_session_id(&self) -> Uuid {
        get_or_create(self.session.as_ref(), SESSION_ID_KEY)
    }

    pub fn is_opted_out(&self) -> bool {
        read(self.durable.as_ref(), OPT_OUT_KEY).as_deref() == Some("true")
    }

    pub fn set_opted_out(&self, opted_out: bool) {
        if opted_out {
            write(self.durable.as_ref(), OPT_OUT_KEY, "true");
        } else {
            remove(self.durable.as_ref(), OPT_OUT_KEY);
        }
    }

    pub fn user_id(&self) -> Option<String> {
        read(self.durable.as_ref(), USER_ID_KEY)
    }

    pub fn persist_user_id(&self, user_id: &str) {
        write(self.durable.as_ref(), USER_ID_KEY, user_id);
    }

    /// Consent revoked: forget everything that would need it.
    pub fn forget_consented(&self) {
        remove(self.durable.as_ref(), USER_ID_KEY);
        remove(self.session.as_ref(), SESSION_ID_KEY);
    }

    /// Drop all stored identity, then mint new identifiers.
    pub fn clear(&self) -> (Uuid, Uuid) {
        for key in [PIXEL_ID_KEY, OPT_OUT_KEY, USER_ID_KEY] {
            remove(self.durable.as_ref(), key);
        }
        remove(self.session.as_ref(), SESSION_ID_KEY);

        (
            self.get_or_create_pixel_id(),
            self.get_or_create_session_id(),
        )
    }
}

fn get_or_create(store: &(dyn KeyValueStore + Send + Sync), key: &str) -> Uuid {
    if let Some(id) = read(store, key).and_then(|raw| Uuid::parse_str(&raw).ok()) {
        return id;
    }

    let id = Uuid::new_v4();
    write(store, key, &id.to_string());
    id
}

fn read(store: &(dyn KeyValueStore + Send + Sync), key: &str) -> Option<String> {
    store.get(key).unwrap_or_else(|err| {
        debug!("failed to read {}: {}", key, err);
        None
    })
}

fn write(store: &(dyn KeyValueStore + Send + Sync), key: &str, value: &str) {
    if let Err(err) = store.set(key, value) {
        debug!("failed to persist {}: {}", key, err);
    }
}

fn remove(store: &(dyn KeyValueStore + Send + Sync), key: &str) {
    if let Err(err) = store.remove(key) {
        debug!("failed to remove {}: {}", key, err);
    }
}
