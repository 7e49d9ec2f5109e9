use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use pixel_common::event::now_millis;
use serde::Deserialize;
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::api::{CaptureError, IngestResponse};
use crate::prometheus::report_opt_out;
use crate::router;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Server-side record of users who asked not to be tracked, keyed by the
/// hashed user id the client sends along with its events.
#[async_trait]
pub trait OptOutRegistry {
    /// Idempotent.
    async fn opt_out(&self, hashed_user_id: &str) -> Result<(), RegistryError>;
    async fn opt_in(&self, hashed_user_id: &str) -> Result<(), RegistryError>;
    /// A user without a record has not opted out.
    async fn has_opted_out(&self, hashed_user_id: &str) -> Result<bool, RegistryError>;
}

pub struct SqliteOptOutRegistry {
    pool: Pool<Sqlite>,
}

impl SqliteOptOutRegistry {
    pub async fn new(pool: Pool<Sqlite>) -> anyhow::Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS opt_outs (
                hashed_user_id TEXT PRIMARY KEY,
                opted_out INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn set(&self, hashed_user_id: &str, opted_out: bool) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO opt_outs (hashed_user_id, opted_out, updated_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT (hashed_user_id) DO UPDATE
            SET opted_out = excluded.opted_out, updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(hashed_user_id)
        .bind(opted_out)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OptOutRegistry for SqliteOptOutRegistry {
    async fn opt_out(&self, hashed_user_id: &str) -> Result<(), RegistryError> {
        self.set(hashed_user_id, true).await
    }

    async fn opt_in(&self, hashed_user_id: &str) -> Result<(), RegistryError> {
        self.set(hashed_user_id, false).await
    }

    async fn has_opted_out(&self, hashed_user_id: &str) -> Result<bool, RegistryError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT opted_out FROM opt_outs WHERE hashed_user_id = ?")
                .bind(hashed_user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some_and(|(opted_out,)| opted_out))
    }
}

/// Forgets everything on restart.
#[derive(Default)]
pub struct MemoryOptOutRegistry {
    opted_out: Mutex<HashSet<String>>,
}

impl MemoryOptOutRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OptOutRegistry for MemoryOptOutRegistry {
    async fn opt_out(&self, hashed_user_id: &str) -> Result<(), RegistryError> {
        self.opted_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hashed_user_id.to_string());
        Ok(())
    }

    async fn opt_in(&self, hashed_user_id: &str) -> Result<(), RegistryError> {
        self.opted_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hashed_user_id);
        Ok(())
    }

    async fn has_opted_out(&self, hashed_user_id: &str) -> Result<bool, RegistryError> {
        Ok(self
            .opted_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hashed_user_id))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

fn user_id_from(body: &[u8]) -> Result<String, CaptureError> {
    let request: PrivacyRequest = serde_json::from_slice(body)?;
    match request.user_id {
        Some(user_id) if !user_id.trim().is_empty() => Ok(user_id),
        _ => Err(CaptureError::MissingUserId),
    }
}

fn unavailable(err: RegistryError) -> CaptureError {
    error!("opt-out registry failure: {}", err);
    CaptureError::RegistryUnavailable
}

#[instrument(skip_all)]
pub async fn opt_out(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<IngestResponse>, CaptureError> {
    let user_id = user_id_from(&body)?;
    state.registry.opt_out(&user_id).await.map_err(unavailable)?;

    report_opt_out();
    info!("user opted out of tracking");
    Ok(Json(IngestResponse::ok()))
}

#[instrument(skip_all)]
pub async fn opt_in(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<IngestResponse>, CaptureError> {
    let user_id = user_id_from(&body)?;
    state.registry.opt_in(&user_id).await.map_err(unavailable)?;

    info!("user opted back in to tracking");
    Ok(Json(IngestResponse::ok()))
}
