//! Session-keyed last-batch state.
//!
//! Each session holds at most one completed [`BatchResultSet`]; recording a
//! new batch replaces the previous one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::aggregator::BatchResultSet;
use crate::error::{AuditError, Result};
use crate::export::{CsvExporter, ExportKind};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    last_batch: Option<Arc<BatchResultSet>>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            last_batch: None,
        }
    }

    pub fn last_batch(&self) -> Option<&Arc<BatchResultSet>> {
        self.last_batch.as_ref()
    }
}

/// Concurrent map of sessions
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> Uuid {
        let session = Session::new();
        let id = session.id;
        self.sessions.write().await.insert(id, session);
        debug!(session = %id, "session created");
        id
    }

    pub async fn get(&self, id: Uuid) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AuditError::SessionNotFound { id })
    }

    /// Replace the session's last batch
    pub async fn record_batch(&self, id: Uuid, results: Arc<BatchResultSet>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or(AuditError::SessionNotFound { id })?;
        if session.last_batch.is_some() {
            debug!(session = %id, "replacing previous batch");
        }
        session.last_batch = Some(results);
        Ok(())
    }

    /// The last completed batch; `InvalidState` if none has completed yet
    pub async fn latest(&self, id: Uuid) -> Result<Arc<BatchResultSet>> {
        self.get(id)
            .await?
            .last_batch
            .ok_or(AuditError::InvalidState {
                operation: "export",
                state: "no batch has completed",
            })
    }

    /// Export the session's last batch
    pub async fn export(&self, id: Uuid, exporter: &CsvExporter, kind: ExportKind) -> Result<PathBuf> {
        let results = self.latest(id).await?;
        Ok(exporter.export(&results, kind)?)
    }

    pub async fn remove(&self, id: Uuid) -> Option<Session> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
