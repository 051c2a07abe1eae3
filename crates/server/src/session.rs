//! Session registry
//!
//! Tracks the chat sessions attached to this server so `/api/sessions` can
//! report who holds the engine and who is queued, and so shutdown can cancel
//! every session at once.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use voice_gateway_pipeline::{Session, SessionPhase};

struct SessionEntry {
    personality_id: String,
    started_at: DateTime<Utc>,
    phase: watch::Receiver<SessionPhase>,
    cancel: CancellationToken,
}

/// Snapshot of a registered session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub personality_id: String,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
}

/// Sessions currently attached to the server
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`; it is removed when the returned guard drops
    pub fn register(self: &Arc<Self>, session: &Session, personality_id: &str) -> Registration {
        let id = session.id().to_string();
        self.sessions.write().insert(
            id.clone(),
            SessionEntry {
                personality_id: personality_id.to_string(),
                started_at: Utc::now(),
                phase: session.subscribe(),
                cancel: session.cancel_token(),
            },
        );
        tracing::debug!(session_id = %id, personality = %personality_id, "Registered session");

        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    fn remove(&self, id: &str) {
        if self.sessions.write().remove(id).is_some() {
            tracing::debug!(session_id = %id, "Unregistered session");
        }
    }

    /// Sessions ordered by start time
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read();
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: id.clone(),
                personality_id: entry.personality_id.clone(),
                phase: *entry.phase.borrow(),
                started_at: entry.started_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Cancel a single session; returns false if it is not registered
    pub fn cancel(&self, id: &str) -> bool {
        match self.sessions.read().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered session
    pub fn cancel_all(&self) -> usize {
        let sessions = self.sessions.read();
        for entry in sessions.values() {
            entry.cancel.cancel();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Cancelled active sessions");
        }
        sessions.len()
    }
}

/// Keeps a session registered while alive
pub struct Registration {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
