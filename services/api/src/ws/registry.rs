//! Process-wide table of live relay sessions.

use crate::profile::ProfileKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Registry entry. The phase is observed through a watch channel owned by the
/// session's supervisor.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub profile: ProfileKind,
    pub connected_at: DateTime<Utc>,
    pub phase: watch::Receiver<SessionPhase>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionInfo {
    pub id: Uuid,
    pub profile: ProfileKind,
    pub phase: SessionPhase,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id is already registered.
    pub async fn insert(&self, id: Uuid, entry: SessionEntry) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, entry);
        true
    }

    pub async fn remove(&self, id: &Uuid) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn phase(&self, id: &Uuid) -> Option<SessionPhase> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| *entry.phase.borrow())
    }

    /// Snapshot of all sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                profile: entry.profile,
                phase: *entry.phase.borrow(),
                connected_at: entry.connected_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }
}
