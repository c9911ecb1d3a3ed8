use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::model::{Event, GroupId};

#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn revision(&self, group_id: GroupId) -> u64;
    /// Increment and return the new value.
    async fn bump(&self, group_id: GroupId) -> Result<u64, EngineError>;
}

/// Reject a whole-set replace whose stated revision is not the current one.
pub fn check_revision(group_id: GroupId, current: u64, expected: u64) -> Result<(), EngineError> {
    if current == expected {
        return Ok(());
    }
    info!("revision conflict on group {group_id}: sent {expected}, current {current}");
    metrics::counter!(crate::observability::REVISION_CONFLICTS_TOTAL).increment(1);
    Err(EngineError::RevisionConflict { current })
}

#[async_trait]
impl RevisionStore for Engine {
    async fn revision(&self, group_id: GroupId) -> u64 {
        self.read().await.revision(group_id)
    }

    async fn bump(&self, group_id: GroupId) -> Result<u64, EngineError> {
        let mut state = self.write().await;
        let revision = state.revision(group_id) + 1;
        self.commit(&mut state, vec![Event::RevisionSet { group_id, revision }])
            .await?;
        Ok(revision)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRevisionStore {
    counters: DashMap<GroupId, u64>,
}

#[async_trait]
impl RevisionStore for MemoryRevisionStore {
    async fn revision(&self, group_id: GroupId) -> u64 {
        self.counters.get(&group_id).map(|r| *r).unwrap_or(0)
    }

    async fn bump(&self, group_id: GroupId) -> Result<u64, EngineError> {
        let mut entry = self.counters.entry(group_id).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}
