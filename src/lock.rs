use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::*;

/// Where the lock record lives.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn load_lock(&self) -> Result<Option<LockRecord>, EngineError>;
    async fn save_lock(&self, record: Option<LockRecord>) -> Result<(), EngineError>;
}

#[async_trait]
impl LockStore for Engine {
    async fn load_lock(&self) -> Result<Option<LockRecord>, EngineError> {
        Ok(self.lock_record().await)
    }

    async fn save_lock(&self, record: Option<LockRecord>) -> Result<(), EngineError> {
        let mut state = self.write().await;
        if state.lock == record {
            return Ok(());
        }
        self.commit(&mut state, vec![Event::LockSet(record)]).await
    }
}

/// Non-durable store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    record: Mutex<Option<LockRecord>>,
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn load_lock(&self) -> Result<Option<LockRecord>, EngineError> {
        Ok(self.record.lock().await.clone())
    }

    async fn save_lock(&self, record: Option<LockRecord>) -> Result<(), EngineError> {
        *self.record.lock().await = record;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub expires_at: Option<Ms>,
    /// Whether the caller may mutate right now.
    pub can_edit: bool,
}

/// Proof that the caller may mutate. Lock operations wait while a permit is
/// alive, so the holder cannot change under a running mutation.
pub struct EditPermit<'a> {
    _guard: MutexGuard<'a, ()>,
    pub holder: Option<String>,
}

fn lock_event(event: &'static str) {
    metrics::counter!(crate::observability::LOCK_EVENTS_TOTAL, "event" => event).increment(1);
}

pub struct EditLock {
    store: Arc<dyn LockStore>,
    guard: Mutex<()>,
    ttl_ms: Ms,
    automation_user: String,
}

impl EditLock {
    pub fn new(store: Arc<dyn LockStore>, ttl_ms: Ms, automation_user: impl Into<String>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
            ttl_ms,
            automation_user: automation_user.into(),
        }
    }

    /// Current live record, clearing an expired one first.
    async fn live(&self, now: Ms) -> Result<Option<LockRecord>, EngineError> {
        match self.store.load_lock().await? {
            Some(record) if record.is_live(now) => Ok(Some(record)),
            Some(record) => {
                debug!("edit lock of {} expired at {}", record.holder, record.expires_at);
                lock_event("expired");
                self.store.save_lock(None).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn acquire(&self, who: &Identity, force: bool) -> Result<LockRecord, EngineError> {
        self.acquire_at(who, force, now_ms()).await
    }

    /// Take the lock, or extend it when the caller already holds it.
    /// `force` pre-empts another holder and is reserved for the automation user.
    pub async fn acquire_at(&self, who: &Identity, force: bool, now: Ms) -> Result<LockRecord, EngineError> {
        if !who.role.can_edit() {
            lock_event("forbidden");
            return Err(EngineError::Forbidden(format!(
                "role {:?} cannot edit the plan",
                who.role
            )));
        }
        if force && who.username != self.automation_user {
            lock_event("forbidden");
            return Err(EngineError::Forbidden(
                "forced acquire is reserved for the automation user".into(),
            ));
        }

        let _g = self.guard.lock().await;
        let current = self.live(now).await?;
        if let Some(held) = &current
            && held.holder != who.username
        {
            if !force {
                lock_event("rejected");
                return Err(EngineError::LockHeld {
                    holder: held.holder.clone(),
                    expires_at: held.expires_at,
                });
            }
            warn!("edit lock of {} pre-empted by {}", held.holder, who.username);
            lock_event("forced");
        }

        let renewing = current.as_ref().is_some_and(|held| held.holder == who.username);
        let acquired_at = match &current {
            Some(held) if renewing => held.acquired_at,
            _ => now,
        };
        let record = LockRecord {
            holder: who.username.clone(),
            acquired_at,
            expires_at: now + self.ttl_ms,
        };
        self.store.save_lock(Some(record.clone())).await?;
        if !renewing {
            info!("edit lock acquired by {} until {}", record.holder, record.expires_at);
            lock_event("acquired");
        } else {
            lock_event("renewed");
        }
        Ok(record)
    }

    pub async fn renew(&self, who: &Identity) -> Result<LockRecord, EngineError> {
        self.renew_at(who, now_ms()).await
    }

    pub async fn renew_at(&self, who: &Identity, now: Ms) -> Result<LockRecord, EngineError> {
        let _g = self.guard.lock().await;
        let Some(mut record) = self.live(now).await? else {
            return Err(EngineError::NotLockHolder);
        };
        if record.holder != who.username {
            return Err(EngineError::NotLockHolder);
        }
        record.expires_at = now + self.ttl_ms;
        self.store.save_lock(Some(record.clone())).await?;
        lock_event("renewed");
        Ok(record)
    }

    /// Returns `false` when the caller is not the live holder.
    pub async fn release(&self, who: &Identity) -> Result<bool, EngineError> {
        self.release_at(who, now_ms()).await
    }

    pub async fn release_at(&self, who: &Identity, now: Ms) -> Result<bool, EngineError> {
        let _g = self.guard.lock().await;
        match self.live(now).await? {
            Some(record) if record.holder == who.username => {
                self.store.save_lock(None).await?;
                info!("edit lock released by {}", who.username);
                lock_event("released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn status(&self, who: Option<&Identity>) -> Result<LockStatus, EngineError> {
        self.status_at(who, now_ms()).await
    }

    pub async fn status_at(&self, who: Option<&Identity>, now: Ms) -> Result<LockStatus, EngineError> {
        let _g = self.guard.lock().await;
        let current = self.live(now).await?;
        let can_edit = who.is_some_and(|w| {
            w.role.can_edit() && current.as_ref().is_none_or(|r| r.holder == w.username)
        });
        Ok(LockStatus {
            is_locked: current.is_some(),
            locked_by: current.as_ref().map(|r| r.holder.clone()),
            expires_at: current.as_ref().map(|r| r.expires_at),
            can_edit,
        })
    }

    pub async fn authorize(&self, who: &Identity) -> Result<EditPermit<'_>, EngineError> {
        self.authorize_at(who, now_ms()).await
    }

    /// Admit a mutation when the lock is absent or held by the caller.
    pub async fn authorize_at(&self, who: &Identity, now: Ms) -> Result<EditPermit<'_>, EngineError> {
        if !who.role.can_edit() {
            return Err(EngineError::Forbidden(format!(
                "role {:?} cannot edit the plan",
                who.role
            )));
        }
        let guard = self.guard.lock().await;
        let current = self.live(now).await?;
        match current {
            Some(record) if record.holder != who.username => Err(EngineError::LockHeld {
                holder: record.holder,
                expires_at: record.expires_at,
            }),
            current => Ok(EditPermit {
                _guard: guard,
                holder: current.map(|r| r.holder),
            }),
        }
    }
}
