//! Persisted tracking state: auth token, last-sent timestamp, send lock.
//!
//! All three live in a [`KvStore`] under namespaced keys (see [`StateKeys`]).
//! Nothing here is cached in memory: a scheduler that is torn down and
//! rebuilt by its host sees exactly what the previous instance committed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{KvStore, StoreError};

/// Persisted key names, all sharing one namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateKeys {
    pub auth: String,
    pub last_sent: String,
    pub send_lock: String,
}

impl StateKeys {
    pub const AUTH: &'static str = "TRACKING_AUTH";
    pub const LAST_SENT: &'static str = "LAST_SENT_TS";
    pub const SEND_LOCK: &'static str = "LOC_SEND_LOCK";

    /// Build the key set for `prefix`, e.g. `FD` → `FD_TRACKING_AUTH`.
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        let key = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}_{name}")
            }
        };
        Self {
            auth: key(Self::AUTH),
            last_sent: key(Self::LAST_SENT),
            send_lock: key(Self::SEND_LOCK),
        }
    }
}

impl Default for StateKeys {
    fn default() -> Self {
        Self::with_prefix("FD")
    }
}

/// Token the background loop authenticates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingAuth {
    pub token: String,
}

/// Persisted send lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLock {
    pub acquired_at_ms: u64,
    #[serde(default)]
    pub owner: Option<String>,
}

impl SendLock {
    /// Decode a stored lock. A bare millisecond timestamp is accepted as an
    /// ownerless lock.
    fn parse(raw: &str) -> Option<Self> {
        if let Ok(lock) = serde_json::from_str::<SendLock>(raw) {
            return Some(lock);
        }
        raw.trim().parse::<u64>().ok().map(|acquired_at_ms| SendLock {
            acquired_at_ms,
            owner: None,
        })
    }

    fn is_live(&self, now_ms: u64, ttl_ms: u64) -> bool {
        self.acquired_at_ms != 0 && now_ms.saturating_sub(self.acquired_at_ms) < ttl_ms
    }
}

/// Typed access to the persisted tracking entities.
#[derive(Clone)]
pub struct TrackingState {
    store: Arc<dyn KvStore>,
    keys: StateKeys,
    lock_ttl_ms: u64,
    owner: String,
}

impl TrackingState {
    /// Each instance gets its own lock owner id, so two schedulers sharing a
    /// store never release each other's lock.
    pub fn new(store: Arc<dyn KvStore>, keys: StateKeys, lock_ttl_ms: u64) -> Self {
        Self {
            store,
            keys,
            lock_ttl_ms,
            owner: Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn keys(&self) -> &StateKeys {
        &self.keys
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    // ── Auth ──

    pub async fn save_auth(&self, token: &str) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&TrackingAuth {
            token: token.to_string(),
        })?;
        self.store.set(&self.keys.auth, &raw).await
    }

    /// Stored auth, or `None` when absent, undecodable, or blank.
    pub async fn load_auth(&self) -> Result<Option<TrackingAuth>, StoreError> {
        let Some(raw) = self.store.get(&self.keys.auth).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<TrackingAuth>(&raw) {
            Ok(auth) if !auth.token.trim().is_empty() => Ok(Some(auth)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Tracker: stored auth is undecodable ({e}), treating as absent");
                Ok(None)
            }
        }
    }

    pub async fn clear_auth(&self) -> Result<(), StoreError> {
        self.store.remove(&self.keys.auth).await
    }

    // ── Last sent ──

    /// Last successful report time, ignoring zero and non-numeric values.
    pub async fn last_sent_ms(&self) -> Result<Option<u64>, StoreError> {
        let raw = self.store.get(&self.keys.last_sent).await?;
        Ok(raw
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|ts| *ts > 0))
    }

    pub async fn set_last_sent_ms(&self, ts: u64) -> Result<(), StoreError> {
        self.store.set(&self.keys.last_sent, &ts.to_string()).await
    }

    /// Earliest time the next report may go out: `now` when nothing was ever
    /// sent, else `max(now, last_sent + interval)`.
    pub async fn next_send_at(&self, interval_ms: u64, now_ms: u64) -> Result<u64, StoreError> {
        Ok(match self.last_sent_ms().await? {
            Some(last) => now_ms.max(last.saturating_add(interval_ms)),
            None => now_ms,
        })
    }

    // ── Send lock ──

    /// Try to take the send lock. Returns `false` without waiting if another
    /// holder's lock is younger than the TTL.
    pub async fn try_acquire_lock(&self, now_ms: u64) -> Result<bool, StoreError> {
        let current = self.store.get(&self.keys.send_lock).await?;
        if let Some(lock) = current.as_deref().and_then(SendLock::parse) {
            if lock.is_live(now_ms, self.lock_ttl_ms) {
                debug!(
                    "Tracker: send lock held by {:?} since {}",
                    lock.owner, lock.acquired_at_ms
                );
                return Ok(false);
            }
        }

        let fresh = serde_json::to_string(&SendLock {
            acquired_at_ms: now_ms,
            owner: Some(self.owner.clone()),
        })?;
        self.store
            .compare_and_swap(&self.keys.send_lock, current.as_deref(), Some(&fresh))
            .await
    }

    /// Release the lock if this instance still holds it.
    pub async fn release_lock(&self) -> Result<(), StoreError> {
        let Some(current) = self.store.get(&self.keys.send_lock).await? else {
            return Ok(());
        };
        let ours = SendLock::parse(&current)
            .and_then(|l| l.owner)
            .is_some_and(|o| o == self.owner);
        if ours {
            self.store
                .compare_and_swap(&self.keys.send_lock, Some(&current), None)
                .await?;
        }
        Ok(())
    }

    // ── Session ──

    /// Drop per-session bookkeeping (lock + last sent), and the auth token
    /// when `clear_auth` is set.
    pub async fn clear_session(&self, clear_auth: bool) -> Result<(), StoreError> {
        self.store
            .remove_many(&[self.keys.last_sent.as_str(), self.keys.send_lock.as_str()])
            .await?;
        if clear_auth {
            self.clear_auth().await?;
        }
        Ok(())
    }
}
