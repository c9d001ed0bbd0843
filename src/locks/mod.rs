//! Short-lived exclusive claims on a slot while a student walks through the
//! booking flow. Locks live in a compare-and-set store with TTL, never in the
//! ledger: losing them costs nothing but a retry.

mod memory;
#[cfg(feature = "redis-locks")]
mod redis_store;

pub use memory::MemoryLockStore;
#[cfg(feature = "redis-locks")]
pub use redis_store::RedisLockStore;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use ulid::Ulid;

use crate::model::{Ms, Slot, Span, TenantId};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Random proof of ownership handed to the lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Ulid);

impl LockToken {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// (tenant, instructor, start, end): one lock per exact slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub tenant_id: TenantId,
    pub instructor_id: Ulid,
    pub span: Span,
}

impl LockKey {
    pub fn new(tenant_id: TenantId, instructor_id: Ulid, span: Span) -> Self {
        Self { tenant_id, instructor_id, span }
    }

    pub fn for_slot(tenant_id: &TenantId, slot: &Slot) -> Self {
        Self::new(tenant_id.clone(), slot.instructor_id, slot.span)
    }

    /// Flat key for external stores.
    pub fn storage_key(&self) -> String {
        format!(
            "lessond:lock:{}:{}:{}:{}",
            self.tenant_id, self.instructor_id, self.span.start, self.span.end
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEntry {
    pub token: LockToken,
    pub expires_at: Ms,
}

impl LockEntry {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store with an atomic set-if-absent. Implementations must make
/// `set_if_absent` a single linearizable step per key.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `entry` unless a live entry already holds `key` at `now`.
    /// Returns whether `entry` was stored.
    async fn set_if_absent(&self, key: &LockKey, entry: LockEntry, now: Ms) -> Result<bool, LockStoreError>;

    /// The live entry for `key`, if any.
    async fn get(&self, key: &LockKey, now: Ms) -> Result<Option<LockEntry>, LockStoreError>;

    /// Delete `key` only if it is held by `token`.
    async fn compare_and_delete(&self, key: &LockKey, token: LockToken) -> Result<bool, LockStoreError>;

    /// Drop entries that expired before `now`. Stores with native TTL return 0.
    async fn purge_expired(&self, now: Ms) -> Result<usize, LockStoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted(LockEntry),
    Denied,
}

impl Acquire {
    pub fn granted(self) -> Option<LockEntry> {
        match self {
            Acquire::Granted(entry) => Some(entry),
            Acquire::Denied => None,
        }
    }
}

pub struct ReservationLockManager {
    store: Arc<dyn LockStore>,
    ttl_ms: Ms,
}

impl ReservationLockManager {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl_ms: ttl.as_millis() as Ms,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLockStore::new()), DEFAULT_LOCK_TTL)
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    pub async fn acquire(&self, key: &LockKey) -> Result<Acquire, LockStoreError> {
        self.acquire_at(key, crate::engine::now_ms()).await
    }

    /// One atomic set-if-absent-or-expired with a fresh token.
    pub async fn acquire_at(&self, key: &LockKey, now: Ms) -> Result<Acquire, LockStoreError> {
        let entry = LockEntry {
            token: LockToken::generate(),
            expires_at: now + self.ttl_ms,
        };
        let granted = self.store.set_if_absent(key, entry, now).await?;
        let outcome = if granted { "granted" } else { "denied" };
        metrics::counter!(crate::observability::LOCK_ACQUISITIONS_TOTAL, "outcome" => outcome)
            .increment(1);
        if granted {
            Ok(Acquire::Granted(entry))
        } else {
            debug!(key = %key.storage_key(), "slot lock denied");
            Ok(Acquire::Denied)
        }
    }

    /// Release if still held by `token`. Returns whether anything was deleted.
    pub async fn release(&self, key: &LockKey, token: LockToken) -> Result<bool, LockStoreError> {
        self.store.compare_and_delete(key, token).await
    }

    pub async fn is_valid(&self, key: &LockKey, token: LockToken) -> Result<bool, LockStoreError> {
        self.is_valid_at(key, token, crate::engine::now_ms()).await
    }

    /// Held by `token` and not expired at `now`.
    pub async fn is_valid_at(&self, key: &LockKey, token: LockToken, now: Ms) -> Result<bool, LockStoreError> {
        Ok(self
            .store
            .get(key, now)
            .await?
            .is_some_and(|entry| entry.token == token && entry.is_live(now)))
    }

    pub async fn purge_expired_at(&self, now: Ms) -> Result<usize, LockStoreError> {
        self.store.purge_expired(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Ms = 1_700_000_000_000;

    fn key() -> LockKey {
        LockKey::new(TenantId::new("school"), Ulid::new(), Span::new(T0, T0 + 3_600_000))
    }

    #[tokio::test]
    async fn acquire_then_deny() {
        let mgr = ReservationLockManager::in_memory();
        let k = key();
        let first = mgr.acquire_at(&k, T0).await.unwrap();
        assert!(matches!(first, Acquire::Granted(_)));
        assert_eq!(mgr.acquire_at(&k, T0 + 1).await.unwrap(), Acquire::Denied);
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let mgr = ReservationLockManager::in_memory();
        let k = key();
        let stale = mgr.acquire_at(&k, T0).await.unwrap().granted().unwrap();
        let later = T0 + mgr.ttl_ms();

        assert!(!mgr.is_valid_at(&k, stale.token, later).await.unwrap());
        let fresh = mgr.acquire_at(&k, later).await.unwrap().granted().unwrap();
        assert_ne!(fresh.token, stale.token);
        assert!(mgr.is_valid_at(&k, fresh.token, later).await.unwrap());
        assert!(!mgr.is_valid_at(&k, stale.token, later).await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let mgr = ReservationLockManager::in_memory();
        let k = key();
        let held = mgr.acquire_at(&k, T0).await.unwrap().granted().unwrap();

        assert!(!mgr.release(&k, LockToken::generate()).await.unwrap());
        assert!(mgr.is_valid_at(&k, held.token, T0).await.unwrap());

        assert!(mgr.release(&k, held.token).await.unwrap());
        assert!(!mgr.is_valid_at(&k, held.token, T0).await.unwrap());
        assert!(matches!(mgr.acquire_at(&k, T0).await.unwrap(), Acquire::Granted(_)));
    }

    #[tokio::test]
    async fn keys_are_tenant_scoped() {
        let mgr = ReservationLockManager::in_memory();
        let a = key();
        let b = LockKey { tenant_id: TenantId::new("other_school"), ..a.clone() };
        assert!(matches!(mgr.acquire_at(&a, T0).await.unwrap(), Acquire::Granted(_)));
        assert!(matches!(mgr.acquire_at(&b, T0).await.unwrap(), Acquire::Granted(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_concurrent_winner() {
        let mgr = Arc::new(ReservationLockManager::in_memory());
        let k = key();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let mgr = mgr.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move { mgr.acquire_at(&k, T0).await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if matches!(h.await.unwrap(), Acquire::Granted(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let mgr = ReservationLockManager::in_memory();
        let old = key();
        let young = key();
        mgr.acquire_at(&old, T0).await.unwrap();
        let held = mgr.acquire_at(&young, T0 + 60_000).await.unwrap().granted().unwrap();

        let purged = mgr.purge_expired_at(T0 + mgr.ttl_ms()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(mgr.is_valid_at(&young, held.token, T0 + mgr.ttl_ms()).await.unwrap());
    }

    #[test]
    fn storage_key_layout() {
        let k = LockKey::new(
            TenantId::new("school"),
            Ulid::from_string("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap(),
            Span::new(10, 20),
        );
        assert_eq!(k.storage_key(), "lessond:lock:school:01ARZ3NDEKTSV4RRFFQ69G5FAV:10:20");
    }
}
