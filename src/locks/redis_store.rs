use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{LockEntry, LockKey, LockStore, LockStoreError, LockToken};
use crate::model::Ms;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lock store shared across processes. Expiry is left to Redis (`PX`).
#[derive(Clone)]
pub struct RedisLockStore {
    conn: MultiplexedConnection,
}

impl RedisLockStore {
    pub async fn connect(url: &str) -> Result<Self, LockStoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self { conn })
    }
}

fn unavailable(e: redis::RedisError) -> LockStoreError {
    LockStoreError::Unavailable(e.to_string())
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &LockKey, entry: LockEntry, now: Ms) -> Result<bool, LockStoreError> {
        let ttl_ms = (entry.expires_at - now).max(1);
        let mut conn = self.conn.clone();
        // SET NX: only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(key.storage_key())
            .arg(entry.token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &LockKey, now: Ms) -> Result<Option<LockEntry>, LockStoreError> {
        let storage_key = key.storage_key();
        let mut conn = self.conn.clone();
        let (token, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&storage_key)
            .cmd("PTTL")
            .arg(&storage_key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let Some(token) = token else { return Ok(None) };
        if pttl <= 0 {
            return Ok(None);
        }
        let token = token
            .parse::<LockToken>()
            .map_err(|e| LockStoreError::Unavailable(format!("corrupt lock token: {e}")))?;
        Ok(Some(LockEntry {
            token,
            expires_at: now + pttl,
        }))
    }

    async fn compare_and_delete(&self, key: &LockKey, token: LockToken) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key.storage_key())
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted == 1)
    }

    async fn purge_expired(&self, _now: Ms) -> Result<usize, LockStoreError> {
        Ok(0)
    }
}
