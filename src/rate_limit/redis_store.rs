//! Redis-backed counter store.

use crate::rate_limit::store::{CounterStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// INCR and PEXPIRE run inside one script so no other client can observe a counter
// without its expiry.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return current
"#;

/// Counter store shared by every process pointed at the same Redis.
///
/// The script body is hashed once at construction; calls go through `EVALSHA` and
/// fall back to `EVAL` only when the server has not cached the script yet.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection_manager: ConnectionManager,
    script: Arc<Script>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").field("script", &self.script.get_hash()).finish()
    }
}

impl RedisCounterStore {
    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self { connection_manager, script: Arc::new(Script::new(INCREMENT_SCRIPT)) }
    }

    /// Open a connection manager for `client`.
    pub async fn from_client(client: Client) -> Result<Self, StoreError> {
        let connection_manager = client.get_connection_manager().await?;
        Ok(Self::new(connection_manager))
    }

    /// Connect to a `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Self::from_client(client).await
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_maybe_expire(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let ttl_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut connection_manager = self.connection_manager.clone();

        let count: i64 =
            self.script.key(key).arg(ttl_ms).invoke_async(&mut connection_manager).await?;

        u64::try_from(count)
            .map_err(|_| StoreError::Protocol(format!("negative counter value {count}")))
    }
}
