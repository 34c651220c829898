use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use taskq_core::error::LeaseError;
use taskq_core::model::Lease;
use taskq_core::storage::LeaseStorage;

fn lease_key(name: &str) -> String {
    format!("lease::{name}")
}

/// Redis-backed `LeaseStorage`. A lease is a single TTL'd string key whose
/// value is the owner id — acquisition is a conditional `SET` guarded by
/// reading the current owner first, matching the original's best-effort (not
/// fully atomic) implementation.
pub struct RedisLeaseStorage {
    conn: ConnectionManager,
}

impl RedisLeaseStorage {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LeaseStorage for RedisLeaseStorage {
    async fn maybe_acquire(
        &self,
        name: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, LeaseError> {
        let key = lease_key(name);
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.get(&key).await.map_err(anyhow::Error::from)?;
        if existing.is_some() && existing.as_deref() != Some(owner) {
            return Ok(None);
        }
        let _: () = conn
            .set_ex(&key, owner, duration.as_secs().max(1))
            .await
            .map_err(anyhow::Error::from)?;
        let now = Utc::now();
        Ok(Some(Lease {
            name: name.to_string(),
            owner_id: owner.to_string(),
            acquired_at: now,
            acquired_until: now + chrono::Duration::from_std(duration).unwrap_or_default(),
        }))
    }

    async fn release(&self, name: &str, owner: &str) -> Result<(), LeaseError> {
        let key = lease_key(name);
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.get(&key).await.map_err(anyhow::Error::from)?;
        if existing.as_deref() == Some(owner) {
            let _: () = conn.del(&key).await.map_err(anyhow::Error::from)?;
        }
        Ok(())
    }
}
