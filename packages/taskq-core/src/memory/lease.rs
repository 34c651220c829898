//! In-process lease storage. Development/single-replica use only.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::LeaseError;
use crate::model::Lease;
use crate::storage::LeaseStorage;

pub struct InMemoryLeaseStorage {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStorage {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn can_acquire(leases: &HashMap<String, Lease>, name: &str, owner: &str) -> bool {
        match leases.get(name) {
            None => true,
            Some(existing) => existing.is_expired(Utc::now()) || existing.owner_id == owner,
        }
    }
}

impl Default for InMemoryLeaseStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStorage for InMemoryLeaseStorage {
    async fn maybe_acquire(
        &self,
        name: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, LeaseError> {
        let mut leases = self.leases.lock().unwrap();
        if !Self::can_acquire(&leases, name, owner) {
            return Ok(None);
        }
        let now = Utc::now();
        let lease = Lease {
            name: name.to_string(),
            owner_id: owner.to_string(),
            acquired_at: now,
            acquired_until: now + chrono::Duration::from_std(duration).unwrap_or_default(),
        };
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, name: &str, owner: &str) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().unwrap();
        if !leases.contains_key(name) {
            return Ok(());
        }
        if Self::can_acquire(&leases, name, owner) {
            leases.remove(name);
        }
        Ok(())
    }
}
