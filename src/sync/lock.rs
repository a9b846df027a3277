use crate::error::TidedbError;
use crate::storage::kv::KvTransaction;
use crate::storage::memory::{META_COLLECTION, MemoryStore};
use crate::types::Key;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

/// Advisory mutex over persistent storage, keyed by name under `__meta`.
///
/// Each process carries a random identity; a lock row reads
/// `{locked: true, id: <owner>, expires_at: <millis>}`. The holder
/// declares a lease when acquiring; waiters poll and steal the lock as
/// soon as the lease expires. Independently of any lease, a waiter that
/// has polled for the controller's timeout force-removes the lock and
/// proceeds: this is cooperative cross-instance coordination, not crash
/// safety.
pub struct LockController {
    store: Arc<MemoryStore>,
    instance_id: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl LockController {
    pub fn new(store: Arc<MemoryStore>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            instance_id: Uuid::new_v4().to_string(),
            poll_interval,
            timeout,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Run `f` while holding the named lock, leasing it for `lease`. The
    /// lock is released on the way out whether or not `f` succeeded.
    pub async fn request<T, F, Fut>(
        &self,
        name: &str,
        lease: Duration,
        f: F,
    ) -> Result<T, TidedbError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TidedbError>>,
    {
        self.acquire(name, lease).await?;
        let result = f().await;
        self.release(name).await?;
        result
    }

    async fn acquire(&self, name: &str, lease: Duration) -> Result<(), TidedbError> {
        let started = Instant::now();
        loop {
            if self.try_take(name, lease, false).await? {
                debug!(lock = name, "lock acquired");
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                warn!(lock = name, "lock not released within timeout, force-removing");
                self.try_take(name, lease, true).await?;
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Attempt to take the lock; `force` steals it from a stale owner. A
    /// lock whose lease has lapsed is stolen without waiting for `force`.
    async fn try_take(
        &self,
        name: &str,
        lease: Duration,
        force: bool,
    ) -> Result<bool, TidedbError> {
        let tx = KvTransaction::write(self.store.clone()).await;
        let current = tx.query_by_key(META_COLLECTION, &Key::from(name))?;
        let held_by_other = current
            .as_ref()
            .is_some_and(|row| is_locked(row) && owner(row) != Some(self.instance_id.as_str()));
        if held_by_other {
            let expired = current.as_ref().is_some_and(|row| lease_expired(row));
            if !expired && !force {
                tx.rollback();
                return Ok(false);
            }
            if expired {
                warn!(lock = name, "lock lease expired, stealing");
            }
        }
        tx.upsert(
            META_COLLECTION,
            &Key::from(name),
            &json!({
                "locked": true,
                "id": self.instance_id,
                "expires_at": now_millis() + lease.as_millis() as i64,
            }),
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn release(&self, name: &str) -> Result<(), TidedbError> {
        let tx = KvTransaction::write(self.store.clone()).await;
        let current = tx.query_by_key(META_COLLECTION, &Key::from(name))?;
        match current {
            Some(row) if owner(&row) == Some(self.instance_id.as_str()) => {
                tx.delete(META_COLLECTION, &Key::from(name))?;
                tx.commit()?;
            }
            _ => {
                // Someone force-removed and took the lock while we held it.
                warn!(lock = name, "lock no longer owned at release");
                tx.rollback();
            }
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn is_locked(row: &Value) -> bool {
    row.get("locked").and_then(Value::as_bool).unwrap_or(false)
}

fn owner(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn lease_expired(row: &Value) -> bool {
    row.get("expires_at")
        .and_then(Value::as_i64)
        .is_some_and(|expires_at| expires_at <= now_millis())
}
