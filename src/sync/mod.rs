pub mod lock;
pub mod retry;

use crate::config::TidedbConfig;
use crate::error::TidedbError;
use crate::mutator::{BoxFuture, MutatorRegistry, PushAck, RemoteResolver};
use crate::overlay::OverlayTransaction;
use crate::overlay::cdc::CdcEvent;
use crate::overlay::pending::MutationRow;
use crate::storage::memory::MemoryStore;
use crate::sync::lock::LockController;
use crate::sync::retry::{RetryPolicy, retry_unbounded};
use crate::types::{Key, Scalar};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CURSOR_META_KEY: &str = "cursor";

/// One authoritative operation the remote reports for a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PullOperation {
    Clear,
    Created { key: Key, value: Value },
    Updated { key: Key, value: Value },
    Deleted { key: Key },
}

/// The remote's answer to a pull: per-collection operations, the next
/// cursor, and the highest server mutation id it has processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PullResponse {
    #[serde(default)]
    pub change: BTreeMap<String, Vec<PullOperation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_mutation_id: Option<i64>,
}

pub type Puller =
    Arc<dyn Fn(Option<Scalar>) -> BoxFuture<Result<PullResponse, TidedbError>> + Send + Sync>;

type CommitSink = Arc<dyn Fn(Vec<CdcEvent>) + Send + Sync>;

/// Drains the mutation log to the remote and applies authoritative
/// changes back, garbage-collecting acknowledged mutations along the way.
///
/// `push` and `pull` are both idempotent: a second caller while one is in
/// flight returns once that run completes its work.
pub struct SyncManager {
    store: Arc<MemoryStore>,
    config: TidedbConfig,
    registry: Arc<MutatorRegistry>,
    locks: LockController,
    policy: RetryPolicy,
    puller: Mutex<Option<Puller>>,
    pushing: AtomicBool,
    pull_gate: tokio::sync::Mutex<()>,
    pull_epoch: AtomicU64,
    on_commit: CommitSink,
}

impl SyncManager {
    pub fn new(
        store: Arc<MemoryStore>,
        config: TidedbConfig,
        registry: Arc<MutatorRegistry>,
        on_commit: CommitSink,
    ) -> Arc<Self> {
        let locks = LockController::new(
            store.clone(),
            Duration::from_millis(config.lock_poll_interval_ms),
            Duration::from_millis(config.lock_timeout_ms),
        );
        let policy = RetryPolicy::new(
            Duration::from_millis(config.retry_initial_backoff_ms),
            Duration::from_millis(config.retry_max_backoff_ms),
        );
        Arc::new(Self {
            store,
            config,
            registry,
            locks,
            policy,
            puller: Mutex::new(None),
            pushing: AtomicBool::new(false),
            pull_gate: tokio::sync::Mutex::new(()),
            pull_epoch: AtomicU64::new(0),
            on_commit,
        })
    }

    pub fn set_puller<F, Fut>(&self, puller: F)
    where
        F: Fn(Option<Scalar>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PullResponse, TidedbError>> + Send + 'static,
    {
        *self.puller.lock() = Some(Arc::new(move |cursor| Box::pin(puller(cursor))));
    }

    pub fn has_puller(&self) -> bool {
        self.puller.lock().is_some()
    }

    pub fn schedule_push(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(error) = manager.push().await {
                warn!(error = %error, "scheduled push failed");
            }
        });
    }

    /// Drain every unpushed completed mutation, lowest id first, under the
    /// push lock. Schedules a pull afterwards when a puller is configured.
    pub async fn push(self: &Arc<Self>) -> Result<(), TidedbError> {
        if self.pushing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.push_loop().await;
        self.pushing.store(false, Ordering::Release);
        if self.has_puller() {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(error) = manager.pull().await {
                    warn!(error = %error, "post-push pull failed");
                }
            });
        }
        result
    }

    async fn push_loop(&self) -> Result<(), TidedbError> {
        let lock_name = format!("push:{}", self.config.name);
        let lease = Duration::from_millis(self.config.push_lock_lease_ms);
        loop {
            let Some(row) = self.next_unpushed()? else {
                break;
            };
            debug!(
                mutation_id = row.id,
                mutation = %row.mutation_name,
                attempts = row.remote_push_attempts,
                "pushing mutation"
            );
            self.locks
                .request(&lock_name, lease, || self.push_one(row))
                .await?;
        }
        Ok(())
    }

    fn next_unpushed(&self) -> Result<Option<MutationRow>, TidedbError> {
        let tx = OverlayTransaction::read(self.store.clone());
        Ok(tx
            .completed_mutations()?
            .into_iter()
            .find(|row| !row.is_pushed))
    }

    async fn push_one(&self, row: MutationRow) -> Result<(), TidedbError> {
        let remote = self
            .registry
            .get(&row.mutation_name)
            .and_then(|def| def.remote.clone());
        match remote {
            None => self.apply_locally(&row).await,
            Some(remote) => self.push_remote(row, remote).await,
        }
    }

    /// A mutation without a remote resolver never leaves this process: its
    /// recorded changes become authoritative and the row is purged.
    async fn apply_locally(&self, row: &MutationRow) -> Result<(), TidedbError> {
        let tx = OverlayTransaction::write(self.store.clone()).await;
        tx.purge_and_apply_mutation(row.id)?;
        let events = tx.commit()?;
        (self.on_commit)(events);
        Ok(())
    }

    async fn push_remote(
        &self,
        row: MutationRow,
        remote: RemoteResolver,
    ) -> Result<(), TidedbError> {
        let mut failures = row.remote_push_attempts;
        loop {
            // Persist the attempt count before calling out so a restart
            // resumes the backoff schedule instead of starting over.
            if !self.record_push_attempt(row.id, failures + 1).await? {
                return Ok(());
            }
            failures += 1;
            match (remote.mutation_fn)(row.local_resolver_result.clone()).await {
                Ok(ack) => {
                    self.mark_pushed(row.id, ack).await?;
                    if let Some(hook) = &remote.on_success {
                        hook(&ack);
                    }
                    return Ok(());
                }
                Err(error) => {
                    if remote.should_retry.allows(failures, &error) {
                        let delay = self.policy.backoff(failures);
                        warn!(
                            mutation_id = row.id,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "push attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            mutation_id = row.id,
                            failures,
                            error = %error,
                            "push abandoned, dropping mutation"
                        );
                        self.drop_mutation(row.id).await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns false when the row disappeared (GC'd by a concurrent pull).
    async fn record_push_attempt(&self, id: i64, attempts: u32) -> Result<bool, TidedbError> {
        let tx = OverlayTransaction::write(self.store.clone()).await;
        let Some(mut row) = tx.read_mutation(id)? else {
            tx.rollback();
            return Ok(false);
        };
        row.remote_push_attempts = attempts;
        tx.write_mutation(&row)?;
        tx.commit()?;
        Ok(true)
    }

    async fn mark_pushed(&self, id: i64, ack: PushAck) -> Result<(), TidedbError> {
        let tx = OverlayTransaction::write(self.store.clone()).await;
        let Some(mut row) = tx.read_mutation(id)? else {
            tx.rollback();
            return Ok(());
        };
        row.is_pushed = true;
        row.server_mutation_id = Some(ack.server_mutation_id);
        tx.write_mutation(&row)?;
        tx.commit()?;
        info!(
            mutation_id = id,
            server_mutation_id = ack.server_mutation_id,
            "mutation acknowledged by remote"
        );
        Ok(())
    }

    /// Terminal push failure: the row is deleted and its overlay effect
    /// disappears through the inverting GC events.
    async fn drop_mutation(&self, id: i64) -> Result<(), TidedbError> {
        let tx = OverlayTransaction::write(self.store.clone()).await;
        tx.delete_mutation_row(id)?;
        let events = tx.commit()?;
        (self.on_commit)(events);
        Ok(())
    }

    pub fn cursor(&self) -> Result<Option<Scalar>, TidedbError> {
        let tx = OverlayTransaction::read(self.store.clone());
        Ok(tx
            .meta_get(CURSOR_META_KEY)?
            .as_ref()
            .and_then(Scalar::from_value))
    }

    /// Pull authoritative changes from the configured puller. Callers that
    /// arrive while a pull is in flight wait for it and return without
    /// pulling again.
    pub async fn pull(self: &Arc<Self>) -> Result<(), TidedbError> {
        let Some(puller) = self.puller.lock().clone() else {
            return Ok(());
        };
        let epoch = self.pull_epoch.load(Ordering::Acquire);
        let _gate = self.pull_gate.lock().await;
        if self.pull_epoch.load(Ordering::Acquire) != epoch {
            return Ok(());
        }
        let cursor = self.cursor()?;
        debug!(cursor = ?cursor, "pulling from remote");
        let response = retry_unbounded(&self.policy, || puller(cursor.clone())).await;
        self.apply_response(response).await?;
        self.pull_epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Apply a partial pull response delivered out-of-band, without going
    /// through the puller.
    pub async fn apply_change(&self, response: PullResponse) -> Result<(), TidedbError> {
        self.apply_response(response).await
    }

    async fn apply_response(&self, response: PullResponse) -> Result<(), TidedbError> {
        let lock_name = format!("pull:{}", self.config.name);
        let lease = Duration::from_millis(self.config.pull_lock_lease_ms);
        self.locks
            .request(&lock_name, lease, || self.apply_in_tx(response))
            .await
    }

    async fn apply_in_tx(&self, response: PullResponse) -> Result<(), TidedbError> {
        let tx = OverlayTransaction::write(self.store.clone()).await;
        if let Some(last_processed) = response.last_processed_mutation_id {
            for row in tx.completed_mutations()? {
                let acked = row.is_pushed
                    && row
                        .server_mutation_id
                        .is_some_and(|id| id <= last_processed);
                if acked {
                    tx.delete_mutation_row(row.id)?;
                }
            }
        }
        for (collection, operations) in &response.change {
            for operation in operations {
                match operation {
                    PullOperation::Clear => tx.clear_authoritative(collection)?,
                    PullOperation::Created { key, value }
                    | PullOperation::Updated { key, value } => {
                        tx.upsert_authoritative(collection, key, value)?
                    }
                    PullOperation::Deleted { key } => {
                        tx.delete_authoritative(collection, key)?
                    }
                }
            }
        }
        if let Some(cursor) = &response.cursor {
            tx.meta_put(CURSOR_META_KEY, &cursor.to_value())?;
        }
        let events = tx.commit()?;
        (self.on_commit)(events);
        Ok(())
    }
}
