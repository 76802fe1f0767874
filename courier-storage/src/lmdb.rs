//! LMDB-backed durable store
//!
//! Uses heed to keep webhooks, pending deliveries, attempt logs and the set
//! of finished logs in four named databases inside one environment. Values
//! are JSON, keys are the raw 16 bytes of the record's UUID. Every trait method runs in exactly one LMDB
//! transaction, and LMDB serializes writers, so counter updates and queue
//! mutations are atomic across concurrent callers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use courier_core::{
    CourierError, CourierResult, Delivery, DeliveryAttempt, DeliveryId, StorageError, TenantId,
    Timestamp, Webhook, WebhookId,
};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::{sort_by_due, AttemptLog, OutcomeKind, WebhookEdit, WebhookStore};

const WEBHOOKS_DB: &str = "webhooks";
const DELIVERIES_DB: &str = "deliveries";
const ATTEMPTS_DB: &str = "attempts";
const FINISHED_DB: &str = "finished";

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment at {path}: {reason}")]
    EnvOpen { path: String, reason: String },

    /// Failed to open a named database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for CourierError {
    fn from(e: LmdbStoreError) -> Self {
        let storage = match e {
            LmdbStoreError::EnvOpen { path, reason } => StorageError::Open { path, reason },
            LmdbStoreError::Serialization(reason) | LmdbStoreError::Deserialization(reason) => {
                StorageError::Serialization { reason }
            }
            other => StorageError::TransactionFailed {
                reason: other.to_string(),
            },
        };
        CourierError::Storage(storage)
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LmdbStoreError> {
    serde_json::to_vec(value).map_err(|e| LmdbStoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbStoreError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbStoreError::Deserialization(e.to_string()))
}

fn key(id: &Uuid) -> &[u8] {
    id.as_bytes().as_slice()
}

/// Durable [`WebhookStore`] on an LMDB environment.
///
/// # Example
///
/// ```ignore
/// use courier_storage::LmdbStore;
///
/// let store = LmdbStore::open("/var/lib/courier", 256)?;
/// let pending = store.delivery_count().await?;
/// ```
pub struct LmdbStore {
    env: Env,
    path: PathBuf,
    webhooks: Database<Bytes, Bytes>,
    deliveries: Database<Bytes, Bytes>,
    attempts: Database<Bytes, Bytes>,
    /// Keys of attempt logs whose delivery is finished. UUIDv7 keys iterate
    /// oldest delivery first.
    finished: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore").field("path", &self.path).finish()
    }
}

impl LmdbStore {
    /// Open (or create) a store in `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the environment in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the environment
    /// cannot be opened, or one of the named databases cannot be created.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, LmdbStoreError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        // SAFETY: the environment is opened once per directory by this process
        // and the files are not modified by anything other than LMDB.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(4)
                .open(path)
        }
        .map_err(|e| LmdbStoreError::EnvOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let mut create = |name: &'static str| {
            env.create_database::<Bytes, Bytes>(&mut wtxn, Some(name))
                .map_err(|e| LmdbStoreError::DbOpen {
                    name,
                    reason: e.to_string(),
                })
        };
        let webhooks = create(WEBHOOKS_DB)?;
        let deliveries = create(DELIVERIES_DB)?;
        let attempts = create(ATTEMPTS_DB)?;
        let finished = create(FINISHED_DB)?;
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.display(), map_size_mb, "Opened LMDB store");

        Ok(Self {
            env,
            path: path.to_path_buf(),
            webhooks,
            deliveries,
            attempts,
            finished,
        })
    }

    /// Directory backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the environment, blocking until LMDB has released it.
    ///
    /// The same directory may be reopened afterwards in this process.
    pub fn close(self) {
        self.env.prepare_for_closing().wait();
    }

    fn scan<T: DeserializeOwned>(
        &self,
        txn: &RoTxn<'_>,
        db: Database<Bytes, Bytes>,
    ) -> Result<Vec<T>, LmdbStoreError> {
        let mut out = Vec::new();
        for entry in db.iter(txn).map_err(txn_err)? {
            let (_, value) = entry.map_err(txn_err)?;
            out.push(decode(value)?);
        }
        Ok(out)
    }

    fn pending(&self) -> Result<Vec<Delivery>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.scan(&rtxn, self.deliveries)
    }

    fn all_webhooks(&self) -> Result<Vec<Webhook>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut webhooks: Vec<Webhook> = self.scan(&rtxn, self.webhooks)?;
        webhooks.sort_by_key(|w| w.id);
        Ok(webhooks)
    }

    fn read<T: DeserializeOwned>(
        &self,
        db: Database<Bytes, Bytes>,
        id: &Uuid,
    ) -> Result<Option<T>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match db.get(&rtxn, key(id)).map_err(txn_err)? {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Overwrite an existing record. Returns false when the key is absent.
    fn overwrite<T: Serialize>(
        &self,
        db: Database<Bytes, Bytes>,
        id: &Uuid,
        value: &T,
    ) -> Result<bool, LmdbStoreError> {
        let bytes = encode(value)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if db.get(&wtxn, key(id)).map_err(txn_err)?.is_none() {
            return Ok(false);
        }
        db.put(&mut wtxn, key(id), &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }
}

#[async_trait]
impl WebhookStore for LmdbStore {
    async fn webhook_insert(&self, webhook: &Webhook) -> CourierResult<()> {
        let bytes = encode(webhook)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.webhooks
            .put(&mut wtxn, key(&webhook.id), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn webhook_get(&self, id: WebhookId) -> CourierResult<Option<Webhook>> {
        Ok(self.read(self.webhooks, &id)?)
    }

    async fn webhook_modify(
        &self,
        id: WebhookId,
        edit: WebhookEdit<'_>,
    ) -> CourierResult<Option<(Webhook, Webhook)>> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let before: Webhook = match self.webhooks.get(&wtxn, key(&id)).map_err(txn_err)? {
            Some(bytes) => decode(bytes)?,
            None => return Ok(None),
        };
        let mut after = before.clone();
        // Dropping the txn on error aborts it.
        edit(&mut after)?;
        let bytes = encode(&after)?;
        self.webhooks
            .put(&mut wtxn, key(&id), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(Some((before, after)))
    }

    async fn webhook_delete(
        &self,
        id: WebhookId,
    ) -> CourierResult<Option<(Webhook, Vec<DeliveryId>)>> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let webhook: Webhook = match self.webhooks.get(&wtxn, key(&id)).map_err(txn_err)? {
            Some(bytes) => decode(bytes)?,
            None => return Ok(None),
        };

        let pending: Vec<Delivery> = self.scan(&wtxn, self.deliveries)?;
        let doomed: Vec<DeliveryId> = pending
            .iter()
            .filter(|d| d.webhook_id == id)
            .map(|d| d.id)
            .collect();
        let logs: Vec<AttemptLog> = self.scan(&wtxn, self.attempts)?;
        let doomed_logs: Vec<DeliveryId> = logs
            .iter()
            .filter(|log| log.webhook_id == id)
            .map(|log| log.delivery_id)
            .collect();

        self.webhooks.delete(&mut wtxn, key(&id)).map_err(txn_err)?;
        for delivery_id in &doomed {
            self.deliveries
                .delete(&mut wtxn, key(delivery_id))
                .map_err(txn_err)?;
        }
        for delivery_id in &doomed_logs {
            self.attempts
                .delete(&mut wtxn, key(delivery_id))
                .map_err(txn_err)?;
            self.finished
                .delete(&mut wtxn, key(delivery_id))
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;

        Ok(Some((webhook, doomed)))
    }

    async fn webhook_list(&self) -> CourierResult<Vec<Webhook>> {
        Ok(self.all_webhooks()?)
    }

    async fn webhook_list_by_tenant(&self, tenant_id: TenantId) -> CourierResult<Vec<Webhook>> {
        let mut webhooks = self.all_webhooks()?;
        webhooks.retain(|w| w.tenant_id == tenant_id);
        Ok(webhooks)
    }

    async fn webhook_record_outcome(
        &self,
        id: WebhookId,
        outcome: OutcomeKind,
        at: Timestamp,
    ) -> CourierResult<Option<Webhook>> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut webhook: Webhook = match self.webhooks.get(&wtxn, key(&id)).map_err(txn_err)? {
            Some(bytes) => decode(bytes)?,
            None => return Ok(None),
        };
        match outcome {
            OutcomeKind::Success => webhook.record_success(at),
            OutcomeKind::Failure => webhook.record_failure(at),
        }
        let bytes = encode(&webhook)?;
        self.webhooks
            .put(&mut wtxn, key(&id), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(Some(webhook))
    }

    async fn delivery_enqueue(&self, delivery: &Delivery) -> CourierResult<()> {
        let bytes = encode(delivery)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.deliveries
            .put(&mut wtxn, key(&delivery.id), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delivery_get(&self, id: DeliveryId) -> CourierResult<Option<Delivery>> {
        Ok(self.read(self.deliveries, &id)?)
    }

    async fn delivery_due(&self, now: Timestamp, limit: usize) -> CourierResult<Vec<Delivery>> {
        let mut due = self.pending()?;
        due.retain(|d| d.is_due(now));
        sort_by_due(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn delivery_update(&self, delivery: &Delivery) -> CourierResult<bool> {
        Ok(self.overwrite(self.deliveries, &delivery.id, delivery)?)
    }

    async fn delivery_finish(
        &self,
        id: DeliveryId,
        retain_finished: usize,
    ) -> CourierResult<Option<Delivery>> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let delivery: Delivery = match self.deliveries.get(&wtxn, key(&id)).map_err(txn_err)? {
            Some(bytes) => decode(bytes)?,
            None => return Ok(None),
        };
        self.deliveries
            .delete(&mut wtxn, key(&id))
            .map_err(txn_err)?;

        if self.attempts.get(&wtxn, key(&id)).map_err(txn_err)?.is_some() {
            self.finished
                .put(&mut wtxn, key(&id), b"")
                .map_err(txn_err)?;
        }

        let kept = self.finished.len(&wtxn).map_err(txn_err)? as usize;
        let excess = kept.saturating_sub(retain_finished);
        if excess > 0 {
            let mut oldest: Vec<Vec<u8>> = Vec::with_capacity(excess);
            for entry in self.finished.iter(&wtxn).map_err(txn_err)?.take(excess) {
                let (log_key, _) = entry.map_err(txn_err)?;
                oldest.push(log_key.to_vec());
            }
            for log_key in &oldest {
                self.finished.delete(&mut wtxn, log_key).map_err(txn_err)?;
                self.attempts.delete(&mut wtxn, log_key).map_err(txn_err)?;
            }
        }

        wtxn.commit().map_err(txn_err)?;
        Ok(Some(delivery))
    }

    async fn delivery_list(&self) -> CourierResult<Vec<Delivery>> {
        let mut deliveries = self.pending()?;
        sort_by_due(&mut deliveries);
        Ok(deliveries)
    }

    async fn delivery_count(&self) -> CourierResult<usize> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let len = self.deliveries.len(&rtxn).map_err(txn_err)?;
        Ok(len as usize)
    }

    async fn attempt_record(
        &self,
        delivery: &Delivery,
        attempt: &DeliveryAttempt,
        limit: usize,
    ) -> CourierResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if self
            .deliveries
            .get(&wtxn, key(&delivery.id))
            .map_err(txn_err)?
            .is_none()
        {
            return Ok(false);
        }
        let mut log: AttemptLog = match self
            .attempts
            .get(&wtxn, key(&delivery.id))
            .map_err(txn_err)?
        {
            Some(bytes) => decode(bytes)?,
            None => AttemptLog::for_delivery(delivery),
        };
        log.push(attempt, limit);
        let bytes = encode(&log)?;
        self.attempts
            .put(&mut wtxn, key(&delivery.id), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn finished_log_count(&self) -> CourierResult<usize> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let len = self.finished.len(&rtxn).map_err(txn_err)?;
        Ok(len as usize)
    }

    async fn attempt_history(&self, delivery_id: DeliveryId) -> CourierResult<Option<AttemptLog>> {
        Ok(self.read(self.attempts, &delivery_id)?)
    }
}
