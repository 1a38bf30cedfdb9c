//! Eventually consistent batch of pending entity writes.
//!
//! Entities join a [`Batch`] when they are created, updated or removed
//! through it. [`Batch::commit`] writes every queued entity independently:
//! recoverable store failures are retried per entity on the batch's
//! [`BatchPolicy`] until they succeed or the entity's timeout elapses, while
//! unrecoverable failures end that entity's commit at once. There is no
//! atomicity across entities.

use crate::core::{DbError, LogLevel, Logger, Result, RuntimeBinding};
use crate::database::BatchPolicy;
use crate::entity::{Entity, Item};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Instant, sleep};
use tracing::{Instrument, info_span};
use uuid::Uuid;

const LOG_SOURCE: &str = "Batch";

/// Store write an entity's commit performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Insert,
    Update,
    Delete,
    /// Nothing to write, e.g. an abandoned entity that never reached the store.
    None,
}

/// Type-erased view of a queued entity.
#[async_trait]
pub(crate) trait PendingWrite: Send + Sync {
    /// Qualified collection name.
    fn collection(&self) -> String;

    fn entity_id(&self) -> Uuid;

    /// One write attempt; applies the committed metadata on success.
    async fn persist_once(&self) -> Result<CommitAction>;
}

type EntryKey = (String, Uuid);

struct BatchEntries {
    committed: bool,
    pending: BTreeMap<EntryKey, Arc<dyn PendingWrite>>,
}

struct BatchInner {
    policy: BatchPolicy,
    logger: Arc<dyn Logger>,
    runtime: RuntimeBinding,
    entries: Mutex<BatchEntries>,
}

/// Buffered set of entity writes, committed exactly once.
///
/// Cloning yields another handle to the same batch. The batch keeps every
/// queued entity alive until the commit has finished with it.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

/// Final outcome of one entity in a commit.
#[derive(Debug, Clone)]
pub struct EntityCommitOutcome {
    pub collection: String,
    pub id: Uuid,
    pub attempts: usize,
    pub result: Result<CommitAction>,
}

impl EntityCommitOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<EntityCommitOutcome>,
}

impl BatchReport {
    /// True when every entity was written.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(EntityCommitOutcome::is_success)
    }

    pub fn failures(&self) -> Vec<&EntityCommitOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .collect()
    }

    pub fn outcome(&self, id: Uuid) -> Option<&EntityCommitOutcome> {
        self.outcomes.iter().find(|outcome| outcome.id == id)
    }
}

impl Batch {
    pub(crate) fn new(policy: BatchPolicy, logger: Arc<dyn Logger>, runtime: RuntimeBinding) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                policy,
                logger,
                runtime,
                entries: Mutex::new(BatchEntries {
                    committed: false,
                    pending: BTreeMap::new(),
                }),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BatchEntries> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn policy(&self) -> BatchPolicy {
        self.inner.policy
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.entries().committed {
            return Err(DbError::BatchAlreadyCommitted);
        }
        Ok(())
    }

    /// Queues `entity` for the next commit.
    ///
    /// Queueing the same entity twice keeps one entry. Use this to re-submit
    /// an entity whose previous commit failed.
    pub fn insert<T: Item>(&self, entity: Arc<Entity<T>>) -> Result<()> {
        self.insert_with(entity, || ())
    }

    /// Queues `entity`, running `apply` first while the batch is known to be
    /// open. `apply` runs under the batch lock and must not touch the batch.
    pub(crate) fn insert_with<T: Item, R>(
        &self,
        entity: Arc<Entity<T>>,
        apply: impl FnOnce() -> R,
    ) -> Result<R> {
        let key = (entity.collection(), entity.entity_id());
        let entry: Arc<dyn PendingWrite> = entity;
        let (result, replaced) = {
            let mut entries = self.entries();
            if entries.committed {
                return Err(DbError::BatchAlreadyCommitted);
            }
            let result = apply();
            (result, entries.pending.insert(key, entry))
        };
        drop(replaced);
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.entries().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_committed(&self) -> bool {
        self.entries().committed
    }

    /// Writes every queued entity and waits until each has succeeded or
    /// given up.
    ///
    /// Per-entity failures are reported in the [`BatchReport`], not as an
    /// error; the only error is [`DbError::BatchAlreadyCommitted`].
    pub async fn commit(&self) -> Result<BatchReport> {
        let pending = {
            let mut entries = self.entries();
            if entries.committed {
                return Err(DbError::BatchAlreadyCommitted);
            }
            entries.committed = true;
            std::mem::take(&mut entries.pending)
        };
        let entries: Vec<Arc<dyn PendingWrite>> = pending.into_values().collect();

        let span = info_span!("batch.commit", entries = entries.len());
        async move {
            self.log(
                LogLevel::Debug,
                "commit started",
                &[("entries", entries.len().to_string())],
            );

            let outcomes = join_all(entries.iter().map(|entry| self.commit_entry(entry))).await;
            let report = BatchReport { outcomes };

            self.log(
                LogLevel::Debug,
                "commit finished",
                &[
                    ("entries", report.outcomes.len().to_string()),
                    ("failures", report.failures().len().to_string()),
                ],
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Blocking form of [`Batch::commit`]. Must not be called from async code.
    pub fn commit_sync(&self) -> Result<BatchReport> {
        let batch = self.clone();
        self.inner
            .runtime
            .block_on(async move { batch.commit().await })?
    }

    /// Callback form of [`Batch::commit`]; returns immediately.
    pub fn commit_with<F>(&self, completion: F)
    where
        F: FnOnce(Result<BatchReport>) + Send + 'static,
    {
        let batch = self.clone();
        self.inner
            .runtime
            .spawn(async move { completion(batch.commit().await) });
    }

    async fn commit_entry(&self, entry: &Arc<dyn PendingWrite>) -> EntityCommitOutcome {
        let policy = self.inner.policy;
        let collection = entry.collection();
        let id = entry.entity_id();
        let deadline = Instant::now() + policy.timeout;
        let mut attempts = 0usize;

        let result = loop {
            attempts += 1;
            match entry.persist_once().await {
                Ok(action) => break Ok(action),
                Err(err) if err.is_recoverable() => {
                    if Instant::now() + policy.retry_interval > deadline {
                        self.log(
                            LogLevel::Error,
                            "entity commit timed out",
                            &[
                                ("collection", collection.clone()),
                                ("id", id.to_string()),
                                ("attempts", attempts.to_string()),
                                ("error", err.to_string()),
                            ],
                        );
                        break Err(DbError::Timeout(format!(
                            "Commit of '{}' gave up after {} attempts: {}",
                            id, attempts, err
                        )));
                    }
                    self.log(
                        LogLevel::Debug,
                        "entity commit failed, retrying",
                        &[
                            ("collection", collection.clone()),
                            ("id", id.to_string()),
                            ("attempt", attempts.to_string()),
                            ("error", err.to_string()),
                        ],
                    );
                    sleep(policy.retry_interval).await;
                }
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        "entity commit failed",
                        &[
                            ("collection", collection.clone()),
                            ("id", id.to_string()),
                            ("error", err.to_string()),
                        ],
                    );
                    break Err(err);
                }
            }
        };

        EntityCommitOutcome {
            collection,
            id,
            attempts,
            result,
        }
    }

    fn log(&self, level: LogLevel, message: &str, data: &[(&str, String)]) {
        self.inner
            .logger
            .log(level, LOG_SOURCE, "commit", message, data);
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries();
        f.debug_struct("Batch")
            .field("pending", &entries.pending.len())
            .field("committed", &entries.committed)
            .field("policy", &self.inner.policy)
            .finish()
    }
}
