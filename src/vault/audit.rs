//! Append-only, hash-linked audit log.
//!
//! Appends must serialise globally, so a single writer task owns the chain
//! head: it computes each entry's `self_hash` from the previous entry's
//! hash, inserts the row, and only then advances `last_hash`. Everything
//! else talks to it through a queue.

use crate::store::{AuditRow, Store};
use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// Hash recorded as `prev_hash` of the first entry.
const GENESIS: &str = "genesis";

const QUEUE_CAPACITY: usize = 256;

pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub target: String,
    pub metadata: serde_json::Value,
}

struct QueuedEntry {
    entry: AuditEntry,
    ack: Option<oneshot::Sender<i64>>,
}

/// Cloneable handle to the audit writer task.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<QueuedEntry>,
}

impl AuditLog {
    /// Spawn the writer task. Picks up the chain head from the store so the
    /// chain continues across restarts.
    pub fn start(store: Arc<Store>) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<QueuedEntry>(QUEUE_CAPACITY);
        let last = store.last_audit().map_err(anyhow::Error::from)?;
        let mut last_hash = last
            .as_ref()
            .map_or_else(|| GENESIS.to_string(), |row| row.self_hash.clone());
        let mut next_seq = last.map_or(1, |row| row.seq + 1);
        info!("audit chain resuming at seq {}", next_seq);

        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let entry = queued.entry;
                let created_at = Utc::now();
                let metadata = entry.metadata.to_string();
                let self_hash = entry_hash(
                    next_seq,
                    &created_at.to_rfc3339(),
                    &entry.actor,
                    &entry.action,
                    &entry.target,
                    &metadata,
                    &last_hash,
                );
                let row = AuditRow {
                    seq: next_seq,
                    created_at,
                    actor: entry.actor,
                    action: entry.action,
                    target: entry.target,
                    metadata,
                    prev_hash: last_hash.clone(),
                    self_hash: self_hash.clone(),
                };
                match store.append_audit(&row) {
                    Ok(seq) => {
                        if seq != next_seq {
                            // Someone wrote to the table outside the writer;
                            // the chain is no longer ours to extend safely.
                            error!(
                                "audit seq drift: expected {}, store assigned {}",
                                next_seq, seq
                            );
                        }
                        last_hash = self_hash;
                        next_seq += 1;
                        if let Some(ack) = queued.ack {
                            let _ = ack.send(seq);
                        }
                    }
                    Err(e) => {
                        error!("audit append failed, entry dropped: {}", e);
                        if let Some(ack) = queued.ack {
                            drop(ack);
                        }
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    /// Fire-and-forget append. Ordering is still guaranteed by the queue.
    pub async fn record(&self, entry: AuditEntry) {
        if self
            .tx
            .send(QueuedEntry { entry, ack: None })
            .await
            .is_err()
        {
            error!("audit writer gone, entry lost");
        }
    }

    /// Append and wait until the row is committed. Use where ordering
    /// against a state transition is load-bearing (policy verdicts must hit
    /// the log before a tool call starts running).
    pub async fn record_sync(&self, entry: AuditEntry) -> Result<i64> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(QueuedEntry {
                entry,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| anyhow::anyhow!("audit writer gone"))?;
        ack_rx
            .await
            .map_err(|_| anyhow::anyhow!("audit append failed"))
    }
}

/// Outcome of a chain verification walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Ok { entries: i64 },
    Broken { first_bad_seq: i64, detail: String },
}

/// Walk the chain front to back and return the first broken link, if any.
pub fn verify_chain(store: &Store) -> Result<ChainStatus> {
    let rows = store.all_audit().map_err(anyhow::Error::from)?;
    let mut prev_hash = GENESIS.to_string();
    let mut expected_seq = None;
    for row in &rows {
        if let Some(expected) = expected_seq
            && row.seq != expected
        {
            return Ok(ChainStatus::Broken {
                first_bad_seq: row.seq,
                detail: format!("sequence gap: expected {}, found {}", expected, row.seq),
            });
        }
        if row.prev_hash != prev_hash {
            return Ok(ChainStatus::Broken {
                first_bad_seq: row.seq,
                detail: "prev_hash does not match previous entry".into(),
            });
        }
        let recomputed = entry_hash(
            row.seq,
            &row.created_at.to_rfc3339(),
            &row.actor,
            &row.action,
            &row.target,
            &row.metadata,
            &row.prev_hash,
        );
        if recomputed != row.self_hash {
            return Ok(ChainStatus::Broken {
                first_bad_seq: row.seq,
                detail: "self_hash mismatch".into(),
            });
        }
        prev_hash = row.self_hash.clone();
        expected_seq = Some(row.seq + 1);
    }
    Ok(ChainStatus::Ok {
        entries: rows.len() as i64,
    })
}

fn entry_hash(
    seq: i64,
    created_at: &str,
    actor: &str,
    action: &str,
    target: &str,
    metadata: &str,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    for field in [created_at, actor, action, target, metadata, prev_hash] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
