//! Human-approval brokering for tool calls the policy classified as
//! `review`. A suspended turn parks on a oneshot channel keyed by approval
//! id, so no runtime thread is held while waiting. Resolutions arrive from
//! the gateway; absence of a resolution inside the timeout is a denial.

use crate::bus::{EventBus, EventPayload};
use crate::errors::{PryxError, PryxResult};
use crate::store::{ApprovalResolution, ApprovalRow, Store, ToolCallRecord};
use crate::vault::{AuditEntry, AuditLog};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    Expired,
}

impl ApprovalOutcome {
    pub fn approved(self) -> bool {
        self == ApprovalOutcome::Approved
    }

    pub fn reason(self) -> &'static str {
        match self {
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Denied => "denied",
            ApprovalOutcome::Expired => "expired",
        }
    }
}

pub struct ApprovalBroker {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    audit: AuditLog,
    timeout: Duration,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalBroker {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, audit: AuditLog, timeout: Duration) -> Self {
        Self {
            store,
            bus,
            audit,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Suspend until the approval is resolved or expires. Persists the
    /// request, emits `approval.request`, and returns the final outcome.
    pub async fn request(
        &self,
        session_id: &str,
        tool_call: &ToolCallRecord,
        reason: &str,
    ) -> PryxResult<ApprovalOutcome> {
        let approval_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::zero());

        self.store.insert_approval(&ApprovalRow {
            id: approval_id.clone(),
            session_id: session_id.to_string(),
            tool_call_id: tool_call.id.clone(),
            reason: reason.to_string(),
            arguments: tool_call.arguments.clone(),
            created_at: now,
            expires_at,
            resolution: ApprovalResolution::Pending,
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(approval_id.clone(), tx);
        }

        self.bus.publish(
            session_id,
            EventPayload::ApprovalRequest {
                approval_id: approval_id.clone(),
                tool_call_id: tool_call.id.clone(),
                name: tool_call.name.clone(),
                reason: reason.to_string(),
                expires_at,
            },
        );
        self.audit
            .record(AuditEntry {
                actor: "approval".into(),
                action: "approval.request".into(),
                target: format!("{session_id}/{}", tool_call.id),
                metadata: json!({ "approval_id": approval_id, "tool": tool_call.name }),
            })
            .await;
        info!(
            "approval {} pending for {} (expires {})",
            approval_id, tool_call.name, expires_at
        );

        let outcome = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => ApprovalOutcome::Approved,
            Ok(Ok(false)) => ApprovalOutcome::Denied,
            Ok(Err(_)) => {
                // Sender dropped without a verdict; treat as denial.
                warn!("approval {} waiter channel dropped", approval_id);
                ApprovalOutcome::Denied
            }
            Err(_) => {
                // Timed out. Record expiry unless a resolution raced in.
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&approval_id);
                drop(pending);
                let recorded = self
                    .store
                    .resolve_approval(&approval_id, ApprovalResolution::Expired)?;
                match recorded {
                    ApprovalResolution::Approved => ApprovalOutcome::Approved,
                    ApprovalResolution::Denied => ApprovalOutcome::Denied,
                    _ => ApprovalOutcome::Expired,
                }
            }
        };

        if outcome == ApprovalOutcome::Expired {
            self.bus.publish(
                session_id,
                EventPayload::ApprovalResolved {
                    approval_id: approval_id.clone(),
                    approved: false,
                    reason: "expired".into(),
                },
            );
            self.audit
                .record(AuditEntry {
                    actor: "approval".into(),
                    action: "approval.expired".into(),
                    target: format!("{session_id}/{}", tool_call.id),
                    metadata: json!({ "approval_id": approval_id }),
                })
                .await;
        }

        Ok(outcome)
    }

    /// Resolve a pending approval. Unknown ids are rejected; re-resolving an
    /// already-settled approval is an idempotent no-op that returns the
    /// recorded outcome.
    pub async fn resolve(
        &self,
        approval_id: &str,
        approved: bool,
    ) -> PryxResult<ApprovalResolution> {
        let Some(row) = self.store.get_approval(approval_id)? else {
            return Err(PryxError::Internal(anyhow::anyhow!(
                "unknown approval id: {approval_id}"
            )));
        };
        if row.resolution != ApprovalResolution::Pending {
            debug!(
                "approval {} already resolved as {}",
                approval_id,
                row.resolution.as_str()
            );
            return Ok(row.resolution);
        }

        let desired = if approved {
            ApprovalResolution::Approved
        } else {
            ApprovalResolution::Denied
        };
        let recorded = self.store.resolve_approval(approval_id, desired)?;

        // Wake the suspended turn, if this process still holds it.
        let waiter = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(approval_id)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(recorded == ApprovalResolution::Approved);
        }

        self.bus.publish(
            &row.session_id,
            EventPayload::ApprovalResolved {
                approval_id: approval_id.to_string(),
                approved: recorded == ApprovalResolution::Approved,
                reason: recorded.as_str().to_string(),
            },
        );
        self.audit
            .record(AuditEntry {
                actor: "approval".into(),
                action: "approval.resolved".into(),
                target: format!("{}/{}", row.session_id, row.tool_call_id),
                metadata: json!({ "approval_id": approval_id, "resolution": recorded.as_str() }),
            })
            .await;
        Ok(recorded)
    }

    pub fn pending(&self) -> PryxResult<Vec<ApprovalRow>> {
        Ok(self.store.pending_approvals()?)
    }
}
