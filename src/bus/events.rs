use chrono::{DateTime, Utc};
use serde::Serialize;

/// One event on a session's stream. `seq` is assigned by the bus,
/// monotonically per session, and lets clients spot gaps after a lossy
/// catch-up.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    MessageDelta {
        text: String,
    },
    MessageDone {
        reason: String,
    },
    ToolStart {
        tool_call_id: String,
        name: String,
    },
    ToolEnd {
        tool_call_id: String,
        name: String,
        status: String,
    },
    ApprovalRequest {
        approval_id: String,
        tool_call_id: String,
        name: String,
        reason: String,
        expires_at: DateTime<Utc>,
    },
    ApprovalResolved {
        approval_id: String,
        approved: bool,
        reason: String,
    },
    CostUpdate {
        turn_id: String,
        cost: f64,
        /// Advisory warning when a budget threshold was crossed.
        warning: Option<String>,
    },
    BudgetExceeded {
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },
    SystemIntegrity {
        detail: String,
    },
    /// The subscriber overflowed; re-read the session tail from the store.
    LossyCatchup,
}

impl EventPayload {
    /// Topic name as exposed on the WebSocket surface and usable in
    /// subscription filters.
    pub fn topic(&self) -> &'static str {
        match self {
            EventPayload::MessageDelta { .. } => "message.delta",
            EventPayload::MessageDone { .. } => "message.done",
            EventPayload::ToolStart { .. } => "tool.start",
            EventPayload::ToolEnd { .. } => "tool.end",
            EventPayload::ApprovalRequest { .. } => "approval.request",
            EventPayload::ApprovalResolved { .. } => "approval.resolved",
            EventPayload::CostUpdate { .. } => "cost.update",
            EventPayload::BudgetExceeded { .. } => "budget.exceeded",
            EventPayload::Error { .. } => "error",
            EventPayload::SystemIntegrity { .. } => "system.integrity",
            EventPayload::LossyCatchup => "lossy.catchup",
        }
    }
}
