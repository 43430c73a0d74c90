use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: String,
    pub seq: i64,
    pub role: Role,
    pub body: String,
    /// Tool calls proposed by this (assistant) message.
    pub tool_calls: Vec<ToolCallRecord>,
    /// For tool-role messages: the id of the tool call this result answers.
    pub tool_call_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallStatus {
    Proposed,
    Approved,
    Denied,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ToolCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCallStatus::Proposed => "proposed",
            ToolCallStatus::Approved => "approved",
            ToolCallStatus::Denied => "denied",
            ToolCallStatus::Running => "running",
            ToolCallStatus::Succeeded => "succeeded",
            ToolCallStatus::Failed => "failed",
            ToolCallStatus::TimedOut => "timed-out",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "approved" => ToolCallStatus::Approved,
            "denied" => ToolCallStatus::Denied,
            "running" => ToolCallStatus::Running,
            "succeeded" => ToolCallStatus::Succeeded,
            "failed" => ToolCallStatus::Failed,
            "timed-out" => ToolCallStatus::TimedOut,
            _ => ToolCallStatus::Proposed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Unique within the session.
    pub id: String,
    /// Fully qualified `namespace.name`.
    pub name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ToolCallRecord {
    pub fn proposed(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Proposed,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalResolution {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalResolution::Pending => "pending",
            ApprovalResolution::Approved => "approved",
            ApprovalResolution::Denied => "denied",
            ApprovalResolution::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "approved" => ApprovalResolution::Approved,
            "denied" => ApprovalResolution::Denied,
            "expired" => ApprovalResolution::Expired,
            _ => ApprovalResolution::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub reason: String,
    pub arguments: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolution: ApprovalResolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub session_id: String,
    pub turn_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Unit price snapshot (per million tokens) at the time of the call.
    pub input_price: f64,
    pub output_price: f64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostGroupBy {
    Session,
    Day,
    Month,
    Provider,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostAggregate {
    pub key: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: String,
    /// JSON blob of action-specific detail.
    pub metadata: String,
    pub prev_hash: String,
    pub self_hash: String,
}
