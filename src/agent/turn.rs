//! Per-turn execution: the sequential state machine that drives one user
//! message through provider streaming, tool iterations, approvals, and
//! budget checks until a terminal assistant message.

use super::AgentLoop;
use crate::approval::ApprovalOutcome;
use crate::bus::EventPayload;
use crate::cost::{PreCheck, TokenUsage};
use crate::errors::{PryxError, PryxResult};
use crate::policy::{PolicyInput, Verdict};
use crate::providers::base::{
    ChatMessage, FinishReason, ProviderEvent, ProviderRequest, ToolCallRequest, estimate_tokens,
};
use crate::store::{NewMessage, Role, StoredMessage, ToolCallRecord, ToolCallStatus};
use crate::tools::{RegistryError, ToolResult};
use crate::vault::AuditEntry;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use tracing::{debug, info, warn};

const SUBMIT_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE_SECS: u64 = 1;
/// History window loaded for each provider submission.
const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: String,
    pub session_id: String,
    pub reason: String,
    pub assistant_text: String,
}

/// What one provider stream produced.
#[derive(Default)]
struct StreamOutcome {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    usage: Option<TokenUsage>,
    finish: Option<FinishReason>,
    error: Option<(String, bool)>,
    stalled: bool,
    cancelled: bool,
}

/// Accumulates tool-call fragments until the stream finalises them.
#[derive(Default)]
struct ToolCallAssembly {
    order: Vec<String>,
    names: HashMap<String, String>,
    fragments: HashMap<String, String>,
    finalised: Vec<ToolCallRequest>,
}

impl ToolCallAssembly {
    fn start(&mut self, id: String, name: String) {
        if !self.names.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.names.insert(id, name);
    }

    fn fragment(&mut self, id: &str, fragment: &str) {
        self.fragments.entry(id.to_string()).or_default().push_str(fragment);
    }

    fn finalise(&mut self, call: ToolCallRequest) {
        self.names.remove(&call.id);
        self.fragments.remove(&call.id);
        self.order.retain(|id| id != &call.id);
        self.finalised.push(call);
    }

    /// Finalise anything still pending from accumulated fragments.
    fn drain(mut self) -> Vec<ToolCallRequest> {
        for id in std::mem::take(&mut self.order) {
            let Some(name) = self.names.remove(&id) else {
                continue;
            };
            let raw = self.fragments.remove(&id).unwrap_or_default();
            let arguments: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
            self.finalised.push(ToolCallRequest {
                id,
                name,
                arguments,
            });
        }
        self.finalised
    }
}

impl AgentLoop {
    /// Execute one turn to completion. Every exit path emits
    /// `message.done` and leaves the session in a committed state.
    pub async fn run_turn(
        &self,
        session_id: &str,
        content: &str,
        cancel: CancellationToken,
    ) -> PryxResult<TurnReport> {
        let turn_id = Uuid::new_v4().to_string();
        info!("turn {} starting on session {}", turn_id, session_id);

        self.store
            .append_message(session_id, NewMessage::text(Role::User, content), None)
            .await?;

        let result = self.drive_turn(session_id, &turn_id, &cancel).await;
        match result {
            Ok(report) => {
                self.audit
                    .record(AuditEntry {
                        actor: "agent".into(),
                        action: "turn.finish".into(),
                        target: session_id.to_string(),
                        metadata: json!({ "turn_id": turn_id, "reason": report.reason }),
                    })
                    .await;
                Ok(report)
            }
            Err(e) => {
                if e.code() == "store.corruption" {
                    // The session was quarantined read-only; the runtime
                    // keeps serving other sessions.
                    self.bus.publish(
                        session_id,
                        EventPayload::SystemIntegrity {
                            detail: e.to_string(),
                        },
                    );
                }
                self.bus.publish(
                    session_id,
                    EventPayload::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                );
                self.finish(session_id, "error");
                self.audit
                    .record(AuditEntry {
                        actor: "agent".into(),
                        action: "turn.error".into(),
                        target: session_id.to_string(),
                        metadata: json!({ "turn_id": turn_id, "code": e.code() }),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn drive_turn(
        &self,
        session_id: &str,
        turn_id: &str,
        cancel: &CancellationToken,
    ) -> PryxResult<TurnReport> {
        let model = self.providers_config.default_model.clone();
        let provider_name = self.provider.name().to_string();
        let system_prompt = self.build_system_prompt();

        for round in 1..=self.config.max_tool_iterations {
            if cancel.is_cancelled() {
                return self
                    .finish_cancelled(
                        session_id,
                        turn_id,
                        &provider_name,
                        &model,
                        StreamOutcome::default(),
                    )
                    .await;
            }
            let history = self
                .store
                .load_session(session_id, Some(HISTORY_LIMIT), None)?;
            let messages = build_messages(&system_prompt, &history);
            let tools = self
                .registry
                .list()
                .into_iter()
                .map(|d| crate::providers::ToolDefinition {
                    name: d.name,
                    description: d.description,
                    parameters: d.parameters,
                })
                .collect();

            // Budget precheck before every submission.
            let estimated = estimate_tokens(&messages);
            match self.cost.pre_check(session_id, estimated, &model)? {
                PreCheck::Ok { warnings } => {
                    for warning in warnings {
                        debug!("budget warning on {}: {}", session_id, warning);
                    }
                }
                PreCheck::Abort { reason } => {
                    return Ok(self.finish_budget(session_id, turn_id, &reason, String::new()));
                }
            }

            let request = ProviderRequest {
                model: model.clone(),
                messages,
                tools,
                max_tokens: self.config.max_tokens,
                temperature: 0.7,
            };

            let outcome = self.submit_and_consume(session_id, request, cancel).await?;

            if outcome.cancelled {
                return self
                    .finish_cancelled(session_id, turn_id, &provider_name, &model, outcome)
                    .await;
            }
            if outcome.stalled {
                self.commit_partial_text(session_id, &outcome.text).await?;
                return Err(PryxError::ProviderStalled);
            }
            if let Some((message, _retryable)) = outcome.error {
                self.commit_partial_text(session_id, &outcome.text).await?;
                return Err(PryxError::Provider {
                    message,
                    retryable: false,
                });
            }

            // Record this round's usage while prices are known.
            let usage = outcome.usage.clone().unwrap_or_else(|| TokenUsage {
                input_tokens: estimated,
                output_tokens: (outcome.text.len() / 4) as i64,
            });
            self.cost
                .record_usage(session_id, turn_id, &provider_name, &model, &usage)?;

            if outcome.tool_calls.is_empty() {
                // Terminal assistant message. Committed before the budget
                // check so already-streamed text is preserved either way.
                self.store
                    .append_message(
                        session_id,
                        NewMessage {
                            role: Role::Assistant,
                            body: &outcome.text,
                            tool_calls: &[],
                            tool_call_id: None,
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        },
                        None,
                    )
                    .await?;
                if let Some(reason) = self.cost.check_mid_turn(session_id, 0.0)? {
                    return Ok(self.finish_budget(session_id, turn_id, &reason, outcome.text));
                }
                let reason = match outcome.finish {
                    Some(FinishReason::MaxTokens) => "max_tokens",
                    _ => "stop",
                };
                self.finish(session_id, reason);
                return Ok(TurnReport {
                    turn_id: turn_id.to_string(),
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                    assistant_text: outcome.text,
                });
            }

            // Tool iteration: persist the proposing assistant message, then
            // run each call sequentially.
            let records: Vec<ToolCallRecord> = outcome
                .tool_calls
                .iter()
                .map(|tc| ToolCallRecord::proposed(&tc.id, &tc.name, tc.arguments.clone()))
                .collect();
            self.store
                .append_message(
                    session_id,
                    NewMessage {
                        role: Role::Assistant,
                        body: &outcome.text,
                        tool_calls: &records,
                        tool_call_id: None,
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    },
                    None,
                )
                .await?;
            for record in &records {
                self.store.upsert_tool_call(session_id, record)?;
            }

            for call in &outcome.tool_calls {
                if cancel.is_cancelled() {
                    return self
                        .finish_cancelled(
                            session_id,
                            turn_id,
                            &provider_name,
                            &model,
                            StreamOutcome::default(),
                        )
                        .await;
                }
                self.run_tool_call(session_id, call, cancel).await?;
            }

            // Budget check at the safe boundary between tool iterations.
            if let Some(reason) = self.cost.check_mid_turn(session_id, 0.0)? {
                return Ok(self.finish_budget(session_id, turn_id, &reason, outcome.text));
            }
            debug!("turn {} finished round {}", turn_id, round);
        }

        // Iteration cap exceeded: synthesise a terminal assistant message.
        let body = format!(
            "Reached the tool iteration limit ({}) for this turn.",
            self.config.max_tool_iterations
        );
        self.store
            .append_message(session_id, NewMessage::text(Role::Assistant, &body), None)
            .await?;
        self.finish(session_id, "iteration_limit");
        Ok(TurnReport {
            turn_id: turn_id.to_string(),
            session_id: session_id.to_string(),
            reason: "iteration_limit".to_string(),
            assistant_text: body,
        })
    }

    /// Submit with bounded retries on transient errors, then consume the
    /// event stream under the inactivity timeout.
    async fn submit_and_consume(
        &self,
        session_id: &str,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> PryxResult<StreamOutcome> {
        let mut attempt = 0;
        // One re-resolution pass on auth failure: the credential chain gets
        // a chance to rotate an expired OAuth token before we give up.
        let mut auth_retry = true;
        let mut rx = loop {
            match self.provider.submit(request.clone(), cancel.child_token()).await {
                Ok(rx) => break rx,
                Err(e @ PryxError::Auth(_)) if auth_retry => {
                    auth_retry = false;
                    warn!("provider auth failed, retrying once after re-resolution: {}", e);
                }
                Err(e) if e.is_retryable() && attempt + 1 < SUBMIT_RETRIES => {
                    attempt += 1;
                    let delay = RETRY_BACKOFF_BASE_SECS * 2u64.pow(attempt - 1);
                    warn!(
                        "provider submit failed (attempt {}), retrying in {}s: {}",
                        attempt, delay, e
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            let mut outcome = StreamOutcome::default();
                            outcome.cancelled = true;
                            return Ok(outcome);
                        }
                        () = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let inactivity = Duration::from_secs(self.config.provider_inactivity_secs);
        let mut outcome = StreamOutcome::default();
        let mut assembly = ToolCallAssembly::default();

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                event = tokio::time::timeout(inactivity, rx.recv()) => event,
            };
            let event = match event {
                Err(_) => {
                    outcome.stalled = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(event)) => event,
            };
            match event {
                ProviderEvent::TextDelta(text) => {
                    outcome.text.push_str(&text);
                    self.bus
                        .publish(session_id, EventPayload::MessageDelta { text });
                }
                ProviderEvent::ToolCallStart { id, name } => assembly.start(id, name),
                ProviderEvent::ToolCallDelta {
                    id,
                    arguments_fragment,
                } => assembly.fragment(&id, &arguments_fragment),
                ProviderEvent::ToolCall(call) => assembly.finalise(call),
                ProviderEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    outcome.usage = Some(TokenUsage {
                        input_tokens,
                        output_tokens,
                    });
                }
                ProviderEvent::Finish(reason) => {
                    outcome.finish = Some(reason);
                    break;
                }
                ProviderEvent::Error { message, retryable } => {
                    outcome.error = Some((message, retryable));
                    break;
                }
            }
        }

        outcome.tool_calls = assembly.drain();
        Ok(outcome)
    }

    /// Policy → (approval) → execution for one proposed tool call. The
    /// result, success or failure, always lands as a model-visible
    /// tool-role message so the model can recover.
    async fn run_tool_call(
        &self,
        session_id: &str,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> PryxResult<()> {
        let mut record = ToolCallRecord::proposed(&call.id, &call.name, call.arguments.clone());

        let handle = match self.registry.resolve(&call.name) {
            Ok(handle) => handle,
            Err(e @ (RegistryError::ToolNotFound(_) | RegistryError::ToolDisabled(_))) => {
                record.status = ToolCallStatus::Failed;
                record.error = Some(e.to_string());
                self.store.upsert_tool_call(session_id, &record)?;
                self.append_tool_result(session_id, call, &ToolResult::error(e.to_string()))
                    .await?;
                return Ok(());
            }
            Err(e) => {
                return Err(PryxError::Tool {
                    tool: call.name.clone(),
                    message: e.to_string(),
                });
            }
        };

        let decision = self.policy.evaluate(&PolicyInput {
            session_id,
            agent: "main",
            tool: &call.name,
            action_class: handle.action_class,
            arguments: &call.arguments,
            estimated_cost: 0.0,
        });
        // Tools from untrusted MCP servers never get silent approval.
        let (verdict, reason) = if handle.untrusted && decision.verdict == Verdict::Allow {
            (
                Verdict::Review,
                "tool comes from an untrusted MCP server".to_string(),
            )
        } else {
            (decision.verdict, decision.reason)
        };

        // The verdict must be on the audit chain before any state
        // transition past `proposed`.
        self.audit
            .record_sync(AuditEntry {
                actor: "policy".into(),
                action: "policy.verdict".into(),
                target: format!("{session_id}/{}", call.id),
                metadata: json!({
                    "tool": call.name,
                    "verdict": verdict.as_str(),
                    "rule": decision.rule_id,
                    "reason": reason,
                }),
            })
            .await
            .map_err(PryxError::Internal)?;

        let approved = match verdict {
            Verdict::Allow => true,
            Verdict::Deny => {
                record.status = ToolCallStatus::Denied;
                record.error = Some(reason.clone());
                self.store.upsert_tool_call(session_id, &record)?;
                self.append_tool_result(
                    session_id,
                    call,
                    &ToolResult::error(format!("denied by policy: {reason}")),
                )
                .await?;
                return Ok(());
            }
            Verdict::Review => {
                let outcome = tokio::select! {
                    () = cancel.cancelled() => {
                        // Leave the approval pending; the broker will expire it.
                        return Ok(());
                    }
                    outcome = self.approvals.request(session_id, &record, &reason) => outcome?,
                };
                match outcome {
                    ApprovalOutcome::Approved => {
                        record.status = ToolCallStatus::Approved;
                        self.store.upsert_tool_call(session_id, &record)?;
                        true
                    }
                    denied => {
                        record.status = ToolCallStatus::Denied;
                        record.error = Some(denied.reason().to_string());
                        self.store.upsert_tool_call(session_id, &record)?;
                        self.append_tool_result(
                            session_id,
                            call,
                            &ToolResult::error(format!("denied: {}", denied.reason())),
                        )
                        .await?;
                        return Ok(());
                    }
                }
            }
        };
        debug_assert!(approved);

        record.status = ToolCallStatus::Running;
        record.started_at = Some(Utc::now());
        self.store.upsert_tool_call(session_id, &record)?;
        self.bus.publish(
            session_id,
            EventPayload::ToolStart {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
            },
        );

        // Registry-level failures (including invalid arguments) become
        // model-visible error results, not turn-level errors.
        let result = match self
            .registry
            .invoke(&handle, call.arguments.clone(), None)
            .await
        {
            Ok(result) => result,
            Err(e) => ToolResult::error(e.to_string()),
        };

        record.ended_at = Some(Utc::now());
        record.status = if !result.is_error {
            ToolCallStatus::Succeeded
        } else if result.content.contains("timed out") {
            ToolCallStatus::TimedOut
        } else {
            ToolCallStatus::Failed
        };
        if result.is_error {
            record.error = Some(result.content.clone());
        } else {
            record.result = Some(result.content.clone());
        }
        self.store.upsert_tool_call(session_id, &record)?;
        self.bus.publish(
            session_id,
            EventPayload::ToolEnd {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                status: record.status.as_str().to_string(),
            },
        );

        self.append_tool_result(session_id, call, &result).await?;
        Ok(())
    }

    /// Tool results are stored as a JSON envelope so error-ness survives
    /// the round trip back into provider messages.
    async fn append_tool_result(
        &self,
        session_id: &str,
        call: &ToolCallRequest,
        result: &ToolResult,
    ) -> PryxResult<()> {
        let body = json!({
            "content": result.content,
            "is_error": result.is_error,
        })
        .to_string();
        self.store
            .append_message(
                session_id,
                NewMessage {
                    role: Role::Tool,
                    body: &body,
                    tool_calls: &[],
                    tool_call_id: Some(&call.id),
                    input_tokens: 0,
                    output_tokens: 0,
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn commit_partial_text(&self, session_id: &str, text: &str) -> PryxResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.store
            .append_message(session_id, NewMessage::text(Role::Assistant, text), None)
            .await?;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        session_id: &str,
        turn_id: &str,
        provider_name: &str,
        model: &str,
        outcome: StreamOutcome,
    ) -> PryxResult<TurnReport> {
        self.commit_partial_text(session_id, &outcome.text).await?;
        // Record whatever cost is attributable: provider-reported usage if
        // it arrived, otherwise a best-effort estimate of the partial text.
        let usage = outcome.usage.unwrap_or_else(|| TokenUsage {
            input_tokens: 0,
            output_tokens: (outcome.text.len() / 4) as i64,
        });
        if usage.input_tokens > 0 || usage.output_tokens > 0 {
            self.cost
                .record_usage(session_id, turn_id, provider_name, model, &usage)?;
        }
        self.finish(session_id, "cancelled");
        info!("turn {} cancelled", turn_id);
        Ok(TurnReport {
            turn_id: turn_id.to_string(),
            session_id: session_id.to_string(),
            reason: "cancelled".to_string(),
            assistant_text: outcome.text,
        })
    }

    fn finish_budget(
        &self,
        session_id: &str,
        turn_id: &str,
        reason: &str,
        partial_text: String,
    ) -> TurnReport {
        warn!("budget stop on session {}: {}", session_id, reason);
        self.bus.publish(
            session_id,
            EventPayload::BudgetExceeded {
                reason: reason.to_string(),
            },
        );
        self.finish(session_id, "budget");
        TurnReport {
            turn_id: turn_id.to_string(),
            session_id: session_id.to_string(),
            reason: "budget".to_string(),
            assistant_text: partial_text,
        }
    }

    fn finish(&self, session_id: &str, reason: &str) {
        self.bus.publish(
            session_id,
            EventPayload::MessageDone {
                reason: reason.to_string(),
            },
        );
    }

    fn build_system_prompt(&self) -> String {
        let mut prompt = if self.config.system_prompt.is_empty() {
            "You are Pryx, a local-first assistant. Use the available tools when a request \
             needs external actions."
                .to_string()
        } else {
            self.config.system_prompt.clone()
        };
        let fragments = self.registry.skills().prompt_fragments();
        if !fragments.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&fragments);
        }
        prompt
    }
}

/// Convert the stored session tail into provider messages. Session-specific
/// instructions (stored system-role messages) ride along in order.
fn build_messages(system_prompt: &str, history: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut out = vec![ChatMessage::system(system_prompt)];
    for msg in history {
        match msg.role {
            Role::System => out.push(ChatMessage::system(&msg.body)),
            Role::User => out.push(ChatMessage::user(&msg.body)),
            Role::Assistant => {
                let tool_calls = msg
                    .tool_calls
                    .iter()
                    .map(|tc| ToolCallRequest {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    })
                    .collect();
                out.push(ChatMessage::assistant(&msg.body, tool_calls));
            }
            Role::Tool => {
                let (content, is_error) = parse_tool_envelope(&msg.body);
                out.push(ChatMessage::tool_result(
                    msg.tool_call_id.clone().unwrap_or_default(),
                    content,
                    is_error,
                ));
            }
        }
    }
    out
}

fn parse_tool_envelope(body: &str) -> (String, bool) {
    match serde_json::from_str::<Value>(body) {
        Ok(v) if v.get("content").is_some() => (
            v["content"].as_str().unwrap_or_default().to_string(),
            v["is_error"].as_bool().unwrap_or(false),
        ),
        _ => (body.to_string(), false),
    }
}

#[cfg(test)]
mod tests;
