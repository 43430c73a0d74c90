//! The agent loop: accepts chat turns, drives provider calls and tool
//! iterations, mediates approvals, tracks cost, and streams events to the
//! bus. One spawned task per turn; intra-turn execution is sequential.

mod turn;

pub use turn::TurnReport;

use crate::approval::ApprovalBroker;
use crate::bus::EventBus;
use crate::config::{AgentConfig, ProvidersConfig};
use crate::cost::CostTracker;
use crate::errors::PryxResult;
use crate::policy::PolicyEngine;
use crate::providers::LlmProvider;
use crate::store::{Session, Store};
use crate::tools::ToolRegistry;
use crate::vault::AuditLog;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct AgentLoop {
    pub(crate) store: Arc<Store>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) policy: Arc<PolicyEngine>,
    pub(crate) approvals: Arc<ApprovalBroker>,
    pub(crate) cost: Arc<CostTracker>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) audit: AuditLog,
    pub(crate) config: AgentConfig,
    pub(crate) providers_config: ProvidersConfig,
    /// Cancellation tokens of in-flight turns, keyed by session id.
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        policy: Arc<PolicyEngine>,
        approvals: Arc<ApprovalBroker>,
        cost: Arc<CostTracker>,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        audit: AuditLog,
        config: AgentConfig,
        providers_config: ProvidersConfig,
    ) -> Self {
        Self {
            store,
            bus,
            policy,
            approvals,
            cost,
            registry,
            provider,
            audit,
            config,
            providers_config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Find or create the session a turn targets. New sessions take their
    /// title from the first line of the opening message.
    pub fn ensure_session(
        &self,
        session_id: Option<&str>,
        owner: &str,
        content: &str,
    ) -> PryxResult<Session> {
        match session_id {
            Some(id) => Ok(self.store.get_session(id)?),
            None => {
                let mut title: String = content.lines().next().unwrap_or("").to_string();
                if title.len() > 64 {
                    title.truncate(64);
                }
                if title.is_empty() {
                    title = "untitled".to_string();
                }
                Ok(self.store.create_session(owner, &title)?)
            }
        }
    }

    /// Spawn a turn as an independent task and return its cancellation
    /// token. The turn's hard ceiling is enforced by a watchdog that fires
    /// the same token.
    pub fn spawn_turn(self: &Arc<Self>, session_id: String, content: String) -> CancellationToken {
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(session_id.clone(), token.clone());
        }

        let watchdog = token.clone();
        let ceiling = std::time::Duration::from_secs(self.config.turn_ceiling_secs);
        tokio::spawn(async move {
            tokio::select! {
                () = watchdog.cancelled() => {}
                () = tokio::time::sleep(ceiling) => {
                    warn!("turn hit the {}s hard ceiling, cancelling", ceiling.as_secs());
                    watchdog.cancel();
                }
            }
        });

        let agent = self.clone();
        let turn_token = token.clone();
        tokio::spawn(async move {
            match agent.run_turn(&session_id, &content, turn_token.clone()).await {
                Ok(report) => info!(
                    "turn {} finished ({}, {} chars)",
                    report.turn_id,
                    report.reason,
                    report.assistant_text.len()
                ),
                Err(e) => warn!("turn on session {} failed: {}", session_id, e),
            }
            turn_token.cancel();
            let mut active = agent.active.lock().unwrap_or_else(|e| e.into_inner());
            // Only remove our own token; a newer turn may have replaced it.
            if active.get(&session_id).is_some_and(|t| t.is_cancelled()) {
                active.remove(&session_id);
            }
        });

        token
    }

    /// Cancel the in-flight turn on a session, if any.
    pub fn cancel_turn(&self, session_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
}
