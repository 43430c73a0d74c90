//! Shared harness: a full runtime wired to a scripted provider.
#![allow(dead_code)]

use pryx::agent::AgentLoop;
use pryx::approval::ApprovalBroker;
use pryx::bus::EventBus;
use pryx::config::{AgentConfig, BudgetConfig, PolicyRuleConfig, ProvidersConfig, ToolsConfig};
use pryx::cost::CostTracker;
use pryx::policy::PolicyEngine;
use pryx::providers::mock::MockProvider;
use pryx::providers::{FinishReason, ProviderEvent, ToolCallRequest};
use pryx::skills::SkillsLoader;
use pryx::store::Store;
use pryx::tools::ToolRegistry;
use pryx::tools::mcp::McpManager;
use pryx::vault::AuditLog;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    pub dir: tempfile::TempDir,
    pub agent: Arc<AgentLoop>,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub cost: Arc<CostTracker>,
}

pub struct RuntimeOptions {
    pub scripts: Vec<Vec<ProviderEvent>>,
    pub budget: BudgetConfig,
    pub policy: Vec<PolicyRuleConfig>,
    pub approval_timeout: Duration,
    pub agent: AgentConfig,
    pub provider_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            scripts: vec![],
            budget: BudgetConfig::default(),
            policy: vec![],
            approval_timeout: Duration::from_secs(5),
            agent: AgentConfig::default(),
            provider_delay: Duration::ZERO,
        }
    }
}

pub fn runtime(options: RuntimeOptions) -> Runtime {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("pryx.db")).unwrap());
    let bus = Arc::new(EventBus::new());
    let audit = AuditLog::start(store.clone()).unwrap();
    let policy = Arc::new(PolicyEngine::from_config(&options.policy).unwrap());
    let approvals = Arc::new(ApprovalBroker::new(
        store.clone(),
        bus.clone(),
        audit.clone(),
        options.approval_timeout,
    ));
    let cost = Arc::new(CostTracker::new(
        store.clone(),
        bus.clone(),
        options.budget,
    ));
    let skills = Arc::new(SkillsLoader::new(dir.path(), HashMap::new()));
    let mcp = Arc::new(McpManager::from_config(&HashMap::new()));
    let registry = Arc::new(ToolRegistry::new(
        dir.path().to_path_buf(),
        ToolsConfig::default(),
        skills,
        mcp,
    ));
    let provider = Arc::new(MockProvider::new(options.scripts).with_delay(options.provider_delay));
    let agent = Arc::new(AgentLoop::new(
        store.clone(),
        bus.clone(),
        policy,
        approvals,
        cost.clone(),
        registry,
        provider,
        audit,
        options.agent,
        ProvidersConfig {
            default_model: "claude-sonnet-4-5".into(),
            ..ProvidersConfig::default()
        },
    ));
    Runtime {
        dir,
        agent,
        store,
        bus,
        cost,
    }
}

pub fn text_turn(text: &str) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::TextDelta(text.to_string()),
        ProviderEvent::Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
        ProviderEvent::Finish(FinishReason::Stop),
    ]
}

pub fn tool_turn(id: &str, name: &str, args: serde_json::Value) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::ToolCall(ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }),
        ProviderEvent::Usage {
            input_tokens: 20,
            output_tokens: 10,
        },
        ProviderEvent::Finish(FinishReason::ToolUse),
    ]
}

pub fn allow_rule(tool: &str) -> PolicyRuleConfig {
    PolicyRuleConfig {
        id: format!("allow-{tool}"),
        tool: Some(tool.to_string()),
        action_class: None,
        args: HashMap::new(),
        verdict: "allow".into(),
        max_cost: None,
        active: true,
    }
}
