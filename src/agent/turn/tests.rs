use super::*;
use crate::approval::ApprovalBroker;
use crate::bus::EventBus;
use crate::config::{AgentConfig, BudgetConfig, PolicyRuleConfig, ProvidersConfig, ToolsConfig};
use crate::cost::CostTracker;
use crate::policy::PolicyEngine;
use crate::providers::mock::MockProvider;
use crate::skills::SkillsLoader;
use crate::store::Store;
use crate::tools::ToolRegistry;
use crate::tools::mcp::McpManager;
use crate::vault::AuditLog;
use std::sync::Arc;

struct Harness {
    _dir: tempfile::TempDir,
    agent: Arc<AgentLoop>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

fn make_agent(
    scripts: Vec<Vec<ProviderEvent>>,
    budget: BudgetConfig,
    policy_rules: Vec<PolicyRuleConfig>,
    approval_timeout: Duration,
    agent_config: AgentConfig,
) -> Harness {
    make_agent_with_provider(
        Arc::new(MockProvider::new(scripts)),
        budget,
        policy_rules,
        approval_timeout,
        agent_config,
    )
}

fn make_agent_with_provider(
    provider: Arc<MockProvider>,
    budget: BudgetConfig,
    policy_rules: Vec<PolicyRuleConfig>,
    approval_timeout: Duration,
    agent_config: AgentConfig,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("pryx.db")).unwrap());
    let bus = Arc::new(EventBus::new());
    let audit = AuditLog::start(store.clone()).unwrap();
    let policy = Arc::new(PolicyEngine::from_config(&policy_rules).unwrap());
    let approvals = Arc::new(ApprovalBroker::new(
        store.clone(),
        bus.clone(),
        audit.clone(),
        approval_timeout,
    ));
    let cost = Arc::new(CostTracker::new(store.clone(), bus.clone(), budget));
    let skills = Arc::new(SkillsLoader::new(dir.path(), Default::default()));
    let mcp = Arc::new(McpManager::from_config(&Default::default()));
    let registry = Arc::new(ToolRegistry::new(
        dir.path().to_path_buf(),
        ToolsConfig::default(),
        skills,
        mcp,
    ));
    let agent = Arc::new(AgentLoop::new(
        store.clone(),
        bus.clone(),
        policy,
        approvals,
        cost,
        registry,
        provider,
        audit,
        agent_config,
        ProvidersConfig {
            default_model: "claude-sonnet-4-5".into(),
            ..ProvidersConfig::default()
        },
    ));
    Harness {
        _dir: dir,
        agent,
        store,
        bus,
    }
}

fn allow_rule(tool: &str) -> PolicyRuleConfig {
    PolicyRuleConfig {
        id: format!("allow-{tool}"),
        tool: Some(tool.to_string()),
        action_class: None,
        args: Default::default(),
        verdict: "allow".into(),
        max_cost: None,
        active: true,
    }
}

fn deny_rule(tool: &str) -> PolicyRuleConfig {
    PolicyRuleConfig {
        id: format!("deny-{tool}"),
        tool: Some(tool.to_string()),
        action_class: None,
        args: Default::default(),
        verdict: "deny".into(),
        max_cost: None,
        active: true,
    }
}

fn drain_topics(rx: &mut tokio::sync::mpsc::Receiver<crate::bus::SessionEvent>) -> Vec<String> {
    let mut topics = Vec::new();
    while let Ok(event) = rx.try_recv() {
        topics.push(event.payload.topic().to_string());
    }
    topics
}

fn text_turn(text: &str) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::TextDelta(text.to_string()),
        ProviderEvent::Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
        ProviderEvent::Finish(FinishReason::Stop),
    ]
}

fn tool_turn(id: &str, name: &str, args: Value) -> Vec<ProviderEvent> {
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

#[tokio::test]
async fn happy_turn_without_tools() {
    let h = make_agent(
        vec![text_turn("Hello there")],
        BudgetConfig::default(),
        vec![],
        Duration::from_secs(5),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();
    let mut rx = h.bus.subscribe(&session.id, None);

    let report = h
        .agent
        .run_turn(&session.id, "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reason, "stop");
    assert_eq!(report.assistant_text, "Hello there");

    let messages = h.store.load_session(&session.id, None, None).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].body, "hi");
    assert_eq!(messages[1].role, Role::Assistant);
    assert!(!messages[1].body.is_empty());

    let topics = drain_topics(&mut rx);
    assert!(topics.contains(&"message.delta".to_string()));
    assert!(topics.contains(&"cost.update".to_string()));
    assert_eq!(topics.last().unwrap(), "message.done");
}

#[tokio::test]
async fn tool_allowed_by_policy_executes_and_resumes() {
    let h = make_agent(
        vec![
            tool_turn("tc-1", "fs.read", json!({"path": "hello.txt"})),
            text_turn("The file says hi"),
        ],
        BudgetConfig::default(),
        vec![allow_rule("fs.read")],
        Duration::from_secs(5),
        AgentConfig::default(),
    );
    std::fs::write(h._dir.path().join("hello.txt"), "hi from disk").unwrap();
    let session = h.store.create_session("test", "t").unwrap();
    let mut rx = h.bus.subscribe(&session.id, None);

    let report = h
        .agent
        .run_turn(&session.id, "read hello.txt", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reason, "stop");

    let messages = h.store.load_session(&session.id, None, None).unwrap();
    // user, assistant(tool call), tool result, assistant
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].tool_calls.len(), 1);
    assert_eq!(messages[2].role, Role::Tool);
    assert!(messages[2].body.contains("hi from disk"));
    assert_eq!(messages[3].role, Role::Assistant);

    let record = h.store.get_tool_call(&session.id, "tc-1").unwrap().unwrap();
    assert_eq!(record.status, ToolCallStatus::Succeeded);

    let topics = drain_topics(&mut rx);
    assert!(topics.contains(&"tool.start".to_string()));
    assert!(topics.contains(&"tool.end".to_string()));
    assert_eq!(topics.last().unwrap(), "message.done");
}

#[tokio::test]
async fn review_tool_waits_for_external_approval() {
    let h = make_agent(
        vec![
            tool_turn("tc-1", "shell.exec", json!({"command": "echo approved"})),
            text_turn("Command ran"),
        ],
        BudgetConfig::default(),
        vec![], // default verdict is review
        Duration::from_secs(10),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();
    let mut rx = h.bus.subscribe(&session.id, None);

    let agent = h.agent.clone();
    let sid = session.id.clone();
    let turn = tokio::spawn(async move {
        agent.run_turn(&sid, "run it", CancellationToken::new()).await
    });

    // Wait for the approval request to surface, then approve it.
    let approval_id = loop {
        if let Some(row) = h.store.pending_approvals().unwrap().first() {
            break row.id.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    h.agent
        .approvals()
        .resolve(&approval_id, true)
        .await
        .unwrap();

    let report = turn.await.unwrap().unwrap();
    assert_eq!(report.reason, "stop");

    let record = h.store.get_tool_call(&session.id, "tc-1").unwrap().unwrap();
    assert_eq!(record.status, ToolCallStatus::Succeeded);

    let topics = drain_topics(&mut rx);
    assert!(topics.contains(&"approval.request".to_string()));
    assert!(topics.contains(&"approval.resolved".to_string()));
    assert!(topics.contains(&"tool.start".to_string()));
}

#[tokio::test]
async fn approval_expiry_becomes_synthetic_denial() {
    let h = make_agent(
        vec![
            tool_turn("tc-1", "shell.exec", json!({"command": "echo nope"})),
            text_turn("Understood, I won't run it"),
        ],
        BudgetConfig::default(),
        vec![],
        Duration::from_millis(100),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();

    let report = h
        .agent
        .run_turn(&session.id, "run it", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reason, "stop");

    let messages = h.store.load_session(&session.id, None, None).unwrap();
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.body.contains("denied: expired"));

    let record = h.store.get_tool_call(&session.id, "tc-1").unwrap().unwrap();
    assert_eq!(record.status, ToolCallStatus::Denied);
    // The model still got to produce recovery text.
    assert_eq!(
        messages.last().unwrap().body,
        "Understood, I won't run it"
    );
}

#[tokio::test]
async fn policy_deny_yields_error_envelope() {
    let h = make_agent(
        vec![
            tool_turn("tc-1", "shell.exec", json!({"command": "rm -rf /"})),
            text_turn("I was not allowed to do that"),
        ],
        BudgetConfig::default(),
        vec![deny_rule("shell.exec")],
        Duration::from_secs(5),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();

    h.agent
        .run_turn(&session.id, "wipe the disk", CancellationToken::new())
        .await
        .unwrap();

    let messages = h.store.load_session(&session.id, None, None).unwrap();
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.body.contains("denied by policy"));

    // The verdict is on the audit chain.
    let actions: Vec<String> = h
        .store
        .all_audit()
        .unwrap()
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert!(actions.contains(&"policy.verdict".to_string()));
}

#[tokio::test]
async fn budget_breach_finishes_with_budget_reason() {
    let h = make_agent(
        vec![text_turn("expensive answer")],
        BudgetConfig {
            per_day: Some(0.000_001),
            ..BudgetConfig::default()
        },
        vec![],
        Duration::from_secs(5),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();
    let mut rx = h.bus.subscribe(&session.id, None);

    let report = h
        .agent
        .run_turn(&session.id, "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reason, "budget");

    // Streamed text is preserved.
    let messages = h.store.load_session(&session.id, None, None).unwrap();
    assert_eq!(messages.last().unwrap().body, "expensive answer");

    let topics = drain_topics(&mut rx);
    assert!(topics.contains(&"budget.exceeded".to_string()));
    assert_eq!(topics.last().unwrap(), "message.done");

    // Further turns are refused before submission.
    let report = h
        .agent
        .run_turn(&session.id, "again", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reason, "budget");
}

#[tokio::test]
async fn cancellation_preserves_partial_text() {
    let provider = Arc::new(
        MockProvider::new(vec![vec![
            ProviderEvent::TextDelta("partial ".into()),
            ProviderEvent::TextDelta("answer ".into()),
            ProviderEvent::TextDelta("never finished".into()),
            ProviderEvent::Finish(FinishReason::Stop),
        ]])
        .with_delay(Duration::from_millis(80)),
    );
    let h = make_agent_with_provider(
        provider,
        BudgetConfig::default(),
        vec![],
        Duration::from_secs(5),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();
    let mut rx = h.bus.subscribe(&session.id, None);

    let cancel = CancellationToken::new();
    let agent = h.agent.clone();
    let sid = session.id.clone();
    let token = cancel.clone();
    let turn = tokio::spawn(async move { agent.run_turn(&sid, "go", token).await });

    // Let at least one delta through, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let report = turn.await.unwrap().unwrap();
    assert_eq!(report.reason, "cancelled");
    assert!(report.assistant_text.starts_with("partial"));

    let messages = h.store.load_session(&session.id, None, None).unwrap();
    assert_eq!(messages.last().unwrap().role, Role::Assistant);
    assert!(messages.last().unwrap().body.starts_with("partial"));

    let topics = drain_topics(&mut rx);
    assert_eq!(topics.last().unwrap(), "message.done");
}

#[tokio::test]
async fn iteration_cap_synthesises_terminal_message() {
    let scripts: Vec<Vec<ProviderEvent>> = (0..3)
        .map(|i| {
            tool_turn(
                &format!("tc-{i}"),
                "fs.list",
                json!({}),
            )
        })
        .collect();
    let h = make_agent(
        scripts,
        BudgetConfig::default(),
        vec![allow_rule("fs.*")],
        Duration::from_secs(5),
        AgentConfig {
            max_tool_iterations: 3,
            ..AgentConfig::default()
        },
    );
    let session = h.store.create_session("test", "t").unwrap();

    let report = h
        .agent
        .run_turn(&session.id, "loop forever", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reason, "iteration_limit");

    let messages = h.store.load_session(&session.id, None, None).unwrap();
    assert!(messages.last().unwrap().body.contains("iteration limit"));
}

#[tokio::test]
async fn unknown_tool_becomes_model_visible_error() {
    let h = make_agent(
        vec![
            tool_turn("tc-1", "ghost.summon", json!({})),
            text_turn("That tool does not exist"),
        ],
        BudgetConfig::default(),
        vec![],
        Duration::from_secs(5),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();

    let report = h
        .agent
        .run_turn(&session.id, "summon", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reason, "stop");

    let messages = h.store.load_session(&session.id, None, None).unwrap();
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.body.contains("not found"));
}

#[tokio::test]
async fn message_sequence_is_prefix_extension_across_turns() {
    let h = make_agent(
        vec![text_turn("one"), text_turn("two")],
        BudgetConfig::default(),
        vec![],
        Duration::from_secs(5),
        AgentConfig::default(),
    );
    let session = h.store.create_session("test", "t").unwrap();

    h.agent
        .run_turn(&session.id, "first", CancellationToken::new())
        .await
        .unwrap();
    let snapshot = h.store.load_session(&session.id, None, None).unwrap();

    h.agent
        .run_turn(&session.id, "second", CancellationToken::new())
        .await
        .unwrap();
    let later = h.store.load_session(&session.id, None, None).unwrap();

    assert!(later.len() > snapshot.len());
    for (a, b) in snapshot.iter().zip(later.iter()) {
        assert_eq!(a.seq, b.seq);
        assert_eq!(a.body, b.body);
    }
}

#[test]
fn tool_envelope_roundtrip() {
    let (content, is_error) =
        parse_tool_envelope(&json!({"content": "out", "is_error": true}).to_string());
    assert_eq!(content, "out");
    assert!(is_error);

    let (content, is_error) = parse_tool_envelope("bare text");
    assert_eq!(content, "bare text");
    assert!(!is_error);
}

#[test]
fn assembly_drains_fragments_into_calls() {
    let mut assembly = ToolCallAssembly::default();
    assembly.start("a".into(), "fs.read".into());
    assembly.fragment("a", "{\"path\":");
    assembly.fragment("a", "\"x.txt\"}");
    let calls = assembly.drain();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "fs.read");
    assert_eq!(calls[0].arguments["path"], "x.txt");
}
