//! Policy evaluation for proposed tool invocations.
//!
//! The engine is pure: evaluation does no I/O and returns in deterministic
//! time. Rules are held in an `Arc` snapshot so in-flight evaluations see a
//! consistent ruleset while mutations swap the whole set atomically.

use crate::config::PolicyRuleConfig;
use crate::errors::PryxError;
use glob_match::glob_match;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Action class tag carried by the Tool Registry for every tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionClass {
    FileOps,
    Shell,
    Network,
    Credential,
    ChannelSend,
}

impl ActionClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionClass::FileOps => "file-ops",
            ActionClass::Shell => "shell",
            ActionClass::Network => "network",
            ActionClass::Credential => "credential",
            ActionClass::ChannelSend => "channel-send",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "file-ops" => Some(ActionClass::FileOps),
            "shell" => Some(ActionClass::Shell),
            "network" => Some(ActionClass::Network),
            "credential" => Some(ActionClass::Credential),
            "channel-send" => Some(ActionClass::ChannelSend),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
    Review,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::Review => "review",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub id: String,
    /// Glob over the fully qualified tool name (`fs.*`, `shell.exec`).
    pub tool: Option<String>,
    pub action_class: Option<ActionClass>,
    /// Argument key → compiled pattern the string value must match.
    pub args: Vec<(String, Regex)>,
    pub verdict: Verdict,
    /// Deny even an allow verdict when the estimated cost exceeds this.
    pub max_cost: Option<f64>,
    pub active: bool,
}

impl PolicyRule {
    pub fn from_config(cfg: &PolicyRuleConfig) -> Result<Self, PryxError> {
        let verdict = match cfg.verdict.as_str() {
            "allow" => Verdict::Allow,
            "deny" => Verdict::Deny,
            "review" => Verdict::Review,
            other => {
                return Err(PryxError::Config(format!(
                    "policy rule '{}': unknown verdict '{}'",
                    cfg.id, other
                )));
            }
        };
        let action_class = match cfg.action_class.as_deref() {
            None => None,
            Some(raw) => Some(ActionClass::parse(raw).ok_or_else(|| {
                PryxError::Config(format!(
                    "policy rule '{}': unknown action class '{}'",
                    cfg.id, raw
                ))
            })?),
        };
        let mut args = Vec::with_capacity(cfg.args.len());
        for (key, pattern) in &cfg.args {
            let re = Regex::new(pattern).map_err(|e| {
                PryxError::Config(format!(
                    "policy rule '{}': bad pattern for '{}': {}",
                    cfg.id, key, e
                ))
            })?;
            args.push((key.clone(), re));
        }
        Ok(Self {
            id: cfg.id.clone(),
            tool: cfg.tool.clone(),
            action_class,
            args,
            verdict,
            max_cost: cfg.max_cost,
            active: cfg.active,
        })
    }

    fn matches(&self, input: &PolicyInput<'_>) -> bool {
        if !self.active {
            return false;
        }
        if let Some(ref pattern) = self.tool
            && !glob_match(pattern, input.tool)
        {
            return false;
        }
        if let Some(class) = self.action_class
            && class != input.action_class
        {
            return false;
        }
        for (key, re) in &self.args {
            let Some(value) = input.arguments.get(key) else {
                return false;
            };
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !re.is_match(&rendered) {
                return false;
            }
        }
        true
    }
}

pub struct PolicyInput<'a> {
    pub session_id: &'a str,
    /// Agent identity, for per-agent rule overrides.
    pub agent: &'a str,
    pub tool: &'a str,
    pub action_class: ActionClass,
    pub arguments: &'a Value,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub rule_id: Option<String>,
    pub reason: String,
}

pub struct PolicyEngine {
    rules: RwLock<Arc<Vec<PolicyRule>>>,
    /// Per-session rule lists evaluated before everything else.
    session_overrides: RwLock<HashMap<String, Arc<Vec<PolicyRule>>>>,
    /// Per-agent rule lists evaluated between session and global rules.
    agent_overrides: RwLock<HashMap<String, Arc<Vec<PolicyRule>>>>,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            session_overrides: RwLock::new(HashMap::new()),
            agent_overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(configs: &[PolicyRuleConfig]) -> Result<Self, PryxError> {
        let rules = configs
            .iter()
            .map(PolicyRule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    /// Replace the global ruleset. In-flight evaluations keep the snapshot
    /// they already took.
    pub fn replace_rules(&self, rules: Vec<PolicyRule>) {
        let mut guard = self.rules.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(rules);
    }

    pub fn set_session_rules(&self, session_id: &str, rules: Vec<PolicyRule>) {
        let mut guard = self
            .session_overrides
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(session_id.to_string(), Arc::new(rules));
    }

    pub fn clear_session_rules(&self, session_id: &str) {
        let mut guard = self
            .session_overrides
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.remove(session_id);
    }

    pub fn set_agent_rules(&self, agent: &str, rules: Vec<PolicyRule>) {
        let mut guard = self
            .agent_overrides
            .write()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(agent.to_string(), Arc::new(rules));
    }

    /// First matching rule wins; session overrides come before agent
    /// overrides, which come before the global set; the fallback verdict
    /// is `review`.
    pub fn evaluate(&self, input: &PolicyInput<'_>) -> PolicyDecision {
        let session_rules = {
            let guard = self
                .session_overrides
                .read()
                .unwrap_or_else(|e| e.into_inner());
            guard.get(input.session_id).cloned()
        };
        let agent_rules = {
            let guard = self
                .agent_overrides
                .read()
                .unwrap_or_else(|e| e.into_inner());
            guard.get(input.agent).cloned()
        };
        let global_rules = {
            let guard = self.rules.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let chained = session_rules
            .iter()
            .flat_map(|r| r.iter())
            .chain(agent_rules.iter().flat_map(|r| r.iter()))
            .chain(global_rules.iter());
        for rule in chained {
            if !rule.matches(input) {
                continue;
            }
            if let Some(ceiling) = rule.max_cost
                && input.estimated_cost > ceiling
            {
                return PolicyDecision {
                    verdict: Verdict::Deny,
                    rule_id: Some(rule.id.clone()),
                    reason: format!(
                        "estimated cost ${:.4} exceeds rule ceiling ${:.4}",
                        input.estimated_cost, ceiling
                    ),
                };
            }
            return PolicyDecision {
                verdict: rule.verdict,
                rule_id: Some(rule.id.clone()),
                reason: format!("matched rule '{}'", rule.id),
            };
        }

        PolicyDecision {
            verdict: Verdict::Review,
            rule_id: None,
            reason: "no matching rule; default is review".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, tool: &str, verdict: Verdict) -> PolicyRule {
        PolicyRule {
            id: id.into(),
            tool: Some(tool.into()),
            action_class: None,
            args: vec![],
            verdict,
            max_cost: None,
            active: true,
        }
    }

    fn input<'a>(tool: &'a str, arguments: &'a Value) -> PolicyInput<'a> {
        PolicyInput {
            session_id: "s1",
            agent: "main",
            tool,
            action_class: ActionClass::FileOps,
            arguments,
            estimated_cost: 0.0,
        }
    }

    #[test]
    fn first_match_wins() {
        let engine = PolicyEngine::new(vec![
            rule("deny-all-fs", "fs.*", Verdict::Deny),
            rule("allow-read", "fs.read", Verdict::Allow),
        ]);
        let args = json!({});
        let decision = engine.evaluate(&input("fs.read", &args));
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.rule_id.as_deref(), Some("deny-all-fs"));
    }

    #[test]
    fn default_verdict_is_review() {
        let engine = PolicyEngine::new(vec![]);
        let args = json!({});
        let decision = engine.evaluate(&input("shell.exec", &args));
        assert_eq!(decision.verdict, Verdict::Review);
        assert!(decision.rule_id.is_none());
    }

    #[test]
    fn glob_matches_namespace() {
        let engine = PolicyEngine::new(vec![rule("allow-fs", "fs.*", Verdict::Allow)]);
        let args = json!({});
        assert_eq!(
            engine.evaluate(&input("fs.write", &args)).verdict,
            Verdict::Allow
        );
        assert_eq!(
            engine.evaluate(&input("shell.exec", &args)).verdict,
            Verdict::Review
        );
    }

    #[test]
    fn argument_patterns_gate_the_match() {
        let mut dangerous = rule("review-rm", "shell.exec", Verdict::Deny);
        dangerous.args = vec![("command".into(), Regex::new("^rm ").unwrap())];
        let engine = PolicyEngine::new(vec![
            dangerous,
            rule("allow-shell", "shell.exec", Verdict::Allow),
        ]);

        let rm = json!({"command": "rm -rf /tmp/x"});
        assert_eq!(engine.evaluate(&input("shell.exec", &rm)).verdict, Verdict::Deny);

        let ls = json!({"command": "ls /tmp"});
        assert_eq!(
            engine.evaluate(&input("shell.exec", &ls)).verdict,
            Verdict::Allow
        );
    }

    #[test]
    fn action_class_match() {
        let r = PolicyRule {
            id: "deny-credential".into(),
            tool: None,
            action_class: Some(ActionClass::Credential),
            args: vec![],
            verdict: Verdict::Deny,
            max_cost: None,
            active: true,
        };
        let engine = PolicyEngine::new(vec![r]);
        let args = json!({});
        let mut i = input("vault.read", &args);
        i.action_class = ActionClass::Credential;
        assert_eq!(engine.evaluate(&i).verdict, Verdict::Deny);

        let mut i = input("fs.read", &args);
        i.action_class = ActionClass::FileOps;
        assert_eq!(engine.evaluate(&i).verdict, Verdict::Review);
    }

    #[test]
    fn cost_ceiling_denies_even_on_allow() {
        let mut r = rule("allow-cheap", "fs.*", Verdict::Allow);
        r.max_cost = Some(0.01);
        let engine = PolicyEngine::new(vec![r]);
        let args = json!({});
        let mut i = input("fs.read", &args);
        i.estimated_cost = 0.5;
        let decision = engine.evaluate(&i);
        assert_eq!(decision.verdict, Verdict::Deny);
        assert!(decision.reason.contains("ceiling"));
    }

    #[test]
    fn inactive_rules_skipped() {
        let mut r = rule("disabled", "fs.*", Verdict::Deny);
        r.active = false;
        let engine = PolicyEngine::new(vec![r]);
        let args = json!({});
        assert_eq!(
            engine.evaluate(&input("fs.read", &args)).verdict,
            Verdict::Review
        );
    }

    #[test]
    fn session_overrides_come_first() {
        let engine = PolicyEngine::new(vec![rule("global-allow", "fs.*", Verdict::Allow)]);
        engine.set_session_rules("s1", vec![rule("session-deny", "fs.*", Verdict::Deny)]);

        let args = json!({});
        let decision = engine.evaluate(&input("fs.read", &args));
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.rule_id.as_deref(), Some("session-deny"));

        engine.clear_session_rules("s1");
        let decision = engine.evaluate(&input("fs.read", &args));
        assert_eq!(decision.verdict, Verdict::Allow);
    }

    #[test]
    fn agent_overrides_sit_between_session_and_global() {
        let engine = PolicyEngine::new(vec![rule("global-allow", "fs.*", Verdict::Allow)]);
        engine.set_agent_rules("main", vec![rule("agent-review", "fs.*", Verdict::Review)]);

        let args = json!({});
        let decision = engine.evaluate(&input("fs.read", &args));
        assert_eq!(decision.rule_id.as_deref(), Some("agent-review"));

        // A session override still beats the agent one.
        engine.set_session_rules("s1", vec![rule("session-deny", "fs.*", Verdict::Deny)]);
        let decision = engine.evaluate(&input("fs.read", &args));
        assert_eq!(decision.rule_id.as_deref(), Some("session-deny"));
    }

    #[test]
    fn config_parsing_rejects_bad_verdict() {
        let cfg = PolicyRuleConfig {
            id: "bad".into(),
            tool: None,
            action_class: None,
            args: HashMap::new(),
            verdict: "maybe".into(),
            max_cost: None,
            active: true,
        };
        assert!(PolicyRule::from_config(&cfg).is_err());
    }
}
