use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Generates a `Debug` impl that redacts secret fields.
///
/// Field specifiers:
/// - `field_name`         — printed normally via `&self.field_name`
/// - `redact(field_name)` — `String` field: shows `[empty]` or `[REDACTED]`
macro_rules! redact_debug {
    (@field $builder:ident, $self:ident, redact($field:ident)) => {
        $builder.field(
            stringify!($field),
            &if $self.$field.is_empty() {
                "[empty]"
            } else {
                "[REDACTED]"
            },
        );
    };
    (@field $builder:ident, $self:ident, $field:ident) => {
        $builder.field(stringify!($field), &$self.$field);
    };

    (@fields $builder:ident, $self:ident,) => {};
    (@fields $builder:ident, $self:ident, redact($field:ident), $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, redact($field));
        redact_debug!(@fields $builder, $self, $($rest)*);
    };
    (@fields $builder:ident, $self:ident, $field:ident, $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, $field);
        redact_debug!(@fields $builder, $self, $($rest)*);
    };

    ($struct_name:ident, $($fields:tt)*) => {
        impl std::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut builder = f.debug_struct(stringify!($struct_name));
                redact_debug!(@fields builder, self, $($fields)*);
                builder.finish()
            }
        }
    };
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Listen
// ---------------------------------------------------------------------------

fn default_listen_addr() -> String {
    "127.0.0.1:4664".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind address. Port 0 asks the OS for an ephemeral port; the bound
    /// port is written to `runtime.port` in the data directory either way.
    #[serde(default = "default_listen_addr")]
    pub addr: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// Explicit key override. Highest priority in the resolution chain;
    /// normally left empty so keys come from the vault or environment.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Whether this provider supports OAuth token resolution.
    #[serde(default)]
    pub oauth: bool,
}

redact_debug!(ProviderConfig, redact(api_key), base_url, oauth,);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            anthropic: ProviderConfig::default(),
            openai: ProviderConfig {
                api_key: String::new(),
                base_url: None,
                oauth: false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

fn default_warn_thresholds() -> Vec<f64> {
    vec![0.7, 0.9]
}

/// Dollar ceilings. `None` means unlimited for that period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub per_session: Option<f64>,
    #[serde(default)]
    pub per_day: Option<f64>,
    #[serde(default)]
    pub per_month: Option<f64>,
    /// Absolute lifetime cap across all sessions.
    #[serde(default)]
    pub absolute: Option<f64>,
    /// Fractions of a ceiling at which advisory warnings are emitted.
    #[serde(default = "default_warn_thresholds")]
    pub warn_thresholds: Vec<f64>,
    /// Per-model price overrides (pattern prefix → per-million-token prices).
    #[serde(default)]
    pub model_costs: HashMap<String, ModelCost>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_session: None,
            per_day: None,
            per_month: None,
            absolute: None,
            warn_thresholds: default_warn_thresholds(),
            model_costs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

fn default_approval_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds before a pending approval expires as denied.
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

fn default_max_tool_iterations() -> usize {
    10
}

fn default_provider_inactivity_secs() -> u64 {
    120
}

fn default_turn_ceiling_secs() -> u64 {
    900
}

fn default_max_tokens() -> u32 {
    8192
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Cap on tool rounds per turn; exceeding it synthesises an
    /// iteration-limit assistant message.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Abort the turn if the provider stream produces no event for this long.
    #[serde(default = "default_provider_inactivity_secs")]
    pub provider_inactivity_secs: u64,
    /// Hard ceiling on a whole turn regardless of inner deadlines.
    #[serde(default = "default_turn_ceiling_secs")]
    pub turn_ceiling_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Base system instructions prepended to every turn.
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            provider_inactivity_secs: default_provider_inactivity_secs(),
            turn_ceiling_secs: default_turn_ceiling_secs(),
            max_tokens: default_max_tokens(),
            system_prompt: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

fn default_tool_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default per-call deadline in seconds. Tools may declare a longer one
    /// up to the hard cap enforced by the registry.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Validate arguments against each tool's declared schema. Individual
    /// tools can opt out via their own flag.
    #[serde(default = "default_true")]
    pub validate_args: bool,
    /// Restrict filesystem tools to the workspace directory.
    #[serde(default = "default_true")]
    pub restrict_to_workspace: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            validate_args: true,
            restrict_to_workspace: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillsConfig {
    /// Skill name → enabled. Skills absent from the map default to enabled.
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
}

// ---------------------------------------------------------------------------
// MCP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
    Sse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub transport: McpTransport,
    /// Command + args for stdio transport.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint URL for http/sse transports.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Security rating: "trusted" tools run under normal policy, anything
    /// else forces a `review` verdict regardless of matching rules.
    #[serde(default = "default_trust")]
    pub trust: String,
}

fn default_trust() -> String {
    "untrusted".to_string()
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    pub id: String,
    /// Glob over the fully qualified tool name, e.g. `fs.*` or `shell.exec`.
    #[serde(default)]
    pub tool: Option<String>,
    /// Action class tag: file-ops, shell, network, credential, channel-send.
    #[serde(default)]
    pub action_class: Option<String>,
    /// Argument key → regex the value must match.
    #[serde(default)]
    pub args: HashMap<String, String>,
    /// allow | deny | review
    pub verdict: String,
    /// Refuse even an `allow` verdict when the estimated cost exceeds this.
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default = "default_true")]
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    /// Database file location. Empty means `<data_dir>/pryx.db`.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub mcp: HashMap<String, McpServerConfig>,
    #[serde(default)]
    pub policy: Vec<PolicyRuleConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config: Config = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(config.listen.addr, "127.0.0.1:4664");
        assert_eq!(config.providers.default_provider, "anthropic");
        assert_eq!(config.approval.timeout_secs, 300);
        assert_eq!(config.agent.max_tool_iterations, 10);
        assert_eq!(config.tools.timeout_secs, 30);
        assert!(config.tools.validate_args);
    }

    #[test]
    fn provider_key_redacted_in_debug() {
        let provider = ProviderConfig {
            api_key: "sk-secret".into(),
            base_url: None,
            oauth: false,
        };
        let debug = format!("{:?}", provider);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn policy_rules_parse() {
        let yaml = r#"
policy:
  - id: allow-reads
    tool: "fs.read"
    verdict: allow
  - id: review-shell
    tool: "shell.*"
    verdict: review
    args:
      command: "rm .*"
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.policy.len(), 2);
        assert_eq!(config.policy[0].verdict, "allow");
        assert!(config.policy[1].args.contains_key("command"));
    }

    #[test]
    fn mcp_transport_parses_lowercase() {
        let yaml = r#"
mcp:
  files:
    transport: stdio
    command: "mcp-files"
  search:
    transport: sse
    endpoint: "https://mcp.example.com/sse"
    trust: trusted
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.mcp["files"].transport, McpTransport::Stdio);
        assert_eq!(config.mcp["search"].transport, McpTransport::Sse);
        assert_eq!(config.mcp["search"].trust, "trusted");
        assert!(config.mcp["files"].enabled);
    }
}
