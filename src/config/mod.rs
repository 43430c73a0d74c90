pub mod loader;
pub mod schema;

pub use loader::{config_path, data_dir, load_config, save_config};
pub use schema::{
    AgentConfig, ApprovalConfig, BudgetConfig, Config, ListenConfig, McpServerConfig,
    McpTransport, PolicyRuleConfig, ProviderConfig, ProvidersConfig, SkillsConfig, ToolsConfig,
};
