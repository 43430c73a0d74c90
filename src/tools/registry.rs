//! The tool registry: aggregates built-in tools, skill-declared tools, and
//! MCP-exposed tools under fully qualified names, validates arguments
//! against declared schemas, and enforces invocation deadlines with panic
//! isolation.

use super::mcp::{McpManager, proxy::McpProxyTool};
use super::skill_tool::SkillTool;
use super::{MAX_RESULT_CHARS, Tool, ToolResult, builtin, truncate_result};
use crate::config::ToolsConfig;
use crate::policy::ActionClass;
use crate::skills::SkillsLoader;
use jsonschema::Validator;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Hard ceiling on any tool invocation, regardless of declared timeouts.
pub const TIMEOUT_HARD_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool disabled: {0}")]
    ToolDisabled(String),

    #[error("invalid arguments for {tool}: {detail}")]
    InvalidArguments { tool: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "name")]
pub enum ToolSource {
    Builtin,
    Skill(String),
    Mcp(String),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub action_class: ActionClass,
    pub source: ToolSource,
}

struct Entry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
    disabled: bool,
    /// Untrusted tools force a `review` verdict regardless of policy rules.
    untrusted: bool,
    validator: Option<Arc<Validator>>,
}

/// A resolved, invocable tool.
#[derive(Clone)]
pub struct ToolHandle {
    pub name: String,
    pub action_class: ActionClass,
    pub untrusted: bool,
    tool: Arc<dyn Tool>,
    validator: Option<Arc<Validator>>,
    timeout: Duration,
    validate: bool,
}

pub struct ToolRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    skills: Arc<SkillsLoader>,
    mcp: Arc<McpManager>,
    workspace: PathBuf,
    config: ToolsConfig,
}

impl ToolRegistry {
    pub fn new(
        workspace: PathBuf,
        config: ToolsConfig,
        skills: Arc<SkillsLoader>,
        mcp: Arc<McpManager>,
    ) -> Self {
        let registry = Self {
            entries: RwLock::new(HashMap::new()),
            skills,
            mcp,
            workspace,
            config,
        };
        registry.rebuild();
        registry
    }

    /// Rebuild the registry from builtins + current skills + discovered MCP
    /// tools. Called at startup and after any reload/refresh.
    pub fn rebuild(&self) {
        let mut entries: HashMap<String, Entry> = HashMap::new();

        let restrict = self.config.restrict_to_workspace;
        let builtins: Vec<Arc<dyn Tool>> = vec![
            Arc::new(builtin::ReadFileTool::new(self.workspace.clone(), restrict)),
            Arc::new(builtin::WriteFileTool::new(self.workspace.clone(), restrict)),
            Arc::new(builtin::ListDirTool::new(self.workspace.clone(), restrict)),
            Arc::new(builtin::ShellExecTool::new(
                self.workspace.clone(),
                Duration::from_secs(self.config.timeout_secs),
            )),
            Arc::new(builtin::HttpFetchTool::new()),
        ];
        for tool in builtins {
            Self::insert(&mut entries, tool, ToolSource::Builtin, false, false);
        }

        for skill in self.skills.list() {
            let disabled = !skill.active();
            for spec in &skill.meta.tools {
                let tool: Arc<dyn Tool> = Arc::new(SkillTool::new(
                    &skill.meta.name,
                    skill.dir.clone(),
                    spec.clone(),
                ));
                Self::insert(
                    &mut entries,
                    tool,
                    ToolSource::Skill(skill.meta.name.clone()),
                    disabled,
                    false,
                );
            }
        }

        for (server, trust, info) in self.mcp.discovered_tools() {
            let untrusted = trust != "trusted";
            let name = server.name.clone();
            let tool: Arc<dyn Tool> = Arc::new(McpProxyTool::new(server, info));
            Self::insert(&mut entries, tool, ToolSource::Mcp(name), false, untrusted);
        }

        debug!("tool registry rebuilt with {} entries", entries.len());
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        *guard = entries;
    }

    fn insert(
        entries: &mut HashMap<String, Entry>,
        tool: Arc<dyn Tool>,
        source: ToolSource,
        disabled: bool,
        untrusted: bool,
    ) {
        let name = tool.name().to_string();
        if entries.contains_key(&name) {
            warn!("tool registry: overwriting duplicate tool '{}'", name);
        }
        let schema = tool.parameters();
        let validator = match jsonschema::validator_for(&schema) {
            Ok(validator) => Some(Arc::new(validator)),
            Err(e) => {
                warn!("tool '{}' declares an invalid schema: {}", name, e);
                None
            }
        };
        entries.insert(
            name,
            Entry {
                tool,
                source,
                disabled,
                untrusted,
                validator,
            },
        );
    }

    /// Enabled tools visible to the model, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ToolDescriptor> = entries
            .values()
            .filter(|e| !e.disabled)
            .map(|e| ToolDescriptor {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                parameters: e.tool.parameters(),
                action_class: e.tool.action_class(),
                source: e.source.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn resolve(&self, name: &str) -> Result<ToolHandle, RegistryError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::ToolNotFound(name.to_string()))?;
        if entry.disabled {
            return Err(RegistryError::ToolDisabled(name.to_string()));
        }
        let declared = entry
            .tool
            .declared_timeout()
            .unwrap_or(Duration::from_secs(self.config.timeout_secs));
        Ok(ToolHandle {
            name: name.to_string(),
            action_class: entry.tool.action_class(),
            untrusted: entry.untrusted,
            tool: entry.tool.clone(),
            validator: entry.validator.clone(),
            timeout: declared.min(TIMEOUT_HARD_CAP),
            validate: self.config.validate_args && !entry.tool.skip_validation(),
        })
    }

    /// Invoke a resolved tool: validate arguments, execute in a spawned
    /// task under a deadline, isolate panics, truncate the result.
    pub async fn invoke(
        &self,
        handle: &ToolHandle,
        args: Value,
        deadline: Option<Duration>,
    ) -> Result<ToolResult, RegistryError> {
        if handle.validate
            && let Some(ref validator) = handle.validator
            && let Err(err) = validator.validate(&args)
        {
            return Err(RegistryError::InvalidArguments {
                tool: handle.name.clone(),
                detail: err.to_string(),
            });
        }

        let timeout = deadline.unwrap_or(handle.timeout).min(TIMEOUT_HARD_CAP);
        let tool = handle.tool.clone();
        let tool_name = handle.name.clone();
        let timeout_secs = timeout.as_secs();

        let join = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(args)).await
        });

        let mut result = match join.await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => ToolResult::error(format!("{tool_name}: {e}")),
            Ok(Err(_)) => {
                warn!("tool '{}' timed out after {}s", tool_name, timeout_secs);
                ToolResult::error(format!(
                    "tool '{tool_name}' timed out after {timeout_secs}s"
                ))
            }
            Err(join_err) if join_err.is_panic() => {
                error!("tool '{}' panicked: {:?}", tool_name, join_err);
                ToolResult::error(format!("tool '{tool_name}' crashed unexpectedly"))
            }
            Err(_) => ToolResult::error(format!("tool '{tool_name}' was cancelled")),
        };
        result.content = truncate_result(&result.content, MAX_RESULT_CHARS);
        Ok(result)
    }

    /// Rescan skill bundles and rebuild. Idempotent.
    pub fn reload_skills(&self) {
        self.skills.reload();
        self.rebuild();
    }

    /// Reconnect/refresh one MCP server and rebuild. Idempotent.
    pub async fn refresh_mcp(&self, name: &str) -> anyhow::Result<usize> {
        let server = self
            .mcp
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown MCP server: {name}"))?;
        let count = server.refresh().await?;
        self.rebuild();
        Ok(count)
    }

    pub fn skills(&self) -> &Arc<SkillsLoader> {
        &self.skills
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.mcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    fn make_registry(dir: &std::path::Path) -> ToolRegistry {
        let skills = Arc::new(SkillsLoader::new(dir, HashMap::new()));
        let mcp = Arc::new(McpManager::from_config(&HashMap::new()));
        ToolRegistry::new(dir.to_path_buf(), ToolsConfig::default(), skills, mcp)
    }

    #[test]
    fn builtins_registered_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path());
        let names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&"fs.read".to_string()));
        assert!(names.contains(&"shell.exec".to_string()));
        assert!(names.contains(&"http.fetch".to_string()));
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn unknown_tool_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path());
        assert!(matches!(
            registry.resolve("ghost.tool"),
            Err(RegistryError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invoke_validates_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path());
        let handle = registry.resolve("fs.read").unwrap();
        // Missing required "path".
        let err = registry.invoke(&handle, json!({}), None).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn invoke_executes_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "contents").unwrap();
        let registry = make_registry(dir.path());
        let handle = registry.resolve("fs.read").unwrap();
        let result = registry
            .invoke(&handle, json!({"path": "hello.txt"}), None)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "contents");
    }

    #[tokio::test]
    async fn timeout_produces_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path());
        let handle = registry.resolve("shell.exec").unwrap();
        let result = registry
            .invoke(
                &handle,
                json!({"command": "sleep 5"}),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_tool_isolated() {
        struct PanicTool;
        #[async_trait]
        impl Tool for PanicTool {
            fn name(&self) -> &str {
                "test.panic"
            }
            fn description(&self) -> &str {
                "always panics"
            }
            fn parameters(&self) -> Value {
                json!({"type": "object"})
            }
            fn action_class(&self) -> ActionClass {
                ActionClass::Shell
            }
            async fn execute(&self, _params: Value) -> anyhow::Result<ToolResult> {
                panic!("boom");
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(dir.path());
        {
            let mut entries = registry.entries.write().unwrap();
            ToolRegistry::insert(
                &mut entries,
                Arc::new(PanicTool),
                ToolSource::Builtin,
                false,
                false,
            );
        }
        let handle = registry.resolve("test.panic").unwrap();
        let result = registry.invoke(&handle, json!({}), None).await.unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("crashed"));
    }

    #[test]
    fn disabled_skill_tools_resolve_as_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("skills/echoer");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            r#"---
name: echoer
tools:
  - name: say
    command: ["cat"]
---
"#,
        )
        .unwrap();
        let registry = make_registry(dir.path());
        assert!(registry.resolve("echoer.say").is_ok());

        registry.skills().set_enabled("echoer", false);
        registry.rebuild();
        assert!(matches!(
            registry.resolve("echoer.say"),
            Err(RegistryError::ToolDisabled(_))
        ));
        // Disabled tools are hidden from the model-facing list.
        assert!(!registry.list().iter().any(|d| d.name == "echoer.say"));
    }

    #[test]
    fn long_declared_timeout_clamped_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("skills/slow");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            r#"---
name: slow
tools:
  - name: crunch
    command: ["cat"]
    timeout_secs: 9000
---
"#,
        )
        .unwrap();
        let registry = make_registry(dir.path());
        let handle = registry.resolve("slow.crunch").unwrap();
        assert_eq!(handle.timeout, TIMEOUT_HARD_CAP);
    }
}
