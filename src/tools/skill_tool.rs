//! Command-backed tools declared by skill bundles. Arguments are passed to
//! the declared command as a JSON object on stdin; stdout becomes the tool
//! result.

use super::{Tool, ToolResult};
use crate::policy::ActionClass;
use crate::skills::SkillToolSpec;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct SkillTool {
    qualified_name: String,
    spec: SkillToolSpec,
    skill_dir: PathBuf,
    action_class: ActionClass,
}

impl SkillTool {
    pub fn new(skill_name: &str, skill_dir: PathBuf, spec: SkillToolSpec) -> Self {
        let action_class =
            ActionClass::parse(&spec.action_class).unwrap_or(ActionClass::Shell);
        Self {
            qualified_name: format!("{skill_name}.{}", spec.name),
            spec,
            skill_dir,
            action_class,
        }
    }
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters(&self) -> Value {
        self.spec.parameters.clone()
    }

    fn action_class(&self) -> ActionClass {
        self.action_class
    }

    fn declared_timeout(&self) -> Option<Duration> {
        self.spec.timeout_secs.map(Duration::from_secs)
    }

    fn skip_validation(&self) -> bool {
        self.spec.skip_validation
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        let Some((program, args)) = self.spec.command.split_first() else {
            anyhow::bail!("skill tool '{}' declares no command", self.qualified_name);
        };
        debug!("skill tool {}: running {}", self.qualified_name, program);

        // Relative commands resolve against the skill bundle directory.
        let program_path = if program.starts_with("./") || program.starts_with("../") {
            self.skill_dir.join(program).to_string_lossy().into_owned()
        } else {
            program.clone()
        };

        let mut child = tokio::process::Command::new(&program_path)
            .args(args)
            .current_dir(&self.skill_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program_path}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(params.to_string().as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(ToolResult::new(stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(ToolResult::error(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(command: Vec<String>) -> SkillToolSpec {
        SkillToolSpec {
            name: "echo".into(),
            description: "echo stdin".into(),
            parameters: json!({"type": "object"}),
            command,
            action_class: "shell".into(),
            timeout_secs: Some(5),
            skip_validation: false,
        }
    }

    #[tokio::test]
    async fn passes_arguments_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SkillTool::new(
            "test",
            dir.path().to_path_buf(),
            spec(vec!["cat".into()]),
        );
        assert_eq!(tool.name(), "test.echo");
        let result = tool.execute(json!({"city": "Oslo"})).await.unwrap();
        assert!(result.content.contains("Oslo"));
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SkillTool::new(
            "test",
            dir.path().to_path_buf(),
            spec(vec!["sh".into(), "-c".into(), "echo oops >&2; exit 3".into()]),
        );
        let result = tool.execute(json!({})).await.unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("oops"));
    }

    #[tokio::test]
    async fn declared_timeout_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SkillTool::new("test", dir.path().to_path_buf(), spec(vec!["cat".into()]));
        assert_eq!(tool.declared_timeout(), Some(Duration::from_secs(5)));
    }
}
