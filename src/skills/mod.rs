//! Skill bundle discovery and loading.
//!
//! A skill is a directory under `<data_dir>/skills/` containing a
//! `SKILL.md` file: YAML frontmatter (metadata, requirements, declared
//! tools) followed by a markdown body used as a system-prompt fragment.
//! Skills are loaded at startup and on explicit reload; turns never mutate
//! them.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SkillRequirements {
    /// Binaries that must be on PATH for the skill to be eligible.
    #[serde(default)]
    pub bins: Vec<String>,
    /// Environment variables that must be set and non-empty.
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema for the tool's arguments.
    #[serde(default)]
    pub parameters: Value,
    /// Command line executed for an invocation; arguments arrive as a JSON
    /// object on stdin, the result is read from stdout.
    pub command: Vec<String>,
    /// file-ops | shell | network | credential | channel-send
    #[serde(default = "default_action_class")]
    pub action_class: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Opt out of strict argument validation at the registry boundary.
    #[serde(default)]
    pub skip_validation: bool,
}

fn default_action_class() -> String {
    "shell".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillFrontmatter {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires: SkillRequirements,
    #[serde(default)]
    pub tools: Vec<SkillToolSpec>,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub meta: SkillFrontmatter,
    /// Markdown body appended to the system prompt when the skill is active.
    pub prompt_fragment: String,
    pub dir: PathBuf,
    pub enabled: bool,
    pub eligible: bool,
}

impl Skill {
    pub fn active(&self) -> bool {
        self.enabled && self.eligible
    }
}

pub struct SkillsLoader {
    skills_dir: PathBuf,
    /// Name → enabled override; skills absent from the map are enabled.
    enabled: RwLock<HashMap<String, bool>>,
    skills: RwLock<Vec<Skill>>,
}

impl SkillsLoader {
    pub fn new(data_dir: &Path, enabled: HashMap<String, bool>) -> Self {
        let loader = Self {
            skills_dir: data_dir.join("skills"),
            enabled: RwLock::new(enabled),
            skills: RwLock::new(Vec::new()),
        };
        loader.reload();
        loader
    }

    /// Rescan the skills directory. Idempotent; runtime enable/disable
    /// overrides survive the rescan.
    pub fn reload(&self) {
        let mut found = Vec::new();
        if self.skills_dir.is_dir() {
            let entries = match std::fs::read_dir(&self.skills_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("cannot read skills dir {}: {}", self.skills_dir.display(), e);
                    return;
                }
            };
            for entry in entries.flatten() {
                let dir = entry.path();
                let skill_file = dir.join("SKILL.md");
                if !dir.is_dir() || !skill_file.is_file() {
                    continue;
                }
                match std::fs::read_to_string(&skill_file) {
                    Ok(raw) => match parse_skill(&raw, &dir) {
                        Ok(mut skill) => {
                            let enabled_map =
                                self.enabled.read().unwrap_or_else(|e| e.into_inner());
                            skill.enabled =
                                *enabled_map.get(&skill.meta.name).unwrap_or(&true);
                            debug!(
                                "loaded skill '{}' (enabled={}, eligible={})",
                                skill.meta.name, skill.enabled, skill.eligible
                            );
                            found.push(skill);
                        }
                        Err(e) => warn!("skipping skill at {}: {}", dir.display(), e),
                    },
                    Err(e) => warn!("cannot read {}: {}", skill_file.display(), e),
                }
            }
        }
        found.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
        let mut skills = self.skills.write().unwrap_or_else(|e| e.into_inner());
        *skills = found;
    }

    pub fn list(&self) -> Vec<Skill> {
        self.skills
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Enable or disable a skill by name. Returns false for unknown names.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        {
            let mut map = self.enabled.write().unwrap_or_else(|e| e.into_inner());
            map.insert(name.to_string(), enabled);
        }
        let mut skills = self.skills.write().unwrap_or_else(|e| e.into_inner());
        let mut known = false;
        for skill in skills.iter_mut() {
            if skill.meta.name == name {
                skill.enabled = enabled;
                known = true;
            }
        }
        known
    }

    /// Concatenated prompt fragments of every active skill, in name order.
    pub fn prompt_fragments(&self) -> String {
        let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
        let mut parts = Vec::new();
        for skill in skills.iter().filter(|s| s.active()) {
            if !skill.prompt_fragment.trim().is_empty() {
                parts.push(format!(
                    "### Skill: {}\n\n{}",
                    skill.meta.name,
                    skill.prompt_fragment.trim()
                ));
            }
        }
        parts.join("\n\n")
    }

    /// Declared tools of active skills, with the skill directory attached
    /// so relative commands resolve against the bundle.
    pub fn declared_tools(&self) -> Vec<(String, PathBuf, SkillToolSpec)> {
        let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
        skills
            .iter()
            .filter(|s| s.active())
            .flat_map(|s| {
                s.meta
                    .tools
                    .iter()
                    .map(|t| (s.meta.name.clone(), s.dir.clone(), t.clone()))
            })
            .collect()
    }
}

fn parse_skill(raw: &str, dir: &Path) -> anyhow::Result<Skill> {
    let (frontmatter, body) = split_frontmatter(raw)
        .ok_or_else(|| anyhow::anyhow!("missing YAML frontmatter"))?;
    let meta: SkillFrontmatter = serde_yaml_ng::from_str(frontmatter)?;
    if meta.name.is_empty() {
        anyhow::bail!("skill name must not be empty");
    }
    let eligible = check_requirements(&meta.requires);
    Ok(Skill {
        meta,
        prompt_fragment: body.to_string(),
        dir: dir.to_path_buf(),
        enabled: true,
        eligible,
    })
}

/// Split `---\n<yaml>\n---\n<body>` into frontmatter and body.
fn split_frontmatter(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');
    Some((frontmatter, body))
}

fn check_requirements(requires: &SkillRequirements) -> bool {
    for bin in &requires.bins {
        if which::which(bin).is_err() {
            debug!("skill requirement missing: binary '{}'", bin);
            return false;
        }
    }
    for var in &requires.env {
        if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
            debug!("skill requirement missing: env '{}'", var);
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(dir: &Path, name: &str, content: &str) {
        let skill_dir = dir.join("skills").join(name);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), content).unwrap();
    }

    const WEATHER: &str = r#"---
name: weather
version: 0.2.0
author: someone
description: Forecasts via an external script
tools:
  - name: forecast
    description: Get a forecast
    parameters:
      type: object
      properties:
        city:
          type: string
      required: [city]
    command: ["./forecast.sh"]
    action_class: network
---
Use the forecast tool for weather questions.
"#;

    #[test]
    fn loads_skill_with_tools_and_fragment() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER);
        let loader = SkillsLoader::new(dir.path(), HashMap::new());

        let skills = loader.list();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].meta.name, "weather");
        assert_eq!(skills[0].meta.version, "0.2.0");
        assert!(skills[0].active());

        let tools = loader.declared_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].2.name, "forecast");
        assert_eq!(tools[0].2.action_class, "network");

        assert!(loader.prompt_fragments().contains("### Skill: weather"));
    }

    #[test]
    fn disabled_skill_contributes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER);
        let loader = SkillsLoader::new(dir.path(), HashMap::new());
        assert!(loader.set_enabled("weather", false));
        assert!(loader.prompt_fragments().is_empty());
        assert!(loader.declared_tools().is_empty());
    }

    #[test]
    fn enable_override_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER);
        let loader = SkillsLoader::new(dir.path(), HashMap::new());
        loader.set_enabled("weather", false);
        loader.reload();
        assert!(!loader.list()[0].enabled);
    }

    #[test]
    fn missing_binary_marks_ineligible() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"---
name: exotic
requires:
  bins: [definitely-not-a-real-binary-xyz]
---
Body.
"#;
        write_skill(dir.path(), "exotic", content);
        let loader = SkillsLoader::new(dir.path(), HashMap::new());
        let skills = loader.list();
        assert_eq!(skills.len(), 1);
        assert!(!skills[0].eligible);
        assert!(!skills[0].active());
    }

    #[test]
    fn malformed_frontmatter_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "broken", "no frontmatter here");
        write_skill(dir.path(), "weather", WEATHER);
        let loader = SkillsLoader::new(dir.path(), HashMap::new());
        assert_eq!(loader.list().len(), 1);
    }

    #[test]
    fn set_enabled_unknown_skill_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SkillsLoader::new(dir.path(), HashMap::new());
        assert!(!loader.set_enabled("ghost", true));
    }

    #[test]
    fn frontmatter_split() {
        let (fm, body) = split_frontmatter("---\nname: x\n---\nbody text").unwrap();
        assert_eq!(fm.trim(), "name: x");
        assert_eq!(body, "body text");
    }
}
