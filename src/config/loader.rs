use super::schema::Config;
use crate::errors::PryxError;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolve the data directory: `PRYX_HOME` wins, else `~/.pryx`.
pub fn data_dir() -> Result<PathBuf, PryxError> {
    if let Ok(home) = std::env::var("PRYX_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|h| h.join(".pryx"))
        .ok_or_else(|| PryxError::Config("cannot determine home directory".into()))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.yaml")
}

/// Load `config.yaml` from the data directory, creating the directory if
/// needed. A missing file yields defaults; a malformed file is a
/// configuration error (exit code 2 at the top level). Environment
/// overrides (`PRYX_LISTEN_ADDR`, `PRYX_DB_PATH`) are applied last.
pub fn load_config(data_dir: &Path) -> Result<Config, PryxError> {
    std::fs::create_dir_all(data_dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            PryxError::Fatal(format!(
                "data directory {} is not writable: {}",
                data_dir.display(),
                e
            ))
        } else {
            PryxError::Config(format!(
                "cannot create data directory {}: {}",
                data_dir.display(),
                e
            ))
        }
    })?;

    let path = config_path(data_dir);
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| PryxError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_yaml_ng::from_str(&raw)
            .map_err(|e| PryxError::Config(format!("malformed {}: {}", path.display(), e)))?
    } else {
        debug!("no config.yaml at {}, using defaults", path.display());
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(addr) = std::env::var("PRYX_LISTEN_ADDR")
        && !addr.is_empty()
    {
        config.listen.addr = addr;
    }
    if let Ok(db) = std::env::var("PRYX_DB_PATH")
        && !db.is_empty()
    {
        config.database = Some(PathBuf::from(db));
    }
}

/// Write the config back as YAML. Non-secret settings only; secrets never
/// live in files.
pub fn save_config(data_dir: &Path, config: &Config) -> anyhow::Result<()> {
    let path = config_path(data_dir);
    let yaml = serde_yaml_ng::to_string(config).context("serialize config")?;
    std::fs::write(&path, yaml).with_context(|| format!("write {}", path.display()))?;
    info!("saved config to {}", path.display());
    Ok(())
}

/// Resolve the database path: explicit config/env wins, else
/// `<data_dir>/pryx.db`.
pub fn database_path(data_dir: &Path, config: &Config) -> PathBuf {
    config
        .database
        .clone()
        .unwrap_or_else(|| data_dir.join("pryx.db"))
}
