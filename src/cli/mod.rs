//! Thin command surface: `pryx serve` runs the agent runtime; `pryx audit
//! verify` walks the audit chain. Exit codes: 0 normal, 1 unexpected
//! error, 2 invalid configuration, 3 port binding failure, 4 data-directory
//! permission failure.

use crate::agent::AgentLoop;
use crate::approval::ApprovalBroker;
use crate::bus::EventBus;
use crate::config;
use crate::cost::CostTracker;
use crate::errors::PryxError;
use crate::gateway::{self, GatewayState};
use crate::keychain::Keychain;
use crate::policy::PolicyEngine;
use crate::providers::{CredentialResolver, build_provider};
use crate::skills::SkillsLoader;
use crate::store::Store;
use crate::tools::ToolRegistry;
use crate::tools::mcp::McpManager;
use crate::vault::{AuditLog, ChainStatus, Vault, verify_chain};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_BIND: i32 = 3;
pub const EXIT_DATA_DIR: i32 = 4;

#[derive(Parser)]
#[command(name = "pryx", version, about = "Local-first sovereign AI agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent runtime (default).
    Serve,
    /// Audit log operations.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Walk the audit hash chain and report the first broken entry.
    Verify,
}

pub async fn run() -> i32 {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Audit {
            command: AuditCommand::Verify,
        } => audit_verify(),
    }
}

fn config_exit_code(e: &PryxError) -> i32 {
    match e {
        PryxError::Config(_) => EXIT_CONFIG,
        PryxError::Fatal(_) => EXIT_DATA_DIR,
        _ => EXIT_ERROR,
    }
}

fn audit_verify() -> i32 {
    let data_dir = match config::data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("{e}");
            return config_exit_code(&e);
        }
    };
    let cfg = match config::load_config(&data_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return config_exit_code(&e);
        }
    };
    let db_path = config::loader::database_path(&data_dir, &cfg);
    let store = match Store::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open store: {e}");
            return EXIT_ERROR;
        }
    };
    match verify_chain(&store) {
        Ok(ChainStatus::Ok { entries }) => {
            println!("audit chain OK ({entries} entries)");
            EXIT_OK
        }
        Ok(ChainStatus::Broken {
            first_bad_seq,
            detail,
        }) => {
            println!("audit chain BROKEN at seq {first_bad_seq}: {detail}");
            EXIT_ERROR
        }
        Err(e) => {
            error!("verification failed: {e}");
            EXIT_ERROR
        }
    }
}

async fn serve() -> i32 {
    let data_dir = match config::data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("{e}");
            return config_exit_code(&e);
        }
    };
    let cfg = match config::load_config(&data_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return config_exit_code(&e);
        }
    };

    let db_path = config::loader::database_path(&data_dir, &cfg);
    let store = match Store::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("store unavailable at {}: {e}", db_path.display());
            return EXIT_ERROR;
        }
    };

    let audit = match AuditLog::start(store.clone()) {
        Ok(audit) => audit,
        Err(e) => {
            error!("cannot start audit writer: {e}");
            return EXIT_ERROR;
        }
    };

    #[cfg(feature = "keyring-store")]
    let keychain: Arc<dyn Keychain> = Arc::new(crate::keychain::OsKeychain);
    #[cfg(not(feature = "keyring-store"))]
    let keychain: Arc<dyn Keychain> = Arc::new(crate::keychain::MemoryKeychain::new());

    let vault = Arc::new(Vault::new(keychain, audit.clone()));
    let bus = Arc::new(EventBus::new());

    let policy = match PolicyEngine::from_config(&cfg.policy) {
        Ok(policy) => Arc::new(policy),
        Err(e) => {
            error!("{e}");
            return EXIT_CONFIG;
        }
    };
    let approvals = Arc::new(ApprovalBroker::new(
        store.clone(),
        bus.clone(),
        audit.clone(),
        Duration::from_secs(cfg.approval.timeout_secs),
    ));
    let cost = Arc::new(CostTracker::new(
        store.clone(),
        bus.clone(),
        cfg.budget.clone(),
    ));

    let skills = Arc::new(SkillsLoader::new(&data_dir, cfg.skills.enabled.clone()));
    let mcp = Arc::new(McpManager::from_config(&cfg.mcp));
    mcp.refresh_all().await;
    let registry = Arc::new(ToolRegistry::new(
        data_dir.clone(),
        cfg.tools.clone(),
        skills,
        mcp.clone(),
    ));

    let resolver = Arc::new(CredentialResolver::new(vault.clone()));
    let provider = match build_provider(&cfg.providers, resolver) {
        Ok(provider) => provider,
        Err(e) => {
            error!("{e}");
            return EXIT_CONFIG;
        }
    };

    let agent = Arc::new(AgentLoop::new(
        store,
        bus,
        policy,
        approvals,
        cost.clone(),
        registry,
        provider,
        audit,
        cfg.agent.clone(),
        cfg.providers.clone(),
    ));

    let state = GatewayState {
        agent,
        vault,
        cost,
        started_at: Instant::now(),
    };
    let (server, bound) = match gateway::start(&cfg.listen.addr, data_dir.clone(), state).await {
        Ok(started) => started,
        Err(e) => {
            error!("{e}");
            return EXIT_BIND;
        }
    };
    info!("pryx {} serving on {bound} (data dir {})", crate::VERSION, data_dir.display());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
        () = async { let _ = server.await; } => {
            error!("gateway stopped unexpectedly");
        }
    }

    mcp.shutdown().await;
    let _ = std::fs::remove_file(data_dir.join("runtime.port"));
    EXIT_OK
}
