use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::adapters::{MemoryStore, PostgresStore};
use crate::agents::PreferenceSource;
use crate::config::{AppConfig, ProcessKind};
use crate::entitlement::TenantDirectory;
use crate::error::Result;
use crate::runtime::{MemoryRuntimeStore, PgRuntimeStore, RuntimeStore};
use crate::streams::{EventStreams, MemoryEventStreams, PgEventStreams};
use crate::vault::CredentialRepository;

#[derive(Parser)]
#[command(name = "orra")]
#[command(version = "0.1.0")]
#[command(about = "Multi-tenant trading agent orchestration", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,

    /// Use in-process stores instead of Postgres (single process development)
    #[arg(long, global = true)]
    pub in_memory: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Refresh broker session tokens for every tenant holding a credential
    AuthAgent {
        /// Run one refresh cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Ingest market data and fan it out to eligible tenants
    TickerAgent,
    /// Dispatch stream events to notification channels
    NotificationAgent,
    /// Serve the billing webhook and entitlement guards
    Api,
    /// Run one reconciliation sweep between the system of record and runtime store
    Reconcile,
    /// Encrypt and store a broker credential for a tenant
    StoreCredential {
        #[arg(long)]
        tenant_id: Uuid,
        /// Broker id; defaults to auth.broker_id
        #[arg(long)]
        broker: Option<String>,
        #[arg(long, env = "ORRA_BROKER_API_KEY")]
        api_key: String,
        #[arg(long, env = "ORRA_BROKER_API_SECRET", hide_env_values = true)]
        api_secret: String,
        #[arg(long, env = "ORRA_BROKER_TOTP_SECRET", hide_env_values = true)]
        totp_secret: String,
    },
}

impl Commands {
    /// Long-running process this command starts, if any
    pub fn process_kind(&self) -> Option<ProcessKind> {
        match self {
            Commands::AuthAgent { .. } => Some(ProcessKind::AuthAgent),
            Commands::TickerAgent => Some(ProcessKind::TickerAgent),
            Commands::NotificationAgent => Some(ProcessKind::NotificationAgent),
            Commands::Api => Some(ProcessKind::Api),
            Commands::Reconcile | Commands::StoreCredential { .. } => None,
        }
    }
}

/// Storage backends shared by every process kind
#[derive(Clone)]
pub struct Backends {
    pub directory: Arc<dyn TenantDirectory>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub preferences: Arc<dyn PreferenceSource>,
    pub runtime: Arc<dyn RuntimeStore>,
    pub streams: Arc<dyn EventStreams>,
}

impl Backends {
    /// In-process stores. Nothing is shared with other processes.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            directory: store.clone(),
            credentials: store.clone(),
            preferences: store,
            runtime: Arc::new(MemoryRuntimeStore::new()),
            streams: Arc::new(MemoryEventStreams::new()),
        }
    }

    /// Postgres-backed stores over one pool, with migrations applied
    pub async fn connect(cfg: &AppConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.database.max_connections)
            .connect(&cfg.database.url)
            .await?;
        let store = Arc::new(PostgresStore::from_pool(pool.clone()));
        store.migrate().await?;
        info!("Connected to PostgreSQL");

        Ok(Self {
            directory: store.clone(),
            credentials: store.clone(),
            preferences: store,
            runtime: Arc::new(PgRuntimeStore::new(pool.clone())),
            streams: Arc::new(PgEventStreams::new(pool)),
        })
    }

    pub async fn from_cli(cli: &Cli, cfg: &AppConfig) -> Result<Self> {
        if cli.in_memory {
            info!("Using in-memory stores");
            Ok(Self::in_memory())
        } else {
            Self::connect(cfg).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_store_credential() {
        let tenant = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "orra",
            "store-credential",
            "--tenant-id",
            &tenant.to_string(),
            "--api-key",
            "k",
            "--api-secret",
            "s",
            "--totp-secret",
            "JBSWY3DPEHPK3PXP",
            "--in-memory",
        ])
        .unwrap();
        assert!(cli.in_memory);
        assert_eq!(cli.config, "config");
        match cli.command {
            Commands::StoreCredential {
                tenant_id, broker, ..
            } => {
                assert_eq!(tenant_id, tenant);
                assert!(broker.is_none());
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_parse_agent_commands() {
        let cli = Cli::try_parse_from(["orra", "--config", "/etc/orra", "auth-agent", "--once"])
            .unwrap();
        assert_eq!(cli.config, "/etc/orra");
        assert!(matches!(cli.command, Commands::AuthAgent { once: true }));
        assert_eq!(cli.command.process_kind(), Some(ProcessKind::AuthAgent));
        assert!(Cli::try_parse_from(["orra", "ticker-agent"]).is_ok());
        assert!(Cli::try_parse_from(["orra", "unknown"]).is_err());
    }
}
