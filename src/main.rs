use clap::Parser;
use orra::cli::{Backends, Cli, Commands};
use orra::config::AppConfig;
use orra::domain::BrokerCredential;
use orra::error::Result;
use tracing::error;

mod main_modes;
mod main_runtime;

use main_runtime::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::load_from(&cli.config)?;
    init_logging(&cfg.logging);

    let result = run(cli, cfg).await;
    if let Err(e) = &result {
        if e.is_fatal_at_boot() {
            error!(error = %e, "Refusing to start");
        } else {
            error!(error = %e, "Exited with error");
        }
    }
    result
}

async fn run(cli: Cli, cfg: AppConfig) -> Result<()> {
    if let Some(process) = cli.command.process_kind() {
        cfg.validate_for(process)?;
    }
    let backends = Backends::from_cli(&cli, &cfg).await?;

    match cli.command {
        Commands::AuthAgent { once } => main_modes::run_auth_agent(cfg, backends, once).await,
        Commands::TickerAgent => main_modes::run_ticker_agent(cfg, backends).await,
        Commands::NotificationAgent => main_modes::run_notification_agent(cfg, backends).await,
        Commands::Api => main_modes::run_api(cfg, backends).await,
        Commands::Reconcile => main_modes::run_reconcile(backends).await,
        Commands::StoreCredential {
            tenant_id,
            broker,
            api_key,
            api_secret,
            totp_secret,
        } => {
            let credential = BrokerCredential::new(api_key, api_secret, totp_secret);
            main_modes::run_store_credential(cfg, backends, tenant_id, broker, credential).await
        }
    }
}
