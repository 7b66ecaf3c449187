//! Minimal entrypoint: parse flags, load config, open the store, start the
//! scheduler and HTTP server, wire `Ctrl-C` to graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use msgvault_core::config::Config;
use msgvault_core::scheduler::Scheduler;
use msgvault_core::store::SqliteStore;
use msgvault_core::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "msgvaultd", about = "msgvault archive core daemon")]
struct Cli {
    #[arg(long, env = "MSGVAULT_BIND_HOST")]
    bind: Option<String>,

    #[arg(long, env = "MSGVAULT_BIND_PORT")]
    port: Option<u16>,

    #[arg(long, env = "MSGVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Unused beyond locating `data_dir`; config is always `config.toml`
    /// inside it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "MSGVAULT_LOG", default_value = "info")]
    log: String,
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();
}

/// Placeholder for the injected provider-specific sync implementation (spec
/// §1, §9) — the real callback is an explicit external boundary this crate
/// does not implement. Returns promptly on cancellation.
fn stub_sync_callback() -> msgvault_core::scheduler::SyncCallback {
    Arc::new(|token, email| {
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(10)) => Ok(()),
                _ = token.cancelled() => Ok(()),
            }
            .map(|()| info!(%email, "stub sync callback ran"))
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log);

    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| Config::default().data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let mut config = Config::load(&data_dir)?;
    if let Some(bind) = cli.bind {
        config.bind_host = bind;
    }
    if let Some(port) = cli.port {
        config.bind_port = port;
    }

    let db_path = config.data_dir.join("messages.db");
    let store: Arc<dyn msgvault_core::store::MessageStore> =
        Arc::new(SqliteStore::new(&db_path).await?);

    let scheduler = Scheduler::new(stub_sync_callback());
    let (scheduled, errors) = scheduler.add_accounts_from_config(&config.accounts);
    info!(scheduled, errors = errors.len(), "accounts registered from config");
    for (email, error) in &errors {
        error!(%email, %error, "failed to schedule account from config");
    }
    scheduler.start();

    let server = Server::bind(config, store, scheduler.clone()).await?;
    info!(addr = %server.local_addr(), "msgvaultd starting");

    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received");
        })
        .await?;

    scheduler.stop().await;
    Ok(())
}
