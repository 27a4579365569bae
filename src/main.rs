mod config;
mod dart;
mod dashboard;
mod hub;
mod market;
mod monitor;
mod notifier;
mod quotes;
mod stocks;
mod store;
mod utils;
mod ws_client;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::{
    config::Settings, hub::Hub, monitor::Monitor, notifier::Mailer, quotes::NaverQuoteSource,
    store::SqliteStore, ws_client::Backoff,
};

#[derive(Debug, Parser)]
#[command(name = "investwatch", version, about = "DART disclosure and stock alert monitor")]
struct Cli {
    /// Override HTTP_HOST
    #[arg(long, global = true)]
    host: Option<String>,
    /// Override HTTP_PORT
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Override SQLITE_PATH
    #[arg(long, global = true)]
    sqlite: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the monitors and the dashboard (default)
    Serve,
    /// Follow a running server's event feed in the terminal
    Tail {
        #[arg(long, default_value = "ws://127.0.0.1:8000/ws")]
        url: String,
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let mut cli = Cli::parse();
    match cli.command.take() {
        Some(Command::Tail { url, max_attempts }) => {
            let backoff = Backoff {
                max_attempts,
                ..Backoff::default()
            };
            tokio::select! {
                res = ws_client::tail(&url, backoff, |n| println!("{n}")) => res,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
        Some(Command::Serve) | None => serve(cli).await,
    }
}

async fn serve(cli: Cli) -> Result<()> {
    let mut settings = Settings::load()?;
    if let Some(h) = cli.host {
        settings.http_host = h;
    }
    if let Some(p) = cli.port {
        settings.http_port = p;
    }
    if let Some(p) = cli.sqlite {
        settings.sqlite_path = p;
    }
    settings.validate()?;

    let store = SqliteStore::new(&settings.sqlite_path)?;
    store.init_db()?;

    log::info!(
        "app.start name={} sqlite={} dart={} email={} http={}:{}",
        settings.app_name,
        store.path(),
        settings.dart_enabled(),
        settings.email_enabled,
        settings.http_host,
        settings.http_port
    );

    let mailer = Arc::new(Mailer::from_settings(&settings)?);
    let quotes = Arc::new(NaverQuoteSource::new(&settings.quote_base_url, settings.http_timeout_secs)?);
    let hub = Hub::new(settings.ws_max_connections);
    let monitor = Monitor::new(settings, store, hub, mailer, quotes)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = monitor.spawn(shutdown_rx.clone());

    let server = tokio::spawn(dashboard::serve_dashboard(monitor.clone(), shutdown_rx));

    tokio::signal::ctrl_c().await.context("install ctrl-c handler")?;
    log::info!("app.shutdown");
    monitor.hub.system_status("shutdown", "server is shutting down");
    let _ = shutdown_tx.send(true);

    for t in tasks {
        let _ = t.await;
    }
    match server.await {
        Ok(res) => res?,
        Err(e) => log::error!("dashboard.join_failed err={}", e),
    }
    log::info!("app.stopped");
    Ok(())
}
