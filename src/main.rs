//! Application entry point: CLI parsing, logging, and wiring of the config,
//! credential pool, state store, dispatcher, and HTTP server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use gemlink::auth::load_credential;
use gemlink::config::{expand_user, Config};
use gemlink::dispatch::{CredSource, MultiClient, PoolOptions};
use gemlink::server::{build_router, AppState};
use gemlink::state::StateStore;

#[derive(Parser)]
#[command(name = "gemlink")]
#[command(about = "Gemini v1beta gateway over the Code Assist backend", version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file and exit
    Check,
    /// Start the HTTP gateway
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            let config = Config::load(&cli.config)?;
            config.validate()?;
            println!("config OK");
            Ok(())
        }
        Commands::Serve => serve(&cli.config).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gemlink=info,tower_http=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    config.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting gemlink"
    );

    // Optional upstream proxy, with an async TCP liveness probe so a dead
    // proxy shows up in the logs right away instead of as request timeouts.
    let proxy = config.proxy_url()?;
    if let Some(url) = &proxy {
        tracing::info!(proxy = %url, "using upstream proxy");
        spawn_proxy_probe(url.clone());
    }

    // Load credentials; individual failures are logged and skipped, but at
    // least one must survive.
    if config.gemini_oauth_creds_files.is_empty() {
        anyhow::bail!("no geminiOauthCredsFiles configured; provide at least one path");
    }
    let mut sources = Vec::new();
    for path in &config.gemini_oauth_creds_files {
        if path.is_empty() {
            continue;
        }
        match load_credential(path) {
            Ok((raw, expanded)) => sources.push(CredSource {
                path: expanded,
                raw,
                persist: true,
            }),
            Err(e) => {
                tracing::error!(path = %path, error = %e, "failed to load credential");
            }
        }
    }
    if sources.is_empty() {
        anyhow::bail!("no usable credentials from geminiOauthCredsFiles");
    }

    let store = StateStore::open(&expand_user(&config.sqlite_path));
    if !store.is_durable() {
        tracing::warn!("state store is memory-only; project cache will not survive restarts");
    }

    let multi_client = MultiClient::new(
        sources,
        PoolOptions {
            request_max_retries: config.request_max_retries,
            base_delay: Duration::from_millis(config.request_base_delay_ms),
            proxy,
            user_agent: config.user_agent.clone(),
            project_ids: config.expanded_project_ids(),
        },
        store,
    )?;

    let listen_addr = config.listen_addr();
    let state = AppState::new(Arc::new(config), Arc::new(multi_client));
    let app = build_router(state);

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shut down cleanly");
    Ok(())
}

/// Try a TCP connection to the proxy in the background and log the outcome.
fn spawn_proxy_probe(url: reqwest::Url) {
    tokio::spawn(async move {
        let Some(host) = url.host_str().map(str::to_string) else {
            return;
        };
        let port = url.port().unwrap_or(match url.scheme() {
            "socks5" => 1080,
            _ => 80,
        });
        let target = format!("{host}:{port}");
        match tokio::time::timeout(
            Duration::from_secs(5),
            tokio::net::TcpStream::connect(&target),
        )
        .await
        {
            Ok(Ok(_)) => tracing::info!(%target, "proxy tcp check successful"),
            Ok(Err(e)) => tracing::warn!(%target, error = %e, "proxy tcp check failed"),
            Err(_) => tracing::warn!(%target, "proxy tcp check timed out"),
        }
    });
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT");
        }
        () = terminate => {
            tracing::info!("received SIGTERM");
        }
    }
}
