// Strand Linux daemon: node transport, pool client, one-shot HTTP fetch.

mod config;
mod fetch;
mod node;
mod pool;

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time given to connections to flush their Bye on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let command = args.next();
    if matches!(command.as_deref(), Some("--version" | "-V")) {
        println!("strand-linux {}", VERSION);
        return Ok(());
    }

    init_tracing();
    let cfg = config::load();

    // Connection state is single-owner and not Send: everything runs on one
    // thread inside a LocalSet.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    match command.as_deref() {
        None => local.block_on(&rt, run_daemon(cfg)),
        Some("fetch") => {
            let url = args.next().context("usage: strand-linux fetch <url>")?;
            local.block_on(&rt, fetch_to_stdout(&url, &cfg))
        }
        Some(other) => bail!("unknown argument {:?}", other),
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_daemon(cfg: config::Config) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("bind port {}", cfg.listen_port))?;
    info!(port = cfg.listen_port, version = VERSION, "strand node listening");
    tokio::task::spawn_local(node::accept_loop(
        listener,
        cfg.max_message_size,
        shutdown_rx.clone(),
    ));

    for peer in cfg.peers {
        tokio::task::spawn_local(node::dial(peer, cfg.max_message_size, shutdown_rx.clone()));
    }

    if let Some(pool_cfg) = cfg.pool {
        let shutdown = shutdown_rx.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = pool::run_pool(pool_cfg, shutdown).await {
                warn!(error = %e, "pool client stopped");
            }
        });
    }

    shutdown_signal().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn fetch_to_stdout(url: &str, cfg: &config::Config) -> anyhow::Result<()> {
    let resp = fetch::fetch(url, Duration::from_secs(cfg.http_timeout_secs)).await?;
    let mut out = std::io::stdout().lock();
    if let strand_core::http::StartLine::Response { status, reason, .. } = &resp.start {
        writeln!(out, "{} {}", status, reason)?;
    }
    out.write_all(&resp.body)?;
    out.flush()?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
