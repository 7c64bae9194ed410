//! Pool client: one Stratum session over TCP.

use anyhow::{bail, Context};
use strand_core::stratum::{Job, StratumSession};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::PoolConfig;

const USER_AGENT: &str = concat!("strand/", env!("CARGO_PKG_VERSION"));

/// `stratum+tcp://host:port/` -> `host:port`.
pub fn pool_addr(url: &str) -> &str {
    let url = url.strip_prefix("stratum+tcp://").unwrap_or(url);
    url.trim_end_matches('/')
}

pub async fn run_pool(cfg: PoolConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = pool_addr(&cfg.url);
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to pool {}", addr))?;
    info!(pool = addr, "connected to pool");
    drive_session(stream, &cfg.user, &cfg.password, shutdown, |job: &Job| {
        info!(job_id = %job.job_id, clean = job.clean_jobs, ntime = job.ntime, "new job");
    })
    .await
}

/// Subscribe, authorize, then follow notifications until the pool goes away
/// or shutdown is signalled.
pub async fn drive_session<S>(
    stream: S,
    user: &str,
    password: &str,
    mut shutdown: watch::Receiver<bool>,
    on_job: impl FnMut(&Job) + 'static,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut session = StratumSession::new();
    session.on_job(on_job);
    session.subscribe(USER_AGENT, |res| {
        if let Err(e) = res {
            warn!(error = %e, "subscribe failed");
        }
    })?;
    session.authorize(user, password, |res| match res {
        Ok(_) => info!("authorized with pool"),
        Err(e) => warn!(error = %e, "authorize failed"),
    })?;
    flush(&mut session, &mut wr).await?;

    let mut buf = vec![0u8; 8 * 1024];
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    session.on_connection_closed();
                    bail!("pool closed the connection");
                }
                session.on_new_data(&buf[..n])?;
                flush(&mut session, &mut wr).await?;
            }
            _ = shutdown.changed() => {
                session.on_connection_closed();
                return Ok(());
            }
        }
    }
}

async fn flush<W: AsyncWrite + Unpin>(session: &mut StratumSession, wr: &mut W) -> std::io::Result<()> {
    for line in session.take_outgoing() {
        wr.write_all(&line).await?;
    }
    wr.flush().await
}
