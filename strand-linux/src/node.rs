//! Node transport: TCP connections to other strand nodes, one `ProtocolBase`
//! per connection, driven from a local task.

use std::time::Duration;

use anyhow::Context;
use strand_core::protocol::bye_reason;
use strand_core::{ConnectionState, Message, MsgType, Outbox, ProtocolBase};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const PING: MsgType = 2;
pub const PONG: MsgType = 3;

const PING_INTERVAL: Duration = Duration::from_secs(10);
const READ_BUF: usize = 16 * 1024;

/// Protocol instance with the node's handlers registered.
pub fn node_protocol(max_message_size: u32) -> strand_core::Result<ProtocolBase> {
    let mut proto = ProtocolBase::with_max_message_size(max_message_size);
    proto.register_handler_with_limits(
        PING,
        8,
        8,
        |msg: Message, out: &mut Outbox| -> strand_core::Result<()> {
            let nonce: u64 = msg.decode()?;
            out.send(PONG, &nonce)
        },
    )?;
    proto.register_handler_with_limits(
        PONG,
        8,
        8,
        |msg: Message, _: &mut Outbox| -> strand_core::Result<()> {
            let nonce: u64 = msg.decode()?;
            debug!(nonce, "pong");
            Ok(())
        },
    )?;
    Ok(proto)
}

pub async fn accept_loop(
    listener: TcpListener,
    max_message_size: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound peer");
                    let shutdown = shutdown.clone();
                    tokio::task::spawn_local(async move {
                        if let Err(e) = serve(stream, max_message_size, shutdown).await {
                            warn!(%addr, error = %e, "peer connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.changed() => return,
        }
    }
}

pub async fn dial(peer: String, max_message_size: u32, shutdown: watch::Receiver<bool>) {
    let res = async {
        let stream = TcpStream::connect(&peer)
            .await
            .with_context(|| format!("connect {}", peer))?;
        info!(%peer, "connected to peer");
        serve(stream, max_message_size, shutdown).await
    }
    .await;
    if let Err(e) = res {
        warn!(%peer, error = %e, "peer connection failed");
    }
}

/// Run one connection until it closes, fails or shutdown is signalled.
pub async fn serve<S>(
    stream: S,
    max_message_size: u32,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut proto = node_protocol(max_message_size)?;
    proto.on_connected()?;
    flush(&mut proto, &mut wr).await?;

    let mut buf = vec![0u8; READ_BUF];
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    let mut nonce = 0u64;
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    proto.on_connection_closed();
                    break;
                }
                let res = proto.on_new_data(&buf[..n]);
                flush(&mut proto, &mut wr).await?;
                res?;
                if proto.is_closed() {
                    break;
                }
            }
            _ = ping.tick() => {
                if proto.state() == ConnectionState::Active {
                    nonce += 1;
                    proto.send(PING, &nonce)?;
                    flush(&mut proto, &mut wr).await?;
                }
            }
            _ = shutdown.changed() => {
                proto.send_bye(bye_reason::STOPPING)?;
                flush(&mut proto, &mut wr).await?;
                break;
            }
        }
    }
    if let Some(reason) = proto.close_reason() {
        info!(%reason, "peer disconnected");
    }
    Ok(())
}

async fn flush<W: AsyncWrite + Unpin>(proto: &mut ProtocolBase, wr: &mut W) -> std::io::Result<()> {
    let fragments = proto.take_outgoing();
    if fragments.is_empty() {
        return Ok(());
    }
    for fragment in &fragments {
        wr.write_all(fragment).await?;
    }
    wr.flush().await
}
