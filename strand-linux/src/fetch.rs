//! `strand-linux fetch <url>`: one HTTP GET driven through `HttpClient`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use strand_core::http::client::ResponseResult;
use strand_core::http::{ClientAction, ClientRequest, HttpClient, HttpMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const TICK: Duration = Duration::from_millis(100);

pub async fn fetch(url: &str, timeout: Duration) -> anyhow::Result<HttpMessage> {
    let mut client = HttpClient::new();
    let slot: Rc<RefCell<Option<ResponseResult>>> = Rc::new(RefCell::new(None));
    let done = slot.clone();
    client.request(
        ClientRequest::get(url)
            .header("User-Agent", concat!("strand/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout),
        move |res| *done.borrow_mut() = Some(res),
        Instant::now(),
    )?;

    let mut conn: Option<TcpStream> = None;
    let mut buf = vec![0u8; 16 * 1024];
    let mut tick = tokio::time::interval(TICK);
    loop {
        let mut actions = client.take_actions();
        while !actions.is_empty() {
            for action in actions {
                perform(&mut client, &mut conn, action, timeout).await;
            }
            actions = client.take_actions();
        }
        if let Some(res) = slot.borrow_mut().take() {
            return Ok(res?);
        }
        tokio::select! {
            n = read_some(&mut conn, &mut buf) => match n {
                Ok(0) => {
                    conn = None;
                    client.on_connection_closed();
                }
                Ok(n) => client.on_new_data(&buf[..n]),
                Err(e) => {
                    conn = None;
                    client.on_transport_error(e.to_string());
                }
            },
            _ = tick.tick() => client.on_tick(Instant::now()),
        }
    }
}

async fn perform(
    client: &mut HttpClient,
    conn: &mut Option<TcpStream>,
    action: ClientAction,
    timeout: Duration,
) {
    match action {
        ClientAction::Connect { host, port } => {
            debug!(%host, port, "connecting");
            match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
                Ok(Ok(stream)) => {
                    *conn = Some(stream);
                    client.on_connected();
                }
                Ok(Err(e)) => client.on_transport_error(e.to_string()),
                Err(_) => client.on_transport_error(format!("connect to {}:{} timed out", host, port)),
            }
        }
        ClientAction::Send(msg) => {
            let Some(stream) = conn.as_mut() else {
                client.on_transport_error("not connected");
                return;
            };
            for fragment in msg.fragments() {
                if let Err(e) = stream.write_all(fragment).await {
                    *conn = None;
                    client.on_transport_error(e.to_string());
                    return;
                }
            }
        }
        ClientAction::Close => *conn = None,
    }
}

async fn read_some(conn: &mut Option<TcpStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match conn {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}
