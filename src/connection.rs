//! Connection Lifecycle: the per-session driver.
//!
//! Validates the HTTP upgrade request by hand rather than through
//! `tokio_tungstenite::accept_async`, because the broker must also answer
//! a plain (non-upgrade) HTTP GET probe with a bare `200`/`400` response —
//! a path the library's automatic handshake has no hook for. Grounded on
//! `socket::server::SocketServer::accept_loop` for the "accept, construct
//! a per-connection object, hand it a channel" shape, and on
//! `socket::client_conn::SocketClientConn` for the split read-loop /
//! write-task structure, generalized here to drive a real
//! `tokio-tungstenite` WebSocket sink instead of a raw `UnixStream` half.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::codec::{ClientFrame, Presence, ServerFrame};
use crate::history::History;
use crate::registry::{ClaimOutcome, Registry};
use crate::router;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_REQUEST_BYTES: usize = 8 * 1024;

struct UpgradeRequest {
    name: String,
    is_upgrade_attempt: bool,
    headers_valid: bool,
    key: String,
}

/// Drive one accepted TCP connection from upgrade through disconnect.
pub async fn handle(stream: TcpStream, addr: SocketAddr, registry: Arc<Registry>, history: Arc<History>) {
    let mut stream = stream;
    let request = match read_upgrade_request(&mut stream).await {
        Ok(req) => req,
        Err(err) => {
            debug!("{addr}: failed to read upgrade request: {err:#}");
            let _ = write_plain_response(&mut stream, 400, "Bad Request").await;
            return;
        }
    };

    if !request.is_upgrade_attempt {
        let ok = registry.would_admit(&request.name);
        let _ = if ok {
            write_plain_response(&mut stream, 200, "OK").await
        } else {
            write_plain_response(&mut stream, 400, "Bad Request").await
        };
        return;
    }

    if !request.headers_valid {
        let _ = write_plain_response(&mut stream, 400, "Bad Request").await;
        return;
    }

    let (outbox_tx, outbox_rx) = unbounded_channel::<Vec<u8>>();
    let outcome = registry.claim(&request.name, outbox_tx.clone(), addr);
    let name = request.name;
    match outcome {
        ClaimOutcome::RejectedBadName => {
            let _ = write_plain_response(&mut stream, 400, "Bad Request: invalid name").await;
            return;
        }
        ClaimOutcome::RejectedInUse => {
            let _ = write_plain_response(&mut stream, 400, "Bad Request: name in use").await;
            return;
        }
        ClaimOutcome::AcceptedNew | ClaimOutcome::AcceptedReconnect => {}
    }

    if let Err(err) = complete_handshake(&mut stream, &request.key).await {
        warn!("{addr}: failed to complete websocket handshake for {name}: {err:#}");
        registry.mark_offline(&name);
        return;
    }

    info!("{name} connected from {addr} ({} sessions registered)", registry.count());

    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    let (mut sink, mut source) = ws.split();

    let writer_task = tokio::spawn(async move {
        let mut outbox_rx = outbox_rx;
        while let Some(bytes) = outbox_rx.recv().await {
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    match outcome {
        ClaimOutcome::AcceptedNew => {
            let frame = ServerFrame::NewUser { name: name.clone() };
            for target in registry.active_outboxes(Some(&name)) {
                let _ = target.send(frame.encode());
            }
        }
        ClaimOutcome::AcceptedReconnect => {
            let frame = ServerFrame::StateChange { name: name.clone(), state: Presence::Active.to_byte() };
            for target in registry.open_outboxes(Some(&name)) {
                let _ = target.send(frame.encode());
            }
        }
        _ => unreachable!("rejected outcomes already returned above"),
    }

    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!("{name}: transport error, ending session: {err:#}");
                break;
            }
        };
        let bytes = match msg {
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => continue,
        };
        match ClientFrame::decode(&bytes) {
            Ok(frame) => router::route(&registry, &history, &name, &outbox_tx, frame),
            Err(err) => {
                warn!("{name}: malformed frame, ending session: {err:#}");
                break;
            }
        }
    }

    registry.mark_offline(&name);
    let frame = ServerFrame::StateChange { name: name.clone(), state: Presence::Disconnected.to_byte() };
    for target in registry.open_outboxes(Some(&name)) {
        let _ = target.send(frame.encode());
    }
    info!("{name} disconnected");

    drop(outbox_tx);
    writer_task.abort();
}

async fn read_upgrade_request(stream: &mut TcpStream) -> Result<UpgradeRequest> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(anyhow!("upgrade request exceeded {MAX_REQUEST_BYTES} bytes without terminator"));
        }
        let n = stream.read(&mut chunk).await.context("reading upgrade request")?;
        if n == 0 {
            return Err(anyhow!("connection closed before upgrade request completed"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&buf).context("parsing HTTP upgrade request")?;

    let path = req.path.unwrap_or("/");
    let name = extract_name_param(path);

    let header_value = |key: &str| -> Option<String> {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(key))
            .map(|h| String::from_utf8_lossy(h.value).into_owned())
    };

    let connection = header_value("Connection");
    let upgrade = header_value("Upgrade");
    let version = header_value("Sec-WebSocket-Version");
    let key = header_value("Sec-WebSocket-Key").unwrap_or_default();

    let connection_has_upgrade_token =
        connection.as_deref().is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")));
    let upgrade_is_websocket = upgrade.as_deref().is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));

    let is_upgrade_attempt = connection.is_some() || upgrade.is_some();
    let headers_valid =
        connection_has_upgrade_token && upgrade_is_websocket && version.as_deref() == Some("13") && !key.is_empty();

    Ok(UpgradeRequest { name, is_upgrade_attempt, headers_valid, key })
}

fn extract_name_param(path: &str) -> String {
    let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("name=") {
            return percent_decode(value);
        }
    }
    String::new()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn derive_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

async fn complete_handshake(stream: &mut TcpStream, client_key: &str) -> Result<()> {
    let accept = derive_accept_key(client_key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await.context("writing 101 response")?;
    Ok(())
}

async fn write_plain_response(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    let body = reason;
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.context("writing plain HTTP response")?;
    stream.shutdown().await.ok();
    Ok(())
}
