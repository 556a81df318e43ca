//! HTTP side-channel
//!
//! Datagrams cannot carry arbitrary-sized payloads, so item bytes move
//! over a minimal hand-rolled HTTP/1.1 exchange: a content server that
//! answers `GET /` with the raw bytes of the item named in the request
//! headers, and a client that spools a peer's response straight into
//! the local device layout. The same low-level request helper backs the
//! gateway's description fetch and SOAP calls.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::device::local::LocalDevice;
use crate::gateway::Gateway;
use crate::swarm::draw_port;

use super::parse::{find_header_end, header_value, parse_content_length, parse_status_line, stream_head, text_response};
use super::NetError;

/// Upper bound on request headers we buffer.
const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Attempts at drawing a free port before giving up.
const BIND_ATTEMPTS: usize = 16;

/// Start the content server on a random port in [1024, 13024).
///
/// Requests a TCP port mapping from the gateway when one is available;
/// mapping failure is logged and non-fatal; the server still answers
/// locally. Returns the bound port.
pub async fn serve_content(
    local_peer_id: String,
    device: LocalDevice,
    gateway: Option<Arc<Gateway>>,
) -> std::io::Result<u16> {
    let mut listener = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = draw_port();
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => {
                listener = Some((l, port));
                break;
            }
            Err(_) => continue,
        }
    }
    let (listener, port) = listener.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "no free content port")
    })?;

    if let Some(gateway) = gateway {
        if let Err(e) = gateway.open_port("tcp", port).await {
            warn!(port = port, error = %e, "content port mapping failed, serving locally only");
        }
    }

    info!(port = port, "content server started");

    tokio::spawn(async move {
        loop {
            let (socket, remote) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let peer_id = local_peer_id.clone();
            let device = device.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, &peer_id, &device).await {
                    debug!(from = %remote, error = %e, "content request failed");
                }
            });
        }
    });

    Ok(port)
}

async fn handle_connection(
    mut socket: TcpStream,
    local_peer_id: &str,
    device: &LocalDevice,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_HEADER_BYTES];
    let mut total = 0;
    let header_end = loop {
        let n = socket.read(&mut buf[total..]).await?;
        if n == 0 {
            return Ok(());
        }
        total += n;
        if let Some(end) = find_header_end(&buf[..total]) {
            break end;
        }
        if total >= buf.len() {
            socket.write_all(text_response(400, "request too large").as_bytes()).await?;
            return Ok(());
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let target = header_value(&headers, "target").unwrap_or("");
    if target != local_peer_id {
        socket
            .write_all(text_response(500, "request addressed to another peer").as_bytes())
            .await?;
        return Ok(());
    }

    let item_id = header_value(&headers, "item")
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|v| v["id"].as_str().map(|s| s.to_string()));
    let item_id = match item_id {
        Some(id) => id,
        None => {
            socket
                .write_all(text_response(500, "missing or malformed item header").as_bytes())
                .await?;
            return Ok(());
        }
    };

    let path = device.content_path(&item_id);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            socket
                .write_all(text_response(500, &format!("item not available: {}", e)).as_bytes())
                .await?;
            return Ok(());
        }
    };
    let length = file.metadata().await?.len();

    socket.write_all(stream_head(length).as_bytes()).await?;
    tokio::io::copy(&mut file, &mut socket).await?;
    socket.shutdown().await?;

    debug!(item = %item_id, bytes = length, "served item content");
    Ok(())
}

/// Fetch an item's bytes from a peer's content server into `dest`.
///
/// Writes through a temp file and renames on success so a torn
/// transfer never leaves a half-written content file behind. Returns
/// the number of bytes written.
pub async fn fetch_content(
    address: &str,
    port: u16,
    target_peer_id: &str,
    item_json: &str,
    dest: &Path,
) -> Result<u64, NetError> {
    let mut stream = TcpStream::connect((address, port)).await?;
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}:{}\r\ntarget: {}\r\nitem: {}\r\nConnection: close\r\n\r\n",
        address, port, target_peer_id, item_json
    );
    stream.write_all(request.as_bytes()).await?;

    // read up to the header terminator, keeping any body bytes read past it
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(NetError::Malformed("response headers too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(NetError::Malformed("connection closed before headers".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let status = headers
        .lines()
        .next()
        .and_then(parse_status_line)
        .ok_or_else(|| NetError::Malformed("bad status line".into()))?;
    let content_length = parse_content_length(&headers) as u64;

    if status != 200 {
        let mut body = buf[header_end..].to_vec();
        while (body.len() as u64) < content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        return Err(NetError::Remote(String::from_utf8_lossy(&body).to_string()));
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = dest.with_extension(format!("tmp.{}", std::process::id()));
    let mut file = tokio::fs::File::create(&temp).await?;

    let mut written = 0u64;
    file.write_all(&buf[header_end..]).await?;
    written += (buf.len() - header_end) as u64;
    while written < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n]).await?;
        written += n as u64;
    }
    file.flush().await?;
    drop(file);

    if written != content_length {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(NetError::Malformed(format!(
            "truncated transfer: {} of {} bytes",
            written, content_length
        )));
    }

    tokio::fs::rename(&temp, dest).await?;
    Ok(written)
}

/// Split `http://host[:port][/path]` into its parts. Port defaults to 80.
pub fn parse_http_url(url: &str) -> Result<(String, u16, String), NetError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| NetError::Malformed(format!("unsupported url: {}", url)))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rfind(':') {
        Some(i) => {
            let port = authority[i + 1..]
                .parse()
                .map_err(|_| NetError::Malformed(format!("bad port in url: {}", url)))?;
            (authority[..i].to_string(), port)
        }
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return Err(NetError::Malformed(format!("missing host in url: {}", url)));
    }
    Ok((host, port, path))
}

/// Send one raw HTTP request and read the response to connection close.
///
/// Returns the status code and the response body.
pub async fn http_exchange(host: &str, port: u16, request: &str) -> Result<(u16, String), NetError> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;

    let header_end =
        find_header_end(&raw).ok_or_else(|| NetError::Malformed("no header terminator".into()))?;
    let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let status = headers
        .lines()
        .next()
        .and_then(parse_status_line)
        .ok_or_else(|| NetError::Malformed("bad status line".into()))?;
    let body = String::from_utf8_lossy(&raw[header_end..]).to_string();
    Ok((status, body))
}

/// HTTP GET returning status and body.
pub async fn http_get(url: &str) -> Result<(u16, String), NetError> {
    let (host, port, path) = parse_http_url(url)?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n\r\n",
        path, host, port
    );
    http_exchange(&host, port, &request).await
}
