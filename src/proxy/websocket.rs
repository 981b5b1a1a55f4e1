//! WebSocket upgrade relay.
//!
//! The client's upgrade request is rewritten (`Host` set to the upstream
//! authority, `X-Forwarded-*` set, every other header forwarded as-is)
//! and written to a fresh TCP or TLS connection chosen by the upstream
//! scheme. The upstream's response head is relayed back to the client
//! verbatim; on 101 the client socket is hijacked and two copiers shuffle
//! raw bytes in both directions until either side closes or errors. No
//! rewriting is applied to upgrade traffic.

use crate::error::Error;
use crate::routes::Route;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

/// Upper bound on the upstream response head.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// A request asks for a WebSocket when it carries `Connection: upgrade`
/// and `Upgrade: websocket`.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

/// Relay an upgrade request to the upstream and hijack the client socket.
pub async fn relay(route: &Route, rest: &str, mut req: Request<Body>) -> Response {
    let slug = route.slug.clone();

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return hijack_failure(&slug, "connection does not support upgrade");
    };

    let authority = authority_of(&route.upstream);
    let target = match req.uri().query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest.to_string(),
    };

    let mut upstream = match dial(&route.upstream).await {
        Ok(stream) => stream,
        Err(e) => return hijack_failure(&slug, &format!("upstream dial failed: {e}")),
    };

    let forwarded = forwarding_headers(&req);
    let head = build_upgrade_request(
        req.method().as_str(),
        &target,
        req.headers(),
        &authority,
        &forwarded,
    );
    if let Err(e) = upstream.write_all(&head).await {
        return hijack_failure(&slug, &format!("failed to send upgrade request: {e}"));
    }

    let (head_bytes, mut leftover) = match read_response_head(&mut upstream).await {
        Ok(parts) => parts,
        Err(e) => return hijack_failure(&slug, &format!("failed to read upstream response: {e}")),
    };
    let (status, upstream_headers) = match parse_response_head(&head_bytes) {
        Ok(parsed) => parsed,
        Err(e) => return hijack_failure(&slug, &format!("malformed upstream response: {e}")),
    };

    // The upstream's response headers go back verbatim: the forwarded
    // Sec-WebSocket-Key means its Sec-WebSocket-Accept is valid for the
    // client.
    let mut builder = Response::builder().status(status);
    if let Some(headers_out) = builder.headers_mut() {
        for (name, value) in &upstream_headers {
            headers_out.append(name.clone(), value.clone());
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        // Upgrade declined; relay the response body as an ordinary reply.
        if let Err(e) = read_declared_body(&mut upstream, &upstream_headers, &mut leftover).await {
            tracing::debug!(slug = %slug, error = %e, "truncated non-upgrade response body");
        }
        return builder
            .body(Body::from(leftover))
            .unwrap_or_else(|_| hijack_failure(&slug, "invalid upstream response"));
    }

    tracing::debug!(slug = %slug, authority = %authority, "websocket relay established");

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                // Frames the upstream pushed before the client upgrade
                // completed come first.
                if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                    return;
                }
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    tracing::debug!(slug = %slug, error = %e, "websocket relay ended with error");
                }
                let _ = client.shutdown().await;
                let _ = upstream.shutdown().await;
            }
            Err(e) => {
                tracing::warn!(slug = %slug, error = %e, "client upgrade failed");
            }
        }
    });

    builder
        .body(Body::empty())
        .unwrap_or_else(|_| Error::UpstreamProtocol("invalid upgrade response".into()).into_response())
}

/// 500 with `Connection: close`: the upgrade handshake cannot recover.
fn hijack_failure(slug: &str, why: &str) -> Response {
    tracing::warn!(slug = %slug, error = %why, "websocket hijack failed");
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONNECTION, "close")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"error":"upstream_protocol"}"#))
        .unwrap_or_default()
}

fn authority_of(upstream: &Url) -> String {
    let host = upstream.host_str().unwrap_or("localhost");
    match upstream.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// TCP or TLS per the upstream scheme.
async fn dial(upstream: &Url) -> anyhow::Result<Box<dyn Io>> {
    let host = upstream
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("upstream url has no host"))?;
    let port = upstream.port_or_known_default().unwrap_or(80);

    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;

    if upstream.scheme() == "https" {
        let connector = tokio_native_tls::TlsConnector::from(
            tokio_native_tls::native_tls::TlsConnector::new()?,
        );
        let tls = connector.connect(host, tcp).await?;
        Ok(Box::new(tls))
    } else {
        Ok(Box::new(tcp))
    }
}

/// The derived X-Forwarded set for the upgrade request.
fn forwarding_headers(req: &Request<Body>) -> Vec<(&'static str, String)> {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    let mut forwarded = Vec::new();
    if let Some(chain) = super::forwarded_for_chain(req.headers(), peer_ip.as_deref()) {
        forwarded.push(("x-forwarded-for", chain));
    }
    if let Some(host) = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()) {
        forwarded.push(("x-forwarded-host", host.to_string()));
    }
    forwarded.push(("x-forwarded-proto", super::client_proto(req.headers(), req.uri())));
    if let Some(ip) = peer_ip {
        forwarded.push(("x-real-ip", ip));
    }
    forwarded
}

/// Headers owned by the proxy on the upstream leg; the client's values are
/// replaced, everything else is forwarded untouched.
fn is_replaced_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("x-forwarded-for")
        || name.eq_ignore_ascii_case("x-forwarded-host")
        || name.eq_ignore_ascii_case("x-forwarded-proto")
        || name.eq_ignore_ascii_case("x-real-ip")
}

/// Serialize the rewritten upgrade request head. All client headers ride
/// along (the upgrade handshake depends on Connection, Upgrade and the
/// Sec-WebSocket-* set).
fn build_upgrade_request(
    method: &str,
    target: &str,
    headers: &HeaderMap,
    authority: &str,
    forwarded: &[(&'static str, String)],
) -> Vec<u8> {
    let target = if target.is_empty() { "/" } else { target };

    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\nhost: ");
    buf.extend_from_slice(authority.as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if is_replaced_header(name.as_str()) {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    for (name, value) in forwarded {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Read until the end of the response head; bytes past `\r\n\r\n` belong
/// to the upgraded stream and are returned separately.
async fn read_response_head<S>(io: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_crlf(mut bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    while let Some(pos) = find_subsequence(bytes, b"\r\n") {
        lines.push(&bytes[..pos]);
        bytes = &bytes[pos + 2..];
    }
    if !bytes.is_empty() {
        lines.push(bytes);
    }
    lines
}

/// Minimal status-line + header parse. Values are kept byte-for-byte.
fn parse_response_head(
    head: &[u8],
) -> std::result::Result<(StatusCode, Vec<(HeaderName, HeaderValue)>), String> {
    let lines = split_crlf(head);
    let status_line = lines
        .first()
        .and_then(|line| std::str::from_utf8(line).ok())
        .ok_or_else(|| "missing status line".to_string())?;

    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| format!("bad status line: {status_line}"))?;
    let status =
        StatusCode::from_u16(code).map_err(|_| format!("bad status code: {code}"))?;

    let mut headers = Vec::new();
    for line in &lines[1..] {
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name), HeaderValue::from_bytes(value))
        else {
            continue;
        };
        headers.push((name, value));
    }
    Ok((status, headers))
}

/// For declined upgrades, drain the rest of a Content-Length body into
/// `leftover` so the client sees the whole error page.
async fn read_declared_body<S>(
    io: &mut S,
    headers: &[(HeaderName, HeaderValue)],
    leftover: &mut Vec<u8>,
) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let declared = headers
        .iter()
        .find(|(name, _)| *name == header::CONTENT_LENGTH)
        .and_then(|(_, value)| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());

    let Some(declared) = declared else {
        return Ok(());
    };
    let declared = declared.min(MAX_RESPONSE_HEAD);

    let mut chunk = [0u8; 4096];
    while leftover.len() < declared {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        leftover.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_websocket_requests() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_request(&headers));

        headers.insert("connection", "keep-alive, Upgrade".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        assert!(is_websocket_request(&headers));

        headers.insert("upgrade", "h2c".parse().unwrap());
        assert!(!is_websocket_request(&headers));
    }

    #[test]
    fn upgrade_request_forwards_all_headers_and_rewrites_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "portal.local".parse().unwrap());
        headers.insert("connection", "Upgrade".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap());
        headers.insert("sec-websocket-version", "13".parse().unwrap());
        headers.insert("cookie", "session=abc".parse().unwrap());
        headers.insert("x-custom-app", "1".parse().unwrap());

        let forwarded = vec![("x-forwarded-proto", "http".to_string())];
        let head = build_upgrade_request("GET", "/ws?token=1", &headers, "chat.local:3000", &forwarded);
        let text = String::from_utf8(head).unwrap();

        assert!(text.starts_with("GET /ws?token=1 HTTP/1.1\r\n"));
        assert!(text.contains("host: chat.local:3000\r\n"));
        assert!(!text.contains("portal.local"));
        // The full client header set rides along, handshake headers included.
        assert!(text.contains("connection: Upgrade\r\n"));
        assert!(text.contains("upgrade: websocket\r\n"));
        assert!(text.contains("sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(text.contains("sec-websocket-version: 13\r\n"));
        assert!(text.contains("cookie: session=abc\r\n"));
        assert!(text.contains("x-custom-app: 1\r\n"));
        assert!(text.contains("x-forwarded-proto: http\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upgrade_request_defaults_empty_target_to_root() {
        let head = build_upgrade_request("GET", "", &HeaderMap::new(), "chat.local", &[]);
        assert!(head.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn response_head_parses_verbatim_headers() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\n\
                     upgrade: websocket\r\n\
                     connection: Upgrade\r\n\
                     sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let (status, headers) = parse_response_head(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[2].0.as_str(), "sec-websocket-accept");
        assert_eq!(headers[2].1, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn response_head_rejects_garbage() {
        assert!(parse_response_head(b"not http at all\r\n\r\n").is_err());
        assert!(parse_response_head(b"").is_err());
    }

    #[tokio::test]
    async fn response_head_read_keeps_leftover_bytes() {
        let (mut server, mut client) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\n\r\n\x81\x02hi")
                .await
                .unwrap();
        });

        let (head, leftover) = read_response_head(&mut client).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(leftover, b"\x81\x02hi");
    }

    #[tokio::test]
    async fn response_head_read_fails_on_early_close() {
        let (server, mut client) = tokio::io::duplex(64);
        drop(server);
        assert!(read_response_head(&mut client).await.is_err());
    }
}
