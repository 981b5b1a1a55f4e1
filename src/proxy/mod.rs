//! Per-app reverse proxy engine.
//!
//! For a request to `/proxy/<slug>/<rest>` the engine produces a response
//! functionally equivalent to reaching `<upstream>/<rest>` directly, with
//! headers, cookies and body URLs rewritten so the embedded app keeps
//! talking through the proxy.

pub mod headers;
pub mod interceptor;
pub mod rewrite;
pub mod websocket;

use crate::error::{Error, Result};
use crate::routes::Route;
use crate::server::AppContext;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use self::rewrite::RewriteCtx;
use std::io::Read;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// Ceiling for whole-body buffering; larger bodies stream through without
/// rewriting.
pub const MAX_REWRITE_BYTES: usize = 100 * 1024 * 1024;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Shared upstream HTTP client plus the default deadline. Redirects are
/// never followed here: 3xx responses pass through to the browser with a
/// rewritten Location.
pub struct ProxyEngine {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl ProxyEngine {
    pub fn new(default_timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build proxy client: {e}"))?;
        Ok(Self {
            client,
            default_timeout: Duration::from_secs(default_timeout_secs),
        })
    }

    fn timeout_for(&self, route: &Route) -> Duration {
        route
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Html,
    Css,
    Js,
    Json,
    Xml,
    Passthrough,
}

fn classify(content_type: Option<&str>) -> BodyKind {
    let Some(content_type) = content_type else {
        return BodyKind::Passthrough;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "text/html" => BodyKind::Html,
        "text/css" => BodyKind::Css,
        "application/javascript" | "text/javascript" | "application/x-javascript" => BodyKind::Js,
        "application/json" => BodyKind::Json,
        other if other.ends_with("/xml") => BodyKind::Xml,
        _ => BodyKind::Passthrough,
    }
}

/// Entry point for every `/proxy/…` request, any method.
pub async fn handle(
    State(ctx): State<AppContext>,
    OriginalUri(original): OriginalUri,
    req: Request<Body>,
) -> Response {
    let path = req.uri().path().to_string();
    let Some(after) = path.strip_prefix("/proxy/") else {
        return Error::NotFound("not a proxy path".into()).into_response();
    };

    let Some((route, rest)) = ctx.routes.match_path(after) else {
        return Error::NotFound(format!("no app for slug '{}'", first_segment(after))).into_response();
    };

    // /proxy/<slug> without a trailing slash: normalize so the app's
    // relative URLs resolve under its prefix.
    if rest.is_empty() {
        let location = match original.query() {
            Some(query) => format!("{}/?{query}", original.path()),
            None => format!("{}/", original.path()),
        };
        return Redirect::permanent(&location).into_response();
    }

    let rest = strip_double_prefix(rest, &route.slug);

    if websocket::is_websocket_request(req.headers()) {
        return websocket::relay(&route, &rest, req).await;
    }

    match forward(&ctx, &route, &rest, req).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(slug = %route.slug, upstream = %route.upstream, error = %e,
                "proxy request failed");
            e.into_response()
        }
    }
}

fn first_segment(path: &str) -> &str {
    path.split('/').next().unwrap_or(path)
}

/// SPAs that concatenate a urlBase of `/proxy/<slug>` with paths that are
/// themselves already proxied produce `/proxy/<slug>/proxy/<slug>/api/…`;
/// strip the redundant inner prefix once per request.
fn strip_double_prefix(rest: &str, slug: &str) -> String {
    let double = format!("/proxy/{slug}");
    if rest == double {
        return "/".to_string();
    }
    if let Some(stripped) = rest.strip_prefix(&double) {
        if stripped.starts_with('/') {
            return stripped.to_string();
        }
    }
    rest.to_string()
}

/// Scheme the client used, as best the listener can tell: an inbound
/// `X-Forwarded-Proto` wins (TLS termination happens in front of us),
/// then the request URI scheme, then plain http.
pub(crate) fn client_proto(headers: &HeaderMap, uri: &Uri) -> String {
    if let Some(proto) = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
    {
        let first = proto.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_ascii_lowercase();
        }
    }
    uri.scheme_str().unwrap_or("http").to_ascii_lowercase()
}

/// Append the peer to an existing `X-Forwarded-For` chain.
pub(crate) fn forwarded_for_chain(headers: &HeaderMap, peer_ip: Option<&str>) -> Option<String> {
    let inbound = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    match (inbound, peer_ip) {
        (Some(chain), Some(peer)) => Some(format!("{chain}, {peer}")),
        (Some(chain), None) => Some(chain.to_string()),
        (None, Some(peer)) => Some(peer.to_string()),
        (None, None) => None,
    }
}

async fn forward(
    ctx: &AppContext,
    route: &Route,
    rest: &str,
    req: Request<Body>,
) -> Result<Response> {
    let (parts, body) = req.into_parts();

    let target = build_target(route, rest, parts.uri.query());
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|_| Error::InvalidInput(format!("unsupported method {}", parts.method)))?;

    let body_bytes = axum::body::to_bytes(body, MAX_REWRITE_BYTES)
        .await
        .map_err(|e| Error::InvalidInput(format!("failed to read request body: {e}")))?;

    let mut upstream_req = ctx
        .proxy
        .client
        .request(method, &target)
        .timeout(ctx.proxy.timeout_for(route));

    let client_host = parts
        .headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_proto = client_proto(&parts.headers, &parts.uri);
    let peer_ip = parts
        .extensions
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    for (name, value) in parts.headers.iter() {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || name_str.eq_ignore_ascii_case("host")
            || name_str.eq_ignore_ascii_case("content-length")
            || name_str.eq_ignore_ascii_case("accept-encoding")
            || name_str.eq_ignore_ascii_case("x-forwarded-for")
            || name_str.eq_ignore_ascii_case("x-forwarded-host")
            || name_str.eq_ignore_ascii_case("x-forwarded-proto")
            || name_str.eq_ignore_ascii_case("x-real-ip")
        {
            continue;
        }
        upstream_req = upstream_req.header(name_str, value.as_bytes());
    }

    // Forwarding chain headers.
    if let Some(chain) = forwarded_for_chain(&parts.headers, peer_ip.as_deref()) {
        upstream_req = upstream_req.header("x-forwarded-for", chain);
    }
    if let Some(host) = client_host {
        upstream_req = upstream_req.header("x-forwarded-host", host);
    }
    upstream_req = upstream_req.header("x-forwarded-proto", client_proto);
    if let Some(ip) = peer_ip {
        upstream_req = upstream_req.header("x-real-ip", ip);
    }

    if !body_bytes.is_empty() {
        upstream_req = upstream_req.body(body_bytes.to_vec());
    }

    let upstream_resp = upstream_req.send().await.map_err(|e| {
        if e.is_timeout() {
            Error::UpstreamTimeout(format!("{} -> {}", route.slug, target))
        } else if e.is_connect() {
            Error::UpstreamUnavailable(format!("{} -> {}", route.slug, target))
        } else {
            Error::UpstreamProtocol(format!("{} -> {}: {e}", route.slug, target))
        }
    })?;

    build_response(route, upstream_resp).await
}

fn build_target(route: &Route, rest: &str, query: Option<&str>) -> String {
    let upstream = &route.upstream;
    let host = upstream.host_str().unwrap_or("localhost");
    let authority = match upstream.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = if rest.is_empty() { "/" } else { rest };
    match query {
        Some(q) => format!("{}://{authority}{path}?{q}", upstream.scheme()),
        None => format!("{}://{authority}{path}", upstream.scheme()),
    }
}

async fn build_response(route: &Route, upstream: reqwest::Response) -> Result<Response> {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .map_err(|_| Error::UpstreamProtocol(format!("bad status from {}", route.slug)))?;

    let upstream_headers = upstream.headers().clone();
    let content_type = upstream_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let kind = classify(content_type.as_deref());
    let gzipped = upstream_headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    let content_length = upstream_headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let ctx = RewriteCtx::new(&route.slug, &route.upstream);

    // Oversized bodies stream through untouched regardless of type.
    let too_large = content_length.map(|l| l > MAX_REWRITE_BYTES).unwrap_or(false);

    if kind == BodyKind::Passthrough || too_large {
        let mut response = Response::builder().status(status);
        copy_headers(response.headers_mut().unwrap(), &upstream_headers, &ctx, false);
        let body = Body::from_stream(upstream.bytes_stream());
        return response
            .body(body)
            .map_err(|e| Error::UpstreamProtocol(e.to_string()));
    }

    let raw = upstream
        .bytes()
        .await
        .map_err(|e| Error::UpstreamProtocol(format!("{}: {e}", route.slug)))?;

    if raw.len() > MAX_REWRITE_BYTES {
        return passthrough_buffered(status, &upstream_headers, &ctx, raw);
    }

    // Inflate gzip before rewriting; on failure pass the original bytes on.
    let (plain, inflated) = if gzipped {
        match gunzip(&raw) {
            Ok(data) => (Bytes::from(data), true),
            Err(e) => {
                tracing::warn!(slug = %route.slug, error = %e,
                    "gzip decompression failed, passing body through");
                return passthrough_buffered(status, &upstream_headers, &ctx, raw);
            }
        }
    } else {
        (raw.clone(), false)
    };

    let Ok(text) = std::str::from_utf8(&plain) else {
        return passthrough_buffered(status, &upstream_headers, &ctx, raw);
    };

    let rewritten = std::panic::catch_unwind(AssertUnwindSafe(|| match kind {
        BodyKind::Html => rewrite::rewrite_html(text, &ctx),
        BodyKind::Css => rewrite::rewrite_css(text, &ctx),
        BodyKind::Js => rewrite::rewrite_js(text, &ctx),
        BodyKind::Json => rewrite::rewrite_json(text, &ctx),
        BodyKind::Xml => rewrite::rewrite_xml(text, &ctx),
        BodyKind::Passthrough => unreachable!(),
    }));

    let body = match rewritten {
        Ok(body) => body,
        Err(_) => {
            tracing::error!(slug = %route.slug, "body rewriter panicked, returning original body");
            return passthrough_buffered(status, &upstream_headers, &ctx, raw);
        }
    };

    let mut response = Response::builder().status(status);
    let headers_out = response.headers_mut().unwrap();
    copy_headers(headers_out, &upstream_headers, &ctx, true);
    if inflated {
        headers_out.remove("content-encoding");
    }
    response
        .body(Body::from(body))
        .map_err(|e| Error::UpstreamProtocol(e.to_string()))
}

/// Buffered pass-through used by the rewrite fallback paths. Headers keep
/// the policy treatment; the body is returned byte-for-byte.
fn passthrough_buffered(
    status: StatusCode,
    upstream_headers: &reqwest::header::HeaderMap,
    ctx: &RewriteCtx<'_>,
    raw: Bytes,
) -> Result<Response> {
    let mut response = Response::builder().status(status);
    copy_headers(response.headers_mut().unwrap(), upstream_headers, ctx, false);
    response
        .body(Body::from(raw))
        .map_err(|e| Error::UpstreamProtocol(e.to_string()))
}

/// Copy upstream response headers through the policy: frame-busting headers
/// dropped, URL-bearing values rewritten, hop-by-hop removed, and when the
/// body was rewritten the stale `Content-Length` dropped with it.
fn copy_headers(
    out: &mut HeaderMap,
    upstream: &reqwest::header::HeaderMap,
    ctx: &RewriteCtx<'_>,
    body_rewritten: bool,
) {
    for (name, value) in upstream.iter() {
        let name_str = name.as_str();
        if headers::is_stripped(name_str) || is_hop_by_hop(name_str) {
            continue;
        }
        if body_rewritten
            && (name_str.eq_ignore_ascii_case("content-length")
                || name_str.eq_ignore_ascii_case("content-encoding"))
        {
            continue;
        }
        let Ok(out_name) = HeaderName::from_bytes(name_str.as_bytes()) else {
            continue;
        };
        let out_value = match value.to_str().ok().and_then(|v| headers::rewrite_value(name_str, v, ctx)) {
            Some(rewritten) => match HeaderValue::from_str(&rewritten) {
                Ok(v) => v,
                Err(_) => continue,
            },
            None => match HeaderValue::from_bytes(value.as_bytes()) {
                Ok(v) => v,
                Err(_) => continue,
            },
        };
        out.append(out_name, out_value);
    }
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
