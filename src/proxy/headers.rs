//! Response header policy for proxied apps.
//!
//! Frame-busting headers are stripped so upstreams render inside the
//! portal's iframe; URL-bearing headers are rewritten onto the proxy
//! path; cookie paths are scoped to the app. The `Domain` cookie
//! attribute is left untouched, which can lose cookies for upstreams
//! that pin an explicit domain (documented limitation).

use super::rewrite::{rewrite_url, RewriteCtx};
use once_cell::sync::Lazy;
use regex::Regex;

/// Headers removed from every proxied response.
const STRIPPED: &[&str] = &[
    "x-frame-options",
    "content-security-policy",
    "content-security-policy-report-only",
];

pub fn is_stripped(name: &str) -> bool {
    STRIPPED.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Rewrite a single response header value where the policy calls for it.
/// Returns `None` when the value passes through unchanged.
pub fn rewrite_value(name: &str, value: &str, ctx: &RewriteCtx<'_>) -> Option<String> {
    if name.eq_ignore_ascii_case("location") || name.eq_ignore_ascii_case("content-location") {
        return rewrite_url(value, ctx);
    }
    if name.eq_ignore_ascii_case("refresh") {
        return rewrite_refresh(value, ctx);
    }
    if name.eq_ignore_ascii_case("set-cookie") {
        return rewrite_set_cookie(value, ctx);
    }
    if name.eq_ignore_ascii_case("link") {
        return rewrite_link(value, ctx);
    }
    None
}

static REFRESH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\s*\d+\s*;\s*url\s*=\s*)(.+)$").expect("refresh pattern"));

fn rewrite_refresh(value: &str, ctx: &RewriteCtx<'_>) -> Option<String> {
    let caps = REFRESH.captures(value)?;
    let target = caps[2].trim();
    rewrite_url(target, ctx).map(|new| format!("{}{new}", &caps[1]))
}

/// Rewrite the `Path` attribute: `/` becomes `/proxy/<slug>/` and any other
/// root path gains the proxy prefix.
fn rewrite_set_cookie(value: &str, ctx: &RewriteCtx<'_>) -> Option<String> {
    let prefix = ctx.prefix();
    let mut changed = false;

    let parts: Vec<String> = value
        .split(';')
        .map(|part| {
            let trimmed = part.trim_start();
            let leading = &part[..part.len() - trimmed.len()];
            if let Some(path) = strip_prefix_ignore_case(trimmed, "path=") {
                if path == "/" {
                    changed = true;
                    return format!("{leading}Path={prefix}/");
                }
                let scoped = path == prefix || path.starts_with(&format!("{prefix}/"));
                if path.starts_with('/') && !scoped {
                    changed = true;
                    return format!("{leading}Path={prefix}{path}");
                }
            }
            part.to_string()
        })
        .collect();

    changed.then(|| parts.join(";"))
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

static LINK_URI: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]*)>").expect("link pattern"));

fn rewrite_link(value: &str, ctx: &RewriteCtx<'_>) -> Option<String> {
    let mut changed = false;
    let out = LINK_URI
        .replace_all(value, |caps: &regex::Captures<'_>| match rewrite_url(&caps[1], ctx) {
            Some(new) => {
                changed = true;
                format!("<{new}>")
            }
            None => caps[0].to_string(),
        })
        .into_owned();
    changed.then_some(out)
}
