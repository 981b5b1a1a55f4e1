//! Content-type-aware URL rewriting.
//!
//! HTML and CSS get a full rewrite: every URL-bearing attribute or
//! construct is pointed back through `/proxy/<slug>/`. JavaScript, JSON
//! and XML get the safe-only pass: absolute URLs whose origin matches the
//! upstream are rewritten, root-relative string literals are never touched
//! (they routinely appear inside payload data such as query-string
//! arguments assembled at runtime). All passes are idempotent: a URL that
//! already carries the proxy prefix is left alone.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

pub struct RewriteCtx<'a> {
    pub slug: &'a str,
    pub upstream: &'a Url,
}

impl<'a> RewriteCtx<'a> {
    pub fn new(slug: &'a str, upstream: &'a Url) -> Self {
        Self { slug, upstream }
    }

    pub fn prefix(&self) -> String {
        format!("/proxy/{}", self.slug)
    }

    /// Origin spellings that identify the upstream in body text, e.g.
    /// `http://sonarr:8989` plus `http://sonarr` when the port is the
    /// scheme default.
    fn origin_variants(&self) -> Vec<String> {
        let scheme = self.upstream.scheme();
        let host = match self.upstream.host_str() {
            Some(h) => h,
            None => return Vec::new(),
        };
        let mut variants = Vec::new();
        match self.upstream.port() {
            Some(port) => variants.push(format!("{scheme}://{host}:{port}")),
            None => {
                variants.push(format!("{scheme}://{host}"));
                if let Some(default) = default_port(scheme) {
                    variants.push(format!("{scheme}://{host}:{default}"));
                }
            }
        }
        variants
    }

    fn matches_upstream(&self, other: &Url) -> bool {
        other.scheme() == self.upstream.scheme()
            && other.host_str().map(|h| h.to_ascii_lowercase())
                == self.upstream.host_str().map(|h| h.to_ascii_lowercase())
            && other.port_or_known_default() == self.upstream.port_or_known_default()
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Rewrite a single URL value. Returns `None` when the value must be left
/// alone: relative paths (`./`, `../`, bare names), fragments, foreign
/// origins, unsupported schemes, and values already carrying the prefix.
pub fn rewrite_url(raw: &str, ctx: &RewriteCtx<'_>) -> Option<String> {
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }

    let prefix = ctx.prefix();

    if raw == prefix || raw.starts_with(&format!("{prefix}/")) || raw.starts_with(&format!("{prefix}?")) {
        return None;
    }

    // Protocol-relative: //host/path
    if let Some(rest) = raw.strip_prefix("//") {
        let probe = format!("{}://{}", ctx.upstream.scheme(), rest);
        if let Ok(parsed) = Url::parse(&probe) {
            if ctx.matches_upstream(&parsed) {
                return Some(proxied_path(&parsed, &prefix));
            }
        }
        return None;
    }

    if raw.starts_with('/') {
        return Some(format!("{prefix}{raw}"));
    }

    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        if let Ok(parsed) = Url::parse(raw) {
            if ctx.matches_upstream(&parsed) {
                return Some(proxied_path(&parsed, &prefix));
            }
        }
    }

    None
}

fn proxied_path(url: &Url, prefix: &str) -> String {
    let mut out = format!("{prefix}{}", url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

// ── HTML ──────────────────────────────────────────────────────────────────

static HTML_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(href|src|action|formaction|poster|content|xlink:href|data-[a-z0-9_-]+)(\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'<>`]+))"#,
    )
    .expect("html attr pattern")
});

static HTML_SRCSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(srcset)(\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).expect("srcset pattern")
});

static HTML_SRI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+(?:integrity|crossorigin)(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'<>`]+))?"#)
        .expect("sri pattern")
});

static HEAD_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<head(\s[^>]*)?>").expect("head pattern"));

static META_REFRESH_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+\s*;\s*url\s*=\s*)(.+)$").expect("meta refresh pattern"));

/// Full HTML rewrite plus interceptor injection.
pub fn rewrite_html(body: &str, ctx: &RewriteCtx<'_>) -> String {
    let out = HTML_SRI.replace_all(body, "").into_owned();

    let out = HTML_SRCSET
        .replace_all(&out, |caps: &Captures<'_>| {
            let (value, quote) = quoted_value(caps, 3);
            format!("{}{}{quote}{}{quote}", &caps[1], &caps[2], rewrite_srcset(value, ctx))
        })
        .into_owned();

    let out = HTML_ATTR
        .replace_all(&out, |caps: &Captures<'_>| {
            let attr = &caps[1];
            let eq = &caps[2];
            let (value, quote) = quoted_value(caps, 3);

            let rewritten = if attr.eq_ignore_ascii_case("content") {
                rewrite_refresh_value(value, ctx)
            } else {
                rewrite_url(value, ctx)
            };

            match rewritten {
                Some(new) => format!("{attr}{eq}{quote}{new}{quote}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    inject_interceptor(&out, ctx)
}

/// Pull the value out of a quoted/unquoted alternation starting at group
/// `base` and report the quote character used.
fn quoted_value<'c>(caps: &'c Captures<'_>, base: usize) -> (&'c str, &'static str) {
    if let Some(m) = caps.get(base) {
        (m.as_str(), "\"")
    } else if let Some(m) = caps.get(base + 1) {
        (m.as_str(), "'")
    } else {
        (caps.get(base + 2).map(|m| m.as_str()).unwrap_or(""), "")
    }
}

fn rewrite_srcset(value: &str, ctx: &RewriteCtx<'_>) -> String {
    value
        .split(',')
        .map(|candidate| {
            let trimmed = candidate.trim_start();
            let leading = &candidate[..candidate.len() - trimmed.len()];
            let (url_part, descriptor) = match trimmed.find(char::is_whitespace) {
                Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
                None => (trimmed, ""),
            };
            match rewrite_url(url_part, ctx) {
                Some(new) => format!("{leading}{new}{descriptor}"),
                None => candidate.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// `content` attributes: rewrite the URL inside a `N;url=…` refresh value,
/// otherwise treat the whole value as a URL candidate.
fn rewrite_refresh_value(value: &str, ctx: &RewriteCtx<'_>) -> Option<String> {
    if let Some(caps) = META_REFRESH_VALUE.captures(value) {
        let target = caps[2].trim();
        return rewrite_url(target, ctx).map(|new| format!("{}{new}", &caps[1]));
    }
    rewrite_url(value, ctx)
}

fn inject_interceptor(body: &str, ctx: &RewriteCtx<'_>) -> String {
    if body.contains(super::interceptor::MARKER) {
        return body.to_string();
    }
    let script = super::interceptor::script_tag(ctx.slug);
    match HEAD_TAG.find(body) {
        Some(m) => {
            let mut out = String::with_capacity(body.len() + script.len());
            out.push_str(&body[..m.end()]);
            out.push_str(&script);
            out.push_str(&body[m.end()..]);
            out
        }
        None => format!("{script}{body}"),
    }
}

// ── CSS ───────────────────────────────────────────────────────────────────

static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\burl\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]+))\s*\)"#).expect("css url pattern")
});

static CSS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("css import pattern")
});

pub fn rewrite_css(body: &str, ctx: &RewriteCtx<'_>) -> String {
    let out = CSS_URL
        .replace_all(body, |caps: &Captures<'_>| {
            let (value, quote) = quoted_value(caps, 1);
            match rewrite_url(value, ctx) {
                Some(new) => format!("url({quote}{new}{quote})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    CSS_IMPORT
        .replace_all(&out, |caps: &Captures<'_>| {
            let (value, quote) = quoted_value(caps, 1);
            match rewrite_url(value, ctx) {
                Some(new) => format!("@import {quote}{new}{quote}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

// ── JS / JSON / XML (safe-only) ───────────────────────────────────────────

static SRI_HASHES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsriHashes\s*=\s*\{[^}]*\}").expect("sriHashes pattern"));

/// Replace absolute upstream-origin URLs with their proxied equivalent.
/// Root-relative strings are deliberately left untouched.
fn rewrite_upstream_origins(body: &str, ctx: &RewriteCtx<'_>) -> String {
    let prefix = ctx.prefix();
    let mut out = body.to_string();
    for origin in ctx.origin_variants() {
        // The captured boundary keeps e.g. http://host:80 from eating
        // http://host:8080.
        let pattern = format!(r#"(?i){}([/"'\\\s?#)<]|$)"#, regex::escape(&origin));
        let re = Regex::new(&pattern).expect("origin pattern");
        out = re
            .replace_all(&out, |caps: &Captures<'_>| format!("{prefix}{}", &caps[1]))
            .into_owned();
    }
    out
}

pub fn rewrite_js(body: &str, ctx: &RewriteCtx<'_>) -> String {
    let out = SRI_HASHES.replace_all(body, "sriHashes = {}").into_owned();
    rewrite_upstream_origins(&out, ctx)
}

pub fn rewrite_json(body: &str, ctx: &RewriteCtx<'_>) -> String {
    rewrite_upstream_origins(body, ctx)
}

pub fn rewrite_xml(body: &str, ctx: &RewriteCtx<'_>) -> String {
    rewrite_upstream_origins(body, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_for<'a>(upstream: &'a Url) -> RewriteCtx<'a> {
        RewriteCtx::new("plex", upstream)
    }

    fn upstream() -> Url {
        Url::parse("http://localhost:32400").unwrap()
    }

    // ── rewrite_url ──────────────────────────────────────────────

    #[test]
    fn root_relative_gets_prefixed() {
        let up = upstream();
        let ctx = ctx_for(&up);
        assert_eq!(rewrite_url("/page", &ctx).unwrap(), "/proxy/plex/page");
        assert_eq!(
            rewrite_url("/a/b?x=1#frag", &ctx).unwrap(),
            "/proxy/plex/a/b?x=1#frag"
        );
    }

    #[test]
    fn already_prefixed_is_untouched() {
        let up = upstream();
        let ctx = ctx_for(&up);
        assert!(rewrite_url("/proxy/plex/page", &ctx).is_none());
        assert!(rewrite_url("/proxy/plex", &ctx).is_none());
        // A different slug's prefix is still a plain root-relative path.
        assert_eq!(
            rewrite_url("/proxy/other/page", &ctx).unwrap(),
            "/proxy/plex/proxy/other/page"
        );
    }

    #[test]
    fn relative_and_foreign_urls_are_untouched() {
        let up = upstream();
        let ctx = ctx_for(&up);
        assert!(rewrite_url("./rel", &ctx).is_none());
        assert!(rewrite_url("../up", &ctx).is_none());
        assert!(rewrite_url("page.html", &ctx).is_none());
        assert!(rewrite_url("#anchor", &ctx).is_none());
        assert!(rewrite_url("https://example.com/x", &ctx).is_none());
        assert!(rewrite_url("mailto:a@b.c", &ctx).is_none());
        assert!(rewrite_url("data:image/png;base64,AAAA", &ctx).is_none());
    }

    #[test]
    fn absolute_upstream_url_is_proxied() {
        let up = upstream();
        let ctx = ctx_for(&up);
        assert_eq!(
            rewrite_url("http://localhost:32400/web/index.html#!/top", &ctx).unwrap(),
            "/proxy/plex/web/index.html#!/top"
        );
        // Scheme mismatch is a different origin.
        assert!(rewrite_url("https://localhost:32400/web", &ctx).is_none());
    }

    #[test]
    fn default_port_matches_portless_origin() {
        let up = Url::parse("http://sonarr").unwrap();
        let ctx = RewriteCtx::new("sonarr", &up);
        assert_eq!(
            rewrite_url("http://sonarr:80/api", &ctx).unwrap(),
            "/proxy/sonarr/api"
        );
    }

    #[test]
    fn protocol_relative_upstream_is_proxied() {
        let up = upstream();
        let ctx = ctx_for(&up);
        assert_eq!(
            rewrite_url("//localhost:32400/img.png", &ctx).unwrap(),
            "/proxy/plex/img.png"
        );
        assert!(rewrite_url("//cdn.example.com/img.png", &ctx).is_none());
    }

    // ── HTML ─────────────────────────────────────────────────────

    #[test]
    fn html_rewrites_href_preserving_quotes() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let out = rewrite_html(r#"<a href="/page">x</a>"#, &ctx);
        assert!(out.contains(r#"href="/proxy/plex/page""#), "{out}");

        let out = rewrite_html(r#"<a href='/page'>x</a>"#, &ctx);
        assert!(out.contains("href='/proxy/plex/page'"), "{out}");

        let out = rewrite_html("<a href=/page>x</a>", &ctx);
        assert!(out.contains("href=/proxy/plex/page"), "{out}");
    }

    #[test]
    fn html_rewrites_base_and_form_and_media_attrs() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let body = concat!(
            r#"<base href="/">"#,
            r#"<form action="/submit">"#,
            r#"<video poster="/poster.jpg">"#,
            r#"<div data-url="/api/data">"#,
            r#"<use xlink:href="/sprite.svg#icon">"#,
        );
        let out = rewrite_html(body, &ctx);
        assert!(out.contains(r#"<base href="/proxy/plex/">"#));
        assert!(out.contains(r#"action="/proxy/plex/submit""#));
        assert!(out.contains(r#"poster="/proxy/plex/poster.jpg""#));
        assert!(out.contains(r#"data-url="/proxy/plex/api/data""#));
        assert!(out.contains(r##"xlink:href="/proxy/plex/sprite.svg#icon""##));
    }

    #[test]
    fn html_rewrites_srcset_per_candidate() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let out = rewrite_html(r#"<img srcset="/a.jpg 1x, /b.jpg 2x, ./c.jpg 3x">"#, &ctx);
        assert!(
            out.contains(r#"srcset="/proxy/plex/a.jpg 1x, /proxy/plex/b.jpg 2x, ./c.jpg 3x""#),
            "{out}"
        );
    }

    #[test]
    fn html_rewrites_meta_refresh_content() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let out = rewrite_html(r#"<meta http-equiv="refresh" content="5;url=/login">"#, &ctx);
        assert!(out.contains(r#"content="5;url=/proxy/plex/login""#), "{out}");
    }

    #[test]
    fn html_strips_sri_attributes() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let out = rewrite_html(
            r#"<script src="/app.js" integrity="sha384-abc" crossorigin="anonymous"></script>"#,
            &ctx,
        );
        assert!(!out.contains("integrity"));
        assert!(!out.contains("crossorigin"));
        assert!(out.contains(r#"src="/proxy/plex/app.js""#));
    }

    #[test]
    fn html_injects_interceptor_after_head() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let out = rewrite_html("<html><head><title>t</title></head></html>", &ctx);
        let head_at = out.find("<head>").unwrap();
        let script_at = out.find("<script").unwrap();
        let title_at = out.find("<title>").unwrap();
        assert!(head_at < script_at && script_at < title_at);
    }

    #[test]
    fn html_injects_interceptor_at_top_without_head() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let out = rewrite_html("<div>bare fragment</div>", &ctx);
        assert!(out.starts_with("<script"));
    }

    #[test]
    fn html_rewrite_is_idempotent() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let body = concat!(
            r#"<html><head></head><body>"#,
            r#"<a href="/page">x</a>"#,
            r#"<img srcset="/a.jpg 1x, /b.jpg 2x">"#,
            r#"<a href="http://localhost:32400/lib">y</a>"#,
            "</body></html>"
        );
        let once = rewrite_html(body, &ctx);
        let twice = rewrite_html(&once, &ctx);
        assert_eq!(once, twice);
    }

    // ── CSS ──────────────────────────────────────────────────────

    #[test]
    fn css_rewrites_url_and_import() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let body = concat!(
            "body { background: url(/bg.png); }\n",
            ".a { background: url('/a.png'); }\n",
            ".b { background: url(\"/b.png\"); }\n",
            "@import \"/theme.css\";\n",
            "@import url(/extra.css);\n",
            ".rel { background: url(img/rel.png); }\n",
        );
        let out = rewrite_css(body, &ctx);
        assert!(out.contains("url(/proxy/plex/bg.png)"));
        assert!(out.contains("url('/proxy/plex/a.png')"));
        assert!(out.contains("url(\"/proxy/plex/b.png\")"));
        assert!(out.contains("@import \"/proxy/plex/theme.css\""));
        assert!(out.contains("url(/proxy/plex/extra.css)"));
        assert!(out.contains("url(img/rel.png)"), "{out}");
    }

    #[test]
    fn css_rewrite_is_idempotent() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let once = rewrite_css("body { background: url(/bg.png); }", &ctx);
        assert_eq!(once, rewrite_css(&once, &ctx));
    }

    // ── safe-only ────────────────────────────────────────────────

    #[test]
    fn json_keeps_root_relative_paths() {
        let up = upstream();
        let ctx = ctx_for(&up);
        // The photo-transcode case: a proxied path inside a query argument
        // must never be double-prefixed, and bare root-relative paths stay.
        let body = r#"{"thumb":"/photo.jpg?url=/proxy/plex/a.jpg","path":"/library/1"}"#;
        assert_eq!(rewrite_json(body, &ctx), body);
    }

    #[test]
    fn json_rewrites_absolute_upstream_urls() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let body = r#"{"server":"http://localhost:32400/web","other":"http://example.com/x"}"#;
        let out = rewrite_json(body, &ctx);
        assert!(out.contains(r#""server":"/proxy/plex/web""#), "{out}");
        assert!(out.contains(r#""other":"http://example.com/x""#));
    }

    #[test]
    fn json_rewrite_is_idempotent() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let body = r#"{"a":"http://localhost:32400/x","b":"/keep.png"}"#;
        let once = rewrite_json(body, &ctx);
        assert_eq!(once, rewrite_json(&once, &ctx));
    }

    #[test]
    fn origin_boundary_does_not_eat_longer_ports() {
        let up = Url::parse("http://host:80").unwrap();
        let ctx = RewriteCtx::new("app", &up);
        let body = r#""http://host:8080/other""#;
        assert_eq!(rewrite_json(body, &ctx), body);
    }

    #[test]
    fn js_strips_sri_hash_map_and_rewrites_origin() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let body = r#"var sriHashes = {"/js/app.js":"sha384-abc"};fetch("http://localhost:32400/api");fetch("/api/local");"#;
        let out = rewrite_js(body, &ctx);
        assert!(out.contains("sriHashes = {}"));
        assert!(out.contains(r#"fetch("/proxy/plex/api")"#));
        // Root-relative literals stay: too many false positives.
        assert!(out.contains(r#"fetch("/api/local")"#));
    }

    #[test]
    fn xml_safe_only() {
        let up = upstream();
        let ctx = ctx_for(&up);
        let body = r#"<MediaContainer thumb="/t.png" uri="http://localhost:32400/a"/>"#;
        let out = rewrite_xml(body, &ctx);
        assert!(out.contains(r#"thumb="/t.png""#));
        assert!(out.contains(r#"uri="/proxy/plex/a""#));
    }
}
