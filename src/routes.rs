//! Slug → upstream route table.
//!
//! Rebuilt from the app list on every config change; lookups are lock-free
//! against a frozen map swapped in atomically, so in-flight requests keep
//! the table they started with.

use crate::config::App;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone)]
pub struct Route {
    pub slug: String,
    pub upstream: Url,
    pub name: String,
    /// Per-app override of the proxy deadline.
    pub timeout_secs: Option<u64>,
}

pub struct RouteTable {
    table: ArcSwap<HashMap<String, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Atomically replace the table from the app list. Apps that are
    /// disabled, not proxied, or carry an unparseable upstream URL are
    /// skipped with a warning. On a slug collision the first occurrence
    /// wins (config order is stable).
    pub fn rebuild(&self, apps: &[App]) {
        let mut table = HashMap::with_capacity(apps.len());

        for app in apps {
            if !app.enabled || !app.proxy {
                continue;
            }
            let slug = app.slug();
            let upstream = match Url::parse(&app.url) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(app = %app.name, url = %app.url, error = %e,
                        "skipping route with invalid upstream url");
                    continue;
                }
            };
            if table.contains_key(&slug) {
                tracing::warn!(app = %app.name, slug = %slug,
                    "slug collision, keeping first occurrence");
                continue;
            }
            table.insert(
                slug.clone(),
                Route {
                    slug,
                    upstream,
                    name: app.name.clone(),
                    timeout_secs: app.proxy_timeout_secs,
                },
            );
        }

        tracing::debug!(routes = table.len(), "route table rebuilt");
        self.table.store(Arc::new(table));
    }

    pub fn get(&self, slug: &str) -> Option<Route> {
        self.table.load().get(slug).cloned()
    }

    /// Match the path remainder after `/proxy/`. The first segment is the
    /// slug; the rest (always `/`-prefixed or empty) is forwarded upstream.
    pub fn match_path<'a>(&self, path: &'a str) -> Option<(Route, &'a str)> {
        let (slug, rest) = match path.find('/') {
            Some(idx) => (&path[..idx], &path[idx..]),
            None => (path, ""),
        };
        self.get(slug).map(|route| (route, rest))
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
