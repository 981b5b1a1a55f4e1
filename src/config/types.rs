use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub navigation: NavigationConfig,

    #[serde(default)]
    pub icons: IconsConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub groups: Vec<Group>,

    #[serde(default)]
    pub apps: Vec<App>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind spec, e.g. `:8080` or `127.0.0.1:9000`.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_title")]
    pub title: String,

    /// Optional prefix the whole service is mounted under, e.g. `/dash`.
    #[serde(default)]
    pub base_path: String,

    /// Overall deadline for a proxied request, per app.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl ServerConfig {
    /// Resolve the bind spec into a socket address. A bare `:port` binds
    /// all interfaces.
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let spec = self.listen.trim();
        let full = if spec.starts_with(':') {
            format!("0.0.0.0{spec}")
        } else {
            spec.to_string()
        };
        full.parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {:?}: {}", self.listen, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            title: default_title(),
            base_path: String::new(),
            proxy_timeout_secs: default_proxy_timeout(),
            tls: TlsConfig::default(),
        }
    }
}

fn default_listen() -> String {
    ":8080".to_string()
}
fn default_title() -> String {
    "Muximux".to_string()
}
fn default_proxy_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    /// ACME domain. Requires `email`; mutually exclusive with cert/key files.
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub method: AuthMethod,

    #[serde(default)]
    pub username: Option<String>,

    /// Bcrypt hash of the password (generate with `muximux hash-password`).
    /// Never subject to env-var expansion.
    #[serde(default)]
    pub password_hash: Option<String>,

    /// API key for programmatic access (Authorization: Bearer header).
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub oidc_issuer: Option<String>,

    #[serde(default)]
    pub oidc_client_id: Option<String>,

    #[serde(default)]
    pub oidc_client_secret: Option<String>,

    /// Session timeout in hours (default: 24)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_hours: u64,

    /// Set once the onboarding wizard has run.
    #[serde(default)]
    pub setup_complete: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: AuthMethod::default(),
            username: None,
            password_hash: None,
            api_key: None,
            oidc_issuer: None,
            oidc_client_id: None,
            oidc_client_secret: None,
            session_timeout_hours: default_session_timeout(),
            setup_complete: false,
        }
    }
}

fn default_session_timeout() -> u64 {
    24
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// No authentication; every request acts as a virtual admin.
    #[default]
    None,
    /// Username + bcrypt password with session cookies.
    Basic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NavigationConfig {
    #[serde(default = "default_true")]
    pub show_groups: bool,

    #[serde(default = "default_true")]
    pub show_search: bool,

    /// App opened when the portal loads.
    #[serde(default)]
    pub default_app: Option<String>,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            show_groups: true,
            show_search: true,
            default_app: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IconsConfig {
    /// User-writable directory for cached icon assets.
    #[serde(default = "default_icon_dir")]
    pub directory: String,

    #[serde(default = "default_true")]
    pub allow_remote: bool,
}

impl Default for IconsConfig {
    fn default() -> Self {
        Self {
            directory: default_icon_dir(),
            allow_remote: true,
        }
    }
}

fn default_icon_dir() -> String {
    "icons".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
        }
    }
}

fn default_health_interval() -> u64 {
    30
}
fn default_health_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Group {
    pub name: String,

    #[serde(default)]
    pub order: i32,

    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    /// Unique, case-sensitive primary key.
    pub name: String,

    /// Absolute upstream URL (http/https).
    pub url: String,

    /// Overrides `url` for health probes.
    #[serde(default)]
    pub health_url: Option<String>,

    /// Group reference by name; dangling references are allowed.
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub order: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Serve the app through `/proxy/<slug>/`.
    #[serde(default = "default_true")]
    pub proxy: bool,

    #[serde(default)]
    pub open_mode: OpenMode,

    /// Include in the periodic health sweep.
    #[serde(default = "default_true")]
    pub health_check: bool,

    /// Overrides `server.proxy_timeout_secs` for this app.
    #[serde(default)]
    pub proxy_timeout_secs: Option<u64>,

    #[serde(default)]
    pub icon: Option<String>,

    #[serde(default)]
    pub color: Option<String>,
}

impl App {
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    #[default]
    Iframe,
    NewTab,
    NewWindow,
    Redirect,
}

fn default_true() -> bool {
    true
}

/// Derive the URL-safe identifier for an app name: lowercased, every run of
/// non-alphanumeric characters collapsed into a single `-`, trimmed.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
