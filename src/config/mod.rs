pub mod store;
mod types;

pub use store::ConfigStore;
pub use types::*;

use crate::error::Error;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "MUXIMUX_CONFIG";
/// Environment variable overriding `server.base_path`.
pub const BASE_PATH_ENV: &str = "MUXIMUX_BASE_PATH";

/// Load configuration from a YAML file.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {:?}", path))?;

    let mut config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {:?}", path))?;

    expand_env(&mut config);
    apply_env_overrides(&mut config);

    validate(&config).map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(config)
}

/// Load config from the given path or the default locations; a missing file
/// yields the built-in defaults.
pub fn load_or_default(custom_path: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = custom_path {
        if path.exists() {
            return Ok((load(path)?, Some(path.to_path_buf())));
        }
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        return Ok((config, Some(path.to_path_buf())));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok((load(&path)?, Some(path.clone())));
        }
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        return Ok((config, Some(path)));
    }

    let default_paths = [
        "./muximux.yml",
        "~/.config/muximux/muximux.yml",
        "/etc/muximux/muximux.yml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return Ok((load(path)?, Some(path.to_path_buf())));
        }
    }

    let mut config = Config::default();
    apply_env_overrides(&mut config);
    Ok((config, Some(PathBuf::from("./muximux.yml"))))
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(base) = std::env::var(BASE_PATH_ENV) {
        config.server.base_path = base;
    }
}

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env ref pattern"));

/// Expand `${VAR}` references in a single string. Unset variables stay
/// literal; a bare `$` is never treated as a reference.
pub fn expand_str(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn expand_opt(value: &mut Option<String>) {
    if let Some(v) = value {
        *v = expand_str(v);
    }
}

/// Expand `${VAR}` references across the config. Secret-bearing fields
/// (`password_hash`, `api_key`, `oidc_client_secret`) are passed through
/// untouched.
pub fn expand_env(config: &mut Config) {
    config.server.listen = expand_str(&config.server.listen);
    config.server.title = expand_str(&config.server.title);
    config.server.base_path = expand_str(&config.server.base_path);
    expand_opt(&mut config.server.tls.domain);
    expand_opt(&mut config.server.tls.email);
    expand_opt(&mut config.server.tls.cert_file);
    expand_opt(&mut config.server.tls.key_file);

    expand_opt(&mut config.auth.username);
    expand_opt(&mut config.auth.oidc_issuer);
    expand_opt(&mut config.auth.oidc_client_id);

    expand_opt(&mut config.navigation.default_app);
    config.icons.directory = expand_str(&config.icons.directory);

    for group in &mut config.groups {
        group.name = expand_str(&group.name);
        expand_opt(&mut group.icon);
    }

    for app in &mut config.apps {
        app.name = expand_str(&app.name);
        app.url = expand_str(&app.url);
        expand_opt(&mut app.health_url);
        expand_opt(&mut app.group);
        expand_opt(&mut app.icon);
    }
}

/// Validate the config invariants. Called at load time and again on every
/// mutation before it is persisted.
pub fn validate(config: &Config) -> Result<(), Error> {
    config
        .server
        .socket_addr()
        .map_err(|e| Error::InvalidInput(e.to_string()))?;

    if config.server.proxy_timeout_secs == 0 {
        return Err(Error::InvalidInput("proxy_timeout_secs must be > 0".into()));
    }
    if config.health.interval_secs == 0 || config.health.timeout_secs == 0 {
        return Err(Error::InvalidInput(
            "health interval and timeout must be > 0".into(),
        ));
    }

    let tls = &config.server.tls;
    if tls.domain.is_some() && tls.email.is_none() {
        return Err(Error::InvalidInput("tls.domain requires tls.email".into()));
    }
    if tls.cert_file.is_some() != tls.key_file.is_some() {
        return Err(Error::InvalidInput(
            "tls.cert_file and tls.key_file must both be set or both be empty".into(),
        ));
    }
    if tls.domain.is_some() && tls.cert_file.is_some() {
        return Err(Error::InvalidInput(
            "tls.domain and tls.cert_file/key_file are mutually exclusive".into(),
        ));
    }

    if config.auth.method == AuthMethod::Basic
        && config.auth.setup_complete
        && (config.auth.username.is_none() || config.auth.password_hash.is_none())
    {
        return Err(Error::InvalidInput(
            "basic auth requires username and password_hash".into(),
        ));
    }

    let mut names = HashSet::new();
    for app in &config.apps {
        if app.name.trim().is_empty() {
            return Err(Error::InvalidInput("app name cannot be empty".into()));
        }
        if !names.insert(app.name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "duplicate app name '{}'",
                app.name
            )));
        }
        match url::Url::parse(&app.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                return Err(Error::InvalidInput(format!(
                    "app '{}' has unsupported url scheme '{}'",
                    app.name,
                    parsed.scheme()
                )));
            }
            Err(e) => {
                return Err(Error::InvalidInput(format!(
                    "app '{}' has invalid url: {e}",
                    app.name
                )));
            }
        }
    }

    let mut slugs = HashSet::new();
    for app in config.apps.iter().filter(|a| a.enabled && a.proxy) {
        let slug = app.slug();
        if slug.is_empty() {
            return Err(Error::InvalidInput(format!(
                "app '{}' produces an empty slug",
                app.name
            )));
        }
        if !slugs.insert(slug.clone()) {
            return Err(Error::InvalidInput(format!(
                "slug '{slug}' is shared by more than one enabled proxied app"
            )));
        }
    }

    let mut group_names = HashSet::new();
    for group in &config.groups {
        if !group_names.insert(group.name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "duplicate group name '{}'",
                group.name
            )));
        }
    }

    Ok(())
}
