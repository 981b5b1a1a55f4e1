//! Single-owner configuration store.
//!
//! All reads go through [`ConfigStore::snapshot`] and all writes through
//! [`ConfigStore::mutate`]; nothing else touches the live config. A mutation
//! re-validates, persists atomically to disk, and only then notifies
//! subscribers, outside the lock.

use super::{validate, Config};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type ChangeListener = Box<dyn Fn(&Config) + Send + Sync>;

pub struct ConfigStore {
    path: Option<PathBuf>,
    inner: RwLock<Config>,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl ConfigStore {
    pub fn new(config: Config, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path,
            inner: RwLock::new(config),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Read-consistent deep copy, safe to traverse without holding locks.
    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Apply a mutation under the exclusive lock, re-validate, persist,
    /// then fire change listeners with the post-change snapshot.
    ///
    /// Validation or persistence failure rolls the in-memory config back
    /// and listeners are not notified.
    pub fn mutate<F>(&self, f: F) -> Result<Config>
    where
        F: FnOnce(&mut Config) -> Result<()>,
    {
        let after = {
            let mut config = self.inner.write();
            let before = config.clone();

            if let Err(e) = f(&mut config) {
                *config = before;
                return Err(e);
            }

            if let Err(e) = validate(&config) {
                *config = before;
                return Err(e);
            }

            if let Some(ref path) = self.path {
                if let Err(e) = persist(path, &config) {
                    tracing::error!(path = ?path, error = %e, "config persist failed, rolling back");
                    *config = before;
                    return Err(Error::Persist(e.to_string()));
                }
            }

            config.clone()
        };

        for listener in self.listeners.read().iter() {
            listener(&after);
        }

        Ok(after)
    }

    /// Serialize a sanitized copy: secret-bearing fields are stripped from
    /// a deep copy, never from the live config.
    pub fn export(&self) -> Result<Vec<u8>> {
        let mut copy = self.snapshot();
        redact(&mut copy);
        serde_yaml::to_string(&copy)
            .map(String::into_bytes)
            .map_err(|e| Error::Persist(e.to_string()))
    }

    /// Register a callback invoked after every successful mutation.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Config) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(f));
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Strip password hashes, API keys and OIDC client secrets.
pub fn redact(config: &mut Config) {
    config.auth.password_hash = None;
    config.auth.api_key = None;
    config.auth.oidc_client_secret = None;
}

/// Atomic write: serialize to a sibling temp file (mode 0600), then rename
/// over the target.
fn persist(path: &Path, config: &Config) -> anyhow::Result<()> {
    use anyhow::Context;

    let yaml = serde_yaml::to_string(config).context("failed to serialize config")?;

    let tmp = path.with_extension("yml.tmp");
    std::fs::write(&tmp, yaml).with_context(|| format!("failed to write {:?}", tmp))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to chmod {:?}", tmp))?;
    }

    std::fs::rename(&tmp, path).with_context(|| format!("failed to rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}
