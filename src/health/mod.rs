//! Concurrent upstream health monitor.
//!
//! One ticker task sweeps the monitored set at the configured interval,
//! firing one check task per eligible app. Status, response time and
//! uptime counters live behind a single lock; the change callback runs
//! outside it, exactly once per status transition (including the first
//! `unknown -> healthy/unhealthy`).

use crate::config::{App, HealthConfig};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppHealth {
    pub name: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub check_count: u64,
    pub success_count: u64,
    pub uptime_percent: f64,
}

impl AppHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unknown,
            response_time_ms: 0,
            last_check: None,
            last_error: None,
            check_count: 0,
            success_count: 0,
            uptime_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Target {
    name: String,
    url: String,
    /// Included in the periodic sweep (enabled and not opted out).
    swept: bool,
}

type ChangeCallback = Arc<dyn Fn(AppHealth) + Send + Sync>;

pub struct HealthMonitor {
    client: reqwest::Client,
    interval: Duration,
    targets: RwLock<Vec<Target>>,
    health: RwLock<HashMap<String, AppHealth>>,
    callback: RwLock<Option<ChangeCallback>>,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> anyhow::Result<Arc<Self>> {
        // Follow up to 3 redirects, then keep the last response.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::custom(|attempt| {
                if attempt.previous().len() >= 3 {
                    attempt.stop()
                } else {
                    attempt.follow()
                }
            }))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build health client: {e}"))?;

        Ok(Arc::new(Self {
            client,
            interval: Duration::from_secs(config.interval_secs),
            targets: RwLock::new(Vec::new()),
            health: RwLock::new(HashMap::new()),
            callback: RwLock::new(None),
            ticker: Mutex::new(None),
        }))
    }

    /// Replace the monitored set. Health state is retained for apps that
    /// survive, dropped for removed ones, and seeded `unknown` for new
    /// ones.
    pub fn set_apps(&self, apps: &[App]) {
        let targets: Vec<Target> = apps
            .iter()
            .map(|app| Target {
                name: app.name.clone(),
                url: app.health_url.clone().unwrap_or_else(|| app.url.clone()),
                swept: app.enabled && app.health_check,
            })
            .collect();

        let names: HashSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();

        {
            let mut health = self.health.write();
            health.retain(|name, _| names.contains(name.as_str()));
            for target in &targets {
                health
                    .entry(target.name.clone())
                    .or_insert_with(|| AppHealth::new(&target.name));
            }
        }

        *self.targets.write() = targets;
    }

    /// Launch the periodic sweep. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.ticker.lock();
        if guard.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut checks = tokio::task::JoinSet::new();
            loop {
                tick.tick().await;
                while checks.try_join_next().is_some() {}
                let targets: Vec<Target> = monitor
                    .targets
                    .read()
                    .iter()
                    .filter(|t| t.swept)
                    .cloned()
                    .collect();
                tracing::debug!(apps = targets.len(), "health sweep");
                for target in targets {
                    let monitor = Arc::clone(&monitor);
                    checks.spawn(async move {
                        monitor.run_check(&target).await;
                    });
                }
            }
        });
        *guard = Some(handle);
    }

    /// Stop the ticker; in-flight checks are cancelled with it.
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }

    /// On-demand check, bypassing the ticker. Works for apps excluded
    /// from the periodic sweep too.
    pub async fn check_now(&self, name: &str) -> Result<AppHealth> {
        let target = self
            .targets
            .read()
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("app '{name}'")))?;
        self.run_check(&target).await;
        self.get_health(name)
            .ok_or_else(|| Error::NotFound(format!("app '{name}'")))
    }

    pub fn get_health(&self, name: &str) -> Option<AppHealth> {
        self.health.read().get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<AppHealth> {
        let mut all: Vec<AppHealth> = self.health.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Register the transition callback. Invoked outside the health lock.
    pub fn set_change_callback<F>(&self, callback: F)
    where
        F: Fn(AppHealth) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    async fn run_check(&self, target: &Target) {
        let started = Instant::now();
        let outcome = self.client.get(&target.url).send().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (ok, error) = match outcome {
            Ok(resp) if resp.status().as_u16() < 400 => (true, None),
            Ok(resp) => (false, Some(format!("status {}", resp.status().as_u16()))),
            Err(e) => (false, Some(e.to_string())),
        };

        self.record_result(&target.name, ok, elapsed_ms, error);
    }

    /// Fold one check result into the health map and dispatch the change
    /// callback when the status flipped.
    fn record_result(&self, name: &str, ok: bool, elapsed_ms: u64, error: Option<String>) {
        let transition = {
            let mut health = self.health.write();
            let entry = health
                .entry(name.to_string())
                .or_insert_with(|| AppHealth::new(name));
            let previous = entry.status;
            entry.status = if ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            entry.response_time_ms = elapsed_ms;
            entry.last_check = Some(Utc::now());
            entry.last_error = error;
            entry.check_count += 1;
            if ok {
                entry.success_count += 1;
            }
            entry.uptime_percent = (entry.success_count as f64 / entry.check_count as f64) * 100.0;
            (previous != entry.status).then(|| entry.clone())
        };

        if let Some(changed) = transition {
            tracing::info!(app = %changed.name, status = ?changed.status, "health transition");
            let callback = self.callback.read().clone();
            if let Some(callback) = callback {
                callback(changed);
            }
        }
    }
}
