//! Process-wide event hub.
//!
//! A single dispatch loop serializes register/broadcast/unregister, which
//! gives the ordering guarantee for free: once a subscription is queued,
//! every later broadcast reaches it, FIFO per client. Each client gets a
//! small bounded queue; a full queue drops the event for that client and
//! bumps a counter — the hub never waits on a slow consumer.

use crate::health::AppHealth;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Per-client delivery queue depth.
pub const CLIENT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    HealthUpdate,
    LogEntry,
    ConfigChange,
}

impl Event {
    pub fn health_update(health: &AppHealth) -> Self {
        Self {
            kind: EventKind::HealthUpdate,
            data: serde_json::to_value(health).unwrap_or(Value::Null),
        }
    }

    pub fn config_change() -> Self {
        Self {
            kind: EventKind::ConfigChange,
            data: json!({ "changed_at": Utc::now() }),
        }
    }

    pub fn log_entry(level: &str, message: &str) -> Self {
        Self {
            kind: EventKind::LogEntry,
            data: json!({ "level": level, "message": message, "time": Utc::now() }),
        }
    }
}

enum Command {
    Register { id: u64, tx: mpsc::Sender<Event> },
    Unregister { id: u64 },
    Broadcast(Event),
}

pub struct EventHub {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    dropped: Arc<AtomicU64>,
}

/// A connected client. Dropping it unregisters from the hub.
pub struct Subscription {
    id: u64,
    pub rx: mpsc::Receiver<Event>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unregister { id: self.id });
    }
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(dispatch(rx, Arc::clone(&dropped)));
        Arc::new(Self {
            commands,
            next_id: AtomicU64::new(1),
            dropped,
        })
    }

    /// Register a client. Broadcasts issued after this returns are
    /// guaranteed to be offered to the new client's queue.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let _ = self.commands.send(Command::Register { id, tx });
        Subscription {
            id,
            rx,
            commands: self.commands.clone(),
        }
    }

    /// Non-blocking fan-out to every client queue.
    pub fn broadcast(&self, event: Event) {
        let _ = self.commands.send(Command::Broadcast(event));
    }

    /// Total events dropped on full client queues.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Command>, dropped: Arc<AtomicU64>) {
    let mut clients: HashMap<u64, mpsc::Sender<Event>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Register { id, tx } => {
                clients.insert(id, tx);
                tracing::debug!(client = id, total = clients.len(), "event client registered");
            }
            Command::Unregister { id } => {
                clients.remove(&id);
                tracing::debug!(client = id, total = clients.len(), "event client unregistered");
            }
            Command::Broadcast(event) => {
                let mut dead = Vec::new();
                for (id, tx) in &clients {
                    match tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(client = id, "event dropped for slow client");
                        }
                        Err(TrySendError::Closed(_)) => dead.push(*id),
                    }
                }
                for id in dead {
                    clients.remove(&id);
                }
            }
        }
    }
}
