//! Single-owner record store
//!
//! Each map of records lives inside its own task. Callers talk to it over an
//! unbounded channel, so every mutation and every listener call happens on
//! that one task no matter how many radio callbacks are in flight.

use crate::types::Record;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Called with the full snapshot, newest first, after every change
///
/// A listener that panics is logged and skipped; the store keeps running.
pub type Listener<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

enum Command<T> {
    Upsert {
        record: T,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<T>>,
    },
    Subscribe(Listener<T>),
}

/// Handle to a record store task
pub struct RecordStore<T> {
    name: &'static str,
    commands: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for RecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            commands: self.commands.clone(),
        }
    }
}

impl<T: Record> RecordStore<T> {
    /// Spawn the owning task; it ends once every handle is dropped
    pub fn spawn(name: &'static str) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(name, rx));
        Self { name, commands }
    }

    /// Insert or replace by key
    ///
    /// Returns `true` if the map changed. An incoming record replaces the
    /// stored one only if it is at least as new.
    pub async fn upsert(&self, record: T) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Upsert { record, reply }).is_err() {
            warn!(store = self.name, "Record store stopped, dropping upsert");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// All stored records, newest first
    pub async fn snapshot(&self) -> Vec<T> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        if self.commands.send(Command::Subscribe(Arc::new(listener))).is_err() {
            warn!(store = self.name, "Record store stopped, listener not registered");
        }
    }
}

fn notify<T>(name: &'static str, listeners: &[Listener<T>], snapshot: &[T]) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
            warn!(store = name, "Listener panicked, continuing");
        }
    }
}

fn newest_first<T: Record>(records: &HashMap<String, T>) -> Vec<T> {
    let mut snapshot: Vec<T> = records.values().cloned().collect();
    snapshot.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
    snapshot
}

async fn run<T: Record>(name: &'static str, mut commands: mpsc::UnboundedReceiver<Command<T>>) {
    let mut records: HashMap<String, T> = HashMap::new();
    let mut listeners: Vec<Listener<T>> = Vec::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Upsert { record, reply } => {
                let changed = match records.get(record.key()) {
                    Some(existing) if existing.timestamp() > record.timestamp() => false,
                    Some(existing) if *existing == record => false,
                    _ => true,
                };

                if changed {
                    debug!(store = name, key = record.key(), "Record stored");
                    records.insert(record.key().to_string(), record);

                    notify(name, &listeners, &newest_first(&records));
                }
                let _ = reply.send(changed);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(newest_first(&records));
            }
            Command::Subscribe(listener) => listeners.push(listener),
        }
    }

    debug!(store = name, "Record store stopped");
}
