//! Operation handle shared between the orchestrator and the drivers.
//!
//! Carries progress metadata, the cooperative cancellation signal and the
//! terminal state of the migration.

use crate::error::{MigrationError, Result};
use indicatif::HumanBytes;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Metadata key used for filesystem transfer progress
pub const FS_PROGRESS: &str = "fs_progress";

/// Minimum interval between progress metadata updates
const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Success,
    Failure(String),
    Cancelled,
}

#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

struct OperationInner {
    id: String,
    cancel: watch::Sender<bool>,
    metadata: Mutex<Map<String, Value>>,
    state: Mutex<OperationState>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Operation {
    pub fn new(id: impl Into<String>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(OperationInner {
                id: id.into(),
                cancel,
                metadata: Mutex::new(Map::new()),
                state: Mutex::new(OperationState::Running),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Request cancellation. In-flight transfers observe it at their next
    /// suspension point.
    pub fn cancel(&self) {
        self.inner.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Return `Cancelled` if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MigrationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.cancel.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as self
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn update_metadata(&self, key: &str, value: Value) {
        if let Ok(mut metadata) = self.inner.metadata.lock() {
            metadata.insert(key.to_string(), value);
        }
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.inner
            .metadata
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Create a progress tracker publishing under `key`, labelled with `name`.
    pub fn progress(&self, key: &str, name: &str) -> ProgressTracker {
        ProgressTracker {
            op: self.clone(),
            key: key.to_string(),
            name: name.to_string(),
            bytes: 0,
            started: Instant::now(),
            last_publish: None,
        }
    }

    /// Resolve the operation from the session outcome.
    pub fn finish(&self, result: &Result<()>) {
        let state = match result {
            Ok(()) => OperationState::Success,
            Err(MigrationError::Cancelled) => OperationState::Cancelled,
            Err(e) => OperationState::Failure(e.to_string()),
        };
        if let Ok(mut current) = self.inner.state.lock() {
            if *current == OperationState::Running {
                *current = state;
            }
        }
    }

    pub fn state(&self) -> OperationState {
        self.inner
            .state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(OperationState::Running)
    }
}

/// Byte counter publishing `"<name>: <bytes> (<rate>/s)"` into the operation
/// metadata.
pub struct ProgressTracker {
    op: Operation,
    key: String,
    name: String,
    bytes: u64,
    started: Instant,
    last_publish: Option<Instant>,
}

impl ProgressTracker {
    pub fn add(&mut self, n: u64) {
        self.bytes += n;
        let now = Instant::now();
        let due = self
            .last_publish
            .map_or(true, |last| now.duration_since(last) >= PUBLISH_INTERVAL);
        if due {
            self.publish(now);
        }
    }

    pub fn total(&self) -> u64 {
        self.bytes
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Publish the final counter regardless of the rate limit on updates.
    pub fn finish(&mut self) {
        self.publish(Instant::now());
    }

    fn publish(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.started).as_secs_f64();
        let rate = if elapsed > 0.0 {
            (self.bytes as f64 / elapsed) as u64
        } else {
            self.bytes
        };
        let text = format!(
            "{}: {} ({}/s)",
            self.name,
            HumanBytes(self.bytes),
            HumanBytes(rate)
        );
        self.op.update_metadata(&self.key, Value::String(text));
        self.last_publish = Some(now);
    }
}
