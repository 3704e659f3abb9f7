//! Handler registration state.
//!
//! Mutated only by explicit write-code/reload operations; the writer mutex
//! serializes those, while concurrent invocations read a fully-old or
//! fully-new registration, never a torn one. A failed load always lands in
//! `Unloaded` so stale code can never be served after a bad write.

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone)]
pub enum HandlerState {
    Unloaded {
        error: Option<String>,
    },
    Loaded {
        handler: String,
        loaded_at: DateTime<Utc>,
    },
}

impl HandlerState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, HandlerState::Loaded { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            HandlerState::Unloaded { error } => error.as_deref(),
            HandlerState::Loaded { .. } => None,
        }
    }
}

pub struct HandlerRegistry {
    state: RwLock<HandlerState>,
    // Most recent handler name a load was attempted for, kept even when the
    // load failed so a reload retries the same name.
    requested: RwLock<Option<String>>,
    writer: Mutex<()>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HandlerState::Unloaded { error: None }),
            requested: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    /// Taken for the full duration of a write-code or reload operation.
    pub async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub async fn note_requested(&self, handler: &str) {
        *self.requested.write().await = Some(handler.to_string());
    }

    pub async fn requested_handler(&self) -> Option<String> {
        self.requested.read().await.clone()
    }

    pub async fn mark_loaded(&self, handler: &str) {
        *self.state.write().await = HandlerState::Loaded {
            handler: handler.to_string(),
            loaded_at: Utc::now(),
        };
    }

    pub async fn mark_unloaded(&self, error: String) {
        *self.state.write().await = HandlerState::Unloaded { error: Some(error) };
    }

    pub async fn snapshot(&self) -> HandlerState {
        self.state.read().await.clone()
    }
}
