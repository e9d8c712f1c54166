//! Shared helpers for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use teamboard_core::{InMemoryDocumentStore, LiveUpdate, SyncConfig, SyncLayer};
use teamboard_core::types::{EntityKey, EntityKind};
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once; honors RUST_LOG
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub async fn start_layer(config: SyncConfig) -> (Arc<InMemoryDocumentStore>, SyncLayer) {
    init_tracing();
    let store = Arc::new(InMemoryDocumentStore::new());
    let layer = SyncLayer::start(store.clone(), config).await.unwrap();
    (store, layer)
}

pub fn meeting_key(id: &str) -> EntityKey {
    EntityKey::new(EntityKind::Meeting, id)
}

pub fn meeting_doc(team: &str, owner: &str, created_at: &str) -> Value {
    json!({
        "teamId": team,
        "ownerId": owner,
        "title": format!("Meeting of {}", team),
        "createdAt": created_at,
    })
}

/// Observer that records every update it receives
#[derive(Clone, Default)]
pub struct Recorder {
    updates: Arc<Mutex<Vec<LiveUpdate>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observer(&self) -> impl Fn(&LiveUpdate) + Send + Sync + 'static {
        let updates = Arc::clone(&self.updates);
        move |update: &LiveUpdate| updates.lock().push(update.clone())
    }

    pub fn count(&self) -> usize {
        self.updates.lock().len()
    }

    pub fn updates(&self) -> Vec<LiveUpdate> {
        self.updates.lock().clone()
    }

    pub fn last(&self) -> Option<LiveUpdate> {
        self.updates.lock().last().cloned()
    }
}
