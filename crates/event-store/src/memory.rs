use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, EventStoreError, Result, SagaId, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// In-memory saga log.
///
/// Behaves like the PostgreSQL store, including version conflicts, so the
/// coordinator can be exercised without a database.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    fn current_version(events: &[EventEnvelope], stream_id: SagaId) -> Version {
        events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(Version::initial())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let stream_id = events[0].stream_id;
        let first_new_version = events[0].version;

        let mut store = self.events.write().await;
        let current_version = Self::current_version(&store, stream_id);

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected,
                actual: current_version,
            });
        }

        // Same guarantee as the (stream_id, version) unique constraint.
        if first_new_version != current_version.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(current_version);
        store.extend(events);

        Ok(last_version)
    }

    async fn load_stream(&self, stream_id: SagaId) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        let mut events: Vec<_> = store
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn stream_ids(&self, stream_type: &str) -> Result<Vec<SagaId>> {
        let store = self.events.read().await;
        let mut ids = Vec::new();
        // Insertion order is append order, so the first sighting is the oldest.
        for event in store.iter().filter(|e| e.stream_type == stream_type) {
            if !ids.contains(&event.stream_id) {
                ids.push(event.stream_id);
            }
        }
        Ok(ids)
    }
}
