use async_trait::async_trait;

use crate::{EventEnvelope, EventStoreError, Result, SagaId, Version};

/// Options for appending events to a stream.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected current version of the stream for optimistic concurrency.
    /// If None, no version check is performed.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the stream to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the stream not to exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Append-only log of saga events.
///
/// Each saga writes to its own stream. Writers pass the version they last
/// saw; a stale writer gets `ConcurrencyConflict` instead of silently
/// interleaving with another coordinator working the same saga.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream atomically.
    ///
    /// Returns the new version of the stream.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version>;

    /// Retrieves every event of a stream in version order.
    async fn load_stream(&self, stream_id: SagaId) -> Result<Vec<EventEnvelope>>;

    /// Lists the IDs of every stream of the given type, oldest first.
    async fn stream_ids(&self, stream_type: &str) -> Result<Vec<SagaId>>;
}

/// Rejects batches that could not have come from a single well-behaved writer.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty batch".to_string(),
        ));
    };

    for event in events.iter().skip(1) {
        if event.stream_id != first.stream_id {
            return Err(EventStoreError::InvalidAppend(
                "all events must belong to the same stream".to_string(),
            ));
        }
        if event.stream_type != first.stream_type {
            return Err(EventStoreError::InvalidAppend(
                "all events must have the same stream type".to_string(),
            ));
        }
    }

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "event versions must be sequential: expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}
