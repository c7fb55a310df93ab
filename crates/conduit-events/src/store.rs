// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::event::{Event, EventPayload, EventSource};

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event {0} not found")]
    NotFound(u64),
    #[error("observation cause {cause} does not reference a prior action in this stream")]
    DanglingCause { cause: u64 },
    #[error("append attempted out of order: expected id {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// How many events a lagging subscriber may fall behind before it is
/// dropped instead of silently skipping entries it never saw.
pub const SUBSCRIBER_LAG_CAPACITY: usize = 1024;

/// Error delivered to a subscriber that fell behind by more than
/// [`SUBSCRIBER_LAG_CAPACITY`] events and was evicted.
#[derive(Debug, Clone, Copy, Error)]
#[error("subscriber lagged and was evicted; missed {missed} events")]
pub struct SubscriberLagged {
    pub missed: u64,
}

/// Append-only, per-conversation event log.
///
/// Implementations must enforce: monotonic ids starting at 0, immutability
/// after append, and that every `Observation`'s `cause` (when set) names an
/// earlier `Action` id already present in the same stream — except
/// `AgentStateChangedObservation`, which may be controller-sourced with no
/// cause.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, source: EventSource, payload: EventPayload, cause: Option<u64>) -> Result<Event, EventStoreError>;

    /// All events with id > `after` (exclusive), in order.
    async fn events_after(&self, after: u64) -> Result<Vec<Event>, EventStoreError>;

    /// The full event log from genesis, in order. Distinct from
    /// `events_after(0)`, which would exclude event id 0 itself.
    async fn all_events(&self) -> Result<Vec<Event>, EventStoreError>;

    async fn get(&self, id: u64) -> Result<Event, EventStoreError>;

    async fn latest_id(&self) -> Option<u64>;

    /// Subscribe to newly appended events as they happen. The returned
    /// receiver yields `Err(SubscriberLagged)` exactly once if the caller
    /// falls too far behind, after which it resumes with fresh events; a
    /// slow consumer should treat that as a signal to resync via
    /// [`EventStore::events_after`].
    fn subscribe(&self) -> broadcast::Receiver<Result<Event, SubscriberLagged>>;
}

/// In-memory `EventStore`. The sole implementation needed for the core —
/// durable backends (sqlite, file-per-event) plug in behind the same trait
/// without the controller or conversation manager changing.
pub struct InMemoryEventStore {
    events: Mutex<Vec<Event>>,
    tx: broadcast::Sender<Result<Event, SubscriberLagged>>,
}

impl InMemoryEventStore {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_LAG_CAPACITY);
        Arc::new(Self { events: Mutex::new(Vec::new()), tx })
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_LAG_CAPACITY);
        Self { events: Mutex::new(Vec::new()), tx }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, source: EventSource, payload: EventPayload, cause: Option<u64>) -> Result<Event, EventStoreError> {
        let mut events = self.events.lock().await;

        if let (Some(cause_id), EventPayload::Observation(obs)) = (cause, &payload) {
            let is_state_change = matches!(obs, crate::event::Observation::AgentStateChanged { .. });
            if !is_state_change {
                let points_to_action = events.iter().any(|e| e.id == cause_id && e.is_action());
                if !points_to_action {
                    return Err(EventStoreError::DanglingCause { cause: cause_id });
                }
            }
        }

        let id = events.last().map(|e| e.id + 1).unwrap_or(0);
        let event = Event {
            id,
            timestamp: chrono::Utc::now(),
            source,
            cause,
            message: None,
            payload,
        };
        events.push(event.clone());
        // A send error just means no subscribers are currently listening.
        let _ = self.tx.send(Ok(event.clone()));
        Ok(event)
    }

    async fn events_after(&self, after: u64) -> Result<Vec<Event>, EventStoreError> {
        let events = self.events.lock().await;
        Ok(events.iter().filter(|e| e.id > after).cloned().collect())
    }

    async fn all_events(&self) -> Result<Vec<Event>, EventStoreError> {
        Ok(self.events.lock().await.clone())
    }

    async fn get(&self, id: u64) -> Result<Event, EventStoreError> {
        let events = self.events.lock().await;
        events.iter().find(|e| e.id == id).cloned().ok_or(EventStoreError::NotFound(id))
    }

    async fn latest_id(&self) -> Option<u64> {
        self.events.lock().await.last().map(|e| e.id)
    }

    fn subscribe(&self) -> broadcast::Receiver<Result<Event, SubscriberLagged>> {
        self.tx.subscribe()
    }
}

/// Drains a `broadcast::Receiver` from an `EventStore::subscribe`, turning
/// the channel's own `Lagged(n)` signal into the store's `SubscriberLagged`
/// so callers see one error type regardless of backend.
pub async fn recv_or_lagged(
    rx: &mut broadcast::Receiver<Result<Event, SubscriberLagged>>,
) -> Option<Result<Event, SubscriberLagged>> {
    match rx.recv().await {
        Ok(item) => Some(item),
        Err(broadcast::error::RecvError::Lagged(missed)) => Some(Err(SubscriberLagged { missed })),
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Observation};

    #[tokio::test]
    async fn append_assigns_monotonic_ids_starting_at_zero() {
        let store = InMemoryEventStore::new();
        let e0 = store
            .append(EventSource::User, EventPayload::Action(Action::Message { text: "hi".into(), images: vec![] }), None)
            .await
            .unwrap();
        let e1 = store
            .append(EventSource::Agent, EventPayload::Observation(Observation::Success), Some(e0.id))
            .await
            .unwrap();
        assert_eq!(e0.id, 0);
        assert_eq!(e1.id, 1);
    }

    #[tokio::test]
    async fn observation_with_dangling_cause_is_rejected() {
        let store = InMemoryEventStore::new();
        let err = store
            .append(EventSource::Environment, EventPayload::Observation(Observation::Success), Some(99))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::DanglingCause { cause: 99 }));
    }

    #[tokio::test]
    async fn agent_state_changed_observation_may_have_no_cause() {
        let store = InMemoryEventStore::new();
        let e = store
            .append(
                EventSource::Environment,
                EventPayload::Observation(Observation::AgentStateChanged {
                    state: crate::event::AgentState::Running,
                    reason: None,
                }),
                None,
            )
            .await
            .unwrap();
        assert_eq!(e.id, 0);
    }

    #[tokio::test]
    async fn events_after_returns_suffix_in_order() {
        let store = InMemoryEventStore::new();
        for i in 0..5u32 {
            store
                .append(EventSource::Agent, EventPayload::Action(Action::AgentThink { thought: i.to_string() }), None)
                .await
                .unwrap();
        }
        let tail = store.events_after(2).await.unwrap();
        let ids: Vec<u64> = tail.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn subscriber_receives_appended_events_live() {
        let store = InMemoryEventStore::new();
        let mut rx = store.subscribe();
        store
            .append(EventSource::User, EventPayload::Action(Action::Message { text: "x".into(), images: vec![] }), None)
            .await
            .unwrap();
        let received = recv_or_lagged(&mut rx).await.unwrap().unwrap();
        assert_eq!(received.id, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_reported_as_lagged_not_silently_skipped() {
        let store = InMemoryEventStore::new();
        let mut rx = store.subscribe();
        for i in 0..(SUBSCRIBER_LAG_CAPACITY + 10) {
            store
                .append(EventSource::Agent, EventPayload::Action(Action::AgentThink { thought: i.to_string() }), None)
                .await
                .unwrap();
        }
        let first = recv_or_lagged(&mut rx).await.unwrap();
        assert!(matches!(first, Err(SubscriberLagged { .. })));
    }

    #[tokio::test]
    async fn all_events_includes_event_zero_unlike_events_after_zero() {
        let store = InMemoryEventStore::new();
        store
            .append(EventSource::User, EventPayload::Action(Action::Message { text: "hi".into(), images: vec![] }), None)
            .await
            .unwrap();
        let all = store.all_events().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 0);

        let after_zero = store.events_after(0).await.unwrap();
        assert!(after_zero.is_empty(), "events_after(0) excludes id 0 by design");
    }

    #[tokio::test]
    async fn get_unknown_id_errors() {
        let store = InMemoryEventStore::new();
        let err = store.get(42).await.unwrap_err();
        assert!(matches!(err, EventStoreError::NotFound(42)));
    }
}
