//! In-memory [`Room`] used by the demo and the tests
//!
//! Keeps an event store, the current state events per `(type, state_key)`,
//! live listeners and decryption subscribers. Every outgoing send is recorded
//! so callers can check what reached the "network".

use crate::content::{Direction, RoomEvent, TimelineEvent, ROOM_MESSAGE_EVENT_TYPE};
use crate::ids::{EventId, UserId};
use crate::room::{OutgoingChunk, Room, Subscription};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

/// A state event as sent through [`Room::send_state_event`]
#[derive(Clone, Debug, PartialEq)]
pub struct SentStateEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

struct Listener {
    event_types: Vec<String>,
    tx: mpsc::UnboundedSender<TimelineEvent>,
}

#[derive(Default)]
struct MemoryRoomState {
    events: HashMap<EventId, RoomEvent>,
    timeline: Vec<EventId>,
    state_events: HashMap<(String, String), EventId>,
    listeners: Vec<Listener>,
    decryption_subscribers: Vec<mpsc::UnboundedSender<RoomEvent>>,
    sent_state_events: Vec<SentStateEvent>,
    sent_chunks: Vec<OutgoingChunk>,
    fetch_failures: Vec<String>,
    send_failures: Vec<String>,
    fetch_count: usize,
    fetch_gate: Option<Arc<Semaphore>>,
}

/// In-memory room
///
/// # Example
///
/// ```
/// use pmobroadcast::{BroadcastService, MemoryRoom, UserId};
/// use pmobroadcast::config::BroadcastConfig;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let room = Arc::new(MemoryRoom::new("!room", Some(UserId::new("@alice:local")), None));
/// let service = BroadcastService::new(room.clone(), BroadcastConfig::default());
/// service.start_broadcast().await.unwrap();
///
/// assert_eq!(room.sent_state_events().len(), 1);
/// # });
/// ```
pub struct MemoryRoom {
    room_id: String,
    own_user_id: Option<UserId>,
    own_device_id: Option<String>,
    state: Mutex<MemoryRoomState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRoom {
    pub fn new(room_id: &str, own_user_id: Option<UserId>, own_device_id: Option<&str>) -> Self {
        Self {
            room_id: room_id.to_string(),
            own_user_id,
            own_device_id: own_device_id.map(str::to_string),
            state: Mutex::new(MemoryRoomState::default()),
        }
    }

    /// Store an event without delivering it to listeners (history)
    pub fn insert(&self, event: RoomEvent) {
        let mut state = lock(&self.state);
        Self::store(&mut state, event);
    }

    /// Store an event and deliver it to matching live listeners
    pub fn deliver(&self, event: RoomEvent) {
        let mut state = lock(&self.state);
        Self::store(&mut state, event.clone());
        state.listeners.retain(|listener| {
            if !listener.event_types.iter().any(|t| t == &event.event_type) {
                return !listener.tx.is_closed();
            }
            listener
                .tx
                .send(TimelineEvent {
                    event: event.clone(),
                    direction: Direction::Forwards,
                })
                .is_ok()
        });
    }

    /// Replace a stored event by its decrypted form and notify subscribers
    pub fn decrypt(&self, event: RoomEvent) {
        let mut state = lock(&self.state);
        Self::store(&mut state, event.clone());
        state
            .decryption_subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Make the next bulk fetch fail with `message`
    pub fn fail_next_fetch(&self, message: &str) {
        lock(&self.state).fetch_failures.push(message.to_string());
    }

    /// Make the next send (state event or chunk) fail with `message`
    pub fn fail_next_send(&self, message: &str) {
        lock(&self.state).send_failures.push(message.to_string());
    }

    /// Hold bulk fetches until permits are added to the returned semaphore
    pub fn gate_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        lock(&self.state).fetch_gate = Some(gate.clone());
        gate
    }

    pub fn sent_state_events(&self) -> Vec<SentStateEvent> {
        lock(&self.state).sent_state_events.clone()
    }

    pub fn sent_chunks(&self) -> Vec<OutgoingChunk> {
        lock(&self.state).sent_chunks.clone()
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.state).fetch_count
    }

    /// Number of live listeners still attached
    pub fn listener_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.listeners.retain(|l| !l.tx.is_closed());
        state.listeners.len()
    }

    pub fn decryption_subscriber_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.decryption_subscribers.retain(|tx| !tx.is_closed());
        state.decryption_subscribers.len()
    }

    fn store(state: &mut MemoryRoomState, event: RoomEvent) {
        if let Some(state_key) = &event.state_key {
            state.state_events.insert(
                (event.event_type.clone(), state_key.clone()),
                event.event_id.clone(),
            );
        }
        if !state.events.contains_key(&event.event_id) {
            state.timeline.push(event.event_id.clone());
        }
        state.events.insert(event.event_id.clone(), event);
    }

    fn next_event_id() -> EventId {
        EventId(format!("${}", uuid::Uuid::new_v4().simple()))
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    fn take_send_failure(&self) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.send_failures.is_empty() {
            return Ok(());
        }
        Err(anyhow!(state.send_failures.remove(0)))
    }
}

#[async_trait]
impl Room for MemoryRoom {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn own_user_id(&self) -> Option<UserId> {
        self.own_user_id.clone()
    }

    fn own_device_id(&self) -> Option<String> {
        self.own_device_id.clone()
    }

    fn event(&self, event_id: &EventId) -> Option<RoomEvent> {
        lock(&self.state).events.get(event_id).cloned()
    }

    fn most_recent_state_event(&self, event_type: &str, state_key: &str) -> Option<RoomEvent> {
        let state = lock(&self.state);
        let event_id = state
            .state_events
            .get(&(event_type.to_string(), state_key.to_string()))?;
        state.events.get(event_id).cloned()
    }

    async fn fetch_referencing_events(&self, target: &EventId) -> anyhow::Result<Vec<RoomEvent>> {
        let gate = {
            let mut state = lock(&self.state);
            state.fetch_count += 1;
            state.fetch_gate.clone()
        };
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }

        let state = lock(&self.state);
        if !state.fetch_failures.is_empty() {
            let mut state = state;
            return Err(anyhow!(state.fetch_failures.remove(0)));
        }

        let events: Vec<RoomEvent> = state
            .timeline
            .iter()
            .filter_map(|id| state.events.get(id))
            .filter(|event| event.is_reference_to(target))
            .cloned()
            .collect();
        debug!(target = %target, count = events.len(), "Fetched referencing events");
        Ok(events)
    }

    fn listen(&self, event_types: &[&str]) -> Subscription<TimelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).listeners.push(Listener {
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            tx,
        });
        Subscription::new(rx)
    }

    fn subscribe_decryptions(&self) -> Subscription<RoomEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).decryption_subscribers.push(tx);
        Subscription::new(rx)
    }

    async fn send_state_event(
        &self,
        event_type: &str,
        content: Value,
        state_key: &str,
    ) -> anyhow::Result<EventId> {
        self.take_send_failure()?;

        let event_id = Self::next_event_id();
        let event = RoomEvent {
            event_id: event_id.clone(),
            event_type: event_type.to_string(),
            sender: self.own_user_id.clone(),
            state_key: Some(state_key.to_string()),
            origin_server_ts: Self::now_ms(),
            content: content.clone(),
            decryption_error: None,
        };

        lock(&self.state).sent_state_events.push(SentStateEvent {
            event_id: event_id.clone(),
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            content,
        });
        self.deliver(event);
        Ok(event_id)
    }

    async fn send_chunk(&self, chunk: OutgoingChunk) -> anyhow::Result<EventId> {
        self.take_send_failure()?;

        let event_id = Self::next_event_id();
        let mut content = chunk.content.clone();
        content["url"] = json!(format!("mxc://{}/{}", self.room_id, event_id.as_str().trim_start_matches('$')));
        let event = RoomEvent {
            event_id: event_id.clone(),
            event_type: ROOM_MESSAGE_EVENT_TYPE.to_string(),
            sender: self.own_user_id.clone(),
            state_key: None,
            origin_server_ts: Self::now_ms(),
            content,
            decryption_error: None,
        };

        lock(&self.state).sent_chunks.push(chunk);
        self.deliver(event);
        Ok(event_id)
    }
}
