//! Voice broadcast aggregator
//!
//! Rebuilds the model of one broadcast from the room: a bulk fetch of the
//! events referencing the start event, then the live feed and late
//! decryptions. Every change produces a new [`Broadcast`] snapshot.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start()--> Starting --fetch ok--> Loaded
//!                            \--fetch err-> Error
//! ```
//!
//! # Concurrency
//!
//! All mutable state sits behind one mutex. Live deliveries are drained by a
//! single spawned task, one at a time. Signals are queued while the state lock
//! is held and delivered after it is released, in mutation order, so an
//! observer may query the aggregator from its callbacks.

use crate::builder::{self, BroadcastStart};
use crate::chunk::{Broadcast, Chunk};
use crate::config::BroadcastConfig;
use crate::content::{
    BroadcastInfo, BroadcastState, RoomEvent, BROADCAST_INFO_EVENT_TYPE, ROOM_MESSAGE_EVENT_TYPE,
};
use crate::error::{Error, Result};
use crate::ids::{EventId, UserId};
use crate::room::Room;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bootstrap lifecycle of an aggregator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    Starting,
    Loaded,
    Error,
}

/// Signals published by an aggregator
#[derive(Clone, Debug)]
pub enum AggregatorEvent {
    LoadingStarted,
    LoadingEnded,
    Failed(Arc<Error>),
    /// Emitted once per accepted chunk event, in acceptance order
    ChunkReceived(Chunk),
    StateReceived(BroadcastState),
    BroadcastUpdated(Arc<Broadcast>),
    UndecryptableEventsUpdated(Vec<RoomEvent>),
}

/// Observer of an aggregator
///
/// Held weakly in a single slot. Observers must not block.
pub trait AggregatorObserver: Send + Sync {
    fn loading_started(&self) {}
    fn loading_ended(&self) {}
    fn failed(&self, _error: &Error) {}
    fn chunk_received(&self, _chunk: &Chunk) {}
    fn state_received(&self, _state: BroadcastState) {}
    fn broadcast_updated(&self, _broadcast: &Broadcast) {}
    fn undecryptable_events_updated(&self, _events: &[RoomEvent]) {}
}

struct AggregatorState {
    launch_state: LaunchState,
    /// Accepted chunk events, in acceptance order
    events: Vec<RoomEvent>,
    undecryptable: HashMap<EventId, RoomEvent>,
    broadcast: Arc<Broadcast>,
    broadcast_state: BroadcastState,
    last_chunk_sequence: u32,
}

impl AggregatorState {
    fn undecryptable_events(&self) -> Vec<RoomEvent> {
        let mut events: Vec<RoomEvent> = self.undecryptable.values().cloned().collect();
        events.sort_by(|a, b| {
            (a.origin_server_ts, &a.event_id).cmp(&(b.origin_server_ts, &b.event_id))
        });
        events
    }

    fn is_accepted(&self, event_id: &EventId) -> bool {
        self.events.iter().any(|e| &e.event_id == event_id)
    }
}

#[derive(Default)]
struct SignalQueue {
    pending: VecDeque<AggregatorEvent>,
    draining: bool,
}

struct Inner {
    room: Arc<dyn Room>,
    start: BroadcastStart,
    current_user_id: UserId,
    state: Mutex<AggregatorState>,
    signals: Mutex<SignalQueue>,
    observer: Mutex<Option<Weak<dyn AggregatorObserver>>>,
    event_tx: broadcast::Sender<AggregatorEvent>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Aggregates the chunks and state of one voice broadcast
pub struct Aggregator {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Aggregator {
    /// Create an aggregator for the broadcast started by `start_event_id`
    ///
    /// Fails with [`Error::InvalidStartEvent`] if the event is not in the
    /// local store, does not decode as broadcast info, or has no sender.
    pub fn new(
        room: Arc<dyn Room>,
        start_event_id: EventId,
        initial_state: BroadcastState,
    ) -> Result<Self> {
        Self::with_config(room, start_event_id, initial_state, &BroadcastConfig::default())
    }

    pub fn with_config(
        room: Arc<dyn Room>,
        start_event_id: EventId,
        initial_state: BroadcastState,
        config: &BroadcastConfig,
    ) -> Result<Self> {
        let start = room
            .event(&start_event_id)
            .as_ref()
            .and_then(BroadcastStart::from_event)
            .ok_or_else(|| Error::InvalidStartEvent(start_event_id.clone()))?;

        let current_user_id = room.own_user_id().unwrap_or_else(|| UserId::new(""));
        let broadcast = Arc::new(builder::build(&start, &[], &current_user_id));
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);

        debug!(
            broadcast = %start.event_id,
            sender = %start.sender,
            room = room.room_id(),
            "Voice broadcast aggregator created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                room,
                start,
                current_user_id,
                state: Mutex::new(AggregatorState {
                    launch_state: LaunchState::Idle,
                    events: Vec::new(),
                    undecryptable: HashMap::new(),
                    broadcast,
                    broadcast_state: initial_state,
                    last_chunk_sequence: 0,
                }),
                signals: Mutex::new(SignalQueue::default()),
                observer: Mutex::new(None),
                event_tx,
                cancel: CancellationToken::new(),
                listener: Mutex::new(None),
            }),
        })
    }

    /// Load the broadcast and attach to the live feed
    ///
    /// No-op unless the aggregator is idle. A fetch failure leaves the
    /// aggregator in [`LaunchState::Error`] and is reported to observers; a
    /// fetch completing after [`Aggregator::stop`] is discarded.
    pub async fn start(&self) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if state.launch_state != LaunchState::Idle || inner.cancel.is_cancelled() {
                debug!(broadcast = %inner.start.event_id, "Aggregator already started");
                return;
            }
            state.launch_state = LaunchState::Starting;
            inner.publish(state, vec![AggregatorEvent::LoadingStarted]);
        }

        info!(broadcast = %inner.start.event_id, "Loading voice broadcast");
        let fetched = inner
            .room
            .fetch_referencing_events(&inner.start.event_id)
            .await;

        if inner.cancel.is_cancelled() {
            debug!(
                broadcast = %inner.start.event_id,
                "Aggregator stopped during bulk fetch, discarding result"
            );
            return;
        }

        let fetched = match fetched {
            Ok(events) => events,
            Err(err) => {
                warn!(broadcast = %inner.start.event_id, "Voice broadcast fetch failed: {err:#}");
                let mut state = lock(&inner.state);
                state.launch_state = LaunchState::Error;
                inner.publish(state, vec![AggregatorEvent::Failed(Arc::new(Error::Room(err)))]);
                return;
            }
        };

        let (accepted, undecryptable) = inner.partition(fetched);

        let mut state = lock(&inner.state);
        // Listener registered under the lock: live events wait for the bulk load
        inner.spawn_listener();

        // Events handled while the fetch was in flight are already in the state:
        // an event ends up either accepted or undecryptable, never both
        let mut signals = Vec::new();
        let mut undecryptable_changed = false;
        for event in accepted {
            if state.is_accepted(&event.event_id) {
                continue;
            }
            let Some(chunk) = builder::build_chunk(&event, &inner.start.event_id) else {
                debug!(broadcast = %inner.start.event_id, event = %event.event_id, "Skipping malformed chunk event");
                continue;
            };
            if state.undecryptable.remove(&event.event_id).is_some() {
                undecryptable_changed = true;
            }
            signals.push(AggregatorEvent::ChunkReceived(chunk));
            state.events.push(event);
        }

        for (event_id, event) in undecryptable {
            if state.is_accepted(&event_id) {
                continue;
            }
            if state.undecryptable.insert(event_id, event).is_none() {
                undecryptable_changed = true;
            }
        }

        if undecryptable_changed {
            signals.push(AggregatorEvent::UndecryptableEventsUpdated(
                state.undecryptable_events(),
            ));
        }

        inner.resolve_state(&mut state, &mut signals);
        inner.rebuild(&mut state, &mut signals);

        state.launch_state = LaunchState::Loaded;
        signals.push(AggregatorEvent::LoadingEnded);

        info!(
            broadcast = %inner.start.event_id,
            chunks = state.broadcast.len(),
            undecryptable = state.undecryptable.len(),
            "Voice broadcast loaded"
        );
        inner.publish(state, signals);
    }

    /// Detach from the live feed and decryption notifications
    ///
    /// Idempotent. An in-flight bulk fetch completes into a no-op.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = lock(&self.inner.listener).take() {
            handle.abort();
            debug!(broadcast = %self.inner.start.event_id, "Voice broadcast listener detached");
        }
    }

    /// Process one live timeline event
    ///
    /// Called by the listener task; exposed for hosts that deliver events
    /// themselves.
    pub fn handle_timeline_event(&self, event: &RoomEvent) {
        self.inner.on_timeline_event(event);
    }

    /// Process an event that just became readable
    pub fn handle_decrypted_event(&self, event: &RoomEvent) {
        self.inner.on_decrypted_event(event);
    }

    /// Register the observer, replacing any previous one
    pub fn set_observer<O: AggregatorObserver + 'static>(&self, observer: &Arc<O>) {
        let weak: Weak<O> = Arc::downgrade(observer);
        let weak: Weak<dyn AggregatorObserver> = weak;
        *lock(&self.inner.observer) = Some(weak);
    }

    pub fn clear_observer(&self) {
        *lock(&self.inner.observer) = None;
    }

    /// Receive every signal as an [`AggregatorEvent`]
    pub fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn start_event_id(&self) -> &EventId {
        &self.inner.start.event_id
    }

    /// Author of the broadcast
    pub fn sender(&self) -> &UserId {
        &self.inner.start.sender
    }

    pub fn start_info(&self) -> &BroadcastInfo {
        &self.inner.start.info
    }

    /// Current snapshot
    pub fn broadcast(&self) -> Arc<Broadcast> {
        lock(&self.inner.state).broadcast.clone()
    }

    pub fn launch_state(&self) -> LaunchState {
        lock(&self.inner.state).launch_state
    }

    pub fn broadcast_state(&self) -> BroadcastState {
        lock(&self.inner.state).broadcast_state
    }

    /// Last chunk sequence announced by a `paused` or `stopped` event
    pub fn last_chunk_sequence(&self) -> u32 {
        lock(&self.inner.state).last_chunk_sequence
    }

    pub fn undecryptable_events(&self) -> Vec<RoomEvent> {
        lock(&self.inner.state).undecryptable_events()
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Aggregator")
            .field("broadcast", &self.inner.start.event_id)
            .field("launch_state", &state.launch_state)
            .field("broadcast_state", &state.broadcast_state)
            .field("chunks", &state.broadcast.len())
            .finish()
    }
}

impl Inner {
    /// Split bulk fetch results into chunk events and undecryptable events
    fn partition(&self, fetched: Vec<RoomEvent>) -> (Vec<RoomEvent>, HashMap<EventId, RoomEvent>) {
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        let mut undecryptable = HashMap::new();

        for event in fetched {
            if !seen.insert(event.event_id.clone()) || !event.is_sent_by(&self.start.sender) {
                continue;
            }
            if event.is_undecryptable() {
                undecryptable.insert(event.event_id.clone(), event);
            } else if event.is_room_message() && event.has_chunk_marker() {
                accepted.push(event);
            }
        }

        (accepted, undecryptable)
    }

    fn spawn_listener(self: &Arc<Self>) {
        let mut timeline = self
            .room
            .listen(&[BROADCAST_INFO_EVENT_TYPE, ROOM_MESSAGE_EVENT_TYPE]);
        let mut decryptions = self.room.subscribe_decryptions();
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let broadcast_id = self.start.event_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    delivery = timeline.recv() => {
                        let Some(delivery) = delivery else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_timeline_event(&delivery.event);
                    }
                    decrypted = decryptions.recv() => {
                        let Some(event) = decrypted else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_decrypted_event(&event);
                    }
                }
            }
            debug!(broadcast = %broadcast_id, "Voice broadcast listener stopped");
        });

        *lock(&self.listener) = Some(handle);
    }

    fn on_timeline_event(&self, event: &RoomEvent) {
        let mut state = lock(&self.state);
        let mut signals = Vec::new();
        if event.is_room_message() {
            self.process_message(&mut state, event, &mut signals);
        } else if event.is_broadcast_info() {
            self.resolve_state(&mut state, &mut signals);
        }
        self.publish(state, signals);
    }

    fn on_decrypted_event(&self, event: &RoomEvent) {
        let mut state = lock(&self.state);
        if state.undecryptable.remove(&event.event_id).is_none() {
            return;
        }
        debug!(broadcast = %self.start.event_id, event = %event.event_id, "Undecryptable chunk decrypted");

        let mut signals = vec![AggregatorEvent::UndecryptableEventsUpdated(
            state.undecryptable_events(),
        )];
        self.process_message(&mut state, event, &mut signals);
        self.publish(state, signals);
    }

    fn process_message(
        &self,
        state: &mut AggregatorState,
        event: &RoomEvent,
        signals: &mut Vec<AggregatorEvent>,
    ) {
        let start = &self.start;
        if !event.is_sent_by(&start.sender) || !event.is_reference_to(&start.event_id) {
            return;
        }

        if state.is_accepted(&event.event_id) {
            debug!(broadcast = %start.event_id, event = %event.event_id, "Chunk event already accepted");
            return;
        }

        // Encrypted content hides the chunk marker, the clear relation is enough to park it
        if event.is_undecryptable() {
            if state
                .undecryptable
                .insert(event.event_id.clone(), event.clone())
                .is_none()
            {
                debug!(broadcast = %start.event_id, event = %event.event_id, "Chunk event not decrypted yet");
                signals.push(AggregatorEvent::UndecryptableEventsUpdated(
                    state.undecryptable_events(),
                ));
            }
            return;
        }

        if !event.has_chunk_marker() {
            return;
        }

        let Some(chunk) = builder::build_chunk(event, &start.event_id) else {
            debug!(broadcast = %start.event_id, event = %event.event_id, "Skipping malformed chunk event");
            return;
        };

        if state.undecryptable.remove(&event.event_id).is_some() {
            signals.push(AggregatorEvent::UndecryptableEventsUpdated(
                state.undecryptable_events(),
            ));
        }

        debug!(broadcast = %start.event_id, sequence = chunk.sequence, "Chunk received");
        state.events.push(event.clone());
        signals.push(AggregatorEvent::ChunkReceived(chunk));
        self.rebuild(state, signals);
    }

    /// Take the broadcast state from the author's latest info event
    fn resolve_state(&self, state: &mut AggregatorState, signals: &mut Vec<AggregatorEvent>) {
        let Some(event) = self
            .room
            .most_recent_state_event(BROADCAST_INFO_EVENT_TYPE, self.start.sender.as_str())
        else {
            return;
        };
        let Some(info) = event.broadcast_info() else {
            return;
        };
        if !info.belongs_to(&event.event_id, &self.start.event_id) {
            debug!(
                broadcast = %self.start.event_id,
                event = %event.event_id,
                "Latest broadcast info belongs to another broadcast"
            );
            return;
        }

        if info.state.carries_last_sequence() {
            if let Some(sequence) = info.last_chunk_sequence {
                state.last_chunk_sequence = sequence;
            }
        }
        state.broadcast_state = info.state;
        debug!(broadcast = %self.start.event_id, state = %info.state, "Broadcast state received");
        signals.push(AggregatorEvent::StateReceived(info.state));
    }

    fn rebuild(&self, state: &mut AggregatorState, signals: &mut Vec<AggregatorEvent>) {
        let broadcast = Arc::new(builder::build(
            &self.start,
            &state.events,
            &self.current_user_id,
        ));
        state.broadcast = broadcast.clone();
        signals.push(AggregatorEvent::BroadcastUpdated(broadcast));
    }

    /// Queue `signals` in mutation order, then deliver them without the state lock
    fn publish(&self, state: MutexGuard<'_, AggregatorState>, signals: Vec<AggregatorEvent>) {
        if signals.is_empty() {
            return;
        }
        {
            let mut queue = lock(&self.signals);
            queue.pending.extend(signals);
            drop(state);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = {
                let mut queue = lock(&self.signals);
                match queue.pending.pop_front() {
                    Some(signal) => signal,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.notify(next);
        }
    }

    fn notify(&self, signal: AggregatorEvent) {
        let observer = lock(&self.observer).as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            match &signal {
                AggregatorEvent::LoadingStarted => observer.loading_started(),
                AggregatorEvent::LoadingEnded => observer.loading_ended(),
                AggregatorEvent::Failed(error) => observer.failed(error),
                AggregatorEvent::ChunkReceived(chunk) => observer.chunk_received(chunk),
                AggregatorEvent::StateReceived(state) => observer.state_received(*state),
                AggregatorEvent::BroadcastUpdated(broadcast) => {
                    observer.broadcast_updated(broadcast)
                }
                AggregatorEvent::UndecryptableEventsUpdated(events) => {
                    observer.undecryptable_events_updated(events)
                }
            }
        }
        // Ignoré si aucun abonné
        let _ = self.event_tx.send(signal);
    }
}
