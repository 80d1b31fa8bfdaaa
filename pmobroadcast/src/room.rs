//! Room collaborator interface
//!
//! The aggregator and the recording service never talk to a transport
//! directly. Everything they need from the chat room (local store lookups,
//! bulk fetch, live feed, decryption notifications, sends) goes through the
//! [`Room`] trait.

use crate::content::{RoomEvent, TimelineEvent};
use crate::ids::{EventId, UserId};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Chunk upload request handed to [`Room::send_chunk`]
#[derive(Clone, Debug)]
pub struct OutgoingChunk {
    /// Local audio file to upload
    pub file: PathBuf,
    pub mime_type: String,
    pub duration_ms: u64,
    pub sequence: u32,
    /// Start event the chunk refers to
    pub broadcast_id: EventId,
    /// Message content without the media reference, filled in after upload
    pub content: Value,
    /// Always 0: a lost chunk is reported, never resent behind the caller's back
    pub max_retries: u32,
}

/// Owned handle on a live feed
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// detaches it; the producer prunes closed subscribers on its next send.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next delivered item, `None` once the producer is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Subscription::recv`]
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}

/// The chat room as seen by the voice broadcast subsystem
///
/// Synchronous methods read the local event store. Asynchronous ones reach
/// the network and may fail; failures are opaque to this crate.
#[async_trait]
pub trait Room: Send + Sync {
    fn room_id(&self) -> &str;

    /// User id of the local session
    fn own_user_id(&self) -> Option<UserId>;

    /// Device id of the local session
    fn own_device_id(&self) -> Option<String>;

    /// Look up an event in the local store
    fn event(&self, event_id: &EventId) -> Option<RoomEvent>;

    /// Latest state event of `event_type` for `state_key`
    fn most_recent_state_event(&self, event_type: &str, state_key: &str) -> Option<RoomEvent>;

    /// Every event referencing `target`, paginated to completion
    async fn fetch_referencing_events(&self, target: &EventId) -> anyhow::Result<Vec<RoomEvent>>;

    /// Live feed of events of the given types, delivered in timeline order
    fn listen(&self, event_types: &[&str]) -> Subscription<TimelineEvent>;

    /// Events that became readable after a late decryption
    fn subscribe_decryptions(&self) -> Subscription<RoomEvent>;

    async fn send_state_event(
        &self,
        event_type: &str,
        content: Value,
        state_key: &str,
    ) -> anyhow::Result<EventId>;

    async fn send_chunk(&self, chunk: OutgoingChunk) -> anyhow::Result<EventId>;
}
