#![allow(dead_code)]

use pmobroadcast::content::{
    chunk_message_content, BROADCAST_INFO_EVENT_TYPE, ROOM_MESSAGE_EVENT_TYPE,
};
use pmobroadcast::{
    AggregatorEvent, BroadcastInfo, BroadcastState, EventId, MemoryRoom, RoomEvent, UserId,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;

pub const ALICE: &str = "@alice:example.org";
pub const BOB: &str = "@bob:example.org";
pub const START_ID: &str = "$start";

/// Room seen from `own_user`
pub fn room_as(own_user: &str) -> MemoryRoom {
    MemoryRoom::new("!room:example.org", Some(UserId::new(own_user)), Some("DEVICE"))
}

/// A broadcast info state event sent by `sender`
pub fn info_event(id: &str, sender: &str, info: &BroadcastInfo, ts: u64) -> RoomEvent {
    RoomEvent {
        event_id: EventId::new(id),
        event_type: BROADCAST_INFO_EVENT_TYPE.to_string(),
        sender: Some(UserId::new(sender)),
        state_key: Some(sender.to_string()),
        origin_server_ts: ts,
        content: info.to_content(),
        decryption_error: None,
    }
}

/// The `started` event of the broadcast under test
pub fn start_event(sender: &str) -> RoomEvent {
    let mut info = BroadcastInfo::new(BroadcastState::Started);
    info.chunk_length = Some(120);
    info_event(START_ID, sender, &info, 1_000)
}

/// A later state event of the broadcast under test
pub fn state_event(id: &str, sender: &str, state: BroadcastState, last: Option<u32>) -> RoomEvent {
    let mut info = BroadcastInfo::new(state);
    info.last_chunk_sequence = last;
    info.voice_broadcast_id = Some(EventId::new(START_ID));
    info_event(id, sender, &info, 2_000)
}

/// A readable chunk message
pub fn chunk_event(id: &str, sender: &str, sequence: u32, duration_ms: u64) -> RoomEvent {
    let mut content = chunk_message_content(
        &EventId::new(START_ID),
        sequence,
        duration_ms,
        "audio/ogg",
        "Voice broadcast chunk",
    );
    content["url"] = json!(format!("mxc://example.org/{}", id.trim_start_matches('$')));
    RoomEvent {
        event_id: EventId::new(id),
        event_type: ROOM_MESSAGE_EVENT_TYPE.to_string(),
        sender: Some(UserId::new(sender)),
        state_key: None,
        origin_server_ts: 1_000 + u64::from(sequence),
        content,
        decryption_error: None,
    }
}

/// The same chunk before decryption: only the relation is readable
pub fn encrypted_chunk_event(id: &str, sender: &str, sequence: u32) -> RoomEvent {
    RoomEvent {
        event_id: EventId::new(id),
        event_type: ROOM_MESSAGE_EVENT_TYPE.to_string(),
        sender: Some(UserId::new(sender)),
        state_key: None,
        origin_server_ts: 1_000 + u64::from(sequence),
        content: json!({
            "m.relates_to": { "rel_type": "m.reference", "event_id": START_ID }
        }),
        decryption_error: Some("Unable to decrypt: missing session".to_string()),
    }
}

/// Wait until `check` holds, failing the test after one second
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Every signal already published on `rx`
pub fn drain(rx: &mut broadcast::Receiver<AggregatorEvent>) -> Vec<AggregatorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn chunk_sequences(events: &[AggregatorEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            AggregatorEvent::ChunkReceived(chunk) => Some(chunk.sequence),
            _ => None,
        })
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
