//! Pure functions turning raw room events into chunks and broadcast snapshots

use crate::chunk::{Broadcast, BroadcastKind, Chunk};
use crate::content::{BroadcastInfo, ChunkContent, RoomEvent};
use crate::ids::{EventId, UserId};
use std::collections::HashSet;

/// The `started` state event a broadcast hangs off
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastStart {
    pub event_id: EventId,
    pub sender: UserId,
    pub info: BroadcastInfo,
}

impl BroadcastStart {
    /// Extract the start metadata, `None` if the event is unusable as such
    pub fn from_event(event: &RoomEvent) -> Option<Self> {
        let info = event.broadcast_info()?;
        let sender = event.sender.clone()?;
        Some(Self {
            event_id: event.event_id.clone(),
            sender,
            info,
        })
    }
}

/// Build the chunk carried by `event`, if any
///
/// Returns `None` for events without chunk marker, attachment or duration,
/// and for events that are still encrypted.
pub fn build_chunk(event: &RoomEvent, broadcast_id: &EventId) -> Option<Chunk> {
    if !event.is_room_message() || event.is_undecryptable() {
        return None;
    }
    let content = ChunkContent::decode(&event.content)?;
    Some(Chunk {
        broadcast_id: broadcast_id.clone(),
        sequence: content.sequence,
        attachment: content.attachment,
        duration_ms: content.duration_ms,
    })
}

/// Build a fresh snapshot from the start metadata and the accepted events
///
/// Events carrying the same sequence collapse into one chunk, the first one
/// in `events` wins.
pub fn build(start: &BroadcastStart, events: &[RoomEvent], current_user_id: &UserId) -> Broadcast {
    let chunks: HashSet<Chunk> = events
        .iter()
        .filter_map(|event| build_chunk(event, &start.event_id))
        .collect();

    let kind = if &start.sender == current_user_id {
        BroadcastKind::Recorder
    } else {
        BroadcastKind::Player
    };

    Broadcast::new(chunks, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{BroadcastState, BROADCAST_INFO_EVENT_TYPE, ROOM_MESSAGE_EVENT_TYPE};
    use serde_json::json;

    fn start() -> BroadcastStart {
        let mut info = BroadcastInfo::new(BroadcastState::Started);
        info.chunk_length = Some(60);
        BroadcastStart {
            event_id: EventId::from("$start"),
            sender: UserId::from("@alice:server"),
            info,
        }
    }

    fn chunk_event(id: &str, sequence: u32, duration: u64) -> RoomEvent {
        RoomEvent {
            event_id: EventId::from(id),
            event_type: ROOM_MESSAGE_EVENT_TYPE.to_string(),
            sender: Some(UserId::from("@alice:server")),
            state_key: None,
            origin_server_ts: 0,
            content: json!({
                "msgtype": "m.audio",
                "url": format!("mxc://server/{id}"),
                "info": { "duration": duration },
                "io.element.voice_broadcast_chunk": { "sequence": sequence },
                "m.relates_to": { "rel_type": "m.reference", "event_id": "$start" }
            }),
            decryption_error: None,
        }
    }

    #[test]
    fn test_build_is_order_independent() {
        let e1 = chunk_event("$e1", 1, 1000);
        let e2 = chunk_event("$e2", 2, 2000);
        let e3 = chunk_event("$e3", 3, 3000);
        let me = UserId::from("@bob:server");

        let shuffled = build(&start(), &[e3.clone(), e1.clone(), e2.clone()], &me);
        let ordered = build(&start(), &[e1, e2, e3], &me);

        assert_eq!(shuffled, ordered);
        assert_eq!(ordered.duration_ms(), 6000);
        assert_eq!(ordered.kind(), BroadcastKind::Player);
    }

    #[test]
    fn test_build_deduplicates_sequences() {
        let events = vec![
            chunk_event("$a", 1, 1000),
            chunk_event("$b", 1, 1000),
            chunk_event("$c", 2, 500),
        ];
        let broadcast = build(&start(), &events, &UserId::from("@alice:server"));
        assert_eq!(broadcast.len(), 2);
        assert_eq!(broadcast.duration_ms(), 1500);
        assert_eq!(broadcast.kind(), BroadcastKind::Recorder);

        // Repeated builds over a growing list do not accumulate anything
        let mut grown = events.clone();
        grown.push(chunk_event("$d", 3, 250));
        let again = build(&start(), &grown, &UserId::from("@alice:server"));
        assert_eq!(again.len(), 3);
        assert_eq!(again.duration_ms(), 1750);
    }

    #[test]
    fn test_build_chunk_skips_malformed_and_encrypted() {
        let mut no_duration = chunk_event("$x", 1, 0);
        no_duration.content["info"] = json!({});
        assert!(build_chunk(&no_duration, &EventId::from("$start")).is_none());

        let mut encrypted = chunk_event("$y", 2, 100);
        encrypted.decryption_error = Some("UISI".to_string());
        assert!(build_chunk(&encrypted, &EventId::from("$start")).is_none());

        let mut state = chunk_event("$z", 3, 100);
        state.event_type = BROADCAST_INFO_EVENT_TYPE.to_string();
        assert!(build_chunk(&state, &EventId::from("$start")).is_none());
    }

    #[test]
    fn test_start_requires_decodable_info_and_sender() {
        let mut event = RoomEvent {
            event_id: EventId::from("$start"),
            event_type: BROADCAST_INFO_EVENT_TYPE.to_string(),
            sender: Some(UserId::from("@alice:server")),
            state_key: Some("@alice:server".to_string()),
            origin_server_ts: 0,
            content: json!({ "state": "started", "device_id": "D", "chunk_length": 60 }),
            decryption_error: None,
        };
        let start = BroadcastStart::from_event(&event).unwrap();
        assert_eq!(start.info.chunk_length, Some(60));

        event.sender = None;
        assert!(BroadcastStart::from_event(&event).is_none());

        event.sender = Some(UserId::from("@alice:server"));
        event.content = json!({ "state": "recording" });
        assert!(BroadcastStart::from_event(&event).is_none());
    }
}
