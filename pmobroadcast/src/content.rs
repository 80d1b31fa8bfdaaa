//! Typed views over the JSON content of voice broadcast room events
//!
//! Room events reach us as raw JSON maps. Every typed view here is obtained
//! through a `decode` step that fails closed: a payload that does not match
//! yields `None`, never a partially filled structure.

use crate::ids::{EventId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// State event type carrying [`BroadcastInfo`]
pub const BROADCAST_INFO_EVENT_TYPE: &str = "io.element.voice_broadcast_info";

/// Event type of room messages (chunks are audio messages)
pub const ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";

/// Content key marking an audio message as a broadcast chunk
pub const CHUNK_CONTENT_KEY: &str = "io.element.voice_broadcast_chunk";

/// Relation type linking chunks and state changes to the start event
pub const REFERENCE_RELATION: &str = "m.reference";

const RELATES_TO_KEY: &str = "m.relates_to";
const AUDIO_CONTENT_KEY: &str = "org.matrix.msc1767.audio";
const VOICE_CONTENT_KEY: &str = "org.matrix.msc3245.voice";

// ============================================================================
// Broadcast state
// ============================================================================

/// Recording lifecycle of a broadcast
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastState {
    Started,
    Paused,
    Resumed,
    Stopped,
}

impl BroadcastState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastState::Started => "started",
            BroadcastState::Paused => "paused",
            BroadcastState::Resumed => "resumed",
            BroadcastState::Stopped => "stopped",
        }
    }

    /// States reachable from `from` (`None` = nothing sent yet)
    ///
    /// `stopped -> stopped` is accepted so that a stop can be retried, while
    /// `started -> started` is not.
    pub fn allowed_transitions(from: Option<BroadcastState>) -> &'static [BroadcastState] {
        use BroadcastState::*;
        match from {
            None => &[Started],
            Some(Started) => &[Paused, Stopped],
            Some(Paused) => &[Resumed, Stopped],
            Some(Resumed) => &[Paused, Stopped],
            Some(Stopped) => &[Started, Stopped],
        }
    }

    pub fn can_transition(from: Option<BroadcastState>, to: BroadcastState) -> bool {
        Self::allowed_transitions(from).contains(&to)
    }

    /// `paused` and `stopped` carry the authoritative last chunk sequence
    pub fn carries_last_sequence(&self) -> bool {
        matches!(self, BroadcastState::Paused | BroadcastState::Stopped)
    }
}

impl fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Relations
// ============================================================================

/// `m.relates_to` payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub rel_type: String,
    pub event_id: EventId,
}

impl Relation {
    pub fn reference(event_id: EventId) -> Self {
        Self {
            rel_type: REFERENCE_RELATION.to_string(),
            event_id,
        }
    }

    pub fn is_reference_to(&self, event_id: &EventId) -> bool {
        self.rel_type == REFERENCE_RELATION && &self.event_id == event_id
    }
}

// ============================================================================
// Broadcast info
// ============================================================================

/// Metadata carried by a broadcast state event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastInfo {
    pub state: BroadcastState,
    pub device_id: Option<String>,
    /// Target chunk duration in seconds, only set on `started`
    pub chunk_length: Option<u64>,
    /// Set on `paused` and `stopped`
    pub last_chunk_sequence: Option<u32>,
    /// Start event of the broadcast, absent on the start event itself
    pub voice_broadcast_id: Option<EventId>,
}

#[derive(Serialize, Deserialize)]
struct BroadcastInfoWire {
    state: BroadcastState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_chunk_sequence: Option<u32>,
    #[serde(
        rename = "m.relates_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    relates_to: Option<Relation>,
}

impl BroadcastInfo {
    pub fn new(state: BroadcastState) -> Self {
        Self {
            state,
            device_id: None,
            chunk_length: None,
            last_chunk_sequence: None,
            voice_broadcast_id: None,
        }
    }

    /// Decode a state event content, `None` if it is not broadcast info
    pub fn decode(content: &Value) -> Option<Self> {
        let wire: BroadcastInfoWire = serde_json::from_value(content.clone()).ok()?;
        let voice_broadcast_id = match wire.relates_to {
            Some(relation) if relation.rel_type == REFERENCE_RELATION => Some(relation.event_id),
            Some(_) => return None,
            None => None,
        };
        Some(Self {
            state: wire.state,
            device_id: wire.device_id,
            chunk_length: wire.chunk_length,
            last_chunk_sequence: wire.last_chunk_sequence,
            voice_broadcast_id,
        })
    }

    /// Encode as state event content
    pub fn to_content(&self) -> Value {
        let wire = BroadcastInfoWire {
            state: self.state,
            device_id: self.device_id.clone(),
            chunk_length: self.chunk_length,
            last_chunk_sequence: self.last_chunk_sequence,
            relates_to: self.voice_broadcast_id.clone().map(Relation::reference),
        };
        // Plain struct of strings and integers
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    /// True if this info belongs to the broadcast started by `start_event_id`
    ///
    /// `own_event_id` is the identity of the state event carrying this info,
    /// which matches for the start event itself.
    pub fn belongs_to(&self, own_event_id: &EventId, start_event_id: &EventId) -> bool {
        match &self.voice_broadcast_id {
            Some(id) => id == start_event_id,
            None => own_event_id == start_event_id,
        }
    }
}

// ============================================================================
// Chunk content
// ============================================================================

/// Where the audio of a chunk can be downloaded from
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    /// True when the media is end-to-end encrypted (`file` rather than `url`)
    pub encrypted: bool,
}

/// Decoded content of a chunk message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkContent {
    pub sequence: u32,
    pub attachment: Attachment,
    pub duration_ms: u64,
}

#[derive(Deserialize)]
struct ChunkMarker {
    sequence: u32,
}

#[derive(Deserialize)]
struct EncryptedFile {
    url: String,
}

#[derive(Deserialize, Default)]
struct AudioInfo {
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize)]
struct ExtensibleAudio {
    #[serde(default)]
    duration: Option<u64>,
}

#[derive(Deserialize)]
struct ChunkWire {
    #[serde(rename = "io.element.voice_broadcast_chunk", default)]
    chunk: Option<ChunkMarker>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    file: Option<EncryptedFile>,
    #[serde(default)]
    info: Option<AudioInfo>,
    #[serde(rename = "org.matrix.msc1767.audio", default)]
    audio: Option<ExtensibleAudio>,
}

impl ChunkContent {
    /// Decode a room message content, `None` unless it is a complete chunk
    pub fn decode(content: &Value) -> Option<Self> {
        let wire: ChunkWire = serde_json::from_value(content.clone()).ok()?;
        let sequence = wire.chunk?.sequence;
        let info = wire.info.unwrap_or_default();

        let attachment = match (wire.file, wire.url) {
            (Some(file), _) => Attachment {
                url: file.url,
                mime_type: info.mimetype.clone(),
                size: info.size,
                encrypted: true,
            },
            (None, Some(url)) => Attachment {
                url,
                mime_type: info.mimetype.clone(),
                size: info.size,
                encrypted: false,
            },
            (None, None) => return None,
        };

        let duration_ms = wire.audio.and_then(|a| a.duration).or(info.duration)?;

        Some(Self {
            sequence,
            attachment,
            duration_ms,
        })
    }
}

/// Content of an outgoing chunk message, before the upload fills `url`/`file`
pub fn chunk_message_content(
    broadcast_id: &EventId,
    sequence: u32,
    duration_ms: u64,
    mime_type: &str,
    body: &str,
) -> Value {
    json!({
        "msgtype": "m.audio",
        "body": body,
        "info": {
            "mimetype": mime_type,
            "duration": duration_ms,
        },
        AUDIO_CONTENT_KEY: { "duration": duration_ms },
        VOICE_CONTENT_KEY: {},
        CHUNK_CONTENT_KEY: { "sequence": sequence },
        RELATES_TO_KEY: {
            "rel_type": REFERENCE_RELATION,
            "event_id": broadcast_id,
        },
    })
}

// ============================================================================
// Raw room events
// ============================================================================

/// A raw event as handed over by the room collaborator
///
/// When `decryption_error` is set, `content` only holds the clear part of the
/// event (the relation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: Option<UserId>,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub decryption_error: Option<String>,
}

impl RoomEvent {
    pub fn is_broadcast_info(&self) -> bool {
        self.event_type == BROADCAST_INFO_EVENT_TYPE
    }

    pub fn is_room_message(&self) -> bool {
        self.event_type == ROOM_MESSAGE_EVENT_TYPE
    }

    pub fn is_undecryptable(&self) -> bool {
        self.decryption_error.is_some()
    }

    pub fn is_sent_by(&self, user: &UserId) -> bool {
        self.sender.as_ref() == Some(user)
    }

    pub fn has_chunk_marker(&self) -> bool {
        self.content.get(CHUNK_CONTENT_KEY).is_some()
    }

    pub fn relation(&self) -> Option<Relation> {
        let value = self.content.get(RELATES_TO_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_reference_to(&self, event_id: &EventId) -> bool {
        self.relation()
            .map(|r| r.is_reference_to(event_id))
            .unwrap_or(false)
    }

    pub fn broadcast_info(&self) -> Option<BroadcastInfo> {
        if !self.is_broadcast_info() || self.is_undecryptable() {
            return None;
        }
        BroadcastInfo::decode(&self.content)
    }
}

/// Timeline direction of a live delivery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forwards,
    Backwards,
}

/// One delivery from a timeline listener
#[derive(Clone, Debug)]
pub struct TimelineEvent {
    pub event: RoomEvent,
    pub direction: Direction,
}
