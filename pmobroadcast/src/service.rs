//! Recording side of a voice broadcast
//!
//! [`BroadcastService`] sends the state events of a broadcast (start, pause,
//! resume, stop) and its audio chunks. State changes go through a single
//! worker task: one command at a time, network round-trip included, so two
//! callers can never race conflicting state events into the room.

use crate::config::BroadcastConfig;
use crate::content::{chunk_message_content, BroadcastInfo, BroadcastState, BROADCAST_INFO_EVENT_TYPE};
use crate::error::{Error, Result};
use crate::ids::EventId;
use crate::room::{OutgoingChunk, Room};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State change requested from the worker
#[derive(Clone, Debug, PartialEq, Eq)]
enum Request {
    Start,
    Pause { last_chunk_sequence: u32 },
    Resume,
    Stop {
        last_chunk_sequence: u32,
        broadcast_id: Option<EventId>,
    },
}

impl Request {
    fn target(&self) -> BroadcastState {
        match self {
            Request::Start => BroadcastState::Started,
            Request::Pause { .. } => BroadcastState::Paused,
            Request::Resume => BroadcastState::Resumed,
            Request::Stop { .. } => BroadcastState::Stopped,
        }
    }
}

/// Commands sent to the worker
#[derive(Debug)]
enum Command {
    Transition {
        request: Request,
        reply: oneshot::Sender<Result<EventId>>,
    },
    Shutdown,
}

/// What callers may read without going through the queue
#[derive(Clone, Debug, Default)]
struct Snapshot {
    state: Option<BroadcastState>,
    broadcast_id: Option<EventId>,
    sent_duration_ms: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sends the lifecycle events and chunks of the local user's broadcast
///
/// Transitions are checked in queue order, against the state left by the
/// commands queued ahead: an illegal one fails with
/// [`Error::UnexpectedState`] before anything is sent to the room.
pub struct BroadcastService {
    room: Arc<dyn Room>,
    config: BroadcastConfig,
    tx: mpsc::Sender<Command>,
    snapshot: Arc<Mutex<Snapshot>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastService {
    /// Create a service with no broadcast yet
    ///
    /// Spawns the worker, so it must be called within a tokio runtime.
    pub fn new(room: Arc<dyn Room>, config: BroadcastConfig) -> Self {
        Self::with_state(room, config, None, None)
    }

    /// Create a service resuming an existing broadcast
    ///
    /// Used to force-stop a broadcast left running by a previous session.
    pub fn with_state(
        room: Arc<dyn Room>,
        config: BroadcastConfig,
        state: Option<BroadcastState>,
        broadcast_id: Option<EventId>,
    ) -> Self {
        let snapshot = Arc::new(Mutex::new(Snapshot {
            state,
            broadcast_id,
            sent_duration_ms: 0,
        }));
        let (tx, mut rx) = mpsc::channel(config.command_queue_capacity);

        let mut worker = Worker {
            room: room.clone(),
            snapshot: snapshot.clone(),
            chunk_length_secs: config.chunk_length_secs,
        };

        let join_handle = tokio::spawn(async move {
            info!(room = worker.room.room_id(), "Starting voice broadcast service worker");

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Transition { request, reply } => {
                        let result = worker.handle(request).await;
                        // Caller may have given up waiting
                        let _ = reply.send(result);
                    }
                    Command::Shutdown => break,
                }
            }

            info!(room = worker.room.room_id(), "Voice broadcast service worker stopped");
        });

        Self {
            room,
            config,
            tx,
            snapshot,
            worker: Mutex::new(Some(join_handle)),
        }
    }

    pub fn room_id(&self) -> &str {
        self.room.room_id()
    }

    /// Last state confirmed by the room, `None` before the first start
    pub fn state(&self) -> Option<BroadcastState> {
        lock(&self.snapshot).state
    }

    /// Start event of the current broadcast
    pub fn broadcast_id(&self) -> Option<EventId> {
        lock(&self.snapshot).broadcast_id.clone()
    }

    /// True while a started broadcast has not been stopped
    pub fn is_broadcasting(&self) -> bool {
        matches!(
            self.state(),
            Some(BroadcastState::Started | BroadcastState::Paused | BroadcastState::Resumed)
        )
    }

    /// Send `started` and record the resulting event id as the broadcast id
    pub async fn start_broadcast(&self) -> Result<EventId> {
        self.submit(Request::Start).await
    }

    pub async fn pause_broadcast(&self, last_chunk_sequence: u32) -> Result<EventId> {
        self.submit(Request::Pause {
            last_chunk_sequence,
        })
        .await
    }

    pub async fn resume_broadcast(&self) -> Result<EventId> {
        self.submit(Request::Resume).await
    }

    /// Send `stopped`, for `broadcast_id` if given, else for the recorded broadcast
    pub async fn stop_broadcast(
        &self,
        last_chunk_sequence: u32,
        broadcast_id: Option<EventId>,
    ) -> Result<EventId> {
        self.submit(Request::Stop {
            last_chunk_sequence,
            broadcast_id,
        })
        .await
    }

    /// Upload and send one chunk of the current broadcast
    ///
    /// Not queued behind state changes. The room is asked not to retry: a
    /// lost chunk is reported here rather than resent out of order.
    pub async fn send_chunk(
        &self,
        file: &Path,
        mime_type: &str,
        duration_ms: u64,
        sequence: u32,
    ) -> Result<EventId> {
        let snapshot = lock(&self.snapshot).clone();
        let broadcast_id = snapshot.broadcast_id.ok_or(Error::NotStarted)?;

        let max_length_ms = self.config.max_length_secs.saturating_mul(1000);
        if snapshot.sent_duration_ms.saturating_add(duration_ms) > max_length_ms {
            warn!(broadcast = %broadcast_id, sequence, "Voice broadcast maximum length reached");
            return Err(Error::MaxLengthReached(self.config.max_length_secs));
        }

        let body = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("Voice broadcast chunk {sequence}"));

        let chunk = OutgoingChunk {
            file: file.to_path_buf(),
            mime_type: mime_type.to_string(),
            duration_ms,
            sequence,
            broadcast_id: broadcast_id.clone(),
            content: chunk_message_content(&broadcast_id, sequence, duration_ms, mime_type, &body),
            max_retries: 0,
        };

        let event_id = match self.room.send_chunk(chunk).await {
            Ok(event_id) => event_id,
            Err(err) => {
                warn!(broadcast = %broadcast_id, sequence, "Failed to send voice broadcast chunk: {err:#}");
                return Err(Error::Room(err));
            }
        };

        {
            let mut snapshot = lock(&self.snapshot);
            if snapshot.broadcast_id.as_ref() == Some(&broadcast_id) {
                snapshot.sent_duration_ms = snapshot.sent_duration_ms.saturating_add(duration_ms);
            }
        }
        debug!(broadcast = %broadcast_id, sequence, event = %event_id, "Voice broadcast chunk sent");
        Ok(event_id)
    }

    /// Stop the worker once the commands already queued are processed
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(room = self.room.room_id(), "Voice broadcast worker join error: {err}");
            }
        }
    }

    async fn submit(&self, request: Request) -> Result<EventId> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Transition { request, reply })
            .await
            .map_err(|_| Error::ServiceClosed)?;
        response.await.map_err(|_| Error::ServiceClosed)?
    }
}

impl std::fmt::Debug for BroadcastService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = lock(&self.snapshot).clone();
        f.debug_struct("BroadcastService")
            .field("room", &self.room.room_id())
            .field("state", &snapshot.state)
            .field("broadcast_id", &snapshot.broadcast_id)
            .finish()
    }
}

struct Worker {
    room: Arc<dyn Room>,
    snapshot: Arc<Mutex<Snapshot>>,
    chunk_length_secs: u64,
}

impl Worker {
    async fn handle(&mut self, request: Request) -> Result<EventId> {
        let (current, recorded_id) = {
            let snapshot = lock(&self.snapshot);
            (snapshot.state, snapshot.broadcast_id.clone())
        };
        let target = request.target();

        if !BroadcastState::can_transition(current, target) {
            warn!(
                room = self.room.room_id(),
                from = ?current,
                to = %target,
                "Rejected voice broadcast state transition"
            );
            return Err(Error::unexpected_state(current, target));
        }

        let user_id = self.room.own_user_id().ok_or(Error::MissingUserId)?;

        let mut info = BroadcastInfo::new(target);
        info.device_id = self.room.own_device_id();
        match &request {
            Request::Start => {
                info.chunk_length = Some(self.chunk_length_secs);
            }
            Request::Pause {
                last_chunk_sequence,
            } => {
                info.last_chunk_sequence = Some(*last_chunk_sequence);
                info.voice_broadcast_id = Some(recorded_id.ok_or(Error::NotStarted)?);
            }
            Request::Resume => {
                info.voice_broadcast_id = Some(recorded_id.ok_or(Error::NotStarted)?);
            }
            Request::Stop {
                last_chunk_sequence,
                broadcast_id,
            } => {
                info.last_chunk_sequence = Some(*last_chunk_sequence);
                let id = broadcast_id.clone().or(recorded_id).ok_or(Error::NotStarted)?;
                info.voice_broadcast_id = Some(id);
            }
        }

        let event_id = match self
            .room
            .send_state_event(BROADCAST_INFO_EVENT_TYPE, info.to_content(), user_id.as_str())
            .await
        {
            Ok(event_id) => event_id,
            Err(err) => {
                warn!(room = self.room.room_id(), state = %target, "Failed to send voice broadcast info: {err:#}");
                return Err(Error::Room(err));
            }
        };

        let mut snapshot = lock(&self.snapshot);
        snapshot.state = Some(target);
        if request == Request::Start {
            snapshot.broadcast_id = Some(event_id.clone());
            snapshot.sent_duration_ms = 0;
        }
        info!(
            room = self.room.room_id(),
            state = %target,
            event = %event_id,
            "Voice broadcast state sent"
        );
        Ok(event_id)
    }
}
