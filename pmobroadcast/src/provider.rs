//! Session-wide access to the recording service
//!
//! A user records at most one broadcast at a time. The provider keeps the
//! service of the room currently recording and refuses to hand out a service
//! for another room while that broadcast is running.

use crate::config::BroadcastConfig;
use crate::error::{Error, Result};
use crate::room::Room;
use crate::service::BroadcastService;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub struct BroadcastServiceProvider {
    config: BroadcastConfig,
    current: Mutex<Option<Arc<BroadcastService>>>,
}

impl BroadcastServiceProvider {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    /// Service of the room currently tracked, if any
    pub fn current(&self) -> Option<Arc<BroadcastService>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Service for `room`, created on first use
    ///
    /// Fails with [`Error::BroadcastInProgress`] while a broadcast is running
    /// in another room.
    pub fn get_or_create(&self, room: Arc<dyn Room>) -> Result<Arc<BroadcastService>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(service) = current.as_ref() {
            if service.room_id() == room.room_id() {
                return Ok(service.clone());
            }
            if service.is_broadcasting() {
                debug!(
                    current_room = service.room_id(),
                    requested_room = room.room_id(),
                    "Voice broadcast already running in another room"
                );
                return Err(Error::BroadcastInProgress(service.room_id().to_string()));
            }
        }

        info!(room = room.room_id(), "Creating voice broadcast service");
        let service = Arc::new(BroadcastService::new(room, self.config.clone()));
        *current = Some(service.clone());
        Ok(service)
    }

    /// Forget the tracked service and stop its worker
    pub async fn tear_down(&self) {
        let service = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(service) = service {
            debug!(room = service.room_id(), "Tearing down voice broadcast service");
            service.shutdown().await;
        }
    }
}

impl Default for BroadcastServiceProvider {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}
