//! # pmobroadcast - Voice broadcasts over a chat room timeline
//!
//! A voice broadcast is a live audio stream published as a series of audio
//! chunk messages, all referencing one "start" state event. The author
//! drives its lifecycle with further state events (`started`, `paused`,
//! `resumed`, `stopped`).
//!
//! This crate provides both sides:
//!
//! - **Listening**: [`Aggregator`] rebuilds the ordered set of chunks of one
//!   broadcast from a bulk fetch plus the live feed, tracks its state and
//!   reports chunks still waiting for decryption.
//! - **Recording**: [`BroadcastService`] sends the lifecycle events through a
//!   serialized worker and uploads chunks. [`BroadcastServiceProvider`] keeps
//!   one service per session.
//!
//! The chat room itself is abstracted behind the [`Room`] trait. An
//! in-memory implementation, [`MemoryRoom`], backs the demo and the tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pmobroadcast::{Aggregator, BroadcastService, BroadcastState, MemoryRoom, UserId};
//! use pmobroadcast::config::BroadcastConfig;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pmobroadcast::Result<()> {
//!     let room = Arc::new(MemoryRoom::new("!room", Some(UserId::new("@alice:local")), Some("DEV")));
//!     let service = BroadcastService::new(room.clone(), BroadcastConfig::default());
//!
//!     let start_id = service.start_broadcast().await?;
//!     service
//!         .send_chunk(Path::new("chunk-1.ogg"), "audio/ogg", 30_000, 1)
//!         .await?;
//!
//!     let aggregator = Aggregator::new(room, start_id, BroadcastState::Started)?;
//!     aggregator.start().await;
//!     println!("{} chunk(s)", aggregator.broadcast().len());
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod builder;
pub mod chunk;
pub mod config;
pub mod content;
pub mod error;
pub mod ids;
pub mod memory;
pub mod provider;
pub mod room;
pub mod service;

pub use aggregator::{Aggregator, AggregatorEvent, AggregatorObserver, LaunchState};
pub use builder::BroadcastStart;
pub use chunk::{Broadcast, BroadcastKind, Chunk};
pub use content::{Attachment, BroadcastInfo, BroadcastState, RoomEvent, TimelineEvent};
pub use error::{Error, Result};
pub use ids::{EventId, UserId};
pub use memory::MemoryRoom;
pub use provider::BroadcastServiceProvider;
pub use room::{OutgoingChunk, Room, Subscription};
pub use service::BroadcastService;
