//! Example: record a short voice broadcast and follow it live
//!
//! This example demonstrates:
//! - Driving the recording lifecycle with `BroadcastService`
//! - Aggregating the broadcast with an `Aggregator` and an observer
//! - Loading the configuration (defaults, `config.yaml`, env overrides)
//!
//! Everything runs against an in-memory room.
//!
//! Run with: RUST_LOG=pmobroadcast=debug cargo run --example replay_broadcast

use pmobroadcast::config::BroadcastConfig;
use pmobroadcast::{
    Aggregator, AggregatorObserver, Broadcast, BroadcastService, BroadcastState, Chunk,
    MemoryRoom, Result, UserId,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Printer;

impl AggregatorObserver for Printer {
    fn chunk_received(&self, chunk: &Chunk) {
        println!(
            "  chunk #{} ({:.1}s) at {}",
            chunk.sequence,
            chunk.duration_ms as f64 / 1000.0,
            chunk.attachment.url
        );
    }

    fn state_received(&self, state: BroadcastState) {
        println!("  state: {state}");
    }

    fn broadcast_updated(&self, broadcast: &Broadcast) {
        println!(
            "  broadcast: {} chunk(s), {:.1}s",
            broadcast.len(),
            broadcast.duration_ms() as f64 / 1000.0
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Voice broadcast replay");
    println!("======================\n");

    let config = BroadcastConfig::load("")?;
    println!(
        "Chunk length: {}s, max length: {}s\n",
        config.chunk_length_secs, config.max_length_secs
    );

    let room = Arc::new(MemoryRoom::new(
        "!demo:example.org",
        Some(UserId::new("@alice:example.org")),
        Some("DEMODEVICE"),
    ));
    let service = BroadcastService::new(room.clone(), config.clone());

    let start_id = service.start_broadcast().await?;
    println!("Started broadcast {start_id}");

    // First chunk before anyone listens: it comes from the bulk fetch
    service
        .send_chunk(Path::new("chunk-1.ogg"), "audio/ogg", 30_000, 1)
        .await?;

    let aggregator = Aggregator::with_config(
        room.clone(),
        start_id.clone(),
        BroadcastState::Started,
        &config,
    )?;
    let printer = Arc::new(Printer);
    aggregator.set_observer(&printer);

    println!("\nLoading:");
    aggregator.start().await;

    println!("\nLive:");
    service
        .send_chunk(Path::new("chunk-2.ogg"), "audio/ogg", 30_000, 2)
        .await?;
    service.pause_broadcast(2).await?;
    service.resume_broadcast().await?;
    service
        .send_chunk(Path::new("chunk-3.ogg"), "audio/ogg", 12_500, 3)
        .await?;
    service.stop_broadcast(3, None).await?;

    // Laisser le listener traiter les derniers évènements
    tokio::time::sleep(Duration::from_millis(50)).await;

    let broadcast = aggregator.broadcast();
    println!("\nSummary:");
    println!("  Kind: {:?}", broadcast.kind());
    println!("  State: {}", aggregator.broadcast_state());
    println!("  Last chunk sequence: {}", aggregator.last_chunk_sequence());
    for chunk in broadcast.sorted_chunks() {
        println!("  #{} {}", chunk.sequence, chunk.attachment.url);
    }
    println!(
        "  Total: {:.1}s",
        broadcast.duration_ms() as f64 / 1000.0
    );

    aggregator.stop();
    service.shutdown().await;
    Ok(())
}
