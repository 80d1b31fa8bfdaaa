mod common;

use common::*;
use pmobroadcast::config::BroadcastConfig;
use pmobroadcast::content::{ChunkContent, BROADCAST_INFO_EVENT_TYPE};
use pmobroadcast::{
    Aggregator, BroadcastInfo, BroadcastService, BroadcastServiceProvider, BroadcastState, Error,
    EventId, MemoryRoom, UserId,
};
use std::path::Path;
use std::sync::Arc;

fn sent_infos(room: &MemoryRoom) -> Vec<BroadcastInfo> {
    room.sent_state_events()
        .iter()
        .map(|sent| BroadcastInfo::decode(&sent.content).expect("valid broadcast info"))
        .collect()
}

#[tokio::test]
async fn test_full_lifecycle() {
    init_tracing();
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());
    assert_eq!(service.state(), None);

    let start_id = service.start_broadcast().await.unwrap();
    assert_eq!(service.state(), Some(BroadcastState::Started));
    assert_eq!(service.broadcast_id(), Some(start_id.clone()));
    assert!(service.is_broadcasting());

    service.pause_broadcast(3).await.unwrap();
    service.resume_broadcast().await.unwrap();
    service.stop_broadcast(5, None).await.unwrap();
    assert_eq!(service.state(), Some(BroadcastState::Stopped));
    assert!(!service.is_broadcasting());

    let sent = room.sent_state_events();
    assert_eq!(sent.len(), 4);
    assert!(sent
        .iter()
        .all(|s| s.event_type == BROADCAST_INFO_EVENT_TYPE && s.state_key == ALICE));
    assert_eq!(sent[0].event_id, start_id);

    let infos = sent_infos(&room);
    let states: Vec<BroadcastState> = infos.iter().map(|i| i.state).collect();
    assert_eq!(
        states,
        vec![
            BroadcastState::Started,
            BroadcastState::Paused,
            BroadcastState::Resumed,
            BroadcastState::Stopped
        ]
    );

    // started: chunk length, no relation
    assert_eq!(infos[0].chunk_length, Some(120));
    assert_eq!(infos[0].device_id.as_deref(), Some("DEVICE"));
    assert_eq!(infos[0].voice_broadcast_id, None);

    assert_eq!(infos[1].last_chunk_sequence, Some(3));
    assert_eq!(infos[2].last_chunk_sequence, None);
    assert_eq!(infos[3].last_chunk_sequence, Some(5));
    for info in &infos[1..] {
        assert_eq!(info.voice_broadcast_id.as_ref(), Some(&start_id));
        assert_eq!(info.chunk_length, None);
    }
}

#[tokio::test]
async fn test_pause_before_start_is_rejected() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());

    let err = service.pause_broadcast(1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnexpectedState {
            from: None,
            to: BroadcastState::Paused
        }
    ));
    assert!(room.sent_state_events().is_empty());
    assert_eq!(service.state(), None);

    assert!(matches!(
        service.resume_broadcast().await,
        Err(Error::UnexpectedState { .. })
    ));
    assert!(matches!(
        service.stop_broadcast(0, None).await,
        Err(Error::UnexpectedState { .. })
    ));
    assert!(room.sent_state_events().is_empty());
}

#[tokio::test]
async fn test_stop_can_be_repeated_but_start_cannot() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());

    service.start_broadcast().await.unwrap();
    let err = service.start_broadcast().await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnexpectedState {
            from: Some(BroadcastState::Started),
            to: BroadcastState::Started
        }
    ));

    service.stop_broadcast(2, None).await.unwrap();
    service.stop_broadcast(2, None).await.unwrap();

    let states: Vec<BroadcastState> = sent_infos(&room).iter().map(|i| i.state).collect();
    assert_eq!(
        states,
        vec![
            BroadcastState::Started,
            BroadcastState::Stopped,
            BroadcastState::Stopped
        ]
    );
}

#[tokio::test]
async fn test_restart_after_stop_records_new_broadcast() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());

    let first = service.start_broadcast().await.unwrap();
    service.stop_broadcast(0, None).await.unwrap();
    let second = service.start_broadcast().await.unwrap();

    assert_ne!(first, second);
    assert_eq!(service.broadcast_id(), Some(second));
}

#[tokio::test]
async fn test_stop_with_explicit_broadcast_id() {
    let room = Arc::new(room_as(ALICE));
    // Diffusion laissée en pause par une session précédente
    let service = BroadcastService::with_state(
        room.clone(),
        BroadcastConfig::default(),
        Some(BroadcastState::Paused),
        None,
    );

    let dangling = EventId::new("$dangling");
    service.stop_broadcast(7, Some(dangling.clone())).await.unwrap();

    let infos = sent_infos(&room);
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].voice_broadcast_id, Some(dangling));
    assert_eq!(infos[0].last_chunk_sequence, Some(7));
    assert_eq!(service.state(), Some(BroadcastState::Stopped));
}

#[tokio::test]
async fn test_transition_without_broadcast_id() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::with_state(
        room.clone(),
        BroadcastConfig::default(),
        Some(BroadcastState::Started),
        None,
    );

    assert!(matches!(service.pause_broadcast(1).await, Err(Error::NotStarted)));
    assert!(matches!(service.stop_broadcast(1, None).await, Err(Error::NotStarted)));
    assert!(room.sent_state_events().is_empty());
    assert_eq!(service.state(), Some(BroadcastState::Started));
}

#[tokio::test]
async fn test_missing_user_id() {
    let room = Arc::new(MemoryRoom::new("!room:example.org", None, None));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());

    let err = service.start_broadcast().await.unwrap_err();
    assert!(matches!(err, Error::MissingUserId));
    assert!(room.sent_state_events().is_empty());
    assert_eq!(service.state(), None);
}

#[tokio::test]
async fn test_send_failure_leaves_state_unchanged() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());

    room.fail_next_send("network down");
    let err = service.start_broadcast().await.unwrap_err();
    assert!(matches!(err, Error::Room(_)));
    assert_eq!(service.state(), None);
    assert_eq!(service.broadcast_id(), None);

    let start_id = service.start_broadcast().await.unwrap();
    room.fail_next_send("network down");
    assert!(service.pause_broadcast(1).await.is_err());
    assert_eq!(service.state(), Some(BroadcastState::Started));
    assert_eq!(service.broadcast_id(), Some(start_id));

    // La transition reste possible après l'échec
    service.pause_broadcast(1).await.unwrap();
    assert_eq!(service.state(), Some(BroadcastState::Paused));
}

#[tokio::test]
async fn test_commands_are_processed_in_submission_order() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());

    let (start, pause, second_start) = tokio::join!(
        service.start_broadcast(),
        service.pause_broadcast(1),
        service.start_broadcast()
    );

    assert!(start.is_ok());
    assert!(pause.is_ok());
    assert!(matches!(
        second_start,
        Err(Error::UnexpectedState {
            from: Some(BroadcastState::Paused),
            ..
        })
    ));

    let states: Vec<BroadcastState> = sent_infos(&room).iter().map(|i| i.state).collect();
    assert_eq!(states, vec![BroadcastState::Started, BroadcastState::Paused]);
}

#[tokio::test]
async fn test_send_chunk_requires_started_broadcast() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());

    let err = service
        .send_chunk(Path::new("/tmp/chunk-1.ogg"), "audio/ogg", 30_000, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotStarted));
    assert!(room.sent_chunks().is_empty());
}

#[tokio::test]
async fn test_sent_chunks_are_aggregated() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());
    let start_id = service.start_broadcast().await.unwrap();

    for sequence in 1..=3 {
        let file = format!("/tmp/chunk-{sequence}.ogg");
        service
            .send_chunk(Path::new(&file), "audio/ogg", 10_000, sequence)
            .await
            .unwrap();
    }

    let chunks = room.sent_chunks();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.max_retries == 0));
    assert!(chunks.iter().all(|c| c.broadcast_id == start_id));
    assert_eq!(chunks[0].content["body"], "chunk-1.ogg");
    assert_eq!(
        chunks[1].content["io.element.voice_broadcast_chunk"]["sequence"],
        2
    );
    // Le contenu sortant ne porte pas encore l'URL du média
    assert!(ChunkContent::decode(&chunks[0].content).is_none());

    let aggregator =
        Aggregator::new(room.clone(), start_id, BroadcastState::Started).unwrap();
    aggregator.start().await;
    let broadcast = aggregator.broadcast();
    assert_eq!(broadcast.len(), 3);
    assert_eq!(broadcast.duration_ms(), 30_000);
    assert_eq!(broadcast.kind(), pmobroadcast::BroadcastKind::Recorder);
}

#[tokio::test]
async fn test_chunk_send_failure_is_reported() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());
    service.start_broadcast().await.unwrap();

    room.fail_next_send("upload failed");
    let err = service
        .send_chunk(Path::new("/tmp/chunk-1.ogg"), "audio/ogg", 30_000, 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("upload failed"));
    assert!(room.sent_chunks().is_empty());
}

#[tokio::test]
async fn test_max_length_is_enforced() {
    let room = Arc::new(room_as(ALICE));
    let config = BroadcastConfig {
        chunk_length_secs: 30,
        max_length_secs: 60,
        ..BroadcastConfig::default()
    };
    let service = BroadcastService::new(room.clone(), config);
    service.start_broadcast().await.unwrap();

    let file = Path::new("/tmp/chunk.ogg");
    service.send_chunk(file, "audio/ogg", 30_000, 1).await.unwrap();
    service.send_chunk(file, "audio/ogg", 30_000, 2).await.unwrap();
    let err = service.send_chunk(file, "audio/ogg", 1, 3).await.unwrap_err();
    assert!(matches!(err, Error::MaxLengthReached(60)));
    assert_eq!(room.sent_chunks().len(), 2);

    // Un nouveau départ remet le compteur à zéro
    service.stop_broadcast(2, None).await.unwrap();
    service.start_broadcast().await.unwrap();
    service.send_chunk(file, "audio/ogg", 30_000, 1).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_service() {
    let room = Arc::new(room_as(ALICE));
    let service = BroadcastService::new(room.clone(), BroadcastConfig::default());
    service.start_broadcast().await.unwrap();

    service.shutdown().await;
    service.shutdown().await;

    assert!(matches!(
        service.pause_broadcast(1).await,
        Err(Error::ServiceClosed)
    ));
    assert_eq!(service.state(), Some(BroadcastState::Started));
}

#[tokio::test]
async fn test_provider_keeps_one_service_per_session() {
    let provider = BroadcastServiceProvider::default();
    assert!(provider.current().is_none());

    let first_room = Arc::new(MemoryRoom::new(
        "!first:example.org",
        Some(UserId::new(ALICE)),
        None,
    ));
    let second_room = Arc::new(MemoryRoom::new(
        "!second:example.org",
        Some(UserId::new(ALICE)),
        None,
    ));

    let first = provider.get_or_create(first_room.clone()).unwrap();
    let again = provider.get_or_create(first_room.clone()).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    first.start_broadcast().await.unwrap();
    let err = provider.get_or_create(second_room.clone()).unwrap_err();
    assert!(matches!(err, Error::BroadcastInProgress(room) if room == "!first:example.org"));

    first.stop_broadcast(0, None).await.unwrap();
    let second = provider.get_or_create(second_room.clone()).unwrap();
    assert_eq!(second.room_id(), "!second:example.org");
    assert!(Arc::ptr_eq(&provider.current().unwrap(), &second));

    provider.tear_down().await;
    assert!(provider.current().is_none());
    assert!(matches!(
        second.start_broadcast().await,
        Err(Error::ServiceClosed)
    ));
}
