//! Room lifecycle through the public manager API

use roomcast_sfu::test_helpers::{rtp_packet, FakeInboundTrack, FakeTransport};
use roomcast_sfu::{
    ChannelSignalSink, LogRecordingObserver, ParticipantId, RoomId, SessionDescription, SfuConfig,
    SfuManager, SignalMessage, TrackId, TrackKind, TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

fn manager(config: SfuConfig) -> (Arc<SfuManager>, Arc<FakeTransport>) {
    let transport = FakeTransport::new();
    let manager = SfuManager::new(config, transport.clone(), Arc::new(LogRecordingObserver));
    (manager, transport)
}

fn drain_offers(rx: &mut mpsc::Receiver<SignalMessage>) -> usize {
    let mut offers = 0;
    while let Ok(message) = rx.try_recv() {
        if matches!(message, SignalMessage::Offer(_)) {
            offers += 1;
        }
    }
    offers
}

#[tokio::test]
async fn test_room_is_recreated_empty_after_last_leave() {
    let mut config = SfuConfig::default();
    config.recording.enabled = false;
    let (manager, transport) = manager(config);
    let room_id = RoomId::from("r1");

    let (sink, _rx) = ChannelSignalSink::channel();
    let alice = manager
        .join(room_id.clone(), ParticipantId::from("alice"), Arc::new(sink))
        .await
        .unwrap();
    let (audio, _audio_tx) = FakeInboundTrack::new("alice-audio", TrackKind::Audio, 1);
    transport.emit(0, TransportEvent::TrackStarted(audio));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.room_stats(&room_id).unwrap().audio_tracks, 1);

    assert!(manager.leave(&alice).await);
    assert_eq!(manager.room_count(), 0);
    assert!(manager.room_stats(&room_id).is_none());

    let (sink, _rx) = ChannelSignalSink::channel();
    manager
        .join(room_id.clone(), ParticipantId::from("bob"), Arc::new(sink))
        .await
        .unwrap();
    let stats = manager.room_stats(&room_id).unwrap();
    assert_eq!(stats.connection_count, 1);
    assert_eq!(stats.audio_tracks + stats.video_tracks, 0);

    manager.shutdown().await;
    assert_eq!(manager.room_count(), 0);
}

#[tokio::test]
async fn test_late_joiner_gets_one_offer_per_window() {
    let mut config = SfuConfig::default();
    config.recording.enabled = false;
    config.renegotiation_debounce_ms = 200;
    config.renegotiation_retry_ms = 60_000;
    config.resync_interval_secs = 0;
    let (manager, transport) = manager(config);
    let room_id = RoomId::from("r1");

    let (a_sink, mut a_rx) = ChannelSignalSink::channel();
    let alice = manager
        .join(room_id.clone(), ParticipantId::from("alice"), Arc::new(a_sink))
        .await
        .unwrap();
    let (b_sink, mut b_rx) = ChannelSignalSink::channel();
    let bob = manager
        .join(room_id.clone(), ParticipantId::from("bob"), Arc::new(b_sink))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    // Both join offers are answered, then the debounce window runs out
    assert_eq!(drain_offers(&mut a_rx), 1);
    assert_eq!(drain_offers(&mut b_rx), 1);
    for connection in [&alice, &bob] {
        manager
            .handle_message(connection, SignalMessage::Answer(SessionDescription::answer("ok")))
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(250)).await;

    // Two publications inside one debounce window
    let (audio, _audio_tx) = FakeInboundTrack::new("alice-audio", TrackKind::Audio, 1);
    let (video, _video_tx) = FakeInboundTrack::new("alice-video", TrackKind::Video, 2);
    transport.emit(0, TransportEvent::TrackStarted(audio));
    transport.emit(0, TransportEvent::TrackStarted(video));
    sleep(Duration::from_millis(100)).await;

    assert_eq!(drain_offers(&mut b_rx), 1);
    assert_eq!(
        transport.session(1).unwrap().outbound_ids(),
        vec![TrackId::from("alice-audio"), TrackId::from("alice-video")]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_recording_segments_survive_missing_audio_tool() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SfuConfig::default();
    config.recording.recordings_dir = dir.path().join("segments");
    config.recording.output_dir = dir.path().join("mixed");
    config.recording.ffmpeg_path = "/nonexistent/roomcast-ffmpeg".to_string();
    let (manager, transport) = manager(config);

    let (sink, _rx) = ChannelSignalSink::channel();
    let alice = manager
        .join(RoomId::from("r1"), ParticipantId::from("alice"), Arc::new(sink))
        .await
        .unwrap();
    let (audio, audio_tx) = FakeInboundTrack::new("mic", TrackKind::Audio, 1);
    transport.emit(0, TransportEvent::TrackStarted(audio));
    sleep(Duration::from_millis(20)).await;

    for seq in 0..25u16 {
        audio_tx
            .send(rtp_packet(seq, u32::from(seq) * 960, &[0xfc, 0xff, 0xfe]))
            .unwrap();
    }
    drop(audio_tx);
    sleep(Duration::from_millis(100)).await;

    assert!(manager.leave(&alice).await);
    // Waits for the room's mix task
    manager.shutdown().await;

    let segments: Vec<_> = std::fs::read_dir(dir.path().join("segments").join("r1"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "ogg"))
        .collect();
    assert_eq!(segments.len(), 1);
    assert!(!dir.path().join("mixed").join("r1.ogg").exists());
}
