//! SFU Manager - Top-level orchestration of rooms and connections
//!
//! This module provides:
//! - Connection join/leave with room creation and removal
//! - Dispatch of inbound signaling messages and transport events
//! - Background key-frame and renegotiation resync tasks
//! - Room teardown into the recording mixer
//! - Global statistics

use crate::config::SfuConfig;
use crate::connection::Connection;
use crate::error::{MixError, Result, SfuError};
use crate::keyframe::run_keyframe_dispatcher;
use crate::message::{SignalMessage, SignalSink};
use crate::recording::{Recorder, RecordingObserver};
use crate::registry::RoomRegistry;
use crate::room::{RoomStats, SfuRoom};
use crate::router::TrackRouter;
use crate::signaling::{self, run_periodic_resync, RenegotiationCause};
use crate::transport::{ConnectionState, MediaTransport, TransportEvent};
use crate::types::{ParticipantId, RoomId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Global SFU manager statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerStats {
    /// Number of active rooms
    pub active_rooms: usize,
    /// Total number of connections across all rooms
    pub total_connections: usize,
    /// Total number of audio tracks
    pub total_audio_tracks: usize,
    /// Total number of video tracks
    pub total_video_tracks: usize,
    /// Total bytes relayed through SFU
    pub total_bytes_relayed: u64,
    /// Total packets relayed through SFU
    pub total_packets_relayed: u64,
}

/// SFU Manager - owns the room registry and every background task
pub struct SfuManager {
    config: Arc<SfuConfig>,
    transport: Arc<dyn MediaTransport>,
    registry: Arc<RoomRegistry>,
    router: TrackRouter,
    recorder: Option<Arc<Recorder>>,

    /// Parent of every room and connection token
    shutdown: CancellationToken,

    /// Running room mixes, awaited on shutdown
    mixes: Mutex<Vec<JoinHandle<()>>>,
}

impl SfuManager {
    /// Create a new SFU manager and start its background tasks
    pub fn new(
        config: SfuConfig,
        transport: Arc<dyn MediaTransport>,
        observer: Arc<dyn RecordingObserver>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let registry = Arc::new(RoomRegistry::new(Arc::clone(&config), shutdown.clone()));
        let recorder = config
            .recording
            .enabled
            .then(|| Arc::new(Recorder::new(config.recording.clone(), observer)));

        let manager = Arc::new(Self {
            router: TrackRouter::new(recorder.clone()),
            config,
            transport,
            registry,
            recorder,
            shutdown,
            mixes: Mutex::new(Vec::new()),
        });

        info!(
            max_rooms = manager.config.max_rooms,
            max_connections_per_room = manager.config.max_connections_per_room,
            recording = manager.config.recording.enabled,
            "SFU Manager initialized"
        );

        tokio::spawn(run_keyframe_dispatcher(
            Arc::clone(&manager.registry),
            manager.config.keyframe_interval(),
            manager.shutdown.clone(),
        ));
        if let Some(period) = manager.config.resync_interval() {
            tokio::spawn(run_periodic_resync(
                Arc::clone(&manager.registry),
                period,
                manager.shutdown.clone(),
            ));
        }

        manager
    }

    /// Join `participant` to `room_id`.
    ///
    /// The transport session is created first; if that fails the connection
    /// never enters the room.
    pub async fn join(
        self: &Arc<Self>,
        room_id: RoomId,
        participant: ParticipantId,
        signal: Arc<dyn SignalSink>,
    ) -> Result<Arc<Connection>> {
        if self.shutdown.is_cancelled() {
            return Err(SfuError::ShuttingDown);
        }
        if room_id.is_empty() {
            return Err(SfuError::InvalidRoomId);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = self.transport.create_session(events_tx).await?;
        let connection = Arc::new(Connection::new(
            room_id,
            participant,
            session,
            signal,
            self.shutdown.child_token(),
        ));

        let room = match self.registry.join(Arc::clone(&connection)) {
            Ok(room) => room,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        info!(
            room_id = %room.id,
            connection_id = %connection.id,
            participant = %connection.participant,
            "Participant joined"
        );

        tokio::spawn(Arc::clone(self).run_connection_events(
            room.clone(),
            Arc::clone(&connection),
            events_rx,
        ));
        room.request_renegotiation(RenegotiationCause::ConnectionJoined);

        Ok(connection)
    }

    /// Apply one signaling message received from `connection`'s client
    pub async fn handle_message(&self, connection: &Connection, message: SignalMessage) -> Result<()> {
        signaling::handle_message(connection, message).await
    }

    /// Remove `connection` from its room.
    ///
    /// Idempotent; returns false when the connection was already gone. The
    /// last connection to leave removes the room and starts its mix.
    pub async fn leave(&self, connection: &Arc<Connection>) -> bool {
        if !connection.close().await {
            return false;
        }

        let room_id = &connection.room_id;
        let Some(room) = self.registry.get(room_id) else {
            return true;
        };
        if room.remove_connection(&connection.id).is_none() {
            return true;
        }

        info!(
            room_id = %room_id,
            connection_id = %connection.id,
            participant = %connection.participant,
            remaining = room.connection_count(),
            "Participant left"
        );

        if let Some(removed) = self.registry.remove_if_empty(room_id) {
            self.finish_room(removed);
        } else {
            room.request_renegotiation(RenegotiationCause::ConnectionLeft);
        }
        true
    }

    /// Hand a removed room to the mixer in a detached task
    fn finish_room(&self, room: Arc<SfuRoom>) {
        let Some(recorder) = self.recorder.clone() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let room_id = room.id.clone();
            match recorder.finish_room(room).await {
                Ok(path) => debug!(room_id = %room_id, path = %path.display(), "Room mix finished"),
                Err(MixError::NoSegments) => {
                    debug!(room_id = %room_id, "Nothing recorded in room");
                }
                Err(e) => warn!(room_id = %room_id, error = %e, "Room mix failed"),
            }
        });

        let mut mixes = self.mixes.lock();
        mixes.retain(|h| !h.is_finished());
        mixes.push(handle);
    }

    async fn run_connection_events(
        self: Arc<Self>,
        room: Arc<SfuRoom>,
        connection: Arc<Connection>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let event = tokio::select! {
                () = connection.closed_token().cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::IceCandidate(candidate) => {
                    if let Err(e) = connection.send(SignalMessage::Candidate(candidate)) {
                        debug!(connection_id = %connection.id, error = %e, "Dropped local ICE candidate");
                    }
                }
                TransportEvent::ConnectionStateChanged(state) => {
                    debug!(connection_id = %connection.id, state = ?state, "Connection state changed");
                    if matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
                        self.leave(&connection).await;
                        break;
                    }
                }
                TransportEvent::TrackStarted(track) => {
                    self.router.on_track_started(&room, &connection, track);
                }
            }
        }
    }

    /// Close every connection, stop background tasks and wait for the mixes
    pub async fn shutdown(&self) {
        info!(rooms = self.registry.room_count(), "Shutting down SFU");
        self.shutdown.cancel();

        for room in self.registry.drain() {
            for connection in room.connections() {
                connection.close().await;
                room.remove_connection(&connection.id);
            }
            self.finish_room(room);
        }

        let mixes: Vec<_> = std::mem::take(&mut *self.mixes.lock());
        for handle in mixes {
            if let Err(e) = handle.await {
                warn!(error = %e, "Mix task failed");
            }
        }
        info!("SFU shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }

    pub fn room_stats(&self, room_id: &RoomId) -> Option<RoomStats> {
        self.registry.get(room_id).map(|room| room.get_stats())
    }

    /// Aggregate statistics over all rooms
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for room in self.registry.rooms() {
            let room_stats = room.get_stats();
            stats.active_rooms += 1;
            stats.total_connections += room_stats.connection_count;
            stats.total_audio_tracks += room_stats.audio_tracks;
            stats.total_video_tracks += room_stats.video_tracks;
            stats.total_bytes_relayed += room_stats.bytes_relayed;
            stats.total_packets_relayed += room_stats.packets_relayed;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChannelSignalSink;
    use crate::recording::LogRecordingObserver;
    use crate::test_helpers::{FakeInboundTrack, FakeTransport};
    use crate::track::TrackKind;
    use crate::types::TrackId;
    use tokio::time::{sleep, Duration};

    fn config() -> SfuConfig {
        let mut config = SfuConfig::default();
        config.recording.enabled = false;
        config
    }

    fn manager(config: SfuConfig) -> (Arc<SfuManager>, Arc<FakeTransport>) {
        let transport = FakeTransport::new();
        let manager = SfuManager::new(config, transport.clone(), Arc::new(LogRecordingObserver));
        (manager, transport)
    }

    fn offers(rx: &mut mpsc::Receiver<SignalMessage>) -> usize {
        let mut count = 0;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, SignalMessage::Offer(_)) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connection_receives_first_tracks() {
        let (manager, transport) = manager(config());
        let room_id = RoomId::from("r1");

        let (alice_sink, _alice_rx) = ChannelSignalSink::channel();
        manager
            .join(room_id.clone(), ParticipantId::from("alice"), Arc::new(alice_sink))
            .await
            .unwrap();
        let (audio, _audio_tx) = FakeInboundTrack::new("alice-audio", TrackKind::Audio, 1);
        let (video, _video_tx) = FakeInboundTrack::new("alice-video", TrackKind::Video, 2);
        transport.emit(0, TransportEvent::TrackStarted(audio));
        transport.emit(0, TransportEvent::TrackStarted(video));
        sleep(Duration::from_millis(50)).await;

        let (bob_sink, mut bob_rx) = ChannelSignalSink::channel();
        manager
            .join(room_id.clone(), ParticipantId::from("bob"), Arc::new(bob_sink))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(offers(&mut bob_rx), 1);
        let bob_session = transport.session(1).unwrap();
        assert_eq!(
            bob_session.outbound_ids(),
            vec![TrackId::from("alice-audio"), TrackId::from("alice-video")]
        );

        let stats = manager.room_stats(&room_id).unwrap();
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.audio_tracks, 1);
        assert_eq!(stats.video_tracks, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_session_never_enters_room() {
        let (manager, transport) = manager(config());
        transport.fail_sessions(true);

        let (sink, _rx) = ChannelSignalSink::channel();
        let result = manager
            .join(RoomId::from("r1"), ParticipantId::from("alice"), Arc::new(sink))
            .await;
        assert!(matches!(result, Err(SfuError::Transport(_))));
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_last_leave_removes_room() {
        let (manager, transport) = manager(config());
        let room_id = RoomId::from("r1");
        let (a_sink, _a_rx) = ChannelSignalSink::channel();
        let (b_sink, _b_rx) = ChannelSignalSink::channel();
        let alice = manager
            .join(room_id.clone(), ParticipantId::from("alice"), Arc::new(a_sink))
            .await
            .unwrap();
        let bob = manager
            .join(room_id.clone(), ParticipantId::from("bob"), Arc::new(b_sink))
            .await
            .unwrap();

        assert!(manager.leave(&alice).await);
        assert!(!manager.leave(&alice).await);
        assert_eq!(manager.room_count(), 1);
        assert_eq!(transport.session(0).unwrap().close_calls(), 1);

        let room = manager.registry().get(&room_id).unwrap();
        assert!(manager.leave(&bob).await);
        assert_eq!(manager.room_count(), 0);
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn test_failed_transport_leaves_room() {
        let (manager, transport) = manager(config());
        let (sink, _rx) = ChannelSignalSink::channel();
        let alice = manager
            .join(RoomId::from("r1"), ParticipantId::from("alice"), Arc::new(sink))
            .await
            .unwrap();

        transport.emit(0, TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
        tokio::time::timeout(Duration::from_secs(1), alice.closed_token().cancelled())
            .await
            .unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let (manager, transport) = manager(config());
        let (sink, mut rx) = ChannelSignalSink::channel();
        manager
            .join(RoomId::from("r1"), ParticipantId::from("alice"), Arc::new(sink))
            .await
            .unwrap();

        transport.emit(0, TransportEvent::IceCandidate(Default::default()));
        let message = loop {
            let message = rx.recv().await.unwrap();
            if !matches!(message, SignalMessage::Offer(_)) {
                break message;
            }
        };
        assert_eq!(message.event(), "candidate");
    }

    #[tokio::test]
    async fn test_join_after_shutdown_is_rejected() {
        let (manager, _) = manager(config());
        manager.shutdown().await;

        let (sink, _rx) = ChannelSignalSink::channel();
        let result = manager
            .join(RoomId::from("r1"), ParticipantId::from("alice"), Arc::new(sink))
            .await;
        assert!(matches!(result, Err(SfuError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (manager, transport) = manager(config());
        let (sink, _rx) = ChannelSignalSink::channel();
        let alice = manager
            .join(RoomId::from("r1"), ParticipantId::from("alice"), Arc::new(sink))
            .await
            .unwrap();

        manager.shutdown().await;
        assert!(alice.is_closed());
        assert_eq!(transport.session(0).unwrap().close_calls(), 1);
        assert_eq!(manager.room_count(), 0);
        assert_eq!(manager.stats().active_rooms, 0);
    }
}
