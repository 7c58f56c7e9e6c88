//! Track router
//!
//! Turns every inbound track into a room-table entry and runs the packet pump
//! that copies its RTP stream onto the forwarding track all other
//! participants receive. Audio packets are also teed into the recorder.

use crate::connection::Connection;
use crate::recording::Recorder;
use crate::room::{PublishOutcome, SfuRoom};
use crate::signaling::RenegotiationCause;
use crate::track::{forwarding_track, BufferPool, PublishedTrack, TrackKind};
use crate::transport::InboundTrack;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::TrackLocalWriter;

/// Why a packet pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The publication was cancelled (replaced, owner left or shutdown)
    Cancelled,
    /// The inbound track ended or failed
    ReadEnded,
    /// Writing to the forwarding track failed
    WriteFailed,
}

pub struct TrackRouter {
    buffers: Arc<BufferPool>,
    recorder: Option<Arc<Recorder>>,
}

impl TrackRouter {
    pub fn new(recorder: Option<Arc<Recorder>>) -> Self {
        Self {
            buffers: Arc::new(BufferPool::new()),
            recorder,
        }
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Publish an inbound track of `connection` in `room` and start its pump.
    ///
    /// Returns `None` when the connection already left the room.
    pub fn on_track_started(
        &self,
        room: &Arc<SfuRoom>,
        connection: &Arc<Connection>,
        inbound: Arc<dyn InboundTrack>,
    ) -> Option<JoinHandle<PumpExit>> {
        let track_id = inbound.id();
        let kind = inbound.kind();
        let forward = forwarding_track(inbound.codec(), &track_id, inbound.stream_id());
        let published = Arc::new(PublishedTrack::new(
            track_id.clone(),
            connection.id,
            kind,
            inbound.ssrc(),
            forward,
            connection.closed_token().child_token(),
        ));

        match room.publish(Arc::clone(&published)) {
            PublishOutcome::Added => {}
            PublishOutcome::Replaced(_) => {
                warn!(
                    room_id = %room.id,
                    track_id = %track_id,
                    "Replaced existing track with the same id"
                );
            }
            PublishOutcome::OwnerGone => {
                debug!(
                    room_id = %room.id,
                    track_id = %track_id,
                    "Track started after its connection left"
                );
                published.cancel.cancel();
                return None;
            }
        }

        info!(
            room_id = %room.id,
            connection_id = %connection.id,
            track_id = %track_id,
            kind = ?kind,
            ssrc = published.ssrc,
            "Track published"
        );
        room.request_renegotiation(RenegotiationCause::TrackAdded);

        let capture = match (&self.recorder, kind) {
            (Some(recorder), TrackKind::Audio) => {
                published.set_recording(true);
                Some(recorder.start_capture(room, connection.participant.clone(), track_id))
            }
            _ => None,
        };

        Some(tokio::spawn(run_pump(
            Arc::clone(room),
            inbound,
            published,
            capture,
            Arc::clone(&self.buffers),
        )))
    }
}

/// Drop header extensions negotiated with the publisher; receivers negotiate their own
fn strip_extensions(packet: &mut Packet) {
    packet.header.extension = false;
    packet.header.extension_profile = 0;
    packet.header.extensions.clear();
}

async fn pump_packets(
    inbound: &dyn InboundTrack,
    published: &PublishedTrack,
    capture: Option<&mpsc::Sender<Packet>>,
    buf: &mut [u8],
) -> PumpExit {
    loop {
        let read = tokio::select! {
            () = published.cancel.cancelled() => return PumpExit::Cancelled,
            read = inbound.read(buf) => read,
        };
        let mut packet = match read {
            Ok(packet) => packet,
            Err(e) => {
                debug!(track_id = %published.id, error = %e, "Inbound track ended");
                return PumpExit::ReadEnded;
            }
        };

        if let Some(capture) = capture {
            // Recording is best effort; a full queue drops the packet
            let _ = capture.try_send(packet.clone());
        }
        if !published.is_audio() {
            strip_extensions(&mut packet);
        }

        let size = packet.payload.len();
        if let Err(e) = published.forward.write_rtp(&packet).await {
            debug!(track_id = %published.id, error = %e, "Forwarding write failed");
            return PumpExit::WriteFailed;
        }
        published.counters().record(size);
    }
}

async fn run_pump(
    room: Arc<SfuRoom>,
    inbound: Arc<dyn InboundTrack>,
    published: Arc<PublishedTrack>,
    capture: Option<mpsc::Sender<Packet>>,
    buffers: Arc<BufferPool>,
) -> PumpExit {
    let mut buf = buffers.acquire();
    let exit = pump_packets(inbound.as_ref(), &published, capture.as_ref(), &mut buf).await;
    drop(capture);
    buffers.release(buf);

    if room.unpublish(&published) {
        room.request_renegotiation(RenegotiationCause::TrackRemoved);
    }
    published.cancel.cancel();
    published.set_recording(false);

    info!(
        room_id = %room.id,
        track_id = %published.id,
        exit = ?exit,
        packets = published.counters().packets(),
        "Track unpublished"
    );
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{rtp_packet, test_connection, FakeInboundTrack};
    use crate::types::{RoomId, TrackId};
    use tokio_util::sync::CancellationToken;
    use webrtc::rtp::header::Extension;

    fn room_with(participants: &[&str]) -> (Arc<SfuRoom>, Vec<Arc<Connection>>) {
        let room = Arc::new(SfuRoom::new(RoomId::from("r"), CancellationToken::new()));
        let connections = participants
            .iter()
            .map(|p| {
                let (conn, _) = test_connection("r", p);
                room.add_connection(Arc::clone(&conn));
                conn
            })
            .collect();
        (room, connections)
    }

    #[test]
    fn test_strip_extensions() {
        let mut packet = rtp_packet(1, 0, b"v");
        packet.header.extension = true;
        packet.header.extension_profile = 0xBEDE;
        packet.header.extensions.push(Extension {
            id: 1,
            payload: bytes::Bytes::from_static(&[1, 2]),
        });

        strip_extensions(&mut packet);
        assert!(!packet.header.extension);
        assert!(packet.header.extensions.is_empty());
    }

    #[tokio::test]
    async fn test_table_tracks_open_inbound_tracks() {
        let router = TrackRouter::new(None);
        let (room, conns) = room_with(&["alice", "bob"]);

        let (audio, audio_tx) = FakeInboundTrack::new("a-audio", TrackKind::Audio, 1);
        let (video, video_tx) = FakeInboundTrack::new("a-video", TrackKind::Video, 2);
        let (b_audio, _b_audio_tx) = FakeInboundTrack::new("b-audio", TrackKind::Audio, 3);
        let audio_pump = router.on_track_started(&room, &conns[0], audio).unwrap();
        router.on_track_started(&room, &conns[0], video).unwrap();
        router.on_track_started(&room, &conns[1], b_audio).unwrap();
        assert_eq!(room.track_count(), 3);

        audio_tx.send(rtp_packet(1, 0, b"hello")).unwrap();
        drop(audio_tx);
        assert_eq!(audio_pump.await.unwrap(), PumpExit::ReadEnded);
        assert_eq!(room.track_count(), 2);
        assert!(room.track(&TrackId::from("a-audio")).is_none());

        // Leaving cancels the remaining publication of alice
        let video_track = room.track(&TrackId::from("a-video")).unwrap();
        room.remove_connection(&conns[0].id);
        assert!(video_track.cancel.is_cancelled());
        assert_eq!(room.track_count(), 1);
        drop(video_tx);
    }

    #[tokio::test]
    async fn test_forwarding_counts_packets() {
        let router = TrackRouter::new(None);
        let (room, conns) = room_with(&["alice"]);
        let (audio, tx) = FakeInboundTrack::new("a", TrackKind::Audio, 1);
        let pump = router.on_track_started(&room, &conns[0], audio).unwrap();
        let published = room.track(&TrackId::from("a")).unwrap();

        for seq in 0..3 {
            tx.send(rtp_packet(seq, u32::from(seq) * 960, b"abcd")).unwrap();
        }
        drop(tx);
        pump.await.unwrap();

        assert_eq!(published.counters().packets(), 3);
        assert_eq!(published.counters().bytes(), 12);
        assert_eq!(router.buffers().idle(), 1);
    }

    #[tokio::test]
    async fn test_replacement_removes_old_entry_once() {
        let router = TrackRouter::new(None);
        let (room, conns) = room_with(&["alice"]);

        let (first, _first_tx) = FakeInboundTrack::new("cam", TrackKind::Video, 1);
        let (second, _second_tx) = FakeInboundTrack::new("cam", TrackKind::Video, 2);
        let first_pump = router.on_track_started(&room, &conns[0], first).unwrap();
        router.on_track_started(&room, &conns[0], second).unwrap();

        assert_eq!(first_pump.await.unwrap(), PumpExit::Cancelled);
        assert_eq!(room.track_count(), 1);
        assert_eq!(room.track(&TrackId::from("cam")).unwrap().ssrc, 2);
        assert_eq!(room.take_pending_cause(), Some(RenegotiationCause::TrackAdded));
    }

    #[tokio::test]
    async fn test_track_after_leave_is_ignored() {
        let router = TrackRouter::new(None);
        let (room, conns) = room_with(&["alice"]);
        room.remove_connection(&conns[0].id);

        let (audio, _tx) = FakeInboundTrack::new("a", TrackKind::Audio, 1);
        assert!(router.on_track_started(&room, &conns[0], audio).is_none());
        assert_eq!(room.track_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_close_stops_pump() {
        let router = TrackRouter::new(None);
        let (room, conns) = room_with(&["alice"]);
        let (video, _tx) = FakeInboundTrack::new("v", TrackKind::Video, 1);
        let pump = router.on_track_started(&room, &conns[0], video).unwrap();

        conns[0].close().await;
        assert_eq!(pump.await.unwrap(), PumpExit::Cancelled);
        assert_eq!(room.track_count(), 0);
        assert_eq!(room.take_pending_cause(), Some(RenegotiationCause::TrackAdded));
    }
}
