//! SFU Room management
//!
//! A room holds its connections and the track table. Both live behind one
//! read/write lock: structural changes (join, leave, publish, unpublish) take
//! the write lock, iteration takes the read lock, and neither is held across
//! an `.await`. Packet pumps never touch the lock while forwarding.

use crate::connection::Connection;
use crate::recording::{RoomTimeline, SegmentRecord};
use crate::signaling::RenegotiationCause;
use crate::track::{PublishedTrack, TrackStats};
use crate::types::{ConnectionId, ParticipantId, RoomId, TrackId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RoomState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    tracks: HashMap<TrackId, Arc<PublishedTrack>>,
}

/// Result of registering a track in the table
pub enum PublishOutcome {
    /// The track was added
    Added,
    /// The track replaced an existing publication with the same id
    Replaced(Arc<PublishedTrack>),
    /// The owner is no longer part of the room
    OwnerGone,
}

pub struct SfuRoom {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
    state: RwLock<RoomState>,
    timeline: Mutex<Option<RoomTimeline>>,
    captures_started: AtomicU32,
    pending: Mutex<Option<RenegotiationCause>>,
    renegotiate: Notify,
    closed: CancellationToken,
}

impl SfuRoom {
    pub fn new(id: RoomId, closed: CancellationToken) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            created_at,
            state: RwLock::new(RoomState::default()),
            timeline: Mutex::new(Some(RoomTimeline::new(created_at))),
            captures_started: AtomicU32::new(0),
            pending: Mutex::new(None),
            renegotiate: Notify::new(),
            closed,
        }
    }

    pub fn add_connection(&self, connection: Arc<Connection>) {
        if let Some(timeline) = self.timeline.lock().as_mut() {
            timeline.record_join(&connection.participant, connection.joined_at);
        }
        self.state
            .write()
            .connections
            .insert(connection.id, connection);
    }

    /// Remove a connection together with every track it published.
    ///
    /// The removed publications are cancelled so their pumps stop.
    pub fn remove_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Option<(Arc<Connection>, Vec<Arc<PublishedTrack>>)> {
        let (connection, removed) = {
            let mut state = self.state.write();
            let connection = state.connections.remove(connection_id)?;
            let owned: Vec<TrackId> = state
                .tracks
                .values()
                .filter(|t| t.owner == *connection_id)
                .map(|t| t.id.clone())
                .collect();
            let removed: Vec<_> = owned
                .iter()
                .filter_map(|id| state.tracks.remove(id))
                .collect();
            (connection, removed)
        };

        for track in &removed {
            track.cancel.cancel();
        }
        if let Some(timeline) = self.timeline.lock().as_mut() {
            timeline.record_leave(&connection.participant, Utc::now());
        }
        Some((connection, removed))
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.state.read().connections.get(connection_id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.read().connections.values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().connections.is_empty()
    }

    /// Register a published track, replacing any entry with the same id
    pub fn publish(&self, track: Arc<PublishedTrack>) -> PublishOutcome {
        let replaced = {
            let mut state = self.state.write();
            if !state.connections.contains_key(&track.owner) {
                return PublishOutcome::OwnerGone;
            }
            state.tracks.insert(track.id.clone(), track)
        };

        match replaced {
            Some(old) => {
                old.cancel.cancel();
                PublishOutcome::Replaced(old)
            }
            None => PublishOutcome::Added,
        }
    }

    /// Remove `track` if it is still the current publication under its id
    pub fn unpublish(&self, track: &Arc<PublishedTrack>) -> bool {
        let mut state = self.state.write();
        match state.tracks.get(&track.id) {
            Some(current) if Arc::ptr_eq(current, track) => {
                state.tracks.remove(&track.id);
                true
            }
            _ => false,
        }
    }

    pub fn track(&self, track_id: &TrackId) -> Option<Arc<PublishedTrack>> {
        self.state.read().tracks.get(track_id).cloned()
    }

    pub fn tracks(&self) -> Vec<Arc<PublishedTrack>> {
        self.state.read().tracks.values().cloned().collect()
    }

    /// Number of live entries in the track table
    pub fn track_count(&self) -> usize {
        self.state.read().tracks.len()
    }

    /// Ids of the tracks published by one connection
    pub fn published_by(&self, connection_id: &ConnectionId) -> Vec<TrackId> {
        self.state
            .read()
            .tracks
            .values()
            .filter(|t| t.owner == *connection_id)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Inbound video tracks paired with the connection that receives them
    pub fn video_sources(&self) -> Vec<(Arc<Connection>, u32)> {
        let state = self.state.read();
        state
            .tracks
            .values()
            .filter(|t| t.is_video())
            .filter_map(|t| {
                state
                    .connections
                    .get(&t.owner)
                    .map(|c| (Arc::clone(c), t.ssrc))
            })
            .collect()
    }

    /// Ask the room's negotiator for a renegotiation pass.
    ///
    /// Requests made before the negotiator wakes up are merged into one pass.
    pub fn request_renegotiation(&self, cause: RenegotiationCause) {
        {
            let mut pending = self.pending.lock();
            *pending = Some(match *pending {
                Some(current) => current.merge(cause),
                None => cause,
            });
        }
        self.renegotiate.notify_one();
    }

    pub(crate) fn take_pending_cause(&self) -> Option<RenegotiationCause> {
        self.pending.lock().take()
    }

    pub(crate) async fn renegotiation_requested(&self) {
        self.renegotiate.notified().await;
    }

    /// Cancelled once the room leaves the registry or the server shuts down
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn record_segment(&self, participant: &ParticipantId, segment: SegmentRecord) {
        if let Some(timeline) = self.timeline.lock().as_mut() {
            timeline.record_segment(participant, segment);
        }
    }

    /// Number the next audio capture of the room, starting at 1
    pub(crate) fn next_capture_id(&self) -> u32 {
        self.captures_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn register_capture(&self, handle: JoinHandle<()>) {
        if let Some(timeline) = self.timeline.lock().as_mut() {
            timeline.captures.push(handle);
        }
    }

    /// Detach the handles of the room's capture tasks
    pub(crate) fn take_captures(&self) -> Vec<JoinHandle<()>> {
        self.timeline
            .lock()
            .as_mut()
            .map(|timeline| std::mem::take(&mut timeline.captures))
            .unwrap_or_default()
    }

    /// Hand the timeline over to the mixer; only the first call gets it
    pub fn take_timeline(&self) -> Option<RoomTimeline> {
        self.timeline.lock().take()
    }

    pub fn get_stats(&self) -> RoomStats {
        let state = self.state.read();
        let tracks: Vec<TrackStats> = state.tracks.values().map(|t| TrackStats::from(t.as_ref())).collect();
        RoomStats {
            room_id: self.id.to_string(),
            connection_count: state.connections.len(),
            audio_tracks: state.tracks.values().filter(|t| t.is_audio()).count(),
            video_tracks: state.tracks.values().filter(|t| t.is_video()).count(),
            packets_relayed: tracks.iter().map(|t| t.packets_forwarded).sum(),
            bytes_relayed: tracks.iter().map(|t| t.bytes_forwarded).sum(),
            tracks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomStats {
    pub room_id: String,
    pub connection_count: usize,
    pub audio_tracks: usize,
    pub video_tracks: usize,
    pub packets_relayed: u64,
    pub bytes_relayed: u64,
    pub tracks: Vec<TrackStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_connection, test_published_track};
    use crate::track::TrackKind;

    #[tokio::test]
    async fn test_track_table_follows_connections() {
        let room = SfuRoom::new(RoomId::from("r"), CancellationToken::new());
        let (alice, _) = test_connection("r", "alice");
        let (bob, _) = test_connection("r", "bob");
        room.add_connection(alice.clone());
        room.add_connection(bob.clone());

        room.publish(test_published_track("a-audio", alice.id, TrackKind::Audio));
        room.publish(test_published_track("a-video", alice.id, TrackKind::Video));
        room.publish(test_published_track("b-audio", bob.id, TrackKind::Audio));
        assert_eq!(room.track_count(), 3);
        assert_eq!(room.published_by(&alice.id).len(), 2);

        let (_, removed) = room.remove_connection(&alice.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|t| t.cancel.is_cancelled()));
        assert_eq!(room.track_count(), 1);
        assert_eq!(room.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_owner() {
        let room = SfuRoom::new(RoomId::from("r"), CancellationToken::new());
        let (alice, _) = test_connection("r", "alice");

        let outcome = room.publish(test_published_track("t", alice.id, TrackKind::Audio));
        assert!(matches!(outcome, PublishOutcome::OwnerGone));
        assert_eq!(room.track_count(), 0);
    }

    #[tokio::test]
    async fn test_replace_and_stale_unpublish() {
        let room = SfuRoom::new(RoomId::from("r"), CancellationToken::new());
        let (alice, _) = test_connection("r", "alice");
        room.add_connection(alice.clone());

        let first = test_published_track("t", alice.id, TrackKind::Video);
        let second = test_published_track("t", alice.id, TrackKind::Video);
        assert!(matches!(room.publish(first.clone()), PublishOutcome::Added));
        assert!(matches!(
            room.publish(second.clone()),
            PublishOutcome::Replaced(old) if Arc::ptr_eq(&old, &first)
        ));
        assert!(first.cancel.is_cancelled());
        assert_eq!(room.track_count(), 1);

        // The replaced pump must not remove its successor
        assert!(!room.unpublish(&first));
        assert_eq!(room.track_count(), 1);
        assert!(room.unpublish(&second));
        assert_eq!(room.track_count(), 0);
    }

    #[tokio::test]
    async fn test_video_sources() {
        let room = SfuRoom::new(RoomId::from("r"), CancellationToken::new());
        let (alice, _) = test_connection("r", "alice");
        room.add_connection(alice.clone());
        room.publish(test_published_track("a", alice.id, TrackKind::Audio));
        room.publish(test_published_track("v", alice.id, TrackKind::Video));

        let sources = room.video_sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0.id, alice.id);
    }

    #[tokio::test]
    async fn test_pending_causes_merge() {
        let room = SfuRoom::new(RoomId::from("r"), CancellationToken::new());
        room.request_renegotiation(RenegotiationCause::Retry);
        room.request_renegotiation(RenegotiationCause::TrackAdded);

        assert_eq!(room.take_pending_cause(), Some(RenegotiationCause::TrackAdded));
        assert_eq!(room.take_pending_cause(), None);
    }

    #[tokio::test]
    async fn test_timeline_taken_once() {
        let room = SfuRoom::new(RoomId::from("r"), CancellationToken::new());
        let (alice, _) = test_connection("r", "alice");
        room.add_connection(alice.clone());
        room.remove_connection(&alice.id);

        let timeline = room.take_timeline().unwrap();
        let participant = timeline.participant(&alice.participant).unwrap();
        assert!(participant.left_at.is_some());
        assert!(room.take_timeline().is_none());
    }
}
