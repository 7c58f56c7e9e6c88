//! Room registry
//!
//! Maps room ids to live rooms. A room exists from the first join until the
//! last connection leaves; joins and removals of the same room are serialized
//! on the map entry, so a join can never land in a room that is being removed.

use crate::config::SfuConfig;
use crate::connection::Connection;
use crate::error::{Result, SfuError};
use crate::room::SfuRoom;
use crate::signaling::run_negotiator;
use crate::types::RoomId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    rooms: DashMap<RoomId, Arc<SfuRoom>>,
    /// Parent of every room's closed token
    shutdown: CancellationToken,
}

impl RoomRegistry {
    pub fn new(config: Arc<SfuConfig>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            rooms: DashMap::new(),
            shutdown,
        }
    }

    fn check_accepting(&self, room_id: &RoomId) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(SfuError::ShuttingDown);
        }
        if room_id.is_empty() {
            return Err(SfuError::InvalidRoomId);
        }
        Ok(())
    }

    fn check_room_limit(&self) -> Result<()> {
        let max = self.config.max_rooms;
        if max > 0 && self.rooms.len() >= max {
            warn!(max_rooms = max, "Room limit reached");
            return Err(SfuError::RoomLimit);
        }
        Ok(())
    }

    /// Build a room and start its negotiator
    fn open_room(&self, room_id: RoomId) -> Arc<SfuRoom> {
        let room = Arc::new(SfuRoom::new(room_id, self.shutdown.child_token()));
        tokio::spawn(run_negotiator(Arc::clone(&room), Arc::clone(&self.config)));
        info!(room_id = %room.id, "Created room");
        room
    }

    /// Return the room for `room_id`, creating it if needed
    pub fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        self.check_accepting(room_id)?;
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(Arc::clone(room.value()));
        }
        self.check_room_limit()?;

        let room = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => Arc::clone(entry.insert(self.open_room(room_id.clone())).value()),
        };
        Ok(room)
    }

    /// Add `connection` to its room, creating the room on first join.
    ///
    /// The insertion happens while the registry entry is held, so the room
    /// cannot be removed between lookup and insertion.
    pub fn join(&self, connection: Arc<Connection>) -> Result<Arc<SfuRoom>> {
        let room_id = connection.room_id.clone();
        self.check_accepting(&room_id)?;
        if !self.rooms.contains_key(&room_id) {
            self.check_room_limit()?;
        }

        let max_connections = self.config.max_connections_per_room;
        let room = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => {
                let room = Arc::clone(entry.get());
                if max_connections > 0 && room.connection_count() >= max_connections {
                    warn!(
                        room_id = %room_id,
                        max_connections,
                        "Connection limit reached for room"
                    );
                    return Err(SfuError::RoomFull(room_id));
                }
                room.add_connection(connection);
                room
            }
            Entry::Vacant(entry) => {
                let room = self.open_room(room_id);
                room.add_connection(connection);
                Arc::clone(entry.insert(room).value())
            }
        };

        debug!(
            room_id = %room.id,
            connections = room.connection_count(),
            "Connection joined room"
        );
        Ok(room)
    }

    /// Remove the room if it has no connections left.
    ///
    /// The removed room's closed token is cancelled, which stops its
    /// negotiator and pending retries.
    pub fn remove_if_empty(&self, room_id: &RoomId) -> Option<Arc<SfuRoom>> {
        let (_, room) = self.rooms.remove_if(room_id, |_, room| room.is_empty())?;
        room.closed_token().cancel();
        info!(room_id = %room_id, "Removed empty room");
        Some(room)
    }

    pub fn get(&self, room_id: &RoomId) -> Option<Arc<SfuRoom>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    pub fn rooms(&self) -> Vec<Arc<SfuRoom>> {
        self.rooms.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Drop every room from the map, returning them
    pub(crate) fn drain(&self) -> Vec<Arc<SfuRoom>> {
        let ids: Vec<RoomId> = self.rooms.iter().map(|r| r.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.rooms.remove(id).map(|(_, room)| room))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_connection, test_published_track};
    use crate::track::TrackKind;

    fn registry(config: SfuConfig) -> RoomRegistry {
        RoomRegistry::new(Arc::new(config), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_join_creates_room_once() {
        let registry = registry(SfuConfig::default());
        let (alice, _) = test_connection("r1", "alice");
        let (bob, _) = test_connection("r1", "bob");

        let first = registry.join(alice).unwrap();
        let second = registry.join(bob).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count(), 1);
        assert_eq!(first.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_only_when_empty() {
        let registry = registry(SfuConfig::default());
        let (alice, _) = test_connection("r1", "alice");
        let room = registry.join(alice.clone()).unwrap();

        assert!(registry.remove_if_empty(&RoomId::from("r1")).is_none());
        room.remove_connection(&alice.id);
        let removed = registry.remove_if_empty(&RoomId::from("r1")).unwrap();
        assert!(removed.is_closed());
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_recreated_room_starts_empty() {
        let registry = registry(SfuConfig::default());
        let (alice, _) = test_connection("r1", "alice");
        let room = registry.join(alice.clone()).unwrap();
        room.publish(test_published_track("a", alice.id, TrackKind::Audio));
        room.remove_connection(&alice.id);
        registry.remove_if_empty(&RoomId::from("r1"));

        let (bob, _) = test_connection("r1", "bob");
        let fresh = registry.join(bob).unwrap();
        assert!(!Arc::ptr_eq(&room, &fresh));
        assert_eq!(fresh.track_count(), 0);
        assert!(!fresh.is_closed());
    }

    #[tokio::test]
    async fn test_limits() {
        let registry = registry(SfuConfig {
            max_rooms: 1,
            max_connections_per_room: 1,
            ..SfuConfig::default()
        });
        let (alice, _) = test_connection("r1", "alice");
        let (bob, _) = test_connection("r1", "bob");
        let (carol, _) = test_connection("r2", "carol");

        registry.join(alice).unwrap();
        assert!(matches!(registry.join(bob), Err(SfuError::RoomFull(_))));
        assert!(matches!(registry.join(carol), Err(SfuError::RoomLimit)));
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let shutdown = CancellationToken::new();
        let registry = RoomRegistry::new(Arc::new(SfuConfig::default()), shutdown.clone());
        let (alice, _) = test_connection("r1", "alice");
        let room = registry.join(alice).unwrap();

        shutdown.cancel();
        assert!(room.is_closed());
        let (bob, _) = test_connection("r1", "bob");
        assert!(matches!(registry.join(bob), Err(SfuError::ShuttingDown)));
        assert!(matches!(
            registry.get_or_create(&RoomId::from("")),
            Err(SfuError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_empty_room_id_rejected() {
        let registry = registry(SfuConfig::default());
        assert!(matches!(
            registry.get_or_create(&RoomId::from("")),
            Err(SfuError::InvalidRoomId)
        ));
    }
}
