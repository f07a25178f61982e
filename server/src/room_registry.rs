//! Room membership and fan-out for the shared grid server
//!
//! This module tracks which connections occupy which space, including:
//! - Room lifecycle (created on first join, purged when the last member leaves)
//! - Per-room grid dimensions, fixed when the room is created
//! - Join-time snapshots of the other occupants
//! - Best-effort broadcast to every member except the sender
//!
//! All reads and writes go through a single `RwLock`. Mutations take the write
//! half, snapshots and broadcasts the read half. Delivery never awaits a
//! peer: frames are pushed with `try_send`, so a slow or dead peer can not
//! stall the room while the lock is held.

use log::{debug, info, warn};
use shared::{Dimensions, PeerState, Position, ServerFrame, ServerMessage};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

/// Outbound queue of one connection. Bounded; see [`deliver`].
pub type Outbox = mpsc::Sender<ServerFrame>;

/// A room member as seen by the registry
///
/// The owning session holds the authoritative connection state. The registry
/// keeps a copy of the fields peers need plus the member's outbox.
#[derive(Debug, Clone)]
pub struct Occupant {
    pub connection_id: String,
    pub subject_id: String,
    pub position: Position,
    outbox: Outbox,
}

impl Occupant {
    pub fn new(
        connection_id: impl Into<String>,
        subject_id: impl Into<String>,
        position: Position,
        outbox: Outbox,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            subject_id: subject_id.into(),
            position,
            outbox,
        }
    }

    pub fn peer_state(&self) -> PeerState {
        PeerState {
            id: self.connection_id.clone(),
            user_id: self.subject_id.clone(),
            x: self.position.x,
            y: self.position.y,
        }
    }
}

/// Pushes a frame onto an outbox without waiting
///
/// A full outbox means the consumer is not keeping up: the frame is dropped
/// and the drop logged. A closed outbox means the connection is going away.
/// Returns whether the frame was queued.
pub fn deliver(outbox: &Outbox, connection_id: &str, frame: ServerFrame) -> bool {
    match outbox.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            warn!(
                "Outbox of connection {} is full, dropping {} frame",
                connection_id,
                frame.message.kind()
            );
            false
        }
        Err(TrySendError::Closed(frame)) => {
            debug!(
                "Connection {} is closed, dropping {} frame",
                connection_id,
                frame.message.kind()
            );
            false
        }
    }
}

#[derive(Debug)]
struct Room {
    dimensions: Dimensions,
    occupants: Vec<Occupant>,
}

impl Room {
    fn new(dimensions: Dimensions) -> Self {
        Self {
            dimensions,
            occupants: Vec::new(),
        }
    }

    fn contains(&self, connection_id: &str) -> bool {
        self.occupants
            .iter()
            .any(|o| o.connection_id == connection_id)
    }

    fn snapshot(&self, excluding: &str) -> Vec<PeerState> {
        self.occupants
            .iter()
            .filter(|o| o.connection_id != excluding)
            .map(Occupant::peer_state)
            .collect()
    }

    fn broadcast(&self, excluding: &str, frame: &ServerFrame) -> usize {
        self.occupants
            .iter()
            .filter(|o| o.connection_id != excluding)
            .filter(|o| deliver(&o.outbox, &o.connection_id, frame.clone()))
            .count()
    }

    fn remove(&mut self, connection_id: &str) -> Option<Occupant> {
        let index = self
            .occupants
            .iter()
            .position(|o| o.connection_id == connection_id)?;
        Some(self.occupants.remove(index))
    }
}

/// Outcome of admitting a connection into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Dimensions of the room the connection landed in.
    pub dimensions: Dimensions,
    /// Cell the connection was placed on.
    pub spawn: Position,
    /// Everyone else in the room at the moment of admission, in join order.
    pub peers: Vec<PeerState>,
}

/// Process-wide table of rooms, keyed by space id
///
/// Constructed explicitly and shared through an `Arc`, so tests can run any
/// number of isolated registries side by side.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an occupant to a room, creating the room with `dimensions`
    /// if it does not exist yet
    ///
    /// Returns the room's dimensions, which are those of the first join. A
    /// connection already present in the room is not added twice.
    pub async fn add(&self, space_id: &str, dimensions: Dimensions, occupant: Occupant) -> Dimensions {
        let mut rooms = self.rooms.write().await;
        Self::insert(&mut rooms, space_id, dimensions, occupant)
    }

    /// Removes a connection from a room by id, purging the room if it is
    /// left empty. Returns the removed occupant.
    pub async fn remove(&self, connection_id: &str, space_id: &str) -> Option<Occupant> {
        let mut rooms = self.rooms.write().await;
        Self::take(&mut rooms, connection_id, space_id)
    }

    /// Point-in-time list of a room's members, minus `excluding`.
    pub async fn snapshot(&self, space_id: &str, excluding: &str) -> Vec<PeerState> {
        let rooms = self.rooms.read().await;
        rooms
            .get(space_id)
            .map(|room| room.snapshot(excluding))
            .unwrap_or_default()
    }

    /// Delivers `frame` to every member of the room except `excluding`.
    /// Returns how many members the frame was queued for.
    pub async fn broadcast(&self, space_id: &str, excluding: &str, frame: ServerFrame) -> usize {
        let rooms = self.rooms.read().await;
        rooms
            .get(space_id)
            .map(|room| room.broadcast(excluding, &frame))
            .unwrap_or(0)
    }

    /// Places an occupant in a room and welcomes it, all under one write lock
    ///
    /// `place` picks the spawn cell from the room's effective dimensions.
    /// The newcomer's `space-joined` (tagged with `request_id`) is queued on
    /// its own outbox before it becomes visible to anyone else, then the rest
    /// of the room gets `user-joined`. So `space-joined` is always the first
    /// frame a joiner receives, and every concurrent joiner learns about this
    /// occupant exactly once: through its own snapshot or through the
    /// announcement, never both.
    pub async fn admit<F>(
        &self,
        space_id: &str,
        dimensions: Dimensions,
        mut occupant: Occupant,
        place: F,
        request_id: Option<String>,
    ) -> Admission
    where
        F: FnOnce(Dimensions) -> Position,
    {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(space_id.to_string()).or_insert_with(|| {
            info!("Opened room {} ({})", space_id, dimensions);
            Room::new(dimensions)
        });
        let dimensions = room.dimensions;
        let connection_id = occupant.connection_id.clone();

        if let Some(existing) = room
            .occupants
            .iter()
            .find(|o| o.connection_id == connection_id)
        {
            warn!("Connection {} is already in space {}", connection_id, space_id);
            return Admission {
                dimensions,
                spawn: existing.position,
                peers: room.snapshot(&connection_id),
            };
        }

        let spawn = place(dimensions);
        occupant.position = spawn;
        let peers = room.snapshot(&connection_id);

        let welcome = ServerFrame::reply(
            ServerMessage::SpaceJoined {
                spawn,
                users: peers.clone(),
            },
            request_id,
        );
        deliver(&occupant.outbox, &connection_id, welcome);

        let announcement = ServerFrame::broadcast(ServerMessage::UserJoined(occupant.peer_state()));
        let notified = room.broadcast(&connection_id, &announcement);
        room.occupants.push(occupant);

        debug!(
            "Announced {} to {} peer(s) in space {}",
            connection_id, notified, space_id
        );

        Admission {
            dimensions,
            spawn,
            peers,
        }
    }

    /// Removes an occupant and tells the remaining members with `user-left`.
    /// Returns `None`, and notifies nobody, if the connection was not there.
    pub async fn depart(&self, connection_id: &str, space_id: &str) -> Option<Occupant> {
        let mut rooms = self.rooms.write().await;
        let occupant = Self::take(&mut rooms, connection_id, space_id)?;

        if let Some(room) = rooms.get(space_id) {
            let farewell = ServerFrame::broadcast(ServerMessage::UserLeft {
                id: occupant.connection_id.clone(),
                user_id: occupant.subject_id.clone(),
            });
            room.broadcast(connection_id, &farewell);
        }

        Some(occupant)
    }

    /// Records an occupant's new position and broadcasts the `movement` to
    /// the rest of the room. Returns false if the occupant is not in the room.
    pub async fn relocate(&self, space_id: &str, connection_id: &str, position: Position) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(space_id) else {
            return false;
        };
        let Some(occupant) = room
            .occupants
            .iter_mut()
            .find(|o| o.connection_id == connection_id)
        else {
            return false;
        };

        occupant.position = position;
        let movement = ServerFrame::broadcast(ServerMessage::Movement(occupant.peer_state()));
        room.broadcast(connection_id, &movement);
        true
    }

    /// Dimensions the room was created with, if it exists.
    pub async fn dimensions(&self, space_id: &str) -> Option<Dimensions> {
        let rooms = self.rooms.read().await;
        rooms.get(space_id).map(|room| room.dimensions)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn occupant_count(&self, space_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(space_id).map_or(0, |room| room.occupants.len())
    }

    fn insert(
        rooms: &mut HashMap<String, Room>,
        space_id: &str,
        dimensions: Dimensions,
        occupant: Occupant,
    ) -> Dimensions {
        let room = rooms.entry(space_id.to_string()).or_insert_with(|| {
            info!("Opened room {} ({})", space_id, dimensions);
            Room::new(dimensions)
        });

        if room.contains(&occupant.connection_id) {
            warn!(
                "Connection {} is already in space {}",
                occupant.connection_id, space_id
            );
        } else {
            room.occupants.push(occupant);
        }

        room.dimensions
    }

    fn take(rooms: &mut HashMap<String, Room>, connection_id: &str, space_id: &str) -> Option<Occupant> {
        let room = rooms.get_mut(space_id)?;
        let occupant = room.remove(connection_id);

        if room.occupants.is_empty() {
            rooms.remove(space_id);
            info!("Closed empty room {}", space_id);
        }

        occupant
    }
}
