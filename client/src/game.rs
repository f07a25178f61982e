use log::{debug, info, warn};
use shared::{ErrorCode, PeerState, Position, ServerMessage};
use std::collections::BTreeMap;

/// Client-side picture of a space, rebuilt purely from server frames.
#[derive(Debug, Clone, Default)]
pub struct SpaceView {
    pub joined: bool,
    pub user_id: Option<String>,
    pub position: Position,
    /// Peers keyed by connection id.
    pub peers: BTreeMap<String, PeerState>,
    pub last_error: Option<(ErrorCode, String)>,
    pub confirmed_moves: u32,
    pub rejected_moves: u32,
}

impl SpaceView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::SpaceJoined { spawn, users } => {
                info!("Joined at {} with {} peer(s)", spawn, users.len());
                self.joined = true;
                self.position = *spawn;
                self.peers = users
                    .iter()
                    .map(|peer| (peer.id.clone(), peer.clone()))
                    .collect();
            }
            ServerMessage::UserJoined(peer) => {
                info!("{} joined at {}", peer.user_id, peer.position());
                self.peers.insert(peer.id.clone(), peer.clone());
            }
            ServerMessage::MoveConfirmed { position, user_id } => {
                debug!("Move to {} confirmed", position);
                self.position = *position;
                self.user_id = Some(user_id.clone());
                self.confirmed_moves += 1;
            }
            ServerMessage::MoveRejected(position) => {
                debug!("Move rejected, staying at {}", position);
                self.position = *position;
                self.rejected_moves += 1;
            }
            ServerMessage::Movement(peer) => {
                debug!("{} moved to {}", peer.user_id, peer.position());
                self.peers.insert(peer.id.clone(), peer.clone());
            }
            ServerMessage::UserLeft { id, user_id } => {
                info!("{} left", user_id);
                self.peers.remove(id);
            }
            ServerMessage::Error { message, code } => {
                warn!("Server error {}: {}", code, message);
                self.last_error = Some((*code, message.clone()));
            }
        }
    }

    pub fn peer_positions(&self) -> Vec<(String, Position)> {
        self.peers
            .values()
            .map(|peer| (peer.user_id.clone(), peer.position()))
            .collect()
    }
}
