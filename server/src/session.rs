//! Per-connection protocol state machine.
//!
//! A [`Session`] is created for every accepted connection and driven by that
//! connection's receive loop, one frame at a time. It moves through
//! `Unjoined -> Active -> Closed`:
//!
//! - `join` authenticates, resolves the space, spawns the occupant at a random
//!   cell and admits it into the room.
//! - `move` validates a single orthogonal step against the room's bounds.
//! - `disconnect` leaves the room and tells the remaining occupants.
//!
//! Only this session ever mutates its own connection state; everything other
//! connections can see goes through the [`RoomRegistry`].

use crate::auth::{Authenticator, Role};
use crate::directory::{DirectoryError, SpaceDirectory};
use crate::error::ProtocolError;
use crate::room_registry::{deliver, Occupant, Outbox, RoomRegistry};
use log::{debug, info, warn};
use rand::Rng;
use shared::{
    is_legal_move, ClientMessage, DecodeError, Dimensions, JoinPayload, MovePayload, Position,
    ServerFrame, ServerMessage,
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unjoined,
    Active,
    Closed,
}

/// What the receive loop should do after a frame has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Identity and position of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connection_id: String,
    pub subject_id: Option<String>,
    pub role: Option<Role>,
    pub space_id: Option<String>,
    pub position: Position,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            subject_id: None,
            role: None,
            space_id: None,
            position: Position::default(),
        }
    }
}

/// Collaborators shared by every session of a server.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<RoomRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub directory: Arc<dyn SpaceDirectory>,
}

pub struct Session {
    state: ConnectionState,
    phase: Phase,
    outbox: Outbox,
    services: Services,
}

impl Session {
    pub fn new(services: Services, outbox: Outbox) -> Self {
        Self {
            state: ConnectionState::new(),
            phase: Phase::Unjoined,
            outbox,
            services,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.state.connection_id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Decodes and dispatches one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        if self.phase == Phase::Closed {
            debug!(
                "Ignoring frame for closed connection {}",
                self.state.connection_id
            );
            return Flow::Close;
        }

        let frame = ClientMessage::decode(text);
        let request_id = frame.request_id;

        let result = match frame.message {
            Ok(ClientMessage::Join(join)) => self.join(join, request_id.clone()).await,
            Ok(ClientMessage::Move(step)) => self.move_to(step, request_id.clone()).await,
            Err(e) => Err(ProtocolError::from(e)),
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(error) => self.fail(error, request_id).await,
        }
    }

    /// Reports a frame the transport could not hand over as text.
    pub async fn handle_malformed(&mut self, reason: &str) -> Flow {
        if self.phase == Phase::Closed {
            return Flow::Close;
        }
        self.fail(DecodeError::Malformed(reason.to_string()).into(), None)
            .await
    }

    async fn join(
        &mut self,
        payload: JoinPayload,
        request_id: Option<String>,
    ) -> Result<(), ProtocolError> {
        if let (Phase::Active, Some(space_id)) = (self.phase, &self.state.space_id) {
            return Err(ProtocolError::AlreadyJoined(space_id.clone()));
        }

        let subject = self
            .services
            .authenticator
            .verify(&payload.token)
            .map_err(ProtocolError::InvalidToken)?;

        let resolved = self
            .services
            .directory
            .resolve(&payload.space_id)
            .map_err(|e| match e {
                DirectoryError::NotFound(id) => ProtocolError::SpaceNotFound(id),
                DirectoryError::Unavailable(reason) => ProtocolError::Internal(reason),
            })?;

        // The spawn is drawn from the live room's bounds, which may predate
        // the directory entry, and the welcome is queued by the registry.
        let occupant = Occupant::new(
            self.state.connection_id.clone(),
            subject.user_id.clone(),
            Position::default(),
            self.outbox.clone(),
        );
        let admission = self
            .services
            .registry
            .admit(&payload.space_id, resolved, occupant, random_position, request_id)
            .await;

        self.state.subject_id = Some(subject.user_id.clone());
        self.state.role = subject.role;
        self.state.space_id = Some(payload.space_id.clone());
        self.state.position = admission.spawn;
        self.phase = Phase::Active;

        info!(
            "Connection {} ({}, {:?}) joined space {} ({}) at {} with {} peer(s)",
            self.state.connection_id,
            subject.user_id,
            subject.role,
            payload.space_id,
            admission.dimensions,
            admission.spawn,
            admission.peers.len()
        );

        Ok(())
    }

    async fn move_to(
        &mut self,
        payload: MovePayload,
        request_id: Option<String>,
    ) -> Result<(), ProtocolError> {
        let (space_id, user_id) = match (self.phase, &self.state.space_id, &self.state.subject_id) {
            (Phase::Active, Some(space_id), Some(user_id)) => (space_id.clone(), user_id.clone()),
            _ => return Err(ProtocolError::NotInSpace),
        };

        let dimensions = self
            .services
            .registry
            .dimensions(&space_id)
            .await
            .ok_or_else(|| ProtocolError::Internal(format!("room {} is gone", space_id)))?;

        let current = self.state.position;
        let target = Position::new(payload.x, payload.y);

        if !is_legal_move(dimensions, current, target) {
            debug!(
                "Rejected move of {} from {} to {} in {}",
                self.state.connection_id, current, target, dimensions
            );
            self.reply(ServerMessage::MoveRejected(current), request_id);
            return Ok(());
        }

        self.state.position = target;
        self.reply(
            ServerMessage::MoveConfirmed {
                position: target,
                user_id,
            },
            request_id,
        );

        let relocated = self
            .services
            .registry
            .relocate(&space_id, &self.state.connection_id, target)
            .await;
        if !relocated {
            return Err(ProtocolError::Internal(format!(
                "connection missing from room {}",
                space_id
            )));
        }

        Ok(())
    }

    /// Leaves the room, if any, and closes the session. Safe to call more
    /// than once; only the first call has an effect.
    pub async fn disconnect(&mut self) {
        let previous = std::mem::replace(&mut self.phase, Phase::Closed);
        if previous == Phase::Closed {
            return;
        }

        if previous == Phase::Active {
            if let Some(space_id) = &self.state.space_id {
                let departed = self
                    .services
                    .registry
                    .depart(&self.state.connection_id, space_id)
                    .await;
                if departed.is_some() {
                    info!(
                        "Connection {} left space {}",
                        self.state.connection_id, space_id
                    );
                }
            }
        }
    }

    async fn fail(&mut self, error: ProtocolError, request_id: Option<String>) -> Flow {
        if error.is_fatal() {
            warn!(
                "Closing connection {} after error: {}",
                self.state.connection_id, error
            );
        } else {
            debug!(
                "Protocol error on connection {}: {}",
                self.state.connection_id, error
            );
        }

        self.reply(error.to_message(), request_id);

        if error.is_fatal() {
            self.disconnect().await;
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    fn reply(&self, message: ServerMessage, request_id: Option<String>) {
        deliver(
            &self.outbox,
            &self.state.connection_id,
            ServerFrame::reply(message, request_id),
        );
    }
}

fn random_position(dimensions: Dimensions) -> Position {
    let mut rng = rand::thread_rng();
    let width = i32::try_from(dimensions.width).unwrap_or(i32::MAX);
    let height = i32::try_from(dimensions.height).unwrap_or(i32::MAX);
    Position::new(rng.gen_range(0..width), rng.gen_range(0..height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, Subject};
    use crate::directory::SpaceCatalog;
    use shared::{Direction, ErrorCode, PeerState};
    use std::collections::{HashMap, HashSet};
    use tokio::sync::mpsc::{self, Receiver};

    /// Accepts tokens of the form `token-<user>`.
    struct PrefixTokens;

    impl Authenticator for PrefixTokens {
        fn verify(&self, token: &str) -> Result<Subject, AuthError> {
            token
                .strip_prefix("token-")
                .filter(|user| !user.is_empty())
                .map(|user| Subject {
                    user_id: user.to_string(),
                    role: Some(Role::User),
                })
                .ok_or(AuthError::MissingSubject)
        }
    }

    struct BrokenDirectory;

    impl SpaceDirectory for BrokenDirectory {
        fn resolve(&self, _space_id: &str) -> Result<Dimensions, DirectoryError> {
            Err(DirectoryError::Unavailable("database offline".to_string()))
        }
    }

    fn services() -> Services {
        let catalog = SpaceCatalog::new()
            .with_space("lobby", Dimensions::new(10, 10).unwrap())
            .with_space("corridor", Dimensions::new(2, 1).unwrap())
            .with_space("closet", Dimensions::new(1, 1).unwrap())
            .with_space("hall", Dimensions::new(10, 10).unwrap());

        Services {
            registry: Arc::new(RoomRegistry::new()),
            authenticator: Arc::new(PrefixTokens),
            directory: Arc::new(catalog),
        }
    }

    fn session(services: &Services) -> (Session, Receiver<ServerFrame>) {
        session_with_capacity(services, 64)
    }

    fn session_with_capacity(services: &Services, capacity: usize) -> (Session, Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Session::new(services.clone(), tx), rx)
    }

    fn drain(rx: &mut Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn join_text(space: &str, user: &str, request_id: &str) -> String {
        format!(
            r#"{{"type":"join","payload":{{"spaceId":"{}","token":"token-{}"}},"requestId":"{}"}}"#,
            space, user, request_id
        )
    }

    fn move_text(position: Position) -> String {
        format!(
            r#"{{"type":"move","payload":{{"x":{},"y":{}}}}}"#,
            position.x, position.y
        )
    }

    fn error_code(frame: &ServerFrame) -> ErrorCode {
        match &frame.message {
            ServerMessage::Error { code, .. } => *code,
            other => panic!("Expected an error frame, got {:?}", other),
        }
    }

    async fn joined(services: &Services, space: &str, user: &str) -> (Session, Receiver<ServerFrame>) {
        let (mut session, mut rx) = session(services);
        assert_eq!(
            session.handle_text(&join_text(space, user, "join")).await,
            Flow::Continue
        );
        assert_eq!(session.phase(), Phase::Active);
        drain(&mut rx);
        (session, rx)
    }

    #[tokio::test]
    async fn test_join_spawns_in_bounds_and_echoes_request_id() {
        let services = services();

        for _ in 0..50 {
            let (mut session, mut rx) = session(&services);
            session.handle_text(&join_text("lobby", "ada", "r-1")).await;

            let frames = drain(&mut rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].request_id.as_deref(), Some("r-1"));
            match &frames[0].message {
                ServerMessage::SpaceJoined { spawn, .. } => {
                    assert!(Dimensions::new(10, 10).unwrap().contains(*spawn));
                    assert_eq!(*spawn, session.state().position);
                }
                other => panic!("Unexpected message {:?}", other),
            }
            session.disconnect().await;
        }

        assert_eq!(services.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_two_joins_see_each_other() {
        let services = services();
        let (mut first, mut rx_first) = session(&services);
        let (mut second, mut rx_second) = session(&services);

        first.handle_text(&join_text("lobby", "ada", "a")).await;
        let first_frames = drain(&mut rx_first);
        let first_spawn = match &first_frames[0].message {
            ServerMessage::SpaceJoined { spawn, users } => {
                assert!(users.is_empty());
                *spawn
            }
            other => panic!("Unexpected message {:?}", other),
        };

        second.handle_text(&join_text("lobby", "bob", "b")).await;
        let second_frames = drain(&mut rx_second);
        assert_eq!(second_frames.len(), 1);
        let second_spawn = match &second_frames[0].message {
            ServerMessage::SpaceJoined { spawn, users } => {
                assert_eq!(
                    users,
                    &vec![PeerState {
                        id: first.connection_id().to_string(),
                        user_id: "ada".to_string(),
                        x: first_spawn.x,
                        y: first_spawn.y,
                    }]
                );
                *spawn
            }
            other => panic!("Unexpected message {:?}", other),
        };

        let announcements = drain(&mut rx_first);
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].request_id, None);
        assert_eq!(
            announcements[0].message,
            ServerMessage::UserJoined(PeerState {
                id: second.connection_id().to_string(),
                user_id: "bob".to_string(),
                x: second_spawn.x,
                y: second_spawn.y,
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_token_is_recoverable() {
        let services = services();
        let (mut session, mut rx) = session(&services);

        let flow = session
            .handle_text(r#"{"type":"join","payload":{"spaceId":"lobby","token":"forged"},"requestId":"x"}"#)
            .await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.phase(), Phase::Unjoined);
        let frames = drain(&mut rx);
        assert_eq!(error_code(&frames[0]), ErrorCode::InvalidToken);
        assert_eq!(frames[0].request_id.as_deref(), Some("x"));
        assert_eq!(services.registry.room_count().await, 0);

        session.handle_text(&join_text("lobby", "ada", "y")).await;
        assert_eq!(session.phase(), Phase::Active);
        assert_eq!(session.state().subject_id.as_deref(), Some("ada"));
        assert_eq!(session.state().role, Some(Role::User));
    }

    #[tokio::test]
    async fn test_unknown_space_is_recoverable() {
        let services = services();
        let (mut session, mut rx) = session(&services);

        let flow = session.handle_text(&join_text("attic", "ada", "s")).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.phase(), Phase::Unjoined);
        assert_eq!(session.state().space_id, None);
        assert_eq!(error_code(&drain(&mut rx)[0]), ErrorCode::SpaceNotFound);
    }

    #[tokio::test]
    async fn test_second_join_is_rejected() {
        let services = services();
        let (mut session, mut rx) = joined(&services, "lobby", "ada").await;
        let position = session.state().position;

        let flow = session.handle_text(&join_text("hall", "ada", "again")).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(error_code(&drain(&mut rx)[0]), ErrorCode::AlreadyJoined);
        assert_eq!(session.state().space_id.as_deref(), Some("lobby"));
        assert_eq!(session.state().position, position);
        assert_eq!(services.registry.occupant_count("lobby").await, 1);
        assert_eq!(services.registry.occupant_count("hall").await, 0);
    }

    #[tokio::test]
    async fn test_move_before_join() {
        let services = services();
        let (mut session, mut rx) = session(&services);

        let flow = session.handle_text(&move_text(Position::new(1, 0))).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.phase(), Phase::Unjoined);
        assert_eq!(session.state().position, Position::default());
        assert_eq!(error_code(&drain(&mut rx)[0]), ErrorCode::NotInSpace);
        assert_eq!(services.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_accepted_move_confirms_and_broadcasts_within_room() {
        let services = services();
        let (mut mover, mut rx_mover) = joined(&services, "corridor", "ada").await;
        let (_peer, mut rx_peer) = joined(&services, "corridor", "bob").await;
        let (_outsider, mut rx_outsider) = joined(&services, "hall", "eve").await;
        drain(&mut rx_mover);

        let from = mover.state().position;
        let to = Position::new(1 - from.x, 0);
        mover
            .handle_text(&format!(
                r#"{{"type":"move","payload":{{"x":{},"y":{}}},"requestId":"m"}}"#,
                to.x, to.y
            ))
            .await;

        let frames = drain(&mut rx_mover);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_id.as_deref(), Some("m"));
        assert_eq!(
            frames[0].message,
            ServerMessage::MoveConfirmed {
                position: to,
                user_id: "ada".to_string(),
            }
        );
        assert_eq!(mover.state().position, to);

        let peer_frames = drain(&mut rx_peer);
        assert_eq!(peer_frames.len(), 1);
        assert_eq!(peer_frames[0].request_id, None);
        assert_eq!(
            peer_frames[0].message,
            ServerMessage::Movement(PeerState {
                id: mover.connection_id().to_string(),
                user_id: "ada".to_string(),
                x: to.x,
                y: to.y,
            })
        );
        assert!(drain(&mut rx_outsider).is_empty());

        let snapshot = services.registry.snapshot("corridor", "").await;
        let mover_entry = snapshot
            .iter()
            .find(|p| p.id == mover.connection_id())
            .unwrap();
        assert_eq!(mover_entry.position(), to);
    }

    #[tokio::test]
    async fn test_rejected_moves_keep_position_and_stay_private() {
        let services = services();
        let (mut mover, mut rx_mover) = joined(&services, "corridor", "ada").await;
        let (_peer, mut rx_peer) = joined(&services, "corridor", "bob").await;
        drain(&mut rx_mover);
        let from = mover.state().position;

        let illegal = vec![
            from,
            Position::new(from.x, 1),
            Position::new(from.x, -1),
            Position::new(-1, 0),
            Position::new(2, 0),
            Position::new(1 - from.x, 1),
        ];

        for target in illegal {
            let flow = mover.handle_text(&move_text(target)).await;
            assert_eq!(flow, Flow::Continue);

            let frames = drain(&mut rx_mover);
            assert_eq!(frames.len(), 1, "target {}", target);
            assert_eq!(frames[0].message, ServerMessage::MoveRejected(from));
            assert_eq!(mover.state().position, from);
        }

        assert!(drain(&mut rx_peer).is_empty());
    }

    #[tokio::test]
    async fn test_single_cell_space_rejects_everything() {
        let services = services();
        let (mut session, mut rx) = joined(&services, "closet", "ada").await;
        assert_eq!(session.state().position, Position::new(0, 0));

        for target in [Position::new(1, 0), Position::new(0, 1), Position::new(-1, 0)] {
            session.handle_text(&move_text(target)).await;
            assert_eq!(
                drain(&mut rx)[0].message,
                ServerMessage::MoveRejected(Position::new(0, 0))
            );
        }
    }

    #[tokio::test]
    async fn test_disconnect_notifies_once_and_purges_room() {
        let services = services();
        let (mut leaver, _rx_leaver) = joined(&services, "lobby", "ada").await;
        let (mut stayer, mut rx_stayer) = joined(&services, "lobby", "bob").await;

        leaver.disconnect().await;
        leaver.disconnect().await;

        assert_eq!(leaver.phase(), Phase::Closed);
        let frames = drain(&mut rx_stayer);
        assert_eq!(
            frames.iter().map(|f| f.message.clone()).collect::<Vec<_>>(),
            vec![ServerMessage::UserLeft {
                id: leaver.connection_id().to_string(),
                user_id: "ada".to_string(),
            }]
        );

        let snapshot = services.registry.snapshot("lobby", "").await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, stayer.connection_id());

        stayer.disconnect().await;
        assert_eq!(services.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_before_join_touches_nothing() {
        let services = services();
        let (_peer, mut rx_peer) = joined(&services, "lobby", "bob").await;
        let (mut session, _rx) = session(&services);

        session.disconnect().await;

        assert_eq!(session.phase(), Phase::Closed);
        assert!(drain(&mut rx_peer).is_empty());
        assert_eq!(services.registry.occupant_count("lobby").await, 1);
    }

    #[tokio::test]
    async fn test_closed_session_ignores_frames() {
        let services = services();
        let (mut session, mut rx) = session(&services);
        session.disconnect().await;

        assert_eq!(session.handle_text(&join_text("lobby", "ada", "j")).await, Flow::Close);
        assert_eq!(session.handle_malformed("binary").await, Flow::Close);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(services.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_and_parse_errors_are_not_fatal() {
        let services = services();
        let (mut session, mut rx) = joined(&services, "lobby", "ada").await;

        let cases: Vec<(&str, ErrorCode, Option<&str>)> = vec![
            (
                r#"{"type":"chat","payload":{"text":"hi"},"requestId":"c"}"#,
                ErrorCode::UnknownMessageType,
                Some("c"),
            ),
            ("{not json", ErrorCode::ParseError, None),
            (r#"{"type":"move","payload":{"x":1}}"#, ErrorCode::ParseError, None),
            (r#"["join"]"#, ErrorCode::ParseError, None),
        ];

        for (text, code, request_id) in cases {
            assert_eq!(session.handle_text(text).await, Flow::Continue);
            let frames = drain(&mut rx);
            assert_eq!(error_code(&frames[0]), code, "frame {}", text);
            assert_eq!(frames[0].request_id.as_deref(), request_id);
            assert_eq!(session.phase(), Phase::Active);
        }

        assert_eq!(session.handle_malformed("binary frame").await, Flow::Continue);
        assert_eq!(error_code(&drain(&mut rx)[0]), ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn test_directory_failure_closes_connection() {
        let services = Services {
            directory: Arc::new(BrokenDirectory),
            ..services()
        };
        let (mut session, mut rx) = session(&services);

        let flow = session.handle_text(&join_text("lobby", "ada", "z")).await;

        assert_eq!(flow, Flow::Close);
        assert_eq!(session.phase(), Phase::Closed);
        let frames = drain(&mut rx);
        assert_eq!(error_code(&frames[0]), ErrorCode::UnknownError);
        assert_eq!(frames[0].request_id.as_deref(), Some("z"));
    }

    #[tokio::test]
    async fn test_slow_peer_does_not_block_mover() {
        let services = services();
        let (mut mover, mut rx_mover) = joined(&services, "corridor", "ada").await;

        let (mut slow, _rx_slow) = session_with_capacity(&services, 1);
        slow.handle_text(&join_text("corridor", "bob", "s")).await;
        let (_fast, mut rx_fast) = joined(&services, "corridor", "cy").await;
        drain(&mut rx_mover);

        let mut position = mover.state().position;
        for _ in 0..4 {
            let next = Position::new(1 - position.x, 0);
            mover.handle_text(&move_text(next)).await;
            position = next;
        }

        let confirmations = drain(&mut rx_mover);
        assert_eq!(confirmations.len(), 4);
        assert!(confirmations
            .iter()
            .all(|f| matches!(f.message, ServerMessage::MoveConfirmed { .. })));

        let movements = drain(&mut rx_fast);
        assert_eq!(movements.len(), 4);
        assert_eq!(slow.phase(), Phase::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joiners_learn_of_each_other_once() {
        const JOINERS: usize = 16;
        let lobby = Dimensions::new(10, 10).unwrap();

        for _ in 0..50 {
            let services = services();
            let mut handles = Vec::new();

            for i in 0..JOINERS {
                let services = services.clone();
                handles.push(tokio::spawn(async move {
                    let (mut session, rx) = session_with_capacity(&services, 256);
                    session
                        .handle_text(&join_text("lobby", &format!("user-{}", i), "j"))
                        .await;

                    let from = session.state().position;
                    let target = Direction::ALL
                        .iter()
                        .map(|d| from.step(*d))
                        .find(|p| lobby.contains(*p))
                        .unwrap();
                    session.handle_text(&move_text(target)).await;
                    (session, rx)
                }));
            }

            let mut joined = Vec::new();
            for handle in handles {
                joined.push(handle.await.unwrap());
            }

            let ids: HashSet<String> = joined
                .iter()
                .map(|(session, _)| session.connection_id().to_string())
                .collect();

            for (session, rx) in &mut joined {
                let frames = drain(rx);
                let (first, rest) = frames.split_first().unwrap();
                let mut seen: HashMap<String, usize> = HashMap::new();

                match &first.message {
                    ServerMessage::SpaceJoined { users, .. } => {
                        assert_eq!(first.request_id.as_deref(), Some("j"));
                        for user in users {
                            *seen.entry(user.id.clone()).or_default() += 1;
                        }
                    }
                    other => panic!(
                        "{} received {:?} before space-joined",
                        session.connection_id(),
                        other
                    ),
                }

                for frame in rest {
                    match &frame.message {
                        ServerMessage::UserJoined(peer) => {
                            *seen.entry(peer.id.clone()).or_default() += 1;
                        }
                        ServerMessage::Movement(peer) => {
                            assert!(seen.contains_key(&peer.id), "movement from unknown peer");
                        }
                        ServerMessage::SpaceJoined { .. } => panic!("space-joined delivered twice"),
                        _ => {}
                    }
                }

                let expected: HashSet<String> = ids
                    .iter()
                    .filter(|id| id.as_str() != session.connection_id())
                    .cloned()
                    .collect();
                assert_eq!(seen.keys().cloned().collect::<HashSet<_>>(), expected);
                assert!(seen.values().all(|&count| count == 1));
            }

            for (session, _rx) in &mut joined {
                session.disconnect().await;
            }
            assert_eq!(services.registry.room_count().await, 0);
        }
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let services = services();
        let mut seen = HashMap::new();
        for i in 0..100 {
            let (session, _rx) = session(&services);
            assert!(seen.insert(session.connection_id().to_string(), i).is_none());
        }
    }
}
