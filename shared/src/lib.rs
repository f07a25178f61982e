use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3001;
pub const MAX_DIMENSION_DIGITS: usize = 4;

pub const JOIN: &str = "join";
pub const MOVE: &str = "move";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// True when `other` is exactly one orthogonal step away.
    pub fn is_adjacent(&self, other: Position) -> bool {
        let dx = (i64::from(self.x) - i64::from(other.x)).abs();
        let dy = (i64::from(self.y) - i64::from(other.y)).abs();
        dx + dy == 1
    }

    pub fn step(&self, direction: Direction) -> Position {
        let (dx, dy) = direction.delta();
        Position {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn delta(&self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DimensionsError {
    #[error("dimensions must look like <width>x<height>, got {0:?}")]
    Format(String),
    #[error("dimensions must be non-zero, got {width}x{height}")]
    Empty { width: u32, height: u32 },
}

/// Grid extents of a space. Both sides are at least one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDimensions")]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Deserialize)]
struct RawDimensions {
    width: u32,
    height: u32,
}

impl TryFrom<RawDimensions> for Dimensions {
    type Error = DimensionsError;

    fn try_from(raw: RawDimensions) -> Result<Self, Self::Error> {
        Dimensions::new(raw.width, raw.height)
    }
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Result<Self, DimensionsError> {
        if width == 0 || height == 0 {
            return Err(DimensionsError::Empty { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn contains(&self, position: Position) -> bool {
        position.x >= 0
            && position.y >= 0
            && i64::from(position.x) < i64::from(self.width)
            && i64::from(position.y) < i64::from(self.height)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Dimensions {
    type Err = DimensionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format_error = || DimensionsError::Format(s.to_string());

        let (width, height) = s.split_once('x').ok_or_else(format_error)?;
        let parse_side = |side: &str| -> Result<u32, DimensionsError> {
            let well_formed = !side.is_empty()
                && side.len() <= MAX_DIMENSION_DIGITS
                && side.bytes().all(|b| b.is_ascii_digit());
            if !well_formed {
                return Err(format_error());
            }
            side.parse().map_err(|_| format_error())
        };

        Dimensions::new(parse_side(width)?, parse_side(height)?)
    }
}

/// The movement rule: the target must lie inside the grid and be a single
/// orthogonal step from the current position.
pub fn is_legal_move(dimensions: Dimensions, from: Position, to: Position) -> bool {
    dimensions.contains(to) && from.is_adjacent(to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidToken,
    SpaceNotFound,
    NotInSpace,
    AlreadyJoined,
    UnknownMessageType,
    ParseError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::SpaceNotFound => "SPACE_NOT_FOUND",
            ErrorCode::NotInSpace => "NOT_IN_SPACE",
            ErrorCode::AlreadyJoined => "ALREADY_JOINED",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Only unexpected internal failures end the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCode::UnknownError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(rename = "spaceId")]
    pub space_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Join(JoinPayload),
    Move(MovePayload),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid message format: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl DecodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DecodeError::Malformed(_) => ErrorCode::ParseError,
            DecodeError::UnknownType(_) => ErrorCode::UnknownMessageType,
        }
    }
}

/// A decoded inbound frame. The request id survives even when the payload
/// does not, so error replies can still be correlated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub request_id: Option<String>,
    pub message: Result<ClientMessage, DecodeError>,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => JOIN,
            ClientMessage::Move(_) => MOVE,
        }
    }

    pub fn decode(text: &str) -> InboundFrame {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                return InboundFrame {
                    request_id: None,
                    message: Err(DecodeError::Malformed(e.to_string())),
                }
            }
        };

        let message = match envelope.kind.as_str() {
            JOIN => serde_json::from_value(envelope.payload)
                .map(ClientMessage::Join)
                .map_err(|e| DecodeError::Malformed(e.to_string())),
            MOVE => serde_json::from_value(envelope.payload)
                .map(ClientMessage::Move)
                .map_err(|e| DecodeError::Malformed(e.to_string())),
            other => Err(DecodeError::UnknownType(other.to_string())),
        };

        InboundFrame {
            request_id: envelope.request_id,
            message,
        }
    }

    pub fn encode(&self, request_id: Option<&str>) -> Result<String, serde_json::Error> {
        let payload = match self {
            ClientMessage::Join(join) => serde_json::to_value(join)?,
            ClientMessage::Move(step) => serde_json::to_value(step)?,
        };
        serde_json::to_string(&Envelope {
            kind: self.kind().to_string(),
            payload,
            request_id: request_id.map(str::to_string),
        })
    }
}

/// What a room member looks like to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub x: i32,
    pub y: i32,
}

impl PeerState {
    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    SpaceJoined {
        spawn: Position,
        users: Vec<PeerState>,
    },
    UserJoined(PeerState),
    MoveConfirmed {
        position: Position,
        #[serde(rename = "userId")]
        user_id: String,
    },
    MoveRejected(Position),
    Movement(PeerState),
    UserLeft {
        id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SpaceJoined { .. } => "space-joined",
            ServerMessage::UserJoined(_) => "user-joined",
            ServerMessage::MoveConfirmed { .. } => "move-confirmed",
            ServerMessage::MoveRejected(_) => "move-rejected",
            ServerMessage::Movement(_) => "movement",
            ServerMessage::UserLeft { .. } => "user-left",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// An outbound message plus the correlation token of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFrame {
    pub message: ServerMessage,
    pub request_id: Option<String>,
}

impl ServerFrame {
    pub fn reply(message: ServerMessage, request_id: Option<String>) -> Self {
        Self {
            message,
            request_id,
        }
    }

    pub fn broadcast(message: ServerMessage) -> Self {
        Self {
            message,
            request_id: None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.message)?;
        if let (Some(request_id), Some(object)) = (&self.request_id, value.as_object_mut()) {
            object.insert("requestId".to_string(), Value::String(request_id.clone()));
        }
        serde_json::to_string(&value)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let message = serde_json::from_value(json!({
            "type": envelope.kind,
            "payload": envelope.payload,
        }))?;
        Ok(Self {
            message,
            request_id: envelope.request_id,
        })
    }
}
