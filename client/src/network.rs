use crate::game::SpaceView;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use rand::seq::SliceRandom;
use shared::{
    ClientMessage, Direction, ErrorCode, JoinPayload, MovePayload, Position, ServerFrame,
    ServerMessage,
};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed by server")]
    Closed,
    #[error("server error {code}: {message}")]
    Server { code: ErrorCode, message: String },
    #[error("unexpected {0} reply")]
    Unexpected(&'static str),
}

impl ClientError {
    fn from_reply(message: ServerMessage) -> Self {
        match message {
            ServerMessage::Error { code, message } => ClientError::Server { code, message },
            other => ClientError::Unexpected(other.kind()),
        }
    }
}

/// Totals reported after a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    pub confirmed: u32,
    pub rejected: u32,
    pub position: Position,
}

/// Headless client that joins a space and wanders around it.
pub struct Walker {
    socket: Socket,
    view: SpaceView,
    next_request: u64,
}

impl Walker {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (socket, _response) = connect_async(url).await?;
        info!("Connected to {}", url);

        Ok(Walker {
            socket,
            view: SpaceView::new(),
            next_request: 0,
        })
    }

    pub fn view(&self) -> &SpaceView {
        &self.view
    }

    /// Sends a request and returns the request id it was tagged with.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<String, ClientError> {
        self.next_request += 1;
        let request_id = format!("req-{}", self.next_request);

        let text = message.encode(Some(&request_id))?;
        self.socket.send(Message::Text(text)).await?;
        Ok(request_id)
    }

    /// Reads the next server frame and folds it into the view.
    pub async fn next_frame(&mut self) -> Result<ServerFrame, ClientError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame = ServerFrame::decode(&text)?;
                    self.view.apply(&frame.message);
                    return Ok(frame);
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn reply_to(&mut self, request_id: &str) -> Result<ServerMessage, ClientError> {
        loop {
            let frame = self.next_frame().await?;
            if frame.request_id.as_deref() == Some(request_id) {
                return Ok(frame.message);
            }
        }
    }

    pub async fn join(&mut self, space_id: &str, token: &str) -> Result<Position, ClientError> {
        let request_id = self
            .send(&ClientMessage::Join(JoinPayload {
                space_id: space_id.to_string(),
                token: token.to_string(),
            }))
            .await?;

        match self.reply_to(&request_id).await? {
            ServerMessage::SpaceJoined { spawn, .. } => Ok(spawn),
            other => Err(ClientError::from_reply(other)),
        }
    }

    /// Tries one step. Returns whether the server accepted it.
    pub async fn step(&mut self, direction: Direction) -> Result<bool, ClientError> {
        let target = self.view.position.step(direction);
        let request_id = self
            .send(&ClientMessage::Move(MovePayload {
                x: target.x,
                y: target.y,
            }))
            .await?;

        match self.reply_to(&request_id).await? {
            ServerMessage::MoveConfirmed { .. } => Ok(true),
            ServerMessage::MoveRejected(position) => {
                debug!("Step {:?} from {} rejected", direction, position);
                Ok(false)
            }
            other => Err(ClientError::from_reply(other)),
        }
    }

    /// Takes `steps` random single-cell steps, one per `interval`.
    pub async fn walk(&mut self, steps: u32, interval: Duration) -> Result<WalkSummary, ClientError> {
        let mut ticker = tokio::time::interval(interval);
        let mut summary = WalkSummary {
            confirmed: 0,
            rejected: 0,
            position: self.view.position,
        };

        for _ in 0..steps {
            ticker.tick().await;

            let direction = *Direction::ALL
                .choose(&mut rand::thread_rng())
                .unwrap_or(&Direction::Right);

            if self.step(direction).await? {
                summary.confirmed += 1;
            } else {
                summary.rejected += 1;
            }
        }

        summary.position = self.view.position;
        Ok(summary)
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.socket.close(None).await?;
        Ok(())
    }
}
