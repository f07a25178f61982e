//! Server network layer: accepts WebSocket connections and pumps frames
//! between each socket and its session.

use crate::session::{Flow, Services, Session};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::ServerFrame;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Listening WebSocket server. Each accepted connection runs on its own task.
pub struct Server {
    listener: TcpListener,
    services: Services,
    outbox_capacity: NonZeroUsize,
}

impl Server {
    pub async fn bind(
        addr: &str,
        services: Services,
        outbox_capacity: NonZeroUsize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            services,
            outbox_capacity,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the task is cancelled.
    pub async fn run(self) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let services = self.services.clone();
                    let capacity = self.outbox_capacity.get();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, services, capacity).await {
                            warn!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    services: Services,
    capacity: usize,
) -> Result<(), WsError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(capacity);

    let mut session = Session::new(services, tx);
    let connection_id = session.connection_id().to_string();
    info!("Connection {} opened from {}", connection_id, peer);

    // The writer ends once every sender is gone: the session's own and the
    // copy held by its room entry.
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {} for {}: {}", frame.message.kind(), writer_id, e);
                    continue;
                }
            };

            if let Err(e) = ws_write.send(Message::Text(text)).await {
                debug!("Write to {} failed: {}", writer_id, e);
                break;
            }
        }

        if let Err(e) = ws_write.close().await {
            debug!("Closing socket of {} failed: {}", writer_id, e);
        }
    });

    while let Some(message) = ws_read.next().await {
        let flow = match message {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Binary(_)) => {
                session
                    .handle_malformed("binary frames are not supported")
                    .await
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => Flow::Continue,
            Err(e) => {
                debug!("Read from {} failed: {}", connection_id, e);
                break;
            }
        };

        if flow == Flow::Close {
            break;
        }
    }

    session.disconnect().await;
    drop(session);

    if let Err(e) = writer.await {
        error!("Writer task for {} panicked: {}", connection_id, e);
    }

    info!("Connection {} closed", connection_id);
    Ok(())
}
