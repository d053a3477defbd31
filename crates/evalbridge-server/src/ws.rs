//! WebSocket halves for a bridge session.
//!
//! Each text frame carries one JSON envelope. Binary frames are ignored;
//! ping and pong frames are answered by axum itself.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use evalbridge_core::{BridgeError, Envelope, EnvelopeSink, EnvelopeSource, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::debug;

/// Split an upgraded socket into the halves a session runs on.
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sender, receiver) = socket.split();
    (
        WsSink {
            sender,
            closed: false,
        },
        WsSource { receiver },
    )
}

pub struct WsSink {
    sender: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl EnvelopeSink for WsSink {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        if self.closed {
            return Err(BridgeError::WriteFailure {
                message: "websocket already closed".to_string(),
            });
        }
        let text = envelope.to_json()?;
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|e| BridgeError::WriteFailure {
                message: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sender
            .close()
            .await
            .map_err(|e| BridgeError::WriteFailure {
                message: e.to_string(),
            })
    }
}

pub struct WsSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl EnvelopeSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            match self.receiver.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Envelope::from_json(&text).map(Some),
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    return Err(BridgeError::ReadFailure {
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}
