//! Per-connection signaling channel over a WebSocket.

use crate::error::AppError;
use crate::protocol::{ClientEvent, Role, ServerEvent};
use crate::rooms::{Outbox, RoomRegistry, SessionId, OUTBOX_CAPACITY};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One connected peer.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub room: Option<String>,
    pub role: Option<Role>,
    pub outbox: Outbox,
}

/// Translates inbound events into registry calls. Dropping the channel
/// removes its session from the registry, which makes it the single
/// teardown path for both graceful and abrupt disconnects.
pub struct SignalingChannel {
    registry: Arc<RoomRegistry>,
    session: Session,
}

impl SignalingChannel {
    /// Open a channel with a fresh session; events for the peer arrive on
    /// the returned receiver in the order they were queued.
    pub fn open(registry: Arc<RoomRegistry>) -> (Self, Receiver<ServerEvent>) {
        Self::open_with_capacity(registry, OUTBOX_CAPACITY)
    }

    pub fn open_with_capacity(
        registry: Arc<RoomRegistry>,
        capacity: usize,
    ) -> (Self, Receiver<ServerEvent>) {
        let (outbox, inbox) = Outbox::channel(capacity);
        let session = Session {
            id: Uuid::new_v4(),
            room: None,
            role: None,
            outbox,
        };
        (Self { registry, session }, inbox)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Handle one raw text frame. Malformed frames are answered with an
    /// `error` event and otherwise ignored.
    pub fn handle_text(&mut self, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle(event),
            Err(e) => {
                debug!(session = %self.session.id, error = %e, "Rejected inbound frame");
                self.reject(&e);
            }
        }
    }

    pub fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Join { room } => {
                match self.registry.join(&room, self.session.id, &self.session.outbox) {
                    Ok(outcome) => {
                        self.session.room = Some(outcome.room);
                        self.session.role = Some(outcome.role);
                    }
                    Err(e) => self.reject(&e),
                }
            }
            ClientEvent::Negotiation(negotiation) => {
                match self.registry.relay(self.session.id, negotiation) {
                    Ok(()) => {}
                    Err(AppError::NoPeer(room)) => {
                        // Stray events are expected while peers race through negotiation.
                        warn!(session = %self.session.id, room = %room, "Negotiation with no peer present, dropped");
                    }
                    Err(e) => self.reject(&e),
                }
            }
            ClientEvent::Leave => self.leave(),
        }
    }

    fn leave(&mut self) {
        self.registry.leave(self.session.id);
        self.session.room = None;
        self.session.role = None;
    }

    /// Report an error to this peer only.
    pub fn reject(&self, err: &AppError) {
        self.session
            .outbox
            .push(self.session.id, ServerEvent::error(err));
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.leave();
        debug!(session = %self.session.id, "Signaling channel closed");
    }
}

/// Drive one WebSocket connection until the peer goes away.
pub async fn serve_connection(socket: WebSocket, registry: Arc<RoomRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (mut channel, mut inbox) = SignalingChannel::open(registry);
    let session_id = channel.session().id;
    let outbox = channel.session().outbox.clone();
    info!(session = %session_id, "Signaling connection opened");

    let writer = tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut slow = false;
    loop {
        let message = tokio::select! {
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
            _ = outbox.overflowed() => {
                slow = true;
                break;
            }
        };
        match message {
            Ok(Message::Text(text)) => channel.handle_text(&text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => channel.handle_text(text),
                Err(_) => channel.reject(&AppError::invalid("binary frame is not UTF-8")),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session_id, error = %e, "Signaling connection error");
                break;
            }
        }
    }

    // Leaving the room releases the registry's handle on our outbox; once
    // the channel is dropped too, the writer drains and exits. A slow
    // connection is cut without draining.
    drop(channel);
    drop(outbox);
    if slow {
        info!(session = %session_id, "Cutting slow signaling connection");
        writer.abort();
    }
    let _ = writer.await;
    info!(session = %session_id, "Signaling connection closed");
}
