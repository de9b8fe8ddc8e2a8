//! In-memory room registry pairing at most two sessions per room.

use crate::error::AppError;
use crate::protocol::{Negotiation, Role, ServerEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rooms never hold more than this many sessions.
pub const ROOM_CAPACITY: usize = 2;

/// Events a connection may have queued but not yet written.
pub const OUTBOX_CAPACITY: usize = 256;

pub type SessionId = Uuid;

/// Bounded outbound queue of one connection, drained by its writer task.
///
/// Pushing never blocks. When the queue is full the event is dropped and the
/// outbox is marked overflowed; the connection owning it is expected to
/// close, since its peer can no longer rely on ordered delivery.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: Sender<ServerEvent>,
    overflow: Arc<watch::Sender<bool>>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (overflow, _) = watch::channel(false);
        (
            Self {
                tx,
                overflow: Arc::new(overflow),
            },
            rx,
        )
    }

    /// Queue `event` for `session` without waiting.
    pub fn push(&self, session: SessionId, event: ServerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session = %session, "Outbound queue full, closing slow connection");
                self.overflow.send_replace(true);
            }
            // The connection is going away; its leave follows.
            Err(TrySendError::Closed(_)) => {
                debug!(session = %session, "Dropping event for closed connection");
            }
        }
    }

    pub fn is_overflowed(&self) -> bool {
        *self.overflow.borrow()
    }

    /// Resolves once an event had to be dropped because the queue was full.
    pub async fn overflowed(&self) {
        let mut rx = self.overflow.subscribe();
        let _ = rx.wait_for(|full| *full).await;
    }
}

struct Occupant {
    session: SessionId,
    role: Role,
    outbox: Outbox,
}

impl Occupant {
    fn send(&self, event: ServerEvent) {
        self.outbox.push(self.session, event);
    }
}

struct Room {
    occupants: Vec<Occupant>,
    created_at: Instant,
}

impl Room {
    fn new() -> Self {
        Self {
            occupants: Vec::with_capacity(ROOM_CAPACITY),
            created_at: Instant::now(),
        }
    }

    fn occupant(&self, session: SessionId) -> Option<&Occupant> {
        self.occupants.iter().find(|o| o.session == session)
    }

    fn peer_of(&self, session: SessionId) -> Option<&Occupant> {
        self.occupants.iter().find(|o| o.session != session)
    }
}

#[derive(Default)]
struct Rooms {
    rooms: HashMap<String, Room>,
    membership: HashMap<SessionId, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: String,
    pub role: Role,
    /// The occupant already present, when this join completed the pair.
    pub peer: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room: String,
    /// The occupant that stays behind and was sent `peer-left`.
    pub peer: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room: String,
    pub occupants: usize,
    pub age_secs: u64,
}

/// Room membership shared by all signaling connections.
///
/// Every operation runs under one lock and performs no I/O: outbound events
/// are pushed onto bounded per-connection queues without waiting, so events
/// queued by one operation are ordered before those of any later operation.
#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<Rooms>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` to `room_id`.
    ///
    /// Queues `joined` for the joiner and, when a peer is already present,
    /// `peer-joined` for both. A session already in another room leaves it
    /// first; re-joining the same room only repeats `joined`.
    pub fn join(
        &self,
        room_id: &str,
        session: SessionId,
        outbox: &Outbox,
    ) -> Result<JoinOutcome, AppError> {
        let mut inner = self.inner.lock();

        if let Some(current) = inner.membership.get(&session).cloned() {
            if current == room_id {
                let role = inner
                    .rooms
                    .get(&current)
                    .and_then(|room| room.occupant(session))
                    .map(|o| o.role)
                    .unwrap_or(Role::First);
                outbox.push(
                    session,
                    ServerEvent::Joined {
                        room: current.clone(),
                        role,
                    },
                );
                return Ok(JoinOutcome {
                    room: current,
                    role,
                    peer: None,
                });
            }
        }

        if inner
            .rooms
            .get(room_id)
            .is_some_and(|room| room.occupants.len() >= ROOM_CAPACITY)
        {
            info!(room = %room_id, session = %session, "Join rejected, room full");
            return Err(AppError::RoomFull(room_id.to_string()));
        }

        if inner.membership.contains_key(&session) {
            inner.leave(session);
        }

        let room = inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(Room::new);
        let role = if room.occupants.is_empty() {
            Role::First
        } else {
            Role::Second
        };
        let peer = room.occupants.first().map(|o| o.session);

        room.occupants.push(Occupant {
            session,
            role,
            outbox: outbox.clone(),
        });

        outbox.push(
            session,
            ServerEvent::Joined {
                room: room_id.to_string(),
                role,
            },
        );
        if peer.is_some() {
            for occupant in &room.occupants {
                occupant.send(ServerEvent::PeerJoined {});
            }
        }

        inner.membership.insert(session, room_id.to_string());
        info!(room = %room_id, session = %session, role = ?role, "Session joined room");

        Ok(JoinOutcome {
            room: room_id.to_string(),
            role,
            peer,
        })
    }

    /// Remove `session` from its room. Safe to call repeatedly and for
    /// sessions that never joined.
    pub fn leave(&self, session: SessionId) -> Option<LeaveOutcome> {
        self.inner.lock().leave(session)
    }

    /// Forward a negotiation payload to the sender's peer, unmodified.
    pub fn relay(&self, session: SessionId, negotiation: Negotiation) -> Result<(), AppError> {
        let inner = self.inner.lock();
        let room_id = inner.membership.get(&session).ok_or(AppError::NotInRoom)?;
        let peer = inner
            .rooms
            .get(room_id)
            .and_then(|room| room.peer_of(session))
            .ok_or_else(|| AppError::NoPeer(room_id.clone()))?;

        debug!(room = %room_id, from = %session, to = %peer.session, kind = ?negotiation.kind, "Relaying negotiation");
        peer.send(ServerEvent::Negotiation(negotiation));
        Ok(())
    }

    /// Room and role currently held by `session`.
    pub fn membership(&self, session: SessionId) -> Option<(String, Role)> {
        let inner = self.inner.lock();
        let room_id = inner.membership.get(&session)?;
        let role = inner.rooms.get(room_id)?.occupant(session)?.role;
        Some((room_id.clone(), role))
    }

    pub fn occupancy(&self, room_id: &str) -> usize {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .map_or(0, |room| room.occupants.len())
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    pub fn snapshot(&self) -> Vec<RoomSummary> {
        let inner = self.inner.lock();
        let mut list: Vec<RoomSummary> = inner
            .rooms
            .iter()
            .map(|(id, room)| RoomSummary {
                room: id.clone(),
                occupants: room.occupants.len(),
                age_secs: room.created_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.room.cmp(&b.room));
        list
    }
}

impl Rooms {
    fn leave(&mut self, session: SessionId) -> Option<LeaveOutcome> {
        let room_id = self.membership.remove(&session)?;
        let room = self.rooms.get_mut(&room_id)?;
        room.occupants.retain(|o| o.session != session);

        if room.occupants.is_empty() {
            self.rooms.remove(&room_id);
            info!(room = %room_id, session = %session, "Session left, room closed");
            return Some(LeaveOutcome {
                room: room_id,
                peer: None,
            });
        }

        // The one who stays is now the room's first occupant.
        let remaining = &mut room.occupants[0];
        remaining.role = Role::First;
        remaining.send(ServerEvent::PeerLeft {});
        info!(room = %room_id, session = %session, "Session left room");

        Some(LeaveOutcome {
            room: room_id,
            peer: Some(remaining.session),
        })
    }
}
