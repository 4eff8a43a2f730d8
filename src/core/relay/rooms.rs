//! In-memory room table of the signaling relay.
//!
//! One lock guards every room and session, so each membership change is a
//! single critical section. Nothing is persisted; a restarted relay starts
//! empty and peers rejoin.
//!
//! Session outboxes are bounded. A session whose outbox is full when a
//! message is due is evicted in the same critical section: it leaves every
//! room and its outbox is closed, which ends its socket.

use super::protocol::{ClientMessage, PeerId, RoomId, ServerMessage};
use crate::core::error::SignalingError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Session {
    rooms: HashSet<RoomId>,
    outbox: mpsc::Sender<ServerMessage>,
}

#[derive(Default)]
struct RelayState {
    /// Members in join order.
    rooms: HashMap<RoomId, Vec<PeerId>>,
    sessions: HashMap<PeerId, Session>,
    /// Sessions that could not take a message; evicted before the lock is released.
    overflowed: Vec<PeerId>,
}

impl RelayState {
    fn push(&mut self, peer: &str, msg: ServerMessage) {
        let Some(session) = self.sessions.get(peer) else {
            return;
        };
        match session.outbox.try_send(msg) {
            Ok(()) => {}
            // The transport is going away; disconnect cleans up.
            Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                if !self.overflowed.iter().any(|p| p == peer) {
                    self.overflowed.push(peer.to_string());
                }
            }
        }
    }

    /// Drop every session whose outbox filled up. Their departure notifies
    /// other members, which may overflow further outboxes.
    fn evict_overflowed(&mut self) {
        while let Some(peer) = self.overflowed.pop() {
            let Some(session) = self.sessions.remove(&peer) else {
                continue;
            };
            warn!(
                event = "relay_session_evicted",
                %peer,
                rooms = session.rooms.len(),
                "Outbox full, disconnecting slow peer"
            );
            for room in &session.rooms {
                self.remove_member(&peer, room);
            }
        }
    }

    fn remove_member(&mut self, peer: &str, room: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m != peer);
        let removed = members.len() != before;

        if members.is_empty() {
            self.rooms.remove(room);
        } else if removed {
            for member in members.clone() {
                self.push(
                    &member,
                    ServerMessage::PeerLeft {
                        room_id: room.to_string(),
                        peer_id: peer.to_string(),
                    },
                );
            }
        }
        removed
    }
}

/// Room membership broker. Holds no file or negotiation state.
#[derive(Default)]
pub struct Relay {
    state: Mutex<RelayState>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transport and greet it with its relay-assigned id.
    pub async fn register(&self, outbox: mpsc::Sender<ServerMessage>) -> PeerId {
        let peer_id = Uuid::new_v4().to_string();
        let _ = outbox.try_send(ServerMessage::Welcome {
            peer_id: peer_id.clone(),
        });

        let mut state = self.state.lock().await;
        state.sessions.insert(
            peer_id.clone(),
            Session {
                rooms: HashSet::new(),
                outbox,
            },
        );
        info!(event = "relay_session_open", peer = %peer_id, sessions = state.sessions.len(), "Peer connected");
        peer_id
    }

    /// Dispatch one decoded client message on behalf of `peer`.
    pub async fn handle(&self, peer: &str, msg: ClientMessage) -> Result<(), SignalingError> {
        match msg {
            ClientMessage::Join { room_id } => self.join(peer, &room_id).await.map(|_| ()),
            ClientMessage::SendSignal {
                to,
                room_id,
                signal,
            } => self.relay(peer, &to, &room_id, signal).await,
            ClientMessage::Leave { room_id } => self.leave(peer, &room_id).await,
        }
    }

    /// Add `peer` to `room` and return the other members.
    ///
    /// The caller gets `peer-joined` listing the others; existing members get
    /// `peer-joined` listing the caller. Joining again only repeats the reply.
    pub async fn join(&self, peer: &str, room: &str) -> Result<Vec<PeerId>, SignalingError> {
        if room.is_empty() {
            return Err(SignalingError::EmptyRoom);
        }

        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(peer) {
            return Err(SignalingError::UnknownSession(peer.to_string()));
        }

        let members = state.rooms.entry(room.to_string()).or_default();
        let rejoin = members.iter().any(|m| m == peer);
        let others: Vec<PeerId> = members.iter().filter(|m| *m != peer).cloned().collect();
        if !rejoin {
            members.push(peer.to_string());
        }

        if let Some(session) = state.sessions.get_mut(peer) {
            session.rooms.insert(room.to_string());
        }

        if !rejoin {
            for member in &others {
                state.push(
                    member,
                    ServerMessage::PeerJoined {
                        room_id: room.to_string(),
                        peer_ids: vec![peer.to_string()],
                    },
                );
            }
        }
        state.push(
            peer,
            ServerMessage::PeerJoined {
                room_id: room.to_string(),
                peer_ids: others.clone(),
            },
        );
        state.evict_overflowed();

        info!(event = "relay_join", %peer, %room, rejoin, members = others.len() + 1, "Peer joined room");
        Ok(others)
    }

    /// Forward an opaque signal to `to`, but only if it is a member of `room`.
    pub async fn relay(
        &self,
        from: &str,
        to: &str,
        room: &str,
        signal: Value,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(from) {
            return Err(SignalingError::UnknownSession(from.to_string()));
        }

        let addressable = state
            .rooms
            .get(room)
            .is_some_and(|members| members.iter().any(|m| m == to));
        if !addressable {
            return Err(SignalingError::Unaddressable {
                to: to.to_string(),
                room: room.to_string(),
            });
        }

        debug!(event = "relay_signal", %from, %to, %room, "Forwarding signal");
        state.push(
            to,
            ServerMessage::Signal {
                from: from.to_string(),
                room_id: room.to_string(),
                signal,
            },
        );
        state.evict_overflowed();
        Ok(())
    }

    /// Remove `peer` from `room`; remaining members get `peer-left`.
    /// Leaving a room the peer is not in is a no-op.
    pub async fn leave(&self, peer: &str, room: &str) -> Result<(), SignalingError> {
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(peer) {
            return Err(SignalingError::UnknownSession(peer.to_string()));
        }
        if let Some(session) = state.sessions.get_mut(peer) {
            session.rooms.remove(room);
        }
        if state.remove_member(peer, room) {
            info!(event = "relay_leave", %peer, %room, "Peer left room");
        } else {
            debug!(event = "relay_leave_noop", %peer, %room, "Leave for a room the peer is not in");
        }
        state.evict_overflowed();
        Ok(())
    }

    /// Transport gone: leave every room and forget the session.
    pub async fn disconnect(&self, peer: &str) {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.remove(peer) else {
            debug!(event = "relay_disconnect_unknown", %peer, "Disconnect for a session already gone");
            return;
        };
        for room in &session.rooms {
            state.remove_member(peer, room);
        }
        state.evict_overflowed();
        info!(event = "relay_session_closed", %peer, rooms = session.rooms.len(), "Peer disconnected");
    }

    /// Current members of `room` in join order.
    pub async fn members(&self, room: &str) -> Vec<PeerId> {
        let state = self.state.lock().await;
        state.rooms.get(room).cloned().unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }
}
