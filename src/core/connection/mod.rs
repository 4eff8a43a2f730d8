//! Connection manager: turns relay notifications and negotiation payloads
//! into open data channels, one per (room, remote peer).

pub mod capability;
pub mod manager;
#[cfg(test)]
pub mod memory;
pub mod rtc;
pub mod state;
mod table;

use crate::core::relay::protocol::{PeerId, RoomId};
use std::fmt;

/// Identity of a connection: the room it was negotiated in and the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub room: RoomId,
    pub peer: PeerId,
}

impl ConnectionKey {
    pub fn new(room: impl Into<RoomId>, peer: impl Into<PeerId>) -> Self {
        Self {
            room: room.into(),
            peer: peer.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.room, self.peer)
    }
}
