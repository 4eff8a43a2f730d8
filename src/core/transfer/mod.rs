//! Chunked file transfer over an open data channel.

mod engine;
pub mod offer;
pub mod protocol;
mod receiver;
mod sender;
pub mod sink;
pub mod source;

pub use engine::TransferEngine;

/// Local answer to an incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Decline,
}
