pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod node;
pub mod relay;
pub mod transfer;
