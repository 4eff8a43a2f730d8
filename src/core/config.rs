//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Runtime overrides flow through [`TransferSettings`]
//! and [`NodeSettings`], which default to these values.

use std::path::PathBuf;
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (64 KiB).
///
/// Matches the default SCTP receive buffer of webrtc-rs, so a single chunk
/// never has to be fragmented across receive windows.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk accepted in either direction. webrtc-rs refuses data channel
/// messages above 64 KiB, so a bigger chunk could never be delivered.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// How long the sender waits for `file-accept` / `file-decline` before the
/// offer counts as implicitly declined.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a received offer waits for a local decision before it expires.
/// Kept below [`ACCEPT_TIMEOUT`] so the receiver gives up first.
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(12);

/// Upper bound for the sink provider to hand out (or refuse) a sink.
pub const SINK_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for a single sink write or close.
pub const SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Emit a progress event every N chunks (and always on the last one).
pub const PROGRESS_EVERY_CHUNKS: u64 = 16;

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Low water mark for the data channel send buffer (bytes).
/// A chunk is only handed to the channel while `buffered_amount` is below it.
pub const DC_BUFFERED_AMOUNT_LOW: usize = 1024 * 1024;

/// Poll interval while waiting for the send buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum time spent waiting for the send buffer to drain before the
/// transfer is aborted.
pub const BUFFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ── Connection / Negotiation ─────────────────────────────────────────────────

/// Label of the single data channel opened per connection.
pub const DATA_CHANNEL_LABEL: &str = "files";

/// Default STUN server used when none is configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Timeout for each individual negotiation call (create offer, set
/// description, add candidate, ...).
pub const NEGOTIATION_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline from connection creation until the data channel is open.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a join may wait for the relay's membership reply.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout when closing a negotiator on teardown.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default listen address of the signaling relay.
pub const DEFAULT_RELAY_LISTEN: &str = "0.0.0.0:5000";

/// Default relay URL a peer connects to.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:5000/ws";

/// Timeout for the relay to greet a freshly connected client.
pub const RELAY_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages queued per relay session before it counts as too slow and is
/// disconnected.
pub const RELAY_OUTBOX_CAPACITY: usize = 256;

/// Text served on `GET /` by the relay.
pub const RELAY_HEALTH_TEXT: &str = "roomdrop signaling relay is running.";

// ── Runtime settings ─────────────────────────────────────────────────────────

/// Knobs of the transfer engine. Tests shrink these; the CLI overrides a few.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub accept_timeout: Duration,
    pub decision_timeout: Duration,
    pub sink_request_timeout: Duration,
    pub sink_write_timeout: Duration,
    pub low_water_mark: usize,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub progress_every: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            accept_timeout: ACCEPT_TIMEOUT,
            decision_timeout: DECISION_TIMEOUT,
            sink_request_timeout: SINK_REQUEST_TIMEOUT,
            sink_write_timeout: SINK_WRITE_TIMEOUT,
            low_water_mark: DC_BUFFERED_AMOUNT_LOW,
            poll_interval: BACKPRESSURE_POLL_INTERVAL,
            drain_timeout: BUFFER_DRAIN_TIMEOUT,
            progress_every: PROGRESS_EVERY_CHUNKS,
        }
    }
}

/// Settings for one peer node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    pub output_dir: PathBuf,
    pub transfer: TransferSettings,
    pub negotiation_step_timeout: Duration,
    pub connection_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            transfer: TransferSettings::default(),
            negotiation_step_timeout: NEGOTIATION_STEP_TIMEOUT,
            connection_timeout: CONNECTION_TIMEOUT,
            join_timeout: JOIN_TIMEOUT,
        }
    }
}
