//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap (`roomdrop relay ...`, `roomdrop peer ...`)
//! - TOML configuration file with `[relay]` and `[peer]` sections
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{NodeSettings, DEFAULT_RELAY_LISTEN, MAX_CHUNK_SIZE};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const CONFIG_FILE_NAME: &str = "roomdrop.toml";

/// Roomdrop - room-based peer-to-peer file drops.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML configuration file. Defaults to ./roomdrop.toml, then the
    /// user config directory.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Also append logs to this file.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the signaling relay.
    Relay(RelayArgs),
    /// Join rooms and exchange files with the other members.
    Peer(PeerArgs),
}

#[derive(clap::Args, Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RelayArgs {
    /// Address the relay listens on.
    #[clap(long)]
    pub listen: Option<SocketAddr>,
}

#[derive(clap::Args, Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PeerArgs {
    /// WebSocket URL of the signaling relay.
    #[clap(long)]
    pub relay_url: Option<String>,

    /// Room to join (repeatable).
    #[clap(long = "room")]
    pub rooms: Vec<String>,

    /// File to send to every peer whose channel opens (repeatable).
    #[clap(long = "send")]
    pub send: Vec<PathBuf>,

    /// Directory received files are written to.
    #[clap(long)]
    pub output_dir: Option<PathBuf>,

    /// How incoming offers are answered.
    #[clap(long, value_enum)]
    pub accept: Option<AcceptPolicy>,

    /// STUN/TURN server URL (repeatable).
    #[clap(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Chunk size in bytes for outgoing files (at most 65536).
    #[clap(long)]
    pub chunk_size: Option<usize>,

    /// Seconds to wait for the remote side to accept an offer.
    #[clap(long)]
    pub accept_timeout_secs: Option<u64>,
}

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcceptPolicy {
    Accept,
    Decline,
    #[default]
    Ask,
}

/// Layout of the TOML file.
#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    verbose: Option<u8>,
    log_file: Option<PathBuf>,
    relay: RelayArgs,
    peer: PeerArgs,
}

impl Args {
    /// Load Args from CLI + TOML file (if one is found).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let mut cli = Args::parse();
        cli.config = cli.config.map(resolve_path);

        let file = match &cli.config {
            // An explicitly named file must exist and parse.
            Some(path) => Some(FileConfig::read(path)?),
            None => default_config_paths()
                .into_iter()
                .find(|p| p.exists())
                .map(|p| FileConfig::read(&p))
                .transpose()?,
        };

        let args = match file {
            Some(file) => Self::merge(file, cli),
            None => cli,
        };
        Ok(args.resolved())
    }

    /// Merge file config with CLI args (CLI takes precedence).
    fn merge(file: FileConfig, mut cli: Args) -> Args {
        if cli.verbose == 0 {
            cli.verbose = file.verbose.unwrap_or(0);
        }
        if cli.log_file.is_none() {
            cli.log_file = file.log_file;
        }
        match &mut cli.command {
            Command::Relay(relay) => {
                relay.listen = relay.listen.or(file.relay.listen);
            }
            Command::Peer(peer) => peer.merge_from(file.peer),
        }
        cli
    }

    /// Resolve relative paths to absolute before anything changes directory.
    fn resolved(mut self) -> Self {
        self.log_file = self.log_file.map(resolve_path);
        if let Command::Peer(peer) = &mut self.command {
            peer.output_dir = peer.output_dir.take().map(resolve_path);
            peer.send = std::mem::take(&mut peer.send).into_iter().map(resolve_path).collect();
        }
        self
    }
}

impl RelayArgs {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        match self.listen {
            Some(addr) => Ok(addr),
            None => DEFAULT_RELAY_LISTEN
                .parse()
                .context("invalid default relay listen address"),
        }
    }
}

impl PeerArgs {
    fn merge_from(&mut self, file: PeerArgs) {
        if self.relay_url.is_none() {
            self.relay_url = file.relay_url;
        }
        if self.rooms.is_empty() {
            self.rooms = file.rooms;
        }
        if self.send.is_empty() {
            self.send = file.send;
        }
        if self.output_dir.is_none() {
            self.output_dir = file.output_dir;
        }
        if self.accept.is_none() {
            self.accept = file.accept;
        }
        if self.ice_servers.is_empty() {
            self.ice_servers = file.ice_servers;
        }
        if self.chunk_size.is_none() {
            self.chunk_size = file.chunk_size;
        }
        if self.accept_timeout_secs.is_none() {
            self.accept_timeout_secs = file.accept_timeout_secs;
        }
    }

    pub fn policy(&self) -> AcceptPolicy {
        self.accept.unwrap_or_default()
    }

    /// Node settings: defaults overridden by whatever was configured.
    pub fn node_settings(&self) -> NodeSettings {
        let mut settings = NodeSettings::default();
        if let Some(url) = &self.relay_url {
            settings.relay_url = url.clone();
        }
        if !self.ice_servers.is_empty() {
            settings.ice_servers = self.ice_servers.clone();
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = dir.clone();
        }
        if let Some(size) = self.chunk_size.filter(|s| *s > 0) {
            if size > MAX_CHUNK_SIZE {
                warn!(event = "chunk_size_capped", requested = size, max = MAX_CHUNK_SIZE, "Chunk size capped");
            }
            settings.transfer.chunk_size = size.min(MAX_CHUNK_SIZE);
        }
        if let Some(secs) = self.accept_timeout_secs.filter(|s| *s > 0) {
            settings.transfer.accept_timeout = Duration::from_secs(secs);
            // Keep the receiver's window inside the sender's.
            settings.transfer.decision_timeout = settings
                .transfer
                .decision_timeout
                .min(settings.transfer.accept_timeout);
        }
        settings
    }
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("roomdrop").join(CONFIG_FILE_NAME));
    }
    paths
}

/// Resolve a potentially relative path to an absolute one.
fn resolve_path(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ACCEPT_TIMEOUT, CHUNK_SIZE, DEFAULT_RELAY_URL};

    fn peer(args: &Args) -> &PeerArgs {
        match &args.command {
            Command::Peer(peer) => peer,
            other => panic!("expected peer command, got {other:?}"),
        }
    }

    #[test]
    fn parses_peer_command_with_repeated_flags() {
        let args = Args::try_parse_from([
            "roomdrop", "-vv", "peer", "--room", "a", "--room", "b", "--send", "x.bin",
            "--accept", "decline", "--chunk-size", "1024",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        let p = peer(&args);
        assert_eq!(p.rooms, vec!["a", "b"]);
        assert_eq!(p.send, vec![PathBuf::from("x.bin")]);
        assert_eq!(p.policy(), AcceptPolicy::Decline);
        assert_eq!(p.node_settings().transfer.chunk_size, 1024);
    }

    #[test]
    fn chunk_size_is_capped() {
        let args =
            Args::try_parse_from(["roomdrop", "peer", "--chunk-size", "1048576"]).unwrap();
        assert_eq!(peer(&args).node_settings().transfer.chunk_size, MAX_CHUNK_SIZE);

        let file: FileConfig = toml::from_str("[peer]\nchunk_size = 200000\n").unwrap();
        let cli = Args::try_parse_from(["roomdrop", "peer"]).unwrap();
        let merged = Args::merge(file, cli);
        assert_eq!(peer(&merged).node_settings().transfer.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn cli_values_win_over_file_values() {
        let file: FileConfig = toml::from_str(
            r#"
            verbose = 1
            log_file = "/tmp/roomdrop.log"

            [peer]
            relay_url = "ws://relay.example:5000/ws"
            rooms = ["from-file"]
            accept = "accept"
            accept_timeout_secs = 30
            "#,
        )
        .unwrap();
        let cli = Args::try_parse_from(["roomdrop", "peer", "--room", "from-cli"]).unwrap();

        let merged = Args::merge(file, cli);
        assert_eq!(merged.verbose, 1);
        assert_eq!(merged.log_file, Some(PathBuf::from("/tmp/roomdrop.log")));
        let p = peer(&merged);
        assert_eq!(p.rooms, vec!["from-cli"]);
        assert_eq!(p.relay_url.as_deref(), Some("ws://relay.example:5000/ws"));
        assert_eq!(p.policy(), AcceptPolicy::Accept);

        let settings = p.node_settings();
        assert_eq!(settings.transfer.accept_timeout, Duration::from_secs(30));
        assert!(settings.transfer.decision_timeout < settings.transfer.accept_timeout);
    }

    #[test]
    fn defaults_come_from_config_constants() {
        let args = Args::try_parse_from(["roomdrop", "peer"]).unwrap();
        let settings = peer(&args).node_settings();
        assert_eq!(settings.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(settings.transfer.chunk_size, CHUNK_SIZE);
        assert_eq!(settings.transfer.accept_timeout, ACCEPT_TIMEOUT);
        assert_eq!(peer(&args).policy(), AcceptPolicy::Ask);

        let args = Args::try_parse_from(["roomdrop", "relay"]).unwrap();
        match &args.command {
            Command::Relay(relay) => {
                assert_eq!(relay.listen_addr().unwrap(), DEFAULT_RELAY_LISTEN.parse().unwrap())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_accept_timeout_pulls_decision_window_in() {
        let args = Args::try_parse_from(["roomdrop", "peer", "--accept-timeout-secs", "5"]).unwrap();
        let transfer = peer(&args).node_settings().transfer;
        assert_eq!(transfer.accept_timeout, Duration::from_secs(5));
        assert_eq!(transfer.decision_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("[peer]\nroom = \"typo\"").is_err());
    }
}
