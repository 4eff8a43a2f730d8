//! Headless peer: joins rooms, pushes the configured files to every peer
//! whose channel opens, and answers incoming offers per policy.

use crate::core::connection::rtc::RtcFactory;
use crate::core::connection::ConnectionKey;
use crate::core::events::{AppEvent, Direction};
use crate::core::node::PeerNode;
use crate::core::transfer::offer::TransferOffer;
use crate::core::transfer::sink::DirectorySinkProvider;
use crate::core::transfer::source::FileSource;
use crate::core::transfer::Decision;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{AcceptPolicy, PeerArgs};
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct PendingOffer {
    key: ConnectionKey,
    id: Uuid,
    offer: TransferOffer,
}

/// Offers waiting for a typed answer, prompted one at a time.
#[derive(Default)]
struct OfferPrompts {
    queue: VecDeque<PendingOffer>,
}

impl OfferPrompts {
    /// Returns true when the new offer is now the one being asked about.
    fn push(&mut self, offer: PendingOffer) -> bool {
        self.queue.push_back(offer);
        self.queue.len() == 1
    }

    fn head(&self) -> Option<&PendingOffer> {
        self.queue.front()
    }

    fn answer(&mut self) -> Option<PendingOffer> {
        self.queue.pop_front()
    }

    /// Drop an offer that resolved on its own. Returns true when it was the head.
    fn forget(&mut self, id: Uuid) -> bool {
        let was_head = self.head().is_some_and(|p| p.id == id);
        self.queue.retain(|p| p.id != id);
        was_head
    }
}

fn parse_answer(line: &str) -> Decision {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "a" | "accept" => Decision::Accept,
        _ => Decision::Decline,
    }
}

fn prompt(pending: &PendingOffer) {
    eprintln!(
        "Accept '{}' ({} bytes) from {}? [y/N]",
        pending.offer.file_name, pending.offer.file_size, pending.key
    );
}

#[derive(Debug, Default)]
struct Summary {
    sent: u32,
    received: u32,
    declined: u32,
    failed: u32,
}

struct PeerWorker {
    node: PeerNode,
    send: Vec<PathBuf>,
    policy: AcceptPolicy,
    prompts: OfferPrompts,
    summary: Summary,
}

pub async fn run(args: PeerArgs, sos: SignalOfStop) -> Result<()> {
    let settings = args.node_settings();
    let policy = args.policy();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AppEvent>();

    let factory = Arc::new(RtcFactory::new(settings.ice_servers.clone()));
    let sinks = Arc::new(DirectorySinkProvider::new(settings.output_dir.clone()));
    let node = PeerNode::start(&settings, factory, sinks, Some(event_tx), sos.clone()).await?;
    eprintln!("Your peer id: {}", node.peer_id());

    if args.rooms.is_empty() {
        warn!(event = "no_rooms", "No --room given; waiting without joining any room");
    }
    for room in &args.rooms {
        node.join(room)?;
    }

    let mut stdin = (policy == AcceptPolicy::Ask).then(|| BufReader::new(tokio::io::stdin()).lines());
    let mut worker = PeerWorker {
        node,
        send: args.send,
        policy,
        prompts: OfferPrompts::default(),
        summary: Summary::default(),
    };

    let relay_lost = loop {
        tokio::select! {
            _ = sos.wait() => break false,
            ev = event_rx.recv() => match ev {
                Some(AppEvent::RelayLost) => break true,
                Some(ev) => worker.handle_app_event(ev).await,
                None => break false,
            },
            Some(line) = next_line(&mut stdin) => worker.answer_prompt(&line).await,
        }
    };

    worker.node.shutdown();
    info!(
        event = "peer_summary",
        sent = worker.summary.sent,
        received = worker.summary.received,
        declined = worker.summary.declined,
        failed = worker.summary.failed,
        "Peer stopped"
    );
    if relay_lost {
        bail!("connection to the signaling relay was lost");
    }
    Ok(())
}

/// Next typed line, or never once stdin is closed or not in use.
async fn next_line(stdin: &mut Option<Lines<BufReader<Stdin>>>) -> Option<String> {
    let Some(lines) = stdin else {
        return std::future::pending().await;
    };
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) | Err(_) => {
            debug!(event = "stdin_closed", "Stdin closed; pending offers will expire");
            *stdin = None;
            None
        }
    }
}

impl PeerWorker {
    async fn handle_app_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::RoomMembershipChanged { room, joined } => {
                info!(event = "room_membership", %room, joined, "Room membership changed");
            }
            AppEvent::PeerListChanged { room, peers } => {
                info!(event = "peer_list", %room, count = peers.len(), peers = ?peers, "Peers in room");
            }
            AppEvent::JoinFailed { room, error } => {
                error!(event = "join_failed", %room, %error, "Could not join room");
            }
            AppEvent::ConnectionStateChanged { key, state } => {
                debug!(event = "connection_state", %key, %state, "Connection state");
            }
            AppEvent::ChannelOpened { key } => {
                for path in &self.send {
                    if let Err(e) = self.node.send_file(&key, FileSource::Path(path.clone())).await {
                        warn!(event = "send_not_queued", %key, path = %path.display(), error = %e, "Could not queue file");
                    }
                }
            }
            AppEvent::ConnectionClosed { key, reason } => {
                info!(event = "connection_closed", %key, %reason, "Connection closed");
            }
            AppEvent::NegotiationFailed { key, error } => {
                warn!(event = "negotiation_failed", %key, %error, "Negotiation failed");
            }
            AppEvent::RelayLost => {}
            AppEvent::TransferQueued { key, offer, .. } => {
                debug!(event = "transfer_queued", %key, file = %offer.file_name, "Queued");
            }
            AppEvent::TransferOfferPending { key, id, offer } => self.on_offer(key, id, offer).await,
            AppEvent::DecisionExpired { key, id } => {
                info!(event = "decision_expired", %key, %id, "Offer expired before an answer");
                self.forget_prompt(id);
            }
            AppEvent::TransferProgress {
                key,
                direction,
                chunks,
                total_chunks,
                bytes,
                ..
            } => {
                debug!(event = "transfer_progress", %key, ?direction, chunks, total_chunks, bytes, "Progress");
            }
            AppEvent::TransferCompleted {
                key,
                direction,
                file_name,
                bytes,
                location,
                ..
            } => {
                match direction {
                    Direction::Outgoing => self.summary.sent += 1,
                    Direction::Incoming => self.summary.received += 1,
                }
                info!(
                    event = "transfer_completed",
                    %key,
                    ?direction,
                    file = %file_name,
                    bytes,
                    location = location.as_deref().unwrap_or("-"),
                    "Transfer completed"
                );
            }
            AppEvent::TransferDeclined { key, id, direction } => {
                self.summary.declined += 1;
                info!(event = "transfer_declined", %key, %id, ?direction, "Transfer declined");
            }
            AppEvent::TransferFailed {
                key,
                id,
                direction,
                error,
            } => {
                self.summary.failed += 1;
                error!(event = "transfer_failed", %key, %id, ?direction, %error, "Transfer failed");
                self.forget_prompt(id);
            }
        }
    }

    async fn on_offer(&mut self, key: ConnectionKey, id: Uuid, offer: TransferOffer) {
        let decision = match self.policy {
            AcceptPolicy::Accept => Decision::Accept,
            AcceptPolicy::Decline => Decision::Decline,
            AcceptPolicy::Ask => {
                let pending = PendingOffer { key, id, offer };
                if self.prompts.push(pending) {
                    if let Some(head) = self.prompts.head() {
                        prompt(head);
                    }
                }
                return;
            }
        };
        if let Err(e) = self.node.decide(&key, id, decision).await {
            warn!(event = "decision_not_delivered", %key, %id, error = %e, "Could not answer offer");
        }
    }

    async fn answer_prompt(&mut self, line: &str) {
        let Some(pending) = self.prompts.answer() else {
            return;
        };
        let decision = parse_answer(line);
        if let Err(e) = self.node.decide(&pending.key, pending.id, decision).await {
            warn!(event = "decision_not_delivered", key = %pending.key, id = %pending.id, error = %e, "Could not answer offer");
        }
        if let Some(next) = self.prompts.head() {
            prompt(next);
        }
    }

    fn forget_prompt(&mut self, id: Uuid) {
        if self.prompts.forget(id) {
            if let Some(next) = self.prompts.head() {
                prompt(next);
            }
        }
    }
}
