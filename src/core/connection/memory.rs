//! In-memory negotiation capability for tests.
//!
//! Negotiators find each other through a shared [`Switchboard`] using ids
//! embedded in the fake SDP. The channel pair opens when the initiator
//! applies the answer, mirroring when a real data channel can first open.

use super::capability::{
    ChannelMessage, DataChannel, Negotiator, NegotiatorEvent, NegotiatorFactory, Role,
};
use crate::core::relay::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct MemoryChannel {
    label: String,
    remote: mpsc::UnboundedSender<ChannelMessage>,
    closed: SignalOfStop,
    buffered: AtomicUsize,
    binary_sent: AtomicUsize,
}

impl MemoryChannel {
    /// Pretend `n` bytes are waiting in the send buffer.
    pub fn set_buffered(&self, n: usize) {
        self.buffered.store(n, Ordering::SeqCst);
    }

    pub fn binary_sent(&self) -> usize {
        self.binary_sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        !self.closed.cancelled()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            bail!("memory channel closed");
        }
        self.remote
            .send(ChannelMessage::Text(text))
            .map_err(|_| anyhow!("memory channel peer gone"))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            bail!("memory channel closed");
        }
        self.binary_sent.fetch_add(1, Ordering::SeqCst);
        self.remote
            .send(ChannelMessage::Binary(data))
            .map_err(|_| anyhow!("memory channel peer gone"))
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Two connected channel ends. `rx_a` yields what `b` sends and vice versa.
pub fn channel_pair(
    label: &str,
) -> (
    Arc<MemoryChannel>,
    Arc<MemoryChannel>,
    mpsc::UnboundedReceiver<ChannelMessage>,
    mpsc::UnboundedReceiver<ChannelMessage>,
) {
    let closed = SignalOfStop::new();
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let make = |remote| {
        Arc::new(MemoryChannel {
            label: label.to_string(),
            remote,
            closed: closed.clone(),
            buffered: AtomicUsize::new(0),
            binary_sent: AtomicUsize::new(0),
        })
    };
    let a = make(tx_b);
    let b = make(tx_a);
    (a, b, rx_a, rx_b)
}

fn forward(
    mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    closed: SignalOfStop,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.wait() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        let _ = events.send(NegotiatorEvent::ChannelMessage(msg));
                    }
                    None => break,
                },
            }
        }
        let _ = events.send(NegotiatorEvent::ChannelClosed);
    });
}

// ── Switchboard / negotiator ─────────────────────────────────────────────────

#[derive(Default)]
struct Board {
    /// Responder events keyed by the id carried in its answer.
    answers: HashMap<String, mpsc::UnboundedSender<NegotiatorEvent>>,
    /// Close signal of each linked negotiator's channel pair.
    links: HashMap<String, SignalOfStop>,
    fail_offers: bool,
}

#[derive(Default, Clone)]
pub struct Switchboard {
    board: Arc<Mutex<Board>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_offer` fail.
    pub fn fail_offers(&self) {
        if let Ok(mut board) = self.board.lock() {
            board.fail_offers = true;
        }
    }

    pub fn factory(&self) -> Arc<dyn NegotiatorFactory> {
        Arc::new(MemoryFactory {
            board: self.clone(),
        })
    }
}

pub struct MemoryFactory {
    board: Switchboard,
}

#[async_trait]
impl NegotiatorFactory for MemoryFactory {
    async fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Result<Arc<dyn Negotiator>> {
        Ok(Arc::new(MemoryNegotiator {
            id: Uuid::new_v4().to_string(),
            role,
            events,
            board: self.board.clone(),
            remote_set: Mutex::new(false),
            applied: Mutex::new(Vec::new()),
        }))
    }
}

pub struct MemoryNegotiator {
    id: String,
    role: Role,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    board: Switchboard,
    remote_set: Mutex<bool>,
    applied: Mutex<Vec<String>>,
}

impl MemoryNegotiator {
    fn board(&self) -> Result<std::sync::MutexGuard<'_, Board>> {
        self.board
            .board
            .lock()
            .map_err(|_| anyhow!("switchboard poisoned"))
    }

    fn emit_candidate(&self) {
        let _ = self
            .events
            .send(NegotiatorEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:memory {}", self.id),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
    }

    fn link_with(&self, responder_id: &str) -> Result<()> {
        let mut board = self.board()?;
        let responder = board
            .answers
            .remove(responder_id)
            .ok_or_else(|| anyhow!("unknown answer {responder_id}"))?;

        let (a, b, rx_a, rx_b) = channel_pair("files");
        let closed = a.closed.clone();
        board.links.insert(self.id.clone(), closed.clone());
        board.links.insert(responder_id.to_string(), closed.clone());
        drop(board);

        forward(rx_a, closed.clone(), self.events.clone());
        forward(rx_b, closed, responder.clone());
        let _ = self.events.send(NegotiatorEvent::ChannelOpen(a));
        let _ = responder.send(NegotiatorEvent::ChannelOpen(b));
        Ok(())
    }
}

fn sdp_id(desc: &SessionDescription) -> Result<&str> {
    desc.sdp
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("unparseable memory sdp '{}'", desc.sdp))
}

#[async_trait]
impl Negotiator for MemoryNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.board()?.fail_offers {
            bail!("offer creation disabled");
        }
        if self.role != Role::Initiator {
            bail!("responder cannot offer");
        }
        Ok(SessionDescription::offer(format!("memory-offer {}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !*self.remote_set.lock().map_err(|_| anyhow!("poisoned"))? {
            bail!("no remote offer");
        }
        Ok(SessionDescription::answer(format!("memory-answer {}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.kind == SdpKind::Answer {
            self.board()?
                .answers
                .insert(self.id.clone(), self.events.clone());
        }
        self.emit_candidate();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if !desc.sdp.starts_with("memory-") {
            bail!("not a memory sdp");
        }
        let remote_id = sdp_id(&desc)?.to_string();
        *self.remote_set.lock().map_err(|_| anyhow!("poisoned"))? = true;
        if desc.kind == SdpKind::Answer {
            self.link_with(&remote_id)?;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !*self.remote_set.lock().map_err(|_| anyhow!("poisoned"))? {
            bail!("candidate before remote description");
        }
        self.applied
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(closed) = self.board()?.links.remove(&self.id) {
            closed.cancel();
        }
        Ok(())
    }
}
