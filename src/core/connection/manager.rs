//! Connection manager actor.
//!
//! One task owns the room views and the connection table. Each tracked
//! (room, peer) key runs its own [`PeerTask`] that drives the negotiator and
//! reports back over an mpsc queue; nothing else touches connection state.
//!
//! Initiator rule: a member that is told about a newcomer initiates toward
//! it. The first `peer-joined` after our own join is the membership reply and
//! never triggers an offer, so a fresh joiner only ever answers.

use super::capability::{
    ChannelMessage, DataChannel, Negotiator, NegotiatorEvent, NegotiatorFactory, Role,
};
use super::state::{ConnectionState, SignalingState};
use super::table::{ConnectionTable, SlotId};
use super::ConnectionKey;
use crate::core::config::CLOSE_TIMEOUT;
use crate::core::error::{NegotiationError, SignalingError};
use crate::core::events::{notify_app, AppEvent};
use crate::core::relay::client::RelayHandle;
use crate::core::relay::protocol::{
    IceCandidate, PeerId, RoomId, SdpKind, ServerMessage, SessionDescription, SignalPayload,
};
use crate::core::transfer::TransferEngine;
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Per-step and overall negotiation deadlines, plus how long a join waits
/// for the relay's membership reply.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationTimeouts {
    pub step: Duration,
    pub establish: Duration,
    pub join: Duration,
}

/// Point-in-time view of one tracked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub key: ConnectionKey,
    pub role: Role,
    pub state: SignalingState,
    pub channel_open: bool,
}

enum ManagerCommand {
    Join(RoomId),
    Leave(RoomId),
    Peers(RoomId, oneshot::Sender<Vec<PeerId>>),
    Connections(oneshot::Sender<Vec<ConnectionSummary>>),
}

/// Cloneable front door to the manager task.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl ManagerHandle {
    fn send(&self, cmd: ManagerCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow!("connection manager stopped"))
    }

    pub fn join(&self, room: &str) -> Result<()> {
        self.send(ManagerCommand::Join(room.to_string()))
    }

    pub fn leave(&self, room: &str) -> Result<()> {
        self.send(ManagerCommand::Leave(room.to_string()))
    }

    /// Other members of `room` as last reported by the relay.
    pub async fn peers(&self, room: &str) -> Result<Vec<PeerId>> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Peers(room.to_string(), tx))?;
        rx.await.map_err(|_| anyhow!("connection manager stopped"))
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionSummary>> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::Connections(tx))?;
        rx.await.map_err(|_| anyhow!("connection manager stopped"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomPhase {
    /// Join sent, membership reply not seen yet.
    Joining { deadline: Instant },
    Joined,
}

struct RoomView {
    phase: RoomPhase,
    members: Vec<PeerId>,
}

struct PeerLink {
    role: Role,
    state: SignalingState,
    channel_open: bool,
    inbox: mpsc::UnboundedSender<SignalPayload>,
    stop: SignalOfStop,
}

struct PeerReport {
    slot: SlotId,
    kind: ReportKind,
}

enum ReportKind {
    State(SignalingState),
    ChannelOpen {
        channel: Arc<dyn DataChannel>,
        inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    },
    Closed(Option<NegotiationError>),
}

pub struct ConnectionManager {
    local_id: PeerId,
    relay: RelayHandle,
    factory: Arc<dyn NegotiatorFactory>,
    engine: TransferEngine,
    app_tx: Option<mpsc::UnboundedSender<AppEvent>>,
    timeouts: NegotiationTimeouts,
    rooms: HashMap<RoomId, RoomView>,
    table: ConnectionTable<PeerLink>,
    reports_tx: mpsc::UnboundedSender<PeerReport>,
    sos: SignalOfStop,
}

impl ConnectionManager {
    /// Spawn the manager task. It runs until `sos` fires or the relay
    /// event stream ends.
    pub fn spawn(
        local_id: PeerId,
        relay: RelayHandle,
        relay_events: mpsc::UnboundedReceiver<ServerMessage>,
        factory: Arc<dyn NegotiatorFactory>,
        engine: TransferEngine,
        app_tx: Option<mpsc::UnboundedSender<AppEvent>>,
        timeouts: NegotiationTimeouts,
        sos: SignalOfStop,
    ) -> ManagerHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id,
            relay,
            factory,
            engine,
            app_tx,
            timeouts,
            rooms: HashMap::new(),
            table: ConnectionTable::new(),
            reports_tx,
            sos,
        };
        tokio::spawn(manager.run(relay_events, cmd_rx, reports_rx));
        ManagerHandle { tx: cmd_tx }
    }

    async fn run(
        mut self,
        mut relay_events: mpsc::UnboundedReceiver<ServerMessage>,
        mut commands: mpsc::UnboundedReceiver<ManagerCommand>,
        mut reports: mpsc::UnboundedReceiver<PeerReport>,
    ) {
        let sos = self.sos.clone();
        loop {
            let join_deadline = self.next_join_deadline();
            tokio::select! {
                _ = sos.wait() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                msg = relay_events.recv() => match msg {
                    Some(msg) => self.handle_relay(msg).await,
                    None => {
                        warn!(event = "relay_lost", "Relay connection lost, leaving all rooms");
                        notify_app(&self.app_tx, AppEvent::RelayLost);
                        break;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
                _ = async {
                    match join_deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => self.expire_joins(),
            }
        }

        let rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
        for room in rooms {
            self.drop_room(&room).await;
        }
        debug!(event = "manager_stopped", "Connection manager stopped");
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Join(room) => {
                if self.rooms.contains_key(&room) {
                    debug!(event = "join_noop", %room, "Already in room");
                    return;
                }
                if let Err(e) = self.relay.join(&room) {
                    warn!(event = "join_failed", %room, error = %e, "Cannot join room");
                    return;
                }
                self.rooms.insert(
                    room,
                    RoomView {
                        phase: RoomPhase::Joining {
                            deadline: Instant::now() + self.timeouts.join,
                        },
                        members: Vec::new(),
                    },
                );
            }
            ManagerCommand::Leave(room) => {
                if !self.rooms.contains_key(&room) {
                    debug!(event = "leave_noop", %room, "Not in room");
                    return;
                }
                if let Err(e) = self.relay.leave(&room) {
                    warn!(event = "leave_failed", %room, error = %e, "Relay leave not sent");
                }
                self.drop_room(&room).await;
            }
            ManagerCommand::Peers(room, reply) => {
                let peers = self
                    .rooms
                    .get(&room)
                    .map(|r| r.members.clone())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            ManagerCommand::Connections(reply) => {
                let mut out: Vec<ConnectionSummary> = self
                    .table
                    .keys()
                    .into_iter()
                    .filter_map(|key| {
                        self.table.get(&key).map(|link| ConnectionSummary {
                            role: link.role,
                            state: link.state,
                            channel_open: link.channel_open,
                            key,
                        })
                    })
                    .collect();
                out.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = reply.send(out);
            }
        }
    }

    fn next_join_deadline(&self) -> Option<Instant> {
        self.rooms
            .values()
            .filter_map(|view| match view.phase {
                RoomPhase::Joining { deadline } => Some(deadline),
                RoomPhase::Joined => None,
            })
            .min()
    }

    /// Give up on joins the relay never confirmed. A room still joining has
    /// no connections, so forgetting its view is enough.
    fn expire_joins(&mut self) {
        let now = Instant::now();
        let expired: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, view)| matches!(view.phase, RoomPhase::Joining { deadline } if deadline <= now))
            .map(|(room, _)| room.clone())
            .collect();

        for room in expired {
            self.rooms.remove(&room);
            // A late acceptance would leave us listed as a member.
            let _ = self.relay.leave(&room);
            let error = SignalingError::JoinTimeout {
                room: room.clone(),
                secs: self.timeouts.join.as_secs(),
            };
            warn!(event = "join_timeout", %room, %error, "Room join not confirmed");
            notify_app(&self.app_tx, AppEvent::JoinFailed { room, error });
        }
    }

    /// Close every connection of `room` and forget it.
    async fn drop_room(&mut self, room: &str) {
        for key in self.table.keys_in_room(room) {
            self.close_key(&key, "left room").await;
        }
        if self.rooms.remove(room).is_some() {
            info!(event = "room_left", %room, "Left room");
            notify_app(
                &self.app_tx,
                AppEvent::RoomMembershipChanged {
                    room: room.to_string(),
                    joined: false,
                },
            );
        }
    }

    // ── Relay events ─────────────────────────────────────────────────────

    async fn handle_relay(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Welcome { peer_id } => {
                debug!(event = "relay_welcome_repeat", %peer_id, "Ignoring repeated welcome");
            }
            ServerMessage::PeerJoined { room_id, peer_ids } => {
                self.on_peer_joined(room_id, peer_ids).await;
            }
            ServerMessage::Signal {
                from,
                room_id,
                signal,
            } => {
                if !self.rooms.contains_key(&room_id) {
                    warn!(event = "signal_unknown_room", room = %room_id, %from, "Signal for a room we are not in");
                    return;
                }
                let key = ConnectionKey::new(room_id, from);
                match SignalPayload::decode(&signal) {
                    Ok(payload) => self.on_signal(key, payload).await,
                    Err(e) => {
                        warn!(event = "signal_malformed", %key, error = %e, "Malformed signal payload");
                        if self.table.contains(&key) {
                            self.fail_key(&key, NegotiationError::BadPayload(e.to_string()))
                                .await;
                        }
                    }
                }
            }
            ServerMessage::PeerLeft { room_id, peer_id } => {
                if let Some(view) = self.rooms.get_mut(&room_id) {
                    view.members.retain(|m| m != &peer_id);
                    let peers = view.members.clone();
                    notify_app(
                        &self.app_tx,
                        AppEvent::PeerListChanged {
                            room: room_id.clone(),
                            peers,
                        },
                    );
                }
                let key = ConnectionKey::new(room_id, peer_id);
                self.close_key(&key, "peer left").await;
            }
        }
    }

    async fn on_peer_joined(&mut self, room: RoomId, peer_ids: Vec<PeerId>) {
        let local_id = self.local_id.clone();
        let Some(view) = self.rooms.get_mut(&room) else {
            warn!(event = "peer_joined_unknown_room", %room, "Notification for a room we are not in");
            return;
        };

        let newcomers: Vec<PeerId> = peer_ids.into_iter().filter(|p| *p != local_id).collect();
        match view.phase {
            RoomPhase::Joining { .. } => {
                view.phase = RoomPhase::Joined;
                view.members = newcomers;
                info!(event = "room_joined", %room, members = view.members.len(), "Joined room");
                let peers = view.members.clone();
                notify_app(
                    &self.app_tx,
                    AppEvent::RoomMembershipChanged {
                        room: room.clone(),
                        joined: true,
                    },
                );
                notify_app(&self.app_tx, AppEvent::PeerListChanged { room, peers });
            }
            RoomPhase::Joined => {
                for peer in &newcomers {
                    if !view.members.contains(peer) {
                        view.members.push(peer.clone());
                    }
                }
                let peers = view.members.clone();
                notify_app(
                    &self.app_tx,
                    AppEvent::PeerListChanged {
                        room: room.clone(),
                        peers,
                    },
                );
                for peer in newcomers {
                    let key = ConnectionKey::new(room.clone(), peer);
                    if self.table.contains(&key) {
                        warn!(event = "peer_rejoined", %key, "Peer rejoined, replacing its connection");
                    }
                    self.spawn_link(key, Role::Initiator, None).await;
                }
            }
        }
    }

    async fn on_signal(&mut self, key: ConnectionKey, payload: SignalPayload) {
        match payload {
            SignalPayload::Description(SessionDescription {
                kind: SdpKind::Offer,
                ..
            }) => {
                if self.table.contains(&key) {
                    warn!(event = "offer_for_tracked_key", %key, "Remote restarted negotiation, replacing connection");
                }
                self.spawn_link(key, Role::Responder, Some(payload)).await;
            }
            payload => match self.table.get(&key) {
                Some(link) => {
                    let _ = link.inbox.send(payload);
                }
                None => {
                    warn!(event = "signal_untracked", %key, kind = payload.kind(), "Dropping signal for untracked connection");
                }
            },
        }
    }

    // ── Table maintenance ────────────────────────────────────────────────

    async fn spawn_link(&mut self, key: ConnectionKey, role: Role, first: Option<SignalPayload>) {
        let stop = self.sos.child();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        if let Some(payload) = first {
            let _ = inbox_tx.send(payload);
        }

        let link = PeerLink {
            role,
            state: SignalingState::New,
            channel_open: false,
            inbox: inbox_tx,
            stop: stop.clone(),
        };
        let (slot, evicted) = self.table.insert(key.clone(), link);
        if let Some(old) = evicted {
            old.stop.cancel();
            self.engine.detach(&key).await;
            notify_app(
                &self.app_tx,
                AppEvent::ConnectionClosed {
                    key: key.clone(),
                    reason: "replaced".into(),
                },
            );
        }

        info!(event = "connection_created", %key, %role, "Tracking new connection");
        notify_app(
            &self.app_tx,
            AppEvent::ConnectionStateChanged {
                key: key.clone(),
                state: SignalingState::New,
            },
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = PeerTask {
            key,
            slot,
            state: ConnectionState::new(role),
            factory: self.factory.clone(),
            relay: self.relay.clone(),
            reports: self.reports_tx.clone(),
            inbox: inbox_rx,
            events_tx,
            events_rx,
            channel_tx: None,
            stop,
            timeouts: self.timeouts,
        };
        tokio::spawn(task.run());
    }

    /// Stop the key's task, abort its transfers, and forget it.
    async fn close_key(&mut self, key: &ConnectionKey, reason: &str) {
        let Some(link) = self.table.remove(key) else {
            return;
        };
        link.stop.cancel();
        self.engine.detach(key).await;
        info!(event = "connection_closed", %key, %reason, "Connection closed");
        notify_app(
            &self.app_tx,
            AppEvent::ConnectionClosed {
                key: key.clone(),
                reason: reason.to_string(),
            },
        );
    }

    async fn fail_key(&mut self, key: &ConnectionKey, error: NegotiationError) {
        warn!(event = "negotiation_failed", %key, %error, "Negotiation failed");
        notify_app(
            &self.app_tx,
            AppEvent::NegotiationFailed {
                key: key.clone(),
                error: error.clone(),
            },
        );
        self.close_key(key, &error.to_string()).await;
    }

    async fn handle_report(&mut self, report: PeerReport) {
        let Some((key, link)) = self.table.resolve_mut(report.slot) else {
            // The connection was replaced or closed already.
            if let ReportKind::ChannelOpen { channel, .. } = report.kind {
                let _ = channel.close().await;
            }
            return;
        };
        let key = key.clone();

        match report.kind {
            ReportKind::State(state) => {
                link.state = state;
                debug!(event = "signaling_state", %key, %state, "Signaling state changed");
                notify_app(&self.app_tx, AppEvent::ConnectionStateChanged { key, state });
            }
            ReportKind::ChannelOpen { channel, inbound } => {
                link.channel_open = true;
                info!(event = "channel_open", %key, "Data channel ready for transfers");
                self.engine.attach(key.clone(), channel, inbound).await;
                notify_app(&self.app_tx, AppEvent::ChannelOpened { key });
            }
            ReportKind::Closed(error) => {
                let was_open = link.channel_open;
                match error {
                    Some(NegotiationError::ChannelClosed) if was_open => {
                        self.close_key(&key, "data channel closed").await;
                    }
                    Some(error) => self.fail_key(&key, error).await,
                    None => self.close_key(&key, "closed").await,
                }
            }
        }
    }
}

// ── Per-key task ─────────────────────────────────────────────────────────────

struct PeerTask {
    key: ConnectionKey,
    slot: SlotId,
    state: ConnectionState,
    factory: Arc<dyn NegotiatorFactory>,
    relay: RelayHandle,
    reports: mpsc::UnboundedSender<PeerReport>,
    inbox: mpsc::UnboundedReceiver<SignalPayload>,
    events_tx: mpsc::UnboundedSender<NegotiatorEvent>,
    events_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
    /// Feeds channel messages to the transfer engine once the channel is open.
    channel_tx: Option<mpsc::UnboundedSender<ChannelMessage>>,
    stop: SignalOfStop,
    timeouts: NegotiationTimeouts,
}

impl PeerTask {
    async fn run(mut self) {
        let mut negotiator = None;
        let result = self.drive(&mut negotiator).await;

        if let Some(channel) = self.state.close() {
            let _ = timeout(CLOSE_TIMEOUT, channel.close()).await;
        }
        if let Some(negotiator) = negotiator {
            if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, negotiator.close()).await {
                debug!(event = "negotiator_close_failed", key = %self.key, error = %e, "Negotiator close failed");
            }
        }

        let error = match result {
            Ok(()) | Err(NegotiationError::Cancelled) => None,
            Err(e) => Some(e),
        };
        self.report(ReportKind::Closed(error));
    }

    fn report(&self, kind: ReportKind) {
        let _ = self.reports.send(PeerReport {
            slot: self.slot,
            kind,
        });
    }

    /// Run one capability call under the step timeout, abandoning it on stop.
    async fn step<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T, NegotiationError> {
        tokio::select! {
            _ = self.stop.wait() => Err(NegotiationError::Cancelled),
            res = timeout(self.timeouts.step, fut) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(NegotiationError::Capability(format!("{what}: {e}"))),
                Err(_) => Err(NegotiationError::Timeout(what)),
            },
        }
    }

    fn send_signal(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
        self.relay
            .send_signal(&self.key.peer, &self.key.room, &payload)
            .map_err(|e| NegotiationError::Capability(e.to_string()))
    }

    async fn drive(
        &mut self,
        slot: &mut Option<Arc<dyn Negotiator>>,
    ) -> Result<(), NegotiationError> {
        let deadline = Instant::now() + self.timeouts.establish;
        let negotiator = self
            .step(
                "create peer connection",
                self.factory.create(self.state.role(), self.events_tx.clone()),
            )
            .await?;
        *slot = Some(negotiator.clone());

        if self.state.role() == Role::Initiator {
            let offer = self.step("create offer", negotiator.create_offer()).await?;
            self.step(
                "set local offer",
                negotiator.set_local_description(offer.clone()),
            )
            .await?;
            self.state.local_offer_set()?;
            self.report(ReportKind::State(self.state.signaling()));
            self.send_signal(SignalPayload::Description(offer))?;
            debug!(event = "offer_sent", key = %self.key, "Offer sent");
        }

        let stop = self.stop.clone();
        loop {
            let establishing = self.state.channel().is_none();
            tokio::select! {
                _ = stop.wait() => return Ok(()),
                _ = sleep_until(deadline), if establishing => {
                    return Err(NegotiationError::Timeout("connection establishment"));
                }
                Some(payload) = self.inbox.recv() => {
                    self.on_signal(&negotiator, payload).await?;
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => self.on_event(event)?,
                    None => return Err(NegotiationError::Capability("event stream ended".into())),
                },
            }
        }
    }

    async fn on_signal(
        &mut self,
        negotiator: &Arc<dyn Negotiator>,
        payload: SignalPayload,
    ) -> Result<(), NegotiationError> {
        match payload {
            SignalPayload::Description(desc) if desc.kind == SdpKind::Offer => {
                self.step("apply remote offer", negotiator.set_remote_description(desc))
                    .await?;
                self.state.remote_offer_set()?;
                self.report(ReportKind::State(self.state.signaling()));

                let answer = self.step("create answer", negotiator.create_answer()).await?;
                self.step(
                    "set local answer",
                    negotiator.set_local_description(answer.clone()),
                )
                .await?;
                let buffered = self.state.local_answer_set()?;
                self.send_signal(SignalPayload::Description(answer))?;
                debug!(event = "answer_sent", key = %self.key, "Answer sent");
                self.apply_candidates(negotiator, buffered).await?;
                self.report(ReportKind::State(self.state.signaling()));
            }
            SignalPayload::Description(desc) => {
                self.step("apply remote answer", negotiator.set_remote_description(desc))
                    .await?;
                let buffered = self.state.remote_answer_set()?;
                self.apply_candidates(negotiator, buffered).await?;
                self.report(ReportKind::State(self.state.signaling()));
            }
            SignalPayload::Candidate(candidate) => {
                if let Some(candidate) = self.state.remote_candidate(candidate) {
                    self.step("add candidate", negotiator.add_ice_candidate(candidate))
                        .await?;
                } else {
                    debug!(
                        event = "candidate_buffered",
                        key = %self.key,
                        pending = self.state.pending_candidates(),
                        "Buffering candidate until stable"
                    );
                }
            }
        }
        Ok(())
    }

    async fn apply_candidates(
        &self,
        negotiator: &Arc<dyn Negotiator>,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        if !candidates.is_empty() {
            debug!(event = "candidates_flushed", key = %self.key, count = candidates.len(), "Applying buffered candidates");
        }
        for candidate in candidates {
            self.step("add candidate", negotiator.add_ice_candidate(candidate))
                .await?;
        }
        Ok(())
    }

    fn on_event(&mut self, event: NegotiatorEvent) -> Result<(), NegotiationError> {
        match event {
            NegotiatorEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalPayload::Candidate(candidate))?;
            }
            NegotiatorEvent::ChannelOpen(channel) => {
                self.state.channel_opened(channel.clone())?;
                let (tx, rx) = mpsc::unbounded_channel();
                self.channel_tx = Some(tx);
                self.report(ReportKind::ChannelOpen {
                    channel,
                    inbound: rx,
                });
            }
            NegotiatorEvent::ChannelMessage(msg) => match &self.channel_tx {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => {
                    warn!(event = "message_before_open", key = %self.key, "Dropping message received before channel open");
                }
            },
            NegotiatorEvent::ChannelClosed => return Err(NegotiationError::ChannelClosed),
            NegotiatorEvent::Failed(reason) => return Err(NegotiationError::Capability(reason)),
        }
        Ok(())
    }
}
