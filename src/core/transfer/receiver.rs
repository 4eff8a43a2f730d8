//! Inbound side of a channel.
//!
//! At most one incoming transfer exists per channel. It moves through
//! awaiting-decision, sink acquisition and receiving; a new `file-offer`
//! supersedes whatever came before it, because the sender only offers again
//! after it is done with the previous file.

use super::offer::TransferOffer;
use super::protocol::{ControlMessage, Frame};
use super::sender::OfferResponse;
use super::sink::{Sink, SinkProvider};
use super::Decision;
use crate::core::config::TransferSettings;
use crate::core::connection::capability::{ChannelMessage, DataChannel};
use crate::core::connection::ConnectionKey;
use crate::core::error::TransferError;
use crate::core::events::{notify_app, AppEvent, Direction};
use crate::utils::sos::SignalOfStop;
use anyhow::anyhow;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SinkResult = (Uuid, anyhow::Result<Option<Box<dyn Sink>>>);

pub(crate) struct ReceiveContext {
    pub key: ConnectionKey,
    pub channel: Arc<dyn DataChannel>,
    pub settings: TransferSettings,
    pub sinks: Arc<dyn SinkProvider>,
    pub app_tx: Option<mpsc::UnboundedSender<AppEvent>>,
    pub responses: mpsc::UnboundedSender<OfferResponse>,
    pub stop: SignalOfStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverStatus {
    Receiving,
    Complete,
    Failed,
}

struct ReceiveSession {
    id: Uuid,
    offer: TransferOffer,
    received_chunks: u64,
    bytes_written: u64,
    sink: Box<dyn Sink>,
    status: ReceiverStatus,
}

enum Slot {
    Idle,
    AwaitingDecision {
        id: Uuid,
        offer: TransferOffer,
        accept_by: Instant,
        deadline: Instant,
    },
    AcquiringSink {
        id: Uuid,
        offer: TransferOffer,
    },
    Receiving(ReceiveSession),
}

impl Slot {
    fn decision_deadline(&self) -> Option<Instant> {
        match self {
            Slot::AwaitingDecision { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }
}

pub(crate) async fn receive_loop(
    ctx: ReceiveContext,
    mut inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    mut decisions: mpsc::UnboundedReceiver<(Uuid, Decision)>,
) {
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<SinkResult>();
    let stop = ctx.stop.clone();
    let mut receiver = Receiver {
        ctx,
        slot: Slot::Idle,
        sink_tx,
    };

    loop {
        let deadline = receiver.slot.decision_deadline();
        tokio::select! {
            _ = stop.wait() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => receiver.on_message(msg).await,
                None => break,
            },
            Some((id, decision)) = decisions.recv() => receiver.on_decision(id, decision).await,
            Some((id, result)) = sink_rx.recv() => receiver.on_sink(id, result).await,
            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => receiver.expire_decision(),
        }
    }

    receiver.shutdown().await;
}

struct Receiver {
    ctx: ReceiveContext,
    slot: Slot,
    sink_tx: mpsc::UnboundedSender<SinkResult>,
}

impl Receiver {
    async fn on_message(&mut self, msg: ChannelMessage) {
        let frame = match Frame::decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "channel_message_malformed", key = %self.ctx.key, error = %e, "Dropping malformed channel message");
                return;
            }
        };

        match frame {
            Frame::Control(msg @ ControlMessage::FileOffer { .. }) => {
                if let Some(offer) = TransferOffer::from_message(&msg) {
                    self.on_offer(offer, msg.transfer_id()).await;
                }
            }
            Frame::Control(ControlMessage::FileAccept { transfer_id }) => {
                let _ = self.ctx.responses.send(OfferResponse::Accept(transfer_id));
            }
            Frame::Control(ControlMessage::FileDecline { transfer_id }) => {
                let _ = self.ctx.responses.send(OfferResponse::Decline(transfer_id));
            }
            Frame::Control(ControlMessage::Done { file_name }) => self.on_done(file_name).await,
            Frame::Chunk(data) => self.on_chunk(data).await,
        }
    }

    /// The sender's transfer id is reused locally so both ends log the same
    /// id; offers without one get a fresh id.
    async fn on_offer(&mut self, offer: TransferOffer, transfer_id: Option<Uuid>) {
        self.supersede().await;

        let id = transfer_id.unwrap_or_else(Uuid::new_v4);
        if let Err(error) = offer.validate() {
            warn!(event = "offer_invalid", key = %self.ctx.key, file = %offer.file_name, %error, "Declining invalid offer");
            self.ctx
                .send_control(ControlMessage::FileDecline { transfer_id: Some(id) })
                .await;
            self.notify(AppEvent::TransferFailed {
                key: self.ctx.key.clone(),
                id,
                direction: Direction::Incoming,
                error,
            });
            return;
        }

        info!(
            event = "offer_received",
            key = %self.ctx.key,
            %id,
            file = %offer.file_name,
            size = offer.file_size,
            chunks = offer.total_chunks,
            "Incoming file offer"
        );
        let now = Instant::now();
        self.slot = Slot::AwaitingDecision {
            id,
            offer: offer.clone(),
            accept_by: now + self.ctx.settings.accept_timeout,
            deadline: now + self.ctx.settings.decision_timeout,
        };
        self.notify(AppEvent::TransferOfferPending {
            key: self.ctx.key.clone(),
            id,
            offer,
        });
    }

    /// Drop the current incoming transfer because the sender moved on.
    async fn supersede(&mut self) {
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Idle => {}
            Slot::AwaitingDecision { id, .. } | Slot::AcquiringSink { id, .. } => {
                debug!(event = "offer_superseded", key = %self.ctx.key, %id, "Newer offer replaces pending one");
                self.notify(AppEvent::DecisionExpired {
                    key: self.ctx.key.clone(),
                    id,
                });
            }
            Slot::Receiving(session) => {
                let error =
                    TransferError::integrity_mismatch(session.received_chunks, session.offer.total_chunks);
                self.fail_session(session, error).await;
            }
        }
    }

    async fn on_decision(&mut self, id: Uuid, decision: Decision) {
        let (offer, accept_by) = match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::AwaitingDecision {
                id: pending,
                offer,
                accept_by,
                ..
            } if pending == id => (offer, accept_by),
            other => {
                self.slot = other;
                warn!(event = "decision_stale", key = %self.ctx.key, %id, ?decision, "No pending offer for decision");
                return;
            }
        };

        match decision {
            Decision::Accept => {
                self.request_sink(id, &offer, accept_by);
                self.slot = Slot::AcquiringSink { id, offer };
            }
            Decision::Decline => {
                info!(event = "offer_declined", key = %self.ctx.key, %id, file = %offer.file_name, "Declined incoming file");
                self.decline(id).await;
            }
        }
    }

    fn request_sink(&self, id: Uuid, offer: &TransferOffer, accept_by: Instant) {
        let sinks = self.ctx.sinks.clone();
        let tx = self.sink_tx.clone();
        let stop = self.ctx.stop.clone();
        let name = offer.file_name.clone();
        let mime_type = offer.mime_type.clone();
        // Accepting after the sender gave up would only produce a stale answer.
        let limit = self
            .ctx
            .settings
            .sink_request_timeout
            .min(accept_by.saturating_duration_since(Instant::now()));

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = stop.wait() => return,
                res = timeout(limit, sinks.request_sink(&name, &mime_type)) => match res {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("sink request timed out after {}s", limit.as_secs())),
                },
            };
            let _ = tx.send((id, result));
        });
    }

    async fn on_sink(&mut self, id: Uuid, result: anyhow::Result<Option<Box<dyn Sink>>>) {
        let offer = match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::AcquiringSink { id: pending, offer } if pending == id => offer,
            other => {
                self.slot = other;
                debug!(event = "sink_stale", key = %self.ctx.key, %id, "Sink arrived for an offer no longer pending");
                if let Ok(Some(mut sink)) = result {
                    self.ctx.abort_sink(id, sink.as_mut()).await;
                }
                return;
            }
        };

        match result {
            Ok(Some(mut sink)) => {
                if let Err(e) = self
                    .ctx
                    .channel
                    .send_text(ControlMessage::FileAccept { transfer_id: Some(id) }.encode())
                    .await
                {
                    self.ctx.abort_sink(id, sink.as_mut()).await;
                    self.notify(AppEvent::TransferFailed {
                        key: self.ctx.key.clone(),
                        id,
                        direction: Direction::Incoming,
                        error: TransferError::ChannelUnavailable(e.to_string()),
                    });
                    return;
                }
                info!(event = "offer_accepted", key = %self.ctx.key, %id, file = %offer.file_name, "Receiving file");
                self.slot = Slot::Receiving(ReceiveSession {
                    id,
                    offer,
                    received_chunks: 0,
                    bytes_written: 0,
                    sink,
                    status: ReceiverStatus::Receiving,
                });
            }
            Ok(None) => {
                info!(event = "sink_cancelled", key = %self.ctx.key, %id, "Sink request cancelled, declining");
                self.decline(id).await;
            }
            Err(e) => {
                warn!(event = "sink_unavailable", key = %self.ctx.key, %id, error = %e, "No sink for accepted offer, declining");
                self.decline(id).await;
            }
        }
    }

    async fn on_chunk(&mut self, data: Bytes) {
        let Slot::Receiving(session) = &mut self.slot else {
            warn!(event = "chunk_without_session", key = %self.ctx.key, len = data.len(), "Dropping chunk with no active transfer");
            return;
        };

        let index = session.received_chunks;
        let problem = if index >= session.offer.total_chunks {
            Some(format!(
                "chunk {} beyond announced {}",
                index + 1,
                session.offer.total_chunks
            ))
        } else {
            let expected = session.offer.chunk_len(index);
            (data.len() != expected)
                .then(|| format!("chunk {index} has {} bytes, expected {expected}", data.len()))
        };
        let problem = match problem {
            Some(problem) => Some(problem),
            None => match timeout(self.ctx.settings.sink_write_timeout, session.sink.write(&data)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("sink write failed: {e}")),
                Err(_) => Some("sink write timed out".to_string()),
            },
        };
        if let Some(problem) = problem {
            if let Slot::Receiving(session) = std::mem::replace(&mut self.slot, Slot::Idle) {
                self.fail_session(session, TransferError::Integrity(problem)).await;
            }
            return;
        }

        session.received_chunks += 1;
        session.bytes_written += data.len() as u64;
        let received = session.received_chunks;
        if received % self.ctx.settings.progress_every.max(1) == 0
            || received == session.offer.total_chunks
        {
            let event = AppEvent::TransferProgress {
                key: self.ctx.key.clone(),
                id: session.id,
                direction: Direction::Incoming,
                chunks: received,
                total_chunks: session.offer.total_chunks,
                bytes: session.bytes_written,
            };
            self.notify(event);
        }
    }

    async fn on_done(&mut self, file_name: String) {
        let mut session = match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Receiving(session) => session,
            other => {
                self.slot = other;
                debug!(event = "done_without_session", key = %self.ctx.key, file = %file_name, "Ignoring done");
                return;
            }
        };

        if session.received_chunks != session.offer.total_chunks {
            let error =
                TransferError::integrity_mismatch(session.received_chunks, session.offer.total_chunks);
            self.fail_session(session, error).await;
            return;
        }

        match timeout(self.ctx.settings.sink_write_timeout, session.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let error = TransferError::Integrity(format!("sink close failed: {e}"));
                self.fail_session(session, error).await;
                return;
            }
            Err(_) => {
                let error = TransferError::Integrity("sink close timed out".into());
                self.fail_session(session, error).await;
                return;
            }
        }

        session.status = ReceiverStatus::Complete;
        let location = session.sink.location();
        info!(
            event = "receive_complete",
            key = %self.ctx.key,
            id = %session.id,
            file = %session.offer.file_name,
            chunks = session.received_chunks,
            bytes = session.bytes_written,
            location = location.as_deref().unwrap_or("-"),
            status = ?session.status,
            "File received"
        );
        self.notify(AppEvent::TransferCompleted {
            key: self.ctx.key.clone(),
            id: session.id,
            direction: Direction::Incoming,
            file_name: session.offer.file_name,
            chunks: session.received_chunks,
            bytes: session.bytes_written,
            location,
        });
    }

    fn expire_decision(&mut self) {
        if let Slot::AwaitingDecision { id, offer, .. } = std::mem::replace(&mut self.slot, Slot::Idle) {
            info!(event = "decision_expired", key = %self.ctx.key, %id, file = %offer.file_name, "No decision in time, offer lapses");
            self.notify(AppEvent::DecisionExpired {
                key: self.ctx.key.clone(),
                id,
            });
        }
    }

    async fn decline(&mut self, id: Uuid) {
        self.ctx
            .send_control(ControlMessage::FileDecline { transfer_id: Some(id) })
            .await;
        self.notify(AppEvent::TransferDeclined {
            key: self.ctx.key.clone(),
            id,
            direction: Direction::Incoming,
        });
    }

    async fn fail_session(&mut self, mut session: ReceiveSession, error: TransferError) {
        session.status = ReceiverStatus::Failed;
        warn!(
            event = "receive_failed",
            key = %self.ctx.key,
            id = %session.id,
            file = %session.offer.file_name,
            received = session.received_chunks,
            total = session.offer.total_chunks,
            status = ?session.status,
            %error,
            "Incoming transfer failed"
        );
        self.ctx.abort_sink(session.id, session.sink.as_mut()).await;
        self.notify(AppEvent::TransferFailed {
            key: self.ctx.key.clone(),
            id: session.id,
            direction: Direction::Incoming,
            error,
        });
    }

    async fn shutdown(&mut self) {
        let error = TransferError::ChannelUnavailable("channel closed".into());
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Idle => {}
            Slot::AwaitingDecision { id, .. } | Slot::AcquiringSink { id, .. } => {
                self.notify(AppEvent::TransferFailed {
                    key: self.ctx.key.clone(),
                    id,
                    direction: Direction::Incoming,
                    error,
                });
            }
            Slot::Receiving(session) => self.fail_session(session, error).await,
        }
    }

    fn notify(&self, event: AppEvent) {
        notify_app(&self.ctx.app_tx, event);
    }
}

impl ReceiveContext {
    async fn send_control(&self, msg: ControlMessage) {
        if let Err(e) = self.channel.send_text(msg.encode()).await {
            warn!(event = "control_send_failure", key = %self.key, error = %e, "Failed to send control message");
        }
    }

    /// Flag partial output. Bounded like writes: a sink that hung on a write
    /// may hang here too.
    async fn abort_sink(&self, id: Uuid, sink: &mut dyn Sink) {
        match timeout(self.settings.sink_write_timeout, sink.abort()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(event = "sink_abort_failure", key = %self.key, %id, error = %e, "Could not flag partial output");
            }
            Err(_) => {
                error!(
                    event = "sink_abort_timeout",
                    key = %self.key,
                    %id,
                    secs = self.settings.sink_write_timeout.as_secs(),
                    "Sink did not finish aborting, giving up on it"
                );
            }
        }
    }
}
