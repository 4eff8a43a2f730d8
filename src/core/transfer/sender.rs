//! Outbound side of a channel: one FIFO queue, one active send.
//!
//! Each queued transfer is offered, waits for the remote answer under the
//! accept timeout, then streams its chunks in order. Before every chunk the
//! channel's buffered amount must be under the low water mark.

use super::offer::TransferOffer;
use super::protocol::ControlMessage;
use super::source::FileSource;
use crate::core::config::TransferSettings;
use crate::core::connection::capability::DataChannel;
use crate::core::connection::ConnectionKey;
use crate::core::error::TransferError;
use crate::core::events::{notify_app, AppEvent, Direction};
use crate::utils::sos::SignalOfStop;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) struct OutboundTransfer {
    pub id: Uuid,
    pub offer: TransferOffer,
    pub source: FileSource,
}

/// Remote answer to an offer, routed here by the receive worker. Carries the
/// echoed transfer id; peers that do not echo it answer `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferResponse {
    Accept(Option<Uuid>),
    Decline(Option<Uuid>),
}

impl OfferResponse {
    fn answers(&self, id: Uuid) -> bool {
        match self {
            OfferResponse::Accept(echoed) | OfferResponse::Decline(echoed) => {
                echoed.map_or(true, |echoed| echoed == id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderStatus {
    AwaitingAccept,
    Sending,
    Done,
    Aborted,
}

struct SenderSession {
    id: Uuid,
    offset: u64,
    chunks_sent: u64,
    status: SenderStatus,
}

enum SendOutcome {
    Completed { chunks: u64, bytes: u64 },
    Declined,
}

pub(crate) struct SendContext {
    pub key: ConnectionKey,
    pub channel: Arc<dyn DataChannel>,
    pub settings: TransferSettings,
    pub app_tx: Option<mpsc::UnboundedSender<AppEvent>>,
    pub stop: SignalOfStop,
}

/// Wait until the channel's send buffer is below `low_water`.
///
/// Polls every `poll`; gives up after `max_wait` or as soon as the channel
/// stops being open.
pub(crate) async fn wait_for_buffer_space(
    channel: &dyn DataChannel,
    low_water: usize,
    poll: Duration,
    max_wait: Duration,
) -> Result<(), TransferError> {
    if !channel.is_open() {
        return Err(TransferError::ChannelUnavailable("channel not open".into()));
    }
    let buffered = channel.buffered_amount().await;
    if buffered < low_water {
        return Ok(());
    }

    debug!(
        channel = %channel.label(),
        buffered,
        low_water,
        "Applying backpressure - waiting for buffer to drain"
    );
    let deadline = Instant::now() + max_wait;
    loop {
        tokio::time::sleep(poll).await;
        if !channel.is_open() {
            return Err(TransferError::ChannelUnavailable(
                "channel closed during backpressure wait".into(),
            ));
        }
        if channel.buffered_amount().await < low_water {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransferError::ChannelUnavailable(format!(
                "send buffer did not drain within {}s",
                max_wait.as_secs()
            )));
        }
    }
}

pub(crate) async fn send_loop(
    ctx: SendContext,
    mut queue: mpsc::UnboundedReceiver<OutboundTransfer>,
    mut responses: mpsc::UnboundedReceiver<OfferResponse>,
) {
    loop {
        let transfer = tokio::select! {
            _ = ctx.stop.wait() => break,
            next = queue.recv() => match next {
                Some(transfer) => transfer,
                None => break,
            },
        };

        let mut session = SenderSession {
            id: transfer.id,
            offset: 0,
            chunks_sent: 0,
            status: SenderStatus::AwaitingAccept,
        };
        let result = tokio::select! {
            _ = ctx.stop.wait() => Err(TransferError::ChannelUnavailable("channel closed".into())),
            res = send_one(&ctx, &transfer, &mut session, &mut responses) => res,
        };

        match result {
            Ok(SendOutcome::Completed { chunks, bytes }) => {
                session.status = SenderStatus::Done;
                info!(event = "send_complete", key = %ctx.key, id = %session.id, file = %transfer.offer.file_name, chunks, bytes, "File sent");
                notify_app(
                    &ctx.app_tx,
                    AppEvent::TransferCompleted {
                        key: ctx.key.clone(),
                        id: transfer.id,
                        direction: Direction::Outgoing,
                        file_name: transfer.offer.file_name.clone(),
                        chunks,
                        bytes,
                        location: None,
                    },
                );
            }
            Ok(SendOutcome::Declined) => {
                session.status = SenderStatus::Aborted;
                info!(event = "send_declined", key = %ctx.key, id = %session.id, file = %transfer.offer.file_name, "Offer declined");
                notify_app(
                    &ctx.app_tx,
                    AppEvent::TransferDeclined {
                        key: ctx.key.clone(),
                        id: transfer.id,
                        direction: Direction::Outgoing,
                    },
                );
            }
            Err(error) => {
                let was_streaming = session.status == SenderStatus::Sending;
                session.status = SenderStatus::Aborted;
                warn!(
                    event = "send_aborted",
                    key = %ctx.key,
                    id = %session.id,
                    file = %transfer.offer.file_name,
                    offset = session.offset,
                    chunks_sent = session.chunks_sent,
                    %error,
                    "Send aborted"
                );
                if was_streaming && ctx.channel.is_open() {
                    // Let the receiver close out its session; the count check fails it.
                    let done = ControlMessage::Done {
                        file_name: transfer.offer.file_name.clone(),
                    };
                    let _ = ctx.channel.send_text(done.encode()).await;
                }
                notify_app(
                    &ctx.app_tx,
                    AppEvent::TransferFailed {
                        key: ctx.key.clone(),
                        id: transfer.id,
                        direction: Direction::Outgoing,
                        error,
                    },
                );
            }
        }
        debug!(event = "send_queue_advance", key = %ctx.key, status = ?session.status, "Advancing send queue");
    }

    // Channel gone: everything still queued fails fast.
    queue.close();
    while let Ok(transfer) = queue.try_recv() {
        notify_app(
            &ctx.app_tx,
            AppEvent::TransferFailed {
                key: ctx.key.clone(),
                id: transfer.id,
                direction: Direction::Outgoing,
                error: TransferError::ChannelUnavailable("channel closed".into()),
            },
        );
    }
}

async fn send_one(
    ctx: &SendContext,
    transfer: &OutboundTransfer,
    session: &mut SenderSession,
    responses: &mut mpsc::UnboundedReceiver<OfferResponse>,
) -> Result<SendOutcome, TransferError> {
    let channel = ctx.channel.as_ref();
    let offer = &transfer.offer;
    if !channel.is_open() {
        return Err(TransferError::ChannelUnavailable("channel not open".into()));
    }

    // Answers to an offer we already gave up on must not answer this one.
    while let Ok(stale) = responses.try_recv() {
        debug!(event = "stale_response_dropped", key = %ctx.key, response = ?stale, "Dropping late answer");
    }

    channel
        .send_text(offer.to_message(session.id).encode())
        .await
        .map_err(|e| TransferError::ChannelUnavailable(e.to_string()))?;
    debug!(event = "offer_sent", key = %ctx.key, id = %session.id, file = %offer.file_name, "Waiting for answer");

    let id = session.id;
    let answer = async {
        loop {
            match responses.recv().await {
                Some(response) if response.answers(id) => return Some(response),
                Some(stale) => {
                    debug!(event = "stale_response_dropped", key = %ctx.key, %id, response = ?stale, "Dropping answer to an earlier offer");
                }
                None => return None,
            }
        }
    };
    match timeout(ctx.settings.accept_timeout, answer).await {
        Ok(Some(OfferResponse::Accept(_))) => {}
        Ok(Some(OfferResponse::Decline(_))) => return Ok(SendOutcome::Declined),
        Ok(None) => {
            return Err(TransferError::ChannelUnavailable("channel closed".into()));
        }
        Err(_) => {
            return Err(TransferError::Timeout {
                secs: ctx.settings.accept_timeout.as_secs(),
            });
        }
    }

    session.status = SenderStatus::Sending;
    let mut reader = transfer.source.open().await?;
    for index in 0..offer.total_chunks {
        let len = offer.chunk_len(index);
        let chunk = reader.read_chunk(len).await?;
        wait_for_buffer_space(
            channel,
            ctx.settings.low_water_mark,
            ctx.settings.poll_interval,
            ctx.settings.drain_timeout,
        )
        .await?;
        channel
            .send_binary(chunk)
            .await
            .map_err(|e| TransferError::ChannelUnavailable(e.to_string()))?;

        session.offset += len as u64;
        session.chunks_sent += 1;
        let sent = session.chunks_sent;
        if sent % ctx.settings.progress_every.max(1) == 0 || sent == offer.total_chunks {
            notify_app(
                &ctx.app_tx,
                AppEvent::TransferProgress {
                    key: ctx.key.clone(),
                    id: session.id,
                    direction: Direction::Outgoing,
                    chunks: sent,
                    total_chunks: offer.total_chunks,
                    bytes: session.offset,
                },
            );
        }
    }

    channel
        .send_text(
            ControlMessage::Done {
                file_name: offer.file_name.clone(),
            }
            .encode(),
        )
        .await
        .map_err(|e| TransferError::ChannelUnavailable(e.to_string()))?;

    Ok(SendOutcome::Completed {
        chunks: session.chunks_sent,
        bytes: session.offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::channel_pair;

    #[tokio::test(start_paused = true)]
    async fn backpressure_waits_for_drain() {
        let (a, _b, _rx_a, _rx_b) = channel_pair("files");
        a.set_buffered(4096);

        let ch = a.clone();
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            ch.set_buffered(0);
        });

        let started = Instant::now();
        wait_for_buffer_space(a.as_ref(), 1024, Duration::from_millis(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(55));
        drain.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_gives_up_when_buffer_stalls() {
        let (a, _b, _rx_a, _rx_b) = channel_pair("files");
        a.set_buffered(usize::MAX);
        let err = wait_for_buffer_space(a.as_ref(), 1024, Duration::from_millis(10), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn closed_channel_fails_fast() {
        let (a, _b, _rx_a, _rx_b) = channel_pair("files");
        a.close().await.unwrap();
        let err = wait_for_buffer_space(a.as_ref(), 1024, Duration::from_millis(10), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChannelUnavailable(_)));
    }
}
