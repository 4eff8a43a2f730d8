//! TransferEngine: owns the transfer workers of every open channel.
//!
//! Each attached channel gets two tasks sharing one stop signal:
//! - a send worker draining that channel's FIFO queue, one file at a time
//! - a receive worker decoding inbound frames and routing accept/decline
//!   answers back to the send worker
//!
//! Channels never share state, so transfers to different peers run fully in
//! parallel. Detaching a channel cancels both workers; in-flight and queued
//! transfers fail with `ChannelUnavailable`.

use super::receiver::{receive_loop, ReceiveContext};
use super::sender::{send_loop, OutboundTransfer, SendContext};
use super::sink::SinkProvider;
use super::source::FileSource;
use super::Decision;
use crate::core::config::TransferSettings;
use crate::core::connection::capability::{ChannelMessage, DataChannel};
use crate::core::connection::ConnectionKey;
use crate::core::error::TransferError;
use crate::core::events::{notify_app, AppEvent, Direction};
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

struct ChannelWorkers {
    queue: mpsc::UnboundedSender<OutboundTransfer>,
    decisions: mpsc::UnboundedSender<(Uuid, Decision)>,
    stop: SignalOfStop,
}

struct EngineInner {
    settings: TransferSettings,
    sinks: Arc<dyn SinkProvider>,
    app_tx: Option<mpsc::UnboundedSender<AppEvent>>,
    channels: RwLock<HashMap<ConnectionKey, ChannelWorkers>>,
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(
        settings: TransferSettings,
        sinks: Arc<dyn SinkProvider>,
        app_tx: Option<mpsc::UnboundedSender<AppEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                settings,
                sinks,
                app_tx,
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Start transfer workers on a freshly opened channel. A channel already
    /// attached under `key` is detached first.
    pub async fn attach(
        &self,
        key: ConnectionKey,
        channel: Arc<dyn DataChannel>,
        inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    ) {
        let stop = SignalOfStop::new();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        let send_ctx = SendContext {
            key: key.clone(),
            channel: channel.clone(),
            settings: self.inner.settings.clone(),
            app_tx: self.inner.app_tx.clone(),
            stop: stop.clone(),
        };
        let recv_ctx = ReceiveContext {
            key: key.clone(),
            channel,
            settings: self.inner.settings.clone(),
            sinks: self.inner.sinks.clone(),
            app_tx: self.inner.app_tx.clone(),
            responses: responses_tx,
            stop: stop.clone(),
        };

        tokio::spawn(send_loop(send_ctx, queue_rx, responses_rx));
        let recv_stop = stop.clone();
        let recv_key = key.clone();
        tokio::spawn(async move {
            receive_loop(recv_ctx, inbound, decisions_rx).await;
            // Inbound ended: the channel is gone, so the sender must stop too.
            recv_stop.cancel();
            debug!(event = "channel_workers_stopped", key = %recv_key, "Transfer workers finished");
        });

        let previous = self.inner.channels.write().await.insert(
            key.clone(),
            ChannelWorkers {
                queue: queue_tx,
                decisions: decisions_tx,
                stop,
            },
        );
        if let Some(previous) = previous {
            previous.stop.cancel();
            debug!(event = "channel_workers_replaced", %key, "Replaced transfer workers");
        }
        info!(event = "channel_attached", %key, "Transfer engine attached to channel");
    }

    /// Stop the workers for `key`; pending transfers fail.
    pub async fn detach(&self, key: &ConnectionKey) {
        if let Some(workers) = self.inner.channels.write().await.remove(key) {
            workers.stop.cancel();
            info!(event = "channel_detached", %key, "Transfer engine detached from channel");
        }
    }

    pub async fn is_attached(&self, key: &ConnectionKey) -> bool {
        self.inner
            .channels
            .read()
            .await
            .get(key)
            .is_some_and(|w| !w.stop.cancelled())
    }

    /// Queue `source` for sending over the channel of `key`.
    ///
    /// Returns the transfer id once queued; the outcome arrives later as a
    /// `TransferCompleted`, `TransferDeclined` or `TransferFailed` event.
    /// Failures before queueing are reported both ways.
    pub async fn send_file(
        &self,
        key: &ConnectionKey,
        source: FileSource,
    ) -> Result<Uuid, TransferError> {
        let id = Uuid::new_v4();
        match self.enqueue(key, id, source).await {
            Ok(()) => Ok(id),
            Err(error) => {
                notify_app(
                    &self.inner.app_tx,
                    AppEvent::TransferFailed {
                        key: key.clone(),
                        id,
                        direction: Direction::Outgoing,
                        error: error.clone(),
                    },
                );
                Err(error)
            }
        }
    }

    async fn enqueue(
        &self,
        key: &ConnectionKey,
        id: Uuid,
        source: FileSource,
    ) -> Result<(), TransferError> {
        if !self.is_attached(key).await {
            return Err(TransferError::ChannelUnavailable(format!("no open channel to {key}")));
        }
        let offer = source.describe(self.inner.settings.chunk_size).await?;

        let channels = self.inner.channels.read().await;
        let workers = channels
            .get(key)
            .ok_or_else(|| TransferError::ChannelUnavailable(format!("no open channel to {key}")))?;
        workers
            .queue
            .send(OutboundTransfer {
                id,
                offer: offer.clone(),
                source,
            })
            .map_err(|_| TransferError::ChannelUnavailable(format!("channel to {key} closed")))?;

        info!(event = "transfer_queued", %key, %id, file = %offer.file_name, size = offer.file_size, "Transfer queued");
        notify_app(
            &self.inner.app_tx,
            AppEvent::TransferQueued {
                key: key.clone(),
                id,
                offer,
            },
        );
        Ok(())
    }

    /// Answer the pending incoming offer `id` on the channel of `key`.
    pub async fn decide(
        &self,
        key: &ConnectionKey,
        id: Uuid,
        decision: Decision,
    ) -> Result<(), TransferError> {
        let channels = self.inner.channels.read().await;
        let workers = channels
            .get(key)
            .ok_or_else(|| TransferError::ChannelUnavailable(format!("no open channel to {key}")))?;
        workers
            .decisions
            .send((id, decision))
            .map_err(|_| TransferError::ChannelUnavailable(format!("channel to {key} closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::{channel_pair, MemoryChannel};
    use crate::core::transfer::protocol::ControlMessage;
    use crate::core::transfer::sink::MemorySinkProvider;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Side {
        engine: TransferEngine,
        events: mpsc::UnboundedReceiver<AppEvent>,
        sinks: MemorySinkProvider,
    }

    fn side(settings: TransferSettings, sinks: MemorySinkProvider) -> Side {
        let (tx, events) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(settings, Arc::new(sinks.clone()), Some(tx));
        Side {
            engine,
            events,
            sinks,
        }
    }

    fn small() -> TransferSettings {
        TransferSettings {
            chunk_size: 4,
            ..Default::default()
        }
    }

    fn payload(name: &str, data: &[u8]) -> FileSource {
        FileSource::Bytes {
            name: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Attach both engines to the two ends of a fresh channel.
    /// Returns the keys (as seen from `a`, as seen from `b`) and `a`'s channel end.
    async fn link(a: &Side, a_name: &str, b: &Side, b_name: &str) -> (ConnectionKey, ConnectionKey, Arc<MemoryChannel>) {
        let (end_a, end_b, rx_a, rx_b) = channel_pair("files");
        let key_ab = ConnectionKey::new("room", b_name);
        let key_ba = ConnectionKey::new("room", a_name);
        a.engine.attach(key_ab.clone(), end_a.clone(), rx_a).await;
        b.engine.attach(key_ba.clone(), end_b, rx_b).await;
        (key_ab, key_ba, end_a)
    }

    async fn next_where(
        events: &mut mpsc::UnboundedReceiver<AppEvent>,
        mut pred: impl FnMut(&AppEvent) -> bool,
    ) -> AppEvent {
        loop {
            let event = timeout(Duration::from_secs(60), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn next_pending(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> (Uuid, String) {
        match next_where(events, |e| matches!(e, AppEvent::TransferOfferPending { .. })).await {
            AppEvent::TransferOfferPending { id, offer, .. } => (id, offer.file_name),
            _ => unreachable!(),
        }
    }

    async fn next_finished(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> AppEvent {
        next_where(events, |e| {
            matches!(
                e,
                AppEvent::TransferCompleted { .. }
                    | AppEvent::TransferDeclined { .. }
                    | AppEvent::TransferFailed { .. }
            )
        })
        .await
    }

    #[tokio::test]
    async fn ten_mib_file_arrives_in_160_chunks() {
        let mut a = side(TransferSettings::default(), MemorySinkProvider::default());
        let mut b = side(TransferSettings::default(), MemorySinkProvider::default());
        let (key_ab, key_ba, end_a) = link(&a, "A", &b, "B").await;

        let data: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        a.engine.send_file(&key_ab, payload("big.bin", &data)).await.unwrap();

        let (id, name) = next_pending(&mut b.events).await;
        assert_eq!(name, "big.bin");
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();

        match next_finished(&mut b.events).await {
            AppEvent::TransferCompleted {
                direction,
                chunks,
                bytes,
                ..
            } => {
                assert_eq!(direction, Direction::Incoming);
                assert_eq!(chunks, 160);
                assert_eq!(bytes, 10 * 1024 * 1024);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_finished(&mut a.events).await {
            AppEvent::TransferCompleted { direction, chunks, .. } => {
                assert_eq!(direction, Direction::Outgoing);
                assert_eq!(chunks, 160);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(end_a.binary_sent(), 160);
        let records = b.sinks.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].closed);
        assert!(records[0].data == data);
    }

    #[tokio::test]
    async fn decline_creates_no_sink_and_queue_advances() {
        let mut a = side(small(), MemorySinkProvider::default());
        let mut b = side(small(), MemorySinkProvider::default());
        let (key_ab, key_ba, end_a) = link(&a, "A", &b, "B").await;

        let first = a.engine.send_file(&key_ab, payload("one.txt", b"declined")).await.unwrap();
        let second = a.engine.send_file(&key_ab, payload("two.txt", b"accepted!")).await.unwrap();

        let (id, name) = next_pending(&mut b.events).await;
        assert_eq!(name, "one.txt");
        b.engine.decide(&key_ba, id, Decision::Decline).await.unwrap();
        assert!(b.sinks.records().is_empty());

        let (id, name) = next_pending(&mut b.events).await;
        assert_eq!(name, "two.txt");
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();

        match next_finished(&mut a.events).await {
            AppEvent::TransferDeclined { id, direction, .. } => {
                assert_eq!(id, first);
                assert_eq!(direction, Direction::Outgoing);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_finished(&mut a.events).await {
            AppEvent::TransferCompleted { id, .. } => assert_eq!(id, second),
            other => panic!("unexpected {other:?}"),
        }

        let records = b.sinks.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "two.txt");
        assert_eq!(records[0].data, b"accepted!");
        assert_eq!(end_a.binary_sent(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_offer_times_out_without_blocking_other_peers() {
        let mut a = side(small(), MemorySinkProvider::default());
        let mut b = side(small(), MemorySinkProvider::default());
        let mut c = side(small(), MemorySinkProvider::default());
        let (key_ab, _key_ba, _) = link(&a, "A", &b, "B").await;
        let (key_ac, key_ca, _) = link(&a, "A", &c, "C").await;

        let stalled = a.engine.send_file(&key_ab, payload("b1.txt", b"never")).await.unwrap();
        a.engine.send_file(&key_ab, payload("b2.txt", b"later")).await.unwrap();
        let parallel = a.engine.send_file(&key_ac, payload("c.txt", b"right away")).await.unwrap();

        let (id, _) = next_pending(&mut c.events).await;
        c.engine.decide(&key_ca, id, Decision::Accept).await.unwrap();

        match next_finished(&mut a.events).await {
            AppEvent::TransferCompleted { id, key, .. } => {
                assert_eq!(id, parallel);
                assert_eq!(key, key_ac);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_finished(&mut a.events).await {
            AppEvent::TransferFailed { id, error, .. } => {
                assert_eq!(id, stalled);
                assert_eq!(error, TransferError::Timeout { secs: 15 });
            }
            other => panic!("unexpected {other:?}"),
        }

        // B saw the first offer lapse, then the queue moved on to the second.
        let (first, name) = next_pending(&mut b.events).await;
        assert_eq!(name, "b1.txt");
        match next_where(&mut b.events, |e| matches!(e, AppEvent::DecisionExpired { .. })).await {
            AppEvent::DecisionExpired { id, .. } => assert_eq!(id, first),
            _ => unreachable!(),
        }
        let (_, name) = next_pending(&mut b.events).await;
        assert_eq!(name, "b2.txt");
        assert!(b.sinks.records().is_empty());
    }

    #[tokio::test]
    async fn queued_sends_never_interleave() {
        let mut a = side(small(), MemorySinkProvider::default());
        let mut b = side(small(), MemorySinkProvider::default());
        let (key_ab, key_ba, _) = link(&a, "A", &b, "B").await;

        let first: Vec<u8> = (0..97u8).collect();
        let second: Vec<u8> = (100..200u8).rev().collect();
        a.engine.send_file(&key_ab, payload("first", &first)).await.unwrap();
        a.engine.send_file(&key_ab, payload("second", &second)).await.unwrap();

        for expected in ["first", "second"] {
            let (id, name) = next_pending(&mut b.events).await;
            assert_eq!(name, expected);
            b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();
            match next_finished(&mut b.events).await {
                AppEvent::TransferCompleted { file_name, .. } => assert_eq!(file_name, expected),
                other => panic!("unexpected {other:?}"),
            }
        }

        let records = b.sinks.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, first);
        assert_eq!(records[1].data, second);
        for _ in 0..2 {
            assert!(matches!(next_finished(&mut a.events).await, AppEvent::TransferCompleted { .. }));
        }
    }

    #[tokio::test]
    async fn stray_chunk_is_dropped_and_channel_keeps_working() {
        let mut a = side(small(), MemorySinkProvider::default());
        let mut b = side(small(), MemorySinkProvider::default());
        let (key_ab, key_ba, end_a) = link(&a, "A", &b, "B").await;

        end_a.send_binary(Bytes::from_static(b"junk")).await.unwrap();
        a.engine.send_file(&key_ab, payload("ok.txt", b"fine data")).await.unwrap();

        let (id, _) = next_pending(&mut b.events).await;
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();
        assert!(matches!(next_finished(&mut b.events).await, AppEvent::TransferCompleted { .. }));
        assert!(matches!(next_finished(&mut a.events).await, AppEvent::TransferCompleted { .. }));
        assert_eq!(b.sinks.records()[0].data, b"fine data");
    }

    #[tokio::test]
    async fn short_transfer_fails_integrity_and_flags_sink() {
        let mut b = side(small(), MemorySinkProvider::default());
        let (raw, end_b, mut from_b, rx_b) = channel_pair("files");
        let key_ba = ConnectionKey::new("room", "A");
        b.engine.attach(key_ba.clone(), end_b, rx_b).await;

        let offer = ControlMessage::FileOffer {
            file_name: "short.bin".into(),
            file_size: 10,
            mime_type: String::new(),
            total_chunks: 3,
            chunk_size: 4,
            transfer_id: None,
        };
        raw.send_text(offer.encode()).await.unwrap();
        let (id, _) = next_pending(&mut b.events).await;
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();
        assert_eq!(
            from_b.recv().await,
            Some(ChannelMessage::Text(
                ControlMessage::FileAccept { transfer_id: Some(id) }.encode()
            ))
        );

        raw.send_binary(Bytes::from_static(b"abcd")).await.unwrap();
        raw.send_binary(Bytes::from_static(b"efgh")).await.unwrap();
        raw.send_text(ControlMessage::Done { file_name: "short.bin".into() }.encode())
            .await
            .unwrap();

        match next_finished(&mut b.events).await {
            AppEvent::TransferFailed { error, direction, .. } => {
                assert_eq!(direction, Direction::Incoming);
                assert_eq!(error, TransferError::integrity_mismatch(2, 3));
            }
            other => panic!("unexpected {other:?}"),
        }
        let records = b.sinks.records();
        assert!(records[0].aborted);
        assert!(!records[0].closed);
    }

    #[tokio::test]
    async fn inconsistent_offer_is_declined() {
        let mut b = side(small(), MemorySinkProvider::default());
        let (raw, end_b, mut from_b, rx_b) = channel_pair("files");
        b.engine.attach(ConnectionKey::new("room", "A"), end_b, rx_b).await;

        let offer = ControlMessage::FileOffer {
            file_name: "lie.bin".into(),
            file_size: 100,
            mime_type: String::new(),
            total_chunks: 1,
            chunk_size: 4,
            transfer_id: Some(Uuid::new_v4()),
        };
        raw.send_text(offer.encode()).await.unwrap();

        let id = match next_finished(&mut b.events).await {
            AppEvent::TransferFailed { id, error, .. } => {
                assert!(matches!(error, TransferError::InvalidOffer(_)));
                id
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(Some(id), offer.transfer_id());
        assert_eq!(
            from_b.recv().await,
            Some(ChannelMessage::Text(
                ControlMessage::FileDecline { transfer_id: Some(id) }.encode()
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_accept_does_not_answer_the_next_offer() {
        let mut a = side(small(), MemorySinkProvider::default());
        let (end_a, raw, rx_a, mut from_a) = channel_pair("files");
        let key_ab = ConnectionKey::new("room", "B");
        a.engine.attach(key_ab.clone(), end_a.clone(), rx_a).await;

        let first = a.engine.send_file(&key_ab, payload("first.txt", b"late")).await.unwrap();
        let second = a.engine.send_file(&key_ab, payload("second.txt", b"fresh")).await.unwrap();

        let offered = |msg: Option<ChannelMessage>| match msg {
            Some(ChannelMessage::Text(text)) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(msg @ ControlMessage::FileOffer { .. }) => msg.transfer_id(),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(offered(from_a.recv().await), Some(first));
        match next_finished(&mut a.events).await {
            AppEvent::TransferFailed { id, error, .. } => {
                assert_eq!(id, first);
                assert_eq!(error, TransferError::Timeout { secs: 15 });
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(offered(from_a.recv().await), Some(second));

        // The answer to the first offer shows up only now.
        raw.send_text(ControlMessage::FileAccept { transfer_id: Some(first) }.encode())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(end_a.binary_sent(), 0);

        raw.send_text(ControlMessage::FileDecline { transfer_id: Some(second) }.encode())
            .await
            .unwrap();
        match next_finished(&mut a.events).await {
            AppEvent::TransferDeclined { id, .. } => assert_eq!(id, second),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(end_a.binary_sent(), 0);
    }

    #[tokio::test]
    async fn both_sides_share_the_transfer_id() {
        let mut a = side(small(), MemorySinkProvider::default());
        let mut b = side(small(), MemorySinkProvider::default());
        let (key_ab, key_ba, _) = link(&a, "A", &b, "B").await;

        let sent = a.engine.send_file(&key_ab, payload("same.txt", b"id")).await.unwrap();
        let (id, _) = next_pending(&mut b.events).await;
        assert_eq!(id, sent);
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();
        match next_finished(&mut b.events).await {
            AppEvent::TransferCompleted { id, .. } => assert_eq!(id, sent),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_channel_fails_fast() {
        let mut a = side(small(), MemorySinkProvider::default());
        let key = ConnectionKey::new("room", "nobody");

        let err = a.engine.send_file(&key, payload("x", b"x")).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelUnavailable(_)));
        assert!(matches!(
            next_finished(&mut a.events).await,
            AppEvent::TransferFailed { error: TransferError::ChannelUnavailable(_), .. }
        ));
        assert!(a.engine.decide(&key, Uuid::new_v4(), Decision::Accept).await.is_err());
    }

    #[tokio::test]
    async fn chunks_wait_for_buffered_amount_to_drop() {
        let mut a = side(small(), MemorySinkProvider::default());
        let mut b = side(small(), MemorySinkProvider::default());
        let (key_ab, key_ba, end_a) = link(&a, "A", &b, "B").await;

        end_a.set_buffered(2 * 1024 * 1024);
        a.engine.send_file(&key_ab, payload("slow.txt", b"backpressure")).await.unwrap();
        let (id, _) = next_pending(&mut b.events).await;
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(end_a.binary_sent(), 0);

        end_a.set_buffered(0);
        assert!(matches!(next_finished(&mut a.events).await, AppEvent::TransferCompleted { .. }));
        assert_eq!(end_a.binary_sent(), 3);
        assert!(matches!(next_finished(&mut b.events).await, AppEvent::TransferCompleted { .. }));
    }

    #[tokio::test]
    async fn cancelled_sink_request_declines() {
        let mut a = side(small(), MemorySinkProvider::default());
        let sinks = MemorySinkProvider {
            cancel: true,
            ..Default::default()
        };
        let mut b = side(small(), sinks);
        let (key_ab, key_ba, end_a) = link(&a, "A", &b, "B").await;

        a.engine.send_file(&key_ab, payload("nope.txt", b"data")).await.unwrap();
        let (id, _) = next_pending(&mut b.events).await;
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();

        assert!(matches!(
            next_finished(&mut b.events).await,
            AppEvent::TransferDeclined { direction: Direction::Incoming, .. }
        ));
        assert!(matches!(
            next_finished(&mut a.events).await,
            AppEvent::TransferDeclined { direction: Direction::Outgoing, .. }
        ));
        assert_eq!(end_a.binary_sent(), 0);
        assert!(b.sinks.records().is_empty());
    }

    #[tokio::test]
    async fn sink_write_failure_aborts_session() {
        let a = side(small(), MemorySinkProvider::default());
        let sinks = MemorySinkProvider {
            fail_writes: true,
            ..Default::default()
        };
        let mut b = side(small(), sinks);
        let (key_ab, key_ba, _) = link(&a, "A", &b, "B").await;

        a.engine.send_file(&key_ab, payload("disk.bin", b"0123456789")).await.unwrap();
        let (id, _) = next_pending(&mut b.events).await;
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();

        match next_finished(&mut b.events).await {
            AppEvent::TransferFailed { error, .. } => {
                assert!(matches!(error, TransferError::Integrity(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(b.sinks.records()[0].aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sink_still_fails_the_transfer() {
        let a = side(small(), MemorySinkProvider::default());
        let sinks = MemorySinkProvider {
            hang: true,
            ..Default::default()
        };
        let settings = TransferSettings {
            sink_write_timeout: Duration::from_millis(50),
            ..small()
        };
        let mut b = side(settings, sinks);
        let (key_ab, key_ba, _) = link(&a, "A", &b, "B").await;

        a.engine.send_file(&key_ab, payload("stuck.bin", b"0123456789")).await.unwrap();
        let (id, _) = next_pending(&mut b.events).await;
        b.engine.decide(&key_ba, id, Decision::Accept).await.unwrap();

        match next_finished(&mut b.events).await {
            AppEvent::TransferFailed { id: failed, error, .. } => {
                assert_eq!(failed, id);
                assert!(matches!(error, TransferError::Integrity(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        // The receive worker is still alive and tears down cleanly.
        b.engine.detach(&key_ba).await;
        assert!(!b.engine.is_attached(&key_ba).await);
    }

    #[tokio::test]
    async fn detach_fails_in_flight_and_queued_sends() {
        let mut a = side(small(), MemorySinkProvider::default());
        let b = side(small(), MemorySinkProvider::default());
        let (key_ab, _, _) = link(&a, "A", &b, "B").await;

        a.engine.send_file(&key_ab, payload("1", b"one")).await.unwrap();
        a.engine.send_file(&key_ab, payload("2", b"two")).await.unwrap();
        a.engine.detach(&key_ab).await;
        assert!(!a.engine.is_attached(&key_ab).await);

        for _ in 0..2 {
            assert!(matches!(
                next_finished(&mut a.events).await,
                AppEvent::TransferFailed { error: TransferError::ChannelUnavailable(_), .. }
            ));
        }
    }
}
