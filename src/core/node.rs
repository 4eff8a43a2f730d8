use crate::core::config::NodeSettings;
use crate::core::connection::capability::NegotiatorFactory;
use crate::core::connection::manager::{
    ConnectionManager, ConnectionSummary, ManagerHandle, NegotiationTimeouts,
};
use crate::core::connection::ConnectionKey;
use crate::core::error::TransferError;
use crate::core::events::AppEvent;
use crate::core::relay::client;
use crate::core::relay::protocol::PeerId;
use crate::core::transfer::sink::SinkProvider;
use crate::core::transfer::source::FileSource;
use crate::core::transfer::{Decision, TransferEngine};
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// One participant: a relay session, the connection manager driving its
/// peer links, and the transfer engine running over their channels.
#[derive(Clone)]
pub struct PeerNode {
    peer_id: PeerId,
    manager: ManagerHandle,
    engine: TransferEngine,
    sos: SignalOfStop,
}

impl PeerNode {
    pub async fn start(
        settings: &NodeSettings,
        factory: Arc<dyn NegotiatorFactory>,
        sinks: Arc<dyn SinkProvider>,
        app_tx: Option<mpsc::UnboundedSender<AppEvent>>,
        sos: SignalOfStop,
    ) -> Result<Self> {
        let sos = sos.child();
        let relay = client::connect(&settings.relay_url, sos.clone()).await?;
        info!(
            event = "node_started",
            peer_id = %relay.peer_id,
            relay = %settings.relay_url,
            "Connected to signaling relay"
        );

        let engine = TransferEngine::new(settings.transfer.clone(), sinks, app_tx.clone());
        let manager = ConnectionManager::spawn(
            relay.peer_id.clone(),
            relay.handle,
            relay.events,
            factory,
            engine.clone(),
            app_tx,
            NegotiationTimeouts {
                step: settings.negotiation_step_timeout,
                establish: settings.connection_timeout,
                join: settings.join_timeout,
            },
            sos.clone(),
        );

        Ok(Self {
            peer_id: relay.peer_id,
            manager,
            engine,
            sos,
        })
    }

    /// Relay-assigned id of this node.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn join(&self, room: &str) -> Result<()> {
        self.manager.join(room)
    }

    pub fn leave(&self, room: &str) -> Result<()> {
        self.manager.leave(room)
    }

    pub async fn peers(&self, room: &str) -> Result<Vec<PeerId>> {
        self.manager.peers(room).await
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionSummary>> {
        self.manager.connections().await
    }

    pub async fn send_file(&self, key: &ConnectionKey, source: FileSource) -> Result<Uuid, TransferError> {
        self.engine.send_file(key, source).await
    }

    pub async fn decide(&self, key: &ConnectionKey, id: Uuid, decision: Decision) -> Result<(), TransferError> {
        self.engine.decide(key, id, decision).await
    }

    /// Leave every room and stop all tasks of this node.
    pub fn shutdown(&self) {
        self.sos.cancel();
    }
}
