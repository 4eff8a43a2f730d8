//! webrtc-rs implementation of the negotiation capability.
//!
//! Trickle ICE: local candidates are surfaced as they are gathered instead of
//! waiting for gathering to complete. One ordered, reliable data channel
//! carries the transfer protocol.

use super::capability::{
    ChannelMessage, DataChannel, Negotiator, NegotiatorEvent, NegotiatorFactory, Role,
};
use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::relay::protocol::{IceCandidate, SdpKind, SessionDescription};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

// ── Conversions ──────────────────────────────────────────────────────────────

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(anyhow!("unsupported sdp type {other}")),
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub struct RtcFactory {
    ice_servers: Vec<String>,
}

impl RtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect()
    }

    fn create_webrtc_api() -> Result<webrtc::api::API> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        Ok(APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build())
    }
}

#[async_trait]
impl NegotiatorFactory for RtcFactory {
    async fn create(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Result<Arc<dyn Negotiator>> {
        let api = Self::create_webrtc_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers(),
                ..Default::default()
            })
            .await?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(event = "ice_gathering_complete", "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(NegotiatorEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => {
                        warn!(event = "ice_candidate_encode_failed", error = %e, "Dropping local candidate");
                    }
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", %role, "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", %role, "WebRTC connection failed");
                        let _ = tx.send(NegotiatorEvent::Failed("peer connection failed".into()));
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(
                            event = "webrtc_disconnected",
                            %role,
                            "WebRTC transient disconnect (ICE may recover)"
                        );
                    }
                    _ => {}
                }
            })
        }));

        match role {
            Role::Initiator => {
                // Ordered + fully reliable (SCTP default, no partial reliability).
                let dc = pc
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                attach_channel_handlers(dc, events);
            }
            Role::Responder => {
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let events = events.clone();
                    Box::pin(async move {
                        if dc.label() != DATA_CHANNEL_LABEL {
                            warn!(event = "unexpected_data_channel", label = %dc.label(), "Ignoring data channel");
                            return;
                        }
                        attach_channel_handlers(dc, events);
                    })
                }));
            }
        }

        Ok(Arc::new(RtcNegotiator { pc }))
    }
}

fn attach_channel_handlers(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<NegotiatorEvent>) {
    let channel: Arc<dyn DataChannel> = Arc::new(RtcChannel { dc: dc.clone() });

    let tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            debug!(event = "dc_open", label = %channel.label(), "Data channel open");
            let _ = tx.send(NegotiatorEvent::ChannelOpen(channel));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let message = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelMessage::Text(text),
                    Err(e) => {
                        warn!(event = "dc_invalid_utf8", error = %e, "Dropping non-UTF-8 text message");
                        return;
                    }
                }
            } else {
                ChannelMessage::Binary(msg.data)
            };
            let _ = tx.send(NegotiatorEvent::ChannelMessage(message));
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(NegotiatorEvent::ChannelClosed);
        })
    }));

    dc.on_error(Box::new(move |e| {
        Box::pin(async move {
            warn!(event = "dc_error", error = %e, "Data channel error");
        })
    }));
}

// ── Negotiator / channel ─────────────────────────────────────────────────────

struct RtcNegotiator {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
