//! WebRTC-backed implementation of the link capabilities.
//!
//! Wraps one `RTCPeerConnection` plus one pre-negotiated data channel and
//! bridges their callbacks onto the link's event stream. NAT traversal
//! stays inside the `webrtc` crate; only STUN-discovered candidates are
//! used.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};
use crate::link::{Connection, DataChannel, LinkEvent, LinkFactory, LinkParts, TransportState};
use crate::relay::{IceCandidate, SessionDescription};
use crate::transfer::low_water_mark;

/// Google STUN server for NAT traversal
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label for the single transfer channel.
const CHANNEL_LABEL: &str = "file-transfer";

/// Pre-negotiated channel id so both roles own the channel capability
/// from construction instead of waiting for an `on_data_channel` hand-off.
const CHANNEL_ID: u16 = 0;

/// Builds a fresh peer connection and data channel per negotiation
/// attempt. Nothing is ever reused across attempts.
pub struct WebRtcLinkFactory {
    chunk_size: usize,
}

impl WebRtcLinkFactory {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create(&self) -> Result<LinkParts> {
        let ice_servers = vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_owned()],
            ..Default::default()
        }];

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Channel(format!("codec registration failed: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::Channel(format!("interceptor registration failed: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| Error::Channel(format!("peer connection failed: {e}")))?,
        );

        let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(256);

        wire_connection_handlers(&peer_connection, &event_tx);

        let data_channel = peer_connection
            .create_data_channel(
                CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    negotiated: Some(CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::Channel(format!("data channel failed: {e}")))?;

        let drained = Arc::new(Notify::new());
        wire_channel_handlers(&data_channel, &event_tx, &drained).await;

        data_channel
            .set_buffered_amount_low_threshold(low_water_mark(self.chunk_size))
            .await;

        Ok(LinkParts {
            connection: Box::new(WebRtcConnection {
                inner: peer_connection,
            }),
            channel: Arc::new(WebRtcChannel {
                inner: data_channel,
                drained,
            }),
            events: event_rx,
        })
    }
}

fn wire_connection_handlers(
    peer_connection: &Arc<RTCPeerConnection>,
    event_tx: &mpsc::Sender<LinkEvent>,
) {
    // Locally discovered candidates go straight to the event stream; the
    // exchange forwards them to the peer regardless of phase.
    let tx = event_tx.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return; // end of gathering
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx
                        .send(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }))
                        .await;
                }
                Err(err) => {
                    log::warn!("cannot serialize local candidate: {err}");
                }
            }
        })
    }));

    let tx = event_tx.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let mapped = match state {
                RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = tx.send(LinkEvent::ConnectionStateChanged(mapped)).await;
            }
        })
    }));

    // ICE-level failure can precede the aggregate state flip; report it
    // as soon as the transport sees it.
    let tx = event_tx.clone();
    peer_connection.on_ice_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let mapped = match state {
                RTCIceConnectionState::Failed => Some(TransportState::Failed),
                RTCIceConnectionState::Disconnected => Some(TransportState::Disconnected),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = tx.send(LinkEvent::ConnectionStateChanged(mapped)).await;
            }
        })
    }));
}

async fn wire_channel_handlers(
    data_channel: &Arc<RTCDataChannel>,
    event_tx: &mpsc::Sender<LinkEvent>,
    drained: &Arc<Notify>,
) {
    let tx = event_tx.clone();
    data_channel.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(LinkEvent::ChannelOpen).await;
        })
    }));

    let tx = event_tx.clone();
    data_channel.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(LinkEvent::ChannelClosed).await;
        })
    }));

    let tx = event_tx.clone();
    data_channel.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = if message.is_string {
                LinkEvent::ChannelText(String::from_utf8_lossy(&message.data).into_owned())
            } else {
                LinkEvent::ChannelBinary(message.data)
            };
            let _ = tx.send(event).await;
        })
    }));

    data_channel.on_error(Box::new(move |err| {
        Box::pin(async move {
            log::error!("data channel error: {err}");
        })
    }));

    let notify = drained.clone();
    data_channel
        .on_buffered_amount_low(Box::new(move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notify_one();
            })
        }))
        .await;
}

struct WebRtcConnection {
    inner: Arc<RTCPeerConnection>,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match desc.kind.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp),
        "answer" => RTCSessionDescription::answer(desc.sdp),
        other => {
            return Err(Error::Negotiation(format!(
                "unsupported description type: {other}"
            )))
        }
    };
    result.map_err(|e| Error::Negotiation(format!("bad session description: {e}")))
}

fn from_rtc_description(desc: &RTCSessionDescription) -> SessionDescription {
    SessionDescription {
        kind: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    }
}

#[async_trait]
impl Connection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;
        Ok(from_rtc_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .inner
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;
        Ok(from_rtc_description(&answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.inner
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.inner
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.inner
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }
}

struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
    drained: Arc<Notify>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn wait_buffered_low(&self) {
        self.drained.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }
}
