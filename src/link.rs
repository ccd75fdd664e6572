//! Peer link: one connection primitive plus one data channel per session.
//!
//! The link drives both capabilities through a single state machine and
//! exposes one logical "channel ready" signal to the transfer layer. The
//! capabilities themselves are traits: the production implementation wraps
//! a WebRTC peer connection, tests plug in in-memory fakes.
//!
//! # Invariants
//!
//! - The ICE candidate queue is non-empty only while the remote
//!   description is unset, and is flushed exactly once, in arrival order.
//! - `DataReady` requires the channel to be open *and* the connection to
//!   report connected; the two may settle in either order.
//! - State is monotonic except for explicit reset, which always builds a
//!   brand-new link. Capabilities are never reused across sessions.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::relay::{IceCandidate, SessionDescription};

/// Connection-level negotiation capability.
///
/// NAT traversal and congestion control live behind this boundary; the
/// link only drives descriptions and candidates through it.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Ordered, reliable byte/text channel capability.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn send_binary(&self, data: Bytes) -> Result<()>;
    /// Bytes queued locally but not yet handed to the transport.
    async fn buffered_amount(&self) -> usize;
    /// Resolves once the buffered amount has dropped below the channel's
    /// configured low-water threshold.
    async fn wait_buffered_low(&self);
    async fn close(&self) -> Result<()>;
}

/// Coarse connection transport state as reported by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by the capabilities, consumed by the session driver.
#[derive(Debug)]
pub enum LinkEvent {
    /// A locally discovered network candidate to forward to the peer.
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(TransportState),
    ChannelOpen,
    ChannelClosed,
    ChannelText(String),
    ChannelBinary(Bytes),
}

/// A freshly constructed connection/channel pair plus its event stream.
pub struct LinkParts {
    pub connection: Box<dyn Connection>,
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Constructs fresh capabilities for each negotiation attempt.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(&self) -> Result<LinkParts>;
}

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Discovering,
    Negotiating,
    DataReady,
    Failed,
    Closed,
}

pub struct PeerLink {
    connection: Box<dyn Connection>,
    channel: Arc<dyn DataChannel>,
    events: Option<mpsc::Receiver<LinkEvent>>,
    state: LinkState,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    channel_open: bool,
    connection_connected: bool,
}

impl PeerLink {
    pub fn new(parts: LinkParts) -> Self {
        Self {
            connection: parts.connection,
            channel: parts.channel,
            events: Some(parts.events),
            state: LinkState::Discovering,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            channel_open: false,
            connection_connected: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The transfer layer borrows the channel for the session's lifetime.
    pub fn channel(&self) -> Arc<dyn DataChannel> {
        self.channel.clone()
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Take the capability event stream for the session driver loop.
    pub fn take_events(&mut self) -> mpsc::Receiver<LinkEvent> {
        self.events.take().expect("link events already taken")
    }

    /// Token validated and signaling wiring attached.
    pub fn begin_negotiation(&mut self) {
        if self.state == LinkState::Discovering {
            self.state = LinkState::Negotiating;
        }
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.connection.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.connection.create_answer().await
    }

    pub async fn apply_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.connection.set_local_description(desc).await
    }

    /// Apply the remote description, then flush every buffered candidate
    /// in arrival order. A candidate that fails to apply is logged and
    /// skipped; a failing description is fatal.
    pub async fn apply_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.connection.set_remote_description(desc).await?;
        self.remote_description_set = true;

        for candidate in self.pending_candidates.drain(..) {
            if let Err(err) = self.connection.add_ice_candidate(candidate).await {
                log::warn!("discarding buffered ice candidate: {err}");
            }
        }
        Ok(())
    }

    /// Apply a remote candidate now, or buffer it until the remote
    /// description exists.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_description_set {
            if let Err(err) = self.connection.add_ice_candidate(candidate).await {
                log::warn!("discarding ice candidate: {err}");
            }
        } else {
            self.pending_candidates.push(candidate);
        }
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Number of candidates buffered while the remote description is
    /// still unset.
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Record that the data channel reported open.
    pub fn on_channel_open(&mut self) -> LinkState {
        self.channel_open = true;
        self.maybe_data_ready()
    }

    /// Record a connection state report from the primitive.
    pub fn on_connection_state(&mut self, state: TransportState) -> LinkState {
        match state {
            TransportState::Connected => {
                self.connection_connected = true;
                self.maybe_data_ready()
            }
            TransportState::Failed | TransportState::Disconnected => self.fail(),
            _ => self.state,
        }
    }

    /// Record a channel close. Unexpected only while a transfer is in
    /// progress; after completion it is part of normal teardown.
    pub fn on_channel_closed(&mut self, transfer_in_progress: bool) -> LinkState {
        self.channel_open = false;
        if transfer_in_progress {
            self.fail()
        } else {
            self.state
        }
    }

    fn maybe_data_ready(&mut self) -> LinkState {
        if self.state == LinkState::Negotiating && self.channel_open && self.connection_connected {
            self.state = LinkState::DataReady;
        }
        self.state
    }

    fn fail(&mut self) -> LinkState {
        if self.state != LinkState::Closed {
            self.state = LinkState::Failed;
        }
        self.state
    }

    /// Tear the link down: close channel then connection, drop the event
    /// stream so no further capability callback can reach this link.
    pub async fn close(&mut self) {
        self.state = LinkState::Closed;
        self.events = None;
        if let Err(err) = self.channel.close().await {
            log::debug!("channel close during teardown: {err}");
        }
        if let Err(err) = self.connection.close().await {
            log::debug!("connection close during teardown: {err}");
        }
    }
}
