//! Offer/answer/ICE exchange between the peers, relayed by the session bus.
//!
//! The exchange is a pure negotiation step: it consumes one inbound
//! signal, drives the peer link, and produces at most one outbound signal
//! (an offer on `ready` for the host, an answer per inbound offer for the
//! guest). The caller forwards outbound payloads to the relay.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::SessionContext;
use crate::error::{Error, Result};
use crate::link::{LinkEvent, LinkState, PeerLink};
use crate::relay::{ClientEvent, IceCandidate, Role, SignalPayload};
use crate::session::{SessionEvent, SessionHandle};
use crate::token::SessionToken;

pub struct SignalExchange {
    role: Role,
}

impl SignalExchange {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// Both peers are registered; the host opens negotiation.
    pub async fn on_peer_ready(&mut self, link: &mut PeerLink) -> Result<Option<SignalPayload>> {
        link.begin_negotiation();
        if self.role != Role::Host {
            return Ok(None);
        }

        let offer = link
            .create_offer()
            .await
            .map_err(|e| Error::Negotiation(format!("cannot create offer: {e}")))?;
        link.apply_local_description(offer.clone())
            .await
            .map_err(|e| Error::Negotiation(format!("cannot apply local offer: {e}")))?;
        Ok(Some(SignalPayload::Offer(offer)))
    }

    /// Handle one inbound signal from the peer.
    pub async fn on_signal(
        &mut self,
        link: &mut PeerLink,
        payload: SignalPayload,
    ) -> Result<Option<SignalPayload>> {
        match payload {
            SignalPayload::Offer(offer) => {
                if self.role == Role::Host {
                    log::warn!("ignoring offer sent to the host side");
                    return Ok(None);
                }
                link.begin_negotiation();
                link.apply_remote_description(offer)
                    .await
                    .map_err(|e| Error::Negotiation(format!("cannot apply offer: {e}")))?;

                let answer = link
                    .create_answer()
                    .await
                    .map_err(|e| Error::Negotiation(format!("cannot create answer: {e}")))?;
                link.apply_local_description(answer.clone())
                    .await
                    .map_err(|e| Error::Negotiation(format!("cannot apply local answer: {e}")))?;
                Ok(Some(SignalPayload::Answer(answer)))
            }
            SignalPayload::Answer(answer) => {
                if self.role != Role::Host {
                    log::warn!("ignoring answer sent to the guest side");
                    return Ok(None);
                }
                link.apply_remote_description(answer)
                    .await
                    .map_err(|e| Error::Negotiation(format!("cannot apply answer: {e}")))?;
                Ok(None)
            }
            SignalPayload::Ice(candidate) => {
                // Applied now or buffered until the remote description
                // lands; either way a bad candidate never aborts the
                // session.
                link.add_remote_candidate(candidate).await;
                Ok(None)
            }
        }
    }

    /// Every locally discovered candidate goes to the peer immediately,
    /// independent of negotiation phase.
    pub fn on_local_candidate(&self, candidate: IceCandidate) -> SignalPayload {
        SignalPayload::Ice(candidate)
    }
}

/// Forward one signaling payload to the peer via the relay.
pub async fn send_signal(
    session: &SessionHandle,
    token: &SessionToken,
    payload: SignalPayload,
) -> Result<()> {
    session
        .send(ClientEvent::Signal {
            token: token.as_str().to_string(),
            payload,
        })
        .await
}

/// Block until the relay confirms registration for the held token.
///
/// An `error-message` arriving instead of the confirmation means the
/// registration was rejected (typically a fully occupied token).
pub async fn wait_for_registration(
    token: &SessionToken,
    events: &mut mpsc::Receiver<SessionEvent>,
    cancel: &CancellationToken,
) -> Result<Option<SessionContext>> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            event = events.recv() => event,
        };

        match event {
            Some(SessionEvent::Registered { role, expires_at }) => {
                return Ok(Some(SessionContext::new(token.clone(), role, expires_at)));
            }
            Some(SessionEvent::RelayError { message }) => {
                return Err(Error::from_relay_message(&message));
            }
            Some(SessionEvent::SessionDestroyed) => {
                return Err(Error::Signaling("session destroyed by relay".to_string()));
            }
            Some(SessionEvent::Fatal(message)) => return Err(Error::Signaling(message)),
            Some(other) => {
                log::debug!("ignoring {other:?} before registration");
            }
            None => {
                return Err(Error::Signaling(
                    "relay connection task ended".to_string(),
                ));
            }
        }
    }
}

/// Outcome of the negotiation phase.
pub enum Negotiated {
    /// The link is data-ready. Any data frames that raced ahead of the
    /// final state report are returned for the transfer layer.
    Ready(Vec<LinkEvent>),
    Cancelled,
}

/// Drive signaling until the link reports data-ready.
///
/// This is the single consuming loop for the negotiation window: session
/// events and capability events interleave only at its awaits, so no
/// handler ever races another.
pub async fn drive_negotiation(
    exchange: &mut SignalExchange,
    link: &mut PeerLink,
    link_events: &mut mpsc::Receiver<LinkEvent>,
    session: &SessionHandle,
    session_events: &mut mpsc::Receiver<SessionEvent>,
    token: &SessionToken,
    cancel: &CancellationToken,
) -> Result<Negotiated> {
    let mut early_frames = Vec::new();

    loop {
        if link.state() == LinkState::DataReady {
            return Ok(Negotiated::Ready(early_frames));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(Negotiated::Cancelled),

            event = session_events.recv() => match event {
                Some(SessionEvent::PeerReady) => {
                    if let Some(payload) = exchange.on_peer_ready(link).await? {
                        send_signal(session, token, payload).await?;
                    }
                }
                Some(SessionEvent::Signal(payload)) => {
                    if let Some(payload) = exchange.on_signal(link, payload).await? {
                        send_signal(session, token, payload).await?;
                    }
                }
                Some(SessionEvent::Registered { .. }) => {
                    // Re-registration after a relay reconnect.
                    log::debug!("re-registered with relay during negotiation");
                }
                Some(SessionEvent::RelayError { message }) => {
                    return Err(Error::from_relay_message(&message));
                }
                Some(SessionEvent::SessionDestroyed) => {
                    return Err(Error::Signaling("session destroyed by relay".to_string()));
                }
                Some(SessionEvent::Fatal(message)) => {
                    return Err(Error::Signaling(message));
                }
                None => {
                    return Err(Error::Signaling("relay connection task ended".to_string()));
                }
            },

            event = link_events.recv() => match event {
                Some(LinkEvent::LocalCandidate(candidate)) => {
                    let payload = exchange.on_local_candidate(candidate);
                    send_signal(session, token, payload).await?;
                }
                Some(LinkEvent::ConnectionStateChanged(state)) => {
                    if link.on_connection_state(state) == LinkState::Failed {
                        return Err(Error::Negotiation(format!(
                            "peer connection {state:?} before data channel became ready"
                        )));
                    }
                }
                Some(LinkEvent::ChannelOpen) => {
                    link.on_channel_open();
                }
                Some(LinkEvent::ChannelClosed) => {
                    link.on_channel_closed(false);
                }
                Some(frame @ (LinkEvent::ChannelText(_) | LinkEvent::ChannelBinary(_))) => {
                    // Data can outrun the connected report; hold it for
                    // the transfer layer.
                    early_frames.push(frame);
                }
                None => {
                    return Err(Error::Channel("link event stream ended".to_string()));
                }
            },
        }
    }
}
