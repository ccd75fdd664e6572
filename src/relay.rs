//! Relay wire protocol: session-mint HTTP call and the message-bus events.
//!
//! Every bus event is one JSON text frame over the WebSocket, tagged by
//! `event`. Signaling payloads are validated here, once, at the boundary;
//! the rest of the crate only ever sees the typed forms.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A peer's position in the session, assigned by the relay on
/// registration and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

/// A session description produced by one side of the negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// A discovered network candidate proposed for the direct connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// A negotiation payload in transit between the peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
}

/// Events sent from a peer to the relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    Register {
        token: String,
    },
    Signal {
        token: String,
        #[serde(flatten)]
        payload: SignalPayload,
    },
    SessionCancel {
        token: String,
    },
    SessionComplete {
        token: String,
    },
}

/// Events sent from the relay to a peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayEvent {
    Registered {
        role: Role,
        #[serde(rename = "expiresAt")]
        expires_at: String,
    },
    /// Both peers hold the token; negotiation may begin.
    Ready,
    Signal {
        token: String,
        #[serde(flatten)]
        payload: SignalPayload,
    },
    ErrorMessage {
        message: String,
    },
    /// Terminal: the relay has dropped the session.
    SessionDestroyed,
}

/// Bus events this client understands; anything else is skipped, not
/// fatal, so the relay can grow its protocol.
const KNOWN_EVENTS: &[&str] = &[
    "registered",
    "ready",
    "signal",
    "error-message",
    "session-destroyed",
];

/// Outcome of decoding one inbound relay frame.
///
/// A frame that fails to decode but self-identifies as an `ice` signal is
/// skipped rather than failing the session: one bad candidate must not
/// abort negotiation. Unknown event names are skipped too. A malformed
/// frame for a known event is fatal.
pub enum DecodedFrame {
    Event(RelayEvent),
    Skipped,
}

pub fn decode_frame(text: &str) -> Result<DecodedFrame> {
    match serde_json::from_str::<RelayEvent>(text) {
        Ok(event) => Ok(DecodedFrame::Event(event)),
        Err(err) => {
            let value = serde_json::from_str::<serde_json::Value>(text).ok();
            let signal_kind = value
                .as_ref()
                .and_then(|v| v.get("type"))
                .and_then(|t| t.as_str());
            if signal_kind == Some("ice") {
                log::warn!("skipping malformed ice signal: {err}");
                return Ok(DecodedFrame::Skipped);
            }

            let event_name = value
                .as_ref()
                .and_then(|v| v.get("event"))
                .and_then(|e| e.as_str());
            if let Some(name) = event_name {
                if !KNOWN_EVENTS.contains(&name) {
                    log::debug!("skipping unknown relay event {name:?}");
                    return Ok(DecodedFrame::Skipped);
                }
            }

            Err(Error::Signaling(format!("malformed relay frame: {err}")))
        }
    }
}

// ============================================================================
// Session minting (HTTP)
// ============================================================================

/// Relay endpoints for one deployment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL for the HTTP API, e.g. `https://relay.example.com`.
    pub http_base: String,
    /// WebSocket URL for the message bus, e.g. `wss://relay.example.com/ws`.
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionResponse {
    pub token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
}

/// Mint a new session token from the relay.
pub async fn create_session(config: &RelayConfig) -> Result<CreateSessionResponse> {
    let url = format!("{}/api/create-session", config.http_base.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .map_err(|e| Error::RelayUnavailable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(Error::RelayUnavailable(format!(
            "create-session returned {}",
            response.status()
        )));
    }

    response
        .json::<CreateSessionResponse>()
        .await
        .map_err(|e| Error::RelayUnavailable(format!("malformed create-session reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_shape() {
        let json = serde_json::to_value(ClientEvent::Register {
            token: "1a2b3c4d5e6f7890".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "register");
        assert_eq!(json["token"], "1a2b3c4d5e6f7890");
    }

    #[test]
    fn test_signal_wire_shape() {
        let json = serde_json::to_value(ClientEvent::Signal {
            token: "1a2b3c4d5e6f7890".into(),
            payload: SignalPayload::Offer(SessionDescription {
                kind: "offer".into(),
                sdp: "v=0...".into(),
            }),
        })
        .unwrap();
        assert_eq!(json["event"], "signal");
        assert_eq!(json["type"], "offer");
        assert_eq!(json["data"]["sdp"], "v=0...");
    }

    #[test]
    fn test_ice_signal_roundtrip() {
        let text = r#"{"event":"signal","token":"1a2b3c4d5e6f7890","type":"ice","data":{"candidate":"candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        match decode_frame(text).unwrap() {
            DecodedFrame::Event(RelayEvent::Signal {
                payload: SignalPayload::Ice(c),
                ..
            }) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            _ => panic!("expected ice signal"),
        }
    }

    #[test]
    fn test_registered_event_parses() {
        let text = r#"{"event":"registered","role":"guest","expiresAt":"2026-08-07T12:00:00Z"}"#;
        match decode_frame(text).unwrap() {
            DecodedFrame::Event(RelayEvent::Registered { role, expires_at }) => {
                assert_eq!(role, Role::Guest);
                assert_eq!(expires_at, "2026-08-07T12:00:00Z");
            }
            _ => panic!("expected registered"),
        }
    }

    #[test]
    fn test_kebab_case_events_parse() {
        assert!(matches!(
            decode_frame(r#"{"event":"session-destroyed"}"#).unwrap(),
            DecodedFrame::Event(RelayEvent::SessionDestroyed)
        ));
        assert!(matches!(
            decode_frame(r#"{"event":"error-message","message":"boom"}"#).unwrap(),
            DecodedFrame::Event(RelayEvent::ErrorMessage { .. })
        ));
    }

    #[test]
    fn test_malformed_ice_is_skipped() {
        // `data` is missing its required `candidate` field.
        let text = r#"{"event":"signal","token":"1a2b3c4d5e6f7890","type":"ice","data":{"bogus":true}}"#;
        assert!(matches!(decode_frame(text).unwrap(), DecodedFrame::Skipped));
    }

    #[test]
    fn test_lifecycle_events_wire_shape() {
        let cancel = serde_json::to_value(ClientEvent::SessionCancel {
            token: "1a2b3c4d5e6f7890".into(),
        })
        .unwrap();
        assert_eq!(cancel["event"], "session-cancel");

        let complete = serde_json::to_value(ClientEvent::SessionComplete {
            token: "1a2b3c4d5e6f7890".into(),
        })
        .unwrap();
        assert_eq!(complete["event"], "session-complete");
    }

    #[test]
    fn test_unknown_event_is_skipped() {
        let text = r#"{"event":"heartbeat"}"#;
        assert!(matches!(decode_frame(text).unwrap(), DecodedFrame::Skipped));
    }

    #[test]
    fn test_malformed_offer_is_fatal() {
        let text = r#"{"event":"signal","token":"1a2b3c4d5e6f7890","type":"offer","data":{"bogus":true}}"#;
        assert!(decode_frame(text).is_err());
    }
}
