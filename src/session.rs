//! Relay session client: owns the message-bus connection and the token
//! lifecycle.
//!
//! The client runs as one task that exclusively owns the WebSocket. It
//! registers the held token on every (re)connection, forwards decoded
//! relay events to the session driver, and writes queued outbound events
//! to the socket. Reconnection is automatic and unbounded, with capped
//! exponential backoff and jitter; transient drops never surface to the
//! status layer.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::relay::{ClientEvent, DecodedFrame, RelayEvent, Role, SignalPayload};
use crate::token::SessionToken;

/// First reconnection delay; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Reconnection delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay events as seen by the session driver.
#[derive(Debug)]
pub enum SessionEvent {
    Registered { role: Role, expires_at: String },
    /// Both peers hold the token.
    PeerReady,
    Signal(SignalPayload),
    /// The relay reported an application-level error.
    RelayError { message: String },
    /// Terminal: the relay dropped the session.
    SessionDestroyed,
    /// The signaling stream is unusable (malformed non-ice frame, or the
    /// relay became unreachable in a way reconnection cannot fix).
    Fatal(String),
}

/// Handle for talking to the connection task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Queue an outbound event for the relay.
    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        self.commands
            .send(event)
            .await
            .map_err(|_| Error::Signaling("relay connection task is gone".to_string()))
    }

    /// Stop the connection task and close the socket.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct SessionClient;

impl SessionClient {
    /// Spawn the connection task for `token` and return its handle.
    ///
    /// The task registers the token immediately after every successful
    /// connection, so the relay can re-associate this endpoint after a
    /// drop.
    pub fn connect(
        ws_url: String,
        token: SessionToken,
        events: mpsc::Sender<SessionEvent>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel::<ClientEvent>(64);
        let cancel = CancellationToken::new();

        tokio::spawn(connection_task(
            ws_url,
            token,
            events,
            commands_rx,
            cancel.clone(),
        ));

        SessionHandle {
            commands: commands_tx,
            cancel,
        }
    }
}

/// Why one connection attempt ended.
enum ConnectionEnd {
    /// Socket dropped; reconnect.
    Dropped,
    /// Terminal condition; stop the task.
    Finished,
}

async fn connection_task(
    ws_url: String,
    token: SessionToken,
    events: mpsc::Sender<SessionEvent>,
    mut commands: mpsc::Receiver<ClientEvent>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match connect_async(&ws_url).await {
            Ok((ws, _response)) => {
                attempt = 0;
                match run_connection(ws, &token, &events, &mut commands, &cancel).await {
                    ConnectionEnd::Dropped => {
                        log::warn!("relay connection dropped, reconnecting");
                    }
                    ConnectionEnd::Finished => return,
                }
            }
            Err(err) => {
                log::warn!("relay connect failed: {err}");
            }
        }

        attempt += 1;
        let delay = backoff_delay(attempt, &mut rand::thread_rng());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_connection(
    mut ws: WsStream,
    token: &SessionToken,
    events: &mpsc::Sender<SessionEvent>,
    commands: &mut mpsc::Receiver<ClientEvent>,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    // Register (or re-register) the held token first thing.
    let register = ClientEvent::Register {
        token: token.as_str().to_string(),
    };
    if let Err(err) = send_event(&mut ws, &register).await {
        log::warn!("register send failed: {err}");
        return ConnectionEnd::Dropped;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return ConnectionEnd::Finished;
            }

            command = commands.recv() => {
                let Some(command) = command else {
                    // Driver dropped its handle; nothing left to do.
                    let _ = ws.close(None).await;
                    return ConnectionEnd::Finished;
                };
                if let Err(err) = send_event(&mut ws, &command).await {
                    log::warn!("relay send failed: {err}");
                    return ConnectionEnd::Dropped;
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match handle_frame(&text, events).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Stop => return ConnectionEnd::Finished,
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return ConnectionEnd::Dropped,
                    Some(Ok(_)) => {} // Binary, Ping, Pong: not part of the bus
                    Some(Err(err)) => {
                        log::warn!("relay socket error: {err}");
                        return ConnectionEnd::Dropped;
                    }
                }
            }
        }
    }
}

enum FrameOutcome {
    Continue,
    Stop,
}

async fn handle_frame(text: &str, events: &mpsc::Sender<SessionEvent>) -> FrameOutcome {
    let event = match crate::relay::decode_frame(text) {
        Ok(DecodedFrame::Event(event)) => event,
        Ok(DecodedFrame::Skipped) => return FrameOutcome::Continue,
        Err(err) => {
            let _ = events.send(SessionEvent::Fatal(err.to_string())).await;
            return FrameOutcome::Stop;
        }
    };

    let (out, stop) = match event {
        RelayEvent::Registered { role, expires_at } => {
            (SessionEvent::Registered { role, expires_at }, false)
        }
        RelayEvent::Ready => (SessionEvent::PeerReady, false),
        RelayEvent::Signal { payload, .. } => (SessionEvent::Signal(payload), false),
        RelayEvent::ErrorMessage { message } => (SessionEvent::RelayError { message }, false),
        RelayEvent::SessionDestroyed => (SessionEvent::SessionDestroyed, true),
    };

    let _ = events.send(out).await;
    if stop {
        FrameOutcome::Stop
    } else {
        FrameOutcome::Continue
    }
}

async fn send_event(ws: &mut WsStream, event: &ClientEvent) -> Result<()> {
    let json =
        serde_json::to_string(event).map_err(|e| Error::Signaling(format!("encode: {e}")))?;
    ws.send(WsMessage::Text(json))
        .await
        .map_err(|e| Error::Signaling(e.to_string()))
}

/// Exponential backoff with uniform jitter of up to half the base delay.
fn backoff_delay(attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP);
    let jitter = rng.gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut rng = rand::thread_rng();
        let first = backoff_delay(1, &mut rng);
        assert!(first >= BACKOFF_BASE);
        assert!(first <= BACKOFF_BASE + BACKOFF_BASE / 2);

        let late = backoff_delay(30, &mut rng);
        assert!(late >= BACKOFF_CAP);
        assert!(late <= BACKOFF_CAP + BACKOFF_CAP / 2);
    }

    #[test]
    fn test_backoff_is_monotonic_in_lower_bound() {
        let mut rng = rand::thread_rng();
        let mut previous = Duration::ZERO;
        // Attempts below the cap only; at the cap the jitter overlaps.
        for attempt in 1..=6 {
            let floor = (0..32)
                .map(|_| backoff_delay(attempt, &mut rng))
                .min()
                .unwrap();
            assert!(floor >= previous);
            previous = floor;
        }
    }
}
