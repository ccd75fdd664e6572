//! Host flow: mint a session, wait for the guest, negotiate the peer
//! link, then stream the files over the data channel.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::link::{LinkEvent, LinkFactory, LinkState, PeerLink};
use crate::relay::{ClientEvent, RelayConfig, SignalPayload};
use crate::session::{SessionClient, SessionEvent, SessionHandle};
use crate::signaling::{self, Negotiated, SignalExchange};
use crate::status::{StatusEvent, StatusModel, StatusSnapshot, WAITING_TIMEOUT};
use crate::token::SessionToken;
use crate::transfer::{self, OutgoingFile, TransferProgress};

/// How long to wait for the channel to flush its send buffer at the end.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How a finished flow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    Completed,
    Cancelled,
}

/// Host a session for `token` and send `paths` once a guest connects.
///
/// Status transitions are published on `status`; errors are published
/// there too before being returned.
pub async fn host_session(
    relay: &RelayConfig,
    token: SessionToken,
    paths: &[PathBuf],
    chunk_size: usize,
    factory: &dyn LinkFactory,
    status: &watch::Sender<StatusSnapshot>,
    cancel: &CancellationToken,
) -> Result<FlowOutcome> {
    let mut model = StatusModel::new();
    let result = run_host(
        relay, token, paths, chunk_size, factory, status, &mut model, cancel,
    )
    .await;

    if let Err(err) = &result {
        model.apply_publish(StatusEvent::Failed(err.to_string()), status);
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_host(
    relay: &RelayConfig,
    token: SessionToken,
    paths: &[PathBuf],
    chunk_size: usize,
    factory: &dyn LinkFactory,
    status: &watch::Sender<StatusSnapshot>,
    model: &mut StatusModel,
    cancel: &CancellationToken,
) -> Result<FlowOutcome> {
    // Open everything up front so a bad path fails before any signaling.
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(OutgoingFile::open(path, chunk_size).await?);
    }

    let (session_tx, mut session_events) = mpsc::channel(64);
    let session = SessionClient::connect(relay.ws_url.clone(), token.clone(), session_tx);

    let registration = timeout(
        WAITING_TIMEOUT,
        signaling::wait_for_registration(&token, &mut session_events, cancel),
    )
    .await;
    let context = match registration {
        Ok(Ok(Some(context))) => context,
        Ok(Ok(None)) => {
            session.shutdown();
            return Ok(FlowOutcome::Cancelled);
        }
        Ok(Err(err)) => {
            session.shutdown();
            return Err(err);
        }
        Err(_elapsed) => {
            session.shutdown();
            return Err(Error::Timeout(
                "relay never confirmed registration".to_string(),
            ));
        }
    };
    log::info!(
        "registered as {:?}, session expires {}",
        context.role,
        context.expires_at
    );
    model.apply_publish(StatusEvent::Registered, status);

    let mut link = PeerLink::new(factory.create().await?);
    let mut link_events = link.take_events();
    let mut exchange = SignalExchange::new(context.role);

    let negotiated = timeout(
        WAITING_TIMEOUT,
        signaling::drive_negotiation(
            &mut exchange,
            &mut link,
            &mut link_events,
            &session,
            &mut session_events,
            &token,
            cancel,
        ),
    )
    .await;

    let negotiated = match negotiated {
        Ok(Ok(negotiated)) => negotiated,
        Ok(Err(err)) => {
            teardown(&session, &mut link, &token, true).await;
            return Err(err);
        }
        Err(_elapsed) => {
            teardown(&session, &mut link, &token, true).await;
            return Err(Error::Timeout(
                "peer never became ready within the wait window".to_string(),
            ));
        }
    };

    if matches!(negotiated, Negotiated::Cancelled) {
        teardown(&session, &mut link, &token, true).await;
        return Ok(FlowOutcome::Cancelled);
    }

    model.apply_publish(StatusEvent::PeerConnected, status);
    model.apply_publish(StatusEvent::TransferStarted, status);

    let send_result = send_all(
        &mut link,
        &mut link_events,
        &session,
        &mut session_events,
        &token,
        files,
        cancel,
    )
    .await;

    match send_result {
        Ok(FlowOutcome::Completed) => {}
        Ok(FlowOutcome::Cancelled) => {
            teardown(&session, &mut link, &token, true).await;
            return Ok(FlowOutcome::Cancelled);
        }
        Err(err) => {
            teardown(&session, &mut link, &token, true).await;
            return Err(err);
        }
    }

    // Let the channel flush what it buffered before tearing it down.
    drain_channel(&link).await;

    model.apply_publish(StatusEvent::TransferCompleted, status);
    let _ = session
        .send(ClientEvent::SessionComplete {
            token: token.as_str().to_string(),
        })
        .await;

    teardown(&session, &mut link, &token, false).await;
    Ok(FlowOutcome::Completed)
}

/// Run the chunked send while continuing to service session and link
/// events (late candidates, failure reports).
async fn send_all(
    link: &mut PeerLink,
    link_events: &mut mpsc::Receiver<LinkEvent>,
    session: &SessionHandle,
    session_events: &mut mpsc::Receiver<SessionEvent>,
    token: &SessionToken,
    files: Vec<OutgoingFile>,
    cancel: &CancellationToken,
) -> Result<FlowOutcome> {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TransferProgress>();
    let channel = link.channel();
    let send_fut = transfer::send_files(channel.as_ref(), files, &progress_tx);
    tokio::pin!(send_fut);

    loop {
        tokio::select! {
            result = &mut send_fut => {
                result?;
                return Ok(FlowOutcome::Completed);
            }

            _ = cancel.cancelled() => return Ok(FlowOutcome::Cancelled),

            Some(progress) = progress_rx.recv() => {
                print_progress(progress);
            }

            event = link_events.recv() => match event {
                Some(LinkEvent::ChannelClosed) => {
                    link.on_channel_closed(true);
                    return Err(Error::Channel(
                        "data channel closed mid-transfer".to_string(),
                    ));
                }
                Some(LinkEvent::ConnectionStateChanged(state)) => {
                    if link.on_connection_state(state) == LinkState::Failed {
                        return Err(Error::Channel(format!(
                            "peer connection {state:?} mid-transfer"
                        )));
                    }
                }
                Some(LinkEvent::LocalCandidate(candidate)) => {
                    // Gathering can continue past data-ready.
                    let _ = signaling::send_signal(
                        session,
                        token,
                        SignalPayload::Ice(candidate),
                    )
                    .await;
                }
                Some(_) => {}
                None => {
                    return Err(Error::Channel("link event stream ended".to_string()));
                }
            },

            event = session_events.recv() => match event {
                Some(SessionEvent::Signal(SignalPayload::Ice(candidate))) => {
                    link.add_remote_candidate(candidate).await;
                }
                Some(SessionEvent::SessionDestroyed) => {
                    return Err(Error::Signaling(
                        "session destroyed mid-transfer".to_string(),
                    ));
                }
                Some(SessionEvent::RelayError { message }) => {
                    return Err(Error::from_relay_message(&message));
                }
                Some(SessionEvent::Fatal(message)) => {
                    return Err(Error::Signaling(message));
                }
                Some(_) => {}
                None => {
                    return Err(Error::Signaling("relay connection task ended".to_string()));
                }
            },
        }
    }
}

/// Poll until the channel's buffer is empty so close() cannot drop tail
/// chunks still queued locally.
async fn drain_channel(link: &PeerLink) {
    let channel = link.channel();
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while channel.buffered_amount().await > 0 {
        if tokio::time::Instant::now() >= deadline {
            log::warn!("send buffer not drained before teardown");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn teardown(
    session: &SessionHandle,
    link: &mut PeerLink,
    token: &SessionToken,
    cancel_session: bool,
) {
    if cancel_session {
        let _ = session
            .send(ClientEvent::SessionCancel {
                token: token.as_str().to_string(),
            })
            .await;
    }
    link.close().await;
    session.shutdown();
}

fn print_progress(progress: TransferProgress) {
    if progress.bytes_total == 0 {
        return;
    }
    let percent = progress.bytes_done as f64 / progress.bytes_total as f64 * 100.0;
    print!(
        "\r   sent {}/{} bytes ({percent:.0}%)",
        progress.bytes_done, progress.bytes_total
    );
    let _ = std::io::stdout().flush();
    if progress.bytes_done >= progress.bytes_total {
        println!();
    }
}
