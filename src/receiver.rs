//! Guest flow: join a session by token, answer the host's offer, then
//! reassemble incoming files and write them out.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::link::{LinkEvent, LinkFactory, LinkState, PeerLink};
use crate::relay::{ClientEvent, RelayConfig, SignalPayload};
use crate::sender::FlowOutcome;
use crate::session::{SessionClient, SessionEvent, SessionHandle};
use crate::signaling::{self, Negotiated, SignalExchange};
use crate::status::{Status, StatusEvent, StatusModel, StatusSnapshot, WAITING_TIMEOUT};
use crate::token::SessionToken;
use crate::transfer::{Assembler, ReceivedFile};

/// Join the session `token_input` identifies and receive files into
/// `output_dir`.
///
/// The token is validated locally before any network call; a malformed
/// token fails fast with `InvalidToken`.
pub async fn join_session(
    relay: &RelayConfig,
    token_input: &str,
    output_dir: &Path,
    factory: &dyn LinkFactory,
    status: &watch::Sender<StatusSnapshot>,
    cancel: &CancellationToken,
) -> Result<FlowOutcome> {
    let token = SessionToken::parse(token_input)?;

    let mut model = StatusModel::new();
    let result = run_guest(
        relay, token, output_dir, factory, status, &mut model, cancel,
    )
    .await;

    if let Err(err) = &result {
        model.apply_publish(StatusEvent::Failed(err.to_string()), status);
    }
    result
}

async fn run_guest(
    relay: &RelayConfig,
    token: SessionToken,
    output_dir: &Path,
    factory: &dyn LinkFactory,
    status: &watch::Sender<StatusSnapshot>,
    model: &mut StatusModel,
    cancel: &CancellationToken,
) -> Result<FlowOutcome> {
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

    let early_frames = match negotiated {
        Ok(Ok(Negotiated::Ready(frames))) => frames,
        Ok(Ok(Negotiated::Cancelled)) => {
            teardown(&session, &mut link, &token, true).await;
            return Ok(FlowOutcome::Cancelled);
        }
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

    model.apply_publish(StatusEvent::PeerConnected, status);

    let receive_result = receive_all(
        &mut link,
        &mut link_events,
        &session,
        &mut session_events,
        &token,
        early_frames,
        output_dir,
        status,
        model,
        cancel,
    )
    .await;

    match receive_result {
        Ok(outcome) => {
            teardown(&session, &mut link, &token, false).await;
            Ok(outcome)
        }
        Err(err) => {
            teardown(&session, &mut link, &token, true).await;
            Err(err)
        }
    }
}

/// Consume channel frames until the host finishes the session.
#[allow(clippy::too_many_arguments)]
async fn receive_all(
    link: &mut PeerLink,
    link_events: &mut mpsc::Receiver<LinkEvent>,
    session: &SessionHandle,
    session_events: &mut mpsc::Receiver<SessionEvent>,
    token: &SessionToken,
    early_frames: Vec<LinkEvent>,
    output_dir: &Path,
    status: &watch::Sender<StatusSnapshot>,
    model: &mut StatusModel,
    cancel: &CancellationToken,
) -> Result<FlowOutcome> {
    let mut assembler = Assembler::new();
    let mut received_any = false;

    for frame in early_frames {
        if let Some(done) =
            handle_frame(frame, &mut assembler, output_dir, status, model).await?
        {
            received_any |= done;
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(FlowOutcome::Cancelled),

            event = link_events.recv() => match event {
                Some(frame @ (LinkEvent::ChannelText(_) | LinkEvent::ChannelBinary(_))) => {
                    if let Some(done) =
                        handle_frame(frame, &mut assembler, output_dir, status, model).await?
                    {
                        received_any |= done;
                    }
                }
                Some(LinkEvent::ChannelClosed) => {
                    if link.on_channel_closed(assembler.in_progress()) == LinkState::Failed {
                        return Err(Error::Channel(
                            "data channel closed mid-transfer".to_string(),
                        ));
                    }
                    // Host is done; confirm completion towards the relay.
                    if received_any {
                        let _ = session
                            .send(ClientEvent::SessionComplete {
                                token: token.as_str().to_string(),
                            })
                            .await;
                    }
                    return Ok(FlowOutcome::Completed);
                }
                Some(LinkEvent::ConnectionStateChanged(state)) => {
                    if link.on_connection_state(state) == LinkState::Failed {
                        if assembler.in_progress() || !received_any {
                            return Err(Error::Channel(format!(
                                "peer connection {state:?} mid-transfer"
                            )));
                        }
                        return Ok(FlowOutcome::Completed);
                    }
                }
                Some(LinkEvent::LocalCandidate(candidate)) => {
                    let _ = signaling::send_signal(
                        session,
                        token,
                        SignalPayload::Ice(candidate),
                    )
                    .await;
                }
                Some(LinkEvent::ChannelOpen) => {}
                None => {
                    return Err(Error::Channel("link event stream ended".to_string()));
                }
            },

            event = session_events.recv() => match event {
                Some(SessionEvent::Signal(SignalPayload::Ice(candidate))) => {
                    link.add_remote_candidate(candidate).await;
                }
                Some(SessionEvent::SessionDestroyed) => {
                    // The session's job may already be done; only an
                    // interrupted file makes this an error.
                    if assembler.in_progress() || !received_any {
                        return Err(Error::Signaling(
                            "session destroyed before transfer finished".to_string(),
                        ));
                    }
                    return Ok(FlowOutcome::Completed);
                }
                Some(SessionEvent::RelayError { message }) => {
                    if model.status() == Status::Completed {
                        log::debug!("ignoring relay error after completion: {message}");
                        continue;
                    }
                    return Err(Error::from_relay_message(&message));
                }
                Some(SessionEvent::Fatal(message)) => {
                    if model.status() == Status::Completed {
                        model.apply_publish(StatusEvent::RelayDisconnected, status);
                        return Ok(FlowOutcome::Completed);
                    }
                    return Err(Error::Signaling(message));
                }
                Some(_) => {}
                None => {
                    if model.status() == Status::Completed {
                        return Ok(FlowOutcome::Completed);
                    }
                    return Err(Error::Signaling("relay connection task ended".to_string()));
                }
            },
        }
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

/// Feed one data frame to the assembler; write out any completed file.
///
/// Returns `Some(true)` when a file was finalized.
async fn handle_frame(
    frame: LinkEvent,
    assembler: &mut Assembler,
    output_dir: &Path,
    status: &watch::Sender<StatusSnapshot>,
    model: &mut StatusModel,
) -> Result<Option<bool>> {
    match frame {
        LinkEvent::ChannelText(text) => {
            if let Some(meta) = assembler.on_text(&text) {
                log::info!("receiving {} ({} bytes)", meta.name, meta.size);
                model.apply_publish(StatusEvent::TransferStarted, status);
                if let Some(file) = assembler.try_finalize_empty()? {
                    write_received(output_dir, file).await?;
                    model.apply_publish(StatusEvent::TransferCompleted, status);
                    return Ok(Some(true));
                }
            }
            Ok(None)
        }
        LinkEvent::ChannelBinary(data) => {
            if let Some(file) = assembler.on_binary(data)? {
                write_received(output_dir, file).await?;
                model.apply_publish(StatusEvent::TransferCompleted, status);
                return Ok(Some(true));
            }
            if let Some((received, size)) = assembler.current_progress() {
                print_progress(received, size);
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

/// Persist a finished file under the output directory.
///
/// Only the file-name component of the sender's name is used, so a
/// malicious meta cannot escape the directory.
async fn write_received(output_dir: &Path, file: ReceivedFile) -> Result<()> {
    let name = Path::new(&file.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let path: PathBuf = output_dir.join(name);

    if path.exists() {
        log::warn!("overwriting existing file {}", path.display());
    }

    tokio::fs::write(&path, &file.bytes)
        .await
        .map_err(|e| Error::Transfer(format!("cannot write {}: {e}", path.display())))?;

    println!(
        "\rreceived {} ({} bytes, {})",
        path.display(),
        file.bytes.len(),
        file.mime
    );
    Ok(())
}

fn print_progress(received: u64, size: u64) {
    if size == 0 {
        return;
    }
    let percent = received as f64 / size as f64 * 100.0;
    print!("\r   received {received}/{size} bytes ({percent:.0}%)");
    let _ = std::io::stdout().flush();
}
