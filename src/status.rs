//! Session status aggregation for the presentation layer.

use std::time::Duration;

/// Force `waiting` to `error` once the peer has taken this long to show up.
pub const WAITING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The one externally visible state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Waiting,
    Connected,
    Transferring,
    Completed,
    Error,
}

/// Events fed into the model by the session, signaling, link and transfer
/// layers.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Registered,
    PeerConnected,
    TransferStarted,
    TransferCompleted,
    RelayDisconnected,
    Failed(String),
    Reset,
}

/// Status plus the optional human-readable error message, as published to
/// the presentation layer.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: Status,
    pub message: Option<String>,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        Self {
            status: Status::Idle,
            message: None,
        }
    }
}

/// Pure last-event-wins aggregator with a single exception: a relay
/// disconnect after completion is not an error — the session's job is
/// already done.
#[derive(Debug)]
pub struct StatusModel {
    status: Status,
    message: Option<String>,
}

impl Default for StatusModel {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusModel {
    pub fn new() -> Self {
        Self {
            status: Status::Idle,
            message: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Apply one event, returning the (possibly unchanged) active status.
    pub fn apply(&mut self, event: StatusEvent) -> Status {
        match event {
            StatusEvent::Registered => self.set(Status::Waiting, None),
            StatusEvent::PeerConnected => self.set(Status::Connected, None),
            StatusEvent::TransferStarted => self.set(Status::Transferring, None),
            StatusEvent::TransferCompleted => self.set(Status::Completed, None),
            StatusEvent::RelayDisconnected => {
                if self.status != Status::Completed {
                    self.set(Status::Error, Some("relay connection lost".to_string()));
                }
            }
            StatusEvent::Failed(message) => self.set(Status::Error, Some(message)),
            StatusEvent::Reset => self.set(Status::Idle, None),
        }
        self.status
    }

    fn set(&mut self, status: Status, message: Option<String>) {
        self.status = status;
        self.message = message;
    }

    /// Apply an event and push the resulting snapshot to the watcher.
    pub fn apply_publish(
        &mut self,
        event: StatusEvent,
        watcher: &tokio::sync::watch::Sender<StatusSnapshot>,
    ) -> Status {
        let status = self.apply(event);
        let _ = watcher.send(StatusSnapshot {
            status,
            message: self.message.clone(),
        });
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut model = StatusModel::new();
        assert_eq!(model.status(), Status::Idle);
        assert_eq!(model.apply(StatusEvent::Registered), Status::Waiting);
        assert_eq!(model.apply(StatusEvent::PeerConnected), Status::Connected);
        assert_eq!(model.apply(StatusEvent::TransferStarted), Status::Transferring);
        assert_eq!(model.apply(StatusEvent::TransferCompleted), Status::Completed);
    }

    #[test]
    fn test_disconnect_after_completed_is_not_an_error() {
        let mut model = StatusModel::new();
        model.apply(StatusEvent::Registered);
        model.apply(StatusEvent::TransferCompleted);
        assert_eq!(model.apply(StatusEvent::RelayDisconnected), Status::Completed);
        assert!(model.message().is_none());
    }

    #[test]
    fn test_disconnect_before_completed_is_an_error() {
        let mut model = StatusModel::new();
        model.apply(StatusEvent::Registered);
        assert_eq!(model.apply(StatusEvent::RelayDisconnected), Status::Error);
        assert!(model.message().unwrap().contains("relay"));
    }

    #[test]
    fn test_failure_carries_message() {
        let mut model = StatusModel::new();
        model.apply(StatusEvent::Failed("negotiation failed: bad sdp".into()));
        assert_eq!(model.status(), Status::Error);
        assert_eq!(model.message(), Some("negotiation failed: bad sdp"));
    }

    #[test]
    fn test_reset_clears_error() {
        let mut model = StatusModel::new();
        model.apply(StatusEvent::Failed("boom".into()));
        assert_eq!(model.apply(StatusEvent::Reset), Status::Idle);
        assert!(model.message().is_none());
    }
}
