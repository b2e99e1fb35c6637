//! Out-of-band notification channel.
//!
//! Errors that have no caller to return to (read failures, malformed events,
//! failed subscription changes) and session changes are broadcast to every
//! listener. A listener that falls behind loses the oldest notifications.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::error::StationError;
use super::{ConnectionState, DeviceInfo, EngineObject};

/// Something the station reported outside of a request.
#[derive(Debug, Clone)]
pub struct Notification {
    /// When the notification was raised
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: NotificationKind,
}

/// Kinds of notifications.
#[derive(Debug, Clone)]
pub enum NotificationKind {
    /// An error without a waiting caller
    Error(Arc<StationError>),
    /// The session state moved
    StateChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
    },
    /// Device identification was (re)read
    InfoChanged(DeviceInfo),
    /// The engine roster was (re)read
    EnginesChanged(Vec<EngineObject>),
}

impl Notification {
    fn now(kind: NotificationKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The error carried by this notification, if any.
    pub fn error(&self) -> Option<&StationError> {
        match &self.kind {
            NotificationKind::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// Sending side of the notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    /// Create a channel holding up to `capacity` undelivered notifications.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New listener; sees notifications raised after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Broadcast an error.
    pub fn error(&self, err: impl Into<StationError>) {
        let err = err.into();
        tracing::warn!(error = %err, "station error");
        self.publish(NotificationKind::Error(Arc::new(err)));
    }

    /// Broadcast a state change; nothing is sent when `from == to`.
    pub fn state_changed(&self, from: ConnectionState, to: ConnectionState) {
        if from != to {
            tracing::info!(?from, ?to, "connection state changed");
            self.publish(NotificationKind::StateChanged { from, to });
        }
    }

    /// Broadcast any notification kind.
    pub fn publish(&self, kind: NotificationKind) {
        // No listeners is fine.
        let _ = self.sender.send(Notification::now(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::error::RequestError;

    #[tokio::test]
    async fn listeners_receive_in_order() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.state_changed(ConnectionState::Idle, ConnectionState::Connecting);
        notifier.state_changed(ConnectionState::Connecting, ConnectionState::Connecting);
        notifier.error(RequestError::Connectivity);

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.kind,
            NotificationKind::StateChanged {
                from: ConnectionState::Idle,
                to: ConnectionState::Connecting
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.error(),
            Some(StationError::Request(RequestError::Connectivity))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publishing_without_listeners_is_fine() {
        let notifier = Notifier::new(0);
        notifier.publish(NotificationKind::EnginesChanged(Vec::new()));
    }
}
