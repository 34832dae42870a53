//! Lifecycle events and their fire-and-forget delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub mod worker;

pub use worker::{LogMailer, Mail, Mailer, NotificationWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Register,
    Login,
    PasswordChanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub email: String,
    pub ip_address: Option<String>,
    pub device: Option<String>,
    pub user_agent: Option<String>,
    /// Login-history row opened by a `Login` event.
    pub login_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub user_id: Uuid,
    pub metadata: EventMetadata,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, user_id: Uuid, email: &str) -> Self {
        Self {
            kind,
            user_id,
            metadata: EventMetadata {
                email: email.to_string(),
                ..EventMetadata::default()
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("notification queue is full")]
    QueueFull,
    #[error("notification queue is closed")]
    Closed,
}

/// At-most-once event sink. Callers never wait on delivery.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError>;
}

/// Enqueues events for the in-process [`NotificationWorker`].
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }
}

/// Publisher with no consumer attached; events only reach the log.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), PublishError> {
        debug!(kind = ?event.kind, user_id = %event.user_id, "lifecycle event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_never_blocks_on_a_full_queue() {
        let (publisher, mut rx) = ChannelPublisher::new(1);
        let id = Uuid::new_v4();
        publisher
            .publish(LifecycleEvent::new(EventKind::Register, id, "a@example.com"))
            .await
            .unwrap();
        let err = publisher
            .publish(LifecycleEvent::new(EventKind::Login, id, "a@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::QueueFull));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::Register);
    }

    #[tokio::test]
    async fn publish_reports_a_closed_queue() {
        let (publisher, rx) = ChannelPublisher::new(4);
        drop(rx);
        let err = publisher
            .publish(LifecycleEvent::new(EventKind::Register, Uuid::new_v4(), "a@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Closed));
    }

    #[test]
    fn event_serializes_with_snake_case_kind() {
        let ev = LifecycleEvent::new(EventKind::PasswordChanged, Uuid::nil(), "a@example.com");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "password_changed");
        assert_eq!(json["metadata"]["email"], "a@example.com");
    }
}
