use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use super::{EventKind, LifecycleEvent};
use crate::auth::session::SessionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: Mail) -> anyhow::Result<()>;
}

/// Writes outgoing mail to the log instead of delivering it.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: Mail) -> anyhow::Result<()> {
        info!(to = %mail.to, subject = %mail.subject, body = %mail.body, "mail");
        Ok(())
    }
}

/// Consumes lifecycle events and sends the matching notifications.
pub struct NotificationWorker {
    sessions: Arc<SessionManager>,
    mailer: Arc<dyn Mailer>,
    public_url: String,
}

impl NotificationWorker {
    pub fn new(sessions: Arc<SessionManager>, mailer: Arc<dyn Mailer>, public_url: &str) -> Self {
        Self {
            sessions,
            mailer,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Run until every publisher is dropped. Failures are logged per event.
    pub async fn run(self, mut rx: mpsc::Receiver<LifecycleEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle(&event).await {
                error!(error = %e, kind = ?event.kind, user_id = %event.user_id, "notification failed");
            }
        }
        debug!("notification worker stopped");
    }

    #[instrument(skip_all, fields(kind = ?event.kind, user_id = %event.user_id))]
    pub async fn handle(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let to = event.metadata.email.clone();
        let mail = match event.kind {
            EventKind::Register => Some(Mail {
                to,
                subject: "Welcome".into(),
                body: "Your account has been created.".into(),
            }),
            EventKind::PasswordChanged => Some(Mail {
                to,
                subject: "Your password was changed".into(),
                body: "The password for your account was just changed. \
                       If this was not you, reset it immediately."
                    .into(),
            }),
            EventKind::Login => self.login_notice(event).await?,
        };

        match mail {
            Some(mail) => self.mailer.send(mail).await,
            None => Ok(()),
        }
    }

    async fn login_notice(&self, event: &LifecycleEvent) -> anyhow::Result<Option<Mail>> {
        let history = self.sessions.login_history(event.user_id).await?;
        // Judge against the history as it stood when this login happened, so
        // later logins queued behind this event do not count.
        let earlier: Vec<_> = match event.metadata.login_id {
            Some(login_id) => history.iter().filter(|h| h.id < login_id).collect(),
            None => history.iter().collect(),
        };
        let to = event.metadata.email.clone();
        let device = event.metadata.device.as_deref().unwrap_or("unknown_unknown");
        let from = format!(
            "device {device}, address {}",
            event.metadata.ip_address.as_deref().unwrap_or("unknown")
        );

        if earlier.is_empty() {
            return Ok(Some(Mail {
                to,
                subject: "New sign-in to your account".into(),
                body: format!("You signed in from {from}."),
            }));
        }

        if earlier.iter().any(|h| h.device == device) {
            debug!(device, "login from known device");
            return Ok(None);
        }

        let handle = self
            .sessions
            .issue_revocation_link(&event.metadata.email)
            .await?;
        Ok(Some(Mail {
            to,
            subject: "Sign-in from a new device".into(),
            body: format!(
                "Your account was accessed from {from}. If this was not you, \
                 sign out everywhere: {}/auth/revoke/{handle}",
                self.public_url
            ),
        }))
    }
}
