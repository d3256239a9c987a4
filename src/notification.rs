//! Operator escalation for exhausted job records.

use async_trait::async_trait;

use std::sync::{Arc, Mutex};

use super::{config::NotificationConfig, entity::JobRecord, error::BoxError};

#[async_trait]
/// Delivery channel for operator notifications (usually email).
///
/// Fire-and-forget: the runner logs a failed send and moves on.
pub trait NotificationSender: Send + Sync + 'static {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), BoxError>;
}

/// Sender that only logs. Used when the host provides none.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), BoxError> {
        tracing::warn!(to, subject, body, "operator notification");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Sender that keeps every notification in memory, for assertions in tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotificationSender {
    sent: Arc<Mutex<Vec<SentNotification>>>,
}

impl RecordingNotificationSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .expect("Couldn't lock notifications Mutex")
            .clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotificationSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), BoxError> {
        self.sent
            .lock()
            .expect("Couldn't lock notifications Mutex")
            .push(SentNotification {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}

pub(crate) fn exhausted_subject(config: &NotificationConfig, job: &JobRecord) -> String {
    format!(
        "ERROR: Durable job {} failed on {}",
        job.job_name,
        config.host_name()
    )
}

pub(crate) fn exhausted_body(job: &JobRecord) -> String {
    format!(
        "Durable job {} (id {}) failed with no remaining attempts.\n\nLast error:\n{}",
        job.job_name,
        job.id,
        job.last_error_message().unwrap_or("<none recorded>")
    )
}
