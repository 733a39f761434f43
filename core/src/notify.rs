//! Outbound client notifications (SMS / email).
//!
//! Delivery is fire-and-forget: no billing decision waits on or depends on
//! a notification succeeding.

use crate::{
    lifecycle::Client,
    types::{ClientId, Money},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    PaymentReceived { amount: Money, balance: Money },
    Activated { until: DateTime<Utc> },
    Renewed { amount: Money, until: DateTime<Utc> },
    Suspended { reason: String },
    Terminated,
    Rejected { reason: String },
    ExpiryReminder { days_left: i64, expires_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub client_id: ClientId,
    pub channel: Channel,
    pub recipient: String,
    pub kind: NoticeKind,
}

impl Notification {
    /// Address the client by SMS, or by email when no phone is on file.
    /// Returns `None` when the client has no usable contact.
    pub fn for_client(client: &Client, kind: NoticeKind) -> Option<Self> {
        let (channel, recipient) = if !client.phone.trim().is_empty() {
            (Channel::Sms, client.phone.clone())
        } else {
            (Channel::Email, client.email.clone().filter(|e| !e.trim().is_empty())?)
        };
        Some(Self {
            client_id: client.id.clone(),
            channel,
            recipient,
            kind,
        })
    }

    pub fn message(&self) -> String {
        match &self.kind {
            NoticeKind::PaymentReceived { amount, balance } => {
                format!("Payment of {amount} received. Wallet balance: {balance}.")
            }
            NoticeKind::Activated { until } => format!(
                "Your internet service is now active until {}.",
                until.format("%Y-%m-%d")
            ),
            NoticeKind::Renewed { amount, until } => format!(
                "Subscription renewed for {amount}. Next expiry: {}.",
                until.format("%Y-%m-%d")
            ),
            NoticeKind::Suspended { reason } => {
                format!("Your internet service has been suspended: {reason}.")
            }
            NoticeKind::Terminated => "Your internet service has been disconnected.".to_string(),
            NoticeKind::Rejected { reason } => {
                format!("Your registration was not approved: {reason}.")
            }
            NoticeKind::ExpiryReminder {
                days_left,
                expires_at,
            } => format!(
                "Your subscription expires in {days_left} day(s) on {}. Top up to stay connected.",
                expires_at.format("%Y-%m-%d")
            ),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("recipient rejected: {0}")]
    BadRecipient(String),
}

impl NotifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of a provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        log::info!(
            "notify: client={} channel={:?} to={} msg={:?}",
            n.client_id,
            n.channel,
            n.recipient,
            n.message()
        );
        Ok(())
    }
}

/// Keeps every delivered notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail_remaining: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn sent_to(&self, client_id: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.client_id == client_id)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NotifyError::Unavailable("scripted failure".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(n.clone());
        Ok(())
    }
}
