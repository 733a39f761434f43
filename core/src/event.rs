//! Audit events.
//!
//! RULE: Every committed lifecycle transition and every payment outcome is
//! appended to the event log inside the same transaction that made it.
//! The audit view reads this log; nothing in the core replays it.

use crate::{
    lifecycle::TransitionKind,
    types::{ClientId, ClientStatus, Gateway, Money},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    // ── Lifecycle ──────────────────────────────────
    ClientRegistered {
        client_id: ClientId,
        tenant_id: String,
    },
    ClientTransitioned {
        client_id: ClientId,
        transition: TransitionKind,
        from: ClientStatus,
        to: ClientStatus,
        subscription_end_date: Option<DateTime<Utc>>,
        debit: Option<Money>,
    },

    // ── Payments ───────────────────────────────────
    PaymentApplied {
        client_id: ClientId,
        gateway: Gateway,
        external_reference: String,
        amount: Money,
        balance_after: Money,
    },
    PaymentUnmatched {
        gateway: Gateway,
        external_reference: String,
        payer_identifier: Option<String>,
    },
    PaymentFailed {
        gateway: Gateway,
        external_reference: String,
        reason: String,
    },
    PaymentRematched {
        client_id: ClientId,
        gateway: Gateway,
        external_reference: String,
        actor: String,
    },
}

impl BillingEvent {
    /// Stable name for the `event_type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ClientRegistered { .. } => "client_registered",
            Self::ClientTransitioned { .. } => "client_transitioned",
            Self::PaymentApplied { .. } => "payment_applied",
            Self::PaymentUnmatched { .. } => "payment_unmatched",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::PaymentRematched { .. } => "payment_rematched",
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::ClientRegistered { client_id, .. }
            | Self::ClientTransitioned { client_id, .. }
            | Self::PaymentApplied { client_id, .. }
            | Self::PaymentRematched { client_id, .. } => Some(client_id),
            Self::PaymentUnmatched { .. } | Self::PaymentFailed { .. } => None,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub client_id: Option<ClientId>,
    pub event_type: String,
    pub payload: String, // JSON-serialized BillingEvent
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn from_event(event: &BillingEvent, at: DateTime<Utc>) -> serde_json::Result<Self> {
        Ok(Self {
            id: None,
            client_id: event.client_id().map(str::to_string),
            event_type: event.type_name().to_string(),
            payload: serde_json::to_string(event)?,
            created_at: at,
        })
    }

    pub fn event(&self) -> serde_json::Result<BillingEvent> {
        serde_json::from_str(&self.payload)
    }
}
