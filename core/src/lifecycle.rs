//! Subscription lifecycle rules as pure functions.
//!
//!   pending ─approve─▶ approved ─activate─▶ active ◀─renew── suspended
//!      │                                      │  ──suspend──▶    │
//!      └─reject─▶ rejected                    └──terminate──▶ disconnected
//!
//! `apply` maps (Client, event, now) to the next Client plus the effects the
//! transition implies. Nothing here touches storage or the network; the
//! subscription machine persists the result and dispatches the effects.

use crate::{
    config::BillingPolicy,
    notify::NoticeKind,
    types::{ClientId, ClientStatus, Money, TenantId},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub tenant_id: TenantId,
    pub full_name: String,
    pub phone: String,
    pub email: Option<String>,
    pub billing_reference: String,
    pub package_speed: String,
    pub status: ClientStatus,
    pub wallet_balance: Money,
    pub monthly_rate: Money,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Approve { actor: String },
    Reject { actor: String, reason: String },
    Activate,
    /// Re-evaluate renewal after the wallet was credited.
    Credit,
    /// Scheduler check of an elapsed or elapsing window.
    ExpiryCheck,
    Suspend { actor: String, reason: String },
    Terminate { actor: String },
    ChangePlan {
        monthly_rate: Option<Money>,
        package_speed: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Activate => "activate",
            Self::Credit => "credit",
            Self::ExpiryCheck => "expiry_check",
            Self::Suspend { .. } => "suspend",
            Self::Terminate { .. } => "terminate",
            Self::ChangePlan { .. } => "change_plan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Approved,
    Rejected,
    Activated,
    /// Period extended, status unchanged.
    Renewed,
    /// Period extended and a suspended client brought back.
    Reactivated,
    Suspended,
    Terminated,
    PlanChanged,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedNetwork {
    Disconnect,
    Reconnect,
    /// Push the (possibly new) package speed to the router.
    ApplyPackageSpeed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedEffect {
    Network(PlannedNetwork),
    Notify(NoticeKind),
}

/// One period's charge against the wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalDebit {
    pub amount: Money,
    pub period_start: DateTime<Utc>,
}

impl RenewalDebit {
    /// Ledger reference; unique per client and period.
    pub fn reference(&self, client_id: &str) -> String {
        format!("renewal:{client_id}:{}", self.period_start.timestamp())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: TransitionKind,
    pub client: Client,
    pub debit: Option<RenewalDebit>,
    pub effects: Vec<PlannedEffect>,
}

impl Transition {
    fn unchanged(client: &Client) -> Self {
        Self {
            kind: TransitionKind::Unchanged,
            client: client.clone(),
            debit: None,
            effects: Vec::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot {operation} a client in status '{from}'")]
    InvalidTransition {
        from: ClientStatus,
        operation: &'static str,
    },

    #[error("an authorized actor is required")]
    MissingActor,

    #[error("a non-empty reason is required")]
    MissingReason,

    #[error("monthly rate must be positive, got {0}")]
    InvalidRate(String),

    #[error("debit of {debit} would overdraw balance {balance}")]
    NegativeBalance { balance: String, debit: String },
}

pub fn apply(
    client: &Client,
    event: &LifecycleEvent,
    now: DateTime<Utc>,
    policy: &BillingPolicy,
) -> Result<Transition, LifecycleError> {
    let invalid = || LifecycleError::InvalidTransition {
        from: client.status,
        operation: event.name(),
    };

    match event {
        LifecycleEvent::Approve { actor } => {
            require_actor(actor)?;
            if client.status != ClientStatus::Pending {
                return Err(invalid());
            }
            let mut next = client.clone();
            next.status = ClientStatus::Approved;
            next.approved_by = Some(actor.trim().to_string());
            next.approved_at = Some(now);
            Ok(changed(TransitionKind::Approved, next, now, Vec::new()))
        }

        LifecycleEvent::Reject { actor, reason } => {
            require_actor(actor)?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(LifecycleError::MissingReason);
            }
            if client.status != ClientStatus::Pending {
                return Err(invalid());
            }
            let mut next = client.clone();
            next.status = ClientStatus::Rejected;
            next.rejection_reason = Some(reason.to_string());
            let effects = vec![PlannedEffect::Notify(NoticeKind::Rejected {
                reason: reason.to_string(),
            })];
            Ok(changed(TransitionKind::Rejected, next, now, effects))
        }

        LifecycleEvent::Activate => {
            if client.status != ClientStatus::Approved {
                return Err(invalid());
            }
            let end = now + policy.period();
            let mut next = client.clone();
            next.status = ClientStatus::Active;
            next.subscription_end_date = Some(end);
            let effects = vec![
                PlannedEffect::Network(PlannedNetwork::Reconnect),
                PlannedEffect::Network(PlannedNetwork::ApplyPackageSpeed),
                PlannedEffect::Notify(NoticeKind::Activated { until: end }),
            ];
            Ok(changed(TransitionKind::Activated, next, now, effects))
        }

        LifecycleEvent::Credit => {
            Ok(renewal(client, now, policy)?.unwrap_or_else(|| Transition::unchanged(client)))
        }

        LifecycleEvent::ExpiryCheck => {
            let Some(end) = client.subscription_end_date else {
                return Ok(Transition::unchanged(client));
            };
            if !client.status.is_billable() || now < end {
                return Ok(Transition::unchanged(client));
            }
            // Same-instant tie: a payable renewal always beats suspension.
            if let Some(renewed) = renewal(client, now, policy)? {
                return Ok(renewed);
            }
            if client.status == ClientStatus::Suspended {
                return Ok(Transition::unchanged(client));
            }
            Ok(suspend(client, now, "subscription expired with insufficient balance"))
        }

        LifecycleEvent::Suspend { actor, reason } => {
            require_actor(actor)?;
            if reason.trim().is_empty() {
                return Err(LifecycleError::MissingReason);
            }
            if client.status != ClientStatus::Active {
                return Err(invalid());
            }
            Ok(suspend(client, now, reason.trim()))
        }

        LifecycleEvent::Terminate { actor } => {
            require_actor(actor)?;
            if !client.status.is_billable() {
                return Err(invalid());
            }
            let mut next = client.clone();
            next.status = ClientStatus::Disconnected;
            let effects = vec![
                PlannedEffect::Network(PlannedNetwork::Disconnect),
                PlannedEffect::Notify(NoticeKind::Terminated),
            ];
            Ok(changed(TransitionKind::Terminated, next, now, effects))
        }

        LifecycleEvent::ChangePlan {
            monthly_rate,
            package_speed,
        } => {
            if client.status.is_terminal() {
                return Err(invalid());
            }
            let mut next = client.clone();
            if let Some(rate) = monthly_rate {
                if *rate <= Decimal::ZERO {
                    return Err(LifecycleError::InvalidRate(rate.to_string()));
                }
                next.monthly_rate = *rate;
            }
            let mut effects = Vec::new();
            if let Some(speed) = package_speed {
                let speed = speed.trim();
                if speed != client.package_speed {
                    next.package_speed = speed.to_string();
                    if client.status == ClientStatus::Active {
                        effects.push(PlannedEffect::Network(PlannedNetwork::ApplyPackageSpeed));
                    }
                }
            }
            if next == *client {
                return Ok(Transition::unchanged(client));
            }
            Ok(changed(TransitionKind::PlanChanged, next, now, effects))
        }
    }
}

/// Renew one period when the client is billable, can pay, and the window
/// end is unset, past, or within the renewal window. Returns `None` when
/// any of those fail.
fn renewal(
    client: &Client,
    now: DateTime<Utc>,
    policy: &BillingPolicy,
) -> Result<Option<Transition>, LifecycleError> {
    if !client.status.is_billable() || client.wallet_balance < client.monthly_rate {
        return Ok(None);
    }
    let due = client
        .subscription_end_date
        .map_or(true, |end| end - now <= policy.renewal_window());
    if !due {
        return Ok(None);
    }

    let balance = client.wallet_balance - client.monthly_rate;
    if balance < Decimal::ZERO {
        return Err(LifecycleError::NegativeBalance {
            balance: client.wallet_balance.to_string(),
            debit: client.monthly_rate.to_string(),
        });
    }

    // A lapsed window restarts from now; an early renewal stacks on the end.
    let period_start = client
        .subscription_end_date
        .map_or(now, |end| end.max(now));
    let new_end = period_start + policy.period();

    let mut next = client.clone();
    next.wallet_balance = balance;
    next.subscription_end_date = Some(new_end);

    let mut effects = Vec::new();
    let kind = if client.status == ClientStatus::Suspended {
        next.status = ClientStatus::Active;
        effects.push(PlannedEffect::Network(PlannedNetwork::Reconnect));
        TransitionKind::Reactivated
    } else {
        TransitionKind::Renewed
    };
    effects.push(PlannedEffect::Notify(NoticeKind::Renewed {
        amount: client.monthly_rate,
        until: new_end,
    }));

    let mut transition = changed(kind, next, now, effects);
    transition.debit = Some(RenewalDebit {
        amount: client.monthly_rate,
        period_start,
    });
    Ok(Some(transition))
}

fn suspend(client: &Client, now: DateTime<Utc>, reason: &str) -> Transition {
    let mut next = client.clone();
    next.status = ClientStatus::Suspended;
    let effects = vec![
        PlannedEffect::Network(PlannedNetwork::Disconnect),
        PlannedEffect::Notify(NoticeKind::Suspended {
            reason: reason.to_string(),
        }),
    ];
    changed(TransitionKind::Suspended, next, now, effects)
}

fn changed(
    kind: TransitionKind,
    mut next: Client,
    now: DateTime<Utc>,
    effects: Vec<PlannedEffect>,
) -> Transition {
    next.updated_at = now;
    Transition {
        kind,
        client: next,
        debit: None,
        effects,
    }
}

fn require_actor(actor: &str) -> Result<(), LifecycleError> {
    if actor.trim().is_empty() {
        return Err(LifecycleError::MissingActor);
    }
    Ok(())
}
