//! Payment reconciliation: gateway callback to wallet credit, exactly once.
//!
//! RULE: A payment is credited only inside the transaction that moves its
//! row to `applied`. The row is claimed with `INSERT … ON CONFLICT DO
//! NOTHING` on `(gateway, external_reference)`, and the move to `applied`
//! is conditional, so N deliveries of one reference give one credit no
//! matter how they interleave.

pub mod gateway;
pub mod payer;

pub use gateway::{normalize, CanonicalPayment, Normalized};
pub use payer::{normalize_phone, PayerIdentifier};

use crate::{
    config::PayerConfig,
    error::{BillingError, BillingResult},
    event::BillingEvent,
    lifecycle::{Client, TransitionKind},
    notify::{NoticeKind, Notification},
    outbound::Effect,
    store::{Ledger, LedgerStore, NewPayment, PaymentRow},
    subscription::SubscriptionMachine,
    types::{ClientId, ClientStatus, Gateway, Money, PaymentStatus, TenantId, TriggeredBy, TxKind},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One inbound gateway notification, as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub tenant_id: TenantId,
    pub gateway: Gateway,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconciliationResult {
    Applied {
        payment_id: String,
        client_id: ClientId,
        amount: Money,
        balance_after: Money,
        transition: TransitionKind,
    },
    /// Already applied by an earlier delivery. Nothing changed.
    Duplicate {
        payment_id: String,
        client_id: Option<ClientId>,
    },
    /// Held for manual re-match.
    Unmatched { payment_id: String },
    /// The gateway reported the payment as not completed.
    Declined { payment_id: String, reason: String },
    /// The payload could not be used.
    Rejected { payment_id: String, reason: String },
}

impl ReconciliationResult {
    pub fn payment_id(&self) -> &str {
        match self {
            Self::Applied { payment_id, .. }
            | Self::Duplicate { payment_id, .. }
            | Self::Unmatched { payment_id }
            | Self::Declined { payment_id, .. }
            | Self::Rejected { payment_id, .. } => payment_id,
        }
    }
}

/// A committed result plus the effects still to dispatch.
struct Settled {
    result: ReconciliationResult,
    effects: Vec<Effect>,
}

impl Settled {
    fn quiet(result: ReconciliationResult) -> Self {
        Self {
            result,
            effects: Vec::new(),
        }
    }
}

pub struct ReconciliationEngine {
    machine: Arc<SubscriptionMachine>,
    payer: PayerConfig,
}

impl ReconciliationEngine {
    pub fn new(machine: Arc<SubscriptionMachine>, payer: PayerConfig) -> Self {
        Self { machine, payer }
    }

    pub fn reconcile(
        &self,
        store: &LedgerStore,
        callback: &GatewayCallback,
        now: DateTime<Utc>,
    ) -> BillingResult<ReconciliationResult> {
        let raw = callback.body.to_string();
        let settled = match normalize(callback.gateway, &callback.body) {
            Normalized::Payment(payment) => {
                store.write(|l| self.settle(l, &callback.tenant_id, &payment, &raw, now))?
            }
            Normalized::Declined {
                external_reference,
                amount,
                payer,
                reason,
            } => {
                let failed = FailedPayment {
                    reference: &external_reference,
                    amount,
                    payer: payer.primary(),
                    reason: &reason,
                };
                store.write(|l| self.record_failure(l, callback, failed, &raw, now, true))?
            }
            Normalized::Malformed {
                external_reference,
                reason,
            } => {
                let reference = external_reference
                    .unwrap_or_else(|| format!("malformed-{}", uuid::Uuid::new_v4()));
                let failed = FailedPayment {
                    reference: &reference,
                    amount: None,
                    payer: None,
                    reason: &reason,
                };
                store.write(|l| self.record_failure(l, callback, failed, &raw, now, false))?
            }
        };
        self.machine.dispatch(settled.effects);
        Ok(settled.result)
    }

    /// Attach an `unmatched` payment to `client_id` and credit it.
    pub fn rematch(
        &self,
        store: &LedgerStore,
        gateway: Gateway,
        external_reference: &str,
        client_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<ReconciliationResult> {
        if actor.trim().is_empty() {
            return Err(BillingError::Validation("re-match requires an actor".into()));
        }
        let settled = store.write(|l| {
            let row = l.payment(gateway, external_reference)?.ok_or_else(|| {
                BillingError::PaymentNotFound {
                    gateway: gateway.to_string(),
                    external_reference: external_reference.to_string(),
                }
            })?;
            if row.status != PaymentStatus::Unmatched {
                return Err(BillingError::Validation(format!(
                    "payment {gateway}/{external_reference} is {}; only unmatched payments can be re-matched",
                    row.status
                )));
            }
            let client = l.require_client(client_id)?;
            if client.tenant_id != row.tenant_id {
                return Err(BillingError::Validation(format!(
                    "client {client_id} does not belong to tenant {}",
                    row.tenant_id
                )));
            }
            let amount = row.amount.ok_or_else(|| {
                BillingError::InvariantViolation(format!(
                    "unmatched payment {} has no amount",
                    row.id
                ))
            })?;
            l.append_event(
                &BillingEvent::PaymentRematched {
                    client_id: client_id.to_string(),
                    gateway,
                    external_reference: external_reference.to_string(),
                    actor: actor.trim().to_string(),
                },
                now,
            )?;
            self.credit(l, &row, &client, amount, now, TriggeredBy::Manual)
        })?;
        log::info!(
            "reconcile: {gateway}/{external_reference} re-matched to client={client_id} by {}",
            actor.trim()
        );
        self.machine.dispatch(settled.effects);
        Ok(settled.result)
    }

    // ── Inside the write transaction ─────────────────────────────

    fn settle(
        &self,
        l: &Ledger<'_>,
        tenant_id: &str,
        p: &CanonicalPayment,
        raw: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Settled> {
        let (row, inserted) = l.claim_payment(&NewPayment {
            tenant_id,
            gateway: p.gateway,
            external_reference: &p.external_reference,
            amount: Some(p.amount),
            payer_identifier: p.payer.primary(),
            status: PaymentStatus::Received,
            failure_reason: None,
            raw_payload: raw,
            received_at: now,
        })?;

        if row.status == PaymentStatus::Applied {
            log::info!(
                "reconcile: duplicate {}/{} ignored (payment {})",
                p.gateway,
                p.external_reference,
                row.id
            );
            return Ok(Settled::quiet(ReconciliationResult::Duplicate {
                payment_id: row.id,
                client_id: row.client_id,
            }));
        }
        if !inserted {
            log::info!(
                "reconcile: redelivery of {}/{} in status {}; re-processing",
                p.gateway,
                p.external_reference,
                row.status
            );
            l.refresh_payment(&row.id, p.amount, p.payer.primary())?;
        }

        let amount = match row.amount {
            Some(stored) if stored != p.amount => {
                log::warn!(
                    "reconcile: {}/{} redelivered with amount {} but {} is on record; using stored",
                    p.gateway,
                    p.external_reference,
                    p.amount,
                    stored
                );
                stored
            }
            Some(stored) => stored,
            None => p.amount,
        };

        let Some(client) = self.resolve(l, tenant_id, &p.payer)? else {
            l.resolve_payment(&row.id, PaymentStatus::Unmatched, None, Some("no client matches payer"))?;
            if row.status != PaymentStatus::Unmatched {
                l.append_event(
                    &BillingEvent::PaymentUnmatched {
                        gateway: p.gateway,
                        external_reference: p.external_reference.clone(),
                        payer_identifier: p.payer.primary().map(str::to_string),
                    },
                    now,
                )?;
            }
            log::warn!(
                "reconcile: {}/{} amount={amount} payer={:?} unmatched",
                p.gateway,
                p.external_reference,
                p.payer.primary()
            );
            return Ok(Settled::quiet(ReconciliationResult::Unmatched { payment_id: row.id }));
        };

        let triggered_by = if p.gateway == Gateway::Manual {
            TriggeredBy::Manual
        } else {
            TriggeredBy::Webhook
        };
        self.credit(l, &row, &client, amount, now, triggered_by)
    }

    /// Credit the wallet, mark the payment applied, and re-evaluate renewal.
    fn credit(
        &self,
        l: &Ledger<'_>,
        row: &PaymentRow,
        client: &Client,
        amount: Money,
        now: DateTime<Utc>,
        triggered_by: TriggeredBy,
    ) -> BillingResult<Settled> {
        l.resolve_payment(&row.id, PaymentStatus::Matched, Some(&client.id), None)?;
        let entry = l.post_wallet_entry(&client.id, TxKind::Credit, amount, &row.id, now)?;
        if !l.mark_payment_applied(&row.id, now)? {
            return Err(BillingError::InvariantViolation(format!(
                "payment {} was applied concurrently",
                row.id
            )));
        }
        l.append_event(
            &BillingEvent::PaymentApplied {
                client_id: client.id.clone(),
                gateway: row.gateway,
                external_reference: row.external_reference.clone(),
                amount,
                balance_after: entry.balance_after,
            },
            now,
        )?;

        let outcome = self.machine.on_credit(l, &client.id, now, triggered_by)?;

        log::info!(
            "reconcile: {}/{} applied client={} amount={amount} balance={} transition={:?}",
            row.gateway,
            row.external_reference,
            client.id,
            outcome.client.wallet_balance,
            outcome.kind
        );

        let mut effects = Vec::with_capacity(outcome.effects.len() + 1);
        let receipt = NoticeKind::PaymentReceived {
            amount,
            balance: outcome.client.wallet_balance,
        };
        effects.extend(Notification::for_client(&outcome.client, receipt).map(Effect::Notify));
        effects.extend(outcome.effects);

        Ok(Settled {
            result: ReconciliationResult::Applied {
                payment_id: row.id.clone(),
                client_id: client.id.clone(),
                amount,
                balance_after: outcome.client.wallet_balance,
                transition: outcome.kind,
            },
            effects,
        })
    }

    fn record_failure(
        &self,
        l: &Ledger<'_>,
        callback: &GatewayCallback,
        failed: FailedPayment<'_>,
        raw: &str,
        now: DateTime<Utc>,
        declined: bool,
    ) -> BillingResult<Settled> {
        let (row, inserted) = l.claim_payment(&NewPayment {
            tenant_id: &callback.tenant_id,
            gateway: callback.gateway,
            external_reference: failed.reference,
            amount: failed.amount,
            payer_identifier: failed.payer,
            status: PaymentStatus::Failed,
            failure_reason: Some(failed.reason),
            raw_payload: raw,
            received_at: now,
        })?;

        if row.status == PaymentStatus::Applied {
            return Ok(Settled::quiet(ReconciliationResult::Duplicate {
                payment_id: row.id,
                client_id: row.client_id,
            }));
        }
        if inserted {
            l.append_event(
                &BillingEvent::PaymentFailed {
                    gateway: callback.gateway,
                    external_reference: failed.reference.to_string(),
                    reason: failed.reason.to_string(),
                },
                now,
            )?;
        }
        log::warn!(
            "reconcile: {}/{} failed tenant={}: {}",
            callback.gateway,
            failed.reference,
            callback.tenant_id,
            failed.reason
        );

        let reason = failed.reason.to_string();
        let result = if declined {
            ReconciliationResult::Declined {
                payment_id: row.id,
                reason,
            }
        } else {
            ReconciliationResult::Rejected {
                payment_id: row.id,
                reason,
            }
        };
        Ok(Settled::quiet(result))
    }

    /// Billing reference first, then a unique phone match, then an explicit
    /// client id. Rejected clients never receive credits.
    fn resolve(
        &self,
        l: &Ledger<'_>,
        tenant_id: &str,
        payer: &PayerIdentifier,
    ) -> BillingResult<Option<Client>> {
        let eligible = |c: &Client| c.status != ClientStatus::Rejected;

        if let Some(reference) = &payer.billing_reference {
            if let Some(client) = l.find_client_by_billing_reference(tenant_id, reference)? {
                if eligible(&client) {
                    return Ok(Some(client));
                }
            }
        }

        if let Some(phone) = payer
            .phone
            .as_deref()
            .and_then(|raw| normalize_phone(raw, &self.payer.country_code))
        {
            let mut matches: Vec<Client> = l
                .find_clients_by_phone(tenant_id, &phone)?
                .into_iter()
                .filter(|c| eligible(c))
                .collect();
            match matches.len() {
                0 => {}
                1 => return Ok(matches.pop()),
                n => log::warn!("reconcile: phone {phone} matches {n} clients in tenant {tenant_id}; not guessing"),
            }
        }

        if let Some(client_id) = &payer.client_id {
            if let Some(client) = l.client(client_id)? {
                if client.tenant_id == tenant_id && eligible(&client) {
                    return Ok(Some(client));
                }
            }
        }
        Ok(None)
    }
}

struct FailedPayment<'a> {
    reference: &'a str,
    amount: Option<Money>,
    payer: Option<&'a str>,
    reason: &'a str,
}
