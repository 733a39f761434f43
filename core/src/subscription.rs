//! Subscription state machine.
//!
//! RULE: Every client status change goes through `SubscriptionMachine`.
//! Webhook credits, scheduler sweeps and operator actions all end up in
//! `transition_in`, which persists a `lifecycle::apply` result and returns
//! the effects to run once the surrounding transaction has committed.

use crate::{
    config::PortalConfig,
    error::{BillingError, BillingResult},
    event::BillingEvent,
    lifecycle::{self, Client, LifecycleEvent, PlannedEffect, PlannedNetwork, TransitionKind},
    network::{normalize_speed, NetworkCommand},
    notify::{NoticeKind, Notification},
    outbound::{Effect, EffectSink},
    store::{Ledger, LedgerStore},
    types::{ClientId, ClientStatus, Money, NetworkActionKind, TriggeredBy, TxKind},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A committed (or no-op) transition and the effects it still owes.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub kind: TransitionKind,
    pub from: ClientStatus,
    pub client: Client,
    pub effects: Vec<Effect>,
}

impl TransitionOutcome {
    pub fn changed(&self) -> bool {
        self.kind != TransitionKind::Unchanged
    }
}

pub struct SubscriptionMachine {
    config: PortalConfig,
    sink: Arc<dyn EffectSink>,
}

impl SubscriptionMachine {
    pub fn new(config: PortalConfig, sink: Arc<dyn EffectSink>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    // ── Operations ────────────────────────────────────────────────

    pub fn approve(
        &self,
        store: &LedgerStore,
        client_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        let event = LifecycleEvent::Approve {
            actor: actor.to_string(),
        };
        self.run(store, client_id, &event, now, TriggeredBy::Manual)
    }

    pub fn reject(
        &self,
        store: &LedgerStore,
        client_id: &str,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        let event = LifecycleEvent::Reject {
            actor: actor.to_string(),
            reason: reason.to_string(),
        };
        self.run(store, client_id, &event, now, TriggeredBy::Manual)
    }

    pub fn activate(
        &self,
        store: &LedgerStore,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        self.run(store, client_id, &LifecycleEvent::Activate, now, TriggeredBy::Manual)
    }

    /// Renewal check after a wallet credit, run inside the crediting
    /// transaction.
    pub fn on_credit(
        &self,
        ledger: &Ledger<'_>,
        client_id: &str,
        now: DateTime<Utc>,
        triggered_by: TriggeredBy,
    ) -> BillingResult<TransitionOutcome> {
        self.transition_in(ledger, client_id, &LifecycleEvent::Credit, now, triggered_by)
    }

    pub fn evaluate_expiry(
        &self,
        store: &LedgerStore,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        self.run(store, client_id, &LifecycleEvent::ExpiryCheck, now, TriggeredBy::Scheduler)
    }

    pub fn suspend(
        &self,
        store: &LedgerStore,
        client_id: &str,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        let event = LifecycleEvent::Suspend {
            actor: actor.to_string(),
            reason: reason.to_string(),
        };
        self.run(store, client_id, &event, now, TriggeredBy::Manual)
    }

    pub fn terminate(
        &self,
        store: &LedgerStore,
        client_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        let event = LifecycleEvent::Terminate {
            actor: actor.to_string(),
        };
        self.run(store, client_id, &event, now, TriggeredBy::Manual)
    }

    pub fn change_plan(
        &self,
        store: &LedgerStore,
        client_id: &str,
        monthly_rate: Option<Money>,
        package_speed: Option<String>,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        let event = LifecycleEvent::ChangePlan {
            monthly_rate,
            package_speed,
        };
        self.run(store, client_id, &event, now, TriggeredBy::Manual)
    }

    // ── Persistence ───────────────────────────────────────────────

    fn run(
        &self,
        store: &LedgerStore,
        client_id: &str,
        event: &LifecycleEvent,
        now: DateTime<Utc>,
        triggered_by: TriggeredBy,
    ) -> BillingResult<TransitionOutcome> {
        let outcome =
            store.write(|ledger| self.transition_in(ledger, client_id, event, now, triggered_by))?;
        self.dispatch(outcome.effects.clone());
        Ok(outcome)
    }

    /// Apply `event` inside the caller's transaction. The returned effects
    /// have not been dispatched; the caller hands them to `dispatch` after
    /// commit.
    pub fn transition_in(
        &self,
        ledger: &Ledger<'_>,
        client_id: &str,
        event: &LifecycleEvent,
        now: DateTime<Utc>,
        triggered_by: TriggeredBy,
    ) -> BillingResult<TransitionOutcome> {
        let before = ledger.require_client(client_id)?;
        let transition = lifecycle::apply(&before, event, now, &self.config.billing).map_err(
            |source| BillingError::Lifecycle {
                client_id: client_id.to_string(),
                source,
            },
        )?;

        if transition.kind == TransitionKind::Unchanged {
            return Ok(TransitionOutcome {
                kind: transition.kind,
                from: before.status,
                client: before,
                effects: Vec::new(),
            });
        }

        if let Some(debit) = &transition.debit {
            ledger.post_wallet_entry(
                client_id,
                TxKind::Debit,
                debit.amount,
                &debit.reference(client_id),
                now,
            )?;
        }
        ledger.save_transition(&before, &transition.client)?;
        ledger.append_event(
            &BillingEvent::ClientTransitioned {
                client_id: client_id.to_string(),
                transition: transition.kind,
                from: before.status,
                to: transition.client.status,
                subscription_end_date: transition.client.subscription_end_date,
                debit: transition.debit.as_ref().map(|d| d.amount),
            },
            now,
        )?;

        log::info!(
            "lifecycle: client={client_id} {} {:?} {} -> {} end={:?}",
            event.name(),
            transition.kind,
            before.status,
            transition.client.status,
            transition.client.subscription_end_date
        );

        let effects = self.materialize(&transition.client, &transition.effects, triggered_by);
        Ok(TransitionOutcome {
            kind: transition.kind,
            from: before.status,
            client: transition.client,
            effects,
        })
    }

    // ── Effects ───────────────────────────────────────────────────

    pub fn dispatch(&self, effects: Vec<Effect>) {
        self.sink.dispatch_all(effects);
    }

    /// Send `kind` to the client on its preferred channel, if it has one.
    pub fn notify(&self, client: &Client, kind: NoticeKind) {
        match Notification::for_client(client, kind) {
            Some(n) => self.sink.dispatch(Effect::Notify(n)),
            None => log::debug!("notify: client={} has no contact on file", client.id),
        }
    }

    fn materialize(
        &self,
        client: &Client,
        planned: &[PlannedEffect],
        triggered_by: TriggeredBy,
    ) -> Vec<Effect> {
        planned
            .iter()
            .filter_map(|effect| match effect {
                PlannedEffect::Network(network) => Some(Effect::Network {
                    client_id: client.id.clone(),
                    command: self.network_command(client, *network),
                    triggered_by,
                }),
                PlannedEffect::Notify(kind) => {
                    Notification::for_client(client, kind.clone()).map(Effect::Notify)
                }
            })
            .collect()
    }

    fn network_command(&self, client: &Client, planned: PlannedNetwork) -> NetworkCommand {
        match planned {
            PlannedNetwork::Disconnect => NetworkCommand::Disconnect,
            PlannedNetwork::Reconnect => NetworkCommand::Reconnect,
            PlannedNetwork::ApplyPackageSpeed => NetworkCommand::UpdateBandwidth {
                limits: normalize_speed(
                    &client.package_speed,
                    self.config.network.bare_number_unit,
                    self.config.network.fallback_speed_kbps,
                ),
            },
        }
    }

    // ── Remediation ───────────────────────────────────────────────

    /// Re-issue the command implied by the current status for every
    /// unresolved failure, per command family. Returns what was re-issued.
    pub fn remediate(
        &self,
        store: &LedgerStore,
        triggered_by: TriggeredBy,
    ) -> BillingResult<Vec<(ClientId, NetworkActionKind)>> {
        let ledger = store.ledger();
        let mut reissued = Vec::new();

        for failed in ledger.unresolved_failed_actions()? {
            let Some(client) = ledger.client(&failed.client_id)? else {
                log::warn!("remediate: no client for failed action id={:?}", failed.id);
                continue;
            };
            let bandwidth = failed.action == NetworkActionKind::UpdateBandwidth;
            let planned = match client.status {
                ClientStatus::Active if bandwidth => PlannedNetwork::ApplyPackageSpeed,
                ClientStatus::Active => PlannedNetwork::Reconnect,
                ClientStatus::Suspended | ClientStatus::Disconnected if !bandwidth => {
                    PlannedNetwork::Disconnect
                }
                _ => {
                    log::debug!(
                        "remediate: client={} in status {} needs no {} re-issued",
                        client.id,
                        client.status,
                        failed.action
                    );
                    continue;
                }
            };
            let command = self.network_command(&client, planned);
            log::info!(
                "remediate: client={} status={} last {} failed; re-issuing {}",
                client.id,
                client.status,
                failed.action,
                command.kind()
            );
            reissued.push((client.id.clone(), command.kind()));
            self.sink.dispatch(Effect::Network {
                client_id: client.id,
                command,
                triggered_by,
            });
        }
        Ok(reissued)
    }
}
