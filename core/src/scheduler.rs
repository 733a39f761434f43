//! Renewal scheduler.
//!
//! RULE: One sweep is a pass over every active or suspended client with an
//! end date. It sends expiry reminders and hands elapsed windows to the
//! state machine; it never changes a client itself. Every write it makes is
//! guarded in the store, so two sweeps may overlap safely.

use crate::{
    clock::Clock,
    error::BillingResult,
    lifecycle::{Client, TransitionKind},
    notify::NoticeKind,
    store::LedgerStore,
    subscription::SubscriptionMachine,
    types::{ClientId, NetworkActionKind, TriggeredBy},
};
use chrono::{DateTime, Utc};
use crossbeam_channel::{select, tick, Receiver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DAY_MS: i64 = 86_400_000;

/// Whole days until `end`, rounded up. Zero once `end` has been reached.
pub fn days_until_expiry(end: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let ms = (end - now).num_milliseconds();
    -((-ms).div_euclid(DAY_MS))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub client_id: Option<ClientId>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub reminded: Vec<ClientId>,
    /// Renewed in place, or renewed out of suspension.
    pub renewed: Vec<ClientId>,
    pub suspended: Vec<ClientId>,
    pub unchanged: usize,
    pub remediated: Vec<(ClientId, NetworkActionKind)>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, client_id: Option<&str>, error: impl ToString) {
        self.failures.push(SweepFailure {
            client_id: client_id.map(str::to_string),
            error: error.to_string(),
        });
    }
}

pub struct RenewalScheduler {
    machine: Arc<SubscriptionMachine>,
}

impl RenewalScheduler {
    pub fn new(machine: Arc<SubscriptionMachine>) -> Self {
        Self { machine }
    }

    /// One pass. Per-client failures are logged and reported; they never
    /// stop the sweep.
    pub fn sweep(&self, store: &LedgerStore, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let clients = match store.ledger().billable_clients() {
            Ok(clients) => clients,
            Err(e) => {
                log::error!("scheduler: cannot list clients: {e}");
                report.fail(None, e);
                return report;
            }
        };

        for client in &clients {
            report.evaluated += 1;
            if let Err(e) = self.sweep_client(store, client, now, &mut report) {
                log::error!("scheduler: client={} failed: {e}", client.id);
                report.fail(Some(&client.id), e);
            }
        }

        if self.machine.config().scheduler.remediate_failed_actions {
            match self.machine.remediate(store, TriggeredBy::Scheduler) {
                Ok(reissued) => report.remediated = reissued,
                Err(e) => {
                    log::error!("scheduler: remediation failed: {e}");
                    report.fail(None, e);
                }
            }
        }

        log::info!(
            "scheduler: sweep at {now} evaluated={} reminded={} renewed={} suspended={} remediated={} failures={}",
            report.evaluated,
            report.reminded.len(),
            report.renewed.len(),
            report.suspended.len(),
            report.remediated.len(),
            report.failures.len()
        );
        report
    }

    fn sweep_client(
        &self,
        store: &LedgerStore,
        client: &Client,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> BillingResult<()> {
        let Some(end) = client.subscription_end_date else {
            return Ok(());
        };
        let days = days_until_expiry(end, now);

        if days > 0 {
            let policy = &self.machine.config().billing;
            if policy.reminder_days.contains(&days) {
                let bucket = now.date_naive().to_string();
                if store.ledger().claim_reminder(&client.id, &bucket, days, now)? {
                    log::debug!("scheduler: reminder client={} days_left={days}", client.id);
                    self.machine.notify(
                        client,
                        NoticeKind::ExpiryReminder {
                            days_left: days,
                            expires_at: end,
                        },
                    );
                    report.reminded.push(client.id.clone());
                }
            }
            return Ok(());
        }

        let outcome = self.machine.evaluate_expiry(store, &client.id, now)?;
        match outcome.kind {
            TransitionKind::Renewed | TransitionKind::Reactivated => {
                report.renewed.push(client.id.clone())
            }
            TransitionKind::Suspended => report.suspended.push(client.id.clone()),
            _ => report.unchanged += 1,
        }
        Ok(())
    }

    /// Sweep now, then every `scheduler.interval_secs`, until `shutdown`
    /// receives a message or its sender is dropped.
    pub fn run(&self, store: &LedgerStore, clock: &dyn Clock, shutdown: Receiver<()>) {
        let interval = Duration::from_secs(self.machine.config().scheduler.interval_secs.max(1));
        let ticker = tick(interval);
        log::info!("scheduler: running every {interval:?}");

        self.sweep(store, clock.now());
        loop {
            select! {
                recv(ticker) -> _ => {
                    self.sweep(store, clock.now());
                }
                recv(shutdown) -> _ => {
                    log::info!("scheduler: stopped");
                    return;
                }
            }
        }
    }
}
