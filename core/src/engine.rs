//! The billing engine: composition root for the subscription core.
//!
//! WIRING (leaf first):
//!   1. LedgerStore            (one connection per engine)
//!   2. EffectSink             (inline, or the outbound worker pool)
//!   3. SubscriptionMachine    (owns every status change)
//!   4. ReconciliationEngine   (callbacks into credits)
//!   5. RenewalScheduler       (periodic sweep)
//!
//! RULES:
//!   - Entry points read `now` from the engine clock exactly once.
//!   - Effects run only after the write that produced them has committed.
//!   - An engine is used from one thread. `fork` gives another thread its
//!     own connection over the same collaborators.

use crate::{
    callback::{CallbackAck, CallbackHandler},
    clock::{Clock, ManualClock},
    command::AdminCommand,
    config::PortalConfig,
    error::{BillingError, BillingResult},
    event::{BillingEvent, EventLogEntry},
    lifecycle::{Client, TransitionKind},
    network::{InMemoryNas, NetworkAccess},
    notify::{Notifier, RecordingNotifier},
    outbound::{EffectRunner, EffectSink, InlineSink},
    reconciliation::{normalize_phone, GatewayCallback, ReconciliationEngine, ReconciliationResult},
    scheduler::{RenewalScheduler, SweepReport},
    store::{LedgerStore, NetworkActionRow, NewClient, PaymentRow, WalletTxRow},
    subscription::{SubscriptionMachine, TransitionOutcome},
    types::{ClientId, ClientStatus, Gateway, Money, NetworkActionKind, PaymentStatus, TriggeredBy},
};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of an `AdminCommand`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Transitioned {
        client_id: ClientId,
        transition: TransitionKind,
        from: ClientStatus,
        to: ClientStatus,
    },
    Payment {
        result: ReconciliationResult,
    },
    Remediated {
        reissued: Vec<(ClientId, NetworkActionKind)>,
    },
}

impl From<TransitionOutcome> for CommandOutcome {
    fn from(o: TransitionOutcome) -> Self {
        Self::Transitioned {
            client_id: o.client.id,
            transition: o.kind,
            from: o.from,
            to: o.client.status,
        }
    }
}

/// Standing discrepancies an operator has to look at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditView {
    pub unmatched_payments: Vec<PaymentRow>,
    pub failed_payments: Vec<PaymentRow>,
    pub failed_network_actions: Vec<NetworkActionRow>,
}

/// A client with its payments and wallet entries, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatement {
    pub client: Client,
    pub payments: Vec<PaymentRow>,
    pub wallet: Vec<WalletTxRow>,
}

pub struct BillingEngine {
    pub store: LedgerStore,
    clock: Arc<dyn Clock>,
    machine: Arc<SubscriptionMachine>,
    reconciliation: Arc<ReconciliationEngine>,
    scheduler: Arc<RenewalScheduler>,
}

/// A fully wired engine plus handles on its test doubles.
pub struct TestRig {
    pub engine: BillingEngine,
    pub nas: Arc<InMemoryNas>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl BillingEngine {
    /// Wire an engine over an already migrated store.
    pub fn new(
        store: LedgerStore,
        config: PortalConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EffectSink>,
    ) -> Self {
        let payer = config.payer.clone();
        let machine = Arc::new(SubscriptionMachine::new(config, sink));
        Self {
            store,
            clock,
            reconciliation: Arc::new(ReconciliationEngine::new(Arc::clone(&machine), payer)),
            scheduler: Arc::new(RenewalScheduler::new(Arc::clone(&machine))),
            machine,
        }
    }

    /// Migrate `store` and wire an engine whose effects run synchronously
    /// on the calling thread, over a second connection to the same database.
    pub fn build_inline(
        store: LedgerStore,
        config: PortalConfig,
        nas: Arc<dyn NetworkAccess>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> BillingResult<Self> {
        config.validate()?;
        store.migrate()?;
        let runner = EffectRunner::new(&config, store.reopen()?, nas, notifier, Arc::clone(&clock));
        let sink: Arc<dyn EffectSink> = Arc::new(InlineSink::new(runner));
        Ok(Self::new(store, config, clock, sink))
    }

    /// Engine over a fresh shared in-memory database with an in-memory NAS,
    /// a recording notifier, a manual clock pinned at `start`, and retries
    /// that never sleep.
    pub fn build_test(name: &str, start: DateTime<Utc>) -> BillingResult<TestRig> {
        let store = LedgerStore::shared_memory(&format!("{name}-{}", uuid::Uuid::new_v4()))?;
        let nas = Arc::new(InMemoryNas::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(start));
        let engine = Self::build_inline(
            store,
            PortalConfig::default_test(),
            Arc::clone(&nas) as Arc<dyn NetworkAccess>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )?;
        Ok(TestRig {
            engine,
            nas,
            notifier,
            clock,
        })
    }

    /// Same collaborators, new database connection. For another thread.
    pub fn fork(&self) -> BillingResult<Self> {
        Ok(Self {
            store: self.store.reopen()?,
            clock: Arc::clone(&self.clock),
            machine: Arc::clone(&self.machine),
            reconciliation: Arc::clone(&self.reconciliation),
            scheduler: Arc::clone(&self.scheduler),
        })
    }

    pub fn config(&self) -> &PortalConfig {
        self.machine.config()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── Clients ───────────────────────────────────────────────────

    /// Create a `pending` client. The phone is stored in normalised form so
    /// payer matching compares like with like.
    pub fn register_client(&self, new: NewClient) -> BillingResult<Client> {
        let now = self.now();
        let full_name = new.full_name.trim();
        let billing_reference = new.billing_reference.trim();
        if full_name.is_empty() {
            return Err(BillingError::Validation("full_name is required".into()));
        }
        if billing_reference.is_empty() {
            return Err(BillingError::Validation("billing_reference is required".into()));
        }
        if new.monthly_rate <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "monthly_rate must be positive, got {}",
                new.monthly_rate
            )));
        }
        let email = new
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        let phone = if new.phone.trim().is_empty() {
            if email.is_none() {
                return Err(BillingError::Validation("a phone or an email is required".into()));
            }
            String::new()
        } else {
            normalize_phone(&new.phone, &self.config().payer.country_code).ok_or_else(|| {
                BillingError::Validation(format!("'{}' is not a phone number", new.phone))
            })?
        };

        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: new.tenant_id.clone(),
            full_name: full_name.to_string(),
            phone,
            email,
            billing_reference: billing_reference.to_string(),
            package_speed: new.package_speed.trim().to_string(),
            status: ClientStatus::Pending,
            wallet_balance: Decimal::ZERO,
            monthly_rate: new.monthly_rate,
            subscription_end_date: None,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.store.write(|l| {
            if l.find_client_by_billing_reference(&client.tenant_id, &client.billing_reference)?
                .is_some()
            {
                return Err(BillingError::Validation(format!(
                    "billing reference '{}' is already registered in tenant {}",
                    client.billing_reference, client.tenant_id
                )));
            }
            l.insert_client(&client)?;
            l.append_event(
                &BillingEvent::ClientRegistered {
                    client_id: client.id.clone(),
                    tenant_id: client.tenant_id.clone(),
                },
                now,
            )
        })?;
        log::info!(
            "engine: registered client={} tenant={} ref={}",
            client.id,
            client.tenant_id,
            client.billing_reference
        );
        Ok(client)
    }

    pub fn client(&self, client_id: &str) -> BillingResult<Client> {
        self.store.ledger().require_client(client_id)
    }

    pub fn statement(&self, client_id: &str) -> BillingResult<ClientStatement> {
        let ledger = self.store.ledger();
        Ok(ClientStatement {
            client: ledger.require_client(client_id)?,
            payments: ledger.payments_for_client(client_id)?,
            wallet: ledger.wallet_entries(client_id)?,
        })
    }

    pub fn history(&self, client_id: &str) -> BillingResult<Vec<EventLogEntry>> {
        self.store.ledger().events_for_client(client_id)
    }

    /// Fails unless the stored balance equals the fold of the wallet ledger.
    pub fn verify_wallet(&self, client_id: &str) -> BillingResult<Money> {
        let ledger = self.store.ledger();
        let client = ledger.require_client(client_id)?;
        let folded = ledger.wallet_fold(client_id)?;
        if folded != client.wallet_balance {
            return Err(BillingError::InvariantViolation(format!(
                "client {client_id} balance {} but ledger folds to {folded}",
                client.wallet_balance
            )));
        }
        Ok(folded)
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    pub fn approve(&self, client_id: &str, actor: &str) -> BillingResult<TransitionOutcome> {
        self.machine.approve(&self.store, client_id, actor, self.now())
    }

    pub fn reject(&self, client_id: &str, actor: &str, reason: &str) -> BillingResult<TransitionOutcome> {
        self.machine.reject(&self.store, client_id, actor, reason, self.now())
    }

    pub fn activate(&self, client_id: &str) -> BillingResult<TransitionOutcome> {
        self.machine.activate(&self.store, client_id, self.now())
    }

    pub fn suspend(&self, client_id: &str, actor: &str, reason: &str) -> BillingResult<TransitionOutcome> {
        self.machine.suspend(&self.store, client_id, actor, reason, self.now())
    }

    pub fn terminate(&self, client_id: &str, actor: &str) -> BillingResult<TransitionOutcome> {
        self.machine.terminate(&self.store, client_id, actor, self.now())
    }

    pub fn change_plan(
        &self,
        client_id: &str,
        monthly_rate: Option<Money>,
        package_speed: Option<String>,
    ) -> BillingResult<TransitionOutcome> {
        self.machine
            .change_plan(&self.store, client_id, monthly_rate, package_speed, self.now())
    }

    pub fn evaluate_expiry(&self, client_id: &str) -> BillingResult<TransitionOutcome> {
        self.machine.evaluate_expiry(&self.store, client_id, self.now())
    }

    // ── Payments ──────────────────────────────────────────────────

    pub fn reconcile(&self, callback: &GatewayCallback) -> BillingResult<ReconciliationResult> {
        self.reconciliation.reconcile(&self.store, callback, self.now())
    }

    pub fn callbacks(&self) -> CallbackHandler<'_> {
        CallbackHandler::new(self)
    }

    pub fn handle_callback(&self, tenant_id: &str, gateway: Gateway, raw_body: &str) -> CallbackAck {
        self.callbacks().handle(tenant_id, gateway, raw_body)
    }

    pub fn rematch(
        &self,
        gateway: Gateway,
        external_reference: &str,
        client_id: &str,
        actor: &str,
    ) -> BillingResult<ReconciliationResult> {
        self.reconciliation
            .rematch(&self.store, gateway, external_reference, client_id, actor, self.now())
    }

    // ── Scheduling ────────────────────────────────────────────────

    pub fn sweep(&self) -> SweepReport {
        self.scheduler.sweep(&self.store, self.now())
    }

    pub fn remediate(&self, triggered_by: TriggeredBy) -> BillingResult<Vec<(ClientId, NetworkActionKind)>> {
        self.machine.remediate(&self.store, triggered_by)
    }

    /// Block running sweeps until `shutdown` fires.
    pub fn run_scheduler(&self, shutdown: Receiver<()>) {
        self.scheduler.run(&self.store, self.clock.as_ref(), shutdown);
    }

    // ── Operators ─────────────────────────────────────────────────

    pub fn apply_command(&self, command: &AdminCommand) -> BillingResult<CommandOutcome> {
        log::debug!("engine: admin command {}", command.name());
        let outcome = match command {
            AdminCommand::Approve { client_id, actor } => self.approve(client_id, actor)?.into(),
            AdminCommand::Reject {
                client_id,
                actor,
                reason,
            } => self.reject(client_id, actor, reason)?.into(),
            AdminCommand::Activate { client_id } => self.activate(client_id)?.into(),
            AdminCommand::Suspend {
                client_id,
                actor,
                reason,
            } => self.suspend(client_id, actor, reason)?.into(),
            AdminCommand::Terminate { client_id, actor } => self.terminate(client_id, actor)?.into(),
            AdminCommand::ChangePlan {
                client_id,
                monthly_rate,
                package_speed,
            } => self
                .change_plan(client_id, *monthly_rate, package_speed.clone())?
                .into(),
            AdminCommand::Rematch {
                gateway,
                external_reference,
                client_id,
                actor,
            } => CommandOutcome::Payment {
                result: self.rematch(*gateway, external_reference, client_id, actor)?,
            },
            AdminCommand::Remediate => CommandOutcome::Remediated {
                reissued: self.remediate(TriggeredBy::Manual)?,
            },
        };
        Ok(outcome)
    }

    pub fn audit(&self) -> BillingResult<AuditView> {
        let ledger = self.store.ledger();
        Ok(AuditView {
            unmatched_payments: ledger.payments_with_status(PaymentStatus::Unmatched)?,
            failed_payments: ledger.payments_with_status(PaymentStatus::Failed)?,
            failed_network_actions: ledger.unresolved_failed_actions()?,
        })
    }
}
