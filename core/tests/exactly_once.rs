//! Exactly-once crediting per (gateway, external_reference).

mod common;

use common::*;
use netbill_core::{
    clock::{Clock, ManualClock},
    config::PortalConfig,
    engine::BillingEngine,
    network::{InMemoryNas, NetworkAccess},
    notify::{Notifier, RecordingNotifier},
    reconciliation::{GatewayCallback, ReconciliationResult},
    store::LedgerStore,
    types::{Gateway, PaymentStatus, TxKind},
};
use rust_decimal::Decimal;
use std::sync::Arc;

#[test]
fn repeated_delivery_credits_once() {
    let rig = rig("exactly-once-repeat");
    let client = register(&rig, "ACC-100", "0711000100");

    let first = pay(&rig, Gateway::MobileMoneyBill, paybill("RKT100", "ACC-100", 500));
    assert!(matches!(first, ReconciliationResult::Applied { .. }));

    for _ in 0..4 {
        let again = pay(&rig, Gateway::MobileMoneyBill, paybill("RKT100", "ACC-100", 500));
        assert!(
            matches!(again, ReconciliationResult::Duplicate { ref payment_id, .. } if payment_id == first.payment_id()),
            "got {again:?}"
        );
    }

    let ledger = rig.engine.store.ledger();
    assert_eq!(
        ledger
            .payment_count(Gateway::MobileMoneyBill, "RKT100", PaymentStatus::Applied)
            .unwrap(),
        1
    );
    assert_eq!(ledger.wallet_entry_count(&client.id, TxKind::Credit).unwrap(), 1);
    assert_eq!(rig.engine.client(&client.id).unwrap().wallet_balance, Decimal::from(500));
    assert_eq!(rig.engine.verify_wallet(&client.id).unwrap(), Decimal::from(500));
}

#[test]
fn duplicate_delivery_leaves_balance_as_first_delivery_left_it() {
    let rig = rig("exactly-once-balance");
    let client = active_client(&rig, "ACC-101", "0711000101");

    pay(&rig, Gateway::MobileMoneyBill, paybill("RKT101", "ACC-101", 300));
    let after_first = rig.engine.client(&client.id).unwrap();

    let second = pay(&rig, Gateway::MobileMoneyBill, paybill("RKT101", "ACC-101", 300));
    assert!(matches!(second, ReconciliationResult::Duplicate { .. }));

    let after_second = rig.engine.client(&client.id).unwrap();
    assert_eq!(after_second.wallet_balance, after_first.wallet_balance);
    assert_eq!(after_second.subscription_end_date, after_first.subscription_end_date);
}

#[test]
fn same_reference_on_different_gateways_are_distinct_payments() {
    let rig = rig("exactly-once-gateways");
    let client = register(&rig, "ACC-102", "0711000102");

    pay(&rig, Gateway::MobileMoneyBill, paybill("REF-1", "ACC-102", 100));
    let bank = serde_json::json!({
        "TransactionReferenceCode": "REF-1",
        "TransactionAmount": 200,
        "BillNumber": "ACC-102"
    });
    let result = pay(&rig, Gateway::BankBill, bank);
    assert!(matches!(result, ReconciliationResult::Applied { .. }));
    assert_eq!(rig.engine.client(&client.id).unwrap().wallet_balance, Decimal::from(300));
}

#[test]
fn redelivery_with_a_different_amount_uses_the_recorded_amount() {
    let rig = rig("exactly-once-amount");
    let client = register(&rig, "ACC-103", "0711000103");

    // First delivery cannot be matched, so the payment stays open.
    pay(&rig, Gateway::MobileMoneyBill, paybill("RKT103", "NOBODY", 400));
    let held = rig
        .engine
        .store
        .ledger()
        .payment(Gateway::MobileMoneyBill, "RKT103")
        .unwrap()
        .unwrap();
    assert_eq!(held.status, PaymentStatus::Unmatched);

    // Redelivery names the right account and a different amount.
    let result = pay(&rig, Gateway::MobileMoneyBill, paybill("RKT103", "ACC-103", 9999));
    match result {
        ReconciliationResult::Applied { amount, client_id, .. } => {
            assert_eq!(amount, Decimal::from(400));
            assert_eq!(client_id, client.id);
        }
        other => panic!("expected applied, got {other:?}"),
    }
}

#[test]
fn concurrent_deliveries_from_many_connections_credit_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::temp_dir().join(format!("netbill-concurrent-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();

    let nas: Arc<dyn NetworkAccess> = Arc::new(InMemoryNas::new());
    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
    let engine = BillingEngine::build_inline(
        LedgerStore::open(&path).unwrap(),
        PortalConfig::default_test(),
        nas,
        notifier,
        clock,
    )
    .unwrap();
    let client = engine.register_client(new_client("ACC-200", "0711000200")).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.fork().unwrap();
            std::thread::spawn(move || {
                let callback = GatewayCallback {
                    tenant_id: TENANT.into(),
                    gateway: Gateway::MobileMoneyBill,
                    body: paybill("RKT200", "ACC-200", 750),
                };
                engine.reconcile(&callback).unwrap()
            })
        })
        .collect();
    let results: Vec<ReconciliationResult> =
        workers.into_iter().map(|w| w.join().unwrap()).collect();

    let applied = results
        .iter()
        .filter(|r| matches!(r, ReconciliationResult::Applied { .. }))
        .count();
    assert_eq!(applied, 1, "results: {results:?}");
    assert!(results
        .iter()
        .all(|r| matches!(r, ReconciliationResult::Applied { .. } | ReconciliationResult::Duplicate { .. })));

    let ledger = engine.store.ledger();
    assert_eq!(ledger.wallet_entry_count(&client.id, TxKind::Credit).unwrap(), 1);
    assert_eq!(engine.client(&client.id).unwrap().wallet_balance, Decimal::from(750));
    assert_eq!(engine.verify_wallet(&client.id).unwrap(), Decimal::from(750));

    drop(engine);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }
}
