//! Renewal scheduler sweeps: suspension, reminders, renewal at expiry.

mod common;

use chrono::Duration;
use common::*;
use netbill_core::{
    notify::NoticeKind,
    types::{ClientStatus, Gateway, NetworkActionKind, TriggeredBy, TxKind},
};
use rust_decimal::Decimal;

#[test]
fn lapsed_client_without_funds_is_suspended_once() {
    let rig = rig("sweep-lapsed");
    let client = active_client(&rig, "ACC-400", "0711000400");

    // End date was yesterday.
    rig.clock.advance(Duration::days(31));
    let report = rig.engine.sweep();
    assert_eq!(report.suspended, vec![client.id.clone()]);
    assert!(report.failures.is_empty());

    let after = rig.engine.client(&client.id).unwrap();
    assert_eq!(after.status, ClientStatus::Suspended);

    let ledger = rig.engine.store.ledger();
    let last = ledger.latest_network_action(&client.id).unwrap().unwrap();
    assert_eq!(last.action, NetworkActionKind::Disconnect);
    assert_eq!(last.triggered_by, TriggeredBy::Scheduler);
    assert!(last.success);

    // Further sweeps find it already suspended and leave it alone.
    rig.clock.advance(Duration::hours(1));
    let again = rig.engine.sweep();
    assert!(again.suspended.is_empty());
    assert_eq!(again.unchanged, 1);
    let disconnects = actions(&rig, &client.id)
        .into_iter()
        .filter(|a| *a == NetworkActionKind::Disconnect)
        .count();
    assert_eq!(disconnects, 1);
}

#[test]
fn every_expired_short_client_ends_suspended_with_disconnect_last() {
    let rig = rig("sweep-all-expired");
    let short: Vec<_> = (0..5)
        .map(|i| active_client(&rig, &format!("ACC-41{i}"), &format!("07110004{i:02}")))
        .collect();
    let funded = active_client(&rig, "ACC-419", "0711000419");

    // Part-payments that stay below one period.
    for (i, c) in short.iter().enumerate() {
        pay(
            &rig,
            Gateway::MobileMoneyBill,
            paybill(&format!("RKT41{i}"), &c.billing_reference, 100 * (i as i64 + 1)),
        );
    }
    pay(&rig, Gateway::MobileMoneyBill, paybill("RKT419", "ACC-419", 1000));

    rig.clock.advance(Duration::days(30) + Duration::minutes(5));
    let report = rig.engine.sweep();
    assert_eq!(report.suspended.len(), 5);
    assert_eq!(report.renewed, vec![funded.id.clone()]);

    for c in &short {
        let after = rig.engine.client(&c.id).unwrap();
        assert_eq!(after.status, ClientStatus::Suspended);
        let last = rig
            .engine
            .store
            .ledger()
            .latest_network_action(&c.id)
            .unwrap()
            .unwrap();
        assert_eq!(last.action, NetworkActionKind::Disconnect);
    }
    let funded_after = rig.engine.client(&funded.id).unwrap();
    assert_eq!(funded_after.status, ClientStatus::Active);
    assert_eq!(funded_after.wallet_balance, Decimal::ZERO);
}

#[test]
fn expiry_with_enough_balance_renews_instead_of_suspending() {
    let rig = rig("sweep-renews");
    let client = active_client(&rig, "ACC-420", "0711000420");
    rig.clock.advance(Duration::days(10));
    pay(&rig, Gateway::MobileMoneyBill, paybill("RKT420", "ACC-420", 1500));

    rig.clock.advance(Duration::days(20));
    let now = rig.engine.now();
    let report = rig.engine.sweep();
    assert_eq!(report.renewed, vec![client.id.clone()]);

    let after = rig.engine.client(&client.id).unwrap();
    assert_eq!(after.status, ClientStatus::Active);
    assert_eq!(after.wallet_balance, Decimal::from(500));
    assert_eq!(after.subscription_end_date, Some(now + Duration::days(30)));
    let ledger = rig.engine.store.ledger();
    assert_eq!(ledger.wallet_entry_count(&client.id, TxKind::Debit).unwrap(), 1);
}

#[test]
fn reminders_are_sent_at_most_once_per_day() {
    let rig = rig("sweep-reminders");
    let client = active_client(&rig, "ACC-430", "0711000430");

    // Three days out.
    rig.clock.advance(Duration::days(27));
    for _ in 0..6 {
        rig.engine.sweep();
        rig.clock.advance(Duration::minutes(30));
    }
    let reminders = |rig: &netbill_core::TestRig| {
        rig.notifier
            .sent_to(&client.id)
            .into_iter()
            .filter_map(|n| match n.kind {
                NoticeKind::ExpiryReminder { days_left, .. } => Some(days_left),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(reminders(&rig), vec![3]);

    // Next calendar day brings the two-day reminder, once.
    rig.clock.advance(Duration::days(1));
    rig.engine.sweep();
    rig.engine.sweep();
    assert_eq!(reminders(&rig), vec![3, 2]);
    assert_eq!(rig.engine.store.ledger().reminder_count(&client.id).unwrap(), 2);
}

#[test]
fn no_reminder_outside_configured_days() {
    let rig = rig("sweep-no-reminder");
    let client = active_client(&rig, "ACC-440", "0711000440");

    rig.clock.advance(Duration::days(20));
    let report = rig.engine.sweep();
    assert!(report.reminded.is_empty());
    assert_eq!(rig.engine.store.ledger().reminder_count(&client.id).unwrap(), 0);
}

#[test]
fn operator_suspended_client_still_hears_about_expiry() {
    let rig = rig("sweep-suspended-reminder");
    let client = active_client(&rig, "ACC-441", "0711000441");
    rig.engine.suspend(&client.id, "ops@isp", "abuse report").unwrap();

    // Two days out.
    rig.clock.advance(Duration::days(28));
    let report = rig.engine.sweep();
    assert_eq!(report.reminded, vec![client.id.clone()]);
    assert!(rig.notifier.sent_to(&client.id).iter().any(|n| matches!(
        n.kind,
        NoticeKind::ExpiryReminder { days_left: 2, .. }
    )));
    assert_eq!(rig.engine.client(&client.id).unwrap().status, ClientStatus::Suspended);
}

#[test]
fn pending_and_terminated_clients_are_not_swept() {
    let rig = rig("sweep-scope");
    register(&rig, "ACC-450", "0711000450");
    let gone = active_client(&rig, "ACC-451", "0711000451");
    rig.engine.terminate(&gone.id, "ops@isp").unwrap();

    rig.clock.advance(Duration::days(40));
    let report = rig.engine.sweep();
    assert_eq!(report.evaluated, 0);
}
