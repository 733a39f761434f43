//! Network commands: idempotency, retries, audit rows and remediation.

mod common;

use chrono::Duration;
use common::*;
use netbill_core::{
    clock::{Clock, ManualClock},
    config::PortalConfig,
    network::{ActionExecutor, InMemoryNas, NetworkAccess, NetworkCommand, NetworkError},
    store::LedgerStore,
    types::{ClientStatus, NetworkActionKind, TriggeredBy},
};
use std::sync::Arc;

struct Harness {
    reader: LedgerStore,
    executor: ActionExecutor,
    nas: Arc<InMemoryNas>,
}

fn harness(name: &str) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let uri = format!("{name}-{}", uuid::Uuid::new_v4());
    let reader = LedgerStore::shared_memory(&uri).unwrap();
    reader.migrate().unwrap();
    let nas = Arc::new(InMemoryNas::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
    let executor = ActionExecutor::new(
        Arc::clone(&nas) as Arc<dyn NetworkAccess>,
        reader.reopen().unwrap(),
        clock,
        &PortalConfig::default_test().network,
    );
    Harness {
        reader,
        executor,
        nas,
    }
}

#[test]
fn disconnecting_twice_changes_state_once_and_records_two_successes() {
    let h = harness("net-idempotent");
    h.executor
        .run("c-1", &NetworkCommand::Reconnect, TriggeredBy::Manual)
        .unwrap();
    let before = h.nas.state_changes("c-1");

    let first = h
        .executor
        .run("c-1", &NetworkCommand::Disconnect, TriggeredBy::Scheduler)
        .unwrap();
    let second = h
        .executor
        .run("c-1", &NetworkCommand::Disconnect, TriggeredBy::Scheduler)
        .unwrap();

    assert!(first.success && second.success);
    assert_eq!(h.nas.state_changes("c-1") - before, 1);
    assert!(!h.nas.is_connected("c-1"));

    let rows = h.reader.ledger().network_actions_for("c-1").unwrap();
    let disconnects: Vec<_> = rows
        .iter()
        .filter(|r| r.action == NetworkActionKind::Disconnect)
        .collect();
    assert_eq!(disconnects.len(), 2);
    assert!(disconnects.iter().all(|r| r.success && r.attempts == 1));
}

#[test]
fn transient_failures_are_retried_within_budget() {
    let h = harness("net-retry");
    h.nas.fail_next("c-2", NetworkError::Timeout { after_ms: 1000 }, 2);

    let row = h
        .executor
        .run("c-2", &NetworkCommand::Reconnect, TriggeredBy::Webhook)
        .unwrap();
    assert!(row.success);
    assert_eq!(row.attempts, 3);
    assert!(h.nas.is_connected("c-2"));
}

#[test]
fn exhausted_or_rejected_commands_leave_a_failed_row() {
    let h = harness("net-give-up");
    h.nas.set_offline(true);
    let row = h
        .executor
        .run("c-3", &NetworkCommand::Reconnect, TriggeredBy::Webhook)
        .unwrap();
    assert!(!row.success);
    assert_eq!(row.attempts, PortalConfig::default_test().network.max_attempts);
    assert!(row.error_message.as_deref().unwrap_or("").contains("unreachable"));

    h.nas.set_offline(false);
    h.nas
        .fail_next("c-3", NetworkError::Rejected("unknown user".into()), 1);
    let row = h
        .executor
        .run("c-3", &NetworkCommand::Disconnect, TriggeredBy::Manual)
        .unwrap();
    assert!(!row.success);
    assert_eq!(row.attempts, 1, "permanent errors are not retried");

    let failed = h.reader.ledger().unresolved_failed_actions().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].action, NetworkActionKind::Disconnect);
}

#[test]
fn slow_nas_times_out_at_each_attempt_deadline() {
    let h = harness("net-slow");
    let mut config = PortalConfig::default_test().network;
    config.max_attempts = 2;
    config.initial_backoff_ms = 1;
    config.max_backoff_ms = 1;
    config.call_timeout_ms = 20;
    let executor = ActionExecutor::new(
        Arc::clone(&h.nas) as Arc<dyn NetworkAccess>,
        h.reader.reopen().unwrap(),
        Arc::new(ManualClock::new(start())),
        &config,
    );

    h.nas.set_latency(std::time::Duration::from_secs(30));
    let started = std::time::Instant::now();
    let row = executor
        .run("c-4", &NetworkCommand::Reconnect, TriggeredBy::Scheduler)
        .unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert!(!row.success);
    assert_eq!(row.attempts, 2, "timeouts are retried");
    assert!(row.error_message.as_deref().unwrap_or("").contains("timed out after 20 ms"));
    assert!(!h.nas.is_connected("c-4"));

    h.nas.set_latency(std::time::Duration::from_millis(5));
    let row = executor
        .run("c-4", &NetworkCommand::Reconnect, TriggeredBy::Scheduler)
        .unwrap();
    assert!(row.success);
    assert!(h.nas.is_connected("c-4"));
}

#[test]
fn activation_pushes_normalised_package_speed() {
    let rig = rig("net-speed");
    let mut new = new_client("ACC-500", "0711000500");
    new.package_speed = "5M/2M".into();
    let client = rig.engine.register_client(new).unwrap();
    rig.engine.approve(&client.id, "ops@isp").unwrap();
    rig.engine.activate(&client.id).unwrap();

    let account = rig.nas.account(&client.id).unwrap();
    assert!(account.connected);
    let limits = account.limits.unwrap();
    assert_eq!((limits.download_kbps, limits.upload_kbps), (5_000, 2_000));
    assert!(!limits.fallback);
}

#[test]
fn unparseable_speed_falls_back_instead_of_zero() {
    let rig = rig("net-fallback");
    let client = active_client(&rig, "ACC-501", "0711000501");
    rig.engine
        .change_plan(&client.id, None, Some("unlimited".into()))
        .unwrap();

    let limits = rig.nas.account(&client.id).unwrap().limits.unwrap();
    let fallback = rig.engine.config().network.fallback_speed_kbps;
    assert!(limits.fallback);
    assert_eq!(limits.download_kbps, fallback);
    assert!(limits.download_kbps > 0);
}

#[test]
fn failed_disconnect_does_not_undo_suspension_and_is_remediated() {
    let rig = rig("net-remediate");
    let client = active_client(&rig, "ACC-502", "0711000502");

    rig.nas.set_offline(true);
    rig.clock.advance(Duration::days(31));
    let report = rig.engine.sweep();
    assert_eq!(report.suspended, vec![client.id.clone()]);
    // Remediation at the end of the sweep also fails while the NAS is down.
    assert_eq!(report.remediated, vec![(client.id.clone(), NetworkActionKind::Disconnect)]);

    assert_eq!(rig.engine.client(&client.id).unwrap().status, ClientStatus::Suspended);
    assert!(rig.nas.is_connected(&client.id), "billing moved on, access lags");
    let audit = rig.engine.audit().unwrap();
    assert_eq!(audit.failed_network_actions.len(), 1);

    rig.nas.set_offline(false);
    let report = rig.engine.sweep();
    assert_eq!(report.remediated, vec![(client.id.clone(), NetworkActionKind::Disconnect)]);
    assert!(!rig.nas.is_connected(&client.id));
    assert!(rig.engine.audit().unwrap().failed_network_actions.is_empty());
}

#[test]
fn failed_reconnect_is_reissued_after_a_later_bandwidth_push_succeeds() {
    let rig = rig("net-remediate-active");
    let client = register(&rig, "ACC-503", "0711000503");
    rig.engine.approve(&client.id, "ops@isp").unwrap();

    rig.nas.fail_next(&client.id, NetworkError::Rejected("nas busy".into()), 1);
    rig.engine.activate(&client.id).unwrap();
    // The reconnect failed; the bandwidth push after it succeeded.
    assert!(!rig.nas.is_connected(&client.id));
    assert_eq!(
        actions(&rig, &client.id),
        vec![NetworkActionKind::Reconnect, NetworkActionKind::UpdateBandwidth]
    );
    let audit = rig.engine.audit().unwrap();
    assert_eq!(audit.failed_network_actions.len(), 1);
    assert_eq!(audit.failed_network_actions[0].action, NetworkActionKind::Reconnect);

    let report = rig.engine.sweep();
    assert_eq!(report.remediated, vec![(client.id.clone(), NetworkActionKind::Reconnect)]);
    assert!(rig.nas.is_connected(&client.id));
    assert!(rig.engine.audit().unwrap().failed_network_actions.is_empty());
    assert!(rig.engine.remediate(TriggeredBy::Manual).unwrap().is_empty());

    rig.nas.fail_next(&client.id, NetworkError::Rejected("nas busy".into()), 1);
    rig.engine
        .change_plan(&client.id, None, Some("20Mbps".into()))
        .unwrap();
    let reissued = rig.engine.remediate(TriggeredBy::Manual).unwrap();
    assert_eq!(reissued, vec![(client.id.clone(), NetworkActionKind::UpdateBandwidth)]);
    let limits = rig.nas.account(&client.id).unwrap().limits.unwrap();
    assert_eq!(limits.download_kbps, 20_000);
    assert!(rig.nas.is_connected(&client.id));
}
