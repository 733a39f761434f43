//! Post-commit effect delivery: worker pool ordering, dedup, draining,
//! and notification retries.

mod common;

use common::*;
use crossbeam_channel::{unbounded, Receiver, Sender};
use netbill_core::{
    clock::{Clock, ManualClock},
    config::PortalConfig,
    network::{BandwidthLimits, CommandOutcome, InMemoryNas, NetworkAccess, NetworkCommand, NetworkError},
    notify::{NoticeKind, Notification, Notifier, RecordingNotifier},
    outbound::{Effect, EffectRunner, EffectSink, InlineSink, OutboundQueue},
    store::LedgerStore,
    types::{NetworkActionKind, TriggeredBy},
};
use std::sync::Arc;
use std::time::Duration;

/// Holds every call until the test hands out a permit.
struct GatedNas {
    inner: InMemoryNas,
    permits: Receiver<()>,
}

impl GatedNas {
    fn new() -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = unbounded();
        let nas = Arc::new(Self {
            inner: InMemoryNas::new(),
            permits: rx,
        });
        (nas, tx)
    }

    fn wait(&self) -> Result<(), NetworkError> {
        self.permits
            .recv()
            .map_err(|_| NetworkError::Unreachable("gate closed".into()))
    }
}

impl NetworkAccess for GatedNas {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn disconnect(&self, client_id: &str, timeout: Duration) -> Result<CommandOutcome, NetworkError> {
        self.wait()?;
        self.inner.disconnect(client_id, timeout)
    }

    fn reconnect(&self, client_id: &str, timeout: Duration) -> Result<CommandOutcome, NetworkError> {
        self.wait()?;
        self.inner.reconnect(client_id, timeout)
    }

    fn update_bandwidth(
        &self,
        client_id: &str,
        limits: &BandwidthLimits,
        timeout: Duration,
    ) -> Result<CommandOutcome, NetworkError> {
        self.wait()?;
        self.inner.update_bandwidth(client_id, limits, timeout)
    }
}

fn store(name: &str) -> LedgerStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = LedgerStore::shared_memory(&format!("{name}-{}", uuid::Uuid::new_v4())).unwrap();
    store.migrate().unwrap();
    store
}

fn queue(
    store: &LedgerStore,
    nas: Arc<dyn NetworkAccess>,
    notifier: Arc<dyn Notifier>,
) -> OutboundQueue {
    let config = PortalConfig::default_test();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
    OutboundQueue::start(config.outbound.workers, || {
        Ok(EffectRunner::new(
            &config,
            store.reopen()?,
            Arc::clone(&nas),
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ))
    })
    .unwrap()
}

fn network(client_id: &str, command: NetworkCommand) -> Effect {
    Effect::Network {
        client_id: client_id.into(),
        command,
        triggered_by: TriggeredBy::Scheduler,
    }
}

#[test]
fn repeated_command_behind_a_queued_one_is_dropped() {
    let store = store("outbound-dedup");
    let (nas, permits) = GatedNas::new();
    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());
    let q = queue(&store, Arc::clone(&nas) as Arc<dyn NetworkAccess>, notifier);

    q.dispatch(network("c-1", NetworkCommand::Disconnect));
    q.dispatch(network("c-1", NetworkCommand::Disconnect));
    assert_eq!(q.in_flight(), 1);
    q.dispatch(network("c-1", NetworkCommand::Reconnect));
    q.dispatch(network("c-1", NetworkCommand::Disconnect));

    for _ in 0..3 {
        permits.send(()).unwrap();
    }
    q.shutdown();

    assert_eq!(nas.inner.calls(), 3);
    let kinds: Vec<_> = store
        .ledger()
        .network_actions_for("c-1")
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect();
    assert_eq!(
        kinds,
        vec![
            NetworkActionKind::Disconnect,
            NetworkActionKind::Reconnect,
            NetworkActionKind::Disconnect
        ]
    );
    assert!(!nas.inner.is_connected("c-1"));
}

#[test]
fn shutdown_drains_every_lane_in_per_client_order() {
    let store = store("outbound-drain");
    let nas = Arc::new(InMemoryNas::new());
    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());
    let q = queue(&store, Arc::clone(&nas) as Arc<dyn NetworkAccess>, notifier);

    let clients: Vec<String> = (0..12).map(|i| format!("c-{i}")).collect();
    for id in &clients {
        q.dispatch(network(id, NetworkCommand::Reconnect));
        q.dispatch(network(
            id,
            NetworkCommand::UpdateBandwidth {
                limits: BandwidthLimits::symmetric(10_000),
            },
        ));
        q.dispatch(network(id, NetworkCommand::Disconnect));
    }
    q.shutdown();

    let ledger = store.ledger();
    for id in &clients {
        let kinds: Vec<_> = ledger
            .network_actions_for(id)
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NetworkActionKind::Reconnect,
                NetworkActionKind::UpdateBandwidth,
                NetworkActionKind::Disconnect
            ],
            "client {id}"
        );
        assert!(!nas.is_connected(id));
    }
}

#[test]
fn transient_notification_failures_are_retried() {
    let store = store("outbound-notify");
    let notifier = Arc::new(RecordingNotifier::new());
    let config = PortalConfig::default_test();
    let runner = EffectRunner::new(
        &config,
        store.reopen().unwrap(),
        Arc::new(InMemoryNas::new()),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        Arc::new(ManualClock::new(start())),
    );
    let sink = InlineSink::new(runner);

    let notice = |client: &str| {
        Effect::Notify(Notification {
            client_id: client.into(),
            channel: netbill_core::notify::Channel::Sms,
            recipient: "254711000800".into(),
            kind: NoticeKind::Terminated,
        })
    };

    notifier.fail_next(config.outbound.notify_attempts as usize - 1);
    sink.dispatch(notice("c-800"));
    assert_eq!(notifier.sent_to("c-800").len(), 1);

    notifier.fail_next(config.outbound.notify_attempts as usize);
    sink.dispatch(notice("c-801"));
    assert!(notifier.sent_to("c-801").is_empty());
}
