//! Post-commit side effects: network commands and notifications.
//!
//! Effects are produced by committed transitions and handed to an
//! `EffectSink`. `InlineSink` runs them on the caller's thread.
//! `OutboundQueue` runs them on a worker pool so callback acknowledgement
//! never waits on a slow NAS. Effects for one client always land on the
//! same worker, so a reconnect queued after a disconnect runs after it.

use crate::{
    clock::Clock,
    config::PortalConfig,
    error::BillingResult,
    network::{ActionExecutor, NetworkAccess, NetworkCommand, RetryPolicy},
    notify::{Notification, Notifier},
    store::LedgerStore,
    types::{ClientId, NetworkActionKind, TriggeredBy},
};
use crossbeam_channel::{unbounded, Sender};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Network {
        client_id: ClientId,
        command: NetworkCommand,
        triggered_by: TriggeredBy,
    },
    Notify(Notification),
}

impl Effect {
    pub fn client_id(&self) -> &str {
        match self {
            Self::Network { client_id, .. } => client_id,
            Self::Notify(n) => &n.client_id,
        }
    }
}

pub trait EffectSink: Send + Sync {
    fn dispatch(&self, effect: Effect);

    fn dispatch_all(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.dispatch(effect);
        }
    }
}

/// Executes effects. One runner per thread; it owns a store connection.
pub struct EffectRunner {
    executor: ActionExecutor,
    notifier: Arc<dyn Notifier>,
    notify_retry: RetryPolicy,
}

impl EffectRunner {
    pub fn new(
        config: &PortalConfig,
        store: LedgerStore,
        nas: Arc<dyn NetworkAccess>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut notify_retry = RetryPolicy::from_config(&config.network);
        notify_retry.max_attempts = config.outbound.notify_attempts.max(1);
        Self {
            executor: ActionExecutor::new(nas, store, clock, &config.network),
            notifier,
            notify_retry,
        }
    }

    pub fn run(&self, effect: &Effect) {
        match effect {
            Effect::Network {
                client_id,
                command,
                triggered_by,
            } => {
                if let Err(e) = self.executor.run(client_id, command, *triggered_by) {
                    log::error!(
                        "outbound: could not record {} for client={client_id}: {e}",
                        command.kind()
                    );
                }
            }
            Effect::Notify(notification) => self.notify(notification),
        }
    }

    fn notify(&self, n: &Notification) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.notifier.send(n) {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < self.notify_retry.max_attempts => {
                    std::thread::sleep(self.notify_retry.backoff(attempt));
                }
                Err(e) => {
                    log::warn!(
                        "outbound: dropped notification for client={} after {attempt} attempt(s): {e}",
                        n.client_id
                    );
                    return;
                }
            }
        }
    }
}

/// Runs every effect synchronously before `dispatch` returns.
pub struct InlineSink {
    runner: Mutex<EffectRunner>,
}

impl InlineSink {
    pub fn new(runner: EffectRunner) -> Self {
        Self {
            runner: Mutex::new(runner),
        }
    }
}

impl EffectSink for InlineSink {
    fn dispatch(&self, effect: Effect) {
        let runner = self.runner.lock().unwrap_or_else(|p| p.into_inner());
        runner.run(&effect);
    }
}

/// Per client: the last connect/disconnect queued and its sequence number.
type InFlight = Arc<Mutex<HashMap<ClientId, (NetworkActionKind, u64)>>>;

struct Queued {
    effect: Effect,
    seq: Option<u64>,
}

/// Worker pool for effects. Dropping the queue drains it and joins workers.
pub struct OutboundQueue {
    lanes: Vec<Sender<Queued>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: InFlight,
    next_seq: AtomicU64,
}

impl OutboundQueue {
    /// Start `workers` threads; `make_runner` is called once per thread.
    pub fn start(
        workers: usize,
        make_runner: impl Fn() -> BillingResult<EffectRunner>,
    ) -> BillingResult<Self> {
        let in_flight: InFlight = Arc::default();
        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for lane in 0..workers.max(1) {
            let runner = make_runner()?;
            let (tx, rx) = unbounded::<Queued>();
            let in_flight = Arc::clone(&in_flight);
            let handle = std::thread::Builder::new()
                .name(format!("outbound-{lane}"))
                .spawn(move || {
                    while let Ok(queued) = rx.recv() {
                        runner.run(&queued.effect);
                        if let Some(seq) = queued.seq {
                            let mut in_flight = in_flight.lock().unwrap_or_else(|p| p.into_inner());
                            let client_id = queued.effect.client_id();
                            if in_flight.get(client_id).map(|(_, s)| *s) == Some(seq) {
                                in_flight.remove(client_id);
                            }
                        }
                    }
                    log::debug!("outbound: lane {lane} drained");
                })
                .map_err(|e| anyhow::anyhow!("cannot spawn outbound worker: {e}"))?;
            lanes.push(tx);
            handles.push(handle);
        }

        log::info!("outbound: started {} worker(s)", lanes.len());
        Ok(Self {
            lanes,
            workers: handles,
            in_flight,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Clients with a connect/disconnect queued or running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Stop accepting work, finish what is queued, and join the workers.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.lanes.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("outbound: worker panicked");
            }
        }
    }

    fn lane_for(&self, client_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        client_id.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }
}

impl EffectSink for OutboundQueue {
    fn dispatch(&self, effect: Effect) {
        if self.lanes.is_empty() {
            log::error!("outbound: queue closed, dropping effect for client={}", effect.client_id());
            return;
        }
        let lane = self.lane_for(effect.client_id());

        // The lock is held across the send so the tail recorded here is
        // the tail of the lane.
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        let seq = match state_command(&effect) {
            Some(kind) => {
                let client_id = effect.client_id().to_string();
                if in_flight.get(&client_id).map(|(k, _)| *k) == Some(kind) {
                    log::debug!("outbound: {kind} for client={client_id} already queued");
                    return;
                }
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                in_flight.insert(client_id, (kind, seq));
                Some(seq)
            }
            None => None,
        };
        if let Err(e) = self.lanes[lane].send(Queued { effect, seq }) {
            log::error!("outbound: lane {lane} closed: {e}");
        }
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect/disconnect commands carry no payload, so one identical to the
/// last queued for the same client is redundant.
fn state_command(effect: &Effect) -> Option<NetworkActionKind> {
    match effect {
        Effect::Network { command, .. }
            if !matches!(command, NetworkCommand::UpdateBandwidth { .. }) =>
        {
            Some(command.kind())
        }
        _ => None,
    }
}
