//! In-process NAS used by the runner's dry-run mode and by tests.
//! Tracks per-account connectivity and can be scripted to fail or to
//! answer slowly.

use super::{BandwidthLimits, CommandOutcome, NetworkAccess, NetworkError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NasAccount {
    pub connected: bool,
    pub limits: Option<BandwidthLimits>,
    /// Number of commands that actually changed this account.
    pub state_changes: u32,
}

#[derive(Debug, Default)]
pub struct InMemoryNas {
    accounts: Mutex<HashMap<String, NasAccount>>,
    scripted_failures: Mutex<HashMap<String, VecDeque<NetworkError>>>,
    offline: AtomicBool,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
}

impl InMemoryNas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls for `client_id` fail with `error`.
    pub fn fail_next(&self, client_id: &str, error: NetworkError, times: usize) {
        let mut failures = self.scripted_failures.lock().unwrap_or_else(|p| p.into_inner());
        let queue = failures.entry(client_id.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// While offline every call fails with `Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every answer by `latency`. A call whose timeout is shorter
    /// gives up at its deadline with `Timeout`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    pub fn account(&self, client_id: &str) -> Option<NasAccount> {
        self.lock_accounts().get(client_id).cloned()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.account(client_id).map_or(false, |a| a.connected)
    }

    pub fn state_changes(&self, client_id: &str) -> u32 {
        self.account(client_id).map_or(0, |a| a.state_changes)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock_accounts(&self) -> std::sync::MutexGuard<'_, HashMap<String, NasAccount>> {
        self.accounts.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn precheck(&self, client_id: &str, timeout: Duration) -> Result<(), NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if latency > timeout {
            std::thread::sleep(timeout);
            return Err(NetworkError::Timeout {
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::Unreachable("nas offline".into()));
        }
        let mut failures = self.scripted_failures.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(err) = failures.get_mut(client_id).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }

    fn set_connected(&self, client_id: &str, connected: bool) -> CommandOutcome {
        let mut accounts = self.lock_accounts();
        match accounts.get_mut(client_id) {
            Some(account) if account.connected == connected => CommandOutcome::AlreadyInState,
            Some(account) => {
                account.connected = connected;
                account.state_changes += 1;
                CommandOutcome::Changed
            }
            // Nothing provisioned means nothing to revoke.
            None if !connected => CommandOutcome::AlreadyInState,
            None => {
                accounts.insert(
                    client_id.to_string(),
                    NasAccount {
                        connected: true,
                        limits: None,
                        state_changes: 1,
                    },
                );
                CommandOutcome::Changed
            }
        }
    }
}

impl NetworkAccess for InMemoryNas {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    fn disconnect(&self, client_id: &str, timeout: Duration)
        -> Result<CommandOutcome, NetworkError> {
        self.precheck(client_id, timeout)?;
        Ok(self.set_connected(client_id, false))
    }

    fn reconnect(&self, client_id: &str, timeout: Duration)
        -> Result<CommandOutcome, NetworkError> {
        self.precheck(client_id, timeout)?;
        Ok(self.set_connected(client_id, true))
    }

    fn update_bandwidth(
        &self,
        client_id: &str,
        limits: &BandwidthLimits,
        timeout: Duration,
    ) -> Result<CommandOutcome, NetworkError> {
        self.precheck(client_id, timeout)?;
        let mut accounts = self.lock_accounts();
        let account = accounts.entry(client_id.to_string()).or_default();
        if account.limits.as_ref() == Some(limits) {
            return Ok(CommandOutcome::AlreadyInState);
        }
        account.limits = Some(*limits);
        account.state_changes += 1;
        Ok(CommandOutcome::Changed)
    }
}
