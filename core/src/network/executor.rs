//! Runs network commands with a per-attempt timeout and bounded exponential
//! backoff, and records one `network_actions` row per command.
//!
//! The timeout is handed to the adapter, which must honour it (see
//! `NetworkAccess`). Overruns are logged, not cut short: an abandoned call
//! could still land after a later command for the same client.

use super::{CommandOutcome, NetworkAccess, NetworkCommand, NetworkError};
use crate::{
    clock::Clock,
    config::NetworkConfig,
    error::BillingResult,
    store::{LedgerStore, NetworkActionRow},
    types::TriggeredBy,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based): doubles each
    /// time, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

pub struct ActionExecutor {
    nas: Arc<dyn NetworkAccess>,
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        nas: Arc<dyn NetworkAccess>,
        store: LedgerStore,
        clock: Arc<dyn Clock>,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            nas,
            store,
            clock,
            retry: RetryPolicy::from_config(config),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// Execute `command` for `client_id`, retrying transient failures.
    /// The returned row is already persisted. A failed command is returned
    /// as a row with `success = false`, not as an error; only a failure to
    /// write the audit row is an error.
    pub fn run(
        &self,
        client_id: &str,
        command: &NetworkCommand,
        triggered_by: TriggeredBy,
    ) -> BillingResult<NetworkActionRow> {
        let client_id = client_id.to_string();
        let mut attempt = 0;
        let result: Result<CommandOutcome, NetworkError> = loop {
            attempt += 1;
            let started = Instant::now();
            let answer = self.nas.execute(&client_id, command, self.call_timeout);
            let elapsed = started.elapsed();
            let timed_out = matches!(answer, Err(NetworkError::Timeout { .. }));
            if elapsed > self.call_timeout && !timed_out {
                log::warn!(
                    "network: {} client={client_id} via={} took {elapsed:?}, past its {:?} deadline",
                    command.kind(),
                    self.nas.name(),
                    self.call_timeout
                );
            }
            match answer {
                Ok(outcome) => break Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    log::warn!(
                        "network: {} client={client_id} attempt={attempt} failed: {e}; retrying in {delay:?}",
                        command.kind()
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => break Err(e),
            }
        };

        let row = NetworkActionRow {
            id: None,
            client_id: client_id.clone(),
            action: command.kind(),
            success: result.is_ok(),
            error_message: result.as_ref().err().map(ToString::to_string),
            triggered_by,
            attempts: attempt,
            created_at: self.clock.now(),
        };
        let id = self.store.ledger().insert_network_action(&row)?;

        match &result {
            Ok(outcome) => log::info!(
                "network: {} client={client_id} via={} outcome={outcome:?} attempts={attempt}",
                command.kind(),
                self.nas.name()
            ),
            // Billing state stays as committed; this row is the standing discrepancy.
            Err(e) => log::error!(
                "network: {} client={client_id} via={} gave up after {attempt} attempt(s): {e}",
                command.kind(),
                self.nas.name()
            ),
        }

        Ok(NetworkActionRow { id: Some(id), ..row })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }
}
