use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::network::speed::SpeedUnit;

/// Subscription billing rules shared by the state machine and the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingPolicy {
    /// Length of one paid period.
    pub period_days: i64,
    /// A credit renews early once the window end is this close.
    pub renewal_window_days: i64,
    /// Days-until-expiry values that trigger a reminder.
    pub reminder_days: Vec<i64>,
}

impl BillingPolicy {
    pub fn period(&self) -> Duration {
        Duration::days(self.period_days)
    }

    pub fn renewal_window(&self) -> Duration {
        Duration::days(self.renewal_window_days)
    }
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            period_days: 30,
            renewal_window_days: 3,
            reminder_days: vec![3, 2, 1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Attempts per command, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Deadline handed to the adapter for each attempt.
    pub call_timeout_ms: u64,
    /// Used when a package speed cannot be parsed.
    pub fallback_speed_kbps: u64,
    /// Unit assumed for a bare number such as "10".
    pub bare_number_unit: SpeedUnit,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            call_timeout_ms: 10_000,
            fallback_speed_kbps: 1_024,
            bare_number_unit: SpeedUnit::Mbps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Re-issue failed network commands at the end of each sweep.
    pub remediate_failed_actions: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            remediate_failed_actions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayerConfig {
    /// Country calling code prepended to local "0…" numbers.
    pub country_code: String,
}

impl Default for PayerConfig {
    fn default() -> Self {
        Self {
            country_code: "254".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub workers: usize,
    /// Attempts per notification, including the first.
    pub notify_attempts: u32,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            notify_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub billing: BillingPolicy,
    pub network: NetworkConfig,
    pub scheduler: SchedulerConfig,
    pub payer: PayerConfig,
    pub outbound: OutboundConfig,
}

impl PortalConfig {
    /// Load from a JSON file. Missing sections and fields take their defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: PortalConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.billing.period_days <= 0 {
            anyhow::bail!("billing.period_days must be positive");
        }
        if self.billing.renewal_window_days < 0 {
            anyhow::bail!("billing.renewal_window_days must not be negative");
        }
        if self.network.max_attempts == 0 {
            anyhow::bail!("network.max_attempts must be at least 1");
        }
        if self.network.fallback_speed_kbps == 0 {
            anyhow::bail!("network.fallback_speed_kbps must be positive");
        }
        if self.outbound.workers == 0 {
            anyhow::bail!("outbound.workers must be at least 1");
        }
        Ok(())
    }

    /// Defaults with retries that never sleep. Use in tests.
    pub fn default_test() -> Self {
        let mut config = Self::default();
        config.network.initial_backoff_ms = 0;
        config.network.max_backoff_ms = 0;
        config.network.call_timeout_ms = 1_000;
        config.outbound.workers = 2;
        config
    }
}
