//! Network access gateway: the seam to NAS/RADIUS and router QoS.
//!
//! Adapters implement `NetworkAccess`. Every command must be idempotent at the
//! target: disconnecting a disconnected account, or reconnecting a connected
//! one, succeeds with `CommandOutcome::AlreadyInState`.

pub mod executor;
pub mod memory;
pub mod speed;

pub use executor::{ActionExecutor, RetryPolicy};
pub use memory::InMemoryNas;
pub use speed::{normalize_speed, BandwidthLimits, SpeedUnit};

use crate::types::{ClientId, NetworkActionKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The target refused the command. Retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl NetworkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unreachable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Changed,
    AlreadyInState,
}

/// One command against the access infrastructure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NetworkCommand {
    Disconnect,
    Reconnect,
    UpdateBandwidth { limits: BandwidthLimits },
}

impl NetworkCommand {
    pub fn kind(&self) -> NetworkActionKind {
        match self {
            Self::Disconnect => NetworkActionKind::Disconnect,
            Self::Reconnect => NetworkActionKind::Reconnect,
            Self::UpdateBandwidth { .. } => NetworkActionKind::UpdateBandwidth,
        }
    }
}

/// Every call must return within the `timeout` it is given, with
/// `NetworkError::Timeout` when the target has not answered by then. The
/// executor calls adapters on an outbound worker, so a call that blocks past
/// its deadline stalls every client assigned to that worker.
pub trait NetworkAccess: Send + Sync {
    fn name(&self) -> &'static str;

    fn disconnect(&self, client_id: &str, timeout: Duration)
        -> Result<CommandOutcome, NetworkError>;

    fn reconnect(&self, client_id: &str, timeout: Duration)
        -> Result<CommandOutcome, NetworkError>;

    fn update_bandwidth(
        &self,
        client_id: &str,
        limits: &BandwidthLimits,
        timeout: Duration,
    ) -> Result<CommandOutcome, NetworkError>;

    fn execute(
        &self,
        client_id: &ClientId,
        command: &NetworkCommand,
        timeout: Duration,
    ) -> Result<CommandOutcome, NetworkError> {
        match command {
            NetworkCommand::Disconnect => self.disconnect(client_id, timeout),
            NetworkCommand::Reconnect => self.reconnect(client_id, timeout),
            NetworkCommand::UpdateBandwidth { limits } => {
                self.update_bandwidth(client_id, limits, timeout)
            }
        }
    }
}
