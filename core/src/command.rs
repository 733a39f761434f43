use serde::{Deserialize, Serialize};

use crate::types::{ClientId, Gateway, Money};

/// Operator-issued commands.
/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    // ── Onboarding ────────────────────────────────
    Approve {
        client_id: ClientId,
        actor: String,
    },
    Reject {
        client_id: ClientId,
        actor: String,
        reason: String,
    },
    Activate {
        client_id: ClientId,
    },

    // ── Service changes ───────────────────────────
    Suspend {
        client_id: ClientId,
        actor: String,
        reason: String,
    },
    Terminate {
        client_id: ClientId,
        actor: String,
    },
    ChangePlan {
        client_id: ClientId,
        #[serde(default)]
        monthly_rate: Option<Money>,
        #[serde(default)]
        package_speed: Option<String>,
    },

    // ── Reconciliation ────────────────────────────
    Rematch {
        gateway: Gateway,
        external_reference: String,
        client_id: ClientId,
        actor: String,
    },
    Remediate,
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Activate { .. } => "activate",
            Self::Suspend { .. } => "suspend",
            Self::Terminate { .. } => "terminate",
            Self::ChangePlan { .. } => "change_plan",
            Self::Rematch { .. } => "rematch",
            Self::Remediate => "remediate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd: AdminCommand = serde_json::from_str(
            r#"{ "cmd": "change_plan", "client_id": "c-1", "package_speed": "20M/5M" }"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            AdminCommand::ChangePlan {
                client_id: "c-1".into(),
                monthly_rate: None,
                package_speed: Some("20M/5M".into()),
            }
        );

        let cmd: AdminCommand = serde_json::from_str(r#"{ "cmd": "remediate" }"#).unwrap();
        assert_eq!(cmd.name(), "remediate");
    }
}
