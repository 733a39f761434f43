//! Gateway callback boundary.
//!
//! RULE: A callback always gets an answer. Every payload the engine could
//! process (applied, duplicate, unmatched, declined, unusable) is answered
//! 200 so the gateway stops retrying. Only a rolled-back write is answered
//! 503, which asks the gateway to deliver again.

use crate::{
    engine::BillingEngine,
    reconciliation::{GatewayCallback, ReconciliationResult},
    types::Gateway,
};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackAck {
    pub http_status: u16,
    pub body: Value,
    /// What happened, for logs and callers; not sent to the gateway.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ReconciliationResult>,
}

impl CallbackAck {
    pub fn accepted(gateway: Gateway, result: ReconciliationResult) -> Self {
        let body = match gateway {
            Gateway::MobileMoneyPush | Gateway::MobileMoneyBill => {
                json!({ "ResultCode": 0, "ResultDesc": "Accepted" })
            }
            Gateway::BankPush | Gateway::BankBill => json!({ "status": "ok" }),
            Gateway::Manual => json!({ "status": "ok", "payment_id": result.payment_id() }),
        };
        Self {
            http_status: 200,
            body,
            result: Some(result),
        }
    }

    pub fn retry_later(gateway: Gateway) -> Self {
        let body = match gateway {
            Gateway::MobileMoneyPush | Gateway::MobileMoneyBill => {
                json!({ "ResultCode": 1, "ResultDesc": "Temporarily unavailable" })
            }
            Gateway::BankPush | Gateway::BankBill | Gateway::Manual => {
                json!({ "status": "error", "message": "temporarily unavailable" })
            }
        };
        Self {
            http_status: 503,
            body,
            result: None,
        }
    }

    /// Processed but refused for a reason redelivery will not fix.
    fn refused(gateway: Gateway, message: String) -> Self {
        let body = match gateway {
            Gateway::MobileMoneyPush | Gateway::MobileMoneyBill => {
                json!({ "ResultCode": 0, "ResultDesc": "Accepted" })
            }
            Gateway::BankPush | Gateway::BankBill | Gateway::Manual => {
                json!({ "status": "ok", "message": message })
            }
        };
        Self {
            http_status: 200,
            body,
            result: None,
        }
    }
}

pub struct CallbackHandler<'e> {
    engine: &'e BillingEngine,
}

impl<'e> CallbackHandler<'e> {
    pub fn new(engine: &'e BillingEngine) -> Self {
        Self { engine }
    }

    /// Handle one raw callback body. A body that is not JSON is kept as a
    /// string so it still lands in the payment log as a failed row.
    pub fn handle(&self, tenant_id: &str, gateway: Gateway, raw_body: &str) -> CallbackAck {
        let body = serde_json::from_str::<Value>(raw_body)
            .unwrap_or_else(|_| Value::String(raw_body.to_string()));
        self.handle_json(tenant_id, gateway, body)
    }

    pub fn handle_json(&self, tenant_id: &str, gateway: Gateway, body: Value) -> CallbackAck {
        let callback = GatewayCallback {
            tenant_id: tenant_id.to_string(),
            gateway,
            body,
        };
        match self.engine.reconcile(&callback) {
            Ok(result) => CallbackAck::accepted(gateway, result),
            Err(e) if e.is_retryable() => {
                log::error!("callback: {gateway} tenant={tenant_id} rolled back, asking for redelivery: {e}");
                CallbackAck::retry_later(gateway)
            }
            Err(e) => {
                log::error!("callback: {gateway} tenant={tenant_id} refused: {e}");
                CallbackAck::refused(gateway, e.to_string())
            }
        }
    }
}
