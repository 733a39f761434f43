//! Per-gateway payload normalisation.
//!
//! Each gateway signals success differently: a typed result code, an HTTP
//! style status in the body, or just the presence of a transaction id.
//! `normalize` maps all of them onto one `Normalized` value and never fails.

use super::payer::PayerIdentifier;
use crate::types::{to_minor, Gateway, Money};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalPayment {
    pub gateway: Gateway,
    pub external_reference: String,
    pub amount: Money,
    pub payer: PayerIdentifier,
    /// Operator who keyed a manual entry.
    pub recorded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Payment(CanonicalPayment),
    /// The gateway reported the transaction as not completed.
    Declined {
        external_reference: String,
        amount: Option<Money>,
        payer: PayerIdentifier,
        reason: String,
    },
    /// Unusable payload. `external_reference` is set when one was readable.
    Malformed {
        external_reference: Option<String>,
        reason: String,
    },
}

impl Normalized {
    fn malformed(reference: Option<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            external_reference: reference,
            reason: reason.into(),
        }
    }
}

pub fn normalize(gateway: Gateway, body: &Value) -> Normalized {
    let Some(obj) = body.as_object() else {
        return Normalized::malformed(None, "payload is not a JSON object");
    };
    match gateway {
        Gateway::MobileMoneyPush => mobile_money_push(obj),
        Gateway::MobileMoneyBill => mobile_money_bill(obj),
        Gateway::BankPush => bank_push(obj),
        Gateway::BankBill => bank_bill(obj),
        Gateway::Manual => manual(obj),
    }
}

// ── Gateways ──────────────────────────────────────────────────────

fn mobile_money_push(obj: &Map<String, Value>) -> Normalized {
    let Some(stk) = obj
        .get("Body")
        .and_then(|b| b.get("stkCallback"))
        .and_then(Value::as_object)
    else {
        return Normalized::malformed(None, "missing Body.stkCallback");
    };
    let checkout = text(stk, "CheckoutRequestID");
    let Some(code) = stk.get("ResultCode").and_then(as_i64) else {
        return Normalized::malformed(checkout, "missing ResultCode");
    };

    let items: Map<String, Value> = stk
        .get("CallbackMetadata")
        .and_then(|m| m.get("Item"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get("Name")?.as_str()?;
                    Some((name.to_string(), item.get("Value")?.clone()))
                })
                .collect()
        })
        .unwrap_or_default();
    let payer = PayerIdentifier {
        billing_reference: text(&items, "AccountReference"),
        phone: text(&items, "PhoneNumber"),
        client_id: None,
    };

    if code != 0 {
        let Some(reference) = checkout else {
            let reason = format!("declined (ResultCode {code}) without CheckoutRequestID");
            return Normalized::malformed(None, reason);
        };
        let reason = text(stk, "ResultDesc").unwrap_or_else(|| format!("ResultCode {code}"));
        return Normalized::Declined {
            external_reference: reference,
            amount: amount(&items, "Amount").ok(),
            payer,
            reason,
        };
    }

    let Some(receipt) = text(&items, "MpesaReceiptNumber") else {
        return Normalized::malformed(checkout, "missing MpesaReceiptNumber");
    };
    complete(Gateway::MobileMoneyPush, receipt, amount(&items, "Amount"), payer, None)
}

fn mobile_money_bill(obj: &Map<String, Value>) -> Normalized {
    let Some(reference) = text(obj, "TransID") else {
        return Normalized::malformed(None, "missing TransID");
    };
    let payer = PayerIdentifier {
        billing_reference: text(obj, "BillRefNumber"),
        phone: text(obj, "MSISDN"),
        client_id: None,
    };
    complete(Gateway::MobileMoneyBill, reference, amount(obj, "TransAmount"), payer, None)
}

fn bank_push(obj: &Map<String, Value>) -> Normalized {
    let reference = text(obj, "transactionId");
    let Some(status) = obj.get("statusCode").and_then(as_i64) else {
        return Normalized::malformed(reference, "missing statusCode");
    };
    let payer = PayerIdentifier {
        billing_reference: text(obj, "billReference"),
        phone: text(obj, "phoneNumber"),
        client_id: None,
    };
    let Some(reference) = reference else {
        return Normalized::malformed(None, "missing transactionId");
    };
    if status != 200 {
        let reason = text(obj, "message")
            .or_else(|| text(obj, "statusDescription"))
            .unwrap_or_else(|| format!("statusCode {status}"));
        return Normalized::Declined {
            external_reference: reference,
            amount: amount(obj, "amount").ok(),
            payer,
            reason,
        };
    }
    complete(Gateway::BankPush, reference, amount(obj, "amount"), payer, None)
}

fn bank_bill(obj: &Map<String, Value>) -> Normalized {
    let Some(reference) = text(obj, "TransactionReferenceCode") else {
        return Normalized::malformed(None, "missing TransactionReferenceCode");
    };
    let payer = PayerIdentifier {
        billing_reference: text(obj, "BillNumber"),
        phone: text(obj, "PhoneNumber"),
        client_id: None,
    };
    complete(Gateway::BankBill, reference, amount(obj, "TransactionAmount"), payer, None)
}

fn manual(obj: &Map<String, Value>) -> Normalized {
    let Some(reference) = text(obj, "reference") else {
        return Normalized::malformed(None, "missing reference");
    };
    let Some(recorded_by) = text(obj, "recorded_by") else {
        return Normalized::malformed(Some(reference), "manual entry without recorded_by");
    };
    let payer = PayerIdentifier {
        billing_reference: text(obj, "billing_reference"),
        phone: text(obj, "phone"),
        client_id: text(obj, "client_id"),
    };
    complete(Gateway::Manual, reference, amount(obj, "amount"), payer, Some(recorded_by))
}

fn complete(
    gateway: Gateway,
    external_reference: String,
    amount: Result<Money, String>,
    payer: PayerIdentifier,
    recorded_by: Option<String>,
) -> Normalized {
    let amount = match amount {
        Ok(a) => a,
        Err(reason) => return Normalized::malformed(Some(external_reference), reason),
    };
    if payer.is_empty() {
        return Normalized::malformed(Some(external_reference), "no payer identifier");
    }
    Normalized::Payment(CanonicalPayment {
        gateway,
        external_reference,
        amount,
        payer,
        recorded_by,
    })
}

// ── Field helpers ─────────────────────────────────────────────────

/// A trimmed, non-empty string. Numbers are accepted and rendered as text,
/// since phone numbers and references are often sent unquoted.
fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    let raw = match obj.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A strictly positive amount given as a JSON number or numeric string,
/// storable as a whole number of minor units.
fn amount(obj: &Map<String, Value>, key: &str) -> Result<Money, String> {
    let raw = match obj.get(key) {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().replace(',', ""),
        Some(other) => return Err(format!("{key} is not numeric: {other}")),
        None => return Err(format!("missing {key}")),
    };
    let value = Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| format!("{key} is not numeric: {raw}"))?;
    if value <= Decimal::ZERO {
        return Err(format!("{key} must be positive, got {value}"));
    }
    match to_minor(value) {
        Ok(minor) if minor > 0 => Ok(value),
        Ok(_) => Err(format!("{key} is below the smallest unit: {value}")),
        Err(_) => Err(format!("{key} is out of range: {value}")),
    }
}
