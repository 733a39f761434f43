//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use netbill_core::{
    engine::{BillingEngine, TestRig},
    lifecycle::Client,
    reconciliation::{GatewayCallback, ReconciliationResult},
    store::NewClient,
    types::{Gateway, NetworkActionKind},
};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub const TENANT: &str = "isp-nairobi";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn rig(name: &str) -> TestRig {
    let _ = env_logger::builder().is_test(true).try_init();
    BillingEngine::build_test(name, start()).expect("build_test failed")
}

pub fn new_client(billing_reference: &str, phone: &str) -> NewClient {
    NewClient {
        tenant_id: TENANT.into(),
        full_name: format!("Client {billing_reference}"),
        phone: phone.into(),
        email: None,
        billing_reference: billing_reference.into(),
        package_speed: "10Mbps".into(),
        monthly_rate: Decimal::from(1000),
    }
}

pub fn register(rig: &TestRig, billing_reference: &str, phone: &str) -> Client {
    rig.engine
        .register_client(new_client(billing_reference, phone))
        .expect("register failed")
}

/// Registered, approved and activated at the rig's current time.
pub fn active_client(rig: &TestRig, billing_reference: &str, phone: &str) -> Client {
    let client = register(rig, billing_reference, phone);
    rig.engine.approve(&client.id, "ops@isp").expect("approve failed");
    rig.engine.activate(&client.id).expect("activate failed").client
}

pub fn paybill(trans_id: &str, bill_ref: &str, amount: i64) -> Value {
    json!({
        "TransactionType": "Pay Bill",
        "TransID": trans_id,
        "TransTime": "20260301090000",
        "TransAmount": format!("{amount}.00"),
        "BusinessShortCode": "600638",
        "BillRefNumber": bill_ref,
        "MSISDN": "254799000000",
        "FirstName": "JOHN"
    })
}

pub fn stk_success(receipt: &str, phone: u64, amount: i64) -> Value {
    json!({
        "Body": { "stkCallback": {
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": format!("ws_CO_{receipt}"),
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "CallbackMetadata": { "Item": [
                { "Name": "Amount", "Value": amount },
                { "Name": "MpesaReceiptNumber", "Value": receipt },
                { "Name": "TransactionDate", "Value": 20260301090000u64 },
                { "Name": "PhoneNumber", "Value": phone }
            ]}
        }}
    })
}

pub fn pay(rig: &TestRig, gateway: Gateway, body: Value) -> ReconciliationResult {
    rig.engine
        .reconcile(&GatewayCallback {
            tenant_id: TENANT.into(),
            gateway,
            body,
        })
        .expect("reconcile failed")
}

pub fn actions(rig: &TestRig, client_id: &str) -> Vec<NetworkActionKind> {
    rig.engine
        .store
        .ledger()
        .network_actions_for(client_id)
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect()
}
