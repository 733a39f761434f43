//! Payer identification: which client a payment belongs to.

use crate::types::ClientId;
use serde::{Deserialize, Serialize};

/// Identifiers a gateway reported for the payer. Any may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerIdentifier {
    pub billing_reference: Option<String>,
    pub phone: Option<String>,
    /// Only manual entries name a client directly.
    pub client_id: Option<ClientId>,
}

impl PayerIdentifier {
    pub fn is_empty(&self) -> bool {
        self.billing_reference.is_none() && self.phone.is_none() && self.client_id.is_none()
    }

    /// Value stored in `payments.payer_identifier`, in resolution order.
    pub fn primary(&self) -> Option<&str> {
        self.billing_reference
            .as_deref()
            .or(self.phone.as_deref())
            .or(self.client_id.as_deref())
    }
}

/// Normalise a phone number to international digits without `+`.
///
/// "0712 345 678" and "+254712345678" both become "254712345678" with
/// `country_code = "254"`. A bare 9-digit subscriber number gets the country
/// code prepended. Returns `None` when nothing digit-like remains.
pub fn normalize_phone(raw: &str, country_code: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = digits.strip_prefix('+').unwrap_or(&digits);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if let Some(international) = digits.strip_prefix("00") {
        return Some(international.to_string());
    }
    if let Some(local) = digits.strip_prefix('0') {
        if local.is_empty() {
            return None;
        }
        return Some(format!("{country_code}{local}"));
    }
    if digits.len() == 9 && !digits.starts_with(country_code) {
        return Some(format!("{country_code}{digits}"));
    }
    Some(digits.to_string())
}
