//! Shared primitive types used across the billing core.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A stable, unique identifier for a client account.
pub type ClientId = String;

/// The ISP tenant owning a client or payment.
pub type TenantId = String;

/// Money amounts are exact decimals in the API, minor units (2 dp) on disk.
pub type Money = Decimal;

const MINOR_SCALE: u32 = 2;

/// Convert a decimal amount into integer minor units, rounding to 2 dp.
pub fn to_minor(amount: Money) -> BillingResult<i64> {
    amount
        .round_dp(MINOR_SCALE)
        .checked_mul(Decimal::from(100))
        .and_then(|scaled| scaled.to_i64())
        .ok_or_else(|| BillingError::InvalidAmount(amount.to_string()))
}

pub fn from_minor(minor: i64) -> Money {
    Decimal::new(minor, MINOR_SCALE)
}

pub fn to_epoch(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::Validation(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

text_enum!(
    /// Lifecycle state of a client account.
    ClientStatus {
        Pending => "pending",
        Approved => "approved",
        Active => "active",
        Suspended => "suspended",
        Disconnected => "disconnected",
        Rejected => "rejected",
    }
);

impl ClientStatus {
    /// States whose subscription window is billed by the scheduler.
    pub fn is_billable(&self) -> bool {
        matches!(self, Self::Active | Self::Suspended)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Rejected)
    }
}

text_enum!(
    /// Money-movement channel that reported a payment.
    Gateway {
        MobileMoneyPush => "mobile_money_push",
        MobileMoneyBill => "mobile_money_bill",
        BankPush => "bank_push",
        BankBill => "bank_bill",
        Manual => "manual",
    }
);

text_enum!(
    PaymentStatus {
        Received => "received",
        Matched => "matched",
        Applied => "applied",
        Failed => "failed",
        Unmatched => "unmatched",
    }
);

text_enum!(
    TxKind {
        Credit => "credit",
        Debit => "debit",
    }
);

text_enum!(
    NetworkActionKind {
        Disconnect => "disconnect",
        Reconnect => "reconnect",
        UpdateBandwidth => "update_bandwidth",
    }
);

text_enum!(
    /// Which path caused a network command.
    TriggeredBy {
        Webhook => "webhook",
        Scheduler => "scheduler",
        Manual => "manual",
    }
);

/// Map a TEXT column into one of the enums above.
pub(crate) fn parse_column<T: FromStr<Err = BillingError>>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_round_to_cents() {
        assert_eq!(to_minor(Decimal::new(100050, 2)).unwrap(), 100050);
        assert_eq!(to_minor(Decimal::new(1000, 0)).unwrap(), 100000);
        assert_eq!(to_minor(Decimal::new(12345, 3)).unwrap(), 1234);
        assert_eq!(from_minor(100000), Decimal::from(1000));
    }

    #[test]
    fn enum_text_matches_storage_names() {
        for status in ClientStatus::ALL {
            assert_eq!(status.as_str().parse::<ClientStatus>().unwrap(), *status);
        }
        assert_eq!(Gateway::BankBill.to_string(), "bank_bill");
        assert!("refunded".parse::<PaymentStatus>().is_err());
    }
}
