//! Package speed normalisation.
//!
//! Package speeds are typed by humans ("10Mbps", "512 kbps", "5M/2M", "20").
//! Router queues and RADIUS rate-limit attributes want one base unit, so every
//! value is converted to kbit/s (1 kbit = 1000 bit). Conversion is total:
//! anything unparseable yields the configured fallback, flagged as such.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnit {
    Bps,
    Kbps,
    Mbps,
    Gbps,
}

impl SpeedUnit {
    fn parse(suffix: &str) -> Option<Self> {
        let s = suffix.trim().to_ascii_lowercase();
        let s = s
            .strip_suffix("/s")
            .or_else(|| s.strip_suffix("ps"))
            .or_else(|| s.strip_suffix("it"))
            .unwrap_or(&s);
        match s {
            "b" => Some(Self::Bps),
            "k" | "kb" | "kbit" => Some(Self::Kbps),
            "m" | "mb" | "mbit" => Some(Self::Mbps),
            "g" | "gb" | "gbit" => Some(Self::Gbps),
            _ => None,
        }
    }

    /// Multiply a value in this unit to get bit/s.
    fn bits_per_unit(self) -> Decimal {
        match self {
            Self::Bps => Decimal::ONE,
            Self::Kbps => Decimal::from(1_000),
            Self::Mbps => Decimal::from(1_000_000),
            Self::Gbps => Decimal::from(1_000_000_000),
        }
    }
}

/// Download/upload rate limits in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthLimits {
    pub download_kbps: u64,
    pub upload_kbps: u64,
    /// True when the source text could not be parsed and the fallback applied.
    pub fallback: bool,
}

impl BandwidthLimits {
    pub fn symmetric(kbps: u64) -> Self {
        Self {
            download_kbps: kbps,
            upload_kbps: kbps,
            fallback: false,
        }
    }

    /// Router rate-limit notation, upload first: "2000k/5000k".
    pub fn rate_limit(&self) -> String {
        format!("{}k/{}k", self.upload_kbps, self.download_kbps)
    }
}

/// Normalise a package speed. `"down/up"` pairs are split; a single value
/// applies to both directions.
pub fn normalize_speed(raw: &str, bare_unit: SpeedUnit, fallback_kbps: u64) -> BandwidthLimits {
    let parts: Vec<&str> = raw.split('/').collect();
    let parsed = match parts.as_slice() {
        [single] => parse_kbps(single, bare_unit).map(|k| (k, k)),
        [down, up] => parse_kbps(down, bare_unit).zip(parse_kbps(up, bare_unit)),
        _ => None,
    };

    match parsed {
        Some((download_kbps, upload_kbps)) => BandwidthLimits {
            download_kbps,
            upload_kbps,
            fallback: false,
        },
        None => {
            log::warn!("speed: cannot parse {raw:?}, using fallback {fallback_kbps} kbps");
            BandwidthLimits {
                download_kbps: fallback_kbps,
                upload_kbps: fallback_kbps,
                fallback: true,
            }
        }
    }
}

fn parse_kbps(text: &str, bare_unit: SpeedUnit) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    if number.is_empty() {
        return None;
    }

    let value = Decimal::from_str(number).ok()?;
    if value <= Decimal::ZERO {
        return None;
    }
    let unit = if suffix.trim().is_empty() {
        bare_unit
    } else {
        SpeedUnit::parse(suffix)?
    };

    let kbps = value
        .checked_mul(unit.bits_per_unit())?
        .checked_div(Decimal::from(1_000))?
        .ceil();
    kbps.to_u64().filter(|k| *k > 0)
}
