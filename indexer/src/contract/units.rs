//! Fixed-point token amounts.

use alloy_primitives::U256;
use eyre::{eyre, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decimal scale of USDT-denominated amounts.
pub const USDT_DECIMALS: u32 = 6;
/// Decimal scale of HELP-denominated amounts.
pub const HELP_DECIMALS: u32 = 18;
/// Decimal scale of the HELP price oracle.
pub const PRICE_DECIMALS: u32 = 8;

/// Token tag stored on transaction rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    #[serde(rename = "USDT")]
    Usdt,
    #[serde(rename = "HELP")]
    Help,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl Token {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usdt => "USDT",
            Self::Help => "HELP",
            Self::NotApplicable => "N/A",
        }
    }

    /// Decimal scale of on-chain amounts in this token, if it has one.
    pub fn decimals(self) -> Option<u32> {
        match self {
            Self::Usdt => Some(USDT_DECIMALS),
            Self::Help => Some(HELP_DECIMALS),
            Self::NotApplicable => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Token {
    type Err = eyre::Report;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "USDT" => Ok(Self::Usdt),
            "HELP" => Ok(Self::Help),
            "N/A" => Ok(Self::NotApplicable),
            other => Err(eyre!("unknown token {other}")),
        }
    }
}

/// Converts a raw on-chain integer into a human-readable decimal.
///
/// The conversion is exact: `1_000_000` at scale 6 is exactly `1`.
pub fn to_decimal(raw: U256, decimals: u32) -> Result<Decimal> {
    let mantissa = i128::try_from(raw)
        .map_err(|_| eyre!("amount {raw} does not fit a decimal mantissa"))?;
    let value = Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|err| eyre!("amount {raw} at scale {decimals} out of range: {err}"))?;
    Ok(value.normalize())
}

pub fn usdt(raw: U256) -> Result<Decimal> {
    to_decimal(raw, USDT_DECIMALS)
}

pub fn help(raw: U256) -> Result<Decimal> {
    to_decimal(raw, HELP_DECIMALS)
}

pub fn price(raw: U256) -> Result<Decimal> {
    to_decimal(raw, PRICE_DECIMALS)
}

/// Narrows a raw integer that is expected to be small (levels, timestamps).
pub fn to_u64(raw: U256, field: &str) -> Result<u64> {
    u64::try_from(raw).map_err(|_| eyre!("{field} value {raw} exceeds u64"))
}
