//! Exact-decimal money handling.
//!
//! Amounts flow through the engine as [`rust_decimal::Decimal`] end to end —
//! order quantity/price, ledger active/frozen, persisted rows. There is no
//! intermediate fixed-point scaling: the source this engine was modeled on
//! loses precision by storing balances through a floating-point increment
//! primitive, which this module exists to make structurally impossible.
//!
//! Parsing is strict: ambiguous decimal strings are rejected rather than
//! guessed at, matching the spirit of the gateway's own amount parsing.

use rust_decimal::Decimal;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use thiserror::Error;

/// Maximum fractional digits the engine accepts (spec: up to 10).
pub const MAX_FRACTIONAL_DIGITS: u32 = 10;

#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("precision overflow: provided {provided} fractional digits, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown currency: {0}")]
    UnknownCurrency(String),
}

/// Fixed currency enumeration (spec §3: "fixed enumeration").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Currency {
    Btc,
    Eth,
    Xrp,
    Eos,
    Neo,
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::Xrp => "XRP",
            Currency::Eos => "EOS",
            Currency::Neo => "NEO",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTC" => Ok(Currency::Btc),
            "ETH" => Ok(Currency::Eth),
            "XRP" => Ok(Currency::Xrp),
            "EOS" => Ok(Currency::Eos),
            "NEO" => Ok(Currency::Neo),
            other => Err(MoneyError::UnknownCurrency(other.to_string())),
        }
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(D::Error::custom)
    }
}

/// An ordered `BASE_QUOTE` trading pair (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pair {
    pub base: Currency,
    pub quote: Currency,
}

impl Pair {
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

impl FromStr for Pair {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('_')
            .ok_or_else(|| MoneyError::InvalidFormat(format!("expected BASE_QUOTE, got {s}")))?;
        Ok(Pair::new(base.parse()?, quote.parse()?))
    }
}

impl Serialize for Pair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(D::Error::custom)
    }
}

/// Strictly parses a client-provided decimal string (e.g. an intake-message
/// field) into a positive [`Decimal`]. Rejects the same ambiguous shapes a
/// client-facing amount parser must reject: leading `+`, missing
/// leading/trailing digits around the dot, more fractional digits than the
/// engine supports.
///
/// A caller that wants to accept exactly zero (market-order `price: "0"`,
/// or an edit field meaning "unchanged") uses [`parse_amount_allow_zero`]
/// instead.
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let amount = parse_amount_allow_zero(amount_str)?;
    if amount.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }
    Ok(amount)
}

pub fn parse_amount_allow_zero(amount_str: &str) -> Result<Decimal, MoneyError> {
    let trimmed = amount_str.trim();
    if trimmed.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if trimmed.starts_with('+') {
        return Err(MoneyError::InvalidFormat("explicit '+' not allowed".into()));
    }

    if let Some((whole, frac)) = trimmed.trim_start_matches('-').split_once('.') {
        if whole.is_empty() {
            return Err(MoneyError::InvalidFormat(
                "missing leading zero (use 0.5 instead of .5)".into(),
            ));
        }
        if frac.is_empty() {
            return Err(MoneyError::InvalidFormat(
                "missing fractional part (use 5.0 instead of 5.)".into(),
            ));
        }
        if frac.len() as u32 > MAX_FRACTIONAL_DIGITS {
            return Err(MoneyError::PrecisionOverflow {
                provided: frac.len() as u32,
                max: MAX_FRACTIONAL_DIGITS,
            });
        }
    }

    let value = Decimal::from_str(trimmed)
        .map_err(|e| MoneyError::InvalidFormat(format!("{trimmed}: {e}")))?;

    if value.is_sign_negative() {
        return Err(MoneyError::InvalidAmount);
    }
    if value.scale() > MAX_FRACTIONAL_DIGITS {
        return Err(MoneyError::PrecisionOverflow {
            provided: value.scale(),
            max: MAX_FRACTIONAL_DIGITS,
        });
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fractional_amounts() {
        assert_eq!(parse_amount("1.23").unwrap(), Decimal::new(123, 2));
        assert_eq!(parse_amount("100").unwrap(), Decimal::new(100, 0));
        assert_eq!(parse_amount("0.0000000001").unwrap().scale(), 10);
    }

    #[test]
    fn rejects_ambiguous_formats() {
        for case in ["+1.23", ".5", "5.", "1.2.3", "", "  "] {
            assert!(parse_amount(case).is_err(), "should reject {case}");
        }
    }

    #[test]
    fn rejects_negative_and_zero() {
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("0").is_err());
        assert!(parse_amount("0.0").is_err());
    }

    #[test]
    fn allow_zero_variant_accepts_zero() {
        assert_eq!(parse_amount_allow_zero("0").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn rejects_excess_precision() {
        let err = parse_amount("1.12345678901").unwrap_err();
        assert!(matches!(err, MoneyError::PrecisionOverflow { provided: 11, max: 10 }));
    }

    #[test]
    fn currency_and_pair_roundtrip() {
        let pair: Pair = "BTC_ETH".parse().unwrap();
        assert_eq!(pair.base, Currency::Btc);
        assert_eq!(pair.quote, Currency::Eth);
        assert_eq!(pair.to_string(), "BTC_ETH");
    }

    #[test]
    fn unknown_currency_is_rejected() {
        assert!("BTC_DOGE".parse::<Pair>().is_err());
    }
}
