// src/money.rs
use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// A currency tag: ISO-style code plus the number of decimal digits in its
/// minor unit (2 for USD cents, 0 for JPY).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub decimals: u8,
}

static BUILTIN: Lazy<HashMap<&'static str, Currency>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for (code, decimals) in [("USD", 2), ("EUR", 2), ("GBP", 2), ("JPY", 0)] {
        m.insert(code, Currency::new(code, decimals));
    }
    m
});

impl Currency {
    pub fn new(code: &str, decimals: u8) -> Self {
        Self {
            code: code.to_string(),
            decimals,
        }
    }

    /// Look up a built-in currency by code.
    pub fn get(code: &str) -> Option<Currency> {
        BUILTIN.get(code).cloned()
    }

    /// Minor units per major unit (10^decimals).
    pub fn scale(&self) -> u64 {
        10u64.pow(self.decimals as u32)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// A non-negative amount in a currency's minor unit. All arithmetic is
/// checked; overflow surfaces as `LedgerError::Arithmetic` instead of
/// wrapping silently.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_minor_units(units: u64) -> Self {
        Self(units)
    }

    pub fn minor_units(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Result<Amount, LedgerError> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(LedgerError::Arithmetic)
    }

    pub fn checked_sub(self, other: Amount) -> Result<Amount, LedgerError> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(LedgerError::Arithmetic)
    }

    /// Parse a decimal string ("12.34") into minor units using the currency's
    /// declared scale. More fractional digits than the scale allows is a
    /// validation failure, not a rounding opportunity.
    pub fn parse(text: &str, currency: &Currency) -> Result<Amount, LedgerError> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('-') || text.starts_with('+') {
            return Err(LedgerError::Validation(format!(
                "invalid amount: {:?}",
                text
            )));
        }

        let (whole, frac) = match text.split_once('.') {
            Some((w, f)) => (w, f),
            None => (text, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(LedgerError::Validation(format!(
                "invalid amount: {:?}",
                text
            )));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(LedgerError::Validation(format!(
                "invalid amount: {:?}",
                text
            )));
        }
        if frac.len() > currency.decimals as usize {
            return Err(LedgerError::Validation(format!(
                "{} supports {} decimal places, got {:?}",
                currency.code, currency.decimals, text
            )));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| LedgerError::Arithmetic)?
        };

        let mut frac_units: u64 = 0;
        if !frac.is_empty() {
            frac_units = frac.parse().map_err(|_| LedgerError::Arithmetic)?;
            for _ in 0..(currency.decimals as usize - frac.len()) {
                frac_units = frac_units.checked_mul(10).ok_or(LedgerError::Arithmetic)?;
            }
        }

        whole
            .checked_mul(currency.scale())
            .and_then(|units| units.checked_add(frac_units))
            .map(Amount)
            .ok_or(LedgerError::Arithmetic)
    }

    /// Render as a decimal string at the currency's scale.
    pub fn to_decimal_string(&self, currency: &Currency) -> String {
        if currency.decimals == 0 {
            return self.0.to_string();
        }
        let scale = currency.scale();
        format!(
            "{}.{:0width$}",
            self.0 / scale,
            self.0 % scale,
            width = currency.decimals as usize
        )
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
