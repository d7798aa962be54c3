//! Typed currency amounts
//!
//! Amounts travel as strings `"CUR:VALUE.FRACTION"` everywhere (HTTP
//! bodies, contract terms, exchange responses) and as exact
//! (value, fraction) integer pairs in the database. The fraction unit
//! is 1e-8, so `"EUR:4.98"` is `value = 4, fraction = 98_000_000`.
//!
//! All arithmetic is checked: mixing currencies or overflowing the
//! value range is an error, never a silent wrap.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Smallest representable unit: 1e-8 of the base unit.
pub const FRACTION_BASE: u32 = 100_000_000;

/// Upper bound on `value` so that sums of realistic coin sets cannot
/// overflow even after fee arithmetic (2^52, mirroring IEEE-exactness
/// for JSON consumers).
pub const MAX_AMOUNT_VALUE: u64 = 1 << 52;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Malformed amount string: {0}")]
    Malformed(String),

    #[error("Currency mismatch: {0} vs {1}")]
    CurrencyMismatch(String, String),

    #[error("Amount overflow")]
    Overflow,

    #[error("Amount underflow")]
    Underflow,
}

/// An exact amount in a single currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount {
    currency: String,
    value: u64,
    fraction: u32,
}

impl Amount {
    pub fn new(currency: &str, value: u64, fraction: u32) -> Result<Self, AmountError> {
        if currency.is_empty()
            || currency.len() > 11
            || !currency.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(AmountError::Malformed(format!(
                "invalid currency tag '{}'",
                currency
            )));
        }
        if fraction >= FRACTION_BASE || value > MAX_AMOUNT_VALUE {
            return Err(AmountError::Malformed(format!(
                "{}:{}.{} out of range",
                currency, value, fraction
            )));
        }
        Ok(Self {
            currency: currency.to_string(),
            value,
            fraction,
        })
    }

    pub fn zero(currency: &str) -> Result<Self, AmountError> {
        Self::new(currency, 0, 0)
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn fraction(&self) -> u32 {
        self.fraction
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    fn check_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ));
        }
        Ok(())
    }

    /// Checked addition; fails on currency mismatch or overflow.
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.check_currency(other)?;
        let mut fraction = self.fraction + other.fraction;
        let mut carry = 0u64;
        if fraction >= FRACTION_BASE {
            fraction -= FRACTION_BASE;
            carry = 1;
        }
        let value = self
            .value
            .checked_add(other.value)
            .and_then(|v| v.checked_add(carry))
            .ok_or(AmountError::Overflow)?;
        if value > MAX_AMOUNT_VALUE {
            return Err(AmountError::Overflow);
        }
        Ok(Amount {
            currency: self.currency.clone(),
            value,
            fraction,
        })
    }

    /// Checked subtraction; fails on currency mismatch or if `other > self`.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.check_currency(other)?;
        let mut value = self.value;
        let fraction = if self.fraction >= other.fraction {
            self.fraction - other.fraction
        } else {
            value = value.checked_sub(1).ok_or(AmountError::Underflow)?;
            self.fraction + FRACTION_BASE - other.fraction
        };
        let value = value.checked_sub(other.value).ok_or(AmountError::Underflow)?;
        Ok(Amount {
            currency: self.currency.clone(),
            value,
            fraction,
        })
    }

    /// Multiply by a small integer (wire-fee amortization factor).
    pub fn checked_mul(&self, factor: u32) -> Result<Amount, AmountError> {
        let total_frac = self.fraction as u64 * factor as u64;
        let carry = total_frac / FRACTION_BASE as u64;
        let fraction = (total_frac % FRACTION_BASE as u64) as u32;
        let value = self
            .value
            .checked_mul(factor as u64)
            .and_then(|v| v.checked_add(carry))
            .ok_or(AmountError::Overflow)?;
        if value > MAX_AMOUNT_VALUE {
            return Err(AmountError::Overflow);
        }
        Ok(Amount {
            currency: self.currency.clone(),
            value,
            fraction,
        })
    }

    /// Divide by a small integer, rounding down (per-payment share of an
    /// amortized wire fee).
    pub fn divided_by(&self, divisor: u32) -> Result<Amount, AmountError> {
        if divisor == 0 {
            return Err(AmountError::Malformed("division by zero".to_string()));
        }
        let total = self.value as u128 * FRACTION_BASE as u128 + self.fraction as u128;
        let share = total / divisor as u128;
        Ok(Amount {
            currency: self.currency.clone(),
            value: (share / FRACTION_BASE as u128) as u64,
            fraction: (share % FRACTION_BASE as u128) as u32,
        })
    }

    /// Currency-checked comparison.
    pub fn cmp_checked(&self, other: &Amount) -> Result<Ordering, AmountError> {
        self.check_currency(other)?;
        Ok(self
            .value
            .cmp(&other.value)
            .then(self.fraction.cmp(&other.fraction)))
    }

    pub fn max_of(&self, other: &Amount) -> Result<Amount, AmountError> {
        Ok(match self.cmp_checked(other)? {
            Ordering::Less => other.clone(),
            _ => self.clone(),
        })
    }
}

impl fmt::Display for Amount {
    /// Canonical rendering: fraction always printed with 8 digits so the
    /// string form of an amount is unique and hash-stable.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{:08}", self.currency, self.value, self.fraction)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    /// Accepts `"CUR:VALUE"` or `"CUR:VALUE.FRACTION"` with 1..=8
    /// fraction digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AmountError::Malformed(s.to_string());
        let (currency, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (value_str, frac_str) = match rest.split_once('.') {
            Some((v, f)) => (v, Some(f)),
            None => (rest, None),
        };
        if value_str.is_empty() || !value_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed());
        }
        let value: u64 = value_str.parse().map_err(|_| malformed())?;
        let fraction = match frac_str {
            None => 0,
            Some(f) => {
                if f.is_empty() || f.len() > 8 || !f.chars().all(|c| c.is_ascii_digit()) {
                    return Err(malformed());
                }
                let digits: u32 = f.parse().map_err(|_| malformed())?;
                digits * 10u32.pow(8 - f.len() as u32)
            }
        };
        Amount::new(currency, value, fraction)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Sum an iterator of amounts, all in `currency`. An empty iterator
/// yields zero.
pub fn sum_amounts<'a, I>(currency: &str, amounts: I) -> Result<Amount, AmountError>
where
    I: IntoIterator<Item = &'a Amount>,
{
    let mut total = Amount::zero(currency)?;
    for a in amounts {
        total = total.checked_add(a)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_value() {
        let a: Amount = "EUR:5".parse().unwrap();
        assert_eq!(a.currency(), "EUR");
        assert_eq!(a.value(), 5);
        assert_eq!(a.fraction(), 0);
    }

    #[test]
    fn test_parse_fraction_padding() {
        // "0.01" means one hundredth, i.e. 1_000_000 base units
        let a: Amount = "EUR:0.01".parse().unwrap();
        assert_eq!(a.fraction(), 1_000_000);

        let b: Amount = "EUR:0.00000001".parse().unwrap();
        assert_eq!(b.fraction(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "EUR",
            "EUR:",
            "eur:5",
            "EUR:5.",
            "EUR:5.123456789",
            "EUR:-1",
            ":5",
            "EUR:1x",
        ] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_display_canonical() {
        let a: Amount = "EUR:4.98".parse().unwrap();
        assert_eq!(a.to_string(), "EUR:4.98000000");
        let round_trip: Amount = a.to_string().parse().unwrap();
        assert_eq!(a, round_trip);
    }

    #[test]
    fn test_add_with_carry() {
        let a: Amount = "EUR:1.60000000".parse().unwrap();
        let b: Amount = "EUR:2.50000000".parse().unwrap();
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.to_string(), "EUR:4.10000000");
    }

    #[test]
    fn test_sub_with_borrow() {
        let a: Amount = "EUR:5".parse().unwrap();
        let fee: Amount = "EUR:0.01".parse().unwrap();
        let net = a.checked_sub(&fee).unwrap();
        assert_eq!(net.to_string(), "EUR:4.99000000");
    }

    #[test]
    fn test_sub_underflow() {
        let a: Amount = "EUR:1".parse().unwrap();
        let b: Amount = "EUR:2".parse().unwrap();
        assert_eq!(a.checked_sub(&b), Err(AmountError::Underflow));
    }

    #[test]
    fn test_currency_mismatch() {
        let a: Amount = "EUR:1".parse().unwrap();
        let b: Amount = "USD:1".parse().unwrap();
        assert!(matches!(
            a.checked_add(&b),
            Err(AmountError::CurrencyMismatch(_, _))
        ));
        assert!(a.cmp_checked(&b).is_err());
    }

    #[test]
    fn test_cmp() {
        let small: Amount = "EUR:1.50000000".parse().unwrap();
        let big: Amount = "EUR:1.60000000".parse().unwrap();
        assert_eq!(small.cmp_checked(&big).unwrap(), Ordering::Less);
        assert_eq!(big.cmp_checked(&small).unwrap(), Ordering::Greater);
        assert_eq!(small.cmp_checked(&small).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_mul_div() {
        let fee: Amount = "EUR:0.01".parse().unwrap();
        let amortized = fee.checked_mul(3).unwrap();
        assert_eq!(amortized.to_string(), "EUR:0.03000000");
        let share = amortized.divided_by(3).unwrap();
        assert_eq!(share, fee);
    }

    #[test]
    fn test_sum_amounts() {
        let coins: Vec<Amount> = ["EUR:2.50000000", "EUR:2.50000000", "EUR:0.01"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let total = sum_amounts("EUR", &coins).unwrap();
        assert_eq!(total.to_string(), "EUR:5.01000000");

        let empty = sum_amounts("EUR", &[]).unwrap();
        assert!(empty.is_zero());
    }
}
