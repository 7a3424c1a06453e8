use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ISO 4217 currencies accepted by at least one gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    PHP,
    USD,
    EUR,
    GBP,
    SGD,
    JPY,
    AUD,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::PHP => "PHP",
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::SGD => "SGD",
            Currency::JPY => "JPY",
            Currency::AUD => "AUD",
        }
    }

    /// Number of decimal places in the currency's minor unit.
    pub fn minor_unit_exponent(&self) -> u32 {
        match self {
            Currency::JPY => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PHP" => Ok(Currency::PHP),
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "SGD" => Ok(Currency::SGD),
            "JPY" => Ok(Currency::JPY),
            "AUD" => Ok(Currency::AUD),
            other => Err(PaymentError::UnsupportedCurrency(other.to_string())),
        }
    }
}

/// A strictly positive monetary amount.
///
/// Construction rejects zero and negative values so that gateway clients
/// never have to re-check the sign.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::InvalidAmount(format!(
                "amount must be positive, got {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Converts to the integer minor-unit representation most provider APIs
    /// expect (centavos, cents). Fails when the amount has more precision
    /// than the currency allows.
    pub fn to_minor_units(&self, currency: Currency) -> Result<i64, PaymentError> {
        to_minor_units(self.0, currency)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn to_minor_units(value: Decimal, currency: Currency) -> Result<i64, PaymentError> {
    let scaled = value
        .checked_mul(Decimal::from(10_i64.pow(currency.minor_unit_exponent())))
        .ok_or_else(|| PaymentError::InvalidAmount(format!("{value} is out of range")))?;
    if scaled.fract() != Decimal::ZERO {
        return Err(PaymentError::InvalidAmount(format!(
            "{value} has more precision than {currency} allows"
        )));
    }
    i64::try_from(scaled.trunc())
        .map_err(|_| PaymentError::InvalidAmount(format!("{value} is out of range")))
}

pub fn from_minor_units(units: i64, currency: Currency) -> Decimal {
    Decimal::new(units, currency.minor_unit_exponent())
}

/// Formats an amount with exactly the currency's minor-unit precision, as
/// PayPal and Maya expect for string amounts.
pub fn format_major(value: Decimal, currency: Currency) -> String {
    let mut rounded = value.round_dp(currency.minor_unit_exponent());
    rounded.rescale(currency.minor_unit_exponent());
    rounded.to_string()
}
