use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode};
use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Numeric;
use diesel::{AsExpression, FromSqlRow};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monetary amount, always held as an exact decimal scaled to cents.
/// Parsed once at catalog ingestion; never re-parsed from display strings.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = Numeric)]
#[serde(transparent)]
pub struct Money(BigDecimal);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyParseError {
    #[error("price is empty")]
    Empty,
    #[error("unparsable price: {0:?}")]
    Malformed(String),
    #[error("negative price: {0:?}")]
    Negative(String),
}

impl Money {
    /// Accepts free-form listing prices such as `"$12.50"`, `"SGD 12"`,
    /// `"s$1,200"` or `" 12 "`.
    pub fn parse(input: &str) -> Result<Money, MoneyParseError> {
        let mut s = input.trim().to_uppercase();
        for token in ["SGD", "S$", "$", ","] {
            s = s.replace(token, "");
        }
        let s = s.trim();
        if s.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        let value =
            BigDecimal::from_str(s).map_err(|_| MoneyParseError::Malformed(input.to_string()))?;
        if value < BigDecimal::zero() {
            return Err(MoneyParseError::Negative(input.to_string()));
        }
        Ok(Money(value.with_scale_round(2, RoundingMode::HalfUp)))
    }

    pub fn zero() -> Money {
        Money(BigDecimal::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Line total: unit price times a unit count.
    pub fn times(&self, quantity: i32) -> Money {
        Money(&self.0 * BigDecimal::from(quantity))
    }

    pub fn as_decimal(&self) -> &BigDecimal {
        &self.0
    }
}

impl From<BigDecimal> for Money {
    fn from(value: BigDecimal) -> Money {
        Money(value)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.with_scale_round(2, RoundingMode::HalfUp))
    }
}

impl ToSql<Numeric, Pg> for Money {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <BigDecimal as ToSql<Numeric, Pg>>::to_sql(&self.0, out)
    }
}

impl FromSql<Numeric, Pg> for Money {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        <BigDecimal as FromSql<Numeric, Pg>>::from_sql(bytes).map(Money)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_currency_prefixes_and_whitespace() {
        assert_eq!(Money::parse("$12.50").unwrap().to_string(), "12.50");
        assert_eq!(Money::parse("SGD 12").unwrap().to_string(), "12.00");
        assert_eq!(Money::parse("s$1,200").unwrap().to_string(), "1200.00");
        assert_eq!(Money::parse("  3.5 ").unwrap().to_string(), "3.50");
    }

    #[test]
    fn rejects_garbage_and_negatives() {
        assert_eq!(Money::parse("   "), Err(MoneyParseError::Empty));
        assert!(matches!(
            Money::parse("twelve"),
            Err(MoneyParseError::Malformed(_))
        ));
        assert!(matches!(
            Money::parse("-4.00"),
            Err(MoneyParseError::Negative(_))
        ));
    }

    #[test]
    fn line_total_and_sum_keep_exact_cents() {
        let price = Money::parse("$12.50").unwrap();
        let fee = Money::parse("3.50").unwrap();
        let total = price.times(1) + fee;
        assert_eq!(total.to_string(), "16.00");

        let subtotal: Money = vec![price.times(3), Money::parse("0.10").unwrap().times(3)]
            .into_iter()
            .sum();
        assert_eq!(subtotal.to_string(), "37.80");
    }

    #[test]
    fn zero_detection() {
        assert!(Money::zero().is_zero());
        assert!(!Money::parse("0.01").unwrap().is_zero());
        assert!(Money::parse("0").unwrap().is_zero());
    }
}
