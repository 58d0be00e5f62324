//! Fixed-point product prices.
//!
//! Prices are held as whole cents so that catalog state never accumulates
//! binary floating point error. The device speaks JSON numbers; those are
//! parsed from their literal text (serde_json `arbitrary_precision`), never
//! through an `f64`.

use serde::de::{self, value::MapAccessDeserializer, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A price in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price(i64);

impl Price {
    /// Zero.
    pub const ZERO: Price = Price(0);

    /// Create a price from cents.
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Price(cents)
    }

    /// The price in cents.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Check if below zero.
    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Approximate value in major units, for the wire.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Convert a major-unit float via its shortest decimal text, so `1.005`
    /// rounds like the string `"1.005"` rather than like its binary value.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        value.to_string().parse().ok()
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Price {
    type Err = Error;

    /// Parse decimal text such as `"9.99"`, `"10"` or `"-0.5"`.
    ///
    /// Digits past the second decimal place round half away from zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::invalid("price", s);
        let text = s.trim();

        if text.contains(['e', 'E']) {
            let value: f64 = text.parse().map_err(|_| invalid())?;
            return Price::from_f64(value).ok_or_else(invalid);
        }

        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction)
        {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };

        let mut fraction = fraction.bytes().map(|b| i64::from(b - b'0'));
        let tenths = fraction.next().unwrap_or(0);
        let hundredths = fraction.next().unwrap_or(0);
        let round_up = fraction.next().map(|d| d >= 5).unwrap_or(false);

        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(tenths * 10 + hundredths + i64::from(round_up)))
            .ok_or_else(invalid)?;

        Ok(Price(if negative { -cents } else { cents }))
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PriceVisitor)
    }
}

struct PriceVisitor;

impl<'de> Visitor<'de> for PriceVisitor {
    type Value = Price;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a price as a number or decimal string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Price, E> {
        v.checked_mul(100)
            .map(Price)
            .ok_or_else(|| E::custom(format!("price {} out of range", v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Price, E> {
        i64::try_from(v)
            .ok()
            .and_then(|v| v.checked_mul(100))
            .map(Price)
            .ok_or_else(|| E::custom(format!("price {} out of range", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Price, E> {
        Price::from_f64(v).ok_or_else(|| E::custom(format!("price {} out of range", v)))
    }

    /// serde_json hands over arbitrary-precision numbers as a one-entry map.
    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Price, A::Error> {
        let number = serde_json::Number::deserialize(MapAccessDeserializer::new(map))?;
        let text = number.to_string();
        text.parse()
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&text), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Price, E> {
        v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("9.99".parse::<Price>().unwrap(), Price::from_cents(999));
        assert_eq!("10".parse::<Price>().unwrap(), Price::from_cents(1000));
        assert_eq!("10.5".parse::<Price>().unwrap(), Price::from_cents(1050));
        assert_eq!(".25".parse::<Price>().unwrap(), Price::from_cents(25));
        assert_eq!("-1.20".parse::<Price>().unwrap(), Price::from_cents(-120));
        assert_eq!(" 3.00 ".parse::<Price>().unwrap(), Price::from_cents(300));
        assert_eq!("1e2".parse::<Price>().unwrap(), Price::from_cents(10_000));
    }

    #[test]
    fn test_parse_rounds_extra_digits() {
        assert_eq!("9.995".parse::<Price>().unwrap(), Price::from_cents(1000));
        assert_eq!("9.994".parse::<Price>().unwrap(), Price::from_cents(999));
        assert_eq!("-0.005".parse::<Price>().unwrap(), Price::from_cents(-1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", ".", "abc", "1.2.3", "1,50", "--1", "NaN"] {
            assert!(bad.parse::<Price>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Price::from_cents(999).to_string(), "9.99");
        assert_eq!(Price::from_cents(5).to_string(), "0.05");
        assert_eq!(Price::from_cents(-150).to_string(), "-1.50");
        assert_eq!(Price::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_json_number() {
        assert_eq!(serde_json::to_string(&Price::from_cents(999)).unwrap(), "9.99");
        assert_eq!(serde_json::from_str::<Price>("9.99").unwrap().cents(), 999);
        assert_eq!(serde_json::from_str::<Price>("12").unwrap().cents(), 1200);
        assert_eq!(serde_json::from_str::<Price>("\"4.50\"").unwrap().cents(), 450);
        assert!(serde_json::from_str::<Price>("true").is_err());
    }

    #[test]
    fn test_json_number_rounds_like_text() {
        for literal in ["1.005", "2.675", "0.125", "9.995", "-0.005", "1.0049999999999999"] {
            let number = serde_json::from_str::<Price>(literal).unwrap();
            let text = serde_json::from_str::<Price>(&format!("\"{}\"", literal)).unwrap();
            assert_eq!(number, text, "literal {}", literal);
        }
        assert_eq!(serde_json::from_str::<Price>("1.005").unwrap().cents(), 101);
        assert_eq!(serde_json::from_str::<Price>("1.0049999999999999").unwrap().cents(), 100);
    }

    #[test]
    fn test_from_f64_uses_decimal_text() {
        assert_eq!(Price::from_f64(1.005), Some(Price::from_cents(101)));
        assert_eq!(Price::from_f64(2.675), Some(Price::from_cents(268)));
        assert_eq!(Price::from_f64(f64::NAN), None);
        assert_eq!(Price::from_f64(f64::INFINITY), None);
    }
}
