//! NUMERIC: `rust_decimal` values and the base-10000 binary wire form.

use bytes::{Buf, BufMut};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{sqlstate, PgError, PgResult};

/// Digits a double carries without rounding.
const EXACT_REAL_DIGITS: usize = 15;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

pub fn parse(input: &str) -> PgResult<Decimal> {
    let trimmed = input.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| {
            if is_number_syntax(trimmed) {
                PgError::new(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE, "value overflows numeric format")
            } else {
                PgError::invalid_text("numeric", input)
            }
        })
}

fn is_number_syntax(text: &str) -> bool {
    text.bytes().any(|b| b.is_ascii_digit())
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'+' | b'-' | b'e' | b'E'))
}

/// Significant digits of `value`, ignoring trailing zeros.
pub fn significant_digits(value: &Decimal) -> usize {
    let mantissa = value.mantissa().unsigned_abs().to_string();
    mantissa.trim_end_matches('0').len().max(1)
}

/// Checks that SQLite can hold `value` without rounding it.
///
/// Under NUMERIC affinity SQLite keeps a number as a 64-bit integer or a
/// double, whatever storage class it was handed in, so anything else is
/// refused with `22003` instead of being stored rounded.
pub fn check_storable(value: &Decimal) -> PgResult<()> {
    if value.fract().is_zero() && value.to_i64().is_some() {
        return Ok(());
    }
    if significant_digits(value) <= EXACT_REAL_DIGITS {
        return Ok(());
    }
    Err(PgError::new(
        sqlstate::NUMERIC_VALUE_OUT_OF_RANGE,
        format!("numeric value {value} cannot be stored without loss of precision"),
    )
    .with_hint(format!(
        "Values that are not 64-bit integers are limited to {EXACT_REAL_DIGITS} significant digits."
    )))
}

/// Applies a declared scale, rounding half away from zero like PostgreSQL.
pub fn rescale(mut value: Decimal, scale: u32) -> Decimal {
    value = value.round_dp_with_strategy(scale, rust_decimal::RoundingStrategy::MidpointAwayFromZero);
    value.rescale(scale);
    value
}

/// Encodes a decimal as PostgreSQL's binary NUMERIC:
/// `ndigits, weight, sign, dscale` followed by base-10000 digits.
pub fn encode(value: &Decimal, buf: &mut impl BufMut) {
    let dscale = value.scale() as u16;
    let text = value.abs().to_string();
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (text.clone(), String::new()),
    };
    let int_part = int_part.trim_start_matches('0');

    let int_pad = (4 - int_part.len() % 4) % 4;
    let int_digits = format!("{}{}", "0".repeat(int_pad), int_part);
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let frac_digits = format!("{}{}", frac_part, "0".repeat(frac_pad));

    let mut groups: Vec<i16> = Vec::new();
    for chunk in int_digits.as_bytes().chunks(4).chain(frac_digits.as_bytes().chunks(4)) {
        let group = chunk.iter().fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16);
        groups.push(group);
    }
    let mut weight = (int_digits.len() / 4) as i16 - 1;

    while groups.first() == Some(&0) {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    let sign = if value.is_sign_negative() && !value.is_zero() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    buf.put_i16(groups.len() as i16);
    buf.put_i16(weight);
    buf.put_u16(sign);
    buf.put_u16(dscale);
    for group in groups {
        buf.put_i16(group);
    }
}

pub fn decode(mut raw: &[u8]) -> PgResult<Decimal> {
    if raw.len() < 8 {
        return Err(PgError::invalid_binary("numeric", "header too short"));
    }
    let ndigits = raw.get_i16();
    let weight = raw.get_i16() as i32;
    let sign = raw.get_u16();
    let dscale = raw.get_u16() as usize;
    if ndigits < 0 || raw.len() != ndigits as usize * 2 {
        return Err(PgError::invalid_binary("numeric", "digit count mismatch"));
    }
    if sign == NUMERIC_NAN {
        return Err(PgError::invalid_binary("numeric", "NaN is not supported"));
    }
    if sign != NUMERIC_POS && sign != NUMERIC_NEG {
        return Err(PgError::invalid_binary("numeric", "invalid sign"));
    }

    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        let digit = raw.get_i16();
        if !(0..10000).contains(&digit) {
            return Err(PgError::invalid_binary("numeric", "digit out of range"));
        }
        digits.push(digit);
    }

    // Position p holds the digit for 10000^(weight - p).
    let digit_at = |power: i32| -> i16 {
        let idx = weight - power;
        if idx >= 0 && (idx as usize) < digits.len() {
            digits[idx as usize]
        } else {
            0
        }
    };

    let mut int_part = String::new();
    if weight >= 0 {
        for power in (0..=weight).rev() {
            if int_part.is_empty() {
                int_part.push_str(&digit_at(power).to_string());
            } else {
                int_part.push_str(&format!("{:04}", digit_at(power)));
            }
        }
    } else {
        int_part.push('0');
    }

    let mut frac_part = String::new();
    let mut power = -1;
    while frac_part.len() < dscale {
        frac_part.push_str(&format!("{:04}", digit_at(power)));
        power -= 1;
    }
    frac_part.truncate(dscale);

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    text.push_str(&int_part);
    if !frac_part.is_empty() {
        text.push('.');
        text.push_str(&frac_part);
    }
    Decimal::from_str(&text).map_err(|e| PgError::invalid_binary("numeric", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str) -> Decimal {
        let value = Decimal::from_str(text).unwrap();
        let mut buf = Vec::new();
        encode(&value, &mut buf);
        decode(&buf).unwrap()
    }

    #[test]
    fn binary_preserves_value_and_scale() {
        for text in ["0", "0.00", "1", "-1", "12345.678", "10000", "0.0001", "-99999999.99"] {
            let decoded = round_trip(text);
            assert_eq!(decoded.to_string(), text, "round trip of {text}");
        }
    }

    #[test]
    fn binary_layout_matches_postgres() {
        let mut buf = Vec::new();
        encode(&Decimal::from_str("12345.67").unwrap(), &mut buf);
        // ndigits=3, weight=1, sign=+, dscale=2, digits 1 2345 6700
        assert_eq!(
            buf,
            vec![0, 3, 0, 1, 0, 0, 0, 2, 0, 1, 0x09, 0x29, 0x1A, 0x2C]
        );
    }

    #[test]
    fn rescale_pads_and_rounds() {
        assert_eq!(rescale(Decimal::from_str("12.5").unwrap(), 2).to_string(), "12.50");
        assert_eq!(rescale(Decimal::from_str("1.005").unwrap(), 2).to_string(), "1.01");
    }

    #[test]
    fn rejects_garbage_text() {
        let err = parse("twelve").unwrap_err();
        assert_eq!(err.code, sqlstate::INVALID_TEXT_REPRESENTATION);
        let err = parse("123456789012345678901234567890.5").unwrap_err();
        assert_eq!(err.code, sqlstate::NUMERIC_VALUE_OUT_OF_RANGE);
    }

    #[test]
    fn storable_values_fit_an_integer_or_a_double() {
        for text in ["42", "-9223372036854775808", "12.25", "0.000001", "1e20", "123456789.012345"] {
            let value = parse(text).unwrap();
            assert!(check_storable(&value).is_ok(), "{text} should be storable");
        }
        for text in ["1234567890.1234567890", "12345678901234567.25", "99999999999999999999"] {
            let err = check_storable(&parse(text).unwrap()).unwrap_err();
            assert_eq!(err.code, sqlstate::NUMERIC_VALUE_OUT_OF_RANGE, "{text}");
        }
        assert_eq!(significant_digits(&rescale(parse("1.5").unwrap(), 10)), 2);
    }
}
