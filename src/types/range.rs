//! Range types: `int4range`, `int8range`, `numrange`, `tsrange`,
//! `tstzrange` and `daterange`.

use bytes::{Buf, BufMut, BytesMut};
use std::cmp::Ordering;
use std::fmt;

use super::{binary, text, ColumnType, PgType, PgValue};
use crate::error::{sqlstate, PgError, PgResult};

const RANGE_EMPTY: u8 = 0x01;
const RANGE_LB_INC: u8 = 0x02;
const RANGE_UB_INC: u8 = 0x04;
const RANGE_LB_INF: u8 = 0x08;
const RANGE_UB_INF: u8 = 0x10;

#[derive(Clone, Debug, PartialEq)]
pub enum RangeBound {
    Unbounded,
    Inclusive(Box<PgValue>),
    Exclusive(Box<PgValue>),
}

impl RangeBound {
    fn value(&self) -> Option<&PgValue> {
        match self {
            RangeBound::Unbounded => None,
            RangeBound::Inclusive(v) | RangeBound::Exclusive(v) => Some(v),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PgRange {
    pub kind: PgType,
    pub empty: bool,
    pub lower: RangeBound,
    pub upper: RangeBound,
}

impl PgRange {
    pub fn empty(kind: PgType) -> Self {
        Self {
            kind,
            empty: true,
            lower: RangeBound::Unbounded,
            upper: RangeBound::Unbounded,
        }
    }

    /// Builds a range, normalizing discrete ranges to `[)` and collapsing
    /// ranges that contain no points to `empty`.
    pub fn new(kind: PgType, lower: RangeBound, upper: RangeBound) -> PgResult<Self> {
        let discrete = matches!(kind, PgType::Int4Range | PgType::Int8Range | PgType::DateRange);
        let (lower, upper) = if discrete {
            (canonical_lower(lower)?, canonical_upper(upper)?)
        } else {
            (lower, upper)
        };

        if let (Some(lo), Some(hi)) = (lower.value(), upper.value()) {
            match compare(lo, hi) {
                Some(Ordering::Greater) => {
                    return Err(PgError::new(
                        sqlstate::DATA_EXCEPTION,
                        "range lower bound must be less than or equal to range upper bound",
                    ))
                }
                Some(Ordering::Equal) => {
                    let both_inclusive = matches!(lower, RangeBound::Inclusive(_))
                        && matches!(upper, RangeBound::Inclusive(_));
                    if !both_inclusive {
                        return Ok(PgRange::empty(kind));
                    }
                }
                _ => {}
            }
        }
        Ok(Self {
            kind,
            empty: false,
            lower,
            upper,
        })
    }

    fn subtype(kind: PgType) -> ColumnType {
        ColumnType::scalar(kind.range_subtype().unwrap_or(PgType::Text))
    }

    pub fn parse(input: &str, kind: PgType) -> PgResult<PgRange> {
        let type_name = kind.typname();
        let invalid = || PgError::invalid_text(type_name, input);
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("empty") {
            return Ok(PgRange::empty(kind));
        }
        let lower_inclusive = match trimmed.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(invalid()),
        };
        let upper_inclusive = match trimmed.chars().last() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(invalid()),
        };
        if trimmed.len() < 2 {
            return Err(invalid());
        }
        let inner = &trimmed[1..trimmed.len() - 1];
        let (lo_raw, hi_raw) = split_bounds(inner).ok_or_else(invalid)?;

        let subtype = Self::subtype(kind);
        let bound = |raw: Option<String>, inclusive: bool| -> PgResult<RangeBound> {
            match raw {
                None => Ok(RangeBound::Unbounded),
                Some(text) => {
                    let value = Box::new(text::decode_text(&text, &subtype)?);
                    Ok(if inclusive {
                        RangeBound::Inclusive(value)
                    } else {
                        RangeBound::Exclusive(value)
                    })
                }
            }
        };
        PgRange::new(kind, bound(lo_raw, lower_inclusive)?, bound(hi_raw, upper_inclusive)?)
    }

    pub fn encode_binary(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.empty {
            buf.put_u8(RANGE_EMPTY);
            return;
        }
        match self.lower {
            RangeBound::Unbounded => flags |= RANGE_LB_INF,
            RangeBound::Inclusive(_) => flags |= RANGE_LB_INC,
            RangeBound::Exclusive(_) => {}
        }
        match self.upper {
            RangeBound::Unbounded => flags |= RANGE_UB_INF,
            RangeBound::Inclusive(_) => flags |= RANGE_UB_INC,
            RangeBound::Exclusive(_) => {}
        }
        buf.put_u8(flags);
        for value in [self.lower.value(), self.upper.value()].into_iter().flatten() {
            let mut element = BytesMut::new();
            binary::encode_binary(value, &mut element);
            buf.put_i32(element.len() as i32);
            buf.put_slice(&element);
        }
    }

    pub fn decode_binary(mut raw: &[u8], kind: PgType) -> PgResult<PgRange> {
        let type_name = kind.typname();
        if raw.is_empty() {
            return Err(PgError::invalid_binary(type_name, "missing flags"));
        }
        let flags = raw.get_u8();
        if flags & RANGE_EMPTY != 0 {
            return Ok(PgRange::empty(kind));
        }
        let subtype = Self::subtype(kind);
        let mut read_bound = |infinite: u8, inclusive: u8| -> PgResult<RangeBound> {
            if flags & infinite != 0 {
                return Ok(RangeBound::Unbounded);
            }
            if raw.len() < 4 {
                return Err(PgError::invalid_binary(type_name, "truncated bound"));
            }
            let len = raw.get_i32();
            if len < 0 || raw.len() < len as usize {
                return Err(PgError::invalid_binary(type_name, "invalid bound length"));
            }
            let (element, rest) = raw.split_at(len as usize);
            let value = Box::new(binary::decode_binary(element, &subtype)?);
            raw = rest;
            Ok(if flags & inclusive != 0 {
                RangeBound::Inclusive(value)
            } else {
                RangeBound::Exclusive(value)
            })
        };
        let lower = read_bound(RANGE_LB_INF, RANGE_LB_INC)?;
        let upper = read_bound(RANGE_UB_INF, RANGE_UB_INC)?;
        PgRange::new(kind, lower, upper)
    }
}

/// Splits `lo,hi` at the top-level comma. Empty unquoted sides are unbounded.
fn split_bounds(inner: &str) -> Option<(Option<String>, Option<String>)> {
    let mut parts: Vec<(String, bool)> = vec![(String::new(), false)];
    let mut chars = inner.chars();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                parts.last_mut()?.1 = true;
            }
            '\\' => parts.last_mut()?.0.push(chars.next()?),
            ',' if !in_quotes => parts.push((String::new(), false)),
            c => parts.last_mut()?.0.push(c),
        }
    }
    if parts.len() != 2 || in_quotes {
        return None;
    }
    let mut sides = parts.into_iter().map(|(text, quoted)| {
        if !quoted && text.trim().is_empty() {
            None
        } else if quoted {
            Some(text)
        } else {
            Some(text.trim().to_string())
        }
    });
    Some((sides.next()?, sides.next()?))
}

fn successor(value: &PgValue) -> PgResult<PgValue> {
    match value {
        PgValue::Int4(v) => v
            .checked_add(1)
            .map(PgValue::Int4)
            .ok_or_else(|| PgError::out_of_range("integer")),
        PgValue::Int8(v) => v
            .checked_add(1)
            .map(PgValue::Int8)
            .ok_or_else(|| PgError::out_of_range("bigint")),
        PgValue::Date(d) => d
            .succ_opt()
            .map(PgValue::Date)
            .ok_or_else(|| PgError::out_of_range("date")),
        other => Ok(other.clone()),
    }
}

fn canonical_lower(bound: RangeBound) -> PgResult<RangeBound> {
    match bound {
        RangeBound::Exclusive(v) => Ok(RangeBound::Inclusive(Box::new(successor(&v)?))),
        other => Ok(other),
    }
}

fn canonical_upper(bound: RangeBound) -> PgResult<RangeBound> {
    match bound {
        RangeBound::Inclusive(v) => Ok(RangeBound::Exclusive(Box::new(successor(&v)?))),
        other => Ok(other),
    }
}

fn compare(a: &PgValue, b: &PgValue) -> Option<Ordering> {
    match (a, b) {
        (PgValue::Int4(x), PgValue::Int4(y)) => Some(x.cmp(y)),
        (PgValue::Int8(x), PgValue::Int8(y)) => Some(x.cmp(y)),
        (PgValue::Numeric(x), PgValue::Numeric(y)) => Some(x.cmp(y)),
        (PgValue::Date(x), PgValue::Date(y)) => Some(x.cmp(y)),
        (PgValue::Timestamp(x), PgValue::Timestamp(y)) => Some(x.cmp(y)),
        (PgValue::TimestampTz(x), PgValue::TimestampTz(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn quote_bound(text: String) -> String {
    let needs_quotes = text.is_empty()
        || text
            .chars()
            .any(|c| matches!(c, ',' | '(' | ')' | '[' | ']' | '"' | '\\') || c.is_whitespace());
    if !needs_quotes {
        return text;
    }
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl fmt::Display for PgRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty {
            return f.write_str("empty");
        }
        let open = if matches!(self.lower, RangeBound::Inclusive(_)) { '[' } else { '(' };
        let close = if matches!(self.upper, RangeBound::Inclusive(_)) { ']' } else { ')' };
        let render = |bound: &RangeBound| {
            bound
                .value()
                .map(|v| quote_bound(text::encode_text(v)))
                .unwrap_or_default()
        };
        write!(f, "{open}{},{}{close}", render(&self.lower), render(&self.upper))
    }
}
