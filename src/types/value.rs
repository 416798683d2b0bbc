use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

use super::{
    array::PgArray, datetime::Interval, network::{IpNet, MacAddr, MacAddr8}, numeric,
    range::PgRange, text::{decode_text, encode_text}, ColumnType, PgType,
};
use crate::error::{PgError, PgResult};

/// A logical PostgreSQL value.
///
/// This is the pivot between SQLite's storage classes and the two wire
/// formats: rows read from SQLite become `PgValue`s according to the column's
/// resolved [`ColumnType`], and bound parameters are decoded into `PgValue`s
/// before being handed to SQLite in their storage form.
#[derive(Clone, Debug, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Text(String),
    Bytea(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Interval(Interval),
    Uuid(Uuid),
    Json(String),
    Jsonb(String),
    Inet(IpNet),
    Cidr(IpNet),
    MacAddr(MacAddr),
    MacAddr8(MacAddr8),
    Oid(u32),
    /// A type OID rendered by name.
    RegType(u32),
    Range(PgRange),
    Array(PgArray),
}

impl PgValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Converts to the value stored in (or bound into) SQLite.
    ///
    /// Fails with `22003` for NUMERIC values SQLite would round.
    pub fn to_sql(&self) -> PgResult<SqlValue> {
        let value = match self {
            PgValue::Null => SqlValue::Null,
            PgValue::Bool(b) => SqlValue::Integer(*b as i64),
            PgValue::Int2(v) => SqlValue::Integer(*v as i64),
            PgValue::Int4(v) => SqlValue::Integer(*v as i64),
            PgValue::Int8(v) => SqlValue::Integer(*v),
            PgValue::Oid(v) | PgValue::RegType(v) => SqlValue::Integer(*v as i64),
            PgValue::Float4(v) => SqlValue::Real(*v as f64),
            PgValue::Float8(v) => SqlValue::Real(*v),
            PgValue::Numeric(d) => numeric_to_sql(d)?,
            PgValue::Text(s) | PgValue::Json(s) | PgValue::Jsonb(s) => SqlValue::Text(s.clone()),
            PgValue::Bytea(b) => SqlValue::Blob(b.clone()),
            PgValue::Array(arr) => SqlValue::Text(arr.to_json().to_string()),
            other => SqlValue::Text(encode_text(other)),
        };
        Ok(value)
    }

    /// Reads a SQLite value back as the column's declared PostgreSQL type.
    pub fn from_sql(value: ValueRef<'_>, ty: &ColumnType) -> PgResult<PgValue> {
        if let ValueRef::Null = value {
            return Ok(PgValue::Null);
        }
        if ty.array {
            return match value {
                ValueRef::Text(raw) => {
                    PgArray::from_storage(&String::from_utf8_lossy(raw), ty.base).map(PgValue::Array)
                }
                _ => Err(PgError::invalid_text(&ty.to_string(), &sql_to_string(value))),
            };
        }

        let converted = match (ty.base, value) {
            (PgType::Bool, ValueRef::Integer(i)) => PgValue::Bool(i != 0),
            (PgType::Bool, ValueRef::Real(f)) => PgValue::Bool(f != 0.0),
            (PgType::Int2, ValueRef::Integer(i)) => {
                PgValue::Int2(i16::try_from(i).map_err(|_| PgError::out_of_range("smallint"))?)
            }
            (PgType::Int4, ValueRef::Integer(i)) => {
                PgValue::Int4(i32::try_from(i).map_err(|_| PgError::out_of_range("integer"))?)
            }
            (PgType::Int8, ValueRef::Integer(i)) => PgValue::Int8(i),
            (PgType::Oid, ValueRef::Integer(i)) => {
                PgValue::Oid(u32::try_from(i).map_err(|_| PgError::out_of_range("oid"))?)
            }
            (PgType::RegType, ValueRef::Integer(i)) => {
                PgValue::RegType(u32::try_from(i).map_err(|_| PgError::out_of_range("regtype"))?)
            }
            (PgType::Int2 | PgType::Int4 | PgType::Int8, ValueRef::Real(f)) if f.fract() == 0.0 => {
                return PgValue::from_sql(ValueRef::Integer(f as i64), ty);
            }
            (PgType::Float4, ValueRef::Integer(i)) => PgValue::Float4(i as f32),
            (PgType::Float4, ValueRef::Real(f)) => PgValue::Float4(f as f32),
            (PgType::Float8, ValueRef::Integer(i)) => PgValue::Float8(i as f64),
            (PgType::Float8, ValueRef::Real(f)) => PgValue::Float8(f),
            (PgType::Numeric, ValueRef::Integer(i)) => PgValue::Numeric(Decimal::from(i)),
            (PgType::Numeric, ValueRef::Real(f)) => {
                let text = f.to_string();
                PgValue::Numeric(numeric::parse(&text)?)
            }
            (PgType::Bytea, ValueRef::Blob(b)) => PgValue::Bytea(b.to_vec()),
            (PgType::Bytea, ValueRef::Text(t)) => {
                let text = String::from_utf8_lossy(t);
                if text.starts_with("\\x") {
                    decode_text(&text, ty)?
                } else {
                    PgValue::Bytea(t.to_vec())
                }
            }
            (PgType::Json | PgType::Jsonb, ValueRef::Integer(_) | ValueRef::Real(_)) => {
                let text = sql_to_string(value);
                if ty.base == PgType::Json {
                    PgValue::Json(text)
                } else {
                    PgValue::Jsonb(text)
                }
            }
            (base, _) if base.is_textual() => PgValue::Text(sql_to_string(value)),
            (_, ValueRef::Blob(b)) => decode_text(&String::from_utf8_lossy(b), ty)?,
            _ => decode_text(&sql_to_string(value), ty)?,
        };

        Ok(match (converted, ty.numeric_scale()) {
            (PgValue::Numeric(d), Some(scale)) => PgValue::Numeric(numeric::rescale(d, scale)),
            (other, _) => other,
        })
    }

    /// JSON form used when arrays are stored as JSON text.
    pub fn to_json(&self) -> JsonValue {
        match self {
            PgValue::Null => JsonValue::Null,
            PgValue::Bool(b) => JsonValue::Bool(*b),
            PgValue::Int2(v) => JsonValue::from(*v),
            PgValue::Int4(v) => JsonValue::from(*v),
            PgValue::Int8(v) => JsonValue::from(*v),
            PgValue::Oid(v) => JsonValue::from(*v),
            PgValue::Float4(v) => float_json(*v as f64),
            PgValue::Float8(v) => float_json(*v),
            PgValue::Numeric(d) => {
                serde_json::from_str(&d.to_string()).unwrap_or_else(|_| JsonValue::String(d.to_string()))
            }
            PgValue::Text(s) => JsonValue::String(s.clone()),
            PgValue::Json(s) | PgValue::Jsonb(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone()))
            }
            PgValue::Array(arr) => arr.to_json(),
            other => JsonValue::String(encode_text(other)),
        }
    }

    pub fn from_json(json: &JsonValue, element: PgType) -> PgResult<PgValue> {
        let ty = ColumnType::scalar(element);
        match (element, json) {
            (_, JsonValue::Null) => Ok(PgValue::Null),
            (PgType::Json, other) => Ok(PgValue::Json(other.to_string())),
            (PgType::Jsonb, other) => Ok(PgValue::Jsonb(other.to_string())),
            (_, JsonValue::String(s)) => decode_text(s, &ty),
            (PgType::Bool, JsonValue::Bool(b)) => Ok(PgValue::Bool(*b)),
            (PgType::Float4 | PgType::Float8, JsonValue::Number(n)) => {
                let f = n.as_f64().ok_or_else(|| PgError::invalid_text(&ty.to_string(), &n.to_string()))?;
                Ok(if element == PgType::Float4 {
                    PgValue::Float4(f as f32)
                } else {
                    PgValue::Float8(f)
                })
            }
            (_, JsonValue::Array(_)) => Err(PgError::invalid_text(&ty.to_string(), &json.to_string())),
            (_, other) => decode_text(&other.to_string(), &ty),
        }
    }

    /// Best-effort integer view, used by LIMIT handling and range canonicalization.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(*v as i64),
            PgValue::Int4(v) => Some(*v as i64),
            PgValue::Int8(v) => Some(*v),
            PgValue::Oid(v) => Some(*v as i64),
            PgValue::Numeric(d) => d.to_i64(),
            _ => None,
        }
    }
}

fn float_json(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(encode_text(&PgValue::Float8(f))))
}

/// Integral values bind as INTEGER, the rest as REAL once they are known to
/// survive the conversion.
fn numeric_to_sql(d: &Decimal) -> PgResult<SqlValue> {
    numeric::check_storable(d)?;
    if d.fract().is_zero() {
        if let Some(i) = d.to_i64() {
            return Ok(SqlValue::Integer(i));
        }
    }
    f64::from_str(&d.to_string())
        .map(SqlValue::Real)
        .map_err(|_| PgError::out_of_range("numeric"))
}

fn sql_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{f:.1}")
            } else {
                f.to_string()
            }
        }
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeModifier;

    fn numeric_10_2() -> ColumnType {
        ColumnType::scalar(PgType::Numeric).with_modifier(TypeModifier::Numeric {
            precision: 10,
            scale: 2,
        })
    }

    #[test]
    fn numeric_reads_back_with_declared_scale() {
        let value = PgValue::from_sql(ValueRef::Real(12.5), &numeric_10_2()).unwrap();
        assert_eq!(encode_text(&value), "12.50");
        let value = PgValue::from_sql(ValueRef::Integer(3), &numeric_10_2()).unwrap();
        assert_eq!(encode_text(&value), "3.00");
    }

    #[test]
    fn numeric_storage_class_depends_on_precision() {
        let d = Decimal::from_str("42").unwrap();
        assert_eq!(PgValue::Numeric(d).to_sql().unwrap(), SqlValue::Integer(42));
        let d = Decimal::from_str("12.25").unwrap();
        assert_eq!(PgValue::Numeric(d).to_sql().unwrap(), SqlValue::Real(12.25));
        let d = Decimal::from_str("1234567890.1234567890").unwrap();
        let err = PgValue::Numeric(d).to_sql().unwrap_err();
        assert_eq!(err.code, crate::error::sqlstate::NUMERIC_VALUE_OUT_OF_RANGE);
    }

    #[test]
    fn fifteen_digit_numerics_read_back_exactly() {
        let ty = ColumnType::scalar(PgType::Numeric).with_modifier(TypeModifier::Numeric {
            precision: 30,
            scale: 10,
        });
        let d = Decimal::from_str("12345.6789012345").unwrap();
        let stored = PgValue::Numeric(d).to_sql().unwrap();
        let SqlValue::Real(f) = stored else {
            panic!("expected REAL storage, got {stored:?}");
        };
        let value = PgValue::from_sql(ValueRef::Real(f), &ty).unwrap();
        assert_eq!(encode_text(&value), "12345.6789012345");
    }

    #[test]
    fn integers_are_range_checked() {
        let int4 = ColumnType::scalar(PgType::Int4);
        assert_eq!(PgValue::from_sql(ValueRef::Integer(7), &int4).unwrap(), PgValue::Int4(7));
        let err = PgValue::from_sql(ValueRef::Integer(i64::MAX), &int4).unwrap_err();
        assert_eq!(err.code, crate::error::sqlstate::NUMERIC_VALUE_OUT_OF_RANGE);
    }

    #[test]
    fn stored_text_is_decoded_by_declared_type() {
        let ts = ColumnType::scalar(PgType::TimestampTz);
        let value = PgValue::from_sql(ValueRef::Text(b"2024-01-02 03:04:05+00"), &ts).unwrap();
        assert_eq!(encode_text(&value), "2024-01-02 03:04:05+00");

        let bool_ty = ColumnType::scalar(PgType::Bool);
        assert_eq!(PgValue::from_sql(ValueRef::Integer(1), &bool_ty).unwrap(), PgValue::Bool(true));
    }

    #[test]
    fn arrays_store_as_json() {
        let ty = ColumnType::array_of(PgType::Int4);
        let value = PgValue::from_sql(ValueRef::Text(b"[1,2,null]"), &ty).unwrap();
        assert_eq!(encode_text(&value), "{1,2,NULL}");
        assert_eq!(value.to_sql().unwrap(), SqlValue::Text("[1,2,null]".to_string()));

        let legacy = PgValue::from_sql(ValueRef::Text(b"{1,2,NULL}"), &ty).unwrap();
        assert_eq!(legacy, value);
    }
}
