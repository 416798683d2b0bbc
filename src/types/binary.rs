//! Binary wire format (format code 1). All integers are network byte order.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use super::{
    array::PgArray,
    datetime::{self, Interval},
    network::{IpNet, MacAddr, MacAddr8},
    numeric,
    range::PgRange,
    ColumnType, PgType, PgValue,
};
use crate::error::{PgError, PgResult};

pub fn encode_binary(value: &PgValue, buf: &mut BytesMut) {
    match value {
        PgValue::Null => {}
        PgValue::Bool(b) => buf.put_u8(*b as u8),
        PgValue::Int2(v) => buf.put_i16(*v),
        PgValue::Int4(v) => buf.put_i32(*v),
        PgValue::Int8(v) => buf.put_i64(*v),
        PgValue::Oid(v) | PgValue::RegType(v) => buf.put_u32(*v),
        PgValue::Float4(v) => buf.put_f32(*v),
        PgValue::Float8(v) => buf.put_f64(*v),
        PgValue::Numeric(d) => numeric::encode(d, buf),
        PgValue::Text(s) | PgValue::Json(s) => buf.put_slice(s.as_bytes()),
        PgValue::Jsonb(s) => {
            buf.put_u8(1);
            buf.put_slice(s.as_bytes());
        }
        PgValue::Bytea(b) => buf.put_slice(b),
        PgValue::Date(d) => buf.put_i32(datetime::date_to_pg_days(d)),
        PgValue::Time(t) => buf.put_i64(datetime::time_to_pg_micros(t)),
        PgValue::Timestamp(ts) => buf.put_i64(datetime::timestamp_to_pg_micros(ts)),
        PgValue::TimestampTz(ts) => buf.put_i64(datetime::timestamp_to_pg_micros(&ts.naive_utc())),
        PgValue::Interval(i) => {
            buf.put_i64(i.micros);
            buf.put_i32(i.days);
            buf.put_i32(i.months);
        }
        PgValue::Uuid(u) => buf.put_slice(u.as_bytes()),
        PgValue::Inet(net) => net.encode(false, buf),
        PgValue::Cidr(net) => net.encode(true, buf),
        PgValue::MacAddr(m) => buf.put_slice(&m.0),
        PgValue::MacAddr8(m) => buf.put_slice(&m.0),
        PgValue::Range(r) => r.encode_binary(buf),
        PgValue::Array(a) => a.encode_binary(buf),
    }
}

fn exact<const N: usize>(raw: &[u8], type_name: &str) -> PgResult<[u8; N]> {
    raw.try_into().map_err(|_| {
        PgError::invalid_binary(type_name, format!("expected {N} bytes, got {}", raw.len()))
    })
}

pub fn decode_binary(raw: &[u8], ty: &ColumnType) -> PgResult<PgValue> {
    if ty.array {
        return PgArray::decode_binary(raw, ty.base).map(PgValue::Array);
    }
    let name = ty.base.typname();
    let value = match ty.base {
        PgType::Bool => PgValue::Bool(exact::<1>(raw, name)?[0] != 0),
        PgType::Int2 => PgValue::Int2(i16::from_be_bytes(exact(raw, name)?)),
        PgType::Int4 => PgValue::Int4(i32::from_be_bytes(exact(raw, name)?)),
        PgType::Int8 => PgValue::Int8(i64::from_be_bytes(exact(raw, name)?)),
        PgType::Oid => PgValue::Oid(u32::from_be_bytes(exact(raw, name)?)),
        PgType::RegType => PgValue::RegType(u32::from_be_bytes(exact(raw, name)?)),
        PgType::Float4 => PgValue::Float4(f32::from_be_bytes(exact(raw, name)?)),
        PgType::Float8 => PgValue::Float8(f64::from_be_bytes(exact(raw, name)?)),
        PgType::Numeric => {
            let d = numeric::decode(raw)?;
            match ty.numeric_scale() {
                Some(scale) => PgValue::Numeric(numeric::rescale(d, scale)),
                None => PgValue::Numeric(d),
            }
        }
        PgType::Text | PgType::Varchar | PgType::Bpchar | PgType::Name | PgType::Unknown => {
            PgValue::Text(utf8(raw, name)?)
        }
        PgType::Json => {
            let text = utf8(raw, name)?;
            validate_json(&text, name)?;
            PgValue::Json(text)
        }
        PgType::Jsonb => match raw.split_first() {
            Some((1, rest)) => {
                let text = utf8(rest, name)?;
                validate_json(&text, name)?;
                PgValue::Jsonb(text)
            }
            Some((version, _)) => {
                return Err(PgError::invalid_binary(name, format!("unsupported jsonb version {version}")))
            }
            None => return Err(PgError::invalid_binary(name, "missing version byte")),
        },
        PgType::Bytea => PgValue::Bytea(raw.to_vec()),
        PgType::Date => PgValue::Date(datetime::pg_days_to_date(i32::from_be_bytes(exact(raw, name)?))?),
        PgType::Time => PgValue::Time(datetime::pg_micros_to_time(i64::from_be_bytes(exact(raw, name)?))?),
        PgType::Timestamp => PgValue::Timestamp(datetime::pg_micros_to_timestamp(i64::from_be_bytes(
            exact(raw, name)?,
        ))?),
        PgType::TimestampTz => {
            let naive = datetime::pg_micros_to_timestamp(i64::from_be_bytes(exact(raw, name)?))?;
            PgValue::TimestampTz(naive.and_utc())
        }
        PgType::Interval => {
            let fixed = exact::<16>(raw, name)?;
            let mut bytes = &fixed[..];
            let micros = bytes.get_i64();
            let days = bytes.get_i32();
            let months = bytes.get_i32();
            PgValue::Interval(Interval::new(months, days, micros))
        }
        PgType::Uuid => PgValue::Uuid(Uuid::from_bytes(exact(raw, name)?)),
        PgType::Inet => PgValue::Inet(IpNet::decode(raw, false)?),
        PgType::Cidr => PgValue::Cidr(IpNet::decode(raw, true)?),
        PgType::MacAddr => PgValue::MacAddr(MacAddr(exact(raw, name)?)),
        PgType::MacAddr8 => PgValue::MacAddr8(MacAddr8(exact(raw, name)?)),
        PgType::Int4Range
        | PgType::Int8Range
        | PgType::NumRange
        | PgType::TsRange
        | PgType::TsTzRange
        | PgType::DateRange => PgValue::Range(PgRange::decode_binary(raw, ty.base)?),
    };
    Ok(value)
}

fn utf8(raw: &[u8], type_name: &str) -> PgResult<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| PgError::invalid_binary(type_name, "invalid UTF-8"))
}

fn validate_json(text: &str, type_name: &str) -> PgResult<()> {
    serde_json::from_str::<serde_json::Value>(text)
        .map(|_| ())
        .map_err(|e| PgError::invalid_binary(type_name, e))
}
