//! Text wire format (format code 0).

use uuid::Uuid;

use super::{
    array::PgArray,
    datetime::{self, Interval},
    network::{IpNet, MacAddr, MacAddr8},
    numeric,
    range::PgRange,
    ColumnType, PgType, PgValue,
};
use crate::error::{sqlstate, PgError, PgResult};

pub fn decode_text(input: &str, ty: &ColumnType) -> PgResult<PgValue> {
    if ty.array {
        return PgArray::parse_text(input, ty.base).map(PgValue::Array);
    }
    let value = match ty.base {
        PgType::Bool => PgValue::Bool(parse_bool(input)?),
        PgType::Int2 => PgValue::Int2(parse_int(input, "smallint")?),
        PgType::Int4 => PgValue::Int4(parse_int(input, "integer")?),
        PgType::Int8 => PgValue::Int8(parse_int(input, "bigint")?),
        PgType::Oid => PgValue::Oid(parse_int(input, "oid")?),
        PgType::Float4 => PgValue::Float4(parse_float(input, "real")? as f32),
        PgType::Float8 => PgValue::Float8(parse_float(input, "double precision")?),
        PgType::Numeric => {
            let d = numeric::parse(input)?;
            match ty.numeric_scale() {
                Some(scale) => PgValue::Numeric(numeric::rescale(d, scale)),
                None => PgValue::Numeric(d),
            }
        }
        PgType::Text | PgType::Varchar | PgType::Bpchar | PgType::Name | PgType::Unknown => {
            PgValue::Text(input.to_string())
        }
        PgType::Bytea => PgValue::Bytea(parse_bytea(input)?),
        PgType::Date => PgValue::Date(datetime::parse_date(input)?),
        PgType::Time => PgValue::Time(datetime::parse_time(input)?),
        PgType::Timestamp => PgValue::Timestamp(datetime::parse_timestamp(input)?),
        PgType::TimestampTz => PgValue::TimestampTz(datetime::parse_timestamptz(input)?),
        PgType::Interval => PgValue::Interval(Interval::parse(input)?),
        PgType::Uuid => PgValue::Uuid(
            Uuid::parse_str(input.trim()).map_err(|_| PgError::invalid_text("uuid", input))?,
        ),
        PgType::Json | PgType::Jsonb => {
            serde_json::from_str::<serde_json::Value>(input)
                .map_err(|_| PgError::invalid_text(ty.base.typname(), input))?;
            if ty.base == PgType::Json {
                PgValue::Json(input.to_string())
            } else {
                PgValue::Jsonb(input.to_string())
            }
        }
        PgType::Inet => PgValue::Inet(IpNet::parse(input, false)?),
        PgType::Cidr => PgValue::Cidr(IpNet::parse(input, true)?),
        PgType::MacAddr => PgValue::MacAddr(MacAddr::parse(input)?),
        PgType::MacAddr8 => PgValue::MacAddr8(MacAddr8::parse(input)?),
        PgType::RegType => {
            let resolved = input
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(ColumnType::from_oid)
                .or_else(|| ColumnType::parse(input))
                .ok_or_else(|| {
                    PgError::new(
                        sqlstate::UNDEFINED_OBJECT,
                        format!("type \"{}\" does not exist", input.trim()),
                    )
                })?;
            PgValue::RegType(resolved.oid())
        }
        PgType::Int4Range
        | PgType::Int8Range
        | PgType::NumRange
        | PgType::TsRange
        | PgType::TsTzRange
        | PgType::DateRange => PgValue::Range(PgRange::parse(input, ty.base)?),
    };
    Ok(value)
}

pub fn encode_text(value: &PgValue) -> String {
    match value {
        PgValue::Null => String::new(),
        PgValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        PgValue::Int2(v) => v.to_string(),
        PgValue::Int4(v) => v.to_string(),
        PgValue::Int8(v) => v.to_string(),
        PgValue::Oid(v) => v.to_string(),
        PgValue::Float4(v) => format_float(*v as f64, || v.to_string()),
        PgValue::Float8(v) => format_float(*v, || v.to_string()),
        PgValue::Numeric(d) => d.to_string(),
        PgValue::Text(s) | PgValue::Json(s) | PgValue::Jsonb(s) => s.clone(),
        PgValue::Bytea(b) => {
            let mut out = String::with_capacity(2 + b.len() * 2);
            out.push_str("\\x");
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
            out
        }
        PgValue::Date(d) => datetime::format_date(d),
        PgValue::Time(t) => datetime::format_time(t),
        PgValue::Timestamp(ts) => datetime::format_timestamp(ts),
        PgValue::TimestampTz(ts) => datetime::format_timestamptz(ts),
        PgValue::Interval(i) => i.to_string(),
        PgValue::Uuid(u) => u.hyphenated().to_string(),
        PgValue::Inet(net) => net.to_text(false),
        PgValue::Cidr(net) => net.to_text(true),
        PgValue::MacAddr(m) => m.to_string(),
        PgValue::MacAddr8(m) => m.to_string(),
        PgValue::RegType(oid) => ColumnType::from_oid(*oid)
            .map(|ty| ty.to_string())
            .unwrap_or_else(|| oid.to_string()),
        PgValue::Range(r) => r.to_string(),
        PgValue::Array(a) => a.to_text(),
    }
}

fn parse_bool(input: &str) -> PgResult<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
        _ => Err(PgError::invalid_text("boolean", input)),
    }
}

fn parse_int<T: TryFrom<i64>>(input: &str, type_name: &str) -> PgResult<T> {
    let wide: i64 = input
        .trim()
        .parse()
        .map_err(|_| PgError::invalid_text(type_name, input))?;
    T::try_from(wide).map_err(|_| PgError::out_of_range(type_name))
}

fn parse_float(input: &str, type_name: &str) -> PgResult<f64> {
    match input.trim().to_ascii_lowercase().as_str() {
        "nan" => Ok(f64::NAN),
        "infinity" | "+infinity" | "inf" => Ok(f64::INFINITY),
        "-infinity" | "-inf" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .map_err(|_| PgError::invalid_text(type_name, input)),
    }
}

fn format_float(v: f64, finite: impl FnOnce() -> String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        finite()
    }
}

/// Accepts the hex form (`\x0a0b`) and the legacy escape form.
fn parse_bytea(input: &str) -> PgResult<Vec<u8>> {
    let invalid = || PgError::invalid_text("bytea", input);
    if let Some(hex) = input.strip_prefix("\\x") {
        let digits: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
        if digits.len() % 2 != 0 {
            return Err(invalid());
        }
        return digits
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or_else(invalid)
            })
            .collect();
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
        } else if bytes.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let octal = input.get(i + 1..i + 4).ok_or_else(invalid)?;
            out.push(u8::from_str_radix(octal, 8).map_err(|_| invalid())?);
            i += 4;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(input: &str, ty: PgType) -> String {
        let value = decode_text(input, &ColumnType::scalar(ty)).unwrap();
        encode_text(&value)
    }

    #[test]
    fn scalars_round_trip() {
        assert_eq!(round_trip("true", PgType::Bool), "t");
        assert_eq!(round_trip(" 42 ", PgType::Int4), "42");
        assert_eq!(round_trip("-32768", PgType::Int2), "-32768");
        assert_eq!(round_trip("1.5", PgType::Float8), "1.5");
        assert_eq!(round_trip("-Infinity", PgType::Float4), "-Infinity");
        assert_eq!(round_trip("", PgType::Text), "");
        assert_eq!(round_trip("\\xdeadbeef", PgType::Bytea), "\\xdeadbeef");
        assert_eq!(
            round_trip("A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11", PgType::Uuid),
            "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11"
        );
        assert_eq!(round_trip("{\"a\": [1, 2]}", PgType::Jsonb), "{\"a\": [1, 2]}");
    }

    #[test]
    fn errors_distinguish_syntax_from_range() {
        let err = decode_text("abc", &ColumnType::scalar(PgType::Int4)).unwrap_err();
        assert_eq!(err.code, sqlstate::INVALID_TEXT_REPRESENTATION);
        let err = decode_text("99999", &ColumnType::scalar(PgType::Int2)).unwrap_err();
        assert_eq!(err.code, sqlstate::NUMERIC_VALUE_OUT_OF_RANGE);
        assert!(decode_text("{bad json", &ColumnType::scalar(PgType::Json)).is_err());
    }

    #[test]
    fn bytea_escape_form() {
        let value = decode_text("a\\\\b\\001", &ColumnType::scalar(PgType::Bytea)).unwrap();
        assert_eq!(value, PgValue::Bytea(vec![b'a', b'\\', b'b', 1]));
    }

    #[test]
    fn regtype_renders_canonical_name() {
        let ty = ColumnType::scalar(PgType::RegType);
        assert_eq!(round_trip("int4", PgType::RegType), "integer");
        assert_eq!(
            decode_text("no_such_type", &ty).unwrap_err().code,
            sqlstate::UNDEFINED_OBJECT
        );
    }
}
