//! PostgreSQL type identity on top of SQLite's five storage classes.
//!
//! SQLite only knows INTEGER, REAL, TEXT, BLOB and NULL. Clients, on the other
//! hand, expect every result column to carry a PostgreSQL type OID and
//! modifier, and expect values in PostgreSQL's text and binary wire formats.
//! This module holds the static type registry ([`PgType`], [`ColumnType`]),
//! the logical value model ([`PgValue`]) and the two wire codecs.

mod array;
mod binary;
pub mod datetime;
mod network;
pub mod numeric;
mod range;
mod text;
mod value;

pub use array::PgArray;
pub use binary::{decode_binary, encode_binary};
pub use datetime::Interval;
pub use network::{IpNet, MacAddr, MacAddr8};
pub use range::{PgRange, RangeBound};
pub use text::{decode_text, encode_text};
pub use value::PgValue;

use std::fmt;

/// Wire format code from Bind/RowDescription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FormatCode {
    #[default]
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(FormatCode::Text),
            1 => Some(FormatCode::Binary),
            _ => None,
        }
    }

    pub fn code(self) -> i16 {
        match self {
            FormatCode::Text => 0,
            FormatCode::Binary => 1,
        }
    }

    /// Resolves the per-column format from a Bind format list: empty means
    /// all text, one entry applies to every column, otherwise one per column.
    pub fn for_column(codes: &[FormatCode], idx: usize) -> FormatCode {
        match codes.len() {
            0 => FormatCode::Text,
            1 => codes[0],
            _ => codes.get(idx).copied().unwrap_or_default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PgType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Varchar,
    Bpchar,
    Name,
    Bytea,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Uuid,
    Json,
    Jsonb,
    Inet,
    Cidr,
    MacAddr,
    MacAddr8,
    Oid,
    RegType,
    Int4Range,
    Int8Range,
    NumRange,
    TsRange,
    TsTzRange,
    DateRange,
    Unknown,
}

/// One row of the static type registry.
#[derive(Debug)]
pub struct TypeInfo {
    pub ty: PgType,
    pub oid: u32,
    pub array_oid: u32,
    /// `pg_type.typname`
    pub typname: &'static str,
    /// Name as printed by `format_type`/`regtype`.
    pub display: &'static str,
    /// `pg_type.typlen`, -1 for varlena.
    pub len: i16,
    pub category: char,
}

macro_rules! type_table {
    ($( $ty:ident => $oid:expr, $arr:expr, $typname:expr, $display:expr, $len:expr, $cat:expr; )*) => {
        pub static TYPES: &[TypeInfo] = &[
            $( TypeInfo {
                ty: PgType::$ty,
                oid: $oid,
                array_oid: $arr,
                typname: $typname,
                display: $display,
                len: $len,
                category: $cat,
            }, )*
        ];
    };
}

type_table! {
    Bool => 16, 1000, "bool", "boolean", 1, 'B';
    Int2 => 21, 1005, "int2", "smallint", 2, 'N';
    Int4 => 23, 1007, "int4", "integer", 4, 'N';
    Int8 => 20, 1016, "int8", "bigint", 8, 'N';
    Float4 => 700, 1021, "float4", "real", 4, 'N';
    Float8 => 701, 1022, "float8", "double precision", 8, 'N';
    Numeric => 1700, 1231, "numeric", "numeric", -1, 'N';
    Text => 25, 1009, "text", "text", -1, 'S';
    Varchar => 1043, 1015, "varchar", "character varying", -1, 'S';
    Bpchar => 1042, 1014, "bpchar", "character", -1, 'S';
    Name => 19, 1003, "name", "name", 64, 'S';
    Bytea => 17, 1001, "bytea", "bytea", -1, 'U';
    Date => 1082, 1182, "date", "date", 4, 'D';
    Time => 1083, 1183, "time", "time without time zone", 8, 'D';
    Timestamp => 1114, 1115, "timestamp", "timestamp without time zone", 8, 'D';
    TimestampTz => 1184, 1185, "timestamptz", "timestamp with time zone", 8, 'D';
    Interval => 1186, 1187, "interval", "interval", 16, 'T';
    Uuid => 2950, 2951, "uuid", "uuid", 16, 'U';
    Json => 114, 199, "json", "json", -1, 'U';
    Jsonb => 3802, 3807, "jsonb", "jsonb", -1, 'U';
    Inet => 869, 1041, "inet", "inet", -1, 'I';
    Cidr => 650, 651, "cidr", "cidr", -1, 'I';
    MacAddr => 829, 1040, "macaddr", "macaddr", 6, 'U';
    MacAddr8 => 774, 775, "macaddr8", "macaddr8", 8, 'U';
    Oid => 26, 1028, "oid", "oid", 4, 'N';
    RegType => 2206, 2211, "regtype", "regtype", 4, 'N';
    Int4Range => 3904, 3905, "int4range", "int4range", -1, 'R';
    Int8Range => 3926, 3927, "int8range", "int8range", -1, 'R';
    NumRange => 3906, 3907, "numrange", "numrange", -1, 'R';
    TsRange => 3908, 3909, "tsrange", "tsrange", -1, 'R';
    TsTzRange => 3910, 3911, "tstzrange", "tstzrange", -1, 'R';
    DateRange => 3912, 3913, "daterange", "daterange", -1, 'R';
    Unknown => 705, 0, "unknown", "unknown", -2, 'X';
}

impl PgType {
    pub fn info(self) -> &'static TypeInfo {
        TYPES
            .iter()
            .find(|info| info.ty == self)
            .unwrap_or(&TYPES[TYPES.len() - 1])
    }

    pub fn oid(self) -> u32 {
        self.info().oid
    }

    pub fn array_oid(self) -> u32 {
        self.info().array_oid
    }

    pub fn typname(self) -> &'static str {
        self.info().typname
    }

    /// Element type of a range type.
    pub fn range_subtype(self) -> Option<PgType> {
        match self {
            PgType::Int4Range => Some(PgType::Int4),
            PgType::Int8Range => Some(PgType::Int8),
            PgType::NumRange => Some(PgType::Numeric),
            PgType::TsRange => Some(PgType::Timestamp),
            PgType::TsTzRange => Some(PgType::TimestampTz),
            PgType::DateRange => Some(PgType::Date),
            _ => None,
        }
    }

    pub fn is_range(self) -> bool {
        self.range_subtype().is_some()
    }

    pub fn is_textual(self) -> bool {
        matches!(
            self,
            PgType::Text | PgType::Varchar | PgType::Bpchar | PgType::Name | PgType::Unknown
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, PgType::Int2 | PgType::Int4 | PgType::Int8)
    }

    pub fn is_numeric_family(self) -> bool {
        matches!(
            self,
            PgType::Int2
                | PgType::Int4
                | PgType::Int8
                | PgType::Float4
                | PgType::Float8
                | PgType::Numeric
        )
    }

    /// SQLite column affinity used when the type is declared in DDL or
    /// targeted by a cast.
    pub fn sqlite_affinity(self) -> &'static str {
        match self {
            PgType::Bool | PgType::Int2 | PgType::Int4 | PgType::Int8 | PgType::Oid => "INTEGER",
            PgType::Float4 | PgType::Float8 => "REAL",
            PgType::Numeric => "NUMERIC",
            PgType::Bytea => "BLOB",
            _ => "TEXT",
        }
    }

    fn from_name(name: &str) -> Option<PgType> {
        let ty = match name {
            "bool" | "boolean" => PgType::Bool,
            "int2" | "smallint" => PgType::Int2,
            "int" | "int4" | "integer" => PgType::Int4,
            "int8" | "bigint" => PgType::Int8,
            "float4" | "real" => PgType::Float4,
            "float8" | "double precision" | "double" | "float" => PgType::Float8,
            "numeric" | "decimal" | "dec" => PgType::Numeric,
            "text" => PgType::Text,
            "varchar" | "character varying" | "char varying" => PgType::Varchar,
            "char" | "character" | "bpchar" => PgType::Bpchar,
            "name" => PgType::Name,
            "bytea" => PgType::Bytea,
            "date" => PgType::Date,
            "time" | "time without time zone" => PgType::Time,
            "timestamp" | "timestamp without time zone" | "datetime" => PgType::Timestamp,
            "timestamptz" | "timestamp with time zone" => PgType::TimestampTz,
            "interval" => PgType::Interval,
            "uuid" => PgType::Uuid,
            "json" => PgType::Json,
            "jsonb" => PgType::Jsonb,
            "inet" => PgType::Inet,
            "cidr" => PgType::Cidr,
            "macaddr" => PgType::MacAddr,
            "macaddr8" => PgType::MacAddr8,
            "oid" => PgType::Oid,
            "regtype" => PgType::RegType,
            "int4range" => PgType::Int4Range,
            "int8range" => PgType::Int8Range,
            "numrange" => PgType::NumRange,
            "tsrange" => PgType::TsRange,
            "tstzrange" => PgType::TsTzRange,
            "daterange" => PgType::DateRange,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().display)
    }
}

/// Declared modifier of a column type (`atttypmod` in PostgreSQL terms).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TypeModifier {
    #[default]
    None,
    Length(u32),
    Numeric { precision: u32, scale: u32 },
    Precision(u32),
}

/// A fully resolved column type: base type, array-ness and modifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColumnType {
    pub base: PgType,
    pub array: bool,
    pub modifier: TypeModifier,
}

/// Result of parsing a type name out of DDL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeclaredType {
    pub column: ColumnType,
    pub serial: bool,
}

impl ColumnType {
    pub const fn scalar(base: PgType) -> Self {
        Self {
            base,
            array: false,
            modifier: TypeModifier::None,
        }
    }

    pub const fn array_of(base: PgType) -> Self {
        Self {
            base,
            array: true,
            modifier: TypeModifier::None,
        }
    }

    pub fn with_modifier(mut self, modifier: TypeModifier) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn element(&self) -> ColumnType {
        ColumnType {
            array: false,
            ..*self
        }
    }

    pub fn oid(&self) -> u32 {
        if self.array {
            self.base.array_oid()
        } else {
            self.base.oid()
        }
    }

    /// `atttypmod` as sent in RowDescription.
    pub fn typmod(&self) -> i32 {
        match self.modifier {
            TypeModifier::None => -1,
            TypeModifier::Length(n) => n as i32 + 4,
            TypeModifier::Numeric { precision, scale } => ((precision << 16) | scale) as i32 + 4,
            TypeModifier::Precision(p) => p as i32,
        }
    }

    /// `pg_type.typlen` for RowDescription.
    pub fn type_len(&self) -> i16 {
        if self.array {
            -1
        } else {
            self.base.info().len
        }
    }

    pub fn numeric_scale(&self) -> Option<u32> {
        match self.modifier {
            TypeModifier::Numeric { scale, .. } => Some(scale),
            _ => None,
        }
    }

    pub fn sqlite_affinity(&self) -> &'static str {
        if self.array {
            "TEXT"
        } else {
            self.base.sqlite_affinity()
        }
    }

    pub fn from_oid(oid: u32) -> Option<ColumnType> {
        TYPES.iter().find_map(|info| {
            if info.oid == oid {
                Some(ColumnType::scalar(info.ty))
            } else if info.array_oid == oid && info.array_oid != 0 {
                Some(ColumnType::array_of(info.ty))
            } else {
                None
            }
        })
    }

    /// Parses a PostgreSQL type name such as `numeric(10,2)`,
    /// `timestamp(3) without time zone`, `pg_catalog.int4` or `text[]`.
    pub fn parse(name: &str) -> Option<ColumnType> {
        Self::parse_declared(name).map(|declared| declared.column)
    }

    /// Like [`ColumnType::parse`] but also recognizes the `serial` family.
    pub fn parse_declared(name: &str) -> Option<DeclaredType> {
        let mut lowered = name.trim().to_ascii_lowercase().replace('"', "");
        if let Some(rest) = lowered.strip_prefix("pg_catalog.") {
            lowered = rest.to_string();
        }

        let mut array = false;
        loop {
            let trimmed = lowered.trim_end();
            if trimmed.ends_with(']') {
                match trimmed.rfind('[') {
                    Some(open) => {
                        lowered = trimmed[..open].to_string();
                        array = true;
                    }
                    None => return None,
                }
            } else if let Some(rest) = trimmed.strip_suffix(" array") {
                lowered = rest.to_string();
                array = true;
            } else {
                lowered = trimmed.to_string();
                break;
            }
        }

        let mut args: Vec<u32> = Vec::new();
        if let Some(open) = lowered.find('(') {
            let close = lowered[open..].find(')')? + open;
            for part in lowered[open + 1..close].split(',') {
                args.push(part.trim().parse().ok()?);
            }
            lowered = format!("{} {}", &lowered[..open], &lowered[close + 1..]);
        }
        let normalized = lowered.split_whitespace().collect::<Vec<_>>().join(" ");

        let (base, serial) = match normalized.as_str() {
            "serial" | "serial4" => (PgType::Int4, true),
            "bigserial" | "serial8" => (PgType::Int8, true),
            "smallserial" | "serial2" => (PgType::Int2, true),
            "float" => match args.first() {
                Some(p) if *p <= 24 => {
                    args.clear();
                    (PgType::Float4, false)
                }
                _ => {
                    args.clear();
                    (PgType::Float8, false)
                }
            },
            other => (PgType::from_name(other)?, false),
        };

        let modifier = match (base, args.as_slice()) {
            (_, []) => match base {
                PgType::Bpchar if !normalized.contains("bpchar") => TypeModifier::Length(1),
                _ => TypeModifier::None,
            },
            (PgType::Varchar | PgType::Bpchar, [n]) => TypeModifier::Length(*n),
            (PgType::Numeric, [p]) => TypeModifier::Numeric {
                precision: *p,
                scale: 0,
            },
            (PgType::Numeric, [p, s]) => {
                if s > p || *p == 0 || *p > 1000 {
                    return None;
                }
                TypeModifier::Numeric {
                    precision: *p,
                    scale: *s,
                }
            }
            (PgType::Time | PgType::Timestamp | PgType::TimestampTz | PgType::Interval, [p])
                if *p <= 6 =>
            {
                TypeModifier::Precision(*p)
            }
            _ => return None,
        };

        Some(DeclaredType {
            column: ColumnType {
                base,
                array,
                modifier,
            },
            serial,
        })
    }

    /// Type derived from a SQLite declared column type, for tables that were
    /// not created through the bridge. Follows SQLite's affinity rules.
    pub fn from_sqlite_decltype(decl: &str) -> ColumnType {
        if let Some(parsed) = ColumnType::parse(decl) {
            return parsed;
        }
        let upper = decl.to_ascii_uppercase();
        let base = if upper.contains("INT") {
            PgType::Int8
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            PgType::Text
        } else if upper.contains("BLOB") {
            PgType::Bytea
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            PgType::Float8
        } else if upper.contains("BOOL") {
            PgType::Bool
        } else if upper.contains("NUM") || upper.contains("DEC") {
            PgType::Numeric
        } else {
            PgType::Text
        };
        ColumnType::scalar(base)
    }
}

impl fmt::Display for ColumnType {
    /// Renders the type the way `format_type` does, e.g. `numeric(10,2)`,
    /// `character varying(50)` or `integer[]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let display = self.base.info().display;
        match (self.base, self.modifier) {
            (_, TypeModifier::None) => f.write_str(display)?,
            (_, TypeModifier::Length(n)) => write!(f, "{display}({n})")?,
            (_, TypeModifier::Numeric { precision, scale }) => {
                write!(f, "{display}({precision},{scale})")?
            }
            (PgType::Time | PgType::Timestamp | PgType::TimestampTz, TypeModifier::Precision(p)) => {
                let (head, tail) = display.split_once(' ').unwrap_or((display, ""));
                write!(f, "{head}({p}) {tail}")?
            }
            (_, TypeModifier::Precision(p)) => write!(f, "{display}({p})")?,
        }
        if self.array {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_word_and_modified_names() {
        let ts = ColumnType::parse("timestamp without time zone").unwrap();
        assert_eq!(ts.base, PgType::Timestamp);

        let ts3 = ColumnType::parse("TIMESTAMP(3) WITH TIME ZONE").unwrap();
        assert_eq!(ts3.base, PgType::TimestampTz);
        assert_eq!(ts3.modifier, TypeModifier::Precision(3));

        let num = ColumnType::parse("NUMERIC(10, 2)").unwrap();
        assert_eq!(num.oid(), 1700);
        assert_eq!(
            num.modifier,
            TypeModifier::Numeric {
                precision: 10,
                scale: 2
            }
        );
        assert_eq!(num.typmod(), ((10 << 16) | 2) + 4);

        let varchar = ColumnType::parse("character varying(50)").unwrap();
        assert_eq!(varchar.base, PgType::Varchar);
        assert_eq!(varchar.typmod(), 54);
    }

    #[test]
    fn parses_arrays_and_serials() {
        let arr = ColumnType::parse("int4[]").unwrap();
        assert!(arr.array);
        assert_eq!(arr.oid(), 1007);
        assert_eq!(ColumnType::parse("text ARRAY").unwrap().oid(), 1009);

        let serial = ColumnType::parse_declared("BIGSERIAL").unwrap();
        assert!(serial.serial);
        assert_eq!(serial.column.base, PgType::Int8);
        assert!(ColumnType::parse("nonexistent_type").is_none());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for name in [
            "integer",
            "numeric(10,2)",
            "character varying(50)",
            "timestamp(3) without time zone",
            "uuid[]",
            "jsonb",
            "int8range",
        ] {
            let parsed = ColumnType::parse(name).unwrap();
            assert_eq!(parsed.to_string(), name);
            assert_eq!(ColumnType::parse(&parsed.to_string()), Some(parsed));
        }
    }

    #[test]
    fn oids_are_bidirectional() {
        for info in TYPES.iter().filter(|i| i.ty != PgType::Unknown) {
            assert_eq!(ColumnType::from_oid(info.oid).unwrap().base, info.ty);
            let arr = ColumnType::from_oid(info.array_oid).unwrap();
            assert!(arr.array);
            assert_eq!(arr.base, info.ty);
        }
    }

    #[test]
    fn sqlite_decltypes_follow_affinity_rules() {
        assert_eq!(ColumnType::from_sqlite_decltype("INTEGER").base, PgType::Int4);
        assert_eq!(ColumnType::from_sqlite_decltype("UNSIGNED BIG INT").base, PgType::Int8);
        assert_eq!(ColumnType::from_sqlite_decltype("NVARCHAR(20)").base, PgType::Text);
        assert_eq!(ColumnType::from_sqlite_decltype("DOUBLE").base, PgType::Float8);
    }
}
