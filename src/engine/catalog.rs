use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{PgError, PgResult};
use crate::types::{ColumnType, PgType, TypeModifier, TYPES};

/// Shadow table holding the declared PostgreSQL type of every column created
/// through the bridge.
pub const SCHEMA_TABLE: &str = "__pgbridge_schema";

/// Prefix reserved for the bridge's own tables and views.
pub const INTERNAL_PREFIX: &str = "__pgbridge_";

pub const VIEW_INFORMATION_SCHEMA_TABLES: &str = "__pgbridge_information_schema_tables";
pub const VIEW_INFORMATION_SCHEMA_COLUMNS: &str = "__pgbridge_information_schema_columns";
pub const VIEW_PG_TYPE: &str = "__pgbridge_pg_type";
pub const VIEW_PG_NAMESPACE: &str = "__pgbridge_pg_namespace";
pub const VIEW_PG_TABLES: &str = "__pgbridge_pg_tables";

/// A single column as seen by type resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogColumn {
    pub name: String,
    /// SQLite declared type from `pragma_table_info`.
    pub decltype: String,
    /// Persisted PostgreSQL type string, if the column has a mapping.
    pub mapping: Option<String>,
    pub not_null: bool,
    pub primary_key: bool,
}

/// A table or view with its columns in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogTable {
    pub name: String,
    /// Relation OID reported in RowDescription; 0 for the bridge's views.
    pub oid: u32,
    pub columns: Vec<CatalogColumn>,
    pub is_view: bool,
    /// True when at least one column of the table has a mapping row.
    pub has_mappings: bool,
}

impl CatalogTable {
    pub fn column(&self, name: &str) -> Option<&CatalogColumn> {
        self.columns
            .iter()
            .find(|col| col.name.eq_ignore_ascii_case(name))
    }

    /// Resolves the PostgreSQL type of one of this table's columns.
    ///
    /// A mapping always wins. A table that has mappings for some columns but
    /// not this one is an inconsistency and reported as `XX000`; tables
    /// created outside the bridge fall back to SQLite's declared type.
    pub fn column_type(&self, column: &CatalogColumn) -> PgResult<ColumnType> {
        match &column.mapping {
            Some(declared) => ColumnType::parse(declared).ok_or_else(|| {
                PgError::internal(format!(
                    "unrecognized type mapping \"{}\" for column {}.{}",
                    declared, self.name, column.name
                ))
            }),
            None if self.has_mappings => Err(PgError::internal(format!(
                "column {}.{} has no type mapping",
                self.name, column.name
            ))),
            None => Ok(ColumnType::from_sqlite_decltype(&column.decltype)),
        }
    }
}

/// Point-in-time view of every user table, its columns and their mappings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaSnapshot {
    tables: HashMap<String, CatalogTable>,
}

impl SchemaSnapshot {
    pub fn table(&self, name: &str) -> Option<&CatalogTable> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    pub fn tables(&self) -> impl Iterator<Item = &CatalogTable> {
        self.tables.values()
    }

    pub fn insert(&mut self, table: CatalogTable) {
        self.tables.insert(table.name.to_ascii_lowercase(), table);
    }
}

/// First OID PostgreSQL hands out to user objects.
const FIRST_USER_OID: u32 = 16_384;

/// Change to the shadow schema that accompanies a DDL statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingOp {
    DropTable { table: String },
    RenameTable { from: String, to: String },
    AddColumn { table: String, column: String, ty: ColumnType },
    RenameColumn { table: String, from: String, to: String },
    DropColumn { table: String, column: String },
}

pub fn ensure_schema_table(conn: &Connection) -> PgResult<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM main.sqlite_master WHERE type = 'table' AND name = ?1",
            [SCHEMA_TABLE],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {SCHEMA_TABLE} (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                pg_type TEXT NOT NULL,
                sqlite_type TEXT NOT NULL,
                PRIMARY KEY (table_name, column_name)
            )"
        ))?;
    }
    Ok(())
}

/// Writes one mapping row, replacing any previous mapping for the column.
pub fn record_mapping(conn: &Connection, table: &str, column: &str, ty: &ColumnType) -> PgResult<()> {
    conn.prepare_cached(&format!(
        "INSERT OR REPLACE INTO {SCHEMA_TABLE} (table_name, column_name, pg_type, sqlite_type)
         VALUES (?1, ?2, ?3, ?4)"
    ))?
    .execute(params![table, column, ty.to_string(), ty.sqlite_affinity()])?;
    Ok(())
}

/// Applies a DDL side effect to the shadow schema.
///
/// Runs on the same handle and inside the same savepoint as the DDL itself.
pub fn apply_mapping_op(conn: &Connection, op: &MappingOp) -> PgResult<()> {
    match op {
        MappingOp::DropTable { table } => {
            conn.execute(
                &format!("DELETE FROM {SCHEMA_TABLE} WHERE lower(table_name) = lower(?1)"),
                [table],
            )?;
        }
        MappingOp::RenameTable { from, to } => {
            conn.execute(
                &format!("UPDATE {SCHEMA_TABLE} SET table_name = ?2 WHERE lower(table_name) = lower(?1)"),
                [from, to],
            )?;
        }
        MappingOp::AddColumn { table, column, ty } => {
            backfill_table(conn, table)?;
            record_mapping(conn, table, column, ty)?;
        }
        MappingOp::RenameColumn { table, from, to } => {
            conn.execute(
                &format!(
                    "UPDATE {SCHEMA_TABLE} SET column_name = ?3
                     WHERE lower(table_name) = lower(?1) AND lower(column_name) = lower(?2)"
                ),
                [table, from, to],
            )?;
        }
        MappingOp::DropColumn { table, column } => {
            conn.execute(
                &format!(
                    "DELETE FROM {SCHEMA_TABLE}
                     WHERE lower(table_name) = lower(?1) AND lower(column_name) = lower(?2)"
                ),
                [table, column],
            )?;
        }
    }
    Ok(())
}

/// Gives every existing column of a table without mappings a mapping derived
/// from its SQLite declared type, so adding a mapped column never leaves the
/// table half-mapped.
fn backfill_table(conn: &Connection, table: &str) -> PgResult<()> {
    let mapped: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {SCHEMA_TABLE} WHERE lower(table_name) = lower(?1)"),
        [table],
        |row| row.get(0),
    )?;
    if mapped > 0 {
        return Ok(());
    }
    let columns = table_info(conn, table)?;
    for column in columns {
        let ty = ColumnType::from_sqlite_decltype(&column.decltype);
        record_mapping(conn, table, &column.name, &ty)?;
    }
    Ok(())
}

fn table_info(conn: &Connection, table: &str) -> PgResult<Vec<CatalogColumn>> {
    let mut stmt =
        conn.prepare_cached("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| {
        Ok(CatalogColumn {
            name: row.get(0)?,
            decltype: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            mapping: None,
            not_null: row.get::<_, i64>(2)? != 0,
            primary_key: row.get::<_, i64>(3)? != 0,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Reads user tables, their columns and the shadow schema into a snapshot.
///
/// The bridge's own catalog views are included with their fixed column
/// types so that introspection queries describe like any other table.
pub fn load_snapshot(conn: &Connection) -> PgResult<SchemaSnapshot> {
    let mut mappings: HashMap<(String, String), String> = HashMap::new();
    {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT table_name, column_name, pg_type FROM {SCHEMA_TABLE}"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (table, column, pg_type) = row?;
            mappings.insert((table.to_ascii_lowercase(), column.to_ascii_lowercase()), pg_type);
        }
    }

    let relations: Vec<(String, bool, i64)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT name, type = 'view', rowid FROM main.sqlite_master
             WHERE type IN ('table', 'view')
               AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
               AND substr(name, 1, 11) <> '__pgbridge_'",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut snapshot = SchemaSnapshot::default();
    for (name, is_view, rowid) in relations {
        let lowered = name.to_ascii_lowercase();
        let mut columns = table_info(conn, &name)?;
        let mut has_mappings = false;
        for column in columns.iter_mut() {
            column.mapping = mappings
                .get(&(lowered.clone(), column.name.to_ascii_lowercase()))
                .cloned();
            has_mappings |= column.mapping.is_some();
        }
        snapshot.insert(CatalogTable {
            name,
            oid: u32::try_from(rowid).map_or(0, |rowid| FIRST_USER_OID.saturating_add(rowid)),
            columns,
            is_view,
            has_mappings,
        });
    }

    for (view, columns) in system_views() {
        snapshot.insert(CatalogTable {
            name: view.to_string(),
            oid: 0,
            columns: columns
                .iter()
                .map(|(name, ty)| CatalogColumn {
                    name: name.to_string(),
                    decltype: ty.sqlite_affinity().to_string(),
                    mapping: Some(ty.to_string()),
                    not_null: false,
                    primary_key: false,
                })
                .collect(),
            is_view: true,
            has_mappings: true,
        });
    }
    Ok(snapshot)
}

/// Result column types of the catalog views.
pub fn system_views() -> Vec<(&'static str, Vec<(&'static str, ColumnType)>)> {
    let text = ColumnType::scalar(PgType::Text);
    let name = ColumnType::scalar(PgType::Name);
    let int4 = ColumnType::scalar(PgType::Int4);
    let int2 = ColumnType::scalar(PgType::Int2);
    let oid = ColumnType::scalar(PgType::Oid);
    let boolean = ColumnType::scalar(PgType::Bool);
    vec![
        (
            VIEW_INFORMATION_SCHEMA_TABLES,
            vec![
                ("table_catalog", name),
                ("table_schema", name),
                ("table_name", name),
                ("table_type", text),
                ("is_insertable_into", text),
            ],
        ),
        (
            VIEW_INFORMATION_SCHEMA_COLUMNS,
            vec![
                ("table_catalog", name),
                ("table_schema", name),
                ("table_name", name),
                ("column_name", name),
                ("ordinal_position", int4),
                ("column_default", text),
                ("is_nullable", text),
                ("data_type", text),
                ("character_maximum_length", int4),
                ("numeric_precision", int4),
                ("numeric_scale", int4),
                ("udt_name", name),
            ],
        ),
        (
            VIEW_PG_TYPE,
            vec![
                ("oid", oid),
                ("typname", name),
                ("typnamespace", oid),
                ("typlen", int2),
                ("typtype", text),
                ("typcategory", text),
                ("typelem", oid),
                ("typarray", oid),
                ("typbasetype", oid),
                ("typtypmod", int4),
                ("typnotnull", boolean),
            ],
        ),
        (VIEW_PG_NAMESPACE, vec![("oid", oid), ("nspname", name)]),
        (
            VIEW_PG_TABLES,
            vec![
                ("schemaname", name),
                ("tablename", name),
                ("tableowner", name),
                ("tablespace", name),
                ("hasindexes", boolean),
                ("hasrules", boolean),
                ("hastriggers", boolean),
            ],
        ),
    ]
}

/// Creates the per-handle TEMP views that back `information_schema` and
/// `pg_catalog` queries, and the helper function they use.
pub fn install_views(conn: &Connection, catalog_name: &str) -> PgResult<()> {
    conn.create_scalar_function(
        "__pgbridge_type_attr",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx: &Context<'_>| -> rusqlite::Result<SqlValue> {
            let declared = ctx.get::<Option<String>>(0)?.unwrap_or_default();
            let attr = ctx.get::<String>(1)?;
            Ok(type_attr(&declared, &attr))
        },
    )?;

    let catalog = catalog_name.replace('\'', "''");
    let user_relations = |alias: &str| {
        format!("{alias}name NOT LIKE 'sqlite\\_%' ESCAPE '\\' AND substr({alias}name, 1, 11) <> '__pgbridge_'")
    };
    let mut sql = String::new();
    let _ = write!(
        sql,
        "CREATE TEMP VIEW IF NOT EXISTS {VIEW_INFORMATION_SCHEMA_TABLES} AS
         SELECT '{catalog}' AS table_catalog, 'public' AS table_schema, name AS table_name,
                CASE type WHEN 'view' THEN 'VIEW' ELSE 'BASE TABLE' END AS table_type,
                CASE type WHEN 'view' THEN 'NO' ELSE 'YES' END AS is_insertable_into
         FROM main.sqlite_master
         WHERE type IN ('table', 'view') AND {};

         CREATE TEMP VIEW IF NOT EXISTS {VIEW_INFORMATION_SCHEMA_COLUMNS} AS
         SELECT '{catalog}' AS table_catalog, 'public' AS table_schema, m.name AS table_name,
                p.name AS column_name, p.cid + 1 AS ordinal_position,
                p.dflt_value AS column_default,
                CASE WHEN p.\"notnull\" = 1 OR p.pk > 0 THEN 'NO' ELSE 'YES' END AS is_nullable,
                __pgbridge_type_attr(COALESCE(s.pg_type, p.type), 'data_type') AS data_type,
                __pgbridge_type_attr(COALESCE(s.pg_type, p.type), 'character_maximum_length')
                    AS character_maximum_length,
                __pgbridge_type_attr(COALESCE(s.pg_type, p.type), 'numeric_precision')
                    AS numeric_precision,
                __pgbridge_type_attr(COALESCE(s.pg_type, p.type), 'numeric_scale') AS numeric_scale,
                __pgbridge_type_attr(COALESCE(s.pg_type, p.type), 'udt_name') AS udt_name
         FROM main.sqlite_master AS m
         JOIN pragma_table_info(m.name) AS p
         LEFT JOIN main.{SCHEMA_TABLE} AS s
                ON lower(s.table_name) = lower(m.name) AND lower(s.column_name) = lower(p.name)
         WHERE m.type IN ('table', 'view') AND {};

         CREATE TEMP VIEW IF NOT EXISTS {VIEW_PG_NAMESPACE} (oid, nspname) AS
         VALUES (11, 'pg_catalog'), (2200, 'public'), (13000, 'information_schema');

         CREATE TEMP VIEW IF NOT EXISTS {VIEW_PG_TABLES} AS
         SELECT 'public' AS schemaname, m.name AS tablename, 'postgres' AS tableowner,
                NULL AS tablespace,
                EXISTS (SELECT 1 FROM main.sqlite_master AS i
                        WHERE i.type = 'index' AND i.tbl_name = m.name) AS hasindexes,
                0 AS hasrules,
                EXISTS (SELECT 1 FROM main.sqlite_master AS t
                        WHERE t.type = 'trigger' AND t.tbl_name = m.name) AS hastriggers
         FROM main.sqlite_master AS m
         WHERE m.type = 'table' AND {};
        ",
        user_relations(""),
        user_relations("m."),
        user_relations("m."),
    );
    let _ = write!(
        sql,
        "CREATE TEMP VIEW IF NOT EXISTS {VIEW_PG_TYPE}
         (oid, typname, typnamespace, typlen, typtype, typcategory, typelem, typarray,
          typbasetype, typtypmod, typnotnull) AS VALUES {};",
        pg_type_rows()
    );
    conn.execute_batch(&sql)?;
    Ok(())
}

fn pg_type_rows() -> String {
    let mut rows = Vec::new();
    for info in TYPES.iter().filter(|info| info.ty != PgType::Unknown) {
        let typtype = if info.ty.is_range() { 'r' } else { 'b' };
        rows.push(format!(
            "({}, '{}', 11, {}, '{}', '{}', 0, {}, 0, -1, 0)",
            info.oid, info.typname, info.len, typtype, info.category, info.array_oid
        ));
        rows.push(format!(
            "({}, '_{}', 11, -1, 'b', 'A', {}, 0, 0, -1, 0)",
            info.array_oid, info.typname, info.oid
        ));
    }
    rows.join(", ")
}

/// Column attributes reported by `information_schema.columns`.
fn type_attr(declared: &str, attr: &str) -> SqlValue {
    let ty = ColumnType::from_sqlite_decltype(declared);
    let int = |v: u32| SqlValue::Integer(v as i64);
    match attr {
        "data_type" if ty.array => SqlValue::Text("ARRAY".to_string()),
        "data_type" => SqlValue::Text(ty.base.to_string()),
        "udt_name" if ty.array => SqlValue::Text(format!("_{}", ty.base.typname())),
        "udt_name" => SqlValue::Text(ty.base.typname().to_string()),
        "character_maximum_length" => match (ty.array, ty.modifier) {
            (false, TypeModifier::Length(n)) => int(n),
            _ => SqlValue::Null,
        },
        "numeric_precision" if !ty.array => match (ty.base, ty.modifier) {
            (PgType::Numeric, TypeModifier::Numeric { precision, .. }) => int(precision),
            (PgType::Int2, _) => int(16),
            (PgType::Int4, _) => int(32),
            (PgType::Int8, _) => int(64),
            (PgType::Float4, _) => int(24),
            (PgType::Float8, _) => int(53),
            _ => SqlValue::Null,
        },
        "numeric_scale" if !ty.array => match (ty.base, ty.modifier) {
            (PgType::Numeric, TypeModifier::Numeric { scale, .. }) => int(scale),
            (base, _) if base.is_integer() => int(0),
            _ => SqlValue::Null,
        },
        _ => SqlValue::Null,
    }
}
