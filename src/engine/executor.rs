use rusqlite::types::{Value as SqlValue, ValueRef};
use tracing::debug;

use super::catalog::{self, MappingOp};
use super::storage::StorageHandle;
use crate::error::PgResult;
use crate::types::{ColumnType, PgType, PgValue};

/// Work the engine can run on a handle, already in SQLite's dialect.
///
/// Produced by the SQL layer; the engine never looks at PostgreSQL syntax.
#[derive(Clone, Debug, PartialEq)]
pub enum Job {
    /// A statement that produces rows.
    Query { sql: String },
    /// A statement that only reports a change count.
    Statement { sql: String },
    /// A write whose `RETURNING` clause is emulated.
    Returning(ReturningJob),
    /// `CREATE TABLE`, with the column types to persist.
    CreateTable(CreateTableJob),
    /// One or more statements run atomically together with shadow schema
    /// changes (`DROP TABLE`, `ALTER TABLE`, `TRUNCATE`).
    Ddl {
        statements: Vec<String>,
        ops: Vec<MappingOp>,
    },
}

impl Job {
    pub fn sql(&self) -> Option<&str> {
        match self {
            Job::Query { sql } | Job::Statement { sql } => Some(sql),
            Job::CreateTable(job) => Some(&job.sql),
            Job::Returning(job) => Some(&job.base_sql),
            Job::Ddl { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturningKind {
    Insert,
    /// `INSERT ... ON CONFLICT DO UPDATE`: rows may be inserted or updated.
    Upsert,
    Update,
    Delete,
}

/// Temp table the capture triggers append written rowids to.
const CAPTURE_TABLE: &str = "__pgbridge_returning";

/// An `INSERT`/`UPDATE`/`DELETE ... RETURNING` split into the base write and
/// the pieces needed to read the affected rows back.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturningJob {
    pub kind: ReturningKind,
    /// Quoted target table.
    pub table: String,
    /// `FROM` item used to read rows back: the table, possibly with an alias.
    pub source: String,
    /// Name that qualifies `rowid` inside `source`.
    pub qualifier: String,
    /// The statement with its `RETURNING` clause removed.
    pub base_sql: String,
    /// The rendered `RETURNING` projection.
    pub select_list: String,
    /// `WHERE` condition of an `UPDATE` or `DELETE`.
    pub selection: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateTableJob {
    pub sql: String,
    pub table: String,
    pub if_not_exists: bool,
    /// Column name and declared type, in declaration order. For
    /// `CREATE TABLE ... AS SELECT` this is filled in when the statement is
    /// described.
    pub mappings: Vec<(String, ColumnType)>,
}

/// Rows and change count produced by one job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    pub rows: Vec<Vec<PgValue>>,
    pub rows_affected: u64,
}

/// Runs a job on a handle and converts result rows to the described types.
///
/// Multi-step jobs run inside a savepoint so a failure leaves no partial
/// writes behind. A single write outside a transaction is followed by a
/// passive checkpoint so later sessions see it.
///
/// ## Arguments
/// * `handle` - the session's storage handle
/// * `job` - translated work item
/// * `params` - bound parameter values, shared by every statement of the job
/// * `columns` - resolved result column types, in result order
pub fn execute(
    handle: &StorageHandle,
    job: &Job,
    params: &[PgValue],
    columns: &[ColumnType],
) -> PgResult<Outcome> {
    match job {
        Job::Query { sql } => {
            let rows = handle.query(sql, params)?;
            let rows = convert_rows(rows, columns)?;
            Ok(Outcome {
                rows_affected: rows.len() as u64,
                rows,
            })
        }
        Job::Statement { sql } => {
            let result = handle.execute(sql, params)?;
            if handle.is_autocommit() {
                handle.checkpoint();
            }
            Ok(Outcome {
                rows: Vec::new(),
                rows_affected: result.rows_affected,
            })
        }
        Job::Returning(returning) => {
            let (rows, rows_affected) = handle.atomically(|h| run_returning(h, returning, params))?;
            Ok(Outcome {
                rows: convert_rows(rows, columns)?,
                rows_affected,
            })
        }
        Job::CreateTable(create) => {
            if create.if_not_exists && table_exists(handle, &create.table)? {
                debug!(table = %create.table, "table already exists, skipping");
                return Ok(Outcome::default());
            }
            handle.atomically(|h| {
                h.execute(&create.sql, params)?;
                for (column, ty) in &create.mappings {
                    catalog::record_mapping(h.connection(), &create.table, column, ty)?;
                }
                Ok(())
            })?;
            Ok(Outcome::default())
        }
        Job::Ddl { statements, ops } => {
            let rows_affected = handle.atomically(|h| {
                let mut total = 0;
                for sql in statements {
                    total += h.execute(sql, params)?.rows_affected;
                }
                for op in ops {
                    catalog::apply_mapping_op(h.connection(), op)?;
                }
                Ok(total)
            })?;
            Ok(Outcome {
                rows: Vec::new(),
                rows_affected,
            })
        }
    }
}

fn run_returning(
    handle: &StorageHandle,
    job: &ReturningJob,
    params: &[PgValue],
) -> PgResult<(Vec<Vec<SqlValue>>, u64)> {
    let where_clause = job
        .selection
        .as_ref()
        .map(|cond| format!(" WHERE {cond}"))
        .unwrap_or_default();
    match job.kind {
        ReturningKind::Insert | ReturningKind::Upsert => {
            let events: &[&str] = match job.kind {
                ReturningKind::Upsert => &["INSERT", "UPDATE"],
                _ => &["INSERT"],
            };
            let rows_affected = capture_rowids(handle, &job.table, events, || {
                Ok(handle.execute(&job.base_sql, params)?.rows_affected)
            })?;
            if rows_affected == 0 {
                return Ok((Vec::new(), 0));
            }
            let rows = handle.query(
                &format!(
                    "SELECT {list} FROM {source} \
                     WHERE {q}.rowid IN (SELECT rid FROM temp.{CAPTURE_TABLE}) \
                     ORDER BY (SELECT min(seq) FROM temp.{CAPTURE_TABLE} WHERE rid = {q}.rowid)",
                    list = job.select_list,
                    source = job.source,
                    q = job.qualifier,
                ),
                params,
            )?;
            Ok((rows, rows_affected))
        }
        ReturningKind::Update => {
            let ids = handle.query(
                &format!(
                    "SELECT {}.rowid FROM {}{where_clause} ORDER BY {}.rowid",
                    job.qualifier, job.source, job.qualifier
                ),
                params,
            )?;
            let result = handle.execute(&job.base_sql, params)?;
            if ids.is_empty() {
                return Ok((Vec::new(), result.rows_affected));
            }
            let id_list = ids
                .iter()
                .filter_map(|row| match row.first() {
                    Some(SqlValue::Integer(id)) => Some(id.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(", ");
            let rows = handle.query(
                &format!(
                    "SELECT {} FROM {} WHERE {}.rowid IN ({id_list}) ORDER BY {}.rowid",
                    job.select_list, job.source, job.qualifier, job.qualifier
                ),
                params,
            )?;
            Ok((rows, result.rows_affected))
        }
        ReturningKind::Delete => {
            let rows = handle.query(
                &format!(
                    "SELECT {} FROM {}{where_clause} ORDER BY {}.rowid",
                    job.select_list, job.source, job.qualifier
                ),
                params,
            )?;
            let result = handle.execute(&job.base_sql, params)?;
            Ok((rows, result.rows_affected))
        }
    }
}

/// Runs `write` with temporary triggers on `table` that record the rowid of
/// every row the given events touch, in the order they were written.
///
/// The triggers are dropped again before returning; the captured rowids stay
/// in the temp table until the next capture.
fn capture_rowids(
    handle: &StorageHandle,
    table: &str,
    events: &[&str],
    write: impl FnOnce() -> PgResult<u64>,
) -> PgResult<u64> {
    let mut setup = format!(
        "CREATE TEMP TABLE IF NOT EXISTS {CAPTURE_TABLE} (seq INTEGER PRIMARY KEY, rid INTEGER NOT NULL);
         DELETE FROM temp.{CAPTURE_TABLE};"
    );
    let mut teardown = String::new();
    for event in events {
        let trigger = format!("{CAPTURE_TABLE}_{}", event.to_ascii_lowercase());
        setup.push_str(&format!(
            "CREATE TEMP TRIGGER {trigger} AFTER {event} ON {table} \
             BEGIN INSERT INTO {CAPTURE_TABLE} (rid) VALUES (NEW.rowid); END;"
        ));
        teardown.push_str(&format!("DROP TRIGGER IF EXISTS temp.{trigger};"));
    }
    handle.connection().execute_batch(&setup)?;
    let written = write();
    handle.connection().execute_batch(&teardown)?;
    written
}

fn table_exists(handle: &StorageHandle, table: &str) -> PgResult<bool> {
    let rows = handle.query(
        "SELECT 1 FROM main.sqlite_master WHERE type IN ('table', 'view') AND lower(name) = lower(?1)",
        &[PgValue::Text(table.to_string())],
    )?;
    Ok(!rows.is_empty())
}

fn convert_rows(rows: Vec<Vec<SqlValue>>, columns: &[ColumnType]) -> PgResult<Vec<Vec<PgValue>>> {
    let fallback = ColumnType::scalar(PgType::Text);
    rows.into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(idx, value)| {
                    let ty = columns.get(idx).unwrap_or(&fallback);
                    PgValue::from_sql(ValueRef::from(value), ty)
                })
                .collect::<PgResult<Vec<_>>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::storage::StorageTarget;

    /// The target owns the scratch directory; keep it alive with the handle.
    fn handle() -> (StorageTarget, StorageHandle) {
        let target = StorageTarget::scratch().unwrap();
        let h = StorageHandle::open(&target, &Config::in_memory()).unwrap();
        (target, h)
    }

    fn int4() -> ColumnType {
        ColumnType::scalar(PgType::Int4)
    }

    fn setup(h: &StorageHandle) {
        execute(
            h,
            &Job::CreateTable(CreateTableJob {
                sql: "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v INTEGER)".into(),
                table: "t".into(),
                if_not_exists: false,
                mappings: vec![("id".into(), int4()), ("v".into(), int4())],
            }),
            &[],
            &[],
        )
        .unwrap();
    }

    fn returning(kind: ReturningKind, base_sql: &str, selection: Option<&str>) -> Job {
        Job::Returning(ReturningJob {
            kind,
            table: "\"t\"".into(),
            source: "\"t\"".into(),
            qualifier: "\"t\"".into(),
            base_sql: base_sql.into(),
            select_list: "\"id\", \"v\"".into(),
            selection: selection.map(str::to_string),
        })
    }

    #[test]
    fn insert_returning_single_and_multi_row() {
        let (_target, h) = handle();
        setup(&h);
        let out = execute(
            &h,
            &returning(ReturningKind::Insert, "INSERT INTO t (v) VALUES (?1)", None),
            &[PgValue::Int4(10)],
            &[int4(), int4()],
        )
        .unwrap();
        assert_eq!(out.rows, vec![vec![PgValue::Int4(1), PgValue::Int4(10)]]);

        let out = execute(
            &h,
            &returning(ReturningKind::Insert, "INSERT INTO t (v) VALUES (20), (30)", None),
            &[],
            &[int4(), int4()],
        )
        .unwrap();
        assert_eq!(out.rows_affected, 2);
        assert_eq!(
            out.rows,
            vec![
                vec![PgValue::Int4(2), PgValue::Int4(20)],
                vec![PgValue::Int4(3), PgValue::Int4(30)],
            ]
        );
    }

    #[test]
    fn insert_returning_below_the_highest_rowid() {
        let (_target, h) = handle();
        setup(&h);
        h.execute("INSERT INTO t (id, v) VALUES (10, 0)", &[]).unwrap();
        let out = execute(
            &h,
            &returning(ReturningKind::Insert, "INSERT INTO t (id, v) VALUES (4, 40), (3, 30)", None),
            &[],
            &[int4(), int4()],
        )
        .unwrap();
        assert_eq!(out.rows_affected, 2);
        assert_eq!(
            out.rows,
            vec![
                vec![PgValue::Int4(4), PgValue::Int4(40)],
                vec![PgValue::Int4(3), PgValue::Int4(30)],
            ]
        );
        let triggers = h
            .query_scalar_i64("SELECT count(*) FROM sqlite_temp_master WHERE type = 'trigger'")
            .unwrap();
        assert_eq!(triggers, 0);
    }

    #[test]
    fn upsert_returning_reads_the_updated_row() {
        let (_target, h) = handle();
        setup(&h);
        h.execute("INSERT INTO t (id, v) VALUES (1, 1), (2, 1)", &[]).unwrap();
        let out = execute(
            &h,
            &returning(
                ReturningKind::Upsert,
                "INSERT INTO t (id, v) VALUES (1, 1), (5, 7) ON CONFLICT (id) DO UPDATE SET v = t.v + 1",
                None,
            ),
            &[],
            &[int4(), int4()],
        )
        .unwrap();
        assert_eq!(out.rows_affected, 2);
        assert_eq!(
            out.rows,
            vec![
                vec![PgValue::Int4(1), PgValue::Int4(2)],
                vec![PgValue::Int4(5), PgValue::Int4(7)],
            ]
        );

        let out = execute(
            &h,
            &returning(
                ReturningKind::Insert,
                "INSERT INTO t (id, v) VALUES (2, 9) ON CONFLICT (id) DO NOTHING",
                None,
            ),
            &[],
            &[int4(), int4()],
        )
        .unwrap();
        assert_eq!(out.rows_affected, 0);
        assert!(out.rows.is_empty());
    }

    #[test]
    fn update_and_delete_returning() {
        let (_target, h) = handle();
        setup(&h);
        h.execute("INSERT INTO t (v) VALUES (1), (2), (3)", &[]).unwrap();

        let out = execute(
            &h,
            &returning(ReturningKind::Update, "UPDATE t SET v = v * 10 WHERE v >= ?1", Some("v >= ?1")),
            &[PgValue::Int4(2)],
            &[int4(), int4()],
        )
        .unwrap();
        assert_eq!(
            out.rows,
            vec![
                vec![PgValue::Int4(2), PgValue::Int4(20)],
                vec![PgValue::Int4(3), PgValue::Int4(30)],
            ]
        );

        let out = execute(
            &h,
            &returning(ReturningKind::Delete, "DELETE FROM t WHERE id = 1", Some("id = 1")),
            &[],
            &[int4(), int4()],
        )
        .unwrap();
        assert_eq!(out.rows, vec![vec![PgValue::Int4(1), PgValue::Int4(1)]]);
        assert_eq!(h.query_scalar_i64("SELECT count(*) FROM t").unwrap(), 2);
    }

    #[test]
    fn failed_create_table_leaves_no_mapping() {
        let (_target, h) = handle();
        setup(&h);
        let err = execute(
            &h,
            &Job::CreateTable(CreateTableJob {
                sql: "CREATE TABLE t (x INTEGER)".into(),
                table: "t".into(),
                if_not_exists: false,
                mappings: vec![("x".into(), int4())],
            }),
            &[],
            &[],
        )
        .unwrap_err();
        assert_eq!(err.code, crate::error::sqlstate::DUPLICATE_TABLE);
        let snapshot = h.schema().unwrap();
        assert!(snapshot.table("t").unwrap().column("x").is_none());
    }
}
