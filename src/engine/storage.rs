use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, Statement};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

use super::catalog::{self, SchemaSnapshot};
use crate::config::Config;
use crate::error::{PgError, PgResult};
use crate::types::{datetime, PgValue};

/// Where the SQLite database lives.
#[derive(Clone, Debug)]
pub enum StorageTarget {
    /// A database file on disk.
    File(PathBuf),
    /// A throwaway database in a private directory, removed once the last
    /// clone of the target is dropped. Backs `--in-memory`.
    Scratch(Arc<TempDir>),
}

impl StorageTarget {
    /// Creates a scratch target, on `/dev/shm` where that exists.
    ///
    /// The database is a real file in WAL mode, so readers keep seeing the
    /// last commit while another handle holds an uncommitted write.
    pub fn scratch() -> PgResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pgbridge-");
        let shm = Path::new("/dev/shm");
        let created = if shm.is_dir() {
            builder.tempdir_in(shm).or_else(|_| builder.tempdir())
        } else {
            builder.tempdir()
        };
        let dir = created
            .map_err(|e| PgError::internal(format!("cannot create scratch database directory: {e}")))?;
        Ok(StorageTarget::Scratch(Arc::new(dir)))
    }

    fn path(&self) -> PathBuf {
        match self {
            StorageTarget::File(path) => path.clone(),
            StorageTarget::Scratch(dir) => dir.path().join("scratch.db"),
        }
    }

    /// Name reported as `table_catalog` by the catalog views.
    pub fn database_name(&self) -> String {
        match self {
            StorageTarget::File(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "main".to_string()),
            StorageTarget::Scratch(_) => "memory".to_string(),
        }
    }

    fn open_connection(&self) -> rusqlite::Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(self.path(), flags)
    }
}

/// Result of a statement that does not produce rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// A result column as reported by SQLite when a statement is prepared but
/// not executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeColumn {
    pub name: String,
    pub decltype: Option<String>,
}

/// One SQLite connection, owned by at most one session at a time.
///
/// Every engine primitive the bridge needs goes through this type: statement
/// execution with bound parameters, row queries, prepare-only probing of
/// result columns, transaction control, and the refresh/checkpoint pair that
/// makes commits of one handle visible to every handle opened afterwards.
///
/// ## Handle Setup
/// Each handle is configured on open:
/// - `journal_mode`, `synchronous` and `busy_timeout` from [`Config`]
/// - `foreign_keys = ON`
/// - scalar functions `gen_random_uuid()` and `now()`
/// - temporary catalog views used to answer introspection queries
///
/// ## Thread Safety
/// `rusqlite::Connection` is `Send` but not `Sync`. Handles are wrapped in a
/// `parking_lot::Mutex` by the [`Engine`](super::Engine) and only touched from
/// tokio's blocking pool.
pub struct StorageHandle {
    conn: Connection,
    journal_mode: String,
    savepoint_depth: Cell<u32>,
    schema_cache: RefCell<Option<(i64, Arc<SchemaSnapshot>)>>,
}

impl StorageHandle {
    /// Opens and configures a new handle.
    ///
    /// ## Arguments
    /// * `target` - database file or scratch directory
    /// * `config` - pragma settings
    ///
    /// ## Returns
    /// * `Ok(StorageHandle)` - configured handle with catalog views installed
    /// * `Err(_)` - SQLite could not open or configure the database
    pub fn open(target: &StorageTarget, config: &Config) -> PgResult<Self> {
        let conn = target.open_connection()?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", &config.journal_mode, |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case(&config.journal_mode) {
            debug!(requested = %config.journal_mode, actual = %journal_mode, "journal mode differs from requested");
        }
        conn.pragma_update(None, "synchronous", &config.synchronous)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        register_functions(&conn)?;

        let handle = Self {
            conn,
            journal_mode: journal_mode.to_ascii_lowercase(),
            savepoint_depth: Cell::new(0),
            schema_cache: RefCell::new(None),
        };
        catalog::ensure_schema_table(&handle.conn)?;
        catalog::install_views(&handle.conn, &target.database_name())?;
        Ok(handle)
    }

    pub fn journal_mode(&self) -> &str {
        &self.journal_mode
    }

    /// True when no transaction (explicit or savepoint) is open.
    pub fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn execute(&self, sql: &str, params: &[PgValue]) -> PgResult<ExecResult> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        bind(&mut stmt, params)?;
        let rows_affected = stmt.raw_execute()? as u64;
        Ok(ExecResult {
            rows_affected,
            last_insert_id: self.conn.last_insert_rowid(),
        })
    }

    /// Runs a row-returning statement and collects every row.
    pub fn query(&self, sql: &str, params: &[PgValue]) -> PgResult<Vec<Vec<SqlValue>>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        bind(&mut stmt, params)?;
        let width = stmt.column_count();
        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(SqlValue::from(row.get_ref(idx)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    pub fn query_scalar_i64(&self, sql: &str) -> PgResult<i64> {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }

    /// Prepares `sql` without executing it and reports its result columns.
    pub fn probe_columns(&self, sql: &str) -> PgResult<Vec<ProbeColumn>> {
        let stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt
            .columns()
            .into_iter()
            .map(|col| ProbeColumn {
                name: col.name().to_string(),
                decltype: col.decl_type().map(str::to_string),
            })
            .collect())
    }

    /// Number of `?NNN` parameters a statement expects.
    pub fn probe_parameter_count(&self, sql: &str) -> PgResult<usize> {
        Ok(self.conn.prepare_cached(sql)?.parameter_count())
    }

    pub fn begin(&self) -> PgResult<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Commits and runs the post-commit half of the refresh discipline.
    pub fn commit(&self) -> PgResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.checkpoint();
        Ok(())
    }

    pub fn rollback(&self) -> PgResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        self.invalidate_schema();
        Ok(())
    }

    pub fn savepoint(&self, name: &str) -> PgResult<()> {
        self.conn.execute_batch(&format!("SAVEPOINT {}", quote_ident(name)))?;
        Ok(())
    }

    pub fn release(&self, name: &str) -> PgResult<()> {
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))?;
        Ok(())
    }

    pub fn rollback_to(&self, name: &str) -> PgResult<()> {
        self.conn.execute_batch(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))?;
        self.invalidate_schema();
        Ok(())
    }

    /// Runs `f` inside a savepoint: all of its writes land, or none do.
    ///
    /// Outside a transaction the savepoint is also the transaction, so the
    /// release is a commit and is followed by a checkpoint.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> PgResult<T>) -> PgResult<T> {
        let depth = self.savepoint_depth.get() + 1;
        let name = format!("pgbridge_atomic_{depth}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        self.savepoint_depth.set(depth);
        let result = f(self);
        self.savepoint_depth.set(depth - 1);
        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                if self.conn.is_autocommit() {
                    self.checkpoint();
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(undo) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    warn!(error = %undo, "failed to undo savepoint");
                }
                self.invalidate_schema();
                Err(err)
            }
        }
    }

    /// Opens and closes an empty read transaction so the handle's view of the
    /// database starts from the latest commit.
    pub fn refresh(&self) -> PgResult<()> {
        if !self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("BEGIN")?;
        let probe = self
            .conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0));
        self.conn.execute_batch("COMMIT")?;
        probe?;
        Ok(())
    }

    /// Passive WAL checkpoint after a commit. A failed checkpoint does not
    /// undo the commit, so it is only logged.
    pub fn checkpoint(&self) {
        if self.journal_mode != "wal" {
            return;
        }
        if let Err(err) = self
            .conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
        {
            debug!(error = %err, "passive checkpoint failed");
        }
    }

    /// Current catalog snapshot, reloaded whenever the schema cookie moves.
    pub fn schema(&self) -> PgResult<Arc<SchemaSnapshot>> {
        let version = self.query_scalar_i64("PRAGMA schema_version")?;
        if let Some((cached_version, snapshot)) = self.schema_cache.borrow().as_ref() {
            if *cached_version == version {
                return Ok(Arc::clone(snapshot));
            }
        }
        let snapshot = Arc::new(catalog::load_snapshot(&self.conn)?);
        *self.schema_cache.borrow_mut() = Some((version, Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    pub fn invalidate_schema(&self) {
        self.schema_cache.borrow_mut().take();
    }
}

fn bind(stmt: &mut Statement<'_>, params: &[PgValue]) -> PgResult<()> {
    let expected = stmt.parameter_count();
    if params.len() < expected {
        return Err(PgError::protocol(format!(
            "bind message supplies {} parameters, but prepared statement requires {}",
            params.len(),
            expected
        )));
    }
    for (idx, value) in params.iter().enumerate().take(expected) {
        stmt.raw_bind_parameter(idx + 1, value.to_sql()?)?;
    }
    Ok(())
}

fn register_functions(conn: &Connection) -> PgResult<()> {
    conn.create_scalar_function(
        "gen_random_uuid",
        0,
        FunctionFlags::SQLITE_UTF8,
        |_ctx: &Context<'_>| -> rusqlite::Result<String> { Ok(uuid::Uuid::new_v4().to_string()) },
    )?;
    conn.create_scalar_function(
        "now",
        0,
        FunctionFlags::SQLITE_UTF8,
        |_ctx: &Context<'_>| -> rusqlite::Result<String> {
            Ok(datetime::format_timestamptz(&chrono::Utc::now()))
        },
    )?;
    Ok(())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_handle() -> (StorageTarget, StorageHandle) {
        let target = StorageTarget::scratch().unwrap();
        let handle = StorageHandle::open(&target, &Config::in_memory()).unwrap();
        (target, handle)
    }

    #[test]
    fn scratch_directory_goes_away_with_the_target() {
        let (target, handle) = memory_handle();
        let path = target.path();
        assert!(path.exists());
        assert_eq!(handle.journal_mode(), "wal");
        drop(handle);
        drop(target);
        assert!(!path.exists());
    }

    #[test]
    fn executes_and_queries_with_numbered_params() {
        let (_target, handle) = memory_handle();
        handle
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .unwrap();
        let res = handle
            .execute(
                "INSERT INTO t (name) VALUES (?1), (?2)",
                &[PgValue::Text("a".into()), PgValue::Text("b".into())],
            )
            .unwrap();
        assert_eq!(res.rows_affected, 2);
        assert_eq!(res.last_insert_id, 2);

        let rows = handle
            .query("SELECT name FROM t WHERE id = ?1", &[PgValue::Int4(2)])
            .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Text("b".into())]]);
    }

    #[test]
    fn prepare_reports_columns_without_running() {
        let (_target, handle) = memory_handle();
        handle.execute("CREATE TABLE p (price NUMERIC, note TEXT)", &[]).unwrap();
        let cols = handle.probe_columns("SELECT price, note, 1 AS one FROM p").unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[0].decltype.as_deref(), Some("NUMERIC"));
        assert_eq!(cols[2].name, "one");
        assert_eq!(cols[2].decltype, None);
    }

    #[test]
    fn atomically_rolls_back_on_error() {
        let (_target, handle) = memory_handle();
        handle.execute("CREATE TABLE a (v INTEGER)", &[]).unwrap();
        let err = handle
            .atomically(|h| {
                h.execute("INSERT INTO a VALUES (1)", &[])?;
                h.execute("INSERT INTO missing VALUES (1)", &[])
            })
            .unwrap_err();
        assert_eq!(err.code, crate::error::sqlstate::UNDEFINED_TABLE);
        assert_eq!(handle.query_scalar_i64("SELECT count(*) FROM a").unwrap(), 0);
        assert!(handle.is_autocommit());
    }

    #[test]
    fn registered_functions() {
        let (_target, handle) = memory_handle();
        let rows = handle
            .query("SELECT gen_random_uuid(), now()", &[])
            .unwrap();
        match &rows[0][0] {
            SqlValue::Text(u) => assert_eq!(u.len(), 36),
            other => panic!("unexpected {other:?}"),
        }
        match &rows[0][1] {
            SqlValue::Text(ts) => assert!(ts.ends_with("+00")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
