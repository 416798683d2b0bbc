//! Per-connection state and statement execution.
//!
//! A [`Session`] owns one storage handle for its whole life, its prepared
//! statements and portals, its settings and its transaction coordinator.
//! The protocol layer drives it message by message; everything here is
//! independent of the wire format.

mod settings;
mod transaction;

pub use settings::Settings;
pub use transaction::{TransactionCoordinator, TxState};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::engine::{execute, Engine, HandleRef, Job};
use crate::error::{sqlstate, PgError, PgResult};
use crate::sql::{
    self, split_statements, CacheKey, Command, CommandTag, Described, Field, SystemContext,
    TranslateContext, Translation, TranslationCache,
};
use crate::types::{decode_binary, decode_text, ColumnType, FormatCode, PgValue};

/// State shared by every session of a server.
pub struct Shared {
    pub engine: Arc<Engine>,
    pub cache: TranslationCache,
    next_pid: AtomicI32,
    active: AtomicUsize,
}

impl Shared {
    pub fn new(engine: Arc<Engine>) -> Self {
        let cache = TranslationCache::new(engine.config().translation_cache_size);
        Self {
            engine,
            cache,
            next_pid: AtomicI32::new(1),
            active: AtomicUsize::new(0),
        }
    }

    /// Claims a connection slot, or fails with `53300` when the configured
    /// limit is reached. The slot is released when dropped.
    pub fn register(self: &Arc<Self>) -> PgResult<ConnectionSlot> {
        let limit = self.engine.config().max_connections;
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if limit > 0 && previous >= limit {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(PgError::fatal(
                sqlstate::TOO_MANY_CONNECTIONS,
                "sorry, too many clients already",
            ));
        }
        Ok(ConnectionSlot {
            shared: Arc::clone(self),
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A counted connection; see [`Shared::register`].
pub struct ConnectionSlot {
    shared: Arc<Shared>,
    pid: i32,
}

impl ConnectionSlot {
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A statement created by Parse (or reused by the simple-query path).
#[derive(Debug)]
pub struct PreparedStatement {
    pub sql: String,
    pub translation: Arc<Translation>,
    pub params: Vec<ColumnType>,
    /// `None` when the statement returns no rows.
    pub fields: Option<Vec<Field>>,
    pub job: Option<Job>,
}

impl PreparedStatement {
    pub fn param_oids(&self) -> Vec<u32> {
        self.params.iter().map(ColumnType::oid).collect()
    }
}

enum PortalState {
    Pending,
    Running {
        rows: VecDeque<Vec<PgValue>>,
        tag: CommandTag,
        affected: u64,
    },
}

/// A prepared statement bound to parameter values and result formats.
pub struct Portal {
    statement: Arc<PreparedStatement>,
    params: Vec<PgValue>,
    result_formats: Vec<FormatCode>,
    state: PortalState,
}

impl Portal {
    pub fn fields(&self) -> Option<&[Field]> {
        self.statement.fields.as_deref()
    }

    pub fn result_formats(&self) -> &[FormatCode] {
        &self.result_formats
    }
}

/// What one statement (or one Execute) produced.
#[derive(Debug, Default)]
pub struct Completion {
    /// Sent as RowDescription before the rows on the simple-query path.
    pub fields: Option<Vec<Field>>,
    pub rows: Vec<Vec<PgValue>>,
    /// Rendered CommandComplete tag; `None` for an empty query.
    pub tag: Option<String>,
    /// Rows remain in the portal.
    pub suspended: bool,
    /// Settings changed by the statement, sent as ParameterStatus.
    pub parameter_status: Vec<(String, String)>,
}

/// Rows and tag of a statement that ran to completion.
struct Executed {
    rows: Vec<Vec<PgValue>>,
    tag: CommandTag,
    affected: u64,
    parameter_status: Vec<(String, String)>,
}

impl Executed {
    fn tag(tag: &'static str) -> Self {
        Executed {
            rows: Vec::new(),
            tag: CommandTag::Other(tag),
            affected: 0,
            parameter_status: Vec::new(),
        }
    }
}

fn statement_label(name: &str) -> String {
    if name.is_empty() {
        "unnamed prepared statement".to_string()
    } else {
        format!("prepared statement \"{name}\"")
    }
}

fn check_format_count(count: usize, expected: usize, what: &str) -> PgResult<()> {
    if count > 1 && count != expected {
        return Err(PgError::protocol(format!(
            "bind message has {count} {what} formats but {expected} {what}s"
        )));
    }
    Ok(())
}

pub struct Session {
    shared: Arc<Shared>,
    handle: HandleRef,
    pid: i32,
    user: String,
    database: String,
    settings: Settings,
    tx: TransactionCoordinator,
    statements: HashMap<String, Arc<PreparedStatement>>,
    portals: HashMap<String, Portal>,
}

impl Session {
    /// Checks out a storage handle and sets up the session.
    ///
    /// ## Arguments
    /// * `shared` - server-wide engine and translation cache
    /// * `pid` - backend process id reported in BackendKeyData
    /// * `startup` - StartupMessage parameters (`user`, `database`, ...)
    pub async fn open(shared: Arc<Shared>, pid: i32, startup: &[(String, String)]) -> PgResult<Self> {
        let param = |key: &str| {
            startup
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };
        let user = param("user").unwrap_or_else(|| "postgres".to_string());
        let database = param("database").unwrap_or_else(|| user.clone());
        let handle = shared.engine.acquire().await?;
        info!(session = pid, %user, %database, "session opened");
        Ok(Self {
            settings: Settings::new(&user, startup),
            tx: TransactionCoordinator::new(pid),
            shared,
            handle,
            pid,
            user,
            database,
            statements: HashMap::new(),
            portals: HashMap::new(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transaction_state(&self) -> TxState {
        self.tx.state()
    }

    /// Rolls back anything left open and returns the handle to the pool.
    pub async fn close(mut self) {
        let engine = Arc::clone(&self.shared.engine);
        self.tx.end_session(&engine, &self.handle).await;
        engine.release(self.handle).await;
        info!(session = self.pid, "session closed");
    }

    fn translate(&self, sql: &str) -> PgResult<Arc<Translation>> {
        let key = CacheKey {
            user: self.user.clone(),
            database: self.database.clone(),
            sql: sql.to_string(),
        };
        let ctx = TranslateContext {
            user: &self.user,
            database: &self.database,
        };
        self.shared.cache.get_or_translate(key, || sql::translate(sql, &ctx))
    }

    async fn describe(&self, translation: &Arc<Translation>, declared: &[u32]) -> PgResult<Described> {
        let translation = Arc::clone(translation);
        let declared = declared.to_vec();
        self.shared
            .engine
            .call(&self.handle, move |h| sql::describe(&translation, &declared, h))
            .await
    }

    async fn prepare(&self, sql: &str, declared: &[u32]) -> PgResult<PreparedStatement> {
        let translation = self.translate(sql)?;
        if let Translation::Control(command) = translation.as_ref() {
            self.tx.admit(command.ends_transaction())?;
        } else {
            self.tx.admit(false)?;
        }
        let described = self.describe(&translation, declared).await?;
        Ok(PreparedStatement {
            sql: sql.to_string(),
            translation,
            params: described.params,
            fields: described.fields,
            job: described.job,
        })
    }

    /// Records a failed statement: fails an explicit transaction, rolls back
    /// an implicit one.
    pub async fn fail(&mut self) {
        let engine = Arc::clone(&self.shared.engine);
        self.tx.fail(&engine, &self.handle).await;
    }

    // Simple query

    /// Runs a simple-query string, one statement at a time.
    ///
    /// Several statements share one implicit transaction. The first error
    /// stops the string; it is returned together with the completions of
    /// the statements that ran before it.
    pub async fn simple_query(&mut self, sql: &str) -> (Vec<Completion>, Option<PgError>) {
        self.portals.remove("");
        let statements = split_statements(sql);
        let mut completions = Vec::with_capacity(statements.len());
        if statements.is_empty() {
            completions.push(Completion::default());
            return (completions, None);
        }

        let engine = Arc::clone(&self.shared.engine);
        if statements.len() > 1 {
            if let Err(err) = self.tx.begin_implicit(&engine, &self.handle).await {
                return (completions, Some(err));
            }
        }
        for statement in &statements {
            trace!(session = self.pid, sql = %statement, "simple query");
            match self.simple_statement(statement).await {
                Ok(completion) => completions.push(completion),
                Err(err) => {
                    debug!(session = self.pid, code = err.code, error = %err, "statement failed");
                    self.fail().await;
                    return (completions, Some(err));
                }
            }
        }
        if let Err(err) = self.tx.finish_implicit(&engine, &self.handle).await {
            return (completions, Some(err));
        }
        (completions, None)
    }

    async fn simple_statement(&mut self, sql: &str) -> PgResult<Completion> {
        let statement = Arc::new(self.prepare(sql, &[]).await?);
        if matches!(statement.translation.as_ref(), Translation::Empty) {
            return Ok(Completion::default());
        }
        let executed = self.run(&statement, Vec::new()).await?;
        Ok(Completion {
            fields: statement.fields.clone(),
            tag: Some(executed.tag.render(executed.affected)),
            rows: executed.rows,
            suspended: false,
            parameter_status: executed.parameter_status,
        })
    }

    // Extended query

    /// Parse. An existing statement of the same name is replaced.
    pub async fn parse(&mut self, name: &str, sql: &str, declared: &[u32]) -> PgResult<()> {
        let statement = self.prepare(sql, declared).await?;
        debug!(session = self.pid, statement = name, params = statement.params.len(), "parsed");
        self.statements.insert(name.to_string(), Arc::new(statement));
        Ok(())
    }

    fn statement(&self, name: &str) -> PgResult<Arc<PreparedStatement>> {
        self.statements.get(name).cloned().ok_or_else(|| {
            PgError::new(
                sqlstate::INVALID_SQL_STATEMENT_NAME,
                format!("{} does not exist", statement_label(name)),
            )
        })
    }

    fn portal(&mut self, name: &str) -> PgResult<&mut Portal> {
        self.portals.get_mut(name).ok_or_else(|| {
            PgError::new(sqlstate::INVALID_CURSOR_NAME, format!("portal \"{name}\" does not exist"))
        })
    }

    /// Bind. Parameter values are decoded per their format into the
    /// statement's parameter types; a value that does not fit its type is
    /// an error, never coerced.
    pub fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: &[FormatCode],
        values: &[Option<Vec<u8>>],
        result_formats: &[FormatCode],
    ) -> PgResult<()> {
        let prepared = self.statement(statement)?;
        if values.len() != prepared.params.len() {
            return Err(PgError::protocol(format!(
                "bind message supplies {} parameters, but {} requires {}",
                values.len(),
                statement_label(statement),
                prepared.params.len()
            )));
        }
        check_format_count(param_formats.len(), values.len(), "parameter")?;
        let columns = prepared.fields.as_ref().map_or(0, Vec::len);
        check_format_count(result_formats.len(), columns, "result")?;
        let ends_transaction =
            matches!(prepared.translation.as_ref(), Translation::Control(c) if c.ends_transaction());
        self.tx.admit(ends_transaction)?;

        let mut params = Vec::with_capacity(values.len());
        for (i, (value, ty)) in values.iter().zip(&prepared.params).enumerate() {
            let value = match value {
                None => PgValue::Null,
                Some(raw) => match FormatCode::for_column(param_formats, i) {
                    FormatCode::Binary => decode_binary(raw, ty)?,
                    FormatCode::Text => {
                        let text = std::str::from_utf8(raw).map_err(|_| {
                            PgError::new(
                                sqlstate::CHARACTER_NOT_IN_REPERTOIRE,
                                "invalid byte sequence for encoding \"UTF8\"",
                            )
                        })?;
                        decode_text(text, ty)?
                    }
                },
            };
            params.push(value);
        }
        self.portals.insert(
            portal.to_string(),
            Portal {
                statement: prepared,
                params,
                result_formats: result_formats.to_vec(),
                state: PortalState::Pending,
            },
        );
        Ok(())
    }

    /// Describe of a statement: parameter type OIDs and result fields.
    pub fn describe_statement(&self, name: &str) -> PgResult<(Vec<u32>, Option<Vec<Field>>)> {
        let statement = self.statement(name)?;
        Ok((statement.param_oids(), statement.fields.clone()))
    }

    /// Describe of a portal: result fields with their negotiated formats.
    pub fn describe_portal(&mut self, name: &str) -> PgResult<Option<(Vec<Field>, Vec<FormatCode>)>> {
        let portal = self.portal(name)?;
        Ok(portal
            .fields()
            .map(|fields| (fields.to_vec(), portal.result_formats().to_vec())))
    }

    /// Result formats a portal's rows are sent in.
    pub fn portal_formats(&self, name: &str) -> Vec<FormatCode> {
        self.portals
            .get(name)
            .map(|portal| portal.result_formats.clone())
            .unwrap_or_default()
    }

    /// Execute. Runs the portal on first use; `max_rows > 0` returns at most
    /// that many rows and leaves the rest for the next Execute.
    pub async fn execute(&mut self, name: &str, max_rows: usize) -> PgResult<Completion> {
        let pending = match &self.portal(name)?.state {
            PortalState::Pending => true,
            PortalState::Running { .. } => false,
        };
        let mut parameter_status = Vec::new();
        if pending {
            let (statement, params) = {
                let portal = self.portal(name)?;
                (Arc::clone(&portal.statement), std::mem::take(&mut portal.params))
            };
            if matches!(statement.translation.as_ref(), Translation::Empty) {
                return Ok(Completion::default());
            }
            let executed = self.run(&statement, params).await?;
            parameter_status = executed.parameter_status;
            // DISCARD ALL / DEALLOCATE may have dropped the portal meanwhile.
            let Some(portal) = self.portals.get_mut(name) else {
                return Ok(Completion {
                    tag: Some(executed.tag.render(executed.affected)),
                    parameter_status,
                    ..Completion::default()
                });
            };
            portal.state = PortalState::Running {
                rows: executed.rows.into(),
                tag: executed.tag,
                affected: executed.affected,
            };
        }

        let portal = self.portal(name)?;
        let PortalState::Running { rows, tag, affected } = &mut portal.state else {
            return Err(PgError::internal("portal did not run"));
        };
        let take = if max_rows == 0 { rows.len() } else { max_rows.min(rows.len()) };
        let batch: Vec<Vec<PgValue>> = rows.drain(..take).collect();
        let suspended = !rows.is_empty();
        let tag = if suspended {
            None
        } else if *tag == CommandTag::Select {
            Some(tag.render(batch.len() as u64))
        } else {
            Some(tag.render(*affected))
        };
        Ok(Completion {
            fields: None,
            rows: batch,
            tag,
            suspended,
            parameter_status,
        })
    }

    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    /// Sync. Outside a transaction block every portal is dropped.
    pub fn sync(&mut self) {
        if self.tx.state() == TxState::Idle {
            self.portals.clear();
        }
    }

    // Execution

    async fn run(&mut self, statement: &PreparedStatement, params: Vec<PgValue>) -> PgResult<Executed> {
        let was_open = self.tx.state() != TxState::Idle;
        let translation = Arc::clone(&statement.translation);
        let mut executed = match translation.as_ref() {
            Translation::Empty => Executed::tag(""),
            Translation::Control(command) => self.control(command).await?,
            Translation::System(system) => {
                let settings = &self.settings;
                let lookup = |name: &str| settings.get(name);
                let ctx = SystemContext {
                    user: &self.user,
                    database: &self.database,
                    backend_pid: self.pid,
                    setting: &lookup,
                };
                let rows = system.evaluate(&ctx, &params)?;
                Executed {
                    affected: rows.len() as u64,
                    rows,
                    tag: CommandTag::Select,
                    parameter_status: Vec::new(),
                }
            }
            Translation::Sql(translated) => {
                let job = statement
                    .job
                    .clone()
                    .ok_or_else(|| PgError::internal("statement was not described"))?;
                let columns: Vec<ColumnType> = statement.fields.iter().flatten().map(|f| f.ty).collect();
                let outcome = self
                    .shared
                    .engine
                    .call(&self.handle, move |h| execute(h, &job, &params, &columns))
                    .await?;
                Executed {
                    rows: outcome.rows,
                    tag: translated.tag,
                    affected: outcome.rows_affected,
                    parameter_status: Vec::new(),
                }
            }
        };
        if was_open && self.tx.state() == TxState::Idle {
            executed.parameter_status.extend(self.settings.end_transaction());
        }
        Ok(executed)
    }

    async fn control(&mut self, command: &Command) -> PgResult<Executed> {
        let engine = Arc::clone(&self.shared.engine);
        let handle = Arc::clone(&self.handle);
        let mut executed = Executed::tag(command.tag());
        match command {
            Command::Begin => self.tx.begin(&engine, &handle).await?,
            Command::Commit => executed.tag = CommandTag::Other(self.tx.commit(&engine, &handle).await?),
            Command::Rollback => self.tx.rollback(&engine, &handle).await?,
            Command::Savepoint(name) => self.tx.savepoint(&engine, &handle, name).await?,
            Command::Release(name) => self.tx.release(&engine, &handle, name).await?,
            Command::RollbackTo(name) => self.tx.rollback_to(&engine, &handle, name).await?,
            Command::Set { name, value, local } => {
                if *local && self.tx.state() == TxState::Idle {
                    debug!(session = self.pid, setting = %name, "SET LOCAL outside a transaction has no effect");
                } else {
                    executed.parameter_status.extend(self.settings.set(name, value.clone(), *local)?);
                }
            }
            Command::SetTransaction => {}
            Command::Show(name) => {
                executed.rows = vec![vec![PgValue::Text(self.settings.show(name)?)]];
                executed.affected = 1;
            }
            Command::ShowAll => {
                executed.rows = self
                    .settings
                    .show_all()
                    .into_iter()
                    .map(|row| row.into_iter().map(PgValue::Text).collect())
                    .collect();
                executed.affected = executed.rows.len() as u64;
            }
            Command::Reset(name) => executed.parameter_status.extend(self.settings.reset(name)?),
            Command::ResetAll => executed.parameter_status = self.settings.reset_all(),
            Command::Discard { all } => {
                if *all {
                    if self.tx.state() != TxState::Idle {
                        return Err(PgError::new(
                            sqlstate::ACTIVE_SQL_TRANSACTION,
                            "DISCARD ALL cannot run inside a transaction block",
                        ));
                    }
                    self.statements.clear();
                    self.portals.clear();
                    executed.parameter_status = self.settings.reset_all();
                }
            }
            Command::Deallocate(Some(name)) => {
                if self.statements.remove(name).is_none() {
                    return Err(PgError::new(
                        sqlstate::INVALID_SQL_STATEMENT_NAME,
                        format!("prepared statement \"{name}\" does not exist"),
                    ));
                }
            }
            Command::Deallocate(None) => self.statements.clear(),
        }
        debug!(session = self.pid, command = command.tag(), "control statement");
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn session() -> Session {
        let engine = Arc::new(Engine::open(Config::in_memory()).await.unwrap());
        let shared = Arc::new(Shared::new(engine));
        let slot = shared.register().unwrap();
        Session::open(shared, slot.pid(), &[("user".into(), "tester".into())])
            .await
            .unwrap()
    }

    async fn ok(session: &mut Session, sql: &str) -> Vec<Completion> {
        let (completions, err) = session.simple_query(sql).await;
        if let Some(err) = err {
            panic!("{sql}: {err}");
        }
        completions
    }

    #[tokio::test]
    async fn simple_query_runs_every_statement() {
        let mut s = session().await;
        let done = ok(
            &mut s,
            "CREATE TABLE t (id SERIAL PRIMARY KEY, v TEXT); INSERT INTO t (v) VALUES ('a'), ('b'); SELECT v FROM t ORDER BY id",
        )
        .await;
        assert_eq!(done.len(), 3);
        assert_eq!(done[0].tag.as_deref(), Some("CREATE TABLE"));
        assert_eq!(done[1].tag.as_deref(), Some("INSERT 0 2"));
        assert_eq!(done[2].tag.as_deref(), Some("SELECT 2"));
        assert_eq!(done[2].fields.as_ref().unwrap()[0].name, "v");
        assert_eq!(done[2].rows[1], vec![PgValue::Text("b".into())]);
        assert_eq!(s.transaction_state(), TxState::Idle);
    }

    #[tokio::test]
    async fn error_rolls_back_the_implicit_transaction() {
        let mut s = session().await;
        ok(&mut s, "CREATE TABLE t (v INTEGER NOT NULL)").await;
        let (done, err) = s.simple_query("INSERT INTO t VALUES (1); INSERT INTO t VALUES (NULL); INSERT INTO t VALUES (3)").await;
        assert_eq!(done.len(), 1);
        assert_eq!(err.unwrap().code, sqlstate::NOT_NULL_VIOLATION);
        let done = ok(&mut s, "SELECT count(*) FROM t").await;
        assert_eq!(done[0].rows[0], vec![PgValue::Int8(0)]);
    }

    #[tokio::test]
    async fn explicit_transaction_fails_until_rollback() {
        let mut s = session().await;
        ok(&mut s, "CREATE TABLE t (v INTEGER)").await;
        ok(&mut s, "BEGIN").await;
        assert!(s.simple_query("SELECT * FROM missing").await.1.is_some());
        assert_eq!(s.transaction_state(), TxState::Failed);
        let err = s.simple_query("SELECT 1").await.1.unwrap();
        assert_eq!(err.code, sqlstate::IN_FAILED_SQL_TRANSACTION);
        let done = ok(&mut s, "COMMIT").await;
        assert_eq!(done[0].tag.as_deref(), Some("ROLLBACK"));
        assert_eq!(s.transaction_state(), TxState::Idle);
    }

    #[tokio::test]
    async fn extended_flow_with_row_limit() {
        let mut s = session().await;
        ok(&mut s, "CREATE TABLE n (v INTEGER); INSERT INTO n VALUES (1), (2), (3)").await;
        s.parse("q", "SELECT v FROM n WHERE v >= $1 ORDER BY v", &[]).await.unwrap();
        let (params, fields) = s.describe_statement("q").unwrap();
        assert_eq!(params, vec![23]);
        assert_eq!(fields.unwrap()[0].ty.oid(), 23);

        s.bind("p", "q", &[], &[Some(b"1".to_vec())], &[]).unwrap();
        let first = s.execute("p", 2).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(first.suspended);
        assert!(first.tag.is_none());
        let rest = s.execute("p", 2).await.unwrap();
        assert_eq!(rest.rows, vec![vec![PgValue::Int4(3)]]);
        assert_eq!(rest.tag.as_deref(), Some("SELECT 1"));
    }

    #[tokio::test]
    async fn bind_validates_parameters() {
        let mut s = session().await;
        ok(&mut s, "CREATE TABLE n (v INTEGER)").await;
        s.parse("", "SELECT v FROM n WHERE v = $1", &[]).await.unwrap();
        let err = s.bind("", "", &[], &[], &[]).unwrap_err();
        assert_eq!(err.code, sqlstate::PROTOCOL_VIOLATION);
        let err = s.bind("", "", &[], &[Some(b"abc".to_vec())], &[]).unwrap_err();
        assert_eq!(err.code, sqlstate::INVALID_TEXT_REPRESENTATION);
        let err = s.bind("", "", &[FormatCode::Binary], &[Some(vec![0, 1])], &[]).unwrap_err();
        assert_eq!(err.code, sqlstate::INVALID_BINARY_REPRESENTATION);
        assert_eq!(s.bind("", "nope", &[], &[], &[]).unwrap_err().code, sqlstate::INVALID_SQL_STATEMENT_NAME);
    }

    #[tokio::test]
    async fn parse_overwrites_and_deallocate_removes() {
        let mut s = session().await;
        s.parse("s", "SELECT 1 AS a", &[]).await.unwrap();
        s.parse("s", "SELECT 2 AS b", &[]).await.unwrap();
        assert_eq!(s.describe_statement("s").unwrap().1.unwrap()[0].name, "b");
        ok(&mut s, "DEALLOCATE s").await;
        assert!(s.describe_statement("s").is_err());
    }

    #[tokio::test]
    async fn settings_and_system_queries() {
        let mut s = session().await;
        let done = ok(&mut s, "SET application_name = 'demo'").await;
        assert_eq!(done[0].parameter_status, vec![("application_name".to_string(), "demo".to_string())]);
        let done = ok(&mut s, "SHOW application_name").await;
        assert_eq!(done[0].rows[0], vec![PgValue::Text("demo".into())]);
        let done = ok(&mut s, "SELECT current_setting('application_name'), current_user").await;
        assert_eq!(done[0].rows[0][0], PgValue::Text("demo".into()));
        assert_eq!(done[0].rows[0][1], PgValue::Text("tester".into()));
        let done = ok(&mut s, "SELECT to_regtype('nonexistent_type')").await;
        assert!(done[0].rows.is_empty());
    }

    #[tokio::test]
    async fn connection_limit() {
        let config = Config {
            max_connections: 1,
            ..Config::in_memory()
        };
        let engine = Arc::new(Engine::open(config).await.unwrap());
        let shared = Arc::new(Shared::new(engine));
        let slot = shared.register().unwrap();
        assert_eq!(shared.register().err().unwrap().code, sqlstate::TOO_MANY_CONNECTIONS);
        drop(slot);
        assert!(shared.register().is_ok());
    }
}
