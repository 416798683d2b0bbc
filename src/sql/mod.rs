use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

pub mod cache;
pub mod command;
pub mod ddl;
pub mod infer;
pub mod lexer;
pub mod returning;
pub mod rewrite;
pub mod system;

pub use cache::{CacheKey, TranslationCache};
pub use command::{classify, Command};
pub use infer::ColumnOrigin;
pub use lexer::split_statements;
pub use rewrite::TranslateContext;
pub use system::{SystemContext, SystemQuery};

use crate::engine::{Job, ProbeColumn, StorageHandle};
use crate::error::{sqlstate, PgError, PgResult};
use crate::types::{ColumnType, PgType};

/// How `CommandComplete` reports a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Select,
    Insert,
    Update,
    Delete,
    /// A fixed tag without a row count.
    Other(&'static str),
}

impl CommandTag {
    pub fn render(&self, rows: u64) -> String {
        match self {
            CommandTag::Select => format!("SELECT {rows}"),
            CommandTag::Insert => format!("INSERT 0 {rows}"),
            CommandTag::Update => format!("UPDATE {rows}"),
            CommandTag::Delete => format!("DELETE {rows}"),
            CommandTag::Other(tag) => tag.to_string(),
        }
    }
}

/// A statement rewritten for SQLite.
#[derive(Clone, Debug)]
pub struct SqlTranslation {
    /// The statement as parsed from the client's text, used for type
    /// inference. `None` for statements translated without a parse.
    pub original: Option<Statement>,
    pub job: Job,
    pub tag: CommandTag,
    /// Highest `$n` used by the statement.
    pub param_count: usize,
    pub returns_rows: bool,
    /// SQLite query whose columns describe the result (or, for
    /// `CREATE TABLE ... AS`, the new table's columns).
    pub probe: Option<String>,
}

/// Outcome of translating one statement.
#[derive(Clone, Debug)]
pub enum Translation {
    /// Whitespace or comments only.
    Empty,
    /// Handled by the session without touching SQLite.
    Control(Command),
    /// Answered from session and catalog values.
    System(SystemQuery),
    Sql(SqlTranslation),
}

impl Translation {
    pub fn param_count(&self) -> usize {
        match self {
            Translation::Sql(sql) => sql.param_count,
            Translation::System(system) => system.param_count,
            Translation::Empty | Translation::Control(_) => 0,
        }
    }
}

/// A result column as sent in RowDescription.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: ColumnType,
    /// Set when the column is a plain reference to a table column.
    pub origin: Option<ColumnOrigin>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Field {
            name: name.into(),
            ty,
            origin: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Field::new(name, ColumnType::scalar(PgType::Text))
    }
}

/// Parameter and result types of a translated statement, resolved against
/// the current schema.
#[derive(Clone, Debug)]
pub struct Described {
    pub params: Vec<ColumnType>,
    /// `None` for statements that return no rows.
    pub fields: Option<Vec<Field>>,
    /// The job to run, completed with anything only known at describe time.
    pub job: Option<Job>,
}

/// Translates one PostgreSQL statement.
///
/// Control statements are recognized before parsing; everything else is
/// parsed with the PostgreSQL dialect, checked for catalog-only queries and
/// then rewritten into SQLite's dialect.
///
/// ## Arguments
/// * `sql` - a single statement (simple-query strings are split beforehand)
/// * `ctx` - session values folded into the translation
///
/// ## Returns
/// * `Ok(Translation)` - ready to describe and execute
/// * `Err(_)` - `42601` for syntax errors, `0A000` for unsupported constructs
///
/// ## Example
/// ```ignore
/// let ctx = TranslateContext { user: "app", database: "main" };
/// match translate("SELECT id FROM users WHERE name = $1", &ctx)? {
///     Translation::Sql(sql) => assert_eq!(sql.param_count, 1),
///     _ => unreachable!(),
/// }
/// ```
pub fn translate(sql: &str, ctx: &TranslateContext<'_>) -> PgResult<Translation> {
    let stripped = lexer::strip_comments(sql);
    if stripped.trim().trim_end_matches(';').trim().is_empty() {
        return Ok(Translation::Empty);
    }
    if let Some(command) = classify(sql)? {
        return Ok(Translation::Control(command));
    }
    if let Some((job, tag)) = ddl::truncate(sql)? {
        return Ok(Translation::Sql(SqlTranslation {
            original: None,
            job,
            tag,
            param_count: 0,
            returns_rows: false,
            probe: None,
        }));
    }

    let mut statements =
        Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| PgError::syntax(e.to_string()))?;
    let statement = match statements.len() {
        1 => statements.remove(0),
        0 => return Ok(Translation::Empty),
        _ => {
            return Err(PgError::syntax(
                "cannot insert multiple commands into a prepared statement",
            ))
        }
    };
    if let Some(system) = SystemQuery::detect(&statement) {
        return Ok(Translation::System(system));
    }

    let param_count = rewrite::max_placeholder(&statement);
    let mut rewritten = statement.clone();
    rewrite::rewrite_statement(&mut rewritten, ctx)?;
    let (job, tag, probe) = plan(&rewritten, sql)?;
    let returns_rows = matches!(job, Job::Query { .. } | Job::Returning(_));
    Ok(Translation::Sql(SqlTranslation {
        original: Some(statement),
        job,
        tag,
        param_count,
        returns_rows,
        probe,
    }))
}

/// Chooses the job for a rewritten statement.
fn plan(statement: &Statement, sql: &str) -> PgResult<(Job, CommandTag, Option<String>)> {
    let planned = match statement {
        Statement::Query(_) => {
            let sql = statement.to_string();
            (Job::Query { sql: sql.clone() }, CommandTag::Select, Some(sql))
        }
        Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. } => {
            let tag = match statement {
                Statement::Insert { .. } => CommandTag::Insert,
                Statement::Update { .. } => CommandTag::Update,
                _ => CommandTag::Delete,
            };
            match returning::returning_job(statement)? {
                Some(job) => {
                    let probe = format!("SELECT {} FROM {}", job.select_list, job.source);
                    (Job::Returning(job), tag, Some(probe))
                }
                None => (
                    Job::Statement {
                        sql: statement.to_string(),
                    },
                    tag,
                    None,
                ),
            }
        }
        Statement::CreateTable { query, .. } => {
            let (job, tag) = ddl::create_table(statement)?;
            (job, tag, query.as_ref().map(ToString::to_string))
        }
        Statement::AlterTable { name, operations, .. } => {
            let (job, tag) = ddl::alter_table(name, operations)?;
            (job, tag, None)
        }
        Statement::Drop {
            object_type,
            if_exists,
            names,
            ..
        } => {
            let (job, tag) = ddl::drop(object_type, *if_exists, names)?;
            (job, tag, None)
        }
        Statement::CreateIndex { .. } => {
            let mut index = statement.clone();
            if let Statement::CreateIndex {
                using, concurrently, ..
            } = &mut index
            {
                *using = None;
                *concurrently = false;
            }
            (
                Job::Statement {
                    sql: index.to_string(),
                },
                CommandTag::Other("CREATE INDEX"),
                None,
            )
        }
        Statement::CreateView {
            or_replace,
            materialized,
            name,
            ..
        } => {
            if *materialized {
                return Err(PgError::unsupported("materialized views are not supported"));
            }
            let mut view = statement.clone();
            if let Statement::CreateView { or_replace, .. } = &mut view {
                *or_replace = false;
            }
            let job = if *or_replace {
                Job::Ddl {
                    statements: vec![format!("DROP VIEW IF EXISTS {name}"), view.to_string()],
                    ops: Vec::new(),
                }
            } else {
                Job::Statement { sql: view.to_string() }
            };
            (job, CommandTag::Other("CREATE VIEW"), None)
        }
        _ => {
            let keyword = sql.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
            return Err(PgError::unsupported(format!("{keyword} statements are not supported")));
        }
    };
    Ok(planned)
}

fn declared_types(declared: &[u32], count: usize) -> PgResult<Vec<Option<ColumnType>>> {
    let mut types = Vec::with_capacity(count.max(declared.len()));
    for oid in declared {
        match oid {
            0 => types.push(None),
            oid => types.push(Some(ColumnType::from_oid(*oid).ok_or_else(|| {
                PgError::new(sqlstate::UNDEFINED_OBJECT, format!("type with OID {oid} does not exist"))
            })?)),
        }
    }
    types.resize(count.max(declared.len()), None);
    Ok(types)
}

fn probe_type(probe: &ProbeColumn) -> Option<ColumnType> {
    probe
        .decltype
        .as_deref()
        .filter(|decl| !decl.is_empty())
        .map(ColumnType::from_sqlite_decltype)
}

/// Combines inferred columns with what SQLite reports for the prepared
/// statement. Inference wins wherever it has an answer; if the two disagree
/// on the column count only the probe is used.
fn merge_fields(inferred: Option<&[infer::OutputColumn]>, probe: &[ProbeColumn]) -> Vec<Field> {
    let text = ColumnType::scalar(PgType::Text);
    match inferred {
        Some(columns) if columns.len() == probe.len() => columns
            .iter()
            .zip(probe)
            .map(|(column, probe)| Field {
                name: column.name.clone(),
                ty: column.ty.or_else(|| probe_type(probe)).unwrap_or(text),
                origin: column.origin,
            })
            .collect(),
        _ => probe
            .iter()
            .map(|probe| Field::new(probe.name.clone(), probe_type(probe).unwrap_or(text)))
            .collect(),
    }
}

/// Resolves parameter and result types.
///
/// ## Arguments
/// * `translation` - output of [`translate`]
/// * `declared` - parameter type OIDs from Parse; 0 leaves a parameter open
/// * `handle` - the session's storage handle, for the schema snapshot and
///   for preparing the statement against SQLite
pub fn describe(translation: &Translation, declared: &[u32], handle: &StorageHandle) -> PgResult<Described> {
    let text = ColumnType::scalar(PgType::Text);
    match translation {
        Translation::Empty => Ok(Described {
            params: Vec::new(),
            fields: None,
            job: None,
        }),
        Translation::Control(command) => Ok(Described {
            params: Vec::new(),
            fields: match command {
                Command::Show(name) => Some(vec![Field::text(name.clone())]),
                Command::ShowAll => Some(vec![
                    Field::text("name"),
                    Field::text("setting"),
                    Field::text("description"),
                ]),
                _ => None,
            },
            job: None,
        }),
        Translation::System(system) => {
            let declared = declared_types(declared, system.param_count)?;
            Ok(Described {
                params: declared.into_iter().map(|ty| ty.unwrap_or(text)).collect(),
                fields: Some(
                    system
                        .columns
                        .iter()
                        .map(|column| Field::new(column.name.clone(), column.expr.column_type()))
                        .collect(),
                ),
                job: None,
            })
        }
        Translation::Sql(sql) => describe_sql(sql, declared, handle),
    }
}

fn describe_sql(translation: &SqlTranslation, declared: &[u32], handle: &StorageHandle) -> PgResult<Described> {
    let text = ColumnType::scalar(PgType::Text);
    let declared = declared_types(declared, translation.param_count)?;
    let snapshot = handle.schema()?;
    let inference = match &translation.original {
        Some(statement) => infer::infer(statement, &snapshot, declared.clone())?,
        None => infer::Inference {
            params: declared.clone(),
            columns: None,
        },
    };
    let params = (0..declared.len())
        .map(|i| inference.params.get(i).copied().flatten().unwrap_or(text))
        .collect();

    let mut job = translation.job.clone();
    let mut fields = None;
    if let Some(probe_sql) = &translation.probe {
        let probe = handle.probe_columns(probe_sql)?;
        let merged = merge_fields(inference.columns.as_deref(), &probe);
        match &mut job {
            Job::CreateTable(create) => {
                let temporary = matches!(
                    &translation.original,
                    Some(Statement::CreateTable { temporary: true, .. })
                );
                if !temporary {
                    create.mappings = merged
                        .into_iter()
                        .zip(&probe)
                        .map(|(field, probe)| (probe.name.clone(), field.ty))
                        .collect();
                }
            }
            _ if translation.returns_rows => fields = Some(merged),
            _ => {}
        }
    }
    Ok(Described {
        params,
        fields,
        job: Some(job),
    })
}
