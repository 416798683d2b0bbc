//! DDL translation: table definitions, ALTER/DROP TABLE and TRUNCATE.
//!
//! Column types are declared to SQLite by affinity only; the PostgreSQL
//! type travels alongside in the job so the shadow schema can record it.

use sqlparser::ast::{
    AlterTableOperation, ColumnDef, ColumnOption, Ident, ObjectName, ObjectType, Query, Statement,
    TableConstraint,
};

use super::lexer::{tokenize, Token};
use super::CommandTag;
use crate::engine::{quote_ident, CreateTableJob, Job, MappingOp};
use crate::error::{sqlstate, PgError, PgResult};
use crate::types::{ColumnType, PgType, TypeModifier};

/// Unquoted identifiers fold to lower case, as in PostgreSQL.
pub fn folded(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_ascii_lowercase()
    }
}

/// The relation name SQLite will see, without schema qualifiers.
pub fn relation_name(name: &ObjectName) -> PgResult<String> {
    match name.0.as_slice() {
        [table] => Ok(folded(table)),
        [schema, table] if schema.value.eq_ignore_ascii_case("public") => Ok(folded(table)),
        [schema, _] => Err(PgError::new(
            sqlstate::FEATURE_NOT_SUPPORTED,
            format!("schema \"{}\" is not supported", schema.value),
        )),
        _ => Err(PgError::unsupported(format!("cross-database references are not implemented: {name}"))),
    }
}

fn declared_type(def: &ColumnDef) -> PgResult<crate::types::DeclaredType> {
    let name = def.data_type.to_string();
    ColumnType::parse_declared(&name).ok_or_else(|| {
        PgError::new(
            sqlstate::FEATURE_NOT_SUPPORTED,
            format!("type \"{}\" is not supported", name.to_ascii_lowercase()),
        )
    })
}

fn is_inline_primary_key(def: &ColumnDef) -> bool {
    def.options
        .iter()
        .any(|opt| matches!(opt.option, ColumnOption::Unique { is_primary: true, .. }))
}

struct RenderedColumn {
    name: String,
    ty: ColumnType,
    sql: String,
}

/// Renders one column definition in SQLite's dialect.
///
/// `rowid_key` turns the column into SQLite's `INTEGER PRIMARY KEY`, with
/// `AUTOINCREMENT` for the serial family.
fn render_column(def: &ColumnDef, rowid_key: bool) -> PgResult<RenderedColumn> {
    let declared = declared_type(def)?;
    let name = folded(&def.name);
    let mut parts = vec![quote_ident(&name)];
    if rowid_key {
        parts.push("INTEGER PRIMARY KEY".to_string());
        if declared.serial {
            parts.push("AUTOINCREMENT".to_string());
        }
    } else {
        parts.push(declared.column.sqlite_affinity().to_string());
    }

    for opt in &def.options {
        let rendered = match &opt.option {
            ColumnOption::Null => continue,
            ColumnOption::NotNull => "NOT NULL".to_string(),
            ColumnOption::Default(expr) => format!("DEFAULT ({expr})"),
            ColumnOption::Unique { is_primary: true, .. } if rowid_key => continue,
            ColumnOption::Unique { is_primary: true, .. } => "PRIMARY KEY".to_string(),
            ColumnOption::Unique { is_primary: false, .. } => "UNIQUE".to_string(),
            option @ (ColumnOption::ForeignKey { .. } | ColumnOption::Check(_)) => option.to_string(),
            ColumnOption::Generated { .. } => {
                return Err(PgError::unsupported("generated columns are not supported"));
            }
            _ => continue,
        };
        match &opt.name {
            Some(constraint) => parts.push(format!("CONSTRAINT {constraint} {rendered}")),
            None => parts.push(rendered),
        }
    }

    let column = declared.column;
    if let (PgType::Varchar | PgType::Bpchar, TypeModifier::Length(n), false) =
        (column.base, column.modifier, column.array)
    {
        parts.push(format!("CHECK (length({}) <= {n})", quote_ident(&name)));
    }

    Ok(RenderedColumn {
        name,
        ty: column,
        sql: parts.join(" "),
    })
}

/// Translates `CREATE TABLE`, merging serial primary keys into
/// `INTEGER PRIMARY KEY AUTOINCREMENT`.
pub fn create_table(statement: &Statement) -> PgResult<(Job, CommandTag)> {
    let Statement::CreateTable {
        name,
        columns,
        constraints,
        if_not_exists,
        temporary,
        query,
        ..
    } = statement
    else {
        return Err(PgError::internal("create_table called with a non-CREATE TABLE statement"));
    };
    let table = relation_name(name)?;
    let head = format!(
        "CREATE {}TABLE {}{}",
        if *temporary { "TEMP " } else { "" },
        if *if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_ident(&table)
    );

    if let Some(query) = query {
        return Ok((create_table_as(head, table, *if_not_exists, query), CommandTag::Other("SELECT")));
    }

    let table_pk: Vec<String> = constraints
        .iter()
        .find_map(|c| match c {
            TableConstraint::Unique {
                columns,
                is_primary: true,
                ..
            } => Some(columns.iter().map(folded).collect()),
            _ => None,
        })
        .unwrap_or_default();
    let has_pk = !table_pk.is_empty() || columns.iter().any(is_inline_primary_key);

    let mut rowid_key: Option<String> = None;
    for def in columns {
        let declared = declared_type(def)?;
        let name = folded(&def.name);
        let is_pk = is_inline_primary_key(def) || (table_pk.len() == 1 && table_pk[0] == name);
        let integer = declared.column.base.is_integer() && !declared.column.array;
        if declared.serial && !is_pk {
            if has_pk || rowid_key.is_some() {
                return Err(PgError::unsupported(format!(
                    "serial column \"{name}\" must be the table's primary key"
                )));
            }
            rowid_key = Some(name);
        } else if is_pk && integer {
            rowid_key = Some(name);
        }
    }

    let mut parts = Vec::with_capacity(columns.len() + constraints.len());
    let mut mappings = Vec::with_capacity(columns.len());
    for def in columns {
        let is_rowid = rowid_key.as_deref() == Some(folded(&def.name).as_str());
        let column = render_column(def, is_rowid)?;
        parts.push(column.sql);
        mappings.push((column.name, column.ty));
    }
    for constraint in constraints {
        match constraint {
            TableConstraint::Unique { is_primary: true, .. } if rowid_key.is_some() && table_pk.len() == 1 => {}
            other => parts.push(other.to_string()),
        }
    }

    let sql = format!("{head} ({})", parts.join(", "));
    Ok((
        Job::CreateTable(CreateTableJob {
            sql,
            table,
            if_not_exists: *if_not_exists,
            mappings: if *temporary { Vec::new() } else { mappings },
        }),
        CommandTag::Other("CREATE TABLE"),
    ))
}

fn create_table_as(head: String, table: String, if_not_exists: bool, query: &Query) -> Job {
    Job::CreateTable(CreateTableJob {
        sql: format!("{head} AS {query}"),
        table,
        if_not_exists,
        mappings: Vec::new(),
    })
}

pub fn alter_table(name: &ObjectName, operations: &[AlterTableOperation]) -> PgResult<(Job, CommandTag)> {
    let table = relation_name(name)?;
    let quoted = quote_ident(&table);
    let mut statements = Vec::with_capacity(operations.len());
    let mut ops = Vec::with_capacity(operations.len());
    for operation in operations {
        match operation {
            AlterTableOperation::AddColumn { column_def, .. } => {
                if is_inline_primary_key(column_def) || declared_type(column_def)?.serial {
                    return Err(PgError::unsupported("cannot add a primary key or serial column to an existing table"));
                }
                let column = render_column(column_def, false)?;
                statements.push(format!("ALTER TABLE {quoted} ADD COLUMN {}", column.sql));
                ops.push(MappingOp::AddColumn {
                    table: table.clone(),
                    column: column.name,
                    ty: column.ty,
                });
            }
            AlterTableOperation::DropColumn { column_name, .. } => {
                let column = folded(column_name);
                statements.push(format!("ALTER TABLE {quoted} DROP COLUMN {}", quote_ident(&column)));
                ops.push(MappingOp::DropColumn {
                    table: table.clone(),
                    column,
                });
            }
            AlterTableOperation::RenameColumn {
                old_column_name,
                new_column_name,
            } => {
                let (from, to) = (folded(old_column_name), folded(new_column_name));
                statements.push(format!(
                    "ALTER TABLE {quoted} RENAME COLUMN {} TO {}",
                    quote_ident(&from),
                    quote_ident(&to)
                ));
                ops.push(MappingOp::RenameColumn {
                    table: table.clone(),
                    from,
                    to,
                });
            }
            AlterTableOperation::RenameTable { table_name } => {
                let to = relation_name(table_name)?;
                statements.push(format!("ALTER TABLE {quoted} RENAME TO {}", quote_ident(&to)));
                ops.push(MappingOp::RenameTable {
                    from: table.clone(),
                    to,
                });
            }
            other => return Err(PgError::unsupported(format!("ALTER TABLE {other} is not supported"))),
        }
    }
    Ok((Job::Ddl { statements, ops }, CommandTag::Other("ALTER TABLE")))
}

pub fn drop(object_type: &ObjectType, if_exists: bool, names: &[ObjectName]) -> PgResult<(Job, CommandTag)> {
    let (keyword, tag) = match object_type {
        ObjectType::Table => ("TABLE", "DROP TABLE"),
        ObjectType::View => ("VIEW", "DROP VIEW"),
        ObjectType::Index => ("INDEX", "DROP INDEX"),
        other => return Err(PgError::unsupported(format!("DROP {other} is not supported"))),
    };
    let guard = if if_exists { "IF EXISTS " } else { "" };
    let mut statements = Vec::with_capacity(names.len());
    let mut ops = Vec::new();
    for name in names {
        let relation = relation_name(name)?;
        statements.push(format!("DROP {keyword} {guard}{}", quote_ident(&relation)));
        if *object_type == ObjectType::Table {
            ops.push(MappingOp::DropTable { table: relation });
        }
    }
    Ok((Job::Ddl { statements, ops }, CommandTag::Other(tag)))
}

/// Recognizes `TRUNCATE [TABLE] [ONLY] name [, ...] [options]` and turns it
/// into one `DELETE` per table. Identity options are accepted and ignored.
pub fn truncate(sql: &str) -> PgResult<Option<(Job, CommandTag)>> {
    let tokens = tokenize(sql);
    match tokens.first() {
        Some(t) if t.is_word("truncate") => {}
        _ => return Ok(None),
    }
    let mut statements = Vec::new();
    for token in &tokens[1..] {
        let name = match token {
            Token::Word(w) if matches!(w.as_str(), "table" | "only") && statements.is_empty() => continue,
            Token::Word(w) if matches!(w.as_str(), "restart" | "continue" | "identity" | "cascade" | "restrict") => {
                continue
            }
            Token::Punct(',' | ';') => continue,
            Token::Word(w) => w.strip_prefix("public.").unwrap_or(w).to_string(),
            Token::Quoted(name) => name.clone(),
            other => return Err(PgError::syntax(format!("syntax error at or near \"{}\"", other.text()))),
        };
        statements.push(format!("DELETE FROM {}", quote_ident(&name)));
    }
    if statements.is_empty() {
        return Err(PgError::syntax("syntax error at end of input"));
    }
    Ok(Some((
        Job::Ddl {
            statements,
            ops: Vec::new(),
        },
        CommandTag::Other("TRUNCATE TABLE"),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn parse(sql: &str) -> Statement {
        Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap().remove(0)
    }

    fn create(sql: &str) -> CreateTableJob {
        match create_table(&parse(sql)).unwrap().0 {
            Job::CreateTable(job) => job,
            other => panic!("unexpected job {other:?}"),
        }
    }

    #[test]
    fn serial_primary_key_becomes_autoincrement() {
        let job = create("CREATE TABLE Users (id SERIAL PRIMARY KEY, name VARCHAR(20) NOT NULL)");
        assert_eq!(job.table, "users");
        assert_eq!(
            job.sql,
            "CREATE TABLE \"users\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
             \"name\" TEXT NOT NULL CHECK (length(\"name\") <= 20))"
        );
        assert_eq!(job.mappings[0], ("id".to_string(), ColumnType::scalar(PgType::Int4)));
        assert_eq!(job.mappings[1].1.to_string(), "character varying(20)");
    }

    #[test]
    fn table_level_primary_key_is_merged() {
        let job = create("CREATE TABLE t (id BIGSERIAL, v NUMERIC(10,2), PRIMARY KEY (id))");
        assert_eq!(
            job.sql,
            "CREATE TABLE \"t\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \"v\" NUMERIC)"
        );
        assert_eq!(job.mappings[0].1, ColumnType::scalar(PgType::Int8));
        assert_eq!(job.mappings[1].1.to_string(), "numeric(10,2)");
    }

    #[test]
    fn composite_keys_and_defaults_are_kept() {
        let job = create(
            "CREATE TABLE IF NOT EXISTS m (a INT, b TEXT DEFAULT 'x', created TIMESTAMPTZ, PRIMARY KEY (a, b))",
        );
        assert!(job.if_not_exists);
        assert!(job.sql.starts_with("CREATE TABLE IF NOT EXISTS \"m\" (\"a\" INTEGER, \"b\" TEXT DEFAULT ('x')"));
        assert!(job.sql.ends_with("PRIMARY KEY (a, b))"));
    }

    #[test]
    fn serial_outside_the_key_is_rejected() {
        let err = create_table(&parse("CREATE TABLE t (id INT PRIMARY KEY, n SERIAL)")).unwrap_err();
        assert_eq!(err.code, sqlstate::FEATURE_NOT_SUPPORTED);
        let err = create_table(&parse("CREATE TABLE t (v tsvector)")).unwrap_err();
        assert_eq!(err.code, sqlstate::FEATURE_NOT_SUPPORTED);
    }

    #[test]
    fn alter_table_operations() {
        let Statement::AlterTable { name, operations, .. } =
            parse("ALTER TABLE t ADD COLUMN price NUMERIC(8,3), RENAME COLUMN a TO b")
        else {
            panic!("not an ALTER TABLE");
        };
        let (job, tag) = alter_table(&name, &operations).unwrap();
        assert_eq!(tag, CommandTag::Other("ALTER TABLE"));
        let Job::Ddl { statements, ops } = job else {
            panic!("not a DDL job");
        };
        assert_eq!(statements[0], "ALTER TABLE \"t\" ADD COLUMN \"price\" NUMERIC");
        assert_eq!(statements[1], "ALTER TABLE \"t\" RENAME COLUMN \"a\" TO \"b\"");
        assert!(matches!(&ops[0], MappingOp::AddColumn { column, .. } if column == "price"));
    }

    #[test]
    fn truncate_becomes_delete() {
        let (job, tag) = truncate("TRUNCATE TABLE public.a, \"B\" RESTART IDENTITY").unwrap().unwrap();
        assert_eq!(tag, CommandTag::Other("TRUNCATE TABLE"));
        assert_eq!(
            job,
            Job::Ddl {
                statements: vec!["DELETE FROM \"a\"".into(), "DELETE FROM \"B\"".into()],
                ops: Vec::new(),
            }
        );
        assert!(truncate("SELECT 1").unwrap().is_none());
    }
}
