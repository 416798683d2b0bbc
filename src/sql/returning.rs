use sqlparser::ast::{OnConflict, OnConflictAction, OnInsert, SelectItem, Statement, TableFactor, TableWithJoins};

use super::ddl::relation_name;
use crate::engine::{quote_ident, ReturningJob, ReturningKind};
use crate::error::{PgError, PgResult};

fn select_list(items: &[SelectItem]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Target table of an `UPDATE`/`DELETE`: quoted name, `FROM` item and the
/// qualifier that reaches its `rowid`.
fn target(relation: &TableWithJoins) -> PgResult<(String, String, String)> {
    if !relation.joins.is_empty() {
        return Err(PgError::unsupported("RETURNING with joined targets is not supported"));
    }
    match &relation.relation {
        TableFactor::Table { name, alias, .. } => {
            let table = quote_ident(&relation_name(name)?);
            let qualifier = match alias {
                Some(alias) => alias.name.to_string(),
                None => table.clone(),
            };
            Ok((table, relation.relation.to_string(), qualifier))
        }
        _ => Err(PgError::unsupported("RETURNING needs a plain table target")),
    }
}

/// Splits a rewritten `INSERT`/`UPDATE`/`DELETE ... RETURNING` into the base
/// write and the read-back pieces. Returns `None` when there is no
/// `RETURNING` clause.
pub fn returning_job(statement: &Statement) -> PgResult<Option<ReturningJob>> {
    let mut base = statement.clone();
    let job = match statement {
        Statement::Insert {
            table_name,
            table_alias,
            on,
            returning: Some(items),
            ..
        } => {
            let table = quote_ident(&relation_name(table_name)?);
            let kind = match on {
                Some(OnInsert::OnConflict(OnConflict {
                    action: OnConflictAction::DoUpdate(_),
                    ..
                })) => ReturningKind::Upsert,
                Some(OnInsert::DuplicateKeyUpdate(_)) => {
                    return Err(PgError::unsupported("ON DUPLICATE KEY UPDATE is not supported"));
                }
                _ => ReturningKind::Insert,
            };
            let (source, qualifier) = match table_alias {
                Some(alias) => (format!("{table} AS {alias}"), alias.to_string()),
                None => (table.clone(), table.clone()),
            };
            ReturningJob {
                kind,
                source,
                qualifier,
                table,
                base_sql: String::new(),
                select_list: select_list(items),
                selection: None,
            }
        }
        Statement::Update {
            table,
            from,
            selection,
            returning: Some(items),
            ..
        } => {
            if from.is_some() {
                return Err(PgError::unsupported("UPDATE ... FROM with RETURNING is not supported"));
            }
            let (table, source, qualifier) = target(table)?;
            ReturningJob {
                kind: ReturningKind::Update,
                table,
                source,
                qualifier,
                base_sql: String::new(),
                select_list: select_list(items),
                selection: selection.as_ref().map(ToString::to_string),
            }
        }
        Statement::Delete {
            from,
            using,
            selection,
            returning: Some(items),
            ..
        } => {
            if using.is_some() || from.len() != 1 {
                return Err(PgError::unsupported("DELETE ... USING with RETURNING is not supported"));
            }
            let (table, source, qualifier) = target(&from[0])?;
            ReturningJob {
                kind: ReturningKind::Delete,
                table,
                source,
                qualifier,
                base_sql: String::new(),
                select_list: select_list(items),
                selection: selection.as_ref().map(ToString::to_string),
            }
        }
        _ => return Ok(None),
    };

    match &mut base {
        Statement::Insert { returning, .. }
        | Statement::Update { returning, .. }
        | Statement::Delete { returning, .. } => *returning = None,
        _ => {}
    }
    Ok(Some(ReturningJob {
        base_sql: base.to_string(),
        ..job
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn job(sql: &str) -> ReturningJob {
        let statement = Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap().remove(0);
        returning_job(&statement).unwrap().unwrap()
    }

    #[test]
    fn insert_returning() {
        let job = job("INSERT INTO users (name) VALUES ('a'), ('b') RETURNING id, name");
        assert_eq!(job.kind, ReturningKind::Insert);
        assert_eq!(job.base_sql, "INSERT INTO users (name) VALUES ('a'), ('b')");
        assert_eq!(job.select_list, "id, name");
        assert_eq!(job.table, "\"users\"");
    }

    #[test]
    fn upsert_returning_reads_back_through_the_alias() {
        let upsert = job(
            "INSERT INTO counters AS k (name, hits) VALUES ('a', 1) \
             ON CONFLICT (name) DO UPDATE SET hits = k.hits + 1 RETURNING k.id, k.hits",
        );
        assert_eq!(upsert.kind, ReturningKind::Upsert);
        assert_eq!(upsert.source, "\"counters\" AS k");
        assert_eq!(upsert.qualifier, "k");
        assert!(upsert.base_sql.ends_with("DO UPDATE SET hits = k.hits + 1"));

        let ignore = job("INSERT INTO counters (name) VALUES ('a') ON CONFLICT DO NOTHING RETURNING id");
        assert_eq!(ignore.kind, ReturningKind::Insert);
    }

    #[test]
    fn update_returning_keeps_alias_and_filter() {
        let job = job("UPDATE users AS u SET name = 'x' WHERE u.id > 3 RETURNING u.*");
        assert_eq!(job.kind, ReturningKind::Update);
        assert_eq!(job.source, "users AS u");
        assert_eq!(job.qualifier, "u");
        assert_eq!(job.selection.as_deref(), Some("u.id > 3"));
        assert_eq!(job.base_sql, "UPDATE users AS u SET name = 'x' WHERE u.id > 3");
    }

    #[test]
    fn delete_returning() {
        let job = job("DELETE FROM users WHERE id = 1 RETURNING *");
        assert_eq!(job.kind, ReturningKind::Delete);
        assert_eq!(job.select_list, "*");
        assert_eq!(job.base_sql, "DELETE FROM users WHERE id = 1");
    }

    #[test]
    fn statements_without_returning() {
        let statement = Parser::parse_sql(&PostgreSqlDialect {}, "DELETE FROM users").unwrap().remove(0);
        assert!(returning_job(&statement).unwrap().is_none());
    }
}
