//! Catalog emulation: system relations and functions answered without
//! asking SQLite for anything it does not have.

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, Ident, ObjectName, SelectItem, SetExpr, Statement, Value,
};

use crate::engine::{
    VIEW_INFORMATION_SCHEMA_COLUMNS, VIEW_INFORMATION_SCHEMA_TABLES, VIEW_PG_NAMESPACE,
    VIEW_PG_TABLES, VIEW_PG_TYPE,
};
use crate::error::{PgError, PgResult};
use crate::types::{ColumnType, PgType, PgValue};

pub const SERVER_VERSION: &str = "15.0";

pub fn version_string() -> String {
    format!(
        "PostgreSQL {SERVER_VERSION} (pgbridge {}) on SQLite {}",
        env!("CARGO_PKG_VERSION"),
        rusqlite::version()
    )
}

/// Maps a PostgreSQL catalog relation to the view that emulates it, if any.
pub fn system_relation(name: &ObjectName) -> Option<&'static str> {
    let parts: Vec<String> = name.0.iter().map(|ident| ident.value.to_ascii_lowercase()).collect();
    let (schema, relation) = match parts.as_slice() {
        [relation] => (None, relation.as_str()),
        [schema, relation] => (Some(schema.as_str()), relation.as_str()),
        [_, schema, relation] => (Some(schema.as_str()), relation.as_str()),
        _ => return None,
    };
    match (schema, relation) {
        (Some("information_schema"), "tables") => Some(VIEW_INFORMATION_SCHEMA_TABLES),
        (Some("information_schema"), "columns") => Some(VIEW_INFORMATION_SCHEMA_COLUMNS),
        (None | Some("pg_catalog"), "pg_type") => Some(VIEW_PG_TYPE),
        (None | Some("pg_catalog"), "pg_namespace") => Some(VIEW_PG_NAMESPACE),
        (None | Some("pg_catalog"), "pg_tables") => Some(VIEW_PG_TABLES),
        _ => None,
    }
}

/// Rewrites a relation name into the name SQLite knows it by: catalog
/// relations become their views, `public.` and `pg_catalog.` qualifiers are
/// dropped.
pub fn sqlite_relation(name: &ObjectName) -> ObjectName {
    if let Some(view) = system_relation(name) {
        return ObjectName(vec![Ident::new(view)]);
    }
    match name.0.as_slice() {
        [schema, relation]
            if schema.value.eq_ignore_ascii_case("public") || schema.value.eq_ignore_ascii_case("pg_catalog") =>
        {
            ObjectName(vec![relation.clone()])
        }
        _ => name.clone(),
    }
}

/// Session values a system query may need.
#[derive(Clone, Copy)]
pub struct SystemContext<'a> {
    pub user: &'a str,
    pub database: &'a str,
    pub backend_pid: i32,
    pub setting: &'a dyn Fn(&str) -> Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemArg {
    Literal(String),
    /// Zero-based parameter index.
    Param(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemExpr {
    Version,
    CurrentDatabase,
    CurrentSchema,
    CurrentUser,
    SessionUser,
    ToRegtype(SystemArg),
    CurrentSetting(SystemArg),
    BackendPid,
    Literal(Option<String>, ColumnType),
}

impl SystemExpr {
    pub fn column_type(&self) -> ColumnType {
        match self {
            SystemExpr::Version | SystemExpr::CurrentSetting(_) => ColumnType::scalar(PgType::Text),
            SystemExpr::CurrentDatabase
            | SystemExpr::CurrentSchema
            | SystemExpr::CurrentUser
            | SystemExpr::SessionUser => ColumnType::scalar(PgType::Name),
            SystemExpr::ToRegtype(_) => ColumnType::scalar(PgType::RegType),
            SystemExpr::BackendPid => ColumnType::scalar(PgType::Int4),
            SystemExpr::Literal(_, ty) => *ty,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemColumn {
    pub name: String,
    pub expr: SystemExpr,
}

/// A `SELECT` without `FROM` made only of catalog functions and literals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemQuery {
    pub columns: Vec<SystemColumn>,
    pub param_count: usize,
}

impl SystemQuery {
    /// Recognizes statements like `SELECT version()` or
    /// `SELECT to_regtype($1), current_setting('search_path')`.
    pub fn detect(statement: &Statement) -> Option<SystemQuery> {
        let Statement::Query(query) = statement else {
            return None;
        };
        if query.with.is_some() || !query.order_by.is_empty() || query.limit.is_some() {
            return None;
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return None;
        };
        if !select.from.is_empty() || select.selection.is_some() || select.distinct.is_some() {
            return None;
        }

        let mut columns = Vec::new();
        let mut saw_function = false;
        let mut param_count = 0;
        for item in &select.projection {
            let (expr, alias) = match item {
                SelectItem::UnnamedExpr(expr) => (expr, None),
                SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
                _ => return None,
            };
            let (name, system) = system_expr(expr)?;
            if !matches!(system, SystemExpr::Literal(..)) {
                saw_function = true;
            }
            if let SystemExpr::ToRegtype(SystemArg::Param(i)) | SystemExpr::CurrentSetting(SystemArg::Param(i)) =
                &system
            {
                param_count = param_count.max(i + 1);
            }
            columns.push(SystemColumn {
                name: alias.unwrap_or(name),
                expr: system,
            });
        }
        saw_function.then_some(SystemQuery { columns, param_count })
    }

    /// Evaluates the query. Returns no rows when `to_regtype` is given an
    /// unknown type name.
    pub fn evaluate(&self, ctx: &SystemContext<'_>, params: &[PgValue]) -> PgResult<Vec<Vec<PgValue>>> {
        let mut row = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = match &column.expr {
                SystemExpr::Version => PgValue::Text(version_string()),
                SystemExpr::CurrentDatabase => PgValue::Text(ctx.database.to_string()),
                SystemExpr::CurrentSchema => PgValue::Text("public".to_string()),
                SystemExpr::CurrentUser | SystemExpr::SessionUser => PgValue::Text(ctx.user.to_string()),
                SystemExpr::BackendPid => PgValue::Int4(ctx.backend_pid),
                SystemExpr::ToRegtype(arg) => match argument(arg, params)? {
                    None => PgValue::Null,
                    Some(name) => match ColumnType::parse(&name) {
                        Some(ty) => PgValue::RegType(ty.oid()),
                        None => return Ok(Vec::new()),
                    },
                },
                SystemExpr::CurrentSetting(arg) => match argument(arg, params)? {
                    None => PgValue::Null,
                    Some(name) => match (ctx.setting)(&name) {
                        Some(value) => PgValue::Text(value),
                        None => {
                            return Err(PgError::new(
                                crate::error::sqlstate::UNDEFINED_OBJECT,
                                format!("unrecognized configuration parameter \"{name}\""),
                            ))
                        }
                    },
                },
                SystemExpr::Literal(None, _) => PgValue::Null,
                SystemExpr::Literal(Some(text), ty) => crate::types::decode_text(text, ty)?,
            };
            row.push(value);
        }
        Ok(vec![row])
    }
}

fn argument(arg: &SystemArg, params: &[PgValue]) -> PgResult<Option<String>> {
    match arg {
        SystemArg::Literal(text) => Ok(Some(text.clone())),
        SystemArg::Param(i) => match params.get(*i) {
            Some(PgValue::Null) => Ok(None),
            Some(value) => Ok(Some(crate::types::encode_text(value))),
            None => Err(PgError::protocol(format!("missing value for parameter ${}", i + 1))),
        },
    }
}

/// Lowercased function name without a `pg_catalog.` qualifier.
pub fn function_name(name: &ObjectName) -> String {
    match name.0.as_slice() {
        [schema, func] if schema.value.eq_ignore_ascii_case("pg_catalog") => func.value.to_ascii_lowercase(),
        _ => name.to_string().to_ascii_lowercase(),
    }
}

pub fn unnamed_args(args: &[FunctionArg]) -> Vec<&Expr> {
    args.iter()
        .filter_map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Some(expr),
            _ => None,
        })
        .collect()
}

fn text_argument(expr: &Expr) -> Option<SystemArg> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::EscapedStringLiteral(s)) => {
            Some(SystemArg::Literal(s.clone()))
        }
        Expr::Value(Value::Placeholder(p)) => {
            let n: usize = p.trim_start_matches('$').parse().ok()?;
            n.checked_sub(1).map(SystemArg::Param)
        }
        Expr::Cast { expr, .. } | Expr::Nested(expr) => text_argument(expr),
        _ => None,
    }
}

/// Session-level identifiers that need no arguments.
pub fn keyword_function(name: &str) -> Option<SystemExpr> {
    match name {
        "current_user" | "current_role" | "user" => Some(SystemExpr::CurrentUser),
        "session_user" => Some(SystemExpr::SessionUser),
        "current_schema" => Some(SystemExpr::CurrentSchema),
        "current_catalog" => Some(SystemExpr::CurrentDatabase),
        _ => None,
    }
}

fn system_expr(expr: &Expr) -> Option<(String, SystemExpr)> {
    match expr {
        Expr::Function(func) => {
            let name = function_name(&func.name);
            let args = unnamed_args(&func.args);
            let system = match (name.as_str(), args.as_slice()) {
                ("version", []) => SystemExpr::Version,
                ("current_database", []) => SystemExpr::CurrentDatabase,
                ("pg_backend_pid", []) => SystemExpr::BackendPid,
                ("to_regtype", [arg]) => SystemExpr::ToRegtype(text_argument(arg)?),
                ("current_setting", [arg]) => SystemExpr::CurrentSetting(text_argument(arg)?),
                (other, []) if other != "user" => keyword_function(other)?,
                _ => return None,
            };
            Some((name, system))
        }
        Expr::Identifier(ident) if ident.quote_style.is_none() => {
            let name = ident.value.to_ascii_lowercase();
            match name.as_str() {
                "current_user" | "session_user" | "current_schema" | "current_catalog" | "current_role" => {
                    Some((name.clone(), keyword_function(&name)?))
                }
                _ => None,
            }
        }
        Expr::Value(value) => {
            let literal = match value {
                Value::Number(n, _) => {
                    let ty = if n.parse::<i32>().is_ok() {
                        PgType::Int4
                    } else if n.parse::<i64>().is_ok() {
                        PgType::Int8
                    } else {
                        PgType::Numeric
                    };
                    SystemExpr::Literal(Some(n.clone()), ColumnType::scalar(ty))
                }
                Value::SingleQuotedString(s) => SystemExpr::Literal(Some(s.clone()), ColumnType::scalar(PgType::Text)),
                Value::Boolean(b) => SystemExpr::Literal(
                    Some(if *b { "t" } else { "f" }.to_string()),
                    ColumnType::scalar(PgType::Bool),
                ),
                Value::Null => SystemExpr::Literal(None, ColumnType::scalar(PgType::Text)),
                _ => return None,
            };
            Some(("?column?".to_string(), literal))
        }
        Expr::Nested(inner) => system_expr(inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn detect(sql: &str) -> Option<SystemQuery> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap();
        SystemQuery::detect(&statements[0])
    }

    fn ctx_eval(query: &SystemQuery, params: &[PgValue]) -> PgResult<Vec<Vec<PgValue>>> {
        let setting = |name: &str| (name == "search_path").then(|| "public".to_string());
        let ctx = SystemContext {
            user: "alice",
            database: "app",
            backend_pid: 42,
            setting: &setting,
        };
        query.evaluate(&ctx, params)
    }

    #[test]
    fn to_regtype_known_and_unknown() {
        let known = detect("SELECT to_regtype('integer')").unwrap();
        assert_eq!(known.columns[0].name, "to_regtype");
        assert_eq!(ctx_eval(&known, &[]).unwrap(), vec![vec![PgValue::RegType(23)]]);

        let unknown = detect("SELECT to_regtype('nonexistent_type')").unwrap();
        assert!(ctx_eval(&unknown, &[]).unwrap().is_empty());

        let param = detect("SELECT to_regtype($1)").unwrap();
        assert_eq!(param.param_count, 1);
        assert_eq!(
            ctx_eval(&param, &[PgValue::Text("numeric".into())]).unwrap(),
            vec![vec![PgValue::RegType(1700)]]
        );
    }

    #[test]
    fn session_functions() {
        let query = detect("SELECT current_database(), current_user, pg_catalog.version() AS v, 1").unwrap();
        let rows = ctx_eval(&query, &[]).unwrap();
        assert_eq!(rows[0][0], PgValue::Text("app".into()));
        assert_eq!(rows[0][1], PgValue::Text("alice".into()));
        assert_eq!(query.columns[2].name, "v");
        assert_eq!(rows[0][3], PgValue::Int4(1));
        assert_eq!(query.columns[3].expr.column_type().base, PgType::Int4);
    }

    #[test]
    fn current_setting_errors_on_unknown() {
        let query = detect("SELECT current_setting('search_path')").unwrap();
        assert_eq!(ctx_eval(&query, &[]).unwrap()[0][0], PgValue::Text("public".into()));
        let query = detect("SELECT current_setting('nope')").unwrap();
        assert!(ctx_eval(&query, &[]).is_err());
    }

    #[test]
    fn ordinary_selects_are_not_system_queries() {
        assert!(detect("SELECT 1").is_none());
        assert!(detect("SELECT version() FROM t").is_none());
        assert!(detect("SELECT lower('A')").is_none());
    }

    #[test]
    fn relations_map_to_views() {
        let name = ObjectName(vec![Ident::new("information_schema"), Ident::new("columns")]);
        assert_eq!(sqlite_relation(&name).to_string(), VIEW_INFORMATION_SCHEMA_COLUMNS);
        let name = ObjectName(vec![Ident::new("public"), Ident::new("users")]);
        assert_eq!(sqlite_relation(&name).to_string(), "users");
    }
}
