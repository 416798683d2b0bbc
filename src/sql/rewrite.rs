//! Expression and relation rewrites from PostgreSQL's dialect to SQLite's.
//!
//! Rewrites run on the parsed AST. Expressions are visited bottom-up, so
//! when a node is rewritten its children are already in SQLite form; a
//! replacement that is easier to express as text is rendered and parsed back
//! with the SQLite dialect.

use std::ops::ControlFlow;

use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;
use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, visit_relations_mut, BinaryOperator, Expr, Function,
    Ident, ObjectName, Statement, Value,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use super::system::{self, function_name, unnamed_args};
use crate::error::{sqlstate, PgError, PgResult};
use crate::types::{decode_text, ColumnType, PgArray, PgType, PgValue};

/// Session values that may be folded into a translation.
#[derive(Clone, Copy, Debug)]
pub struct TranslateContext<'a> {
    pub user: &'a str,
    pub database: &'a str,
}

/// Applies every relation and expression rewrite to `statement` in place.
pub fn rewrite_statement(statement: &mut Statement, ctx: &TranslateContext<'_>) -> PgResult<()> {
    let _ = visit_relations_mut(statement, |name| {
        *name = system::sqlite_relation(name);
        ControlFlow::<()>::Continue(())
    });

    let flow = visit_expressions_mut(statement, |expr| match rewrite_expr(expr, ctx) {
        Ok(()) => ControlFlow::Continue(()),
        Err(e) => ControlFlow::Break(e),
    });
    if let ControlFlow::Break(e) = flow {
        return Err(e);
    }

    if let Statement::Query(query) = statement {
        query.locks.clear();
    }
    Ok(())
}

/// Highest `$n` placeholder in the statement.
pub fn max_placeholder(statement: &Statement) -> usize {
    let mut max = 0;
    let _ = visit_expressions(statement, |expr| {
        if let Expr::Value(Value::Placeholder(p)) = expr {
            if let Some(n) = placeholder_index(p) {
                max = max.max(n);
            }
        }
        ControlFlow::<()>::Continue(())
    });
    max
}

/// One-based index of a `$n` placeholder.
pub fn placeholder_index(placeholder: &str) -> Option<usize> {
    placeholder
        .strip_prefix('$')?
        .parse()
        .ok()
        .filter(|n| *n > 0)
}

/// Resolves a cast target, rejecting types the bridge does not know.
pub fn cast_type(type_name: &str) -> PgResult<ColumnType> {
    ColumnType::parse(type_name).ok_or_else(|| {
        PgError::new(
            sqlstate::FEATURE_NOT_SUPPORTED,
            format!("type \"{}\" is not supported", type_name.to_ascii_lowercase()),
        )
    })
}

pub fn parse_fragment(text: &str) -> PgResult<Expr> {
    Parser::new(&SQLiteDialect {})
        .try_with_sql(text)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| PgError::internal(format!("rewritten expression \"{text}\" did not parse: {e}")))
}

fn string_literal(text: impl Into<String>) -> Expr {
    Expr::Value(Value::SingleQuotedString(text.into()))
}

fn rewrite_expr(expr: &mut Expr, ctx: &TranslateContext<'_>) -> PgResult<()> {
    let replacement = match expr {
        Expr::Value(value) => {
            rewrite_value(value);
            None
        }
        Expr::Cast { expr: inner, data_type, .. } => Some(rewrite_cast(inner, &data_type.to_string())?),
        Expr::TypedString { data_type, value } => Some(fold_literal(value, &data_type.to_string())?),
        Expr::ILike {
            negated,
            expr: inner,
            pattern,
            escape_char,
        } => Some(Expr::Like {
            negated: *negated,
            expr: inner.clone(),
            pattern: pattern.clone(),
            escape_char: escape_char.clone(),
        }),
        Expr::AnyOp {
            left,
            compare_op,
            right,
        } => {
            if *compare_op != BinaryOperator::Eq {
                return Err(PgError::unsupported(format!("operator {compare_op} ANY is not supported")));
            }
            Some(membership(left, right, false)?)
        }
        Expr::AllOp {
            left,
            compare_op,
            right,
        } => {
            if *compare_op != BinaryOperator::NotEq {
                return Err(PgError::unsupported(format!("operator {compare_op} ALL is not supported")));
            }
            Some(membership(left, right, true)?)
        }
        Expr::Array(array) => Some(parse_fragment(&format!("json_array({})", join(&array.elem)))?),
        Expr::Function(func) => rewrite_function(func, ctx)?,
        Expr::Identifier(ident) if ident.quote_style.is_none() => {
            match system::keyword_function(&ident.value.to_ascii_lowercase()) {
                Some(_) if ident.value.eq_ignore_ascii_case("user") => None,
                Some(system::SystemExpr::CurrentUser | system::SystemExpr::SessionUser) => {
                    Some(string_literal(ctx.user))
                }
                Some(system::SystemExpr::CurrentDatabase) => Some(string_literal(ctx.database)),
                Some(system::SystemExpr::CurrentSchema) => Some(string_literal("public")),
                _ => None,
            }
        }
        _ => None,
    };
    if let Some(replacement) = replacement {
        *expr = replacement;
    }
    Ok(())
}

fn rewrite_value(value: &mut Value) {
    let replacement = match value {
        Value::Placeholder(p) => placeholder_index(p).map(|n| Value::Placeholder(format!("?{n}"))),
        Value::EscapedStringLiteral(s) => Some(Value::SingleQuotedString(s.clone())),
        Value::DollarQuotedString(dq) => Some(Value::SingleQuotedString(dq.value.clone())),
        _ => None,
    };
    if let Some(replacement) = replacement {
        *value = replacement;
    }
}

fn join(exprs: &[Expr]) -> String {
    exprs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::Number(s, _)) => Some(s.clone()),
        Expr::Value(Value::Boolean(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn rewrite_cast(inner: &Expr, type_name: &str) -> PgResult<Expr> {
    if let Some(text) = literal_text(inner) {
        return fold_literal(&text, type_name);
    }
    let ty = cast_type(type_name)?;
    if matches!(inner, Expr::Value(Value::Null)) || ty.array {
        return Ok(inner.clone());
    }
    if ty.base == PgType::RegType {
        return Err(PgError::unsupported("casts of non-literal values to regtype are not supported"));
    }
    let affinity = match ty.base {
        PgType::Bool | PgType::Int2 | PgType::Int4 | PgType::Int8 | PgType::Oid => "INTEGER",
        PgType::Float4 | PgType::Float8 => "REAL",
        PgType::Numeric => "NUMERIC",
        PgType::Text | PgType::Varchar | PgType::Bpchar | PgType::Name => "TEXT",
        PgType::Bytea => "BLOB",
        PgType::Date => return parse_fragment(&format!("date({inner})")),
        _ => return Ok(inner.clone()),
    };
    parse_fragment(&format!("CAST({inner} AS {affinity})"))
}

/// Folds `'literal'::type` into the literal SQLite stores for that value.
fn fold_literal(text: &str, type_name: &str) -> PgResult<Expr> {
    let ty = cast_type(type_name)?;
    let value = decode_text(text, &ty)?;
    literal_expr(&value)
}

pub fn literal_expr(value: &PgValue) -> PgResult<Expr> {
    let value = match value.to_sql()? {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Number(i.to_string(), false),
        SqlValue::Real(f) if f.is_finite() => Value::Number(format!("{f:?}"), false),
        SqlValue::Real(f) => Value::SingleQuotedString(f.to_string()),
        SqlValue::Text(s) => Value::SingleQuotedString(s),
        SqlValue::Blob(bytes) => Value::HexStringLiteral(bytes.iter().map(|b| format!("{b:02X}")).collect()),
    };
    Ok(Expr::Value(value))
}

/// Rewrites `left = ANY(right)` / `left <> ALL(right)` as `IN` / `NOT IN`.
fn membership(left: &Expr, right: &Expr, negated: bool) -> PgResult<Expr> {
    let not = if negated { "NOT " } else { "" };
    let list = match right {
        Expr::Nested(inner) => return membership(left, inner, negated),
        Expr::Subquery(query) => return parse_fragment(&format!("({left}) {not}IN ({query})")),
        Expr::Function(func) if function_name(&func.name) == "json_array" => unnamed_args(&func.args)
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        Expr::Value(Value::SingleQuotedString(s)) => array_literal_items(s)?,
        other => {
            return parse_fragment(&format!("({left}) {not}IN (SELECT value FROM json_each({other}))"));
        }
    };
    parse_fragment(&format!("({left}) {not}IN ({})", list.join(", ")))
}

/// Elements of a `'{...}'` or JSON array literal, rendered as SQLite literals.
fn array_literal_items(text: &str) -> PgResult<Vec<String>> {
    if text.trim_start().starts_with('[') {
        let items: Vec<JsonValue> =
            serde_json::from_str(text).map_err(|_| PgError::invalid_text("json", text))?;
        return Ok(items
            .iter()
            .map(|item| match item {
                JsonValue::Null => "NULL".to_string(),
                JsonValue::Bool(b) => i32::from(*b).to_string(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::String(s) => string_literal(s.as_str()).to_string(),
                other => string_literal(other.to_string()).to_string(),
            })
            .collect());
    }
    let array = PgArray::parse_text(text, PgType::Text)?;
    array
        .values
        .iter()
        .map(|value| literal_expr(value).map(|expr| expr.to_string()))
        .collect()
}

fn rewrite_function(func: &mut Function, ctx: &TranslateContext<'_>) -> PgResult<Option<Expr>> {
    let name = function_name(&func.name);
    let args = unnamed_args(&func.args);
    let regtype_arg = match (name.as_str(), args.as_slice()) {
        ("to_regtype", [arg]) => Some(literal_text(arg)),
        _ => None,
    };
    let arity = args.len();

    let renamed = |name: &str| ObjectName(vec![Ident::new(name)]);
    let replacement = match (name.as_str(), arity) {
        ("version", 0) => Some(string_literal(system::version_string())),
        ("current_database" | "current_catalog", 0) => Some(string_literal(ctx.database)),
        ("current_schema", 0) => Some(string_literal("public")),
        ("current_user" | "session_user" | "current_role", 0) => Some(string_literal(ctx.user)),
        ("to_regtype", 1) => match regtype_arg.flatten() {
            Some(type_name) => Some(match ColumnType::parse(&type_name) {
                Some(ty) => string_literal(ty.to_string()),
                None => Expr::Value(Value::Null),
            }),
            None => return Err(PgError::unsupported("to_regtype() needs a literal argument here")),
        },
        ("now" | "current_timestamp" | "transaction_timestamp" | "statement_timestamp" | "localtimestamp", 0) => {
            Some(parse_fragment("now()")?)
        }
        ("char_length" | "character_length", 1) => {
            func.name = renamed("length");
            None
        }
        ("string_agg", 2) => {
            func.name = renamed("group_concat");
            None
        }
        ("array_agg", 1) => {
            func.name = renamed("json_group_array");
            None
        }
        ("strpos", 2) => {
            func.name = renamed("instr");
            None
        }
        _ => {
            if func.name.0.len() == 2 && func.name.0[0].value.eq_ignore_ascii_case("pg_catalog") {
                func.name = renamed(&name);
            }
            None
        }
    };
    Ok(replacement)
}
