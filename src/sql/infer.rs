//! Static type inference over the PostgreSQL AST.
//!
//! Result columns are typed from (in order) explicit casts, the shadow
//! schema for column references, declared parameter types and the return
//! type rules of operators and functions. Whatever stays unknown is filled
//! in later from the SQLite probe.
//!
//! Parameters are typed from the context they appear in: the target column
//! of an `INSERT` or `SET`, the other side of a comparison, a cast, a
//! `LIMIT`.

use std::slice;

use sqlparser::ast::{
    BinaryOperator, Expr, Function, JoinConstraint, JoinOperator, ObjectName, Query, Select,
    SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins, UnaryOperator, Value,
};

use super::ddl::folded;
use super::rewrite::placeholder_index;
use super::system::{self, function_name, unnamed_args};
use crate::engine::SchemaSnapshot;
use crate::error::{PgError, PgResult};
use crate::types::{numeric, ColumnType, PgType, TypeModifier};

/// The table column a result column reads from directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnOrigin {
    pub table_oid: u32,
    /// 1-based position in the table.
    pub attnum: i16,
}

/// A result column as far as static inference can tell.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    pub ty: Option<ColumnType>,
    pub origin: Option<ColumnOrigin>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Inference {
    /// One entry per parameter, `None` where nothing constrains it.
    pub params: Vec<Option<ColumnType>>,
    /// Result columns, or `None` for statements that return no rows.
    pub columns: Option<Vec<OutputColumn>>,
}

#[derive(Clone, Debug)]
struct ScopeColumn {
    name: String,
    ty: Result<Option<ColumnType>, PgError>,
    origin: Option<ColumnOrigin>,
}

/// A named row source visible to column references.
#[derive(Clone, Debug)]
struct Relation {
    qualifier: String,
    columns: Vec<ScopeColumn>,
}

impl Relation {
    fn derived(qualifier: String, columns: Vec<OutputColumn>) -> Self {
        Relation {
            qualifier,
            columns: columns
                .into_iter()
                .map(|col| ScopeColumn {
                    name: col.name,
                    ty: Ok(col.ty),
                    origin: col.origin,
                })
                .collect(),
        }
    }

    fn aliased(mut self, alias: Option<&TableAlias>) -> Self {
        if let Some(alias) = alias {
            self.qualifier = folded(&alias.name);
            for (column, name) in self.columns.iter_mut().zip(&alias.columns) {
                column.name = folded(name);
            }
        }
        self
    }
}

fn lookup<'s>(scope: &'s [Relation], qualifier: Option<&str>, name: &str) -> Option<&'s ScopeColumn> {
    scope
        .iter()
        .filter(|relation| qualifier.map_or(true, |q| relation.qualifier.eq_ignore_ascii_case(q)))
        .find_map(|relation| relation.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
}

fn resolve(scope: &[Relation], qualifier: Option<&str>, name: &str) -> PgResult<Option<ColumnType>> {
    match lookup(scope, qualifier, name) {
        Some(column) => column.ty.clone(),
        None => Ok(None),
    }
}

/// Origin of a bare column reference; anything computed has none.
fn origin(expr: &Expr, scope: &[Relation]) -> Option<ColumnOrigin> {
    match expr {
        Expr::Identifier(ident) => lookup(scope, None, &ident.value)?.origin,
        Expr::CompoundIdentifier(parts) => match parts.as_slice() {
            [.., qualifier, column] => lookup(scope, Some(&qualifier.value), &column.value)?.origin,
            _ => None,
        },
        Expr::Nested(inner) => origin(inner, scope),
        _ => None,
    }
}

/// Literals written into a NUMERIC column must fit SQLite's storage classes
/// exactly, or the write is refused.
fn check_numeric_literal(expr: &Expr, ty: &ColumnType) -> PgResult<()> {
    if ty.base != PgType::Numeric || ty.array {
        return Ok(());
    }
    let text = match strip_nested(expr) {
        Expr::Value(Value::Number(text, _) | Value::SingleQuotedString(text)) => text,
        Expr::UnaryOp {
            op: UnaryOperator::Minus | UnaryOperator::Plus,
            expr,
        } => match strip_nested(expr) {
            Expr::Value(Value::Number(text, _)) => text,
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };
    let value = numeric::parse(text)?;
    let value = match ty.numeric_scale() {
        Some(scale) => numeric::rescale(value, scale),
        None => value,
    };
    numeric::check_storable(&value)
}

fn scalar(ty: PgType) -> Option<ColumnType> {
    Some(ColumnType::scalar(ty))
}

fn unmodified(ty: ColumnType) -> ColumnType {
    ty.with_modifier(TypeModifier::None)
}

fn strip_nested(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => strip_nested(inner),
        other => other,
    }
}

/// Name PostgreSQL gives an unaliased result column.
pub fn column_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => folded(ident),
        Expr::CompoundIdentifier(parts) => parts.last().map(folded).unwrap_or_default(),
        Expr::Function(func) => match function_name(&func.name).rsplit('.').next() {
            Some(name) => name.to_string(),
            None => "?column?".to_string(),
        },
        Expr::Cast { expr, data_type, .. } => match column_name(expr).as_str() {
            "?column?" => ColumnType::parse(&data_type.to_string())
                .map(|ty| ty.base.typname().to_string())
                .unwrap_or_else(|| "?column?".to_string()),
            name => name.to_string(),
        },
        Expr::TypedString { data_type, .. } => ColumnType::parse(&data_type.to_string())
            .map(|ty| ty.base.typname().to_string())
            .unwrap_or_else(|| "?column?".to_string()),
        Expr::Nested(inner) => column_name(inner),
        Expr::Case { .. } => "case".to_string(),
        Expr::Exists { .. } => "exists".to_string(),
        Expr::Array(_) => "array".to_string(),
        Expr::Extract { .. } => "extract".to_string(),
        Expr::Substring { .. } => "substring".to_string(),
        Expr::Position { .. } => "position".to_string(),
        _ => "?column?".to_string(),
    }
}

fn literal_type(value: &Value, params: &[Option<ColumnType>]) -> Option<ColumnType> {
    match value {
        Value::Number(n, _) => {
            if n.parse::<i32>().is_ok() {
                scalar(PgType::Int4)
            } else if n.parse::<i64>().is_ok() {
                scalar(PgType::Int8)
            } else {
                scalar(PgType::Numeric)
            }
        }
        Value::SingleQuotedString(_) | Value::EscapedStringLiteral(_) | Value::DollarQuotedString(_) => {
            scalar(PgType::Text)
        }
        Value::Boolean(_) => scalar(PgType::Bool),
        Value::Placeholder(p) => placeholder_index(p).and_then(|n| params.get(n - 1).copied().flatten()),
        _ => None,
    }
}

fn numeric_rank(ty: PgType) -> Option<u8> {
    match ty {
        PgType::Int2 => Some(1),
        PgType::Int4 => Some(2),
        PgType::Int8 => Some(3),
        PgType::Numeric => Some(4),
        PgType::Float4 => Some(5),
        PgType::Float8 => Some(6),
        _ => None,
    }
}

/// Result type of `left op right` for the arithmetic operators.
fn arithmetic(left: ColumnType, op: &BinaryOperator, right: ColumnType) -> ColumnType {
    use PgType::*;
    let base = match (left.base, op, right.base) {
        (Date, BinaryOperator::Minus, Date) => Int4,
        (Date, BinaryOperator::Plus | BinaryOperator::Minus, Int2 | Int4 | Int8) => Date,
        (Date, BinaryOperator::Plus | BinaryOperator::Minus, Interval) => Timestamp,
        (Timestamp, BinaryOperator::Minus, Timestamp) | (TimestampTz, BinaryOperator::Minus, TimestampTz) => {
            Interval
        }
        (l @ (Timestamp | TimestampTz | Time), _, Interval) => l,
        (l, _, r) => match (numeric_rank(l), numeric_rank(r)) {
            (Some(a), Some(b)) if b > a => r,
            (Some(_), Some(_)) => l,
            _ => l,
        },
    };
    let base = if base == Int2 { Int4 } else { base };
    ColumnType::scalar(base)
}

struct Inferer<'a> {
    snapshot: &'a SchemaSnapshot,
    params: Vec<Option<ColumnType>>,
    ctes: Vec<Relation>,
}

impl<'a> Inferer<'a> {
    /// Records a type for `expr` if it is a still-untyped parameter.
    fn hint(&mut self, expr: &Expr, ty: ColumnType) {
        if let Expr::Value(Value::Placeholder(p)) = strip_nested(expr) {
            if let Some(n) = placeholder_index(p) {
                if self.params.len() < n {
                    self.params.resize(n, None);
                }
                if self.params[n - 1].is_none() {
                    self.params[n - 1] = Some(ty);
                }
            }
        }
    }

    fn table_relation(&self, name: &ObjectName, alias: Option<&TableAlias>) -> Option<Relation> {
        let last = name.0.last()?;
        if name.0.len() == 1 {
            if let Some(cte) = self
                .ctes
                .iter()
                .rev()
                .find(|cte| cte.qualifier.eq_ignore_ascii_case(&last.value))
            {
                return Some(cte.clone().aliased(alias));
            }
        }
        let sqlite_name = system::sqlite_relation(name);
        let table = self.snapshot.table(&sqlite_name.0.last()?.value)?;
        let columns = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| ScopeColumn {
                name: col.name.clone(),
                ty: table.column_type(col).map(Some),
                origin: match (table.oid, i16::try_from(i + 1)) {
                    (0, _) | (_, Err(_)) => None,
                    (table_oid, Ok(attnum)) => Some(ColumnOrigin { table_oid, attnum }),
                },
            })
            .collect();
        Some(
            Relation {
                qualifier: folded(last),
                columns,
            }
            .aliased(alias),
        )
    }

    fn factor(&mut self, factor: &TableFactor, outer: &[Relation], scope: &mut Vec<Relation>) -> PgResult<()> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                if let Some(relation) = self.table_relation(name, alias.as_ref()) {
                    scope.push(relation);
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                let columns = self.query(subquery, outer)?;
                scope.push(Relation::derived(String::new(), columns).aliased(alias.as_ref()));
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.factor(&table_with_joins.relation, outer, scope)?;
                for join in &table_with_joins.joins {
                    self.factor(&join.relation, outer, scope)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Builds the relations a `FROM` list brings into scope and walks its
    /// join conditions.
    fn from_scope(&mut self, from: &[TableWithJoins], outer: &[Relation]) -> PgResult<Vec<Relation>> {
        let mut local = Vec::new();
        for item in from {
            self.factor(&item.relation, outer, &mut local)?;
            for join in &item.joins {
                self.factor(&join.relation, outer, &mut local)?;
            }
        }
        let mut visible = local.clone();
        visible.extend_from_slice(outer);
        for item in from {
            for join in &item.joins {
                let constraint = match &join.join_operator {
                    JoinOperator::Inner(c)
                    | JoinOperator::LeftOuter(c)
                    | JoinOperator::RightOuter(c)
                    | JoinOperator::FullOuter(c) => c,
                    _ => continue,
                };
                if let JoinConstraint::On(expr) = constraint {
                    self.walk(expr, &visible)?;
                }
            }
        }
        Ok(local)
    }

    fn query(&mut self, query: &Query, outer: &[Relation]) -> PgResult<Vec<OutputColumn>> {
        let saved = self.ctes.len();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let columns = self.query(&cte.query, outer)?;
                let relation = Relation::derived(folded(&cte.alias.name), columns).aliased(Some(&cte.alias));
                self.ctes.push(relation);
            }
        }
        let (columns, scope) = self.set_expr(&query.body, outer)?;
        for order in &query.order_by {
            self.walk(&order.expr, &scope)?;
        }
        if let Some(limit) = &query.limit {
            self.hint(limit, ColumnType::scalar(PgType::Int8));
        }
        if let Some(offset) = &query.offset {
            self.hint(&offset.value, ColumnType::scalar(PgType::Int8));
        }
        self.ctes.truncate(saved);
        Ok(columns)
    }

    fn set_expr(&mut self, body: &SetExpr, outer: &[Relation]) -> PgResult<(Vec<OutputColumn>, Vec<Relation>)> {
        match body {
            SetExpr::Select(select) => self.select(select, outer),
            SetExpr::Query(query) => Ok((self.query(query, outer)?, Vec::new())),
            SetExpr::SetOperation { left, right, .. } => {
                let (mut columns, scope) = self.set_expr(left, outer)?;
                let (others, _) = self.set_expr(right, outer)?;
                for (column, other) in columns.iter_mut().zip(others) {
                    if column.ty.is_none() {
                        column.ty = other.ty;
                    }
                    column.origin = None;
                }
                Ok((columns, scope))
            }
            SetExpr::Values(values) => {
                let mut columns: Vec<OutputColumn> = Vec::new();
                for row in &values.rows {
                    for (i, expr) in row.iter().enumerate() {
                        self.walk(expr, outer)?;
                        let ty = self.expr_type(expr, outer)?;
                        match columns.get_mut(i) {
                            Some(column) if column.ty.is_none() => column.ty = ty,
                            Some(_) => {}
                            None => columns.push(OutputColumn {
                                name: format!("column{}", i + 1),
                                ty,
                                origin: None,
                            }),
                        }
                    }
                }
                Ok((columns, Vec::new()))
            }
            _ => Ok((Vec::new(), Vec::new())),
        }
    }

    fn select(&mut self, select: &Select, outer: &[Relation]) -> PgResult<(Vec<OutputColumn>, Vec<Relation>)> {
        let local = self.from_scope(&select.from, outer)?;
        let mut scope = local.clone();
        scope.extend_from_slice(outer);
        if let Some(selection) = &select.selection {
            self.walk(selection, &scope)?;
        }
        if let Some(having) = &select.having {
            self.walk(having, &scope)?;
        }
        let columns = self.projection(&select.projection, &local, &scope)?;
        Ok((columns, scope))
    }

    fn projection(
        &mut self,
        items: &[SelectItem],
        local: &[Relation],
        scope: &[Relation],
    ) -> PgResult<Vec<OutputColumn>> {
        let mut columns = Vec::with_capacity(items.len());
        for item in items {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.walk(expr, scope)?;
                    columns.push(OutputColumn {
                        name: column_name(expr),
                        ty: self.expr_type(expr, scope)?,
                        origin: origin(expr, scope),
                    });
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.walk(expr, scope)?;
                    columns.push(OutputColumn {
                        name: folded(alias),
                        ty: self.expr_type(expr, scope)?,
                        origin: origin(expr, scope),
                    });
                }
                SelectItem::Wildcard(_) => {
                    for relation in local {
                        expand(relation, &mut columns)?;
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name.0.last().map(folded).unwrap_or_default();
                    if let Some(relation) = local
                        .iter()
                        .find(|r| r.qualifier.eq_ignore_ascii_case(&qualifier))
                    {
                        expand(relation, &mut columns)?;
                    }
                }
            }
        }
        Ok(columns)
    }

    /// Collects parameter types from `expr` and descends into subqueries.
    fn walk(&mut self, expr: &Expr, scope: &[Relation]) -> PgResult<()> {
        match expr {
            Expr::BinaryOp { left, op, right } => {
                match op {
                    BinaryOperator::StringConcat => {
                        self.hint(left, ColumnType::scalar(PgType::Text));
                        self.hint(right, ColumnType::scalar(PgType::Text));
                    }
                    BinaryOperator::And | BinaryOperator::Or => {
                        self.hint(left, ColumnType::scalar(PgType::Bool));
                        self.hint(right, ColumnType::scalar(PgType::Bool));
                    }
                    _ => self.unify(left, right, scope)?,
                }
                self.walk(left, scope)?;
                self.walk(right, scope)?;
            }
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.unify(left, right, scope)?;
                self.walk(left, scope)?;
                self.walk(right, scope)?;
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                self.hint(expr, ColumnType::scalar(PgType::Text));
                self.hint(pattern, ColumnType::scalar(PgType::Text));
                self.walk(expr, scope)?;
                self.walk(pattern, scope)?;
            }
            Expr::InList { expr, list, .. } => {
                let mut ty = self.expr_type(expr, scope)?;
                for item in list {
                    match ty {
                        Some(ty) => self.hint(item, unmodified(ty)),
                        None => ty = self.expr_type(item, scope)?,
                    }
                    self.walk(item, scope)?;
                }
                if let Some(ty) = ty {
                    self.hint(expr, unmodified(ty));
                }
                self.walk(expr, scope)?;
            }
            Expr::InSubquery { expr, subquery, .. } => {
                let columns = self.query(subquery, scope)?;
                if let Some(ty) = columns.first().and_then(|c| c.ty) {
                    self.hint(expr, unmodified(ty));
                }
                self.walk(expr, scope)?;
            }
            Expr::Between { expr, low, high, .. } => {
                if let Some(ty) = self.expr_type(expr, scope)? {
                    self.hint(low, unmodified(ty));
                    self.hint(high, unmodified(ty));
                }
                self.walk(expr, scope)?;
                self.walk(low, scope)?;
                self.walk(high, scope)?;
            }
            Expr::AnyOp { left, right, .. } | Expr::AllOp { left, right, .. } => {
                if let Some(ty) = self.expr_type(left, scope)? {
                    self.hint(right, ColumnType::array_of(ty.base));
                }
                self.walk(left, scope)?;
                self.walk(right, scope)?;
            }
            Expr::Cast { expr, data_type, .. } => {
                if let Some(ty) = ColumnType::parse(&data_type.to_string()) {
                    self.hint(expr, ty);
                }
                self.walk(expr, scope)?;
            }
            Expr::Nested(inner)
            | Expr::UnaryOp { expr: inner, .. }
            | Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::Collate { expr: inner, .. } => self.walk(inner, scope)?,
            Expr::Function(func) => {
                for arg in unnamed_args(&func.args) {
                    self.walk(arg, scope)?;
                }
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    if let Some(ty) = self.expr_type(operand, scope)? {
                        for condition in conditions {
                            self.hint(condition, unmodified(ty));
                        }
                    }
                    self.walk(operand, scope)?;
                }
                for expr in conditions.iter().chain(results).chain(else_result.as_deref()) {
                    self.walk(expr, scope)?;
                }
            }
            Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => {
                self.query(query, scope)?;
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.walk(item, scope)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Types a parameter on one side of a comparison or arithmetic operator
    /// from the other side.
    fn unify(&mut self, left: &Expr, right: &Expr, scope: &[Relation]) -> PgResult<()> {
        if let Some(ty) = self.expr_type(right, scope)? {
            self.hint(left, unmodified(ty));
        }
        if let Some(ty) = self.expr_type(left, scope)? {
            self.hint(right, unmodified(ty));
        }
        Ok(())
    }

    fn expr_type(&mut self, expr: &Expr, scope: &[Relation]) -> PgResult<Option<ColumnType>> {
        let ty = match expr {
            Expr::Identifier(ident) => match resolve(scope, None, &ident.value)? {
                Some(ty) => Some(ty),
                None if ident.quote_style.is_none() => system::keyword_function(&ident.value.to_ascii_lowercase())
                    .filter(|_| !ident.value.eq_ignore_ascii_case("user"))
                    .map(|f| f.column_type()),
                None => None,
            },
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [.., qualifier, column] => resolve(scope, Some(&qualifier.value), &column.value)?,
                _ => None,
            },
            Expr::Value(value) => literal_type(value, &self.params),
            Expr::Cast { data_type, .. } | Expr::TypedString { data_type, .. } => {
                ColumnType::parse(&data_type.to_string())
            }
            Expr::Nested(inner) | Expr::Collate { expr: inner, .. } => self.expr_type(inner, scope)?,
            Expr::UnaryOp { op: UnaryOperator::Not, .. } => scalar(PgType::Bool),
            Expr::UnaryOp { expr, .. } => self.expr_type(expr, scope)?.map(unmodified),
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
                | BinaryOperator::And
                | BinaryOperator::Or => scalar(PgType::Bool),
                BinaryOperator::StringConcat => scalar(PgType::Text),
                BinaryOperator::Plus
                | BinaryOperator::Minus
                | BinaryOperator::Multiply
                | BinaryOperator::Divide
                | BinaryOperator::Modulo => {
                    let l = self.expr_type(left, scope)?;
                    let r = self.expr_type(right, scope)?;
                    match (l, r) {
                        (Some(l), Some(r)) => Some(arithmetic(l, op, r)),
                        (Some(t), None) | (None, Some(t)) => Some(unmodified(t)),
                        (None, None) => None,
                    }
                }
                _ => None,
            },
            Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::IsTrue(_)
            | Expr::IsFalse(_)
            | Expr::IsDistinctFrom(..)
            | Expr::IsNotDistinctFrom(..)
            | Expr::InList { .. }
            | Expr::InSubquery { .. }
            | Expr::Between { .. }
            | Expr::Like { .. }
            | Expr::ILike { .. }
            | Expr::Exists { .. }
            | Expr::AnyOp { .. }
            | Expr::AllOp { .. } => scalar(PgType::Bool),
            Expr::Function(func) => self.function_type(func, scope)?,
            Expr::Case {
                results, else_result, ..
            } => {
                let mut found = None;
                for result in results.iter().chain(else_result.as_deref()) {
                    if let Some(ty) = self.expr_type(result, scope)? {
                        found = Some(ty);
                        break;
                    }
                }
                found
            }
            Expr::Subquery(query) => self.query(query, scope)?.into_iter().next().and_then(|c| c.ty),
            Expr::Extract { .. } => scalar(PgType::Numeric),
            Expr::Substring { .. } | Expr::Trim { .. } => scalar(PgType::Text),
            Expr::Position { .. } => scalar(PgType::Int4),
            Expr::Array(array) => {
                let element = match array.elem.first() {
                    Some(first) => self.expr_type(first, scope)?,
                    None => None,
                };
                Some(ColumnType::array_of(element.map(|t| t.base).unwrap_or(PgType::Text)))
            }
            Expr::Interval(_) => scalar(PgType::Interval),
            _ => None,
        };
        Ok(ty)
    }

    fn first_typed(&mut self, args: &[&Expr], scope: &[Relation]) -> PgResult<Option<ColumnType>> {
        for arg in args {
            if let Some(ty) = self.expr_type(arg, scope)? {
                return Ok(Some(ty));
            }
        }
        Ok(None)
    }

    /// Return type of a function call.
    fn function_type(&mut self, func: &Function, scope: &[Relation]) -> PgResult<Option<ColumnType>> {
        use PgType::*;
        let name = function_name(&func.name);
        let args = unnamed_args(&func.args);
        let first = match args.first() {
            Some(arg) => self.expr_type(arg, scope)?,
            None => None,
        };
        let ty = match name.as_str() {
            "count" => scalar(Int8),
            "sum" => first.map(|t| {
                ColumnType::scalar(match t.base {
                    Int2 | Int4 => Int8,
                    Float4 => Float4,
                    Float8 => Float8,
                    Interval => Interval,
                    _ => Numeric,
                })
            }),
            "avg" => first.map(|t| {
                ColumnType::scalar(if matches!(t.base, Float4 | Float8) {
                    Float8
                } else {
                    Numeric
                })
            }),
            "min" | "max" | "abs" | "ceil" | "ceiling" | "floor" | "sign" | "mod" => first.map(unmodified),
            "coalesce" | "nullif" | "greatest" | "least" => self.first_typed(&args, scope)?,
            "round" | "trunc" => match args.len() {
                2 => scalar(Numeric),
                _ => first.map(unmodified),
            },
            "now" | "current_timestamp" | "transaction_timestamp" | "statement_timestamp" | "clock_timestamp"
            | "to_timestamp" => scalar(TimestampTz),
            "localtimestamp" => scalar(Timestamp),
            "current_date" | "to_date" | "make_date" => scalar(Date),
            "current_time" | "localtime" => scalar(Time),
            "date_trunc" => match args.get(1) {
                Some(arg) => self.expr_type(arg, scope)?.map(unmodified),
                None => None,
            },
            "age" => scalar(Interval),
            "gen_random_uuid" | "uuid_generate_v4" => scalar(Uuid),
            "length" | "char_length" | "character_length" | "octet_length" | "bit_length" | "strpos"
            | "array_length" | "cardinality" | "array_upper" | "array_lower" | "pg_backend_pid" => scalar(Int4),
            "lower" | "upper" | "btrim" | "ltrim" | "rtrim" | "substr" | "replace" | "concat" | "concat_ws"
            | "left" | "right" | "lpad" | "rpad" | "repeat" | "md5" | "string_agg" | "to_char" | "initcap"
            | "reverse" | "format" | "version" | "current_setting" | "quote_ident" | "quote_literal"
            | "split_part" | "translate" | "chr" => scalar(Text),
            "current_database" | "current_schema" | "current_user" | "session_user" | "current_role"
            | "current_catalog" => scalar(Name),
            "to_regtype" => scalar(RegType),
            "array_agg" => first.map(|t| ColumnType::array_of(t.base)),
            "json_agg" | "json_build_object" | "json_build_array" | "to_json" | "row_to_json" | "json_object_agg" => {
                scalar(Json)
            }
            "jsonb_agg" | "jsonb_build_object" | "jsonb_build_array" | "to_jsonb" | "jsonb_object_agg" => {
                scalar(Jsonb)
            }
            "bool_and" | "bool_or" | "every" => scalar(Bool),
            "random" | "sqrt" | "cbrt" | "power" | "pow" | "exp" | "ln" | "log" | "pi" | "degrees" | "radians"
            | "sin" | "cos" | "tan" | "date_part" => scalar(Float8),
            "extract" => scalar(Numeric),
            _ => None,
        };
        Ok(ty)
    }

    fn insert_source(&mut self, source: &Query, targets: &[Option<ColumnType>]) -> PgResult<()> {
        match source.body.as_ref() {
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for (i, expr) in row.iter().enumerate() {
                        if let Some(Some(ty)) = targets.get(i) {
                            check_numeric_literal(expr, ty)?;
                            self.hint(expr, *ty);
                        }
                        self.walk(expr, &[])?;
                    }
                }
            }
            SetExpr::Select(select) => {
                for (i, item) in select.projection.iter().enumerate() {
                    if let (SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. }, Some(Some(ty))) =
                        (item, targets.get(i))
                    {
                        self.hint(expr, *ty);
                    }
                }
                self.query(source, &[])?;
            }
            _ => {
                self.query(source, &[])?;
            }
        }
        Ok(())
    }
}

fn expand(relation: &Relation, columns: &mut Vec<OutputColumn>) -> PgResult<()> {
    for column in &relation.columns {
        columns.push(OutputColumn {
            name: column.name.clone(),
            ty: column.ty.clone()?,
            origin: column.origin,
        });
    }
    Ok(())
}

/// Infers parameter and result column types for a parsed statement.
///
/// ## Arguments
/// * `statement` - the statement as the client wrote it
/// * `snapshot` - current tables, columns and type mappings
/// * `declared` - parameter types the client declared in Parse; `None`
///   entries (OID 0) are open to inference
///
/// ## Errors
/// Fails with `XX000` when a referenced table is only partially mapped.
pub fn infer(statement: &Statement, snapshot: &SchemaSnapshot, declared: Vec<Option<ColumnType>>) -> PgResult<Inference> {
    let mut inferer = Inferer {
        snapshot,
        params: declared,
        ctes: Vec::new(),
    };
    let columns = match statement {
        Statement::Query(query) => Some(inferer.query(query, &[])?),
        Statement::Insert {
            table_name,
            table_alias,
            columns,
            source,
            returning,
            ..
        } => {
            let alias = table_alias.as_ref().map(|name| TableAlias {
                name: name.clone(),
                columns: Vec::new(),
            });
            let target: Vec<Relation> = inferer
                .table_relation(table_name, alias.as_ref())
                .into_iter()
                .collect();
            let targets: Vec<Option<ColumnType>> = match target.first() {
                Some(relation) if columns.is_empty() => relation
                    .columns
                    .iter()
                    .map(|c| c.ty.clone())
                    .collect::<PgResult<_>>()?,
                Some(_) => columns
                    .iter()
                    .map(|c| resolve(&target, None, &c.value))
                    .collect::<PgResult<_>>()?,
                None => Vec::new(),
            };
            if let Some(source) = source {
                inferer.insert_source(source, &targets)?;
            }
            match returning {
                Some(items) => Some(inferer.projection(items, &target, &target)?),
                None => None,
            }
        }
        Statement::Update {
            table,
            assignments,
            from,
            selection,
            returning,
            ..
        } => {
            let mut scope = inferer.from_scope(slice::from_ref(table), &[])?;
            if let Some(from) = from {
                scope.extend(inferer.from_scope(slice::from_ref(from), &[])?);
            }
            for assignment in assignments {
                if let Some(column) = assignment.id.last() {
                    if let Some(ty) = resolve(&scope, None, &column.value)? {
                        check_numeric_literal(&assignment.value, &ty)?;
                        inferer.hint(&assignment.value, ty);
                    }
                }
                inferer.walk(&assignment.value, &scope)?;
            }
            if let Some(selection) = selection {
                inferer.walk(selection, &scope)?;
            }
            match returning {
                Some(items) => Some(inferer.projection(items, &scope, &scope)?),
                None => None,
            }
        }
        Statement::Delete {
            from,
            selection,
            returning,
            ..
        } => {
            let scope = inferer.from_scope(from, &[])?;
            if let Some(selection) = selection {
                inferer.walk(selection, &scope)?;
            }
            match returning {
                Some(items) => Some(inferer.projection(items, &scope, &scope)?),
                None => None,
            }
        }
        Statement::CreateTable { query: Some(query), .. } => Some(inferer.query(query, &[])?),
        _ => None,
    };
    Ok(Inference {
        params: inferer.params,
        columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CatalogColumn, CatalogTable};
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn column(name: &str, mapping: Option<&str>) -> CatalogColumn {
        CatalogColumn {
            name: name.into(),
            decltype: "TEXT".into(),
            mapping: mapping.map(str::to_string),
            not_null: false,
            primary_key: false,
        }
    }

    fn snapshot() -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::default();
        snapshot.insert(CatalogTable {
            name: "orders".into(),
            oid: 16385,
            columns: vec![
                column("id", Some("integer")),
                column("amount", Some("numeric(10,2)")),
                column("placed", Some("timestamp with time zone")),
                column("tags", Some("text[]")),
            ],
            is_view: false,
            has_mappings: true,
        });
        snapshot.insert(CatalogTable {
            name: "customers".into(),
            oid: 16386,
            columns: vec![column("id", Some("bigint")), column("name", Some("character varying(40)"))],
            is_view: false,
            has_mappings: true,
        });
        snapshot.insert(CatalogTable {
            name: "broken".into(),
            oid: 16387,
            columns: vec![column("a", Some("integer")), column("b", None)],
            is_view: false,
            has_mappings: true,
        });
        snapshot
    }

    fn run(sql: &str) -> PgResult<Inference> {
        let statement = Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap().remove(0);
        infer(&statement, &snapshot(), Vec::new())
    }

    fn columns(sql: &str) -> Vec<(String, Option<u32>)> {
        run(sql)
            .unwrap()
            .columns
            .unwrap()
            .into_iter()
            .map(|c| (c.name, c.ty.map(|t| t.oid())))
            .collect()
    }

    #[test]
    fn column_references_use_mappings() {
        let inference = run("SELECT o.amount, id FROM orders o").unwrap();
        let cols = inference.columns.unwrap();
        assert_eq!(cols[0].name, "amount");
        assert_eq!(cols[0].ty.unwrap().typmod(), (10 << 16 | 2) + 4);
        assert_eq!(cols[1].ty.unwrap().oid(), 23);
    }

    #[test]
    fn direct_column_references_carry_their_origin() {
        let cols = run(
            "SELECT o.amount, (id), id + 1, x.name FROM orders o \
             JOIN (SELECT name, id AS cid FROM customers) x ON x.cid = o.id",
        )
        .unwrap()
        .columns
        .unwrap();
        let origins: Vec<Option<(u32, i16)>> = cols
            .iter()
            .map(|c| c.origin.map(|o| (o.table_oid, o.attnum)))
            .collect();
        assert_eq!(origins, vec![Some((16385, 2)), Some((16385, 1)), None, Some((16386, 2))]);

        let inference = run("SELECT id FROM orders UNION SELECT id FROM customers").unwrap();
        assert_eq!(inference.columns.unwrap()[0].origin, None);
    }

    #[test]
    fn wildcard_expands_in_declaration_order() {
        let cols = columns("SELECT * FROM orders");
        let names: Vec<&str> = cols.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["id", "amount", "placed", "tags"]);
        assert_eq!(cols[2].1, Some(1184));
        assert_eq!(cols[3].1, Some(1009));
    }

    #[test]
    fn function_and_operator_rules() {
        let cols = columns(
            "SELECT count(*), avg(amount), sum(id), amount > 3, 'a' || 'b', now(), id::text AS t FROM orders",
        );
        assert_eq!(
            cols,
            vec![
                ("count".to_string(), Some(20)),
                ("avg".to_string(), Some(1700)),
                ("sum".to_string(), Some(20)),
                ("?column?".to_string(), Some(16)),
                ("?column?".to_string(), Some(25)),
                ("now".to_string(), Some(1184)),
                ("t".to_string(), Some(25)),
            ]
        );
    }

    #[test]
    fn joins_ctes_and_derived_tables() {
        let cols = columns(
            "WITH big AS (SELECT id, amount FROM orders WHERE amount > 100) \
             SELECT c.name, b.amount, d.total FROM customers c \
             JOIN big b ON b.id = c.id \
             JOIN (SELECT count(*) AS total FROM orders) d ON true",
        );
        assert_eq!(
            cols,
            vec![
                ("name".to_string(), Some(1043)),
                ("amount".to_string(), Some(1700)),
                ("total".to_string(), Some(20)),
            ]
        );
    }

    #[test]
    fn parameters_from_context() {
        let inference = run("SELECT * FROM orders WHERE id = $1 AND placed > $2 LIMIT $3").unwrap();
        let oids: Vec<Option<u32>> = inference.params.iter().map(|p| p.map(|t| t.oid())).collect();
        assert_eq!(oids, vec![Some(23), Some(1184), Some(20)]);

        let inference = run("INSERT INTO customers (name, id) VALUES ($1, $2)").unwrap();
        assert_eq!(inference.params[0].unwrap().oid(), 1043);
        assert_eq!(inference.params[1].unwrap().oid(), 20);
        assert!(inference.columns.is_none());

        let inference = run("UPDATE orders SET amount = $1 WHERE id = ANY($2) RETURNING id").unwrap();
        assert_eq!(inference.params[0].unwrap().oid(), 1700);
        assert_eq!(inference.params[1].unwrap().oid(), 1007);
        assert_eq!(inference.columns.unwrap()[0].ty.unwrap().oid(), 23);
    }

    #[test]
    fn numeric_literals_must_be_stored_exactly() {
        assert!(run("INSERT INTO orders (id, amount) VALUES (1, 12.5), (2, '-3.25')").is_ok());
        for sql in [
            "INSERT INTO orders (id, amount) VALUES (1, 12345678901234567.25)",
            "INSERT INTO orders (id, amount) VALUES (1, '12345678901234.567')",
            "INSERT INTO orders (id, amount) VALUES (1, '123456789012345678901234567890.5')",
            "UPDATE orders SET amount = -12345678901234567.25 WHERE id = 1",
        ] {
            let err = run(sql).unwrap_err();
            assert_eq!(err.code, crate::error::sqlstate::NUMERIC_VALUE_OUT_OF_RANGE, "{sql}");
        }
    }

    #[test]
    fn declared_parameter_types_win() {
        let statement = Parser::parse_sql(&PostgreSqlDialect {}, "SELECT $1 FROM orders WHERE id = $1")
            .unwrap()
            .remove(0);
        let inference = infer(&statement, &snapshot(), vec![Some(ColumnType::scalar(PgType::Int8))]).unwrap();
        assert_eq!(inference.params[0].unwrap().oid(), 20);
        assert_eq!(inference.columns.unwrap()[0].ty.unwrap().oid(), 20);
    }

    #[test]
    fn unknown_expressions_stay_open() {
        let cols = columns("SELECT some_udf(id), missing_column FROM orders");
        assert_eq!(cols[0].1, None);
        assert_eq!(cols[1].1, None);
    }

    #[test]
    fn partially_mapped_tables_are_an_error() {
        assert!(run("SELECT a FROM broken").is_ok());
        let err = run("SELECT b FROM broken").unwrap_err();
        assert_eq!(err.code, crate::error::sqlstate::INTERNAL_ERROR);
    }
}
