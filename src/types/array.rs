//! One- and multi-dimensional arrays.
//!
//! Arrays live in SQLite as JSON text (`[1,2,null]`); older rows written as
//! PostgreSQL literals (`{1,2,NULL}`) are accepted on read as well.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value as JsonValue;

use super::{binary, text, ColumnType, PgType, PgValue};
use crate::error::{PgError, PgResult};

#[derive(Clone, Debug, PartialEq)]
pub struct PgArray {
    pub element: PgType,
    /// `(length, lower_bound)` per dimension; empty for a zero-element array.
    pub dims: Vec<(i32, i32)>,
    /// Elements in row-major order.
    pub values: Vec<PgValue>,
}

/// Intermediate nested form shared by the text and JSON parsers.
enum Node {
    Leaf(PgValue),
    List(Vec<Node>),
}

impl PgArray {
    pub fn from_values(element: PgType, values: Vec<PgValue>) -> Self {
        let dims = if values.is_empty() {
            Vec::new()
        } else {
            vec![(values.len() as i32, 1)]
        };
        Self {
            element,
            dims,
            values,
        }
    }

    fn type_name(element: PgType) -> String {
        ColumnType::array_of(element).to_string()
    }

    fn from_nodes(element: PgType, items: Vec<Node>, source: &str) -> PgResult<Self> {
        let invalid = || {
            PgError::invalid_text(&Self::type_name(element), source)
                .with_detail("Multidimensional arrays must have sub-arrays with matching dimensions.")
        };
        let mut dims = Vec::new();
        let mut level = &items;
        loop {
            if level.is_empty() {
                break;
            }
            dims.push((level.len() as i32, 1));
            match &level[0] {
                Node::List(inner) => level = inner,
                Node::Leaf(_) => break,
            }
        }

        let mut values = Vec::new();
        fn flatten(nodes: Vec<Node>, depth: usize, dims: &[(i32, i32)], out: &mut Vec<PgValue>) -> bool {
            if depth >= dims.len() || nodes.len() as i32 != dims[depth].0 {
                return false;
            }
            for node in nodes {
                match node {
                    Node::Leaf(v) if depth + 1 == dims.len() => out.push(v),
                    Node::List(inner) if depth + 1 < dims.len() => {
                        if !flatten(inner, depth + 1, dims, out) {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
            true
        }
        if !dims.is_empty() && !flatten(items, 0, &dims, &mut values) {
            return Err(invalid());
        }
        Ok(Self {
            element,
            dims,
            values,
        })
    }

    /// Parses a PostgreSQL array literal such as `{1,2,3}`, `{{1,2},{3,4}}`
    /// or `{"a b",NULL}`.
    pub fn parse_text(input: &str, element: PgType) -> PgResult<Self> {
        let type_name = Self::type_name(element);
        let invalid = || PgError::invalid_text(&type_name, input);
        let elem_ty = ColumnType::scalar(element);
        let chars: Vec<char> = input.trim().chars().collect();
        let mut pos = 0;

        fn skip_ws(chars: &[char], pos: &mut usize) {
            while *pos < chars.len() && chars[*pos].is_whitespace() {
                *pos += 1;
            }
        }

        fn parse_list(
            chars: &[char],
            pos: &mut usize,
            elem_ty: &ColumnType,
        ) -> Option<PgResult<Vec<Node>>> {
            if chars.get(*pos) != Some(&'{') {
                return None;
            }
            *pos += 1;
            let mut items = Vec::new();
            skip_ws(chars, pos);
            if chars.get(*pos) == Some(&'}') {
                *pos += 1;
                return Some(Ok(items));
            }
            loop {
                skip_ws(chars, pos);
                match chars.get(*pos).copied()? {
                    '{' => match parse_list(chars, pos, elem_ty)? {
                        Ok(inner) => items.push(Node::List(inner)),
                        Err(e) => return Some(Err(e)),
                    },
                    '"' => {
                        *pos += 1;
                        let mut text = String::new();
                        loop {
                            match chars.get(*pos).copied()? {
                                '"' => break,
                                '\\' => {
                                    *pos += 1;
                                    text.push(*chars.get(*pos)?);
                                }
                                c => text.push(c),
                            }
                            *pos += 1;
                        }
                        *pos += 1;
                        match text::decode_text(&text, elem_ty) {
                            Ok(v) => items.push(Node::Leaf(v)),
                            Err(e) => return Some(Err(e)),
                        }
                    }
                    _ => {
                        let mut text = String::new();
                        while let Some(c) = chars.get(*pos) {
                            if *c == ',' || *c == '}' {
                                break;
                            }
                            text.push(*c);
                            *pos += 1;
                        }
                        let text = text.trim();
                        if text.is_empty() {
                            return None;
                        }
                        if text.eq_ignore_ascii_case("null") {
                            items.push(Node::Leaf(PgValue::Null));
                        } else {
                            match text::decode_text(text, elem_ty) {
                                Ok(v) => items.push(Node::Leaf(v)),
                                Err(e) => return Some(Err(e)),
                            }
                        }
                    }
                }
                skip_ws(chars, pos);
                match chars.get(*pos).copied()? {
                    ',' => *pos += 1,
                    '}' => {
                        *pos += 1;
                        return Some(Ok(items));
                    }
                    _ => return None,
                }
            }
        }

        let items = parse_list(&chars, &mut pos, &elem_ty).ok_or_else(invalid)??;
        skip_ws(&chars, &mut pos);
        if pos != chars.len() {
            return Err(invalid());
        }
        Self::from_nodes(element, items, input)
    }

    fn node_from_json(json: &JsonValue, element: PgType) -> PgResult<Node> {
        match json {
            JsonValue::Array(items) if !matches!(element, PgType::Json | PgType::Jsonb) => items
                .iter()
                .map(|item| Self::node_from_json(item, element))
                .collect::<PgResult<Vec<_>>>()
                .map(Node::List),
            other => PgValue::from_json(other, element).map(Node::Leaf),
        }
    }

    /// Reads the stored form: JSON first, PostgreSQL literal as a fallback.
    pub fn from_storage(stored: &str, element: PgType) -> PgResult<Self> {
        let trimmed = stored.trim();
        if trimmed.starts_with('[') {
            let json: JsonValue = serde_json::from_str(trimmed)
                .map_err(|_| PgError::invalid_text(&Self::type_name(element), stored))?;
            let items = match json {
                JsonValue::Array(items) => items
                    .iter()
                    .map(|item| Self::node_from_json(item, element))
                    .collect::<PgResult<Vec<_>>>()?,
                _ => return Err(PgError::invalid_text(&Self::type_name(element), stored)),
            };
            return Self::from_nodes(element, items, stored);
        }
        Self::parse_text(trimmed, element)
    }

    fn nest<T>(&self, leaf: impl Fn(&PgValue) -> T, list: impl Fn(Vec<T>) -> T) -> T {
        fn build<T>(
            values: &mut std::slice::Iter<'_, PgValue>,
            dims: &[(i32, i32)],
            leaf: &impl Fn(&PgValue) -> T,
            list: &impl Fn(Vec<T>) -> T,
        ) -> T {
            let (len, _) = dims[0];
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                if dims.len() == 1 {
                    if let Some(v) = values.next() {
                        items.push(leaf(v));
                    }
                } else {
                    items.push(build(values, &dims[1..], leaf, list));
                }
            }
            list(items)
        }
        if self.dims.is_empty() {
            return list(Vec::new());
        }
        build(&mut self.values.iter(), &self.dims, &leaf, &list)
    }

    pub fn to_json(&self) -> JsonValue {
        self.nest(|v| v.to_json(), JsonValue::Array)
    }

    pub fn to_text(&self) -> String {
        self.nest(
            |v| match v {
                PgValue::Null => "NULL".to_string(),
                other => quote_element(text::encode_text(other)),
            },
            |items| format!("{{{}}}", items.join(",")),
        )
    }

    pub fn encode_binary(&self, buf: &mut BytesMut) {
        let element_oid = ColumnType::scalar(self.element).oid();
        let has_null = self.values.iter().any(PgValue::is_null);
        buf.put_i32(self.dims.len() as i32);
        buf.put_i32(has_null as i32);
        buf.put_u32(element_oid);
        for (len, lower) in &self.dims {
            buf.put_i32(*len);
            buf.put_i32(*lower);
        }
        for value in &self.values {
            if value.is_null() {
                buf.put_i32(-1);
                continue;
            }
            let mut element = BytesMut::new();
            binary::encode_binary(value, &mut element);
            buf.put_i32(element.len() as i32);
            buf.put_slice(&element);
        }
    }

    pub fn decode_binary(mut raw: &[u8], element: PgType) -> PgResult<Self> {
        let type_name = Self::type_name(element);
        let invalid = |reason: &str| PgError::invalid_binary(&type_name, reason);
        if raw.len() < 12 {
            return Err(invalid("header too short"));
        }
        let ndim = raw.get_i32();
        let _has_null = raw.get_i32();
        let element_oid = raw.get_u32();
        if !(0..=6).contains(&ndim) {
            return Err(invalid("invalid number of dimensions"));
        }
        let elem_ty = ColumnType::from_oid(element_oid)
            .filter(|ty| !ty.array)
            .ok_or_else(|| invalid("unknown element type"))?;
        if elem_ty.base != element && !(element.is_textual() && elem_ty.base.is_textual()) {
            return Err(invalid("wrong element type"));
        }

        let mut dims = Vec::with_capacity(ndim as usize);
        let mut total: usize = if ndim == 0 { 0 } else { 1 };
        for _ in 0..ndim {
            if raw.len() < 8 {
                return Err(invalid("truncated dimensions"));
            }
            let len = raw.get_i32();
            let lower = raw.get_i32();
            if len < 0 {
                return Err(invalid("negative dimension"));
            }
            total = total.saturating_mul(len as usize);
            dims.push((len, lower));
        }

        let elem_ty = ColumnType::scalar(element);
        let mut values = Vec::with_capacity(total.min(4096));
        for _ in 0..total {
            if raw.len() < 4 {
                return Err(invalid("truncated element"));
            }
            let len = raw.get_i32();
            if len == -1 {
                values.push(PgValue::Null);
                continue;
            }
            if len < 0 || raw.len() < len as usize {
                return Err(invalid("invalid element length"));
            }
            let (bytes, rest) = raw.split_at(len as usize);
            values.push(binary::decode_binary(bytes, &elem_ty)?);
            raw = rest;
        }
        if !raw.is_empty() {
            return Err(invalid("trailing bytes"));
        }
        Ok(Self {
            element,
            dims,
            values,
        })
    }
}

fn quote_element(text: String) -> String {
    let needs_quotes = text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if !needs_quotes {
        return text;
    }
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
