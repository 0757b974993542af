use serde_json::Value;

use super::error::{MapperError, Result};
use super::expr::ExprError;
use super::params::ParamContext;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(IndexRef),
    Size,
}

#[derive(Debug, Clone, PartialEq)]
enum IndexRef {
    Literal(usize),
    Var(String),
}

/// 解析变量引用：`name`、`a.b.c`、`list[0]`、`list[idx]`、`list.size()`
///
/// 找不到值时返回 `Ok(None)`；只有引用本身写错才返回错误。
pub fn resolve_variable_value(name: &str, ctx: &ParamContext<'_>) -> Result<Option<Value>> {
    let (root, segments) = parse_path(name)?;
    let Some(mut current) = ctx.lookup_root(&root) else {
        return Ok(None);
    };
    for segment in &segments {
        match step(current, segment, ctx) {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// 供 `test` 表达式使用的变量查找
pub(crate) fn expression_lookup<'c>(
    ctx: &'c ParamContext<'c>,
) -> impl FnMut(&str) -> std::result::Result<Option<Value>, ExprError> + 'c {
    move |name| {
        resolve_variable_value(name, ctx).map_err(|err| ExprError::Variable {
            name: name.to_string(),
            message: err.to_string(),
        })
    }
}

fn step(current: Value, segment: &Segment, ctx: &ParamContext<'_>) -> Option<Value> {
    match segment {
        Segment::Key(key) => match current {
            Value::Object(mut map) => match map.remove(key) {
                Some(value) => Some(value),
                None if key == "length" => Some(Value::from(map.len())),
                None => map
                    .into_iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v),
            },
            ref other if key == "length" => size_of(other),
            _ => None,
        },
        Segment::Index(index) => {
            let index = match index {
                IndexRef::Literal(n) => *n,
                IndexRef::Var(var) => ctx.lookup_root(var)?.as_u64()? as usize,
            };
            match current {
                Value::Array(mut items) if index < items.len() => Some(items.swap_remove(index)),
                _ => None,
            }
        }
        Segment::Size => size_of(&current),
    }
}

fn size_of(value: &Value) -> Option<Value> {
    match value {
        Value::Array(items) => Some(Value::from(items.len())),
        Value::Object(map) => Some(Value::from(map.len())),
        Value::String(s) => Some(Value::from(s.chars().count())),
        _ => None,
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn parse_path(path: &str) -> Result<(String, Vec<Segment>)> {
    let invalid = || MapperError::InvalidPath(path.to_string());
    let path = path.trim();
    let root_end = path.find(['.', '[']).unwrap_or(path.len());
    let root = &path[..root_end];
    if !is_ident(root) {
        return Err(invalid());
    }

    let mut segments = Vec::new();
    let mut rest = &path[root_end..];
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            let end = tail.find(['.', '[']).unwrap_or(tail.len());
            let name = &tail[..end];
            if name == "size()" {
                segments.push(Segment::Size);
            } else if is_ident(name) {
                segments.push(Segment::Key(name.to_string()));
            } else {
                return Err(invalid());
            }
            rest = &tail[end..];
        } else if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']').ok_or_else(invalid)?;
            let inner = tail[..end].trim();
            let index = match inner.parse::<usize>() {
                Ok(n) => IndexRef::Literal(n),
                Err(_) if is_ident(inner) => IndexRef::Var(inner.to_string()),
                Err(_) => return Err(invalid()),
            };
            segments.push(Segment::Index(index));
            rest = &tail[end + 1..];
        } else {
            return Err(invalid());
        }
    }

    Ok((root.to_string(), segments))
}
