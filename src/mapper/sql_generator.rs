use log::{debug, warn};
use regex::Captures;
use serde_json::Value;

use super::error::{MapperError, Result};
use super::expr::evaluate_with;
use super::model::{DynamicSqlNode, TextSql, WhenBranch};
use super::params::{ParamContext, Params};
use super::parse_helper::{
    ends_with_ignore_case, param_name, starts_with_ignore_case, DOLLAR_PARAM_REGEX,
};
use super::resolver::{expression_lookup, resolve_variable_value};

/// 节点求值结果：SQL文本与按 `?` 顺序排列的参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub args: Vec<Value>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        SqlFragment {
            sql: sql.into(),
            args,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// 拼接：两侧都非空时以单个空格分隔，参数按顺序追加
    pub fn append(&mut self, other: SqlFragment) {
        if !other.sql.is_empty() {
            if !self.sql.is_empty() {
                self.sql.push(' ');
            }
            self.sql.push_str(&other.sql);
        }
        self.args.extend(other.args);
    }

    /// 替换文本、保留参数（用于 where/set/trim 的前后缀处理）
    fn with_sql(self, sql: String) -> Option<SqlFragment> {
        if sql.is_empty() {
            None
        } else {
            Some(SqlFragment {
                sql,
                args: self.args,
            })
        }
    }
}

/// 对整棵树求值
pub fn generate_sql(node: &DynamicSqlNode, params: Params<'_>) -> Result<SqlFragment> {
    let ctx = ParamContext::new(params);
    let fragment = node.apply(&ctx)?.unwrap_or_default();
    debug!("generated sql: {} {:?}", fragment.sql, fragment.args);
    Ok(fragment)
}

impl DynamicSqlNode {
    /// 求值；`None` 表示该节点不产出任何内容
    pub fn apply(&self, ctx: &ParamContext<'_>) -> Result<Option<SqlFragment>> {
        match self {
            DynamicSqlNode::Text(text) => apply_text(text, ctx),
            DynamicSqlNode::If { test, contents } => {
                if !test.trim().is_empty() && !evaluate_test(test, ctx)? {
                    return Ok(None);
                }
                apply_all(contents, ctx)
            }
            DynamicSqlNode::Choose { whens, otherwise } => apply_choose(whens, otherwise, ctx),
            DynamicSqlNode::Foreach {
                collection,
                item,
                index,
                open,
                separator,
                close,
                contents,
            } => {
                let entries = collection_entries(collection, ctx)?;
                let mut scope = ctx.foreach_scope();
                let mut body = SqlFragment::new(open.as_str(), Vec::new());
                let mut first = true;
                for (key, value) in entries {
                    if let Some(name) = item {
                        scope.bind_item(name, value);
                    }
                    if let Some(name) = index {
                        scope.bind_index(name, key);
                    }
                    let Some(part) = apply_all(contents, &scope)? else {
                        continue;
                    };
                    if !first {
                        body.sql.push_str(separator);
                    }
                    first = false;
                    body.sql.push_str(&part.sql);
                    body.args.extend(part.args);
                }
                body.sql.push_str(close);
                Ok(if body.is_empty() { None } else { Some(body) })
            }
            DynamicSqlNode::Trim {
                prefix,
                prefix_overrides,
                suffix,
                suffix_overrides,
                contents,
            } => {
                let Some(body) = apply_all(contents, ctx)? else {
                    return Ok(None);
                };
                let mut text = body.sql.trim();
                if let Some(p) = prefix_overrides
                    .iter()
                    .find(|p| starts_with_ignore_case(text, p))
                {
                    text = &text[p.len()..];
                }
                if let Some(s) = suffix_overrides
                    .iter()
                    .find(|s| ends_with_ignore_case(text, s))
                {
                    text = &text[..text.len() - s.len()];
                }
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                let mut sql = String::with_capacity(prefix.len() + text.len() + suffix.len() + 2);
                if !prefix.trim().is_empty() {
                    sql.push_str(prefix.trim());
                    sql.push(' ');
                }
                sql.push_str(text);
                if !suffix.trim().is_empty() {
                    sql.push(' ');
                    sql.push_str(suffix.trim());
                }
                Ok(body.with_sql(sql))
            }
            DynamicSqlNode::Where { contents } => {
                let Some(body) = apply_all(contents, ctx)? else {
                    return Ok(None);
                };
                let text = strip_connective(body.sql.trim());
                if text.is_empty() {
                    warn!("<where> content `{}` has no condition left", body.sql);
                    return Ok(None);
                }
                let sql = if starts_with_ignore_case(text, "where ") {
                    text.to_string()
                } else {
                    format!("WHERE {text}")
                };
                Ok(body.with_sql(sql))
            }
            DynamicSqlNode::Set { contents } => {
                let Some(body) = apply_all(contents, ctx)? else {
                    return Ok(None);
                };
                let text = body.sql.trim();
                let text = text.strip_suffix(',').unwrap_or(text).trim_end();
                if text.is_empty() {
                    return Ok(None);
                }
                let sql = format!("SET {text}");
                Ok(body.with_sql(sql))
            }
            DynamicSqlNode::Crud { contents } => apply_all(contents, ctx),
            DynamicSqlNode::Include { ref_id } => Err(MapperError::config(format!(
                "<include refid=\"{ref_id}\"> was not expanded"
            ))),
        }
    }
}

/// 去掉开头的一个 `and`/`or`；只剩连接词时返回空串
fn strip_connective(text: &str) -> &str {
    for connective in ["and", "or"] {
        if text.eq_ignore_ascii_case(connective) {
            return "";
        }
        if starts_with_ignore_case(text, connective)
            && text[connective.len()..].starts_with(char::is_whitespace)
        {
            return text[connective.len()..].trim_start();
        }
    }
    text
}

/// 顺序求值子节点并拼接，全部为空时返回 `None`
pub(crate) fn apply_all(
    nodes: &[DynamicSqlNode],
    ctx: &ParamContext<'_>,
) -> Result<Option<SqlFragment>> {
    let mut acc = SqlFragment::default();
    for node in nodes {
        if let Some(fragment) = node.apply(ctx)? {
            acc.append(fragment);
        }
    }
    Ok(if acc.is_empty() { None } else { Some(acc) })
}

fn evaluate_test(test: &str, ctx: &ParamContext<'_>) -> Result<bool> {
    evaluate_with(test, expression_lookup(ctx)).map_err(|source| MapperError::Expression {
        expr: test.to_string(),
        source,
    })
}

fn apply_choose(
    whens: &[WhenBranch],
    otherwise: &Option<Vec<DynamicSqlNode>>,
    ctx: &ParamContext<'_>,
) -> Result<Option<SqlFragment>> {
    for when in whens {
        if evaluate_test(&when.test, ctx)? {
            return apply_all(&when.contents, ctx);
        }
    }
    match otherwise {
        Some(contents) => apply_all(contents, ctx),
        None => Ok(None),
    }
}

fn apply_text(text: &TextSql, ctx: &ParamContext<'_>) -> Result<Option<SqlFragment>> {
    let mut args = Vec::with_capacity(text.parameters.len());
    for name in &text.parameters {
        match resolve_variable_value(name, ctx)? {
            Some(value) => args.push(value),
            None => {
                return Err(MapperError::UnresolvedPlaceholder {
                    name: name.clone(),
                    sql: text.raw.clone(),
                })
            }
        }
    }
    let sql = if text.has_substitution {
        substitute(text, ctx)?
    } else {
        text.sql.clone()
    };
    Ok(if sql.is_empty() {
        None
    } else {
        Some(SqlFragment::new(sql, args))
    })
}

/// `${name}` 原样替换；替换值里不允许出现 `?`，否则占位符与参数会错位
fn substitute(text: &TextSql, ctx: &ParamContext<'_>) -> Result<String> {
    let mut failure = None;
    let sql = DOLLAR_PARAM_REGEX.replace_all(&text.sql, |caps: &Captures| {
        if failure.is_some() {
            return String::new();
        }
        let name = param_name(&caps[1]);
        match render_raw(name, &text.raw, ctx) {
            Ok(rendered) => rendered,
            Err(err) => {
                failure = Some(err);
                String::new()
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(sql.into_owned()),
    }
}

fn render_raw(name: &str, raw_sql: &str, ctx: &ParamContext<'_>) -> Result<String> {
    let value = resolve_variable_value(name, ctx)?.ok_or_else(|| {
        MapperError::UnresolvedPlaceholder {
            name: name.to_string(),
            sql: raw_sql.to_string(),
        }
    })?;
    let rendered = match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => (if b { "1" } else { "0" }).to_string(),
        Value::Null => "NULL".to_string(),
        _ => {
            return Err(MapperError::Substitution {
                name: name.to_string(),
                message: "arrays and objects cannot be substituted".to_string(),
            })
        }
    };
    if rendered.contains('?') {
        return Err(MapperError::Substitution {
            name: name.to_string(),
            message: "value contains a `?` placeholder character".to_string(),
        });
    }
    Ok(rendered)
}

/// foreach 的 (index, item) 序列；对象按键排序，index 为键
fn collection_entries(collection: &str, ctx: &ParamContext<'_>) -> Result<Vec<(Value, Value)>> {
    match resolve_variable_value(collection, ctx)? {
        Some(Value::Array(items)) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (Value::from(i), item))
            .collect()),
        Some(Value::Object(map)) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(entries
                .into_iter()
                .map(|(key, item)| (Value::String(key), item))
                .collect())
        }
        Some(Value::Null) => Ok(Vec::new()),
        Some(other) => Err(MapperError::NotACollection {
            name: collection.to_string(),
            found: match other {
                Value::Bool(_) => "a bool",
                Value::Number(_) => "a number",
                _ => "a string",
            },
        }),
        None => Err(MapperError::UnresolvedPlaceholder {
            name: collection.to_string(),
            sql: format!("<foreach collection=\"{collection}\">"),
        }),
    }
}
