use lazy_static::lazy_static;
use quick_xml::events::BytesStart;
use regex::{Captures, Regex};
use xml::attribute::OwnedAttribute;

use super::error::{MapperError, Result};
use super::model::TextSql;

lazy_static! {
    pub(crate) static ref PARAM_REGEX: Regex = Regex::new(r"#\{([^}]*)\}").unwrap();
    pub(crate) static ref DOLLAR_PARAM_REGEX: Regex = Regex::new(r"\$\{([^}]*)\}").unwrap();
    /// 引号内的字符串字面量原样匹配，其余连续空白单独匹配
    static ref WHITESPACE_REGEX: Regex = Regex::new(r#"'[^']*'|"[^"]*"|\s+"#).unwrap();
}

/// 连续空白合并为一个空格，`'...'`/`"..."` 字面量内部保持不变
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE_REGEX
        .replace_all(text.trim(), |caps: &Captures| {
            let matched = &caps[0];
            if matched.starts_with(['\'', '"']) {
                matched.to_string()
            } else {
                " ".to_string()
            }
        })
        .into_owned()
}

/// `#{name,jdbcType=VARCHAR}` / `#{name:VARCHAR}` 只取参数名
pub fn param_name(raw: &str) -> &str {
    raw.split([',', ':']).next().unwrap_or(raw).trim()
}

/// 一次正则扫描，得到 (`?` 改写后的SQL, 按顺序的参数名)
pub fn extract_placeholders(text: &str) -> Result<(String, Vec<String>)> {
    let mut names = Vec::new();
    let mut empty = false;
    let sql = PARAM_REGEX.replace_all(text, |caps: &Captures| {
        let name = param_name(&caps[1]);
        if name.is_empty() {
            empty = true;
        }
        names.push(name.to_string());
        "?"
    });
    if empty {
        return Err(MapperError::config(format!("empty #{{}} placeholder in `{text}`")));
    }
    Ok((sql.into_owned(), names))
}

/// 构造文本节点
pub fn build_text(raw: &str) -> Result<TextSql> {
    text_node(normalize_whitespace(raw))
}

/// CDATA 内容只去掉首尾空白
pub fn build_verbatim_text(raw: &str) -> Result<TextSql> {
    text_node(raw.trim().to_string())
}

fn text_node(raw: String) -> Result<TextSql> {
    let (sql, parameters) = extract_placeholders(&raw)?;
    Ok(TextSql {
        has_substitution: DOLLAR_PARAM_REGEX.is_match(&raw),
        raw,
        sql,
        parameters,
    })
}

/// `prefixOverrides="AND |OR "` 按 `|` 拆分，保留每项原样
pub fn split_overrides(attr: Option<String>) -> Vec<String> {
    attr.map(|value| {
        value
            .split('|')
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

pub fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

pub fn ends_with_ignore_case(text: &str, suffix: &str) -> bool {
    text.len() >= suffix.len()
        && text.is_char_boundary(text.len() - suffix.len())
        && text[text.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

/// 读取 quick-xml 元素属性（已反转义）
pub fn attr_value(element: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| MapperError::xml(&tag_name(element), e))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| MapperError::xml(&tag_name(element), e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// 必填属性
pub fn required_attr(element: &BytesStart<'_>, name: &str) -> Result<String> {
    match attr_value(element, name)? {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(MapperError::config(format!(
            "<{}> requires a non-empty `{name}` attribute",
            tag_name(element)
        ))),
    }
}

pub fn tag_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.name().as_ref()).into_owned()
}

/// 检索属性，匹配情况下回调闭包
pub fn search_matched_attr(
    attributes: &[OwnedAttribute],
    matched_name: &str,
    mut f: impl FnMut(&OwnedAttribute),
) {
    for attr in attributes {
        if attr.name.local_name.as_str() == matched_name {
            f(attr);
            break;
        }
    }
}

/// 是否匹配语句块
pub fn match_statement(element_name: &str) -> bool {
    matches!(element_name, "select" | "insert" | "update" | "delete")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_become_question_marks_in_order() {
        let (sql, names) =
            extract_placeholders("a = #{a} and b = #{ b , jdbcType=INT} or c = #{a}").unwrap();
        assert_eq!(sql, "a = ? and b = ? or c = ?");
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    #[test]
    fn type_suffix_is_dropped() {
        assert_eq!(param_name("name:VARCHAR"), "name");
        assert_eq!(param_name(" user.id "), "user.id");
    }

    #[test]
    fn empty_placeholder_is_rejected() {
        assert!(matches!(extract_placeholders("a = #{ }"), Err(MapperError::Config(_))));
    }

    #[test]
    fn text_is_normalized() {
        let text = build_text("\n  SELECT *\n\tFROM t WHERE id = #{id}  ").unwrap();
        assert_eq!(text.raw, "SELECT * FROM t WHERE id = #{id}");
        assert_eq!(text.sql, "SELECT * FROM t WHERE id = ?");
        assert_eq!(text.parameters, vec!["id"]);
        assert!(!text.has_substitution);
        assert!(build_text("ORDER BY ${col}").unwrap().has_substitution);
    }

    #[test]
    fn quoted_literals_keep_their_spaces() {
        assert_eq!(
            normalize_whitespace("WHERE  note = 'a    b'\n AND tag = \"x  y\"   AND id = #{id}"),
            "WHERE note = 'a    b' AND tag = \"x  y\" AND id = #{id}"
        );
        assert_eq!(normalize_whitespace("a = 'it''s  ok'  b"), "a = 'it''s  ok' b");

        let text = build_verbatim_text("  SELECT *\n  FROM t  WHERE id = #{id} ").unwrap();
        assert_eq!(text.raw, "SELECT *\n  FROM t  WHERE id = #{id}");
        assert_eq!(text.sql, "SELECT *\n  FROM t  WHERE id = ?");
    }

    #[test]
    fn overrides_keep_trailing_spaces() {
        assert_eq!(
            split_overrides(Some("AND |OR ".to_string())),
            vec!["AND ".to_string(), "OR ".to_string()]
        );
        assert!(split_overrides(None).is_empty());
    }

    #[test]
    fn case_insensitive_affixes() {
        assert!(starts_with_ignore_case("and a = 1", "AND "));
        assert!(!starts_with_ignore_case("an", "AND "));
        assert!(ends_with_ignore_case("a = 1,", ","));
        assert!(!ends_with_ignore_case("名字", "x字"));
    }
}
