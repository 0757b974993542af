use std::io::Cursor;

use log::debug;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::error::{MapperError, Result};
use super::model::*;
use super::parse_helper::{
    attr_value, build_text, build_verbatim_text, match_statement, required_attr, split_overrides,
    tag_name,
};

/// `<include>` 默认最大嵌套层数
pub const DEFAULT_INCLUDE_DEPTH: usize = 8;

/// MyBatis XML解析器，处理单个 `<mapper>` 文档
pub struct MyBatisXmlParser {
    reader: Reader<Cursor<Vec<u8>>>,
    buf: Vec<u8>,
    location: String,
    include_depth: usize,
}

/// 尚未展开 include 的语句
struct PendingStatement {
    statement: SqlStatement,
    nodes: Vec<DynamicSqlNode>,
}

impl MyBatisXmlParser {
    /// 从字符串创建解析器
    pub fn new(xml_content: &str) -> Self {
        Self::new_from_bytes(xml_content.as_bytes())
    }

    /// 从字节切片创建解析器
    pub fn new_from_bytes(xml_bytes: &[u8]) -> Self {
        let cursor = Cursor::new(xml_bytes.to_vec());
        let mut reader = Reader::from_reader(cursor);
        reader.trim_text(true);

        MyBatisXmlParser {
            reader,
            buf: Vec::new(),
            location: "<memory>".to_string(),
            include_depth: DEFAULT_INCLUDE_DEPTH,
        }
    }

    /// 错误信息中使用的来源（通常是文件路径）
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_include_depth(mut self, depth: usize) -> Self {
        self.include_depth = depth;
        self
    }

    /// 解析mapper文件
    pub fn parse_mapper(&mut self) -> Result<Mapper> {
        let mut mapper = Mapper::default();
        let mut pending = Vec::new();
        let mut in_mapper = false;

        loop {
            match self.next_event()? {
                Event::Start(e) if !in_mapper => {
                    self.open_mapper(&e, &mut mapper)?;
                    in_mapper = true;
                }
                Event::Empty(e) if !in_mapper => {
                    self.open_mapper(&e, &mut mapper)?;
                    break;
                }
                Event::Start(e) => self.parse_mapper_child(&e, false, &mut mapper, &mut pending)?,
                Event::Empty(e) => self.parse_mapper_child(&e, true, &mut mapper, &mut pending)?,
                Event::End(_) => break,
                Event::Eof if in_mapper => {
                    return Err(MapperError::xml(&self.location, "unexpected end of document"))
                }
                Event::Eof => {
                    return Err(MapperError::config(format!(
                        "{}: document has no <mapper> element",
                        self.location
                    )))
                }
                _ => {}
            }
        }

        for PendingStatement {
            mut statement,
            nodes,
        } in pending
        {
            let nodes = self.expand_includes(nodes, &mapper, self.include_depth)?;
            finish_statement(&mut statement, nodes);
            debug!(
                "parsed statement {} ({}, dynamic: {})",
                statement.key(),
                statement.stmt_type,
                statement.is_dynamic()
            );
            mapper.statements.push(statement);
        }

        Ok(mapper)
    }

    fn next_event(&mut self) -> Result<Event<'static>> {
        self.buf.clear();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(event) => Ok(event.into_owned()),
            Err(e) => Err(MapperError::xml(&self.location, e)),
        }
    }

    fn open_mapper(&self, e: &BytesStart<'_>, mapper: &mut Mapper) -> Result<()> {
        let name = tag_name(e);
        if name != "mapper" {
            return Err(MapperError::config(format!(
                "{}: expected a <mapper> root element, found <{name}>",
                self.location
            )));
        }
        mapper.namespace = required_attr(e, "namespace")?;
        debug!("namespace: {}", mapper.namespace);
        Ok(())
    }

    fn parse_mapper_child(
        &mut self,
        e: &BytesStart<'_>,
        empty: bool,
        mapper: &mut Mapper,
        pending: &mut Vec<PendingStatement>,
    ) -> Result<()> {
        let name = tag_name(e);
        if match_statement(&name) {
            let id = required_attr(e, "id")?;
            if pending.iter().any(|p| p.statement.id == id) {
                return Err(MapperError::config(format!(
                    "duplicate statement id {}",
                    statement_key(&mapper.namespace, &id)
                )));
            }
            let statement = SqlStatement {
                namespace: mapper.namespace.clone(),
                id,
                stmt_type: StatementType::from_tag(&name)
                    .ok_or_else(|| MapperError::config(format!("unknown statement <{name}>")))?,
                parameter_type: attr_value(e, "parameterType")?,
                result_type: attr_value(e, "resultType")?,
                result_map: attr_value(e, "resultMap")?,
                sql: String::new(),
                parameters: Vec::new(),
                dynamic_sql: None,
            };
            let nodes = if empty {
                Vec::new()
            } else {
                self.parse_sql_content(&name)?
            };
            pending.push(PendingStatement { statement, nodes });
        } else if name == "sql" {
            let id = required_attr(e, "id")?;
            let nodes = if empty {
                Vec::new()
            } else {
                self.parse_sql_content(&name)?
            };
            if mapper.sql_fragments.insert(id.clone(), nodes).is_some() {
                return Err(MapperError::config(format!(
                    "duplicate <sql> fragment {}",
                    statement_key(&mapper.namespace, &id)
                )));
            }
        } else if matches!(
            name.as_str(),
            "resultMap" | "parameterMap" | "cache" | "cache-ref"
        ) {
            debug!("skipping <{name}> in {}", mapper.namespace);
            if !empty {
                self.skip_element()?;
            }
        } else {
            return Err(MapperError::config(format!(
                "unsupported element <{name}> in mapper {}",
                mapper.namespace
            )));
        }
        Ok(())
    }

    /// 解析SQL内容和动态SQL节点，直到当前元素结束
    fn parse_sql_content(&mut self, parent: &str) -> Result<Vec<DynamicSqlNode>> {
        let mut nodes = Vec::new();
        loop {
            match self.next_event()? {
                Event::Start(e) => nodes.push(self.parse_dynamic(&e, false)?),
                Event::Empty(e) => nodes.push(self.parse_dynamic(&e, true)?),
                Event::Text(t) => {
                    let text = t.unescape().map_err(|e| MapperError::xml(&self.location, e))?;
                    push_text(&mut nodes, &text)?;
                }
                Event::CData(c) => {
                    let text = String::from_utf8_lossy(&c).into_owned();
                    if !text.trim().is_empty() {
                        nodes.push(DynamicSqlNode::Text(build_verbatim_text(&text)?));
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(MapperError::xml(
                        &self.location,
                        format!("unexpected end of document inside <{parent}>"),
                    ))
                }
                _ => {}
            }
        }
        Ok(nodes)
    }

    fn children(&mut self, name: &str, empty: bool) -> Result<Vec<DynamicSqlNode>> {
        if empty {
            Ok(Vec::new())
        } else {
            self.parse_sql_content(name)
        }
    }

    fn parse_dynamic(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<DynamicSqlNode> {
        let name = tag_name(e);
        let node = match name.as_str() {
            "if" => DynamicSqlNode::If {
                test: attr_value(e, "test")?.unwrap_or_default().trim().to_string(),
                contents: self.children(&name, empty)?,
            },
            "where" => DynamicSqlNode::Where {
                contents: self.children(&name, empty)?,
            },
            "set" => DynamicSqlNode::Set {
                contents: self.children(&name, empty)?,
            },
            "trim" => DynamicSqlNode::Trim {
                prefix: attr_value(e, "prefix")?.unwrap_or_default(),
                prefix_overrides: split_overrides(attr_value(e, "prefixOverrides")?),
                suffix: attr_value(e, "suffix")?.unwrap_or_default(),
                suffix_overrides: split_overrides(attr_value(e, "suffixOverrides")?),
                contents: self.children(&name, empty)?,
            },
            "foreach" => DynamicSqlNode::Foreach {
                collection: required_attr(e, "collection")?,
                item: attr_value(e, "item")?.filter(|s| !s.trim().is_empty()),
                index: attr_value(e, "index")?.filter(|s| !s.trim().is_empty()),
                open: attr_value(e, "open")?.unwrap_or_default(),
                separator: attr_value(e, "separator")?.unwrap_or_default(),
                close: attr_value(e, "close")?.unwrap_or_default(),
                contents: self.children(&name, empty)?,
            },
            "choose" if empty => DynamicSqlNode::Choose {
                whens: Vec::new(),
                otherwise: None,
            },
            "choose" => self.parse_choose()?,
            "include" => {
                let ref_id = required_attr(e, "refid")?;
                if !empty {
                    self.skip_element()?;
                }
                DynamicSqlNode::Include { ref_id }
            }
            "when" | "otherwise" => {
                return Err(MapperError::config(format!(
                    "{}: <{name}> is only allowed inside <choose>",
                    self.location
                )))
            }
            _ => {
                return Err(MapperError::config(format!(
                    "{}: unsupported dynamic tag <{name}>",
                    self.location
                )))
            }
        };
        Ok(node)
    }

    fn parse_choose(&mut self) -> Result<DynamicSqlNode> {
        let mut whens = Vec::new();
        let mut otherwise = None;
        loop {
            let (e, empty) = match self.next_event()? {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::Text(t) if t.iter().all(u8::is_ascii_whitespace) => continue,
                Event::Text(_) | Event::CData(_) => {
                    return Err(MapperError::config(format!(
                        "{}: <choose> may only contain <when> and <otherwise>",
                        self.location
                    )))
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(MapperError::xml(
                        &self.location,
                        "unexpected end of document inside <choose>",
                    ))
                }
                _ => continue,
            };
            match tag_name(&e).as_str() {
                "when" => whens.push(WhenBranch {
                    test: required_attr(&e, "test")?,
                    contents: self.children("when", empty)?,
                }),
                "otherwise" if otherwise.is_none() => {
                    otherwise = Some(self.children("otherwise", empty)?);
                }
                "otherwise" => {
                    return Err(MapperError::config(format!(
                        "{}: <choose> has more than one <otherwise>",
                        self.location
                    )))
                }
                other => {
                    return Err(MapperError::config(format!(
                        "{}: <{other}> is not allowed inside <choose>",
                        self.location
                    )))
                }
            }
        }
        Ok(DynamicSqlNode::Choose { whens, otherwise })
    }

    /// 跳过元素
    fn skip_element(&mut self) -> Result<()> {
        let mut depth = 1;
        while depth > 0 {
            match self.next_event()? {
                Event::Start(_) => depth += 1,
                Event::End(_) => depth -= 1,
                Event::Eof => {
                    return Err(MapperError::xml(&self.location, "unexpected end of document"))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 把 `<include>` 替换为对应 `<sql>` 片段的节点
    fn expand_includes(
        &self,
        nodes: Vec<DynamicSqlNode>,
        mapper: &Mapper,
        depth: usize,
    ) -> Result<Vec<DynamicSqlNode>> {
        let mut expanded = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                DynamicSqlNode::Include { ref_id } => {
                    let local_id = ref_id
                        .strip_prefix(mapper.namespace.as_str())
                        .and_then(|rest| rest.strip_prefix('.'))
                        .unwrap_or(&ref_id);
                    let fragment = mapper.sql_fragments.get(local_id).ok_or_else(|| {
                        MapperError::config(format!(
                            "{}: unknown <sql> fragment `{ref_id}` in mapper {}",
                            self.location, mapper.namespace
                        ))
                    })?;
                    if depth == 0 {
                        return Err(MapperError::config(format!(
                            "{}: <include refid=\"{ref_id}\"> nests deeper than {} levels",
                            self.location, self.include_depth
                        )));
                    }
                    expanded.extend(self.expand_includes(fragment.clone(), mapper, depth - 1)?);
                }
                other => expanded.push(self.expand_node(other, mapper, depth)?),
            }
        }
        Ok(expanded)
    }

    fn expand_node(
        &self,
        node: DynamicSqlNode,
        mapper: &Mapper,
        depth: usize,
    ) -> Result<DynamicSqlNode> {
        let expand = |contents: Vec<DynamicSqlNode>| self.expand_includes(contents, mapper, depth);
        Ok(match node {
            DynamicSqlNode::If { test, contents } => DynamicSqlNode::If {
                test,
                contents: expand(contents)?,
            },
            DynamicSqlNode::Choose { whens, otherwise } => DynamicSqlNode::Choose {
                whens: whens
                    .into_iter()
                    .map(|w| {
                        Ok(WhenBranch {
                            test: w.test,
                            contents: expand(w.contents)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
                otherwise: otherwise.map(expand).transpose()?,
            },
            DynamicSqlNode::Foreach {
                collection,
                item,
                index,
                open,
                separator,
                close,
                contents,
            } => DynamicSqlNode::Foreach {
                collection,
                item,
                index,
                open,
                separator,
                close,
                contents: expand(contents)?,
            },
            DynamicSqlNode::Trim {
                prefix,
                prefix_overrides,
                suffix,
                suffix_overrides,
                contents,
            } => DynamicSqlNode::Trim {
                prefix,
                prefix_overrides,
                suffix,
                suffix_overrides,
                contents: expand(contents)?,
            },
            DynamicSqlNode::Where { contents } => DynamicSqlNode::Where {
                contents: expand(contents)?,
            },
            DynamicSqlNode::Set { contents } => DynamicSqlNode::Set {
                contents: expand(contents)?,
            },
            DynamicSqlNode::Crud { contents } => DynamicSqlNode::Crud {
                contents: expand(contents)?,
            },
            leaf @ (DynamicSqlNode::Text(_) | DynamicSqlNode::Include { .. }) => leaf,
        })
    }
}

fn push_text(nodes: &mut Vec<DynamicSqlNode>, text: &str) -> Result<()> {
    if !text.trim().is_empty() {
        nodes.push(DynamicSqlNode::Text(build_text(text)?));
    }
    Ok(())
}

/// 只有静态文本的语句直接保存 `?` SQL 与参数名；否则挂上动态根节点
fn finish_statement(statement: &mut SqlStatement, nodes: Vec<DynamicSqlNode>) {
    let skeleton: Vec<&TextSql> = nodes
        .iter()
        .filter_map(|node| match node {
            DynamicSqlNode::Text(text) => Some(text),
            _ => None,
        })
        .collect();
    statement.sql = skeleton
        .iter()
        .map(|text| text.sql.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    statement.parameters = skeleton
        .iter()
        .flat_map(|text| text.parameters.iter().cloned())
        .collect();

    if !nodes.iter().all(DynamicSqlNode::is_static_text) {
        statement.dynamic_sql = Some(DynamicSqlNode::Crud { contents: nodes });
    }
}
