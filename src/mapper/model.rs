use std::collections::HashMap;
use std::fmt;

/// MyBatis映射文件模型
#[derive(Debug, Default)]
pub struct Mapper {
    /// 命名空间
    pub namespace: String,
    /// SQL语句，按出现顺序
    pub statements: Vec<SqlStatement>,
    /// SQL片段映射，`<sql id>` → 节点
    pub sql_fragments: HashMap<String, Vec<DynamicSqlNode>>,
}

/// SQL语句类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "select" => Some(StatementType::Select),
            "insert" => Some(StatementType::Insert),
            "update" => Some(StatementType::Update),
            "delete" => Some(StatementType::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementType::Select => "select",
            StatementType::Insert => "insert",
            StatementType::Update => "update",
            StatementType::Delete => "delete",
        }
    }

    pub fn is_query(&self) -> bool {
        *self == StatementType::Select
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解析后的一条语句，加载后只读
#[derive(Debug, Clone)]
pub struct SqlStatement {
    /// 命名空间
    pub namespace: String,
    /// 语句ID
    pub id: String,
    /// 语句类型
    pub stmt_type: StatementType,
    /// 参数类型
    pub parameter_type: Option<String>,
    /// 返回值类型
    pub result_type: Option<String>,
    /// 结果映射ID
    pub result_map: Option<String>,
    /// `#{}` 已替换为 `?` 的静态SQL
    pub sql: String,
    /// `sql` 中占位符对应的参数名，按出现顺序
    pub parameters: Vec<String>,
    /// 动态SQL根节点，静态语句为 `None`
    pub dynamic_sql: Option<DynamicSqlNode>,
}

impl SqlStatement {
    /// `namespace.id`
    pub fn key(&self) -> String {
        statement_key(&self.namespace, &self.id)
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic_sql.is_some()
    }
}

pub fn statement_key(namespace: &str, id: &str) -> String {
    if namespace.is_empty() {
        id.to_string()
    } else {
        format!("{namespace}.{id}")
    }
}

/// 纯文本片段，解析时已完成 `#{}` → `?` 改写
#[derive(Debug, Clone, PartialEq)]
pub struct TextSql {
    /// 原始文本（空白已规整）
    pub raw: String,
    /// 改写后的文本
    pub sql: String,
    /// 占位符参数名，与 `sql` 中的 `?` 一一对应
    pub parameters: Vec<String>,
    /// 是否含 `${}` 原样替换
    pub has_substitution: bool,
}

/// `<when>` 分支
#[derive(Debug, Clone)]
pub struct WhenBranch {
    pub test: String,
    pub contents: Vec<DynamicSqlNode>,
}

/// 动态SQL节点
#[derive(Debug, Clone)]
pub enum DynamicSqlNode {
    Text(TextSql),
    If {
        test: String,
        contents: Vec<DynamicSqlNode>,
    },
    Choose {
        whens: Vec<WhenBranch>,
        otherwise: Option<Vec<DynamicSqlNode>>,
    },
    Foreach {
        collection: String,
        item: Option<String>,
        index: Option<String>,
        open: String,
        separator: String,
        close: String,
        contents: Vec<DynamicSqlNode>,
    },
    Trim {
        prefix: String,
        prefix_overrides: Vec<String>,
        suffix: String,
        suffix_overrides: Vec<String>,
        contents: Vec<DynamicSqlNode>,
    },
    Where {
        contents: Vec<DynamicSqlNode>,
    },
    Set {
        contents: Vec<DynamicSqlNode>,
    },
    /// `<include refid>`，加载完成前会被展开
    Include {
        ref_id: String,
    },
    /// 语句根节点
    Crud {
        contents: Vec<DynamicSqlNode>,
    },
}

impl DynamicSqlNode {
    /// 只含不带 `${}` 的文本节点时可走静态路径
    pub fn is_static_text(&self) -> bool {
        matches!(self, DynamicSqlNode::Text(text) if !text.has_substitution)
    }
}
