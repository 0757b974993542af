use std::error::Error;
use std::io;

use thiserror::Error;

use super::expr::ExprError;

pub type Result<T> = std::result::Result<T, MapperError>;

/// 映射层错误
#[derive(Debug, Error)]
pub enum MapperError {
    /// 静态配置错误：未知标签、重复id、缺少属性等
    #[error("mapper configuration error: {0}")]
    Config(String),

    #[error("malformed mapper xml in {location}: {message}")]
    Xml { location: String, message: String },

    #[error("unable to read mapper resource {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to evaluate test expression `{expr}`: {source}")]
    Expression {
        expr: String,
        #[source]
        source: ExprError,
    },

    #[error("invalid parameter path `{0}`")]
    InvalidPath(String),

    /// 参数绑定错误，面向调用方
    #[error("statement {statement}: {message}")]
    Binding { statement: String, message: String },

    /// 渲染期错误，附带出错语句的 `namespace.id`
    #[error("statement {statement}: {source}")]
    Statement {
        statement: String,
        #[source]
        source: Box<MapperError>,
    },

    #[error("parameter `{name}` has no value in sql fragment `{sql}`")]
    UnresolvedPlaceholder { name: String, sql: String },

    #[error("cannot substitute `${{{name}}}`: {message}")]
    Substitution { name: String, message: String },

    #[error("foreach collection `{name}` resolved to {found}, expected an array or object")]
    NotACollection { name: String, found: &'static str },

    #[error("statement {0} is not registered")]
    StatementNotFound(String),

    #[error("statement {statement} is a {actual} statement, expected {expected}")]
    WrongStatementType {
        statement: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("sql execution failed: {0}")]
    Executor(#[source] Box<dyn Error + Send + Sync>),
}

impl MapperError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        MapperError::Config(message.into())
    }

    pub(crate) fn xml(location: &str, err: impl std::fmt::Display) -> Self {
        MapperError::Xml {
            location: location.to_string(),
            message: err.to_string(),
        }
    }
}
