use std::error::Error;

use serde_json::{Map, Value};

use super::error::{MapperError, Result};
use super::model::StatementType;
use super::params::Params;
use super::registry::{BoundSql, MapperRegistry};

pub type Row = Map<String, Value>;

pub type ExecResult<T> = std::result::Result<T, Box<dyn Error + Send + Sync>>;

/// 外部SQL执行层：负责预编译、执行和结果映射
pub trait SqlExecutor {
    fn execute_query_bean(&self, sql: &str, args: &[Value]) -> ExecResult<Option<Row>>;

    fn execute_query_beans(&self, sql: &str, args: &[Value]) -> ExecResult<Vec<Row>>;

    /// 返回受影响行数
    fn execute_update(&self, sql: &str, args: &[Value]) -> ExecResult<u64>;
}

impl<E: SqlExecutor + ?Sized> SqlExecutor for &E {
    fn execute_query_bean(&self, sql: &str, args: &[Value]) -> ExecResult<Option<Row>> {
        (**self).execute_query_bean(sql, args)
    }

    fn execute_query_beans(&self, sql: &str, args: &[Value]) -> ExecResult<Vec<Row>> {
        (**self).execute_query_beans(sql, args)
    }

    fn execute_update(&self, sql: &str, args: &[Value]) -> ExecResult<u64> {
        (**self).execute_update(sql, args)
    }
}

/// 按 `namespace.id` 调用语句
pub struct SqlSession<'r, E> {
    registry: &'r MapperRegistry,
    executor: E,
}

impl<'r, E: SqlExecutor> SqlSession<'r, E> {
    pub fn new(registry: &'r MapperRegistry, executor: E) -> Self {
        SqlSession { registry, executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn select_one<'p>(&self, mapper_id: &str, params: impl Into<Params<'p>>) -> Result<Option<Row>> {
        let bound = self.prepare(mapper_id, params.into(), StatementType::Select)?;
        self.executor
            .execute_query_bean(&bound.sql, &bound.args)
            .map_err(MapperError::Executor)
    }

    pub fn select_list<'p>(&self, mapper_id: &str, params: impl Into<Params<'p>>) -> Result<Vec<Row>> {
        let bound = self.prepare(mapper_id, params.into(), StatementType::Select)?;
        self.executor
            .execute_query_beans(&bound.sql, &bound.args)
            .map_err(MapperError::Executor)
    }

    pub fn insert<'p>(&self, mapper_id: &str, params: impl Into<Params<'p>>) -> Result<u64> {
        self.modify(mapper_id, params.into(), StatementType::Insert)
    }

    pub fn update<'p>(&self, mapper_id: &str, params: impl Into<Params<'p>>) -> Result<u64> {
        self.modify(mapper_id, params.into(), StatementType::Update)
    }

    pub fn delete<'p>(&self, mapper_id: &str, params: impl Into<Params<'p>>) -> Result<u64> {
        self.modify(mapper_id, params.into(), StatementType::Delete)
    }

    fn modify(&self, mapper_id: &str, params: Params<'_>, expected: StatementType) -> Result<u64> {
        let bound = self.prepare(mapper_id, params, expected)?;
        self.executor
            .execute_update(&bound.sql, &bound.args)
            .map_err(MapperError::Executor)
    }

    fn prepare(&self, mapper_id: &str, params: Params<'_>, expected: StatementType) -> Result<BoundSql> {
        let statement = self
            .registry
            .get(mapper_id)
            .ok_or_else(|| MapperError::StatementNotFound(mapper_id.to_string()))?;
        if statement.stmt_type != expected {
            return Err(MapperError::WrongStatementType {
                statement: mapper_id.to_string(),
                expected: expected.as_str(),
                actual: statement.stmt_type.as_str(),
            });
        }
        statement.bind(params)
    }
}
