pub mod builder;
pub mod error;
pub mod expr;
pub mod model;
pub mod params;
pub mod parse_helper;
pub mod parser;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod sql_generator;

pub use builder::MapperBuilder;
pub use error::{MapperError, Result};
pub use expr::{evaluate, evaluate_with, ExprError, Operand};
pub use model::{DynamicSqlNode, Mapper, SqlStatement, StatementType, TextSql, WhenBranch};
pub use params::{ParamContext, Params, ParamsAccess};
pub use parser::{MyBatisXmlParser, DEFAULT_INCLUDE_DEPTH};
pub use registry::{BoundSql, MapperRegistry};
pub use resolver::resolve_variable_value;
pub use session::{ExecResult, Row, SqlExecutor, SqlSession};
pub use sql_generator::{generate_sql, SqlFragment};
