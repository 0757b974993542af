use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use log::debug;
use serde_json::Value;

use super::error::{MapperError, Result};
use super::model::{Mapper, SqlStatement, StatementType};
use super::params::{ParamContext, Params};
use super::resolver::resolve_variable_value;
use super::sql_generator::generate_sql;

/// 交给执行层的最终SQL
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSql {
    /// `namespace.id`
    pub statement: String,
    pub stmt_type: StatementType,
    pub sql: String,
    pub args: Vec<Value>,
}

/// `namespace.id` → 语句。加载阶段写入，之后并发只读
#[derive(Debug, Default)]
pub struct MapperRegistry {
    statements: RwLock<HashMap<String, Arc<SqlStatement>>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, statement: SqlStatement) -> Result<()> {
        let key = statement.key();
        let mut statements = self.statements.write().unwrap_or_else(PoisonError::into_inner);
        if statements.contains_key(&key) {
            return Err(MapperError::config(format!("duplicate statement id {key}")));
        }
        debug!("register statement {key}");
        statements.insert(key, Arc::new(statement));
        Ok(())
    }

    /// 整个 mapper 要么全部注册，要么一个都不注册
    pub fn register_mapper(&self, mapper: Mapper) -> Result<usize> {
        let mut statements = self.statements.write().unwrap_or_else(PoisonError::into_inner);
        let mut batch = HashSet::with_capacity(mapper.statements.len());
        if let Some(dup) = mapper
            .statements
            .iter()
            .map(SqlStatement::key)
            .find(|key| statements.contains_key(key) || !batch.insert(key.clone()))
        {
            return Err(MapperError::config(format!("duplicate statement id {dup}")));
        }
        let count = mapper.statements.len();
        for statement in mapper.statements {
            debug!("register statement {}", statement.key());
            statements.insert(statement.key(), Arc::new(statement));
        }
        Ok(count)
    }

    pub fn get(&self, mapper_id: &str) -> Option<Arc<SqlStatement>> {
        self.statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(mapper_id)
            .cloned()
    }

    pub fn contains(&self, mapper_id: &str) -> bool {
        self.get(mapper_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.statements.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已注册的语句键，排序后返回
    pub fn statement_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .statements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// 按 `namespace.id` 生成最终SQL与参数
    pub fn bound_sql<'p>(&self, mapper_id: &str, params: impl Into<Params<'p>>) -> Result<BoundSql> {
        let statement = self
            .get(mapper_id)
            .ok_or_else(|| MapperError::StatementNotFound(mapper_id.to_string()))?;
        statement.bind(params.into())
    }
}

impl SqlStatement {
    /// 动态语句走节点树；静态语句按参数名顺序直接取值
    pub fn bind(&self, params: Params<'_>) -> Result<BoundSql> {
        let (sql, args) = match &self.dynamic_sql {
            Some(root) => {
                let fragment =
                    generate_sql(root, params).map_err(|err| self.statement_error(err))?;
                (fragment.sql, fragment.args)
            }
            None => (self.sql.clone(), self.bind_static(params)?),
        };
        debug!("{}: {} {:?}", self.key(), sql, args);
        Ok(BoundSql {
            statement: self.key(),
            stmt_type: self.stmt_type,
            sql,
            args,
        })
    }

    fn binding_error(&self, message: String) -> MapperError {
        MapperError::Binding {
            statement: self.key(),
            message,
        }
    }

    fn statement_error(&self, source: MapperError) -> MapperError {
        MapperError::Statement {
            statement: self.key(),
            source: Box::new(source),
        }
    }

    fn bind_static(&self, params: Params<'_>) -> Result<Vec<Value>> {
        let names = &self.parameters;
        match params {
            Params::Positional(items) if items.len() == names.len() => Ok(items.to_vec()),
            Params::Positional(items) => Err(self.binding_error(format!(
                "expected {} positional parameters ({}), got {}",
                names.len(),
                names.join(", "),
                items.len()
            ))),
            Params::None if names.is_empty() => Ok(Vec::new()),
            Params::None => Err(self.binding_error(format!(
                "parameters ({}) are required but none were given",
                names.join(", ")
            ))),
            _ => {
                let ctx = ParamContext::new(params);
                names
                    .iter()
                    .map(|name| {
                        resolve_variable_value(name, &ctx)
                            .map_err(|err| self.statement_error(err))?
                            .ok_or_else(|| {
                                self.binding_error(format!(
                                    "parameter `{name}` not found in {} parameters",
                                    params.shape()
                                ))
                            })
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::parser::MyBatisXmlParser;
    use serde_json::json;
    use std::thread;

    const MAPPER: &str = r#"<mapper namespace="user">
        <select id="byId">SELECT * FROM users WHERE id = #{id}</select>
        <select id="byNameAndAge">SELECT * FROM users WHERE name = #{name} AND age = #{age}</select>
        <select id="count">SELECT COUNT(*) FROM users</select>
        <select id="search">
            SELECT * FROM users
            <where>
                <if test="name != nil">AND name = #{name}</if>
                <if test="ids != nil">AND id IN <foreach collection="ids" item="i" open="(" separator="," close=")">#{i}</foreach></if>
            </where>
        </select>
    </mapper>"#;

    fn registry() -> MapperRegistry {
        let registry = MapperRegistry::new();
        let mapper = MyBatisXmlParser::new(MAPPER).parse_mapper().unwrap();
        assert_eq!(registry.register_mapper(mapper).unwrap(), 4);
        registry
    }

    #[test]
    fn static_named_binding() {
        let registry = registry();
        let params = json!({"age": 30, "name": "amy"});
        let bound = registry.bound_sql("user.byNameAndAge", &params).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users WHERE name = ? AND age = ?");
        assert_eq!(bound.args, vec![json!("amy"), json!(30)]);
        assert_eq!(bound.stmt_type, StatementType::Select);
        assert_eq!(bound.statement, "user.byNameAndAge");
    }

    #[test]
    fn static_positional_and_scalar_binding() {
        let registry = registry();
        let positional = vec![json!("amy"), json!(30)];
        let bound = registry.bound_sql("user.byNameAndAge", &positional).unwrap();
        assert_eq!(bound.args, positional);

        let id = json!(5);
        let bound = registry.bound_sql("user.byId", &id).unwrap();
        assert_eq!(bound.args, vec![json!(5)]);

        let bound = registry.bound_sql("user.count", Params::None).unwrap();
        assert!(bound.args.is_empty());
    }

    #[test]
    fn arity_and_missing_names_are_binding_errors() {
        let registry = registry();
        let short = vec![json!("amy")];
        let err = registry.bound_sql("user.byNameAndAge", &short).unwrap_err();
        assert!(matches!(
            err,
            MapperError::Binding { ref statement, ref message }
                if statement == "user.byNameAndAge" && message.contains("got 1")
        ));

        let params = json!({"name": "amy"});
        let err = registry.bound_sql("user.byNameAndAge", &params).unwrap_err();
        assert!(matches!(err, MapperError::Binding { ref message, .. } if message.contains("`age`")));

        let err = registry.bound_sql("user.byId", Params::None).unwrap_err();
        assert!(matches!(err, MapperError::Binding { .. }));
    }

    #[test]
    fn dynamic_binding() {
        let registry = registry();
        let params = json!({"ids": [1, 2]});
        let bound = registry.bound_sql("user.search", &params).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users WHERE id IN (?,?)");
        assert_eq!(bound.args, vec![json!(1), json!(2)]);

        let params = json!({});
        let bound = registry.bound_sql("user.search", &params).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users");
    }

    #[test]
    fn dynamic_errors_name_the_statement() {
        let registry = MapperRegistry::new();
        let mapper = MyBatisXmlParser::new(
            r#"<mapper namespace="user">
                <select id="search">SELECT * FROM users <where><if test="1 == 1">AND name = #{x}</if></where></select>
                <select id="byIds">SELECT * FROM users WHERE id IN <foreach collection="ids" item="i" open="(" separator="," close=")">#{i}</foreach></select>
            </mapper>"#,
        )
        .parse_mapper()
        .unwrap();
        registry.register_mapper(mapper).unwrap();

        let params = json!({"name": "amy"});
        let err = registry.bound_sql("user.search", &params).unwrap_err();
        assert!(err.to_string().contains("user.search"), "{err}");
        assert!(matches!(
            err,
            MapperError::Statement { ref statement, ref source }
                if statement == "user.search"
                    && matches!(**source, MapperError::UnresolvedPlaceholder { ref name, .. } if name == "x")
        ));

        let params = json!({"ids": 3});
        let err = registry.bound_sql("user.byIds", &params).unwrap_err();
        assert!(err.to_string().contains("user.byIds"), "{err}");
        assert!(matches!(
            err,
            MapperError::Statement { ref source, .. }
                if matches!(**source, MapperError::NotACollection { .. })
        ));
    }

    #[test]
    fn static_invalid_path_names_the_statement() {
        let registry = MapperRegistry::new();
        let mapper = MyBatisXmlParser::new(
            r#"<mapper namespace="user"><select id="bad">SELECT #{a..b}</select></mapper>"#,
        )
        .parse_mapper()
        .unwrap();
        registry.register_mapper(mapper).unwrap();
        let params = json!({"a": 1});
        let err = registry.bound_sql("user.bad", &params).unwrap_err();
        assert!(matches!(
            err,
            MapperError::Statement { ref statement, ref source }
                if statement == "user.bad" && matches!(**source, MapperError::InvalidPath(_))
        ));
    }

    #[test]
    fn accessor_binding() {
        let registry = registry();
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), json!(9));
        let bound = registry.bound_sql("user.byId", &fields).unwrap();
        assert_eq!(bound.args, vec![json!(9)]);
    }

    #[test]
    fn unknown_statement() {
        let registry = registry();
        assert!(matches!(
            registry.bound_sql("user.nope", Params::None),
            Err(MapperError::StatementNotFound(id)) if id == "user.nope"
        ));
    }

    #[test]
    fn duplicate_registration_leaves_registry_untouched() {
        let registry = registry();
        let again = MyBatisXmlParser::new(
            r#"<mapper namespace="user"><select id="other">SELECT 1</select><select id="byId">SELECT 2</select></mapper>"#,
        )
        .parse_mapper()
        .unwrap();
        assert!(matches!(registry.register_mapper(again), Err(MapperError::Config(_))));
        assert!(!registry.contains("user.other"));
        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.statement_ids(),
            vec!["user.byId", "user.byNameAndAge", "user.count", "user.search"]
        );
    }

    fn select(namespace: &str, id: &str, sql: &str) -> SqlStatement {
        SqlStatement {
            namespace: namespace.to_string(),
            id: id.to_string(),
            stmt_type: StatementType::Select,
            parameter_type: None,
            result_type: None,
            result_map: None,
            sql: sql.to_string(),
            parameters: Vec::new(),
            dynamic_sql: None,
        }
    }

    #[test]
    fn single_statement_registration() {
        let registry = MapperRegistry::new();
        registry.register(select("stats", "total", "SELECT COUNT(*) FROM t")).unwrap();
        assert!(registry.contains("stats.total"));
        let bound = registry.bound_sql("stats.total", Params::None).unwrap();
        assert_eq!(bound.sql, "SELECT COUNT(*) FROM t");

        let err = registry.register(select("stats", "total", "SELECT 1")).unwrap_err();
        assert!(matches!(err, MapperError::Config(msg) if msg.contains("stats.total")));
        assert_eq!(registry.get("stats.total").unwrap().sql, "SELECT COUNT(*) FROM t");
    }

    #[test]
    fn duplicate_ids_within_one_mapper_are_rejected() {
        let registry = MapperRegistry::new();
        let mapper = Mapper {
            namespace: "stats".to_string(),
            statements: vec![
                select("stats", "a", "SELECT 1"),
                select("stats", "b", "SELECT 2"),
                select("stats", "a", "SELECT 3"),
            ],
            ..Default::default()
        };
        let err = registry.register_mapper(mapper).unwrap_err();
        assert!(matches!(err, MapperError::Config(msg) if msg.contains("stats.a")));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_binding_shares_statements() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let params = json!({"ids": (0..n).collect::<Vec<i32>>(), "name": "x"});
                    let bound = registry.bound_sql("user.search", &params).unwrap();
                    assert_eq!(bound.sql.matches('?').count(), bound.args.len());
                    bound.args.len()
                })
            })
            .collect();
        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), n + 1);
        }
    }
}
