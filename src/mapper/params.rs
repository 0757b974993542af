use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

/// 结构体参数的字段访问能力，由调用方实现
pub trait ParamsAccess {
    /// 获取单个字段值，不存在时返回 `None`
    fn get_param(&self, key: &str) -> Option<Value>;
}

impl ParamsAccess for HashMap<String, Value> {
    fn get_param(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }
}

impl ParamsAccess for Map<String, Value> {
    fn get_param(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }
}

/// 一次调用的入参形态
#[derive(Clone, Copy, Default)]
pub enum Params<'p> {
    #[default]
    None,
    Scalar(&'p Value),
    Positional(&'p [Value]),
    Named(&'p Map<String, Value>),
    Accessor(&'p dyn ParamsAccess),
}

impl<'p> Params<'p> {
    /// 按 JSON 形态推断：对象为命名参数，数组为位置参数，其余为单值
    pub fn from_value(value: &'p Value) -> Self {
        match value {
            Value::Null => Params::None,
            Value::Array(items) => Params::Positional(items),
            Value::Object(map) => Params::Named(map),
            scalar => Params::Scalar(scalar),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Params::None => "none",
            Params::Scalar(_) => "scalar",
            Params::Positional(_) => "positional",
            Params::Named(_) => "named",
            Params::Accessor(_) => "accessor",
        }
    }

    /// 按名称查找顶层参数
    pub(crate) fn lookup(&self, name: &str) -> Option<Value> {
        match self {
            Params::None => None,
            Params::Scalar(value) => Some((*value).clone()),
            Params::Positional(items) => match name {
                "list" | "array" | "_parameter" => Some(Value::Array(items.to_vec())),
                _ => None,
            },
            Params::Named(map) => match map.get(name) {
                Some(value) => Some(value.clone()),
                None if name == "_parameter" => Some(Value::Object((*map).clone())),
                None => None,
            },
            Params::Accessor(access) => access.get_param(name),
        }
    }
}

impl<'p> From<&'p Value> for Params<'p> {
    fn from(value: &'p Value) -> Self {
        Params::from_value(value)
    }
}

impl<'p> From<&'p [Value]> for Params<'p> {
    fn from(items: &'p [Value]) -> Self {
        Params::Positional(items)
    }
}

impl<'p> From<&'p Vec<Value>> for Params<'p> {
    fn from(items: &'p Vec<Value>) -> Self {
        Params::Positional(items)
    }
}

impl<'p> From<&'p Map<String, Value>> for Params<'p> {
    fn from(map: &'p Map<String, Value>) -> Self {
        Params::Named(map)
    }
}

impl<'p> From<&'p HashMap<String, Value>> for Params<'p> {
    fn from(map: &'p HashMap<String, Value>) -> Self {
        Params::Accessor(map)
    }
}

/// 参数解析环境；foreach 节点会在其上派生一个带循环绑定的子环境
pub struct ParamContext<'a> {
    params: Params<'a>,
    parent: Option<&'a ParamContext<'a>>,
    items: BTreeMap<String, Value>,
    indexes: BTreeMap<String, Value>,
}

impl<'a> ParamContext<'a> {
    pub fn new(params: Params<'a>) -> Self {
        ParamContext {
            params,
            parent: None,
            items: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    /// 为一次 foreach 求值派生子环境，绑定在迭代间原地覆盖
    pub fn foreach_scope(&'a self) -> ParamContext<'a> {
        ParamContext {
            params: self.params,
            parent: Some(self),
            items: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> Params<'a> {
        self.params
    }

    pub fn bind_item(&mut self, name: &str, value: Value) {
        self.items.insert(name.to_string(), value);
    }

    pub fn bind_index(&mut self, name: &str, value: Value) {
        self.indexes.insert(name.to_string(), value);
    }

    /// 循环绑定优先（由内向外），然后是入参
    pub fn lookup_root(&self, name: &str) -> Option<Value> {
        self.lookup_binding(name)
            .or_else(|| self.params.lookup(name))
    }

    fn lookup_binding(&self, name: &str) -> Option<Value> {
        self.items
            .get(name)
            .or_else(|| self.indexes.get(name))
            .cloned()
            .or_else(|| self.parent.and_then(|parent| parent.lookup_binding(name)))
    }
}
