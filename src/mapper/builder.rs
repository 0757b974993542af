use std::collections::HashSet;
use std::fs;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

use log::{debug, info};
use xml::reader::XmlEvent;
use xml::EventReader;

use super::error::{MapperError, Result};
use super::parse_helper::search_matched_attr;
use super::parser::{MyBatisXmlParser, DEFAULT_INCLUDE_DEPTH};
use super::registry::MapperRegistry;

/// XML 根元素形态
#[derive(Debug, PartialEq)]
enum Document {
    /// 单个 `<mapper>`
    Mapper,
    /// `<configuration><mappers>` 或 `<mappers>`，携带 `resource` 列表
    Resources(Vec<String>),
}

/// 从 XML 配置加载语句到注册表
#[derive(Debug, Clone)]
pub struct MapperBuilder {
    base_dir: Option<PathBuf>,
    include_depth: usize,
}

impl Default for MapperBuilder {
    fn default() -> Self {
        MapperBuilder {
            base_dir: None,
            include_depth: DEFAULT_INCLUDE_DEPTH,
        }
    }
}

impl MapperBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 相对 `resource` 的根目录；默认相对于引用它的文件
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn include_depth(mut self, depth: usize) -> Self {
        self.include_depth = depth;
        self
    }

    /// 加载入口文件，返回新的注册表
    pub fn build(&self, path: impl AsRef<Path>) -> Result<MapperRegistry> {
        let registry = MapperRegistry::new();
        self.load(&registry, path)?;
        Ok(registry)
    }

    /// 加载入口文件到已有注册表，返回注册的语句数
    pub fn load(&self, registry: &MapperRegistry, path: impl AsRef<Path>) -> Result<usize> {
        let mut visited = HashSet::new();
        let count = self.load_file(registry, path.as_ref(), &mut visited)?;
        info!("loaded {count} statements from {}", path.as_ref().display());
        Ok(count)
    }

    /// 从内存中的 XML 加载；`resource` 相对于 `base_dir`（未设置时为当前目录）
    pub fn load_str(&self, registry: &MapperRegistry, xml: &str) -> Result<usize> {
        let dir = self.base_dir.clone().unwrap_or_default();
        let mut visited = HashSet::new();
        self.load_document(registry, xml.as_bytes(), "<memory>", &dir, &mut visited)
    }

    fn load_file(
        &self,
        registry: &MapperRegistry,
        path: &Path,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<usize> {
        let canonical = fs::canonicalize(path).map_err(|source| MapperError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if !visited.insert(canonical.clone()) {
            return Err(MapperError::config(format!(
                "{} is included more than once",
                path.display()
            )));
        }
        let bytes = fs::read(&canonical).map_err(|source| MapperError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let dir = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => canonical.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        self.load_document(registry, &bytes, &path.display().to_string(), &dir, visited)
    }

    fn load_document(
        &self,
        registry: &MapperRegistry,
        bytes: &[u8],
        location: &str,
        dir: &Path,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<usize> {
        match scan_document(bytes, location)? {
            Document::Mapper => {
                let mapper = MyBatisXmlParser::new_from_bytes(bytes)
                    .with_location(location)
                    .with_include_depth(self.include_depth)
                    .parse_mapper()?;
                debug!("{location}: mapper {}", mapper.namespace);
                registry.register_mapper(mapper)
            }
            Document::Resources(resources) => {
                let mut count = 0;
                for resource in resources {
                    count += self.load_file(registry, &dir.join(resource), visited)?;
                }
                Ok(count)
            }
        }
    }
}

/// 识别根元素，配置文件顺带收集 `<mappers><mapper resource>` 列表
fn scan_document(bytes: &[u8], location: &str) -> Result<Document> {
    let parser = EventReader::new(BufReader::new(Cursor::new(bytes)));
    let mut root: Option<String> = None;
    let mut in_mappers = false;
    let mut resources = Vec::new();

    for e in parser {
        match e {
            Ok(XmlEvent::StartElement {
                name, attributes, ..
            }) => {
                let element_name = name.local_name.as_str();
                if root.is_none() {
                    match element_name {
                        "mapper" => return Ok(Document::Mapper),
                        "configuration" => {}
                        "mappers" => in_mappers = true,
                        other => {
                            return Err(MapperError::config(format!(
                                "{location}: unsupported root element <{other}>"
                            )))
                        }
                    }
                    root = Some(element_name.to_string());
                } else if element_name == "mappers" {
                    in_mappers = true;
                } else if element_name == "mapper" && in_mappers {
                    let mut resource = None;
                    search_matched_attr(&attributes, "resource", |attr| {
                        resource = Some(attr.value.trim().to_string());
                    });
                    match resource {
                        Some(resource) if !resource.is_empty() => resources.push(resource),
                        _ => {
                            return Err(MapperError::config(format!(
                                "{location}: <mapper> entries need a `resource` attribute"
                            )))
                        }
                    }
                }
            }
            Ok(XmlEvent::EndElement { name }) if name.local_name == "mappers" => {
                in_mappers = false;
            }
            Ok(_) => {}
            Err(e) => return Err(MapperError::xml(location, e)),
        }
    }

    match root {
        Some(_) => Ok(Document::Resources(resources)),
        None => Err(MapperError::config(format!("{location}: empty document"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    /// 每个测试独立的临时目录
    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sqlmapper-{}-{}-{}",
            name,
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    const USER_MAPPER: &str = r#"<mapper namespace="user">
        <select id="byId">SELECT * FROM users WHERE id = #{id}</select>
    </mapper>"#;

    const ORDER_MAPPER: &str = r#"<mapper namespace="order">
        <select id="byUser">SELECT * FROM orders WHERE user_id = #{userId}</select>
        <delete id="purge">DELETE FROM orders</delete>
    </mapper>"#;

    #[test]
    fn scans_root_shapes() {
        assert_eq!(scan_document(USER_MAPPER.as_bytes(), "m").unwrap(), Document::Mapper);
        let config = r#"<?xml version="1.0"?>
            <configuration>
                <settings><setting name="cacheEnabled" value="true"/></settings>
                <mappers>
                    <mapper resource="a.xml"/>
                    <mapper resource="dir/b.xml"/>
                </mappers>
            </configuration>"#;
        assert_eq!(
            scan_document(config.as_bytes(), "c").unwrap(),
            Document::Resources(vec!["a.xml".to_string(), "dir/b.xml".to_string()])
        );
        assert!(matches!(
            scan_document(b"<beans/>", "x"),
            Err(MapperError::Config(_))
        ));
        assert!(matches!(
            scan_document(b"<mappers><mapper/></mappers>", "x"),
            Err(MapperError::Config(_))
        ));
    }

    #[test]
    fn loads_configuration_recursively() {
        let dir = temp_dir("config");
        write(&dir, "mappers/user.xml", USER_MAPPER);
        write(&dir, "mappers/order.xml", ORDER_MAPPER);
        write(
            &dir,
            "mappers/all.xml",
            r#"<mappers><mapper resource="user.xml"/><mapper resource="order.xml"/></mappers>"#,
        );
        let config = write(
            &dir,
            "mybatis-config.xml",
            r#"<configuration><mappers><mapper resource="mappers/all.xml"/></mappers></configuration>"#,
        );

        let registry = MapperBuilder::new().build(&config).unwrap();
        assert_eq!(
            registry.statement_ids(),
            vec!["order.byUser", "order.purge", "user.byId"]
        );
        let params = json!({"userId": 4});
        let bound = registry.bound_sql("order.byUser", &params).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM orders WHERE user_id = ?");
    }

    #[test]
    fn base_dir_overrides_relative_resolution() {
        let dir = temp_dir("base");
        write(&dir, "user.xml", USER_MAPPER);
        let registry = MapperRegistry::new();
        let count = MapperBuilder::new()
            .base_dir(&dir)
            .load_str(&registry, r#"<mappers><mapper resource="user.xml"/></mappers>"#)
            .unwrap();
        assert_eq!(count, 1);
        assert!(registry.contains("user.byId"));
    }

    #[test]
    fn duplicate_ids_across_files_fail() {
        let dir = temp_dir("dup");
        write(&dir, "a.xml", USER_MAPPER);
        write(&dir, "b.xml", &USER_MAPPER.replace("SELECT *", "SELECT id"));
        let config = write(
            &dir,
            "config.xml",
            r#"<mappers><mapper resource="a.xml"/><mapper resource="b.xml"/></mappers>"#,
        );
        let err = MapperBuilder::new().build(&config).unwrap_err();
        assert!(matches!(err, MapperError::Config(msg) if msg.contains("user.byId")));
    }

    #[test]
    fn resource_cycles_fail() {
        let dir = temp_dir("cycle");
        write(&dir, "a.xml", r#"<mappers><mapper resource="b.xml"/></mappers>"#);
        let b = write(&dir, "b.xml", r#"<mappers><mapper resource="a.xml"/></mappers>"#);
        let err = MapperBuilder::new().build(&b).unwrap_err();
        assert!(matches!(err, MapperError::Config(msg) if msg.contains("more than once")));
    }

    #[test]
    fn missing_resource_is_io_error() {
        let dir = temp_dir("missing");
        let config = write(&dir, "config.xml", r#"<mappers><mapper resource="nope.xml"/></mappers>"#);
        let err = MapperBuilder::new().build(&config).unwrap_err();
        assert!(matches!(err, MapperError::Io { path, .. } if path.ends_with("nope.xml")));
    }

    #[test]
    fn include_depth_is_forwarded() {
        let registry = MapperRegistry::new();
        let err = MapperBuilder::new()
            .include_depth(0)
            .load_str(
                &registry,
                r#"<mapper namespace="ns"><sql id="c">a</sql><select id="s">SELECT <include refid="c"/></select></mapper>"#,
            )
            .unwrap_err();
        assert!(matches!(err, MapperError::Config(_)));
        assert!(registry.is_empty());
    }
}
