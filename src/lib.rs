//! MyBatis 风格的 XML 映射模板：加载 `<mapper>` 文件，
//! 按调用参数把动态SQL渲染成带 `?` 占位符的语句和有序参数列表。

pub mod mapper;
pub use mapper::*;
