//! 工具注册表
//!
//! 所有数据后端实现 Tool trait（tool_type / backend / description / execute），由 ToolRegistry 按 tool_type 注册与查找。
//! 注册顺序会被保留，ToolSelector 平分时以此为次序。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::result::{ResultSet, ToolContext};
use crate::core::ToolError;
use crate::plan::Backend;

/// 数据工具 trait：声明后端类别与缓存 TTL，异步执行（params 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具类型（缓存键与选择器使用）
    fn tool_type(&self) -> &str;

    fn backend(&self) -> Backend;

    fn description(&self) -> &str;

    /// 工具自身的缓存 TTL；None 表示使用缓存默认值
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    async fn execute(
        &self,
        operation: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Result<ResultSet, ToolError>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具后注册者覆盖前者，但保留原有位置
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let tool_type = tool.tool_type().to_string();
        if !self.tools.contains_key(&tool_type) {
            self.order.push(tool_type.clone());
        }
        self.tools.insert(tool_type, tool);
    }

    pub fn get(&self, tool_type: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_type).cloned()
    }

    pub fn contains(&self, tool_type: &str) -> bool {
        self.tools.contains_key(tool_type)
    }

    /// 按注册顺序
    pub fn tool_types(&self) -> Vec<String> {
        self.order.clone()
    }

    /// 某后端的所有工具（按注册顺序）
    pub fn of_backend(&self, backend: Backend) -> Vec<String> {
        self.order
            .iter()
            .filter(|t| self.tools.get(*t).map(|tool| tool.backend()) == Some(backend))
            .cloned()
            .collect()
    }

    /// (tool_type, backend, description) 列表
    pub fn describe(&self) -> Vec<(String, Backend, String)> {
        self.order
            .iter()
            .filter_map(|t| {
                self.tools
                    .get(t)
                    .map(|tool| (t.clone(), tool.backend(), tool.description().to_string()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
