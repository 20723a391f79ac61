//! 工具调用与结果类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::cache::ToolResultCache;
use crate::core::ToolError;

/// 工具返回的类型化结果集
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    /// 后端附加信息（指标聚合值、图节点等）
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Map<String, Value>>) -> Self {
        Self {
            columns,
            rows,
            meta: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// 单次调用的请求级上下文
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub trace_id: String,
    /// 相对时间窗口的终点
    pub as_of: DateTime<Utc>,
    /// 请求截止时间；调用超时取它与工具超时中较早者
    pub deadline: Option<tokio::time::Instant>,
}

impl ToolContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            as_of: Utc::now(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = as_of;
        self
    }
}

/// 一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_type: String,
    pub operation: String,
    pub params: Value,
    pub cache_key: String,
}

impl ToolCall {
    pub fn new(tool_type: impl Into<String>, operation: impl Into<String>, params: Value) -> Self {
        let tool_type = tool_type.into();
        let operation = operation.into();
        let cache_key = ToolResultCache::generate_key(&tool_type, &operation, &params);
        Self {
            tool_type,
            operation,
            params,
            cache_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Live,
}

/// 工具调用结果；失败时 error 给出是否可重试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_type: String,
    pub operation: String,
    pub success: bool,
    pub data: Option<ResultSet>,
    pub error: Option<ToolError>,
    pub source: ResultSource,
    pub duration_ms: u64,
    pub cache_key: String,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, data: ResultSet, source: ResultSource, duration_ms: u64) -> Self {
        Self {
            tool_type: call.tool_type.clone(),
            operation: call.operation.clone(),
            success: true,
            data: Some(data),
            error: None,
            source,
            duration_ms,
            cache_key: call.cache_key.clone(),
        }
    }

    pub fn failed(call: &ToolCall, error: ToolError, duration_ms: u64) -> Self {
        Self {
            tool_type: call.tool_type.clone(),
            operation: call.operation.clone(),
            success: false,
            data: None,
            error: Some(error),
            source: ResultSource::Live,
            duration_ms,
            cache_key: call.cache_key.clone(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.data.as_ref().map(|d| d.row_count()).unwrap_or(0)
    }

    pub fn is_retryable_failure(&self) -> bool {
        !self.success && self.error.as_ref().map(|e| e.retryable).unwrap_or(false)
    }
}
