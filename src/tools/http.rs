//! HTTP 数据源工具
//!
//! 将调用以 JSON POST 到外部服务，响应体即 ResultSet。
//! 连接失败、超时、5xx 与 429 视为可重试，其余 4xx 与响应解码失败视为不可重试。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::registry::Tool;
use super::result::{ResultSet, ToolContext};
use crate::config::HttpToolEntry;
use crate::core::{OrchestrationError, ToolError};
use crate::plan::Backend;

pub struct HttpSourceTool {
    tool_type: String,
    backend: Backend,
    url: String,
    description: String,
    ttl: Option<Duration>,
    client: reqwest::Client,
}

impl HttpSourceTool {
    pub fn new(tool_type: &str, backend: Backend, url: &str, timeout: Duration) -> Result<Self, OrchestrationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestrationError::Config(format!("http client for {tool_type}: {e}")))?;
        Ok(Self {
            tool_type: tool_type.to_string(),
            backend,
            url: url.to_string(),
            description: format!("HTTP {} source at {}", backend, url),
            ttl: None,
            client,
        })
    }

    pub fn from_entry(entry: &HttpToolEntry, timeout: Duration) -> Result<Self, OrchestrationError> {
        let backend = Backend::parse(&entry.backend).ok_or_else(|| {
            OrchestrationError::Config(format!(
                "tool {}: unknown backend '{}'",
                entry.tool_type, entry.backend
            ))
        })?;
        let mut tool = Self::new(&entry.tool_type, backend, &entry.url, timeout)?;
        if let Some(description) = &entry.description {
            tool.description = description.clone();
        }
        tool.ttl = entry.ttl_secs.map(Duration::from_secs);
        Ok(tool)
    }
}

#[async_trait]
impl Tool for HttpSourceTool {
    fn tool_type(&self) -> &str {
        &self.tool_type
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.ttl
    }

    async fn execute(
        &self,
        operation: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Result<ResultSet, ToolError> {
        let body = json!({
            "operation": operation,
            "params": params,
            "trace_id": ctx.trace_id,
            "as_of": ctx.as_of.to_rfc3339(),
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ToolError::retryable(format!("request failed: {e}"))
                } else {
                    ToolError::fatal(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolError::retryable(format!("upstream returned {status}")));
        }
        if !status.is_success() {
            return Err(ToolError::fatal(format!("upstream returned {status}")));
        }

        response
            .json::<ResultSet>()
            .await
            .map_err(|e| ToolError::fatal(format!("invalid result set: {e}")))
    }
}
