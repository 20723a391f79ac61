//! 工具执行器
//!
//! 持有 ToolRegistry、结果缓存与执行追踪。execute(call, ctx) 先查缓存，未命中再在超时内调用工具，
//! 成功结果按 TTL 写回缓存；失败与超时转为带 retryable 标记的 ToolResult，不返回 Err。
//! 每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::cache::ToolResultCache;
use super::registry::{Tool, ToolRegistry};
use super::result::{ResultSource, ToolCall, ToolContext, ToolResult};
use super::tracer::{ExecutionTracer, ToolOutcome};
use crate::core::ToolError;

pub struct ToolExecutor {
    registry: ToolRegistry,
    cache: Arc<ToolResultCache>,
    tracer: Arc<ExecutionTracer>,
    timeout: Duration,
    ttl_overrides: HashMap<String, Duration>,
    max_in_flight: usize,
    in_flight: Mutex<HashMap<String, usize>>,
}

/// 在途计数守卫：调用结束（包括被外层取消）时递减
struct InFlightGuard<'a> {
    counts: &'a Mutex<HashMap<String, usize>>,
    tool_type: String,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counts: &'a Mutex<HashMap<String, usize>>, tool_type: &str) -> Self {
        let mut map = counts.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(tool_type.to_string()).or_insert(0) += 1;
        Self {
            counts,
            tool_type: tool_type.to_string(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = map.get_mut(&self.tool_type) {
            *n = n.saturating_sub(1);
        }
    }
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        cache: Arc<ToolResultCache>,
        tracer: Arc<ExecutionTracer>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            tracer,
            timeout,
            ttl_overrides: HashMap::new(),
            max_in_flight: 8,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// 按 tool_type 覆盖缓存 TTL（优先级高于工具自身声明）
    pub fn with_ttl_overrides(mut self, overrides: HashMap<String, Duration>) -> Self {
        self.ttl_overrides = overrides;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// 执行一次调用：缓存命中直接返回 source=cache；未知工具视为不可重试失败
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let span = self.tracer.begin(&ctx.trace_id, call);
        let start = Instant::now();

        if let Some(data) = self.cache.get(&call.cache_key).await {
            let rows = data.row_count();
            let result = ToolResult::ok(call, data, ResultSource::Cache, elapsed_ms(start));
            self.tracer.finish(span, ToolOutcome::CacheHit, rows, None);
            audit(call, &ctx.trace_id, "cache_hit", result.duration_ms);
            return result;
        }

        let Some(tool) = self.registry.get(&call.tool_type) else {
            let error = ToolError::fatal(format!("Unknown tool: {}", call.tool_type));
            self.tracer
                .finish(span, ToolOutcome::Error, 0, Some(error.message.clone()));
            audit(call, &ctx.trace_id, "unknown_tool", elapsed_ms(start));
            return ToolResult::failed(call, error, elapsed_ms(start));
        };

        let limit = tokio::time::Instant::now() + self.timeout;
        let deadline = ctx.deadline.map(|d| d.min(limit)).unwrap_or(limit);

        let outcome = {
            let _guard = InFlightGuard::enter(&self.in_flight, &call.tool_type);
            tokio::time::timeout_at(deadline, tool.execute(&call.operation, &call.params, ctx)).await
        };
        let duration_ms = elapsed_ms(start);

        match outcome {
            Ok(Ok(data)) => {
                let ttl = self.ttl_for(tool.as_ref());
                self.cache.set(&call.cache_key, data.clone(), Some(ttl)).await;
                let rows = data.row_count();
                self.tracer.finish(span, ToolOutcome::Success, rows, None);
                audit(call, &ctx.trace_id, "ok", duration_ms);
                ToolResult::ok(call, data, ResultSource::Live, duration_ms)
            }
            Ok(Err(error)) => {
                self.tracer
                    .finish(span, ToolOutcome::Error, 0, Some(error.message.clone()));
                audit(call, &ctx.trace_id, "error", duration_ms);
                tracing::warn!(
                    tool = %call.tool_type,
                    retryable = error.retryable,
                    error = %error.message,
                    "tool call failed"
                );
                ToolResult::failed(call, error, duration_ms)
            }
            Err(_) => {
                let error = ToolError::retryable(format!(
                    "{} timed out after {}ms",
                    call.tool_type, duration_ms
                ));
                self.tracer
                    .finish(span, ToolOutcome::Timeout, 0, Some(error.message.clone()));
                audit(call, &ctx.trace_id, "timeout", duration_ms);
                ToolResult::failed(call, error, duration_ms)
            }
        }
    }

    /// 便捷入口：按 tool_type / operation / params 构造调用并执行
    pub async fn invoke(
        &self,
        tool_type: &str,
        operation: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> ToolResult {
        let call = ToolCall::new(tool_type, operation, params);
        self.execute(&call, ctx).await
    }

    /// TTL 优先级：配置覆盖 > 工具声明 > 缓存默认
    fn ttl_for(&self, tool: &dyn Tool) -> Duration {
        self.ttl_overrides
            .get(tool.tool_type())
            .copied()
            .or_else(|| tool.cache_ttl())
            .unwrap_or_else(|| self.cache.default_ttl())
    }

    /// 当前负载：在途调用数 / max_in_flight，截断到 [0, 1]
    pub fn load(&self, tool_type: &str) -> f64 {
        let map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let n = map.get(tool_type).copied().unwrap_or(0);
        (n as f64 / self.max_in_flight as f64).clamp(0.0, 1.0)
    }

    pub async fn is_cached(&self, call: &ToolCall) -> bool {
        self.cache.contains(&call.cache_key).await
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ToolResultCache> {
        &self.cache
    }

    pub fn tracer(&self) -> &Arc<ExecutionTracer> {
        &self.tracer
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn audit(call: &ToolCall, trace_id: &str, outcome: &str, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "trace_id": trace_id,
        "tool": call.tool_type,
        "operation": call.operation,
        "ok": outcome == "ok" || outcome == "cache_hit",
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(&call.params),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Backend;
    use crate::tools::ResultSet;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        calls: AtomicUsize,
        delay: Duration,
        ttl: Option<Duration>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn tool_type(&self) -> &str {
            "counting"
        }

        fn backend(&self) -> Backend {
            Backend::Tabular
        }

        fn description(&self) -> &str {
            "counts calls"
        }

        fn cache_ttl(&self) -> Option<Duration> {
            self.ttl
        }

        async fn execute(
            &self,
            _operation: &str,
            _params: &Value,
            _ctx: &ToolContext,
        ) -> Result<ResultSet, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut row = serde_json::Map::new();
            row.insert("n".into(), json!(1));
            Ok(ResultSet::new(vec!["n".into()], vec![row]))
        }
    }

    fn executor(tool: Arc<CountingTool>, timeout: Duration) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        ToolExecutor::new(
            registry,
            Arc::new(ToolResultCache::new(16, Duration::from_secs(60))),
            Arc::new(ExecutionTracer::new(100)),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() {
        let tool = Arc::new(CountingTool {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
            ttl: None,
        });
        let exec = executor(tool.clone(), Duration::from_secs(1));
        let ctx = ToolContext::new("t1");
        let first = exec.invoke("counting", "query_rows", json!({"keywords": ["B", "a"]}), &ctx).await;
        let second = exec.invoke("counting", "query_rows", json!({"keywords": ["a", "b"]}), &ctx).await;
        assert_eq!(first.source, ResultSource::Live);
        assert_eq!(second.source, ResultSource::Cache);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.tracer().records_for("t1").len(), 2);
    }

    #[tokio::test]
    async fn test_ttl_override_wins() {
        let tool = Arc::new(CountingTool {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
            ttl: Some(Duration::from_secs(600)),
        });
        let exec = executor(tool.clone(), Duration::from_secs(1)).with_ttl_overrides(
            [("counting".to_string(), Duration::from_millis(10))].into_iter().collect(),
        );
        let ctx = ToolContext::new("t");
        exec.invoke("counting", "op", json!({}), &ctx).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let again = exec.invoke("counting", "op", json!({}), &ctx).await;
        assert_eq!(again.source, ResultSource::Live);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable_failure() {
        let tool = Arc::new(CountingTool {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
            ttl: None,
        });
        let exec = executor(tool, Duration::from_millis(20));
        let result = exec.invoke("counting", "op", json!({}), &ToolContext::new("t")).await;
        assert!(!result.success);
        assert!(result.is_retryable_failure());
        assert_eq!(exec.load("counting"), 0.0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fatal() {
        let tool = Arc::new(CountingTool {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
            ttl: None,
        });
        let exec = executor(tool, Duration::from_secs(1));
        let result = exec.invoke("nope", "op", json!({}), &ToolContext::new("t")).await;
        assert!(!result.success);
        assert_eq!(result.error.map(|e| e.retryable), Some(false));
    }
}
