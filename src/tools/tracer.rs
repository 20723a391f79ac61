//! 工具执行追踪
//!
//! 每次调用 begin 得到 span，结束时 finish 写入一条 ToolExecutionRecord；未 finish 就被丢弃的 span
//! （调用随阶段一起被取消）以 cancelled 记录。记录按 trace_id 归档，请求结束时用 drain 整体取走；
//! 另有固定容量的环形队列为 ToolSelector 提供历史平均耗时。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    CacheHit,
    Error,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub call_id: String,
    pub trace_id: String,
    pub tool_type: String,
    pub operation: String,
    pub cache_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: ToolOutcome,
    pub rows: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct TracerState {
    /// 最近的调用，供平均耗时统计
    recent: VecDeque<ToolExecutionRecord>,
    /// 尚未被 drain 的请求
    open: HashMap<String, Vec<ToolExecutionRecord>>,
    open_order: VecDeque<String>,
}

impl TracerState {
    fn store(&mut self, capacity: usize, record: ToolExecutionRecord) {
        if self.recent.len() >= capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(record.clone());

        if !self.open.contains_key(&record.trace_id) {
            // 从未 drain 的请求（例如直接调用执行器）不能无限累积
            while self.open_order.len() >= capacity {
                if let Some(stale) = self.open_order.pop_front() {
                    if let Some(dropped) = self.open.remove(&stale) {
                        tracing::warn!(
                            trace_id = %stale,
                            records = dropped.len(),
                            "discarding undrained tool records"
                        );
                    }
                }
            }
            self.open_order.push_back(record.trace_id.clone());
        }
        self.open.entry(record.trace_id.clone()).or_default().push(record);
    }
}

/// 进行中的调用
#[derive(Debug)]
pub struct ToolSpan {
    call_id: String,
    trace_id: String,
    tool_type: String,
    operation: String,
    cache_key: String,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Arc<Mutex<TracerState>>,
    capacity: usize,
    finished: bool,
}

impl ToolSpan {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    fn close(&mut self, outcome: ToolOutcome, rows: usize, error: Option<String>) -> ToolExecutionRecord {
        self.finished = true;
        let record = ToolExecutionRecord {
            call_id: self.call_id.clone(),
            trace_id: self.trace_id.clone(),
            tool_type: self.tool_type.clone(),
            operation: self.operation.clone(),
            cache_key: self.cache_key.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            outcome,
            rows,
            error,
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.store(self.capacity, record.clone());
        record
    }
}

impl Drop for ToolSpan {
    fn drop(&mut self) {
        if !self.finished {
            self.close(
                ToolOutcome::Cancelled,
                0,
                Some("call cancelled before completion".to_string()),
            );
        }
    }
}

pub struct ExecutionTracer {
    state: Arc<Mutex<TracerState>>,
    capacity: usize,
}

impl ExecutionTracer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TracerState::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn begin(&self, trace_id: &str, call: &ToolCall) -> ToolSpan {
        ToolSpan {
            call_id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            tool_type: call.tool_type.clone(),
            operation: call.operation.clone(),
            cache_key: call.cache_key.clone(),
            started_at: Utc::now(),
            started: Instant::now(),
            state: Arc::clone(&self.state),
            capacity: self.capacity,
            finished: false,
        }
    }

    pub fn finish(
        &self,
        mut span: ToolSpan,
        outcome: ToolOutcome,
        rows: usize,
        error: Option<String>,
    ) -> ToolExecutionRecord {
        span.close(outcome, rows, error)
    }

    /// 某次请求目前的调用记录（按完成顺序），不取走
    pub fn records_for(&self, trace_id: &str) -> Vec<ToolExecutionRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.open.get(trace_id).cloned().unwrap_or_default()
    }

    /// 取走某次请求的全部调用记录
    pub fn drain(&self, trace_id: &str) -> Vec<ToolExecutionRecord> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.open_order.retain(|id| id != trace_id);
        state.open.remove(trace_id).unwrap_or_default()
    }

    /// 实际调用（不含缓存命中与取消）的平均耗时
    pub fn average_duration_ms(&self, tool_type: &str) -> Option<u64> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (sum, count) = state
            .recent
            .iter()
            .filter(|r| {
                r.tool_type == tool_type
                    && !matches!(r.outcome, ToolOutcome::CacheHit | ToolOutcome::Cancelled)
            })
            .fold((0u64, 0u64), |(s, c), r| (s + r.duration_ms, c + 1));
        (count > 0).then(|| sum / count)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
