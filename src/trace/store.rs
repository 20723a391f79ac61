//! Trace 持久化
//!
//! 每个请求结束后把完整 Trace 追加到若干 TraceSink。内存存储按保留上限淘汰最旧的 Trace，
//! 供 GET /traces/:id、rerun 与 stage-test 的基线查询；JSONL 文件每行一个 Trace。

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::Trace;
use crate::core::OrchestrationError;

#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn append(&self, trace: &Trace) -> Result<(), OrchestrationError>;

    fn name(&self) -> &str;
}

struct StoreInner {
    order: VecDeque<String>,
    traces: HashMap<String, Trace>,
}

/// 内存 Trace 存储（按插入顺序保留最近 retention 条）
pub struct InMemoryTraceStore {
    retention: usize,
    inner: Mutex<StoreInner>,
}

impl InMemoryTraceStore {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            inner: Mutex::new(StoreInner {
                order: VecDeque::new(),
                traces: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, trace: Trace) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = trace.trace_id().to_string();
        if inner.traces.insert(id.clone(), trace).is_none() {
            inner.order.push_back(id);
        }
        while inner.order.len() > self.retention {
            if let Some(oldest) = inner.order.pop_front() {
                inner.traces.remove(&oldest);
                tracing::debug!(trace_id = %oldest, "trace evicted from store");
            }
        }
    }

    pub fn get(&self, trace_id: &str) -> Option<Trace> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.traces.get(trace_id).cloned()
    }

    /// 最近的 Trace id（新的在前）
    pub fn recent_ids(&self, limit: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.order.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TraceSink for InMemoryTraceStore {
    async fn append(&self, trace: &Trace) -> Result<(), OrchestrationError> {
        self.insert(trace.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// JSON Lines 文件：每行一个完整 Trace
pub struct JsonlTraceSink {
    path: PathBuf,
}

impl JsonlTraceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TraceSink for JsonlTraceSink {
    async fn append(&self, trace: &Trace) -> Result<(), OrchestrationError> {
        let io_err =
            |e: std::io::Error| OrchestrationError::Serialization(format!("{}: {e}", self.path.display()));

        let mut line = serde_json::to_string(trace)?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::RunMode;
    use crate::trace::{RunOutcome, RunStatus};

    fn finished(id: &str) -> Trace {
        let mut trace = Trace::new(id, "q", RunMode::Fast, chrono::Utc::now(), None);
        trace
            .finish(RunStatus::Success, RunOutcome::Direct, None)
            .unwrap();
        trace
    }

    #[test]
    fn test_store_evicts_oldest_beyond_retention() {
        let store = InMemoryTraceStore::new(2);
        store.insert(finished("a"));
        store.insert(finished("b"));
        store.insert(finished("c"));
        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
        assert_eq!(store.recent_ids(10), vec!["c".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_one_line_per_trace() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlTraceSink::new(dir.path().join("logs/traces.jsonl"));
        sink.append(&finished("a")).await.unwrap();
        sink.append(&finished("b")).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Trace = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.trace_id(), "b");
        assert_eq!(second.status(), Some(RunStatus::Success));
    }
}
