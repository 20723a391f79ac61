//! 编排服务：请求入口、Trace 持久化与单阶段测试
//!
//! Orchestrator 持有 runner、已加载的资产包与 Trace 存储。每个请求可以带 asset_overrides（只对该请求生效）
//! 或 rerun（重放已存储 Trace 的问题，并把新 Trace 关联到父 Trace）。

pub mod runner;
pub mod stage_test;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assets::{apply_overrides, AssetBundle};
use crate::core::OrchestrationError;
use crate::stages::RunMode;
use crate::trace::{InMemoryTraceStore, Trace, TraceSink};

pub use runner::{OrchestrationRunner, RunRequest, RunResponse};
pub use stage_test::{run_stage_test, StageTestRequest, StageTestResponse};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunRequest {
    pub trace_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrateRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub asset_overrides: Option<Value>,
    #[serde(default)]
    pub rerun: Option<RerunRequest>,
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

impl OrchestrateRequest {
    pub fn ask(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.asset_overrides = Some(overrides);
        self
    }
}

pub struct Orchestrator {
    runner: OrchestrationRunner,
    assets: AssetBundle,
    store: Arc<InMemoryTraceStore>,
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl Orchestrator {
    pub fn new(runner: OrchestrationRunner, assets: AssetBundle, store: Arc<InMemoryTraceStore>) -> Self {
        Self {
            runner,
            assets,
            store,
            sinks: Vec::new(),
        }
    }

    /// 追加一个额外的 Trace 输出（如 JSONL 文件）
    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn assets(&self) -> &AssetBundle {
        &self.assets
    }

    pub fn runner(&self) -> &OrchestrationRunner {
        &self.runner
    }

    pub fn store(&self) -> &Arc<InMemoryTraceStore> {
        &self.store
    }

    /// 请求级资产：有 overrides 时返回合并后的副本
    fn effective_assets(&self, overrides: Option<&Value>) -> Result<AssetBundle, OrchestrationError> {
        match overrides {
            Some(overrides) => apply_overrides(&self.assets, overrides),
            None => Ok(self.assets.clone()),
        }
    }

    /// 处理一次编排请求
    ///
    /// 请求本身不合法（未知 rerun trace、非法 overrides）时返回 Err；
    /// 运行中的失败以 status = failed 的 RunResponse 返回，Trace 照常持久化。
    pub async fn orchestrate(
        &self,
        request: OrchestrateRequest,
    ) -> Result<RunResponse, OrchestrationError> {
        let (question, parent_trace_id) = match &request.rerun {
            Some(rerun) => {
                let parent = self.trace(&rerun.trace_id)?;
                (parent.question().to_string(), Some(rerun.trace_id.clone()))
            }
            None => (request.question.clone(), None),
        };
        let assets = self.effective_assets(request.asset_overrides.as_ref())?;
        if request.asset_overrides.is_some() {
            tracing::info!("request-level asset overrides applied");
        }

        let run = RunRequest {
            question,
            mode: request.mode,
            as_of: request.as_of,
            parent_trace_id,
        };
        let response = self.runner.run(&run, &assets).await;
        self.persist(&response.trace).await;
        Ok(response)
    }

    async fn persist(&self, trace: &Trace) {
        self.store.insert(trace.clone());
        for sink in &self.sinks {
            if let Err(e) = sink.append(trace).await {
                tracing::warn!(sink = sink.name(), trace_id = %trace.trace_id(), error = %e, "trace sink append failed");
            }
        }
    }

    pub fn trace(&self, trace_id: &str) -> Result<Trace, OrchestrationError> {
        self.store
            .get(trace_id)
            .ok_or_else(|| OrchestrationError::TraceNotFound(trace_id.to_string()))
    }

    /// 单独执行一个阶段
    pub async fn stage_test(
        &self,
        request: StageTestRequest,
    ) -> Result<StageTestResponse, OrchestrationError> {
        let assets = self.effective_assets(request.asset_overrides.as_ref())?;
        let baseline = match &request.baseline_trace_id {
            Some(id) => Some(self.trace(id)?),
            None => None,
        };
        run_stage_test(&self.runner, &request, &assets, baseline.as_ref()).await
    }
}
