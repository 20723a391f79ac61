//! 运行轨迹
//!
//! 每个请求一份 Trace：按顺序追加的 StageRecord（每次阶段尝试一条）与 ReplanEvent（每个触发器一条），
//! 外加本请求的工具调用记录。只能追加；终态（status / outcome / error）只能写一次。

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ErrorInfo, OrchestrationError};
use crate::plan::{PlanPatch, SpecRef};
use crate::replan::{Severity, TriggerType};
use crate::stages::{Diagnostics, RunMode, StageName};
use crate::tools::ToolExecutionRecord;

pub use store::{InMemoryTraceStore, JsonlTraceSink, TraceSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Degraded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Degraded => "degraded",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Answered,
    Direct,
    Rejected,
}

/// 一次阶段尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub index: usize,
    pub stage: StageName,
    /// 该阶段的第几次尝试（从 1 开始）
    pub attempt: u32,
    pub input: Value,
    pub output: Option<Value>,
    pub diagnostics: Diagnostics,
    /// 本次尝试读取的资产（kind:id@version）
    pub applied_assets: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<ErrorInfo>,
}

/// 一个触发器的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanEvent {
    pub index: usize,
    pub trigger_type: TriggerType,
    pub stage: StageName,
    /// 产生触发器的 StageRecord 下标
    pub stage_record: usize,
    pub severity: Severity,
    pub spec: Option<SpecRef>,
    pub detail: String,
    pub should_replan: bool,
    /// 同一批次中目标阶段不同、留待后续处理
    pub deferred: bool,
    pub target_stage: Option<StageName>,
    pub patch: Option<PlanPatch>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub decision: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    trace_id: String,
    parent_trace_id: Option<String>,
    question: String,
    mode: RunMode,
    as_of: DateTime<Utc>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    stages: Vec<StageRecord>,
    replans: Vec<ReplanEvent>,
    tool_calls: Vec<ToolExecutionRecord>,
    outcome: Option<RunOutcome>,
    status: Option<RunStatus>,
    error: Option<ErrorInfo>,
}

impl Trace {
    pub fn new(
        trace_id: impl Into<String>,
        question: impl Into<String>,
        mode: RunMode,
        as_of: DateTime<Utc>,
        parent_trace_id: Option<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            parent_trace_id,
            question: question.into(),
            mode,
            as_of,
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::new(),
            replans: Vec::new(),
            tool_calls: Vec::new(),
            outcome: None,
            status: None,
            error: None,
        }
    }

    fn ensure_open(&self) -> Result<(), OrchestrationError> {
        if self.status.is_some() {
            return Err(OrchestrationError::Contract(format!(
                "trace {} is already finished",
                self.trace_id
            )));
        }
        Ok(())
    }

    /// 追加阶段记录，index 由位置决定
    pub fn push_stage(&mut self, mut record: StageRecord) -> Result<usize, OrchestrationError> {
        self.ensure_open()?;
        record.index = self.stages.len();
        self.stages.push(record);
        Ok(self.stages.len() - 1)
    }

    /// 追加重规划事件；引用的 StageRecord 必须已存在
    pub fn push_replan(&mut self, mut event: ReplanEvent) -> Result<usize, OrchestrationError> {
        self.ensure_open()?;
        if event.stage_record >= self.stages.len() {
            return Err(OrchestrationError::Contract(format!(
                "replan event references missing stage record {}",
                event.stage_record
            )));
        }
        event.index = self.replans.len();
        self.replans.push(event);
        Ok(self.replans.len() - 1)
    }

    pub fn extend_tool_calls(
        &mut self,
        records: Vec<ToolExecutionRecord>,
    ) -> Result<(), OrchestrationError> {
        self.ensure_open()?;
        self.tool_calls.extend(records);
        Ok(())
    }

    /// 写入终态；第二次调用返回 Contract 错误
    pub fn finish(
        &mut self,
        status: RunStatus,
        outcome: RunOutcome,
        error: Option<ErrorInfo>,
    ) -> Result<(), OrchestrationError> {
        self.ensure_open()?;
        self.status = Some(status);
        self.outcome = Some(outcome);
        self.error = error;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn parent_trace_id(&self) -> Option<&str> {
        self.parent_trace_id.as_deref()
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn replans(&self) -> &[ReplanEvent] {
        &self.replans
    }

    pub fn tool_calls(&self) -> &[ToolExecutionRecord] {
        &self.tool_calls
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    /// 某阶段的尝试次数
    pub fn attempts(&self, stage: StageName) -> u32 {
        self.stages.iter().filter(|r| r.stage == stage).count() as u32
    }

    /// 某阶段最近一次尝试
    pub fn last_record(&self, stage: StageName) -> Option<&StageRecord> {
        self.stages.iter().rev().find(|r| r.stage == stage)
    }

    /// 实际发生的跳转次数
    pub fn replans_applied(&self) -> usize {
        let mut revisions: Vec<u64> = self
            .replans
            .iter()
            .filter(|e| e.should_replan && !e.deferred)
            .filter_map(|e| e.after.as_ref()?.get("revision")?.as_u64())
            .collect();
        revisions.dedup();
        revisions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(stage: StageName) -> StageRecord {
        StageRecord {
            index: 99,
            stage,
            attempt: 1,
            input: json!({}),
            output: None,
            diagnostics: Diagnostics::default(),
            applied_assets: vec![],
            started_at: Utc::now(),
            duration_ms: 0,
            error: None,
        }
    }

    fn event(stage_record: usize) -> ReplanEvent {
        ReplanEvent {
            index: 0,
            trigger_type: TriggerType::EmptyResult,
            stage: StageName::Execute,
            stage_record,
            severity: Severity::Soft,
            spec: None,
            detail: String::new(),
            should_replan: false,
            deferred: false,
            target_stage: None,
            patch: None,
            before: None,
            after: None,
            decision: json!({}),
            at: Utc::now(),
        }
    }

    fn trace() -> Trace {
        Trace::new("t-1", "q", RunMode::Full, Utc::now(), None)
    }

    #[test]
    fn test_stage_index_matches_position() {
        let mut trace = trace();
        assert_eq!(trace.push_stage(record(StageName::Plan)).unwrap(), 0);
        assert_eq!(trace.push_stage(record(StageName::Validate)).unwrap(), 1);
        assert_eq!(trace.stages()[1].index, 1);
        assert_eq!(trace.last_record(StageName::Plan).unwrap().index, 0);
    }

    #[test]
    fn test_replan_must_reference_existing_record() {
        let mut trace = trace();
        assert_eq!(
            trace.push_replan(event(0)).unwrap_err().kind(),
            "contract_violation"
        );
        trace.push_stage(record(StageName::Execute)).unwrap();
        assert_eq!(trace.push_replan(event(0)).unwrap(), 0);
    }

    #[test]
    fn test_finish_is_write_once() {
        let mut trace = trace();
        trace.finish(RunStatus::Success, RunOutcome::Answered, None).unwrap();
        let err = trace
            .finish(RunStatus::Failed, RunOutcome::Answered, None)
            .unwrap_err();
        assert_eq!(err.kind(), "contract_violation");
        assert_eq!(trace.status(), Some(RunStatus::Success));
        assert!(trace.push_stage(record(StageName::Plan)).is_err());
    }

    #[test]
    fn test_trace_serializes_to_json() {
        let mut trace = trace();
        trace.push_stage(record(StageName::Plan)).unwrap();
        trace.finish(RunStatus::Partial, RunOutcome::Answered, None).unwrap();
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["status"], json!("partial"));
        assert_eq!(value["stages"][0]["stage"], json!("plan"));
        let back: Trace = serde_json::from_value(value).unwrap();
        assert_eq!(back, trace);
    }
}
