//! 重规划触发器
//!
//! 触发器类型是封闭集合；阶段只产生触发器，由 ReplanController 判定是否重规划。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::plan::SpecRef;
use crate::stages::StageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    SlotMissing,
    EmptyResult,
    ToolErrorRetryable,
    ToolErrorFatal,
    PolicyBlocked,
    LowEvidence,
    PresentLimit,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::SlotMissing => "slot_missing",
            TriggerType::EmptyResult => "empty_result",
            TriggerType::ToolErrorRetryable => "tool_error_retryable",
            TriggerType::ToolErrorFatal => "tool_error_fatal",
            TriggerType::PolicyBlocked => "policy_blocked",
            TriggerType::LowEvidence => "low_evidence",
            TriggerType::PresentLimit => "present_limit",
        }
    }

    /// 可能通过重规划解决的类型
    pub fn is_replannable(&self) -> bool {
        !matches!(self, TriggerType::ToolErrorFatal | TriggerType::PolicyBlocked)
    }

    /// 补丁作用的阶段：present_limit 回到 Present，其余数据类问题回到 Execute
    pub fn target_stage(&self) -> StageName {
        match self {
            TriggerType::PresentLimit => StageName::Present,
            _ => StageName::Execute,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// soft：可以继续（带降级）；hard：不处理则必须终止
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Soft,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_type: TriggerType,
    pub stage: StageName,
    pub severity: Severity,
    /// 涉及的数据规格
    pub spec: Option<SpecRef>,
    /// 缺失的槽位，或 present_limit 的受限维度（rows / blocks）
    pub slot: Option<String>,
    pub tool: Option<String>,
    pub detail: String,
}

impl Trigger {
    pub fn new(trigger_type: TriggerType, stage: StageName, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            trigger_type,
            stage,
            severity,
            spec: None,
            slot: None,
            tool: None,
            detail: detail.into(),
        }
    }

    pub fn soft(trigger_type: TriggerType, stage: StageName, detail: impl Into<String>) -> Self {
        Self::new(trigger_type, stage, Severity::Soft, detail)
    }

    pub fn hard(trigger_type: TriggerType, stage: StageName, detail: impl Into<String>) -> Self {
        Self::new(trigger_type, stage, Severity::Hard, detail)
    }

    pub fn with_spec(mut self, spec: SpecRef) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}
