//! 五阶段管线：Plan → Validate → Execute → Compose → Present
//!
//! 每个阶段实现 StageExecutor：输入先经 StageInput::check 校验契约，
//! 执行结果为 StageOutcome（输出 + 诊断 + 触发器）。阶段只报告触发器，是否重规划由 ReplanController 决定。

pub mod compose;
pub mod execute;
pub mod plan;
pub mod present;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::assets::AssetLens;
use crate::core::OrchestrationError;
use crate::replan::Trigger;

pub use compose::{ComposeInput, ComposeOutput, ComposeStage};
pub use execute::{ExecuteInput, ExecuteOutput, ExecuteStage, SpecResult, UnresolvedSpec};
pub use plan::{PlanInput, PlanStage, PlanStageOutput, PlannerBackend};
pub use present::{layout_blocks, Layout, PresentInput, PresentStage};
pub use validate::{check_policy, PolicyCheck, ValidateInput, ValidateOutput, ValidateStage, ValidatedPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Plan,
    Validate,
    Execute,
    Compose,
    Present,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Plan,
        StageName::Validate,
        StageName::Execute,
        StageName::Compose,
        StageName::Present,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Plan => "plan",
            StageName::Validate => "validate",
            StageName::Execute => "execute",
            StageName::Compose => "compose",
            StageName::Present => "present",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|n| n.as_str() == s)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行模式：fast 跳过叙述摘要等可选步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Full,
    Fast,
}

impl RunMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Some(RunMode::Full),
            "fast" => Some(RunMode::Fast),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Fast => "fast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Ok,
    Warning,
    Error,
}

/// 阶段诊断：状态、警告、错误与计数
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub status: StageStatus,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}

impl Diagnostics {
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
        if self.status == StageStatus::Ok {
            self.status = StageStatus::Warning;
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.status = StageStatus::Error;
    }

    pub fn count(&mut self, key: &str, n: u64) {
        *self.counts.entry(key.to_string()).or_insert(0) += n;
    }
}

/// 阶段执行结果
#[derive(Debug, Clone)]
pub struct StageOutcome<T> {
    pub output: T,
    pub diagnostics: Diagnostics,
    pub triggers: Vec<Trigger>,
}

impl<T> StageOutcome<T> {
    pub fn new(output: T, diagnostics: Diagnostics, triggers: Vec<Trigger>) -> Self {
        Self {
            output,
            diagnostics,
            triggers,
        }
    }
}

/// 阶段输入契约
pub trait StageInput {
    /// 缺少必填字段或结构非法时返回 Validation 错误
    fn check(&self) -> Result<(), OrchestrationError>;
}

/// 单次阶段尝试的上下文
pub struct StageContext<'a> {
    pub trace_id: &'a str,
    pub mode: RunMode,
    pub deadline: tokio::time::Instant,
    pub as_of: DateTime<Utc>,
    pub assets: AssetLens<'a>,
}

impl StageContext<'_> {
    pub fn deadline_exceeded(&self) -> bool {
        tokio::time::Instant::now() >= self.deadline
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    type Input: StageInput + Serialize + DeserializeOwned + Send + Sync;
    type Output: Serialize + Send;

    fn stage(&self) -> StageName;

    async fn execute(
        &self,
        input: &Self::Input,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome<Self::Output>, OrchestrationError>;
}
