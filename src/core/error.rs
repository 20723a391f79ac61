//! 编排错误分类
//!
//! 与 ReplanController 配合：阶段内可恢复的问题以 Trigger 形式交给控制环，
//! 只有真正不可恢复的情况（输入契约被破坏、硬性策略违规、超时、重规划预算耗尽）才以 OrchestrationError 返回。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum OrchestrationError {
    /// 阶段输入缺少必填字段或结构非法（致命）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 预算或安全策略违规
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Tool error ({tool}): {message}")]
    Tool {
        tool: String,
        message: String,
        retryable: bool,
    },

    /// 阶段或调用超过截止时间
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 控制环安全停止
    #[error("Replan budget exhausted after {0} replans")]
    ReplanBudgetExhausted(u32),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Asset error: {0}")]
    Asset(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 内部契约被破坏（如 Trace 终态重复写入）
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Trace not found: {0}")]
    TraceNotFound(String),
}

impl OrchestrationError {
    /// 错误类别（写入 Trace.error.kind，供离线排障工具聚合）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PolicyViolation(_) => "policy_violation",
            Self::Tool { .. } => "tool_error",
            Self::Timeout(_) => "timeout_error",
            Self::ReplanBudgetExhausted(_) => "replan_budget_exhausted",
            Self::Config(_) => "config_error",
            Self::Asset(_) => "asset_error",
            Self::Llm(_) => "llm_error",
            Self::Serialization(_) => "serialization_error",
            Self::Contract(_) => "contract_violation",
            Self::TraceNotFound(_) => "trace_not_found",
        }
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// 工具调用失败：retryable 决定触发 tool_error_retryable 还是 tool_error_fatal
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// 可序列化的错误快照（写入 Trace 与 StageRecord）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&OrchestrationError> for ErrorInfo {
    fn from(e: &OrchestrationError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}
