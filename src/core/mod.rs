//! 核心层：错误分类与 Orchestrator 装配

pub mod builder;
pub mod error;

pub use builder::OrchestratorBuilder;
pub use error::{ErrorInfo, OrchestrationError, ToolError};
