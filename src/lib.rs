//! Sonar - 资产驱动的分析型问答编排引擎
//!
//! 模块划分：
//! - **answer**: 回答块与屏幕模型
//! - **assets**: 版本化资产（schema / resolver / query / policy / prompt / mapping / screen）与按请求覆盖
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与 Orchestrator 装配
//! - **llm**: 结构化生成后端（OpenAI 兼容 / 脚本化 Mock）
//! - **orchestrator**: 编排主循环、请求入口与单阶段测试
//! - **plan**: 计划模型、补丁与规则规划器
//! - **replan**: 触发器与重规划控制器
//! - **stages**: Plan / Validate / Execute / Compose / Present 五个阶段
//! - **tools**: 工具注册表、执行器、缓存、追踪、选择器与参考数据后端
//! - **trace**: 运行轨迹与持久化
//! - **web**: HTTP 入口（需 `web` feature）

pub mod answer;
pub mod assets;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod replan;
pub mod stages;
pub mod tools;
pub mod trace;
#[cfg(feature = "web")]
pub mod web;

pub use crate::core::{OrchestrationError, OrchestratorBuilder};
pub use crate::orchestrator::{OrchestrateRequest, Orchestrator, RunResponse};
