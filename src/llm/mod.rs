//! 结构化生成后端（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::ScriptedGenerator;
pub use openai::OpenAiGenerator;
pub use traits::{extract_json, StructuredGenerator};

use crate::config::AppConfig;

/// 按配置创建生成器；provider 为 rules 或缺少 API Key 时返回 None（使用规则规划）
pub fn create_generator_from_config(cfg: &AppConfig) -> Option<Arc<dyn StructuredGenerator>> {
    match cfg.llm.provider.as_str() {
        "openai" => match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => {
                tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible generator");
                Some(Arc::new(OpenAiGenerator::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    &key,
                )))
            }
            _ => {
                tracing::warn!("OPENAI_API_KEY not set, falling back to rule-based planning");
                None
            }
        },
        "rules" => None,
        other => {
            tracing::warn!(provider = %other, "unknown llm provider, falling back to rule-based planning");
            None
        }
    }
}
