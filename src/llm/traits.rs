//! 结构化生成抽象
//!
//! Plan 阶段（LLM 规划）与 Compose 阶段（叙述摘要）只依赖 StructuredGenerator：
//! 给定提示词与 JSON Schema，返回符合 schema 的 JSON 值。

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    /// 生成一个符合 schema 的 JSON 值
    async fn generate(&self, prompt: &str, schema: &Value) -> Result<Value, String>;

    /// 后端名（写入诊断信息）
    fn name(&self) -> &str {
        "generator"
    }
}

/// 从模型输出中取出 JSON 对象：容忍 ```json 围栏与前后说明文字
pub fn extract_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str(&trimmed[s..=e])
            .map_err(|err| format!("model output is not valid JSON: {err}")),
        _ => Err("model output contains no JSON object".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_output() {
        let v = extract_json("Here you go:\n```json\n{\"kind\": \"direct\", \"answer\": \"hi\"}\n```").unwrap();
        assert_eq!(v["kind"], "direct");
    }

    #[test]
    fn test_extract_json_rejects_prose() {
        assert!(extract_json("no json here").is_err());
    }
}
