//! 脚本化生成器（用于测试，无需 API）
//!
//! 按顺序返回预设的 JSON 值；脚本只剩一条时重复返回它。记录收到的提示词便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::StructuredGenerator;

#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<Value, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 每次都返回同一个值
    pub fn always(value: Value) -> Self {
        Self::new(vec![value])
    }

    /// 每次都失败
    pub fn failing(message: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from([Err(message.to_string())])),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl StructuredGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _schema: &Value) -> Result<Value, String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        match responses.len() {
            0 => Err("script exhausted".to_string()),
            1 => responses[0].clone(),
            _ => responses
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
