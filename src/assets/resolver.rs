//! 问题规范化
//!
//! 按 ResolverAsset 依次执行 transforms、别名（整词替换）与正则模式，得到确定性的规范化问题。

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::{ResolverAsset, Transform};
use crate::core::OrchestrationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuestion {
    pub original: String,
    pub canonical: String,
    /// 实际生效的规则，如 `alias:svc->service`
    pub applied_rules: Vec<String>,
}

/// 编译后的解析器
pub struct Resolver {
    transforms: Vec<Transform>,
    aliases: Vec<(String, String, Regex)>,
    patterns: Vec<(Regex, String)>,
}

impl Resolver {
    /// 编译资产中的别名与正则；非法正则返回 Asset 错误
    pub fn compile(asset: &ResolverAsset) -> Result<Self, OrchestrationError> {
        let mut aliases = Vec::with_capacity(asset.aliases.len());
        for rule in &asset.aliases {
            let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&rule.from)))
                .map_err(|e| OrchestrationError::Asset(format!("alias '{}': {e}", rule.from)))?;
            aliases.push((rule.from.clone(), rule.to.clone(), re));
        }

        let mut patterns = Vec::with_capacity(asset.patterns.len());
        for rule in &asset.patterns {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                OrchestrationError::Asset(format!("pattern '{}': {e}", rule.pattern))
            })?;
            patterns.push((re, rule.replace.clone()));
        }

        Ok(Self {
            transforms: asset.transforms.clone(),
            aliases,
            patterns,
        })
    }

    pub fn resolve(&self, question: &str) -> ResolvedQuestion {
        let mut text = question.to_string();
        let mut applied = Vec::new();

        for transform in &self.transforms {
            text = apply_transform(&text, *transform);
        }

        for (from, to, re) in &self.aliases {
            if re.is_match(&text) {
                text = re.replace_all(&text, to.as_str()).into_owned();
                applied.push(format!("alias:{from}->{to}"));
            }
        }

        for (re, replace) in &self.patterns {
            if re.is_match(&text) {
                text = re.replace_all(&text, replace.as_str()).into_owned();
                applied.push(format!("pattern:{}", re.as_str()));
            }
        }

        ResolvedQuestion {
            original: question.to_string(),
            canonical: text.trim().to_string(),
            applied_rules: applied,
        }
    }
}

fn apply_transform(text: &str, transform: Transform) -> String {
    match transform {
        Transform::Trim => text.trim().to_string(),
        Transform::Lowercase => text.to_lowercase(),
        Transform::CollapseWhitespace => text.split_whitespace().collect::<Vec<_>>().join(" "),
        // 保留标识符与过滤表达式中常见的字符
        Transform::StripPunctuation => text
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c.is_whitespace() || "-_=.:/\"".contains(c) {
                    c
                } else {
                    ' '
                }
            })
            .collect::<String>()
            .trim_end_matches(['.', ':'])
            .to_string(),
    }
}
