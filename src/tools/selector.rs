//! 工具选择器
//!
//! 对候选工具打分并降序排列：
//!
//! score = w_acc * accuracy
//!       + w_speed * (1 / (1 + est_time_ms / 1000))
//!       + w_cache * (已缓存 ? 1 : 0)
//!       + w_load * (1 - load)
//!       + w_intent * (意图对齐 ? 1 : 0)
//!
//! 结果截断到 [0, 1]；排序稳定，平分时保持候选顺序。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{SelectorSection, SelectorWeights};
use crate::plan::Intent;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolProfile {
    pub tool_type: String,
    pub accuracy: f64,
    pub estimated_time_ms: u64,
    pub intents: Vec<Intent>,
}

impl ToolProfile {
    pub fn new(tool_type: impl Into<String>, accuracy: f64, estimated_time_ms: u64) -> Self {
        Self {
            tool_type: tool_type.into(),
            accuracy,
            estimated_time_ms,
            intents: Vec::new(),
        }
    }

    pub fn with_intents(mut self, intents: &[Intent]) -> Self {
        self.intents = intents.to_vec();
        self
    }
}

/// 选择时的动态输入
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// tool_type -> [0, 1]
    pub load: HashMap<String, f64>,
    pub cache_status: HashMap<String, bool>,
    /// 历史平均耗时，缺失时使用画像中的预估
    pub estimated_time_ms: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTool {
    pub tool_type: String,
    pub score: f64,
}

pub struct ToolSelector {
    weights: SelectorWeights,
    profiles: Vec<ToolProfile>,
    intent_table: HashMap<Intent, Vec<String>>,
}

impl ToolSelector {
    pub fn new(weights: SelectorWeights) -> Self {
        Self {
            weights,
            profiles: Vec::new(),
            intent_table: HashMap::new(),
        }
    }

    pub fn with_profile(mut self, profile: ToolProfile) -> Self {
        self.profiles.retain(|p| p.tool_type != profile.tool_type);
        self.profiles.push(profile);
        self
    }

    pub fn with_intent_tools(mut self, intent: Intent, tools: Vec<String>) -> Self {
        self.intent_table.insert(intent, tools);
        self
    }

    /// 从配置构造；配置中没有工具画像时使用内置演示数据源的画像
    pub fn from_config(section: &SelectorSection) -> Self {
        let mut selector = Self::new(section.weights.clone());

        if section.tools.is_empty() {
            selector = selector.with_demo_profiles();
        } else {
            for entry in &section.tools {
                let intents: Vec<Intent> = entry
                    .intents
                    .iter()
                    .filter_map(|s| {
                        let parsed = Intent::parse(s);
                        if parsed.is_none() {
                            tracing::warn!(tool = %entry.tool_type, intent = %s, "unknown intent in selector profile");
                        }
                        parsed
                    })
                    .collect();
                selector = selector.with_profile(
                    ToolProfile::new(&entry.tool_type, entry.accuracy, entry.estimated_time_ms)
                        .with_intents(&intents),
                );
            }
        }

        for (intent, tools) in &section.intents {
            match Intent::parse(intent) {
                Some(intent) => selector = selector.with_intent_tools(intent, tools.clone()),
                None => tracing::warn!(intent = %intent, "unknown intent in selector table"),
            }
        }
        selector
    }

    fn with_demo_profiles(self) -> Self {
        self.with_profile(
            ToolProfile::new("config_items", 0.9, 40).with_intents(&[
                Intent::Lookup,
                Intent::Relationship,
            ]),
        )
        .with_profile(
            ToolProfile::new("metric_store", 0.95, 300).with_intents(&[
                Intent::Trend,
                Intent::Compare,
                Intent::Aggregate,
            ]),
        )
        .with_profile(
            ToolProfile::new("metric_rollup", 0.8, 60).with_intents(&[Intent::Aggregate]),
        )
        .with_profile(ToolProfile::new("topology", 0.9, 120).with_intents(&[Intent::Relationship]))
        .with_profile(ToolProfile::new("change_log", 0.9, 150).with_intents(&[Intent::History]))
    }

    pub fn profile(&self, tool_type: &str) -> Option<&ToolProfile> {
        self.profiles.iter().find(|p| p.tool_type == tool_type)
    }

    /// intent 对应的候选集合：优先查表，否则为所有画像（按声明顺序）
    pub fn candidates(&self, intent: Intent) -> Vec<String> {
        match self.intent_table.get(&intent) {
            Some(tools) => tools.clone(),
            None => self.profiles.iter().map(|p| p.tool_type.clone()).collect(),
        }
    }

    pub fn score(&self, tool_type: &str, intent: Intent, ctx: &SelectionContext) -> f64 {
        let default_profile;
        let profile = match self.profile(tool_type) {
            Some(p) => p,
            None => {
                default_profile = ToolProfile::new(tool_type, 0.8, 500);
                &default_profile
            }
        };
        let w = &self.weights;
        let est = ctx
            .estimated_time_ms
            .get(tool_type)
            .copied()
            .unwrap_or(profile.estimated_time_ms) as f64;
        let speed = 1.0 / (1.0 + est / 1000.0);
        let cached = if ctx.cache_status.get(tool_type).copied().unwrap_or(false) {
            1.0
        } else {
            0.0
        };
        let load = ctx.load.get(tool_type).copied().unwrap_or(0.0).clamp(0.0, 1.0);
        let aligned = if profile.intents.contains(&intent) {
            1.0
        } else {
            0.0
        };

        let score = w.accuracy * profile.accuracy.clamp(0.0, 1.0)
            + w.speed * speed
            + w.cache * cached
            + w.load * (1.0 - load)
            + w.intent * aligned;
        score.clamp(0.0, 1.0)
    }

    /// 对给定候选打分排序
    pub fn rank(&self, intent: Intent, candidates: &[String], ctx: &SelectionContext) -> Vec<ScoredTool> {
        let mut scored: Vec<ScoredTool> = candidates
            .iter()
            .map(|t| ScoredTool {
                tool_type: t.clone(),
                score: self.score(t, intent, ctx),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored
    }

    /// 对 intent 的全部候选打分排序
    pub fn select(&self, intent: Intent, ctx: &SelectionContext) -> Vec<ScoredTool> {
        self.rank(intent, &self.candidates(intent), ctx)
    }
}
