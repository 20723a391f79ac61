//! 回答块与屏幕模型
//!
//! Compose 阶段产出 AnswerBlock 列表，Present 阶段将其映射为 ScreenModel（组件 + 布局）。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::View;

/// 块类型（MappingAsset 规则与 OutputSpec 使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Table,
    Metric,
    Timeline,
    Graph,
    Notice,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Text => "text",
            BlockKind::Table => "table",
            BlockKind::Metric => "metric",
            BlockKind::Timeline => "timeline",
            BlockKind::Graph => "graph",
            BlockKind::Notice => "notice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub at: String,
    pub kind: String,
    pub entity: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub relation: String,
}

/// 类型化的回答块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerBlock {
    Text {
        title: Option<String>,
        body: String,
    },
    Table {
        title: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Metric {
        title: String,
        metric: String,
        aggregation: String,
        value: Option<f64>,
        /// 参与聚合的数据点数
        points: usize,
    },
    Timeline {
        title: String,
        events: Vec<TimelineEvent>,
    },
    Graph {
        title: String,
        nodes: Vec<String>,
        edges: Vec<GraphEdge>,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
}

impl AnswerBlock {
    pub fn kind(&self) -> BlockKind {
        match self {
            AnswerBlock::Text { .. } => BlockKind::Text,
            AnswerBlock::Table { .. } => BlockKind::Table,
            AnswerBlock::Metric { .. } => BlockKind::Metric,
            AnswerBlock::Timeline { .. } => BlockKind::Timeline,
            AnswerBlock::Graph { .. } => BlockKind::Graph,
            AnswerBlock::Notice { .. } => BlockKind::Notice,
        }
    }

    /// 证据行数（Notice / Text 不计）
    pub fn evidence_rows(&self) -> usize {
        match self {
            AnswerBlock::Table { rows, .. } => rows.len(),
            AnswerBlock::Metric { points, .. } => *points,
            AnswerBlock::Timeline { events, .. } => events.len(),
            AnswerBlock::Graph { edges, .. } => edges.len(),
            AnswerBlock::Text { .. } | AnswerBlock::Notice { .. } => 0,
        }
    }

    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        AnswerBlock::Notice {
            level,
            message: message.into(),
        }
    }
}

/// 屏幕上的一个组件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenComponent {
    pub id: String,
    /// 组件名（由 ScreenAsset 按块类型映射，如 data_table / stat_card）
    pub component: String,
    pub block: BlockKind,
    pub props: Value,
    /// 是否因展示上限被截断
    pub truncated: bool,
}

/// Present 阶段输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenModel {
    pub layout: String,
    pub view: View,
    pub title: String,
    pub components: Vec<ScreenComponent>,
    /// 超出 max_blocks 未展示的块数
    pub hidden_blocks: usize,
}
