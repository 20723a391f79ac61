//! Plan 数据模型
//!
//! Plan 由 Plan 阶段产出且不可变：重规划总是通过 PlanPatch::apply 生成新的 Plan（revision + 1），
//! 从不原地修改。PlanDraft 是规划器（LLM 或规则）的结构化输出契约，其 JSON Schema 由 schemars 生成。

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::answer::BlockKind;

/// 查询意图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// 按条件查找配置项
    Lookup,
    /// 指标聚合（平均 / 最大 / 计数 ...）
    Aggregate,
    /// 指标随时间变化
    Trend,
    /// 依赖 / 拓扑关系
    Relationship,
    /// 变更与事件历史
    History,
    /// 多对象对比
    Compare,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Lookup,
        Intent::Aggregate,
        Intent::Trend,
        Intent::Relationship,
        Intent::History,
        Intent::Compare,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Lookup => "lookup",
            Intent::Aggregate => "aggregate",
            Intent::Trend => "trend",
            Intent::Relationship => "relationship",
            Intent::History => "history",
            Intent::Compare => "compare",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|i| i.as_str() == s)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 呈现视图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Table,
    /// 摘要卡片：表格折叠为行数 + 预览
    Summary,
    Chart,
    Timeline,
    Topology,
}

/// 执行后端类别；每个 Tool 声明自己属于哪一类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Tabular,
    Metric,
    Graph,
    History,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Tabular => "tabular",
            Backend::Metric => "metric",
            Backend::Graph => "graph",
            Backend::History => "history",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tabular" | "table" => Some(Backend::Tabular),
            "metric" | "metrics" => Some(Backend::Metric),
            "graph" => Some(Backend::Graph),
            "history" => Some(Backend::History),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Contains,
    In,
    Gte,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FilterSpec {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterSpec {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

/// 相对时间窗口（以请求的 as_of 为终点）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimeWindow {
    pub last_minutes: u64,
}

/// 表格类数据源查询（配置项）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TabularSpec {
    /// SchemaCatalog 中的实体名
    #[serde(default)]
    pub entity: Option<String>,
    /// 数据集名；缺省时由实体解析
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Avg,
    Max,
    Min,
    Sum,
    Count,
    Last,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct MetricSpec {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    #[serde(default)]
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct GraphSpec {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub relations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct HistorySpec {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct OutputSpec {
    #[serde(default)]
    pub blocks: Vec<BlockKind>,
    /// 表格最多展示行数（Present 阶段遵循；由 present_limit 补丁设置）
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// 最多展示的块数
    #[serde(default)]
    pub max_blocks: Option<usize>,
    /// 是否请求叙述性摘要
    #[serde(default)]
    pub summarize: bool,
}

/// Plan 的结构化内容（规划器产出、补丁作用的对象）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanSpec {
    pub intent: Intent,
    pub view: View,
    #[serde(default)]
    pub primary: Option<TabularSpec>,
    #[serde(default)]
    pub secondary: Vec<TabularSpec>,
    #[serde(default)]
    pub graph: Option<GraphSpec>,
    #[serde(default)]
    pub metric: Option<MetricSpec>,
    #[serde(default)]
    pub history: Option<HistorySpec>,
    #[serde(default)]
    pub output: OutputSpec,
}

/// 规划器输出契约：直接回答 / 可执行计划 / 拒绝
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanDraft {
    Direct { answer: String },
    Plan(PlanSpec),
    Reject { reason: String },
}

/// 对 Plan 中某个数据规格的引用（补丁与 Trigger 的定位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "spec", content = "index", rename_all = "snake_case")]
pub enum SpecRef {
    Primary,
    Secondary(usize),
    Graph,
    Metric,
    History,
}

impl SpecRef {
    pub fn backend(&self) -> Backend {
        match self {
            SpecRef::Primary | SpecRef::Secondary(_) => Backend::Tabular,
            SpecRef::Graph => Backend::Graph,
            SpecRef::Metric => Backend::Metric,
            SpecRef::History => Backend::History,
        }
    }
}

impl fmt::Display for SpecRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecRef::Primary => f.write_str("primary"),
            SpecRef::Secondary(i) => write!(f, "secondary[{i}]"),
            SpecRef::Graph => f.write_str("graph"),
            SpecRef::Metric => f.write_str("metric"),
            SpecRef::History => f.write_str("history"),
        }
    }
}

/// 可执行计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub revision: u32,
    /// 经过 Resolver 规范化后的问题
    pub question: String,
    #[serde(flatten)]
    pub spec: PlanSpec,
}

impl Plan {
    /// 由规范化问题与 PlanSpec 构造；id 是二者的确定性摘要，相同输入得到相同 id
    pub fn new(question: impl Into<String>, spec: PlanSpec) -> Self {
        let question = question.into();
        let mut hasher = DefaultHasher::new();
        question.hash(&mut hasher);
        serde_json::to_string(&spec)
            .unwrap_or_default()
            .hash(&mut hasher);
        Self {
            id: format!("plan-{:016x}", hasher.finish()),
            revision: 1,
            question,
            spec,
        }
    }

    /// 替换内容并生成下一修订版
    pub fn revise(&self, spec: PlanSpec) -> Self {
        Self {
            id: self.id.clone(),
            revision: self.revision + 1,
            question: self.question.clone(),
            spec,
        }
    }

    pub fn intent(&self) -> Intent {
        self.spec.intent
    }

    /// 按固定顺序列出所有数据规格：primary、secondary[*]、graph、metric、history
    pub fn data_specs(&self) -> Vec<SpecRef> {
        let mut refs = Vec::new();
        if self.spec.primary.is_some() {
            refs.push(SpecRef::Primary);
        }
        refs.extend((0..self.spec.secondary.len()).map(SpecRef::Secondary));
        if self.spec.graph.is_some() {
            refs.push(SpecRef::Graph);
        }
        if self.spec.metric.is_some() {
            refs.push(SpecRef::Metric);
        }
        if self.spec.history.is_some() {
            refs.push(SpecRef::History);
        }
        refs
    }

    /// 每个数据规格对应一次工具调用
    pub fn step_count(&self) -> usize {
        self.data_specs().len()
    }

    pub fn tabular(&self, spec: SpecRef) -> Option<&TabularSpec> {
        match spec {
            SpecRef::Primary => self.spec.primary.as_ref(),
            SpecRef::Secondary(i) => self.spec.secondary.get(i),
            _ => None,
        }
    }

    /// 计划中引用的全部字段名（fields、filters、group_by），用于安全策略检查
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        let tabulars = self.spec.primary.iter().chain(self.spec.secondary.iter());
        for t in tabulars {
            fields.extend(t.fields.iter().cloned());
            fields.extend(t.filters.iter().map(|f| f.field.clone()));
        }
        if let Some(group_by) = self.spec.metric.as_ref().and_then(|m| m.group_by.clone()) {
            fields.push(group_by);
        }
        fields
    }
}

/// Plan 阶段的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanOutcome {
    Direct { answer: String },
    Plan(Plan),
    Reject { reason: String },
}
