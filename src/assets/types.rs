//! 资产类型：schema / resolver / query / policy / prompt / mapping / screen
//!
//! 每个资产都带 id 与 version，阶段读取资产时由 AssetLens 记录 `kind:id@version`。
//! 所有字段都有默认值，资产文件只需写出与内置默认不同的部分。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::answer::BlockKind;
use crate::plan::Backend;

fn default_id() -> String {
    "default".to_string()
}

fn default_version() -> String {
    "1".to_string()
}

/// 资产种类（同时也是资产目录下的文件名：`{kind}.toml`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Schema,
    Resolver,
    Query,
    Policy,
    Prompt,
    Mapping,
    Screen,
}

impl AssetKind {
    pub const ALL: [AssetKind; 7] = [
        AssetKind::Schema,
        AssetKind::Resolver,
        AssetKind::Query,
        AssetKind::Policy,
        AssetKind::Prompt,
        AssetKind::Mapping,
        AssetKind::Screen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Schema => "schema",
            AssetKind::Resolver => "resolver",
            AssetKind::Query => "query",
            AssetKind::Policy => "policy",
            AssetKind::Prompt => "prompt",
            AssetKind::Mapping => "mapping",
            AssetKind::Screen => "screen",
        }
    }
}

// ---------- schema ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// string / number / time
    #[serde(default = "default_field_kind")]
    pub kind: String,
}

fn default_field_kind() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    /// 表格数据集名
    pub source: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// 该实体可查询的指标
    #[serde(default)]
    pub metrics: Vec<String>,
}

fn default_key_field() -> String {
    "name".to_string()
}

impl EntityDef {
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(field))
    }
}

/// 实体目录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub entities: Vec<EntityDef>,
}

impl SchemaCatalog {
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name) || e.source.eq_ignore_ascii_case(name))
    }

    /// 拥有该指标的第一个实体
    pub fn entity_for_metric(&self, metric: &str) -> Option<&EntityDef> {
        self.entities
            .iter()
            .find(|e| e.metrics.iter().any(|m| m.eq_ignore_ascii_case(metric)))
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        let field = |name: &str, kind: &str| FieldDef {
            name: name.to_string(),
            kind: kind.to_string(),
        };
        Self {
            id: default_id(),
            version: default_version(),
            entities: vec![
                EntityDef {
                    name: "service".to_string(),
                    source: "services".to_string(),
                    key_field: "name".to_string(),
                    fields: vec![
                        field("name", "string"),
                        field("team", "string"),
                        field("tier", "string"),
                        field("region", "string"),
                        field("status", "string"),
                        field("owner_email", "string"),
                    ],
                    metrics: vec![
                        "latency_p99".to_string(),
                        "error_rate".to_string(),
                        "cpu".to_string(),
                    ],
                },
                EntityDef {
                    name: "host".to_string(),
                    source: "hosts".to_string(),
                    key_field: "name".to_string(),
                    fields: vec![
                        field("name", "string"),
                        field("service", "string"),
                        field("region", "string"),
                        field("os", "string"),
                        field("status", "string"),
                    ],
                    metrics: vec!["cpu".to_string(), "memory".to_string()],
                },
            ],
        }
    }
}

// ---------- resolver ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub replace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    CollapseWhitespace,
    StripPunctuation,
}

/// 问题规范化规则：transforms → aliases（整词替换）→ patterns（正则）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverAsset {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_transforms")]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub aliases: Vec<AliasRule>,
    #[serde(default)]
    pub patterns: Vec<PatternRule>,
}

fn default_transforms() -> Vec<Transform> {
    vec![
        Transform::Trim,
        Transform::Lowercase,
        Transform::StripPunctuation,
        Transform::CollapseWhitespace,
    ]
}

impl Default for ResolverAsset {
    fn default() -> Self {
        let alias = |from: &str, to: &str| AliasRule {
            from: from.to_string(),
            to: to.to_string(),
        };
        Self {
            id: default_id(),
            version: default_version(),
            transforms: default_transforms(),
            aliases: vec![
                alias("svc", "service"),
                alias("services", "service"),
                alias("hosts", "host"),
                alias("p99", "latency_p99"),
                alias("errors", "error_rate"),
            ],
            patterns: vec![PatternRule {
                pattern: r"\bpast\b".to_string(),
                replace: "last".to_string(),
            }],
        }
    }
}

// ---------- query ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOperations {
    #[serde(default = "default_op_tabular")]
    pub tabular: String,
    #[serde(default = "default_op_metric")]
    pub metric: String,
    #[serde(default = "default_op_graph")]
    pub graph: String,
    #[serde(default = "default_op_history")]
    pub history: String,
}

fn default_op_tabular() -> String {
    "query_rows".to_string()
}

fn default_op_metric() -> String {
    "query_metric".to_string()
}

fn default_op_graph() -> String {
    "traverse".to_string()
}

fn default_op_history() -> String {
    "list_events".to_string()
}

impl Default for BackendOperations {
    fn default() -> Self {
        Self {
            tabular: default_op_tabular(),
            metric: default_op_metric(),
            graph: default_op_graph(),
            history: default_op_history(),
        }
    }
}

/// 查询资产：后端操作名与查询默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAsset {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub operations: BackendOperations,
    #[serde(default = "default_window_minutes")]
    pub default_window_minutes: u64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_depth")]
    pub default_depth: u32,
}

fn default_window_minutes() -> u64 {
    60
}

fn default_limit() -> usize {
    50
}

fn default_depth() -> u32 {
    1
}

impl QueryAsset {
    pub fn operation_for(&self, backend: Backend) -> &str {
        match backend {
            Backend::Tabular => &self.operations.tabular,
            Backend::Metric => &self.operations.metric,
            Backend::Graph => &self.operations.graph,
            Backend::History => &self.operations.history,
        }
    }
}

impl Default for QueryAsset {
    fn default() -> Self {
        Self {
            id: default_id(),
            version: default_version(),
            operations: BackendOperations::default(),
            default_window_minutes: default_window_minutes(),
            default_limit: default_limit(),
            default_depth: default_depth(),
        }
    }
}

// ---------- policy ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_max_window_minutes")]
    pub max_window_minutes: u64,
}

fn default_max_steps() -> usize {
    6
}

fn default_max_depth() -> u32 {
    3
}

fn default_max_rows() -> usize {
    500
}

fn default_max_timeout_ms() -> u64 {
    20_000
}

fn default_max_window_minutes() -> u64 {
    7 * 24 * 60
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_depth: default_max_depth(),
            max_rows: default_max_rows(),
            max_timeout_ms: default_max_timeout_ms(),
            max_window_minutes: default_max_window_minutes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// 允许的 `backend.operation`；为空表示不限制
    #[serde(default)]
    pub allowed_operations: Vec<String>,
    /// 禁止在计划中出现的字段（大小写不敏感）
    #[serde(default = "default_blocked_fields")]
    pub blocked_fields: Vec<String>,
}

fn default_blocked_fields() -> Vec<String> {
    vec![
        "password".to_string(),
        "secret".to_string(),
        "api_key".to_string(),
    ]
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_operations: Vec::new(),
            blocked_fields: default_blocked_fields(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAsset {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub budget: BudgetPolicy,
    #[serde(default)]
    pub security: SecurityPolicy,
}

impl Default for PolicyAsset {
    fn default() -> Self {
        Self {
            id: default_id(),
            version: default_version(),
            budget: BudgetPolicy::default(),
            security: SecurityPolicy::default(),
        }
    }
}

// ---------- prompt ----------

/// 提示词模板；占位符：{schema} {question} {mode} {blocks}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptAsset {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_planner_template")]
    pub planner_template: String,
    #[serde(default = "default_summary_template")]
    pub summary_template: String,
}

fn default_planner_template() -> String {
    "You plan read-only analytical queries over an operations catalog.\n\
     Catalog:\n{schema}\n\n\
     Mode: {mode}\n\
     Question: {question}\n\n\
     Reply with kind=plan for data questions, kind=direct for greetings or help, \
     kind=reject for anything that would change the system."
        .to_string()
}

fn default_summary_template() -> String {
    "Summarize the findings for the question in two sentences. Only use the data given.\n\
     Question: {question}\n\
     Data:\n{blocks}"
        .to_string()
}

impl Default for PromptAsset {
    fn default() -> Self {
        Self {
            id: default_id(),
            version: default_version(),
            planner_template: default_planner_template(),
            summary_template: default_summary_template(),
        }
    }
}

// ---------- mapping ----------

/// 后端结果 → 回答块的映射规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
    pub backend: Backend,
    pub block: BlockKind,
    /// 标题模板，支持 {entity} {metric} {source}
    #[serde(default)]
    pub title: Option<String>,
    /// 表格列；为空时取结果列
    #[serde(default)]
    pub fields: Vec<String>,
    /// 块内最多保留的行数
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// 该后端有规格却无结果时视为证据不足
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingAsset {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// 低于该证据行数触发 low_evidence
    #[serde(default = "default_min_evidence")]
    pub min_evidence: usize,
    /// 是否允许生成叙述性摘要
    #[serde(default = "default_true")]
    pub summarize: bool,
    #[serde(default = "default_mapping_rules")]
    pub rules: Vec<MappingRule>,
}

fn default_min_evidence() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_mapping_rules() -> Vec<MappingRule> {
    let rule = |backend, block, title: &str| MappingRule {
        backend,
        block,
        title: Some(title.to_string()),
        fields: Vec::new(),
        max_rows: None,
        required: false,
    };
    vec![
        rule(Backend::Tabular, BlockKind::Table, "{entity}"),
        rule(Backend::Metric, BlockKind::Metric, "{metric}"),
        rule(Backend::Metric, BlockKind::Table, "{metric} series"),
        rule(Backend::Graph, BlockKind::Graph, "dependencies"),
        rule(Backend::History, BlockKind::Timeline, "changes"),
    ]
}

impl MappingAsset {
    /// 某后端的映射规则；优先选择 wanted 中列出的块类型
    pub fn rule_for(&self, backend: Backend, wanted: &[BlockKind]) -> Option<&MappingRule> {
        self.rules
            .iter()
            .find(|r| r.backend == backend && wanted.contains(&r.block))
            .or_else(|| self.rules.iter().find(|r| r.backend == backend))
    }
}

impl Default for MappingAsset {
    fn default() -> Self {
        Self {
            id: default_id(),
            version: default_version(),
            min_evidence: default_min_evidence(),
            summarize: true,
            rules: default_mapping_rules(),
        }
    }
}

// ---------- screen ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenAsset {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_layout")]
    pub layout: String,
    #[serde(default = "default_max_blocks")]
    pub max_blocks: usize,
    #[serde(default = "default_max_table_rows")]
    pub max_table_rows: usize,
    /// 块类型名 → 组件名
    #[serde(default = "default_components")]
    pub components: BTreeMap<String, String>,
}

fn default_layout() -> String {
    "stack".to_string()
}

fn default_max_blocks() -> usize {
    6
}

fn default_max_table_rows() -> usize {
    25
}

fn default_components() -> BTreeMap<String, String> {
    [
        ("text", "markdown"),
        ("table", "data_table"),
        ("metric", "stat_card"),
        ("timeline", "event_timeline"),
        ("graph", "dependency_graph"),
        ("notice", "banner"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl ScreenAsset {
    pub fn component_for(&self, block: BlockKind) -> String {
        self.components
            .get(block.as_str())
            .cloned()
            .unwrap_or_else(|| block.as_str().to_string())
    }
}

impl Default for ScreenAsset {
    fn default() -> Self {
        Self {
            id: default_id(),
            version: default_version(),
            layout: default_layout(),
            max_blocks: default_max_blocks(),
            max_table_rows: default_max_table_rows(),
            components: default_components(),
        }
    }
}

/// 一次请求生效的全部资产
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetBundle {
    #[serde(default)]
    pub schema: SchemaCatalog,
    #[serde(default)]
    pub resolver: ResolverAsset,
    #[serde(default)]
    pub query: QueryAsset,
    #[serde(default)]
    pub policy: PolicyAsset,
    #[serde(default)]
    pub prompt: PromptAsset,
    #[serde(default)]
    pub mapping: MappingAsset,
    #[serde(default)]
    pub screen: ScreenAsset,
}

impl AssetBundle {
    /// `kind:id@version` 形式的资产引用
    pub fn asset_ref(&self, kind: AssetKind) -> String {
        let (id, version) = match kind {
            AssetKind::Schema => (&self.schema.id, &self.schema.version),
            AssetKind::Resolver => (&self.resolver.id, &self.resolver.version),
            AssetKind::Query => (&self.query.id, &self.query.version),
            AssetKind::Policy => (&self.policy.id, &self.policy.version),
            AssetKind::Prompt => (&self.prompt.id, &self.prompt.version),
            AssetKind::Mapping => (&self.mapping.id, &self.mapping.version),
            AssetKind::Screen => (&self.screen.id, &self.screen.version),
        };
        format!("{}:{}@{}", kind.as_str(), id, version)
    }
}
