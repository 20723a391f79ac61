//! 内存数据集工具
//!
//! 四类参考后端：表格（配置项）、指标序列、拓扑图、变更历史。数据来自 JSON fixture，
//! 时间既可写绝对时间 `at`（RFC3339），也可写相对请求 as_of 的 `minutes_ago`。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::registry::Tool;
use super::result::{ResultSet, ToolContext};
use crate::core::{OrchestrationError, ToolError};
use crate::plan::{Aggregation, Backend, FilterOp, FilterSpec};

type Row = Map<String, Value>;

/// 工具公共属性
#[derive(Debug, Clone)]
struct ToolMeta {
    tool_type: String,
    description: String,
    ttl: Option<Duration>,
    latency: Option<Duration>,
}

impl ToolMeta {
    fn new(tool_type: &str, description: &str) -> Self {
        Self {
            tool_type: tool_type.to_string(),
            description: description.to_string(),
            ttl: None,
            latency: None,
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn check_operation(expected: &str, operation: &str) -> Result<(), ToolError> {
    if operation == expected {
        Ok(())
    } else {
        Err(ToolError::fatal(format!(
            "unsupported operation '{operation}', expected '{expected}'"
        )))
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn list_param(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_lowercase()))
                .collect()
        })
        .unwrap_or_default()
}

fn usize_param(params: &Value, key: &str) -> Option<usize> {
    params.get(key).and_then(|v| v.as_u64()).map(|n| n as usize)
}

/// as_of 往前推 minutes 分钟；超出 chrono 可表示范围时返回 fatal
fn minutes_before(as_of: DateTime<Utc>, minutes: u64) -> Result<DateTime<Utc>, ToolError> {
    i64::try_from(minutes)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .and_then(|delta| as_of.checked_sub_signed(delta))
        .ok_or_else(|| ToolError::fatal(format!("time window of {minutes} minutes is out of range")))
}

fn window_start(params: &Value, as_of: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ToolError> {
    params
        .get("last_minutes")
        .and_then(|v| v.as_u64())
        .map(|m| minutes_before(as_of, m))
        .transpose()
}

/// 行中字段值转为小写字符串（用于 contains / keywords）
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(x), Value::String(y)) | (Value::String(y), Value::Number(x)) => {
            y.parse::<f64>().ok() == x.as_f64()
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

/// 单个过滤条件对一行是否成立；字段缺失时只有 ne 成立
pub fn filter_matches(row: &Row, filter: &FilterSpec) -> bool {
    let Some(actual) = row.get(&filter.field) else {
        return filter.op == FilterOp::Ne;
    };
    match filter.op {
        FilterOp::Eq => values_equal(actual, &filter.value),
        FilterOp::Ne => !values_equal(actual, &filter.value),
        FilterOp::Contains => text_of(actual).contains(&text_of(&filter.value)),
        FilterOp::In => filter
            .value
            .as_array()
            .map(|items| items.iter().any(|v| values_equal(actual, v)))
            .unwrap_or(false),
        FilterOp::Gte => matches!(
            compare(actual, &filter.value),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        FilterOp::Lte => matches!(
            compare(actual, &filter.value),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
    }
}

/// 每个关键词都出现在某个字段中
fn keywords_match(row: &Row, keywords: &[String]) -> bool {
    keywords
        .iter()
        .all(|k| row.values().any(|v| text_of(v).contains(k.as_str())))
}

/// 时间点：绝对时间或相对 as_of 的分钟数
#[derive(Debug, Clone, Deserialize)]
struct Stamp {
    #[serde(default)]
    at: Option<DateTime<Utc>>,
    #[serde(default)]
    minutes_ago: Option<i64>,
}

impl Stamp {
    fn resolve(&self, as_of: DateTime<Utc>) -> DateTime<Utc> {
        match (self.at, self.minutes_ago) {
            (Some(at), _) => at,
            (None, Some(m)) => TimeDelta::try_minutes(m)
                .and_then(|delta| as_of.checked_sub_signed(delta))
                .unwrap_or(if m >= 0 { DateTime::<Utc>::MIN_UTC } else { DateTime::<Utc>::MAX_UTC }),
            (None, None) => as_of,
        }
    }
}

// ---------- tabular ----------

pub struct TabularTool {
    meta: ToolMeta,
    datasets: HashMap<String, Vec<Row>>,
}

impl TabularTool {
    pub fn new(tool_type: &str, datasets: HashMap<String, Vec<Row>>) -> Self {
        Self {
            meta: ToolMeta::new(tool_type, "in-memory configuration item tables"),
            datasets,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.meta.ttl = Some(ttl);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.meta.latency = Some(latency);
        self
    }
}

#[async_trait]
impl Tool for TabularTool {
    fn tool_type(&self) -> &str {
        &self.meta.tool_type
    }

    fn backend(&self) -> Backend {
        Backend::Tabular
    }

    fn description(&self) -> &str {
        &self.meta.description
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.meta.ttl
    }

    async fn execute(
        &self,
        operation: &str,
        params: &Value,
        _ctx: &ToolContext,
    ) -> Result<ResultSet, ToolError> {
        check_operation("query_rows", operation)?;
        self.meta.simulate_latency().await;

        let source = str_param(params, "source")
            .ok_or_else(|| ToolError::fatal("source is required"))?;
        let rows = self
            .datasets
            .get(source)
            .ok_or_else(|| ToolError::fatal(format!("unknown source: {source}")))?;
        let keywords = list_param(params, "keywords");
        let filters: Vec<FilterSpec> = match params.get("filters") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ToolError::fatal(format!("invalid filters: {e}")))?,
            None => Vec::new(),
        };
        let fields: Vec<String> = params
            .get("fields")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let limit = usize_param(params, "limit").unwrap_or(usize::MAX);

        let matched: Vec<&Row> = rows
            .iter()
            .filter(|row| filters.iter().all(|f| filter_matches(row, f)))
            .filter(|row| keywords_match(row, &keywords))
            .take(limit)
            .collect();

        let columns = if fields.is_empty() {
            let mut cols: Vec<String> = Vec::new();
            for row in &matched {
                for key in row.keys() {
                    if !cols.contains(key) {
                        cols.push(key.clone());
                    }
                }
            }
            cols
        } else {
            fields.clone()
        };

        let projected = matched
            .into_iter()
            .map(|row| {
                if fields.is_empty() {
                    row.clone()
                } else {
                    fields
                        .iter()
                        .map(|f| (f.clone(), row.get(f).cloned().unwrap_or(Value::Null)))
                        .collect()
                }
            })
            .collect();

        Ok(ResultSet::new(columns, projected).with_meta("source", json!(source)))
    }
}

// ---------- metric ----------

#[derive(Debug, Clone, Deserialize)]
pub struct MetricPoint {
    pub metric: String,
    /// 实体类型（service / host）
    pub entity: String,
    /// 实例名
    pub name: String,
    pub value: f64,
    #[serde(flatten)]
    stamp: Stamp,
}

impl MetricPoint {
    pub fn relative(metric: &str, entity: &str, name: &str, minutes_ago: i64, value: f64) -> Self {
        Self {
            metric: metric.to_string(),
            entity: entity.to_string(),
            name: name.to_string(),
            value,
            stamp: Stamp {
                at: None,
                minutes_ago: Some(minutes_ago),
            },
        }
    }
}

pub struct MetricTool {
    meta: ToolMeta,
    points: Vec<MetricPoint>,
    /// 每 n 个点取一个（汇总存储）
    downsample: usize,
    default_window_minutes: u64,
}

impl MetricTool {
    pub fn new(tool_type: &str, points: Vec<MetricPoint>) -> Self {
        Self {
            meta: ToolMeta::new(tool_type, "in-memory metric time series"),
            points,
            downsample: 1,
            default_window_minutes: 60,
        }
    }

    pub fn with_downsample(mut self, n: usize) -> Self {
        self.downsample = n.max(1);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.meta.ttl = Some(ttl);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.meta.latency = Some(latency);
        self
    }
}

pub fn aggregate(values: &[f64], aggregation: Aggregation) -> Option<f64> {
    if values.is_empty() {
        return match aggregation {
            Aggregation::Count => Some(0.0),
            _ => None,
        };
    }
    let value = match aggregation {
        Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Max => values.iter().copied().fold(f64::MIN, f64::max),
        Aggregation::Min => values.iter().copied().fold(f64::MAX, f64::min),
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Count => values.len() as f64,
        Aggregation::Last => *values.last()?,
    };
    Some(value)
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[async_trait]
impl Tool for MetricTool {
    fn tool_type(&self) -> &str {
        &self.meta.tool_type
    }

    fn backend(&self) -> Backend {
        Backend::Metric
    }

    fn description(&self) -> &str {
        &self.meta.description
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.meta.ttl
    }

    async fn execute(
        &self,
        operation: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Result<ResultSet, ToolError> {
        check_operation("query_metric", operation)?;
        self.meta.simulate_latency().await;

        let metric = str_param(params, "metric")
            .ok_or_else(|| ToolError::fatal("metric is required"))?;
        let entity = str_param(params, "entity");
        let keywords = list_param(params, "keywords");
        let aggregation: Aggregation = params
            .get("aggregation")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| ToolError::fatal(format!("invalid aggregation: {e}")))?
            .unwrap_or_default();
        let start = match window_start(params, ctx.as_of)? {
            Some(start) => start,
            None => minutes_before(ctx.as_of, self.default_window_minutes)?,
        };
        let group_by = str_param(params, "group_by");

        let mut series: Vec<(String, DateTime<Utc>, f64)> = self
            .points
            .iter()
            .filter(|p| p.metric.eq_ignore_ascii_case(metric))
            .filter(|p| entity.map(|e| p.entity.eq_ignore_ascii_case(e)).unwrap_or(true))
            .filter(|p| {
                let name = p.name.to_lowercase();
                keywords.iter().all(|k| name.contains(k.as_str()))
            })
            .map(|p| (p.name.clone(), p.stamp.resolve(ctx.as_of), p.value))
            .filter(|(_, ts, _)| *ts >= start && *ts <= ctx.as_of)
            .collect();
        series.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let series: Vec<_> = series
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % self.downsample == 0)
            .map(|(_, p)| p)
            .collect();

        let values: Vec<f64> = series.iter().map(|(_, _, v)| *v).collect();
        let overall = aggregate(&values, aggregation);

        let (columns, rows) = if group_by.is_some() {
            let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
            for (name, _, value) in &series {
                groups.entry(name.as_str()).or_default().push(*value);
            }
            let rows = groups
                .into_iter()
                .map(|(name, vals)| {
                    let mut row = Row::new();
                    row.insert("name".into(), json!(name));
                    row.insert(
                        "value".into(),
                        aggregate(&vals, aggregation).map(number).unwrap_or(Value::Null),
                    );
                    row
                })
                .collect();
            (vec!["name".to_string(), "value".to_string()], rows)
        } else {
            let rows = series
                .iter()
                .map(|(name, ts, value)| {
                    let mut row = Row::new();
                    row.insert("ts".into(), json!(ts.to_rfc3339()));
                    row.insert("name".into(), json!(name));
                    row.insert("value".into(), number(*value));
                    row
                })
                .collect();
            (
                vec!["ts".to_string(), "name".to_string(), "value".to_string()],
                rows,
            )
        };

        Ok(ResultSet::new(columns, rows)
            .with_meta("metric", json!(metric))
            .with_meta("aggregation", json!(aggregation))
            .with_meta("aggregate", overall.map(number).unwrap_or(Value::Null))
            .with_meta("points", json!(values.len())))
    }
}

// ---------- graph ----------

#[derive(Debug, Clone, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub relation: String,
}

pub struct GraphTool {
    meta: ToolMeta,
    edges: Vec<Edge>,
    default_depth: u32,
}

impl GraphTool {
    pub fn new(tool_type: &str, edges: Vec<Edge>) -> Self {
        Self {
            meta: ToolMeta::new(tool_type, "in-memory dependency topology"),
            edges,
            default_depth: 1,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.meta.ttl = Some(ttl);
        self
    }
}

#[async_trait]
impl Tool for GraphTool {
    fn tool_type(&self) -> &str {
        &self.meta.tool_type
    }

    fn backend(&self) -> Backend {
        Backend::Graph
    }

    fn description(&self) -> &str {
        &self.meta.description
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.meta.ttl
    }

    async fn execute(
        &self,
        operation: &str,
        params: &Value,
        _ctx: &ToolContext,
    ) -> Result<ResultSet, ToolError> {
        check_operation("traverse", operation)?;
        self.meta.simulate_latency().await;

        let root = str_param(params, "root")
            .ok_or_else(|| ToolError::fatal("root is required"))?
            .to_lowercase();
        let depth = params
            .get("depth")
            .and_then(|v| v.as_u64())
            .map(|d| d as u32)
            .unwrap_or(self.default_depth);
        let relations = list_param(params, "relations");

        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut used: Vec<usize> = Vec::new();
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        visited.insert(root.clone());
        queue.push_back((root, 0));

        while let Some((node, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            for (i, edge) in self.edges.iter().enumerate() {
                if !relations.is_empty() && !relations.contains(&edge.relation.to_lowercase()) {
                    continue;
                }
                let from = edge.from.to_lowercase();
                let to = edge.to.to_lowercase();
                let next = if from == node {
                    to
                } else if to == node {
                    from
                } else {
                    continue;
                };
                if !used.contains(&i) {
                    used.push(i);
                }
                if visited.insert(next.clone()) {
                    queue.push_back((next, level + 1));
                }
            }
        }

        let rows: Vec<Row> = used
            .iter()
            .map(|&i| {
                let edge = &self.edges[i];
                let mut row = Row::new();
                row.insert("from".into(), json!(edge.from));
                row.insert("relation".into(), json!(edge.relation));
                row.insert("to".into(), json!(edge.to));
                row
            })
            .collect();
        let nodes: Vec<String> = if rows.is_empty() {
            Vec::new()
        } else {
            visited.into_iter().collect()
        };

        Ok(ResultSet::new(
            vec!["from".to_string(), "relation".to_string(), "to".to_string()],
            rows,
        )
        .with_meta("nodes", json!(nodes)))
    }
}

// ---------- history ----------

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    pub entity: String,
    pub name: String,
    pub kind: String,
    pub summary: String,
    #[serde(flatten)]
    stamp: Stamp,
}

impl ChangeEvent {
    pub fn relative(entity: &str, name: &str, kind: &str, summary: &str, minutes_ago: i64) -> Self {
        Self {
            entity: entity.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            summary: summary.to_string(),
            stamp: Stamp {
                at: None,
                minutes_ago: Some(minutes_ago),
            },
        }
    }
}

pub struct HistoryTool {
    meta: ToolMeta,
    events: Vec<ChangeEvent>,
}

impl HistoryTool {
    pub fn new(tool_type: &str, events: Vec<ChangeEvent>) -> Self {
        Self {
            meta: ToolMeta::new(tool_type, "in-memory change and incident log"),
            events,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.meta.ttl = Some(ttl);
        self
    }
}

#[async_trait]
impl Tool for HistoryTool {
    fn tool_type(&self) -> &str {
        &self.meta.tool_type
    }

    fn backend(&self) -> Backend {
        Backend::History
    }

    fn description(&self) -> &str {
        &self.meta.description
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.meta.ttl
    }

    async fn execute(
        &self,
        operation: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Result<ResultSet, ToolError> {
        check_operation("list_events", operation)?;
        self.meta.simulate_latency().await;

        let entity = str_param(params, "entity");
        let keywords = list_param(params, "keywords");
        let event_types = list_param(params, "event_types");
        let start = window_start(params, ctx.as_of)?;
        let limit = usize_param(params, "limit").unwrap_or(usize::MAX);

        let mut events: Vec<(DateTime<Utc>, &ChangeEvent)> = self
            .events
            .iter()
            .filter(|e| entity.map(|x| e.entity.eq_ignore_ascii_case(x)).unwrap_or(true))
            .filter(|e| event_types.is_empty() || event_types.contains(&e.kind.to_lowercase()))
            .filter(|e| {
                let text = format!("{} {}", e.name, e.summary).to_lowercase();
                keywords.iter().all(|k| text.contains(k.as_str()))
            })
            .map(|e| (e.stamp.resolve(ctx.as_of), e))
            .filter(|(ts, _)| *ts <= ctx.as_of && start.map(|s| *ts >= s).unwrap_or(true))
            .collect();
        events.sort_by(|a, b| b.0.cmp(&a.0));

        let rows = events
            .into_iter()
            .take(limit)
            .map(|(ts, e)| {
                let mut row = Row::new();
                row.insert("at".into(), json!(ts.to_rfc3339()));
                row.insert("kind".into(), json!(e.kind));
                row.insert("name".into(), json!(e.name));
                row.insert("summary".into(), json!(e.summary));
                row
            })
            .collect();

        Ok(ResultSet::new(
            vec![
                "at".to_string(),
                "kind".to_string(),
                "name".to_string(),
                "summary".to_string(),
            ],
            rows,
        ))
    }
}

// ---------- fixtures ----------

#[derive(Debug, Deserialize)]
struct FixtureFile {
    tool_type: String,
    backend: Backend,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    latency_ms: Option<u64>,
    #[serde(default)]
    downsample: Option<usize>,
    data: Value,
}

fn fixture_error(path: &Path, e: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Config(format!("fixture {}: {e}", path.display()))
}

/// 读取目录下所有 `*.json` fixture（按文件名排序），每个文件一个工具
pub fn load_fixture_tools(dir: &Path) -> Result<Vec<Arc<dyn Tool>>, OrchestrationError> {
    let entries = std::fs::read_dir(dir).map_err(|e| fixture_error(dir, e))?;
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
        .collect();
    paths.sort();

    let mut tools: Vec<Arc<dyn Tool>> = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|e| fixture_error(&path, e))?;
        let file: FixtureFile = serde_json::from_str(&text).map_err(|e| fixture_error(&path, e))?;
        let mut meta = ToolMeta::new(
            &file.tool_type,
            file.description.as_deref().unwrap_or_default(),
        );
        meta.ttl = file.ttl_secs.map(Duration::from_secs);
        meta.latency = file.latency_ms.map(Duration::from_millis);

        let tool: Arc<dyn Tool> = match file.backend {
            Backend::Tabular => {
                let datasets: HashMap<String, Vec<Row>> =
                    serde_json::from_value(file.data).map_err(|e| fixture_error(&path, e))?;
                let mut tool = TabularTool::new(&file.tool_type, datasets);
                tool.meta = merge_meta(tool.meta, meta);
                Arc::new(tool)
            }
            Backend::Metric => {
                let points: Vec<MetricPoint> =
                    serde_json::from_value(file.data).map_err(|e| fixture_error(&path, e))?;
                let mut tool = MetricTool::new(&file.tool_type, points)
                    .with_downsample(file.downsample.unwrap_or(1));
                tool.meta = merge_meta(tool.meta, meta);
                Arc::new(tool)
            }
            Backend::Graph => {
                let edges: Vec<Edge> =
                    serde_json::from_value(file.data).map_err(|e| fixture_error(&path, e))?;
                let mut tool = GraphTool::new(&file.tool_type, edges);
                tool.meta = merge_meta(tool.meta, meta);
                Arc::new(tool)
            }
            Backend::History => {
                let events: Vec<ChangeEvent> =
                    serde_json::from_value(file.data).map_err(|e| fixture_error(&path, e))?;
                let mut tool = HistoryTool::new(&file.tool_type, events);
                tool.meta = merge_meta(tool.meta, meta);
                Arc::new(tool)
            }
        };
        tracing::info!(tool = %file.tool_type, backend = %file.backend, "fixture tool loaded");
        tools.push(tool);
    }
    Ok(tools)
}

/// fixture 中未写描述时保留工具默认描述
fn merge_meta(default: ToolMeta, loaded: ToolMeta) -> ToolMeta {
    ToolMeta {
        description: if loaded.description.is_empty() {
            default.description
        } else {
            loaded.description
        },
        ..loaded
    }
}
