//! 规则规划器
//!
//! 不依赖 LLM 的确定性规划：关键词判定意图，SchemaCatalog 识别实体与指标，
//! 正则抽取过滤条件与时间窗口。相同的规范化问题总是得到相同的 PlanDraft。

use std::sync::OnceLock;

use regex::Regex;

use super::types::{
    Aggregation, FilterOp, FilterSpec, GraphSpec, HistorySpec, Intent, MetricSpec, OutputSpec,
    PlanDraft, PlanSpec, TabularSpec, TimeWindow, View,
};
use crate::answer::BlockKind;
use crate::assets::{EntityDef, SchemaCatalog};
use crate::stages::RunMode;

const WRITE_VERBS: &[&str] = &[
    "delete", "drop", "restart", "shutdown", "kill", "modify", "update", "insert", "truncate",
    "reboot", "scale", "rollback",
];

const GREETINGS: &[&str] = &["hi", "hello", "hey", "help", "thanks", "thank you"];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "of", "for", "in", "on", "to", "and", "or", "with", "show", "list", "me",
    "what", "which", "is", "are", "was", "were", "last", "over", "by", "from", "all", "get",
    "find", "give", "where", "how", "many", "much", "did", "does", "do", "minutes", "minute",
    "hours", "hour", "days", "day", "vs", "versus", "compare", "between",
];

fn filter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([a-z_][a-z0-9_]*)\s*(!=|>=|<=|=|\bis\b)\s*"?([a-z0-9][a-z0-9_.\-:/]*)"?"#)
            .unwrap_or_else(|e| panic!("static filter regex: {e}"))
    })
}

fn window_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\blast\s+(\d+)?\s*(m|min|mins|minutes?|h|hrs?|hours?|d|days?)\b")
            .unwrap_or_else(|e| panic!("static window regex: {e}"))
    })
}

/// 基于关键词与实体目录的规划器
pub struct RulePlanner;

impl RulePlanner {
    pub fn draft(question: &str, schema: &SchemaCatalog, mode: RunMode) -> PlanDraft {
        let tokens: Vec<&str> = question.split_whitespace().collect();
        let has_word = |w: &str| tokens.iter().any(|t| t.trim_matches('"') == w);

        if WRITE_VERBS.iter().any(|v| has_word(v)) {
            return PlanDraft::Reject {
                reason: "only read-only analytical questions are supported".to_string(),
            };
        }

        if question.is_empty()
            || GREETINGS.contains(&question)
            || question.starts_with("help")
            || question.starts_with("what can you")
        {
            return PlanDraft::Direct {
                answer: usage_text(schema),
            };
        }

        let metric = Self::detect_metric(&tokens, schema);
        let entity = Self::detect_entity(&tokens, schema)
            .or_else(|| metric.as_deref().and_then(|m| schema.entity_for_metric(m)))
            .or_else(|| schema.entities.first());
        let filters = entity
            .map(|e| Self::extract_filters(question, e))
            .unwrap_or_default();
        let window = Self::extract_window(question);
        let keywords = Self::extract_keywords(&tokens, schema, &filters);
        let intent = Self::classify(question, &tokens, metric.is_some(), window.is_some());

        let entity_name = entity.map(|e| e.name.clone());
        let tabular = TabularSpec {
            entity: entity_name.clone(),
            source: entity.map(|e| e.source.clone()),
            keywords: keywords.clone(),
            filters,
            fields: Vec::new(),
            limit: None,
        };
        let metric_spec = |aggregation, group_by: Option<String>| MetricSpec {
            metric: metric.clone(),
            entity: entity_name.clone(),
            keywords: keywords.clone(),
            aggregation,
            window,
            group_by,
        };

        let mut spec = PlanSpec {
            intent,
            view: View::Table,
            primary: None,
            secondary: Vec::new(),
            graph: None,
            metric: None,
            history: None,
            output: OutputSpec {
                summarize: mode == RunMode::Full,
                ..Default::default()
            },
        };

        match intent {
            Intent::Lookup => {
                spec.primary = Some(tabular);
                spec.output.blocks = vec![BlockKind::Table];
            }
            Intent::Aggregate => {
                spec.view = View::Summary;
                spec.metric = Some(metric_spec(Self::aggregation(&tokens), None));
                spec.output.blocks = vec![BlockKind::Metric];
            }
            Intent::Trend => {
                spec.view = View::Chart;
                spec.metric = Some(metric_spec(Aggregation::Avg, None));
                spec.output.blocks = vec![BlockKind::Table];
            }
            Intent::Compare => {
                spec.metric = Some(metric_spec(
                    Self::aggregation(&tokens),
                    Some("name".to_string()),
                ));
                spec.output.blocks = vec![BlockKind::Table];
            }
            Intent::Relationship => {
                spec.view = View::Topology;
                spec.graph = Some(GraphSpec {
                    root: keywords.first().cloned(),
                    depth: None,
                    relations: Vec::new(),
                });
                spec.primary = Some(tabular);
                spec.output.blocks = vec![BlockKind::Graph, BlockKind::Table];
            }
            Intent::History => {
                spec.view = View::Timeline;
                spec.history = Some(HistorySpec {
                    entity: entity_name,
                    keywords,
                    event_types: Self::event_types(&tokens),
                    window,
                    limit: None,
                });
                spec.output.blocks = vec![BlockKind::Timeline];
            }
        }

        PlanDraft::Plan(spec)
    }

    /// 意图判定；优先级 compare > relationship > history > trend > aggregate > lookup
    pub fn classify(question: &str, tokens: &[&str], has_metric: bool, has_window: bool) -> Intent {
        let any = |words: &[&str]| words.iter().any(|w| tokens.contains(w));

        if any(&["compare", "vs", "versus"]) && has_metric {
            return Intent::Compare;
        }
        if any(&[
            "depend", "depends", "dependency", "dependencies", "upstream", "downstream",
            "connected", "topology", "related", "calls",
        ]) {
            return Intent::Relationship;
        }
        if any(&[
            "changed", "change", "changes", "history", "deploy", "deployed", "deploys",
            "deployment", "deployments", "incident", "incidents", "events", "happened",
        ]) {
            return Intent::History;
        }
        if has_metric {
            if any(&["trend", "chart", "graph", "timeline"]) || question.contains("over time") {
                return Intent::Trend;
            }
            if any(&[
                "average", "avg", "mean", "max", "maximum", "peak", "min", "minimum", "sum",
                "total", "count",
            ]) {
                return Intent::Aggregate;
            }
            return if has_window {
                Intent::Trend
            } else {
                Intent::Aggregate
            };
        }
        Intent::Lookup
    }

    fn aggregation(tokens: &[&str]) -> Aggregation {
        let any = |words: &[&str]| words.iter().any(|w| tokens.contains(w));
        if any(&["max", "maximum", "peak", "highest"]) {
            Aggregation::Max
        } else if any(&["min", "minimum", "lowest"]) {
            Aggregation::Min
        } else if any(&["sum", "total"]) {
            Aggregation::Sum
        } else if any(&["count"]) {
            Aggregation::Count
        } else if any(&["current", "latest", "now"]) {
            Aggregation::Last
        } else {
            Aggregation::Avg
        }
    }

    fn event_types(tokens: &[&str]) -> Vec<String> {
        let mut types = Vec::new();
        for token in tokens {
            let kind = match *token {
                "deploy" | "deployed" | "deploys" | "deployment" | "deployments" => "deploy",
                "incident" | "incidents" => "incident",
                "config" => "config_change",
                _ => continue,
            };
            if !types.iter().any(|t| t == kind) {
                types.push(kind.to_string());
            }
        }
        types
    }

    fn detect_entity<'a>(tokens: &[&str], schema: &'a SchemaCatalog) -> Option<&'a EntityDef> {
        tokens.iter().find_map(|t| {
            schema
                .entities
                .iter()
                .find(|e| e.name == *t || e.source == *t)
        })
    }

    fn detect_metric(tokens: &[&str], schema: &SchemaCatalog) -> Option<String> {
        tokens.iter().find_map(|t| {
            schema
                .entities
                .iter()
                .flat_map(|e| e.metrics.iter())
                .find(|m| m.as_str() == *t)
                .cloned()
        })
    }

    /// `field = value`、`field is value` 等形式，仅保留实体上存在的字段
    fn extract_filters(question: &str, entity: &EntityDef) -> Vec<FilterSpec> {
        filter_regex()
            .captures_iter(question)
            .filter_map(|cap| {
                let field = cap.get(1)?.as_str();
                if !entity.has_field(field) {
                    return None;
                }
                let raw = cap.get(3)?.as_str();
                let op = match cap.get(2)?.as_str() {
                    "!=" => FilterOp::Ne,
                    ">=" => FilterOp::Gte,
                    "<=" => FilterOp::Lte,
                    _ => FilterOp::Eq,
                };
                let value = match op {
                    FilterOp::Gte | FilterOp::Lte => raw
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(serde_json::Value::Number)
                        .unwrap_or_else(|| raw.into()),
                    _ => raw.into(),
                };
                Some(FilterSpec {
                    field: field.to_string(),
                    op,
                    value,
                })
            })
            .collect()
    }

    fn extract_window(question: &str) -> Option<TimeWindow> {
        let cap = window_regex().captures(question)?;
        let n: u64 = cap
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);
        let unit = cap.get(2)?.as_str();
        let minutes = match unit.chars().next() {
            Some('h') => n * 60,
            Some('d') => n * 24 * 60,
            _ => n,
        };
        Some(TimeWindow {
            last_minutes: minutes.max(1),
        })
    }

    /// 标识符样式的词（含数字、`-`、`.`）或引号内的值；过滤条件已用到的值不重复
    fn extract_keywords(tokens: &[&str], schema: &SchemaCatalog, filters: &[FilterSpec]) -> Vec<String> {
        let filter_values: Vec<String> = filters
            .iter()
            .filter_map(|f| f.value.as_str().map(|s| s.to_string()))
            .collect();
        let is_schema_word = |t: &str| {
            schema.entities.iter().any(|e| {
                e.name == t || e.source == t || e.has_field(t) || e.metrics.iter().any(|m| m == t)
            })
        };

        let mut keywords: Vec<String> = Vec::new();
        for raw in tokens {
            let quoted = raw.starts_with('"') && raw.ends_with('"') && raw.len() > 2;
            let token = raw.trim_matches('"');
            if token.is_empty()
                || token.contains('=')
                || STOPWORDS.contains(&token)
                || is_schema_word(token)
                || filter_values.iter().any(|v| v == token)
            {
                continue;
            }
            let identifier = token.chars().any(|c| c.is_ascii_digit() || c == '-' || c == '.')
                && token.chars().any(|c| c.is_ascii_alphabetic());
            if (quoted || identifier) && !keywords.iter().any(|k| k == token) {
                keywords.push(token.to_string());
            }
        }
        keywords
    }
}

fn usage_text(schema: &SchemaCatalog) -> String {
    let entities: Vec<&str> = schema.entities.iter().map(|e| e.name.as_str()).collect();
    format!(
        "I answer read-only questions about {}. Try \"show service name = checkout-api\" \
         or \"latency_p99 for checkout-api over the last 2 hours\".",
        entities.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(question: &str) -> PlanSpec {
        match RulePlanner::draft(question, &SchemaCatalog::default(), RunMode::Full) {
            PlanDraft::Plan(spec) => spec,
            other => panic!("expected plan, got {other:?}"),
        }
    }

    #[test]
    fn test_lookup_with_filter() {
        let spec = plan("show service name = checkout");
        assert_eq!(spec.intent, Intent::Lookup);
        let primary = spec.primary.unwrap();
        assert_eq!(primary.source.as_deref(), Some("services"));
        assert_eq!(primary.filters, vec![FilterSpec::eq("name", "checkout")]);
        assert!(primary.keywords.is_empty());
    }

    #[test]
    fn test_trend_with_window() {
        let spec = plan("latency_p99 for checkout-api over the last 2 hours");
        assert_eq!(spec.intent, Intent::Trend);
        let metric = spec.metric.unwrap();
        assert_eq!(metric.metric.as_deref(), Some("latency_p99"));
        assert_eq!(metric.entity.as_deref(), Some("service"));
        assert_eq!(metric.keywords, vec!["checkout-api".to_string()]);
        assert_eq!(metric.window, Some(TimeWindow { last_minutes: 120 }));
    }

    #[test]
    fn test_aggregate_max() {
        let spec = plan("max cpu for host db-01");
        assert_eq!(spec.intent, Intent::Aggregate);
        let metric = spec.metric.unwrap();
        assert_eq!(metric.aggregation, Aggregation::Max);
        assert_eq!(metric.entity.as_deref(), Some("host"));
    }

    #[test]
    fn test_relationship_and_history() {
        let spec = plan("what does checkout-api depend on");
        assert_eq!(spec.intent, Intent::Relationship);
        assert_eq!(spec.graph.unwrap().root.as_deref(), Some("checkout-api"));

        let spec = plan("deployments for checkout-api in the last day");
        assert_eq!(spec.intent, Intent::History);
        let history = spec.history.unwrap();
        assert_eq!(history.event_types, vec!["deploy".to_string()]);
        assert_eq!(history.window, Some(TimeWindow { last_minutes: 1440 }));
    }

    #[test]
    fn test_direct_and_reject() {
        let schema = SchemaCatalog::default();
        assert!(matches!(
            RulePlanner::draft("hello", &schema, RunMode::Fast),
            PlanDraft::Direct { .. }
        ));
        assert!(matches!(
            RulePlanner::draft("restart service checkout-api", &schema, RunMode::Fast),
            PlanDraft::Reject { .. }
        ));
    }
}
