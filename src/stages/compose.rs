//! Compose 阶段：按 MappingAsset 规则把结果集映射为回答块
//!
//! 失败或未解析的规格转为 Notice 块；证据行数低于 min_evidence 或必需规则无数据时报告 low_evidence。
//! full 模式下可选地调用生成器写一段叙述摘要，失败只记警告。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::execute::{ExecuteOutput, SpecResult};
use super::{Diagnostics, RunMode, StageContext, StageExecutor, StageInput, StageName, StageOutcome};
use crate::answer::{AnswerBlock, BlockKind, GraphEdge, NoticeLevel, TimelineEvent};
use crate::assets::MappingRule;
use crate::core::OrchestrationError;
use crate::llm::StructuredGenerator;
use crate::plan::{Plan, SpecRef};
use crate::replan::{Trigger, TriggerType};
use crate::tools::ResultSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeInput {
    pub plan: Plan,
    pub execution: ExecuteOutput,
}

impl StageInput for ComposeInput {
    fn check(&self) -> Result<(), OrchestrationError> {
        if self.execution.results.is_empty() && self.execution.unresolved.is_empty() {
            return Err(OrchestrationError::Validation(
                "compose needs at least one execution result".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeOutput {
    /// 摘要或确定性标题
    pub answer: String,
    pub blocks: Vec<AnswerBlock>,
    pub evidence_rows: usize,
}

pub struct ComposeStage {
    generator: Option<Arc<dyn StructuredGenerator>>,
    summary_timeout: Duration,
}

impl ComposeStage {
    pub fn new(generator: Option<Arc<dyn StructuredGenerator>>) -> Self {
        Self {
            generator,
            summary_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_summary_timeout(mut self, timeout: Duration) -> Self {
        self.summary_timeout = timeout;
        self
    }

    async fn summarize(
        &self,
        generator: &dyn StructuredGenerator,
        plan: &Plan,
        blocks: &[AnswerBlock],
        ctx: &StageContext<'_>,
    ) -> Result<String, String> {
        let rendered = serde_json::to_string(blocks).map_err(|e| e.to_string())?;
        let prompt = ctx
            .assets
            .prompt()
            .summary_template
            .replace("{question}", &plan.question)
            .replace("{blocks}", &rendered);
        let schema = json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}},
            "required": ["summary"]
        });
        let deadline = ctx
            .deadline
            .min(tokio::time::Instant::now() + self.summary_timeout);
        let value = tokio::time::timeout_at(deadline, generator.generate(&prompt, &schema))
            .await
            .map_err(|_| "summary generation timed out".to_string())??;
        value
            .get("summary")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "summary output has no 'summary' string".to_string())
    }
}

/// 标题模板中的实体名
fn entity_label(plan: &Plan, result: &SpecResult) -> String {
    let from_spec = match result.spec {
        SpecRef::Primary | SpecRef::Secondary(_) => plan
            .tabular(result.spec)
            .and_then(|t| t.entity.clone().or_else(|| t.source.clone())),
        SpecRef::Metric => plan.spec.metric.as_ref().and_then(|m| m.entity.clone()),
        SpecRef::History => plan.spec.history.as_ref().and_then(|h| h.entity.clone()),
        SpecRef::Graph => plan.spec.graph.as_ref().and_then(|g| g.root.clone()),
    };
    from_spec.unwrap_or_else(|| result.backend.to_string())
}

fn render_title(template: Option<&str>, plan: &Plan, result: &SpecResult) -> String {
    let metric = result
        .call
        .params
        .get("metric")
        .and_then(|v| v.as_str())
        .unwrap_or("metric");
    let source = result
        .call
        .params
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or(&result.call.tool_type);
    template
        .unwrap_or("{entity}")
        .replace("{entity}", &entity_label(plan, result))
        .replace("{metric}", metric)
        .replace("{source}", source)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn text(row: &Map<String, Value>, key: &str) -> String {
    row.get(key).map(value_text).unwrap_or_default()
}

/// 按规则把一个成功结果转为回答块
fn map_result(rule: &MappingRule, plan: &Plan, result: &SpecResult) -> AnswerBlock {
    let title = render_title(rule.title.as_deref(), plan, result);
    let empty = ResultSet::default();
    let data = result.result.data.as_ref().unwrap_or(&empty);
    let limit = rule.max_rows.unwrap_or(usize::MAX);

    match rule.block {
        BlockKind::Metric => AnswerBlock::Metric {
            title,
            metric: data
                .meta
                .get("metric")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            aggregation: data
                .meta
                .get("aggregation")
                .and_then(|v| v.as_str())
                .unwrap_or("avg")
                .to_string(),
            value: data.meta.get("aggregate").and_then(|v| v.as_f64()),
            points: data
                .meta
                .get("points")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
                .unwrap_or(data.rows.len()),
        },
        BlockKind::Timeline => AnswerBlock::Timeline {
            title,
            events: data
                .rows
                .iter()
                .take(limit)
                .map(|row| TimelineEvent {
                    at: text(row, "at"),
                    kind: text(row, "kind"),
                    entity: text(row, "name"),
                    summary: text(row, "summary"),
                })
                .collect(),
        },
        BlockKind::Graph => {
            let edges: Vec<GraphEdge> = data
                .rows
                .iter()
                .take(limit)
                .map(|row| GraphEdge {
                    from: text(row, "from"),
                    to: text(row, "to"),
                    relation: text(row, "relation"),
                })
                .collect();
            let mut nodes: Vec<String> = data
                .meta
                .get("nodes")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            if nodes.is_empty() {
                for edge in &edges {
                    for node in [&edge.from, &edge.to] {
                        if !nodes.contains(node) {
                            nodes.push(node.clone());
                        }
                    }
                }
            }
            AnswerBlock::Graph {
                title,
                nodes,
                edges,
            }
        }
        BlockKind::Text | BlockKind::Notice => {
            let body = data
                .rows
                .iter()
                .take(limit)
                .map(|row| {
                    row.iter()
                        .map(|(k, v)| format!("{k}: {}", value_text(v)))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .collect::<Vec<_>>()
                .join("\n");
            AnswerBlock::Text {
                title: Some(title),
                body,
            }
        }
        BlockKind::Table => {
            let columns = if rule.fields.is_empty() {
                data.columns.clone()
            } else {
                rule.fields.clone()
            };
            let rows = data
                .rows
                .iter()
                .take(limit)
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect();
            AnswerBlock::Table {
                title,
                columns,
                rows,
            }
        }
    }
}

/// 没有摘要时的确定性标题
fn headline(plan: &Plan, blocks: &[AnswerBlock], evidence: usize) -> String {
    let data_blocks = blocks
        .iter()
        .filter(|b| !matches!(b.kind(), BlockKind::Notice | BlockKind::Text))
        .count();
    if data_blocks == 0 {
        return format!("No data found for \"{}\".", plan.question);
    }
    format!(
        "Found {evidence} row(s) across {data_blocks} block(s) for \"{}\".",
        plan.question
    )
}

#[async_trait]
impl StageExecutor for ComposeStage {
    type Input = ComposeInput;
    type Output = ComposeOutput;

    fn stage(&self) -> StageName {
        StageName::Compose
    }

    async fn execute(
        &self,
        input: &ComposeInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome<ComposeOutput>, OrchestrationError> {
        let plan = &input.plan;
        let mapping = ctx.assets.mapping();
        let mut diagnostics = Diagnostics::default();
        let mut triggers = Vec::new();
        let mut blocks = Vec::new();
        let mut notices = Vec::new();

        for result in &input.execution.results {
            if !result.result.success {
                let message = result
                    .result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "unknown failure".to_string());
                notices.push(AnswerBlock::notice(
                    NoticeLevel::Warning,
                    format!("{} unavailable: {message}", result.spec),
                ));
                continue;
            }
            match mapping.rule_for(result.backend, &plan.spec.output.blocks) {
                Some(rule) => blocks.push(map_result(rule, plan, result)),
                None => diagnostics.warn(format!("no mapping rule for {} backend", result.backend)),
            }
        }
        for unresolved in &input.execution.unresolved {
            notices.push(AnswerBlock::notice(
                NoticeLevel::Warning,
                format!("{} skipped: '{}' could not be resolved", unresolved.spec, unresolved.slot),
            ));
        }

        let evidence: usize = blocks.iter().map(|b| b.evidence_rows()).sum();
        diagnostics.count("blocks", blocks.len() as u64);
        diagnostics.count("evidence_rows", evidence as u64);

        if evidence > 0 && evidence < mapping.min_evidence {
            triggers.push(Trigger::soft(
                TriggerType::LowEvidence,
                StageName::Compose,
                format!("{evidence} evidence row(s), need {}", mapping.min_evidence),
            ));
        }
        for rule in mapping.rules.iter().filter(|r| r.required) {
            let has_spec = plan.data_specs().iter().any(|s| s.backend() == rule.backend);
            let has_data = input
                .execution
                .results
                .iter()
                .any(|r| r.backend == rule.backend && r.result.success && r.result.row_count() > 0);
            if has_spec && !has_data {
                let spec = plan
                    .data_specs()
                    .into_iter()
                    .find(|s| s.backend() == rule.backend);
                let mut trigger = Trigger::soft(
                    TriggerType::LowEvidence,
                    StageName::Compose,
                    format!("required {} data is missing", rule.backend),
                );
                if let Some(spec) = spec {
                    trigger = trigger.with_spec(spec);
                }
                triggers.push(trigger);
            }
        }

        let wants_summary = ctx.mode == RunMode::Full
            && plan.spec.output.summarize
            && mapping.summarize
            && evidence > 0;
        let mut summary = None;
        if wants_summary {
            match &self.generator {
                Some(_) if ctx.deadline_exceeded() => {
                    diagnostics.warn("summary skipped: deadline exceeded");
                }
                Some(generator) => match self.summarize(generator.as_ref(), plan, &blocks, ctx).await {
                    Ok(text) => summary = Some(text),
                    Err(e) => diagnostics.warn(format!("summary failed: {e}")),
                },
                None => {}
            }
        }

        let answer = summary
            .clone()
            .unwrap_or_else(|| headline(plan, &blocks, evidence));
        let mut all = Vec::with_capacity(blocks.len() + notices.len() + 1);
        if let Some(body) = summary {
            all.push(AnswerBlock::Text {
                title: Some("Summary".to_string()),
                body,
            });
        }
        all.extend(blocks);
        all.extend(notices);
        if all.is_empty() {
            all.push(AnswerBlock::notice(NoticeLevel::Info, "no displayable data"));
        }

        Ok(StageOutcome::new(
            ComposeOutput {
                answer,
                blocks: all,
                evidence_rows: evidence,
            },
            diagnostics,
            triggers,
        ))
    }
}
