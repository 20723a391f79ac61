//! Execute 阶段：把计划中的每个数据规格解析为一次工具调用，并发执行并汇总
//!
//! - 无法解析必填槽位的规格报告 slot_missing，其余规格照常执行
//! - 每个调用独立受截止时间约束，单个失败不影响其他调用
//! - 成功但零行的规格报告 empty_result；失败按 retryable 报告 tool_error_*
//! - 致命错误只有在没有任何成功、也没有可重试失败时才是 hard

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::validate::ValidatedPlan;
use super::{Diagnostics, StageContext, StageExecutor, StageInput, StageName, StageOutcome};
use crate::assets::{QueryAsset, SchemaCatalog};
use crate::core::{OrchestrationError, ToolError};
use crate::plan::{Backend, Plan, SpecRef};
use crate::replan::{Trigger, TriggerType};
use crate::tools::{
    ResultSource, ScoredTool, SelectionContext, ToolCall, ToolContext, ToolExecutor, ToolResult,
    ToolSelector,
};

use super::validate::AppliedBudget;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub validated: ValidatedPlan,
}

impl StageInput for ExecuteInput {
    fn check(&self) -> Result<(), OrchestrationError> {
        if self.validated.plan.data_specs().is_empty() {
            return Err(OrchestrationError::Validation(
                "validated plan has no data specs".to_string(),
            ));
        }
        Ok(())
    }
}

/// 单个数据规格的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecResult {
    pub spec: SpecRef,
    pub backend: Backend,
    pub call: ToolCall,
    pub result: ToolResult,
    /// 选择器打分（按排名）
    pub ranking: Vec<ScoredTool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedSpec {
    pub spec: SpecRef,
    pub slot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOutput {
    pub plan_revision: u32,
    pub results: Vec<SpecResult>,
    pub unresolved: Vec<UnresolvedSpec>,
}

impl ExecuteOutput {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.result.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.result.success).count()
    }

    pub fn total_rows(&self) -> usize {
        self.results.iter().map(|r| r.result.row_count()).sum()
    }

    pub fn result_for(&self, spec: SpecRef) -> Option<&SpecResult> {
        self.results.iter().find(|r| r.spec == spec)
    }
}

pub struct ExecuteStage {
    executor: Arc<ToolExecutor>,
    selector: Arc<ToolSelector>,
}

impl ExecuteStage {
    pub fn new(executor: Arc<ToolExecutor>, selector: Arc<ToolSelector>) -> Self {
        Self { executor, selector }
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// 在该后端已注册的工具中选出得分最高者
    async fn choose_tool(
        &self,
        plan: &Plan,
        backend: Backend,
        operation: &str,
        params: &Value,
    ) -> Option<(String, Vec<ScoredTool>)> {
        let registered = self.executor.registry().of_backend(backend);
        if registered.is_empty() {
            return None;
        }
        let mut candidates: Vec<String> = self
            .selector
            .candidates(plan.intent())
            .into_iter()
            .filter(|t| registered.contains(t))
            .collect();
        for tool in registered {
            if !candidates.contains(&tool) {
                candidates.push(tool);
            }
        }

        let mut selection = SelectionContext::default();
        for tool in &candidates {
            selection
                .load
                .insert(tool.clone(), self.executor.load(tool));
            let probe = ToolCall::new(tool.as_str(), operation, params.clone());
            selection
                .cache_status
                .insert(tool.clone(), self.executor.is_cached(&probe).await);
            if let Some(avg) = self.executor.tracer().average_duration_ms(tool) {
                selection.estimated_time_ms.insert(tool.clone(), avg);
            }
        }

        let ranking = self.selector.rank(plan.intent(), &candidates, &selection);
        let chosen = ranking.first()?.tool_type.clone();
        Some((chosen, ranking))
    }
}

/// 把一个数据规格转为工具参数；缺少必填槽位时返回槽位名
pub fn build_params(
    plan: &Plan,
    spec: SpecRef,
    schema: &SchemaCatalog,
    query: &QueryAsset,
    budget: &AppliedBudget,
) -> Result<Value, String> {
    let default_limit = query.default_limit.min(budget.max_rows);
    let default_window = query.default_window_minutes.min(budget.max_window_minutes);
    match spec {
        SpecRef::Primary | SpecRef::Secondary(_) => {
            let t = plan.tabular(spec).ok_or_else(|| "spec".to_string())?;
            let source = t
                .source
                .clone()
                .or_else(|| {
                    t.entity
                        .as_deref()
                        .and_then(|e| schema.entity(e))
                        .map(|e| e.source.clone())
                })
                .ok_or_else(|| "source".to_string())?;
            Ok(json!({
                "source": source,
                "keywords": t.keywords,
                "filters": t.filters,
                "fields": t.fields,
                "limit": t.limit.unwrap_or(default_limit),
            }))
        }
        SpecRef::Metric => {
            let m = plan.spec.metric.as_ref().ok_or_else(|| "spec".to_string())?;
            let metric = m.metric.clone().ok_or_else(|| "metric".to_string())?;
            let mut params = json!({
                "metric": metric,
                "entity": m.entity,
                "keywords": m.keywords,
                "aggregation": m.aggregation,
                "last_minutes": m.window.map(|w| w.last_minutes).unwrap_or(default_window),
            });
            if let Some(group_by) = &m.group_by {
                params["group_by"] = json!(group_by);
            }
            Ok(params)
        }
        SpecRef::Graph => {
            let g = plan.spec.graph.as_ref().ok_or_else(|| "spec".to_string())?;
            let root = g.root.clone().ok_or_else(|| "root".to_string())?;
            Ok(json!({
                "root": root,
                "depth": g.depth.unwrap_or(query.default_depth).min(budget.max_depth),
                "relations": g.relations,
            }))
        }
        SpecRef::History => {
            let h = plan.spec.history.as_ref().ok_or_else(|| "spec".to_string())?;
            Ok(json!({
                "entity": h.entity,
                "keywords": h.keywords,
                "event_types": h.event_types,
                "last_minutes": h.window.map(|w| w.last_minutes).unwrap_or(default_window),
                "limit": h.limit.unwrap_or(default_limit),
            }))
        }
    }
}

#[async_trait]
impl StageExecutor for ExecuteStage {
    type Input = ExecuteInput;
    type Output = ExecuteOutput;

    fn stage(&self) -> StageName {
        StageName::Execute
    }

    async fn execute(
        &self,
        input: &ExecuteInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome<ExecuteOutput>, OrchestrationError> {
        let plan = &input.validated.plan;
        let budget = &input.validated.budget;
        let schema = ctx.assets.schema();
        let query = ctx.assets.query();
        let mut diagnostics = Diagnostics::default();
        let mut triggers = Vec::new();
        let mut unresolved = Vec::new();
        for adjustment in &input.validated.adjustments {
            diagnostics.warn(format!("policy adjustment: {adjustment}"));
        }

        // 解析每个规格对应的调用
        let mut planned: Vec<(SpecRef, Backend, ToolCall, Vec<ScoredTool>)> = Vec::new();
        let mut missing_tool: Vec<(SpecRef, Backend, ToolCall)> = Vec::new();
        for spec in plan.data_specs() {
            let backend = spec.backend();
            let operation = query.operation_for(backend).to_string();
            let params = match build_params(plan, spec, schema, query, budget) {
                Ok(params) => params,
                Err(slot) => {
                    diagnostics.warn(format!("{spec}: missing slot '{slot}'"));
                    triggers.push(
                        Trigger::soft(
                            TriggerType::SlotMissing,
                            StageName::Execute,
                            format!("{spec} is missing '{slot}'"),
                        )
                        .with_spec(spec)
                        .with_slot(slot.clone()),
                    );
                    unresolved.push(UnresolvedSpec { spec, slot });
                    continue;
                }
            };
            match self.choose_tool(plan, backend, &operation, &params).await {
                Some((tool, ranking)) => {
                    let call = ToolCall::new(tool, operation, params);
                    planned.push((spec, backend, call, ranking));
                }
                None => {
                    let call = ToolCall::new(format!("{backend}:unavailable"), operation, params);
                    missing_tool.push((spec, backend, call));
                }
            }
        }

        let call_deadline =
            tokio::time::Instant::now() + Duration::from_millis(budget.timeout_ms);
        let tool_ctx = ToolContext::new(ctx.trace_id)
            .with_as_of(ctx.as_of)
            .with_deadline(ctx.deadline.min(call_deadline));

        let outcomes = join_all(
            planned
                .iter()
                .map(|(_, _, call, _)| self.executor.execute(call, &tool_ctx)),
        )
        .await;

        let mut results: Vec<SpecResult> = planned
            .into_iter()
            .zip(outcomes)
            .map(|((spec, backend, call, ranking), result)| SpecResult {
                spec,
                backend,
                call,
                result,
                ranking,
            })
            .collect();
        for (spec, backend, call) in missing_tool {
            let error = ToolError::fatal(format!("no tool registered for {backend} backend"));
            let result = ToolResult::failed(&call, error, 0);
            results.push(SpecResult {
                spec,
                backend,
                call,
                result,
                ranking: Vec::new(),
            });
        }
        let order = plan.data_specs();
        results.sort_by_key(|r| order.iter().position(|s| *s == r.spec));

        let successes = results.iter().filter(|r| r.result.success).count();
        let retryable = results
            .iter()
            .filter(|r| r.result.is_retryable_failure())
            .count();

        for r in &results {
            if r.result.success {
                if r.result.row_count() == 0 {
                    triggers.push(
                        Trigger::soft(
                            TriggerType::EmptyResult,
                            StageName::Execute,
                            format!("{} returned no rows for {}", r.call.tool_type, r.spec),
                        )
                        .with_spec(r.spec)
                        .with_tool(r.call.tool_type.clone()),
                    );
                }
                continue;
            }
            let error = r
                .result
                .error
                .clone()
                .unwrap_or_else(|| ToolError::fatal("unknown failure"));
            diagnostics.error(format!("{} ({}): {}", r.spec, r.call.tool_type, error.message));
            let trigger = if error.retryable {
                Trigger::soft(TriggerType::ToolErrorRetryable, StageName::Execute, error.message)
            } else if successes == 0 && retryable == 0 {
                Trigger::hard(TriggerType::ToolErrorFatal, StageName::Execute, error.message)
            } else {
                Trigger::soft(TriggerType::ToolErrorFatal, StageName::Execute, error.message)
            };
            triggers.push(trigger.with_spec(r.spec).with_tool(r.call.tool_type.clone()));
        }

        diagnostics.count("calls", results.len() as u64);
        diagnostics.count("succeeded", successes as u64);
        diagnostics.count("failed", (results.len() - successes) as u64);
        diagnostics.count(
            "cache_hits",
            results
                .iter()
                .filter(|r| r.result.success && r.result.source == ResultSource::Cache)
                .count() as u64,
        );
        diagnostics.count(
            "rows",
            results.iter().map(|r| r.result.row_count() as u64).sum(),
        );
        diagnostics.count("unresolved", unresolved.len() as u64);

        tracing::debug!(
            trace_id = ctx.trace_id,
            revision = plan.revision,
            calls = results.len(),
            succeeded = successes,
            "execute finished"
        );

        Ok(StageOutcome::new(
            ExecuteOutput {
                plan_revision: plan.revision,
                results,
                unresolved,
            },
            diagnostics,
            triggers,
        ))
    }
}
