//! 单阶段测试
//!
//! 在不跑完整管线的情况下执行一个阶段：输入来自 test_plan，或从基线 Trace 中该阶段（或上游阶段）
//! 最近一次尝试的记录里取出。结果不写入 Trace 存储。

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::runner::OrchestrationRunner;
use crate::assets::{AssetBundle, AssetLens};
use crate::core::OrchestrationError;
use crate::plan::{Plan, PlanSpec};
use crate::replan::Trigger;
use crate::stages::{
    check_policy, ComposeInput, Diagnostics, ExecuteInput, ExecuteOutput, PlanInput, PresentInput,
    RunMode, StageContext, StageExecutor, StageInput, StageName, ValidateInput,
};
use crate::tools::{ExecutionTracer, ToolExecutionRecord};
use crate::trace::Trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTestRequest {
    pub stage: StageName,
    /// plan 阶段为 `{"question": ...}`；其余阶段为 Plan 或 PlanSpec（可带 question）
    #[serde(default)]
    pub test_plan: Option<Value>,
    #[serde(default)]
    pub asset_overrides: Option<Value>,
    #[serde(default)]
    pub baseline_trace_id: Option<String>,
    #[serde(default)]
    pub mode: RunMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTestResponse {
    pub stage: StageName,
    pub result: Value,
    pub diagnostics: Diagnostics,
    pub triggers: Vec<Trigger>,
    pub duration_ms: u64,
    pub applied_assets: Vec<String>,
    /// 本次测试发出的工具调用
    pub tool_calls: Vec<ToolExecutionRecord>,
}

/// 执行单阶段测试；baseline 为 baseline_trace_id 对应的 Trace
pub async fn run_stage_test(
    runner: &OrchestrationRunner,
    request: &StageTestRequest,
    assets: &AssetBundle,
    baseline: Option<&Trace>,
) -> Result<StageTestResponse, OrchestrationError> {
    let env = Isolated {
        assets,
        mode: request.mode,
        timeout: runner.request_timeout(),
        tracer: runner.execute_stage().executor().tracer(),
    };
    let test_plan = request.test_plan.as_ref();

    match request.stage {
        StageName::Plan => {
            let question = match test_plan {
                Some(value) => question_of(value).ok_or_else(|| {
                    OrchestrationError::Validation("test_plan.question is required".to_string())
                })?,
                None => baseline
                    .map(|t| t.question().to_string())
                    .ok_or_else(|| needs_input(StageName::Plan))?,
            };
            env.run(runner.plan_stage(), PlanInput { question }).await
        }
        StageName::Validate => {
            let input = match test_plan {
                Some(value) => ValidateInput {
                    plan: parse_plan(value)?,
                },
                None => recorded(baseline, StageName::Validate, Slot::Input)?,
            };
            env.run(runner.validate_stage(), input).await
        }
        StageName::Execute => {
            let input = match test_plan {
                Some(value) => {
                    let plan = parse_plan(value)?;
                    let check = check_policy(&plan, &assets.policy, &assets.query);
                    if !check.passed() {
                        return Err(OrchestrationError::PolicyViolation(
                            check.violations.join("; "),
                        ));
                    }
                    let validated = check.into_validated().ok_or_else(|| {
                        OrchestrationError::Contract("validated plan missing".to_string())
                    })?;
                    ExecuteInput { validated }
                }
                None => recorded(baseline, StageName::Execute, Slot::Input)?,
            };
            env.run(runner.execute_stage(), input).await
        }
        StageName::Compose => {
            let mut input: ComposeInput = match recorded(baseline, StageName::Compose, Slot::Input) {
                Ok(input) => input,
                Err(_) => ComposeInput {
                    plan: match test_plan {
                        Some(value) => parse_plan(value)?,
                        None => return Err(needs_input(StageName::Compose)),
                    },
                    execution: recorded::<ExecuteOutput>(baseline, StageName::Execute, Slot::Output)?,
                },
            };
            if let Some(value) = test_plan {
                input.plan = parse_plan(value)?;
            }
            env.run(runner.compose_stage(), input).await
        }
        StageName::Present => {
            let mut input: PresentInput = match recorded(baseline, StageName::Present, Slot::Input) {
                Ok(input) => input,
                Err(_) => PresentInput {
                    plan: match test_plan {
                        Some(value) => parse_plan(value)?,
                        None => return Err(needs_input(StageName::Present)),
                    },
                    composed: recorded(baseline, StageName::Compose, Slot::Output)?,
                },
            };
            if let Some(value) = test_plan {
                input.plan = parse_plan(value)?;
            }
            env.run(runner.present_stage(), input).await
        }
    }
}

struct Isolated<'a> {
    assets: &'a AssetBundle,
    mode: RunMode,
    timeout: Duration,
    tracer: &'a ExecutionTracer,
}

impl Isolated<'_> {
    async fn run<S: StageExecutor>(
        &self,
        stage: &S,
        input: S::Input,
    ) -> Result<StageTestResponse, OrchestrationError> {
        input.check()?;
        let trace_id = format!("stage-test-{}", uuid::Uuid::new_v4());
        let deadline = Instant::now() + self.timeout;
        let ctx = StageContext {
            trace_id: &trace_id,
            mode: self.mode,
            deadline,
            as_of: chrono::Utc::now(),
            assets: AssetLens::new(self.assets),
        };
        let clock = std::time::Instant::now();
        let outcome = tokio::time::timeout_at(deadline, stage.execute(&input, &ctx))
            .await
            .map_err(|_| {
                OrchestrationError::Timeout(format!("{} stage test exceeded deadline", stage.stage()))
            })
            .and_then(|result| result);
        let tool_calls = self.tracer.drain(&trace_id);
        let outcome = outcome?;
        let duration_ms = clock.elapsed().as_millis() as u64;
        tracing::info!(stage = %stage.stage(), duration_ms, "stage test completed");

        Ok(StageTestResponse {
            stage: stage.stage(),
            result: serde_json::to_value(&outcome.output)?,
            diagnostics: outcome.diagnostics,
            triggers: outcome.triggers,
            duration_ms,
            applied_assets: ctx.assets.take_applied(),
            tool_calls,
        })
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Input,
    Output,
}

fn needs_input(stage: StageName) -> OrchestrationError {
    OrchestrationError::Validation(format!(
        "stage test for {stage} needs test_plan or baseline_trace_id"
    ))
}

/// 基线 Trace 中某阶段最近一次尝试的输入或输出
fn recorded<T: DeserializeOwned>(
    baseline: Option<&Trace>,
    stage: StageName,
    slot: Slot,
) -> Result<T, OrchestrationError> {
    let trace = baseline.ok_or_else(|| needs_input(stage))?;
    let record = trace
        .stages()
        .iter()
        .rev()
        .find(|r| r.stage == stage && r.output.is_some())
        .ok_or_else(|| {
            OrchestrationError::Validation(format!(
                "baseline trace {} has no usable {stage} record",
                trace.trace_id()
            ))
        })?;
    let value = match slot {
        Slot::Input => record.input.clone(),
        Slot::Output => record.output.clone().unwrap_or(Value::Null),
    };
    serde_json::from_value(value).map_err(|e| {
        OrchestrationError::Validation(format!("baseline {stage} record is not usable: {e}"))
    })
}

fn question_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        other => other.get("question")?.as_str().map(String::from),
    }
}

/// 完整 Plan，或 PlanSpec（question 可选）
fn parse_plan(value: &Value) -> Result<Plan, OrchestrationError> {
    if let Ok(plan) = serde_json::from_value::<Plan>(value.clone()) {
        return Ok(plan);
    }
    let spec: PlanSpec = serde_json::from_value(value.clone())
        .map_err(|e| OrchestrationError::Validation(format!("test_plan is not a plan: {e}")))?;
    Ok(Plan::new(question_of(value).unwrap_or_default(), spec))
}
