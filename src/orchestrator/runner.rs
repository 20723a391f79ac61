//! 编排主循环
//!
//! Plan → Validate → Execute → Compose → Present 严格顺序执行。每次阶段尝试写一条 StageRecord；
//! 阶段产生的触发器整批交给 ReplanController，需要重规划时应用合并后的补丁并跳回 Execute 或 Present。
//! 重规划总次数受 max_replans 限制，整个请求受 request_timeout 限制。

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::answer::{AnswerBlock, NoticeLevel, ScreenModel};
use crate::assets::{AssetBundle, AssetKind, AssetLens};
use crate::core::{ErrorInfo, OrchestrationError};
use crate::plan::{Plan, PlanOutcome, PlanPatch, View};
use crate::replan::{
    decision_summary, ReplanBudget, ReplanController, ReplanDecision, Trigger, TriggerType,
};
use crate::stages::{
    check_policy, layout_blocks, ComposeInput, ComposeOutput, ComposeStage, Diagnostics,
    ExecuteInput, ExecuteOutput, ExecuteStage, PlanInput, PlanStage, PresentInput, PresentStage,
    RunMode, StageContext, StageExecutor, StageInput, StageName, StageOutcome, ValidateInput,
    ValidateOutput, ValidateStage, ValidatedPlan,
};
use crate::trace::{ReplanEvent, RunOutcome, RunStatus, StageRecord, Trace};

/// 阶段自身应在截止时间前返回；外层只多等这么久
const STAGE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub question: String,
    #[serde(default)]
    pub mode: RunMode,
    /// 相对时间窗口的参考时刻，缺省为当前时间
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_trace_id: Option<String>,
}

impl RunRequest {
    pub fn new(question: impl Into<String>, mode: RunMode) -> Self {
        Self {
            question: question.into(),
            mode,
            as_of: None,
            parent_trace_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub answer: String,
    pub blocks: Vec<AnswerBlock>,
    pub screen: Option<ScreenModel>,
    pub status: RunStatus,
    pub trace: Trace,
}

struct Attempt<T> {
    output: T,
    triggers: Vec<Trigger>,
    pending: PendingRecord,
}

/// 阶段已返回、尚未写入 Trace 的记录；是否终止运行在写入前决定
struct PendingRecord {
    stage: StageName,
    input: Value,
    output: Value,
    diagnostics: Diagnostics,
    applied_assets: Vec<String>,
    started_at: DateTime<Utc>,
    duration_ms: u64,
}

/// 控制环给出的跳转
struct Jump {
    target: StageName,
    plan: Plan,
}

struct Finished {
    answer: String,
    blocks: Vec<AnswerBlock>,
    screen: ScreenModel,
    status: RunStatus,
}

/// 单次请求的可变状态
struct RunState<'a> {
    trace: Trace,
    trace_id: String,
    budget: ReplanBudget,
    assets: &'a AssetBundle,
    mode: RunMode,
    as_of: DateTime<Utc>,
    deadline: Instant,
    outcome: RunOutcome,
    /// 每个阶段最近一次尝试是否留下未解决的可重规划问题
    unresolved: BTreeMap<StageName, bool>,
}

impl RunState<'_> {
    fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn degraded(&self) -> bool {
        self.unresolved.values().any(|u| *u)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        stage: StageName,
        input: Value,
        output: Option<Value>,
        diagnostics: Diagnostics,
        applied_assets: Vec<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        error: Option<ErrorInfo>,
    ) -> Result<usize, OrchestrationError> {
        let attempt = self.trace.attempts(stage) + 1;
        self.trace.push_stage(StageRecord {
            index: 0,
            stage,
            attempt,
            input,
            output,
            diagnostics,
            applied_assets,
            started_at,
            duration_ms,
            error,
        })
    }

    /// 写入一次失败的阶段尝试
    fn record_failure(
        &mut self,
        stage: StageName,
        input: Value,
        applied_assets: Vec<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        error: &OrchestrationError,
    ) -> Result<usize, OrchestrationError> {
        let mut diagnostics = Diagnostics::default();
        diagnostics.error(error.to_string());
        self.record(
            stage,
            input,
            None,
            diagnostics,
            applied_assets,
            started_at,
            duration_ms,
            Some(ErrorInfo::from(error)),
        )
    }

    /// 写入阶段已返回的尝试，终止运行的错误随记录一起写入
    fn commit(
        &mut self,
        pending: PendingRecord,
        error: Option<&OrchestrationError>,
    ) -> Result<usize, OrchestrationError> {
        let PendingRecord {
            stage,
            input,
            output,
            mut diagnostics,
            applied_assets,
            started_at,
            duration_ms,
        } = pending;
        if let Some(error) = error {
            diagnostics.error(error.to_string());
        }
        self.record(
            stage,
            input,
            Some(output),
            diagnostics,
            applied_assets,
            started_at,
            duration_ms,
            error.map(ErrorInfo::from),
        )
    }
}

pub struct OrchestrationRunner {
    plan: PlanStage,
    validate: ValidateStage,
    execute: ExecuteStage,
    compose: ComposeStage,
    present: PresentStage,
    controller: ReplanController,
    max_replans: u32,
    request_timeout: Duration,
}

impl OrchestrationRunner {
    pub fn new(plan: PlanStage, execute: ExecuteStage, compose: ComposeStage) -> Self {
        Self {
            plan,
            validate: ValidateStage,
            execute,
            compose,
            present: PresentStage,
            controller: ReplanController::new(),
            max_replans: 2,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_replans(mut self, max_replans: u32) -> Self {
        self.max_replans = max_replans;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn plan_stage(&self) -> &PlanStage {
        &self.plan
    }

    pub fn validate_stage(&self) -> &ValidateStage {
        &self.validate
    }

    pub fn execute_stage(&self) -> &ExecuteStage {
        &self.execute
    }

    pub fn compose_stage(&self) -> &ComposeStage {
        &self.compose
    }

    pub fn present_stage(&self) -> &PresentStage {
        &self.present
    }

    /// 执行一次完整请求；任何结果（包括失败）都带着终结的 Trace 返回
    pub async fn run(&self, request: &RunRequest, assets: &AssetBundle) -> RunResponse {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let as_of = request.as_of.unwrap_or_else(Utc::now);
        let mut state = RunState {
            trace: Trace::new(
                trace_id.clone(),
                request.question.clone(),
                request.mode,
                as_of,
                request.parent_trace_id.clone(),
            ),
            trace_id,
            budget: ReplanBudget::new(self.max_replans),
            assets,
            mode: request.mode,
            as_of,
            deadline: Instant::now() + self.request_timeout,
            outcome: RunOutcome::Answered,
            unresolved: BTreeMap::new(),
        };
        tracing::info!(
            trace_id = %state.trace_id,
            mode = request.mode.as_str(),
            parent = ?request.parent_trace_id,
            "orchestration started"
        );

        let result = self.drive(&request.question, &mut state).await;

        let tool_calls = self.execute.executor().tracer().drain(&state.trace_id);
        let outcome = state.outcome;
        let budget = state.budget;
        let mut trace = state.trace;
        if let Err(e) = trace.extend_tool_calls(tool_calls) {
            tracing::error!(error = %e, "failed to attach tool calls to trace");
        }

        match result {
            Ok(finished) => {
                if let Err(e) = trace.finish(finished.status, outcome, None) {
                    tracing::error!(error = %e, "failed to finish trace");
                }
                tracing::info!(
                    trace_id = %trace.trace_id(),
                    status = finished.status.as_str(),
                    stages = trace.stages().len(),
                    replans = budget.used,
                    "orchestration finished"
                );
                RunResponse {
                    answer: finished.answer,
                    blocks: finished.blocks,
                    screen: Some(finished.screen),
                    status: finished.status,
                    trace,
                }
            }
            Err(error) => {
                let info = ErrorInfo::from(&error);
                if let Err(e) = trace.finish(RunStatus::Failed, outcome, Some(info)) {
                    tracing::error!(error = %e, "failed to finish trace");
                }
                tracing::warn!(
                    trace_id = %trace.trace_id(),
                    kind = error.kind(),
                    error = %error,
                    "orchestration failed"
                );
                RunResponse {
                    answer: format!("Request failed: {error}"),
                    blocks: vec![AnswerBlock::notice(NoticeLevel::Error, error.to_string())],
                    screen: None,
                    status: RunStatus::Failed,
                    trace,
                }
            }
        }
    }

    async fn drive(
        &self,
        question: &str,
        state: &mut RunState<'_>,
    ) -> Result<Finished, OrchestrationError> {
        let Attempt {
            output: planned,
            pending,
            ..
        } = self
            .run_stage(
                &self.plan,
                &PlanInput {
                    question: question.to_string(),
                },
                state,
            )
            .await?;
        state.commit(pending, None)?;
        let plan = match planned.outcome {
            PlanOutcome::Plan(plan) => plan,
            PlanOutcome::Direct { answer } => {
                state.outcome = RunOutcome::Direct;
                let block = AnswerBlock::Text {
                    title: None,
                    body: answer.clone(),
                };
                return Ok(self.short_circuit(question, answer, block, state));
            }
            PlanOutcome::Reject { reason } => {
                state.outcome = RunOutcome::Rejected;
                let block = AnswerBlock::notice(NoticeLevel::Warning, reason.clone());
                return Ok(self.short_circuit(
                    question,
                    format!("Request rejected: {reason}"),
                    block,
                    state,
                ));
            }
        };

        let Attempt {
            output: validated,
            triggers,
            pending,
        } = self
            .run_stage(&self.validate, &ValidateInput { plan: plan.clone() }, state)
            .await?;
        if self.control(state, pending, triggers, &plan, None)?.is_some() {
            return Err(OrchestrationError::Contract(
                "validate triggers cannot request a replan".to_string(),
            ));
        }
        let ValidateOutput {
            validated,
            violations,
            ..
        } = validated;
        let mut validated = validated
            .ok_or_else(|| OrchestrationError::PolicyViolation(violations.join("; ")))?;

        if state.deadline_exceeded() {
            let error =
                OrchestrationError::Timeout("request deadline passed before execute".to_string());
            state.record_failure(
                StageName::Execute,
                json!({ "validated": &validated }),
                Vec::new(),
                Utc::now(),
                0,
                &error,
            )?;
            return Err(error);
        }

        let mut plan = validated.plan.clone();
        let mut execution: Option<ExecuteOutput> = None;
        let mut composed: Option<ComposeOutput> = None;
        let mut next = StageName::Execute;
        let screen = loop {
            let jump = match next {
                StageName::Execute => {
                    let attempt = self
                        .run_stage(
                            &self.execute,
                            &ExecuteInput {
                                validated: validated.clone(),
                            },
                            state,
                        )
                        .await?;
                    execution = Some(attempt.output);
                    next = StageName::Compose;
                    self.control(
                        state,
                        attempt.pending,
                        attempt.triggers,
                        &plan,
                        execution.as_ref(),
                    )?
                }
                StageName::Compose => {
                    let executed = execution.clone().ok_or_else(|| missing("execute output"))?;
                    let attempt = self
                        .run_stage(
                            &self.compose,
                            &ComposeInput {
                                plan: plan.clone(),
                                execution: executed,
                            },
                            state,
                        )
                        .await?;
                    composed = Some(attempt.output);
                    next = StageName::Present;
                    self.control(
                        state,
                        attempt.pending,
                        attempt.triggers,
                        &plan,
                        execution.as_ref(),
                    )?
                }
                StageName::Present => {
                    let composed = composed.clone().ok_or_else(|| missing("compose output"))?;
                    let attempt = self
                        .run_stage(
                            &self.present,
                            &PresentInput {
                                plan: plan.clone(),
                                composed,
                            },
                            state,
                        )
                        .await?;
                    match self.control(
                        state,
                        attempt.pending,
                        attempt.triggers,
                        &plan,
                        execution.as_ref(),
                    )? {
                        Some(jump) => Some(jump),
                        None => break attempt.output,
                    }
                }
                other => {
                    return Err(OrchestrationError::Contract(format!(
                        "runner cannot enter {other}"
                    )))
                }
            };

            if let Some(jump) = jump {
                if !matches!(jump.target, StageName::Execute | StageName::Present) {
                    return Err(OrchestrationError::Contract(format!(
                        "replan cannot jump to {}",
                        jump.target
                    )));
                }
                plan = jump.plan;
                if jump.target == StageName::Execute {
                    validated = self.revalidate(&plan, state)?;
                    plan = validated.plan.clone();
                }
                next = jump.target;
            }
        };

        let execution = execution.ok_or_else(|| missing("execute output"))?;
        let composed = composed.ok_or_else(|| missing("compose output"))?;

        let status = if state.degraded() {
            RunStatus::Degraded
        } else if execution.failed() > 0 && execution.succeeded() > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };

        Ok(Finished {
            answer: composed.answer,
            blocks: composed.blocks,
            screen,
            status,
        })
    }

    /// 直接回答与拒绝：不经过数据阶段，直接排版一个块
    fn short_circuit(
        &self,
        question: &str,
        answer: String,
        block: AnswerBlock,
        state: &RunState<'_>,
    ) -> Finished {
        let blocks = vec![block];
        let layout = layout_blocks(
            question,
            View::Summary,
            &blocks,
            &state.assets.screen,
            None,
            None,
        );
        Finished {
            answer,
            blocks,
            screen: layout.screen,
            status: RunStatus::Success,
        }
    }

    /// 补丁后的计划重新做策略检查，得到本次 Execute 尝试的 ValidatedPlan
    fn revalidate(
        &self,
        plan: &Plan,
        state: &mut RunState<'_>,
    ) -> Result<ValidatedPlan, OrchestrationError> {
        let check = check_policy(plan, &state.assets.policy, &state.assets.query);
        if check.passed() {
            if !check.adjustments.is_empty() {
                tracing::warn!(
                    trace_id = %state.trace_id,
                    revision = plan.revision,
                    adjustments = ?check.adjustments,
                    "patched plan clamped by policy"
                );
            }
            return check
                .into_validated()
                .ok_or_else(|| missing("validated plan"));
        }

        let error = OrchestrationError::PolicyViolation(format!(
            "patched plan revision {}: {}",
            plan.revision,
            check.violations.join("; ")
        ));
        let applied = vec![
            state.assets.asset_ref(AssetKind::Policy),
            state.assets.asset_ref(AssetKind::Query),
        ];
        state.record_failure(
            StageName::Execute,
            json!({ "plan": plan }),
            applied,
            Utc::now(),
            0,
            &error,
        )?;
        Err(error)
    }

    /// 运行一次阶段尝试；失败的尝试直接写入 StageRecord，成功的尝试交给 control 写入
    async fn run_stage<S: StageExecutor>(
        &self,
        stage: &S,
        input: &S::Input,
        state: &mut RunState<'_>,
    ) -> Result<Attempt<S::Output>, OrchestrationError> {
        let name = stage.stage();
        let started_at = Utc::now();
        let clock = std::time::Instant::now();
        let snapshot = serde_json::to_value(input)?;

        if let Err(error) = input.check() {
            state.record_failure(name, snapshot, Vec::new(), started_at, 0, &error)?;
            tracing::warn!(trace_id = %state.trace_id, stage = %name, error = %error, "stage input rejected");
            return Err(error);
        }

        let (result, applied) = {
            let ctx = StageContext {
                trace_id: &state.trace_id,
                mode: state.mode,
                deadline: state.deadline,
                as_of: state.as_of,
                assets: AssetLens::new(state.assets),
            };
            let result = tokio::time::timeout_at(state.deadline + STAGE_GRACE, stage.execute(input, &ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(OrchestrationError::Timeout(format!(
                        "{name} stage exceeded the request deadline"
                    )))
                });
            (result, ctx.assets.take_applied())
        };
        let duration_ms = clock.elapsed().as_millis() as u64;

        match result {
            Ok(StageOutcome {
                output,
                diagnostics,
                triggers,
            }) => {
                let pending = PendingRecord {
                    stage: name,
                    input: snapshot,
                    output: serde_json::to_value(&output)?,
                    diagnostics,
                    applied_assets: applied,
                    started_at,
                    duration_ms,
                };
                tracing::info!(
                    trace_id = %state.trace_id,
                    stage = %name,
                    attempt = state.trace.attempts(name) + 1,
                    duration_ms,
                    triggers = triggers.len(),
                    "stage completed"
                );
                Ok(Attempt {
                    output,
                    triggers,
                    pending,
                })
            }
            Err(error) => {
                state.record_failure(name, snapshot, applied, started_at, duration_ms, &error)?;
                tracing::warn!(trace_id = %state.trace_id, stage = %name, error = %error, "stage failed");
                Err(error)
            }
        }
    }

    /// 处理一次阶段尝试的触发器，然后写入该尝试的 StageRecord 与 ReplanEvent
    ///
    /// 第一个需要重规划的触发器确定跳转目标，目标相同的补丁合并，目标不同的记为 deferred；
    /// 任一致命决策取消跳转并终止运行。合并补丁只应用一次、只消耗一次预算。
    /// 没有跳转、Execute 一条数据也没拿到且无法再重规划时，同样终止运行。
    fn control(
        &self,
        state: &mut RunState<'_>,
        pending: PendingRecord,
        triggers: Vec<Trigger>,
        plan: &Plan,
        execution: Option<&ExecuteOutput>,
    ) -> Result<Option<Jump>, OrchestrationError> {
        let stage = pending.stage;
        let deadline_exceeded = state.deadline_exceeded();
        let mut target: Option<StageName> = None;
        let mut merged: Option<PlanPatch> = None;
        let mut unresolved = false;
        let mut fatal: Option<OrchestrationError> = None;
        let mut decided: Vec<(Trigger, ReplanDecision, bool)> = Vec::with_capacity(triggers.len());

        for trigger in triggers {
            let decision =
                self.controller
                    .evaluate(&trigger, plan, &state.budget, state.assets, deadline_exceeded);
            unresolved |= decision.unresolved;
            if decision.fatal && fatal.is_none() {
                fatal = Some(fatal_error(&trigger, &decision, deadline_exceeded, &state.budget));
            }
            let mut deferred = false;
            if decision.should_replan {
                match (target, &decision.patch) {
                    (None, Some(patch)) => {
                        target = decision.target_stage;
                        merged = Some(patch.clone());
                    }
                    (Some(t), Some(patch)) if decision.target_stage == Some(t) => {
                        if let Some(m) = merged.as_mut() {
                            m.merge(patch.clone());
                        }
                    }
                    _ => deferred = true,
                }
            }
            if decision.unresolved {
                tracing::warn!(
                    trace_id = %state.trace_id,
                    trigger = %trigger.trigger_type,
                    stage = %stage,
                    reason = %decision.reason,
                    "trigger left unresolved"
                );
            }
            decided.push((trigger, decision, deferred));
        }

        let before = serde_json::to_value(plan)?;
        let jump = match (fatal.is_none(), target, merged) {
            (true, Some(target), Some(patch)) => {
                let patched = patch.apply(plan);
                state.budget.consume();
                tracing::info!(
                    trace_id = %state.trace_id,
                    from = %stage,
                    to = %target,
                    revision = patched.revision,
                    reason = %patch.reason,
                    replans_used = state.budget.used,
                    "replanning"
                );
                Some(Jump {
                    target,
                    plan: patched,
                })
            }
            _ => None,
        };
        state.unresolved.insert(stage, unresolved);
        if fatal.is_none() && jump.is_none() {
            fatal = execution.and_then(|e| no_data_error(state, e, deadline_exceeded));
        }
        let index = state.commit(pending, fatal.as_ref())?;
        let after = match &jump {
            Some(jump) => Some(serde_json::to_value(&jump.plan)?),
            None => None,
        };

        for (trigger, decision, deferred) in decided {
            let applied = decision.should_replan && !deferred && jump.is_some();
            let event = ReplanEvent {
                index: 0,
                trigger_type: trigger.trigger_type,
                stage: trigger.stage,
                stage_record: index,
                severity: trigger.severity,
                spec: trigger.spec,
                detail: trigger.detail.clone(),
                should_replan: decision.should_replan,
                deferred,
                target_stage: decision.target_stage,
                before: decision.should_replan.then(|| before.clone()),
                after: if applied { after.clone() } else { None },
                patch: decision.patch.clone(),
                decision: decision_summary(&decision, &state.budget),
                at: Utc::now(),
            };
            state.trace.push_replan(event)?;
        }

        match fatal {
            Some(error) => Err(error),
            None => Ok(jump),
        }
    }
}

/// Execute 没有任何成功调用、问题仍未解决且无法再重规划时的终止错误
fn no_data_error(
    state: &RunState<'_>,
    execution: &ExecuteOutput,
    deadline_exceeded: bool,
) -> Option<OrchestrationError> {
    if execution.succeeded() > 0 || !state.degraded() {
        return None;
    }
    if deadline_exceeded {
        Some(OrchestrationError::Timeout(
            "no data retrieved before the request deadline".to_string(),
        ))
    } else if state.budget.exhausted() {
        Some(OrchestrationError::ReplanBudgetExhausted(state.budget.used))
    } else {
        None
    }
}

fn missing(what: &str) -> OrchestrationError {
    OrchestrationError::Contract(format!("{what} missing"))
}

/// 致命决策对应的错误
fn fatal_error(
    trigger: &Trigger,
    decision: &ReplanDecision,
    deadline_exceeded: bool,
    budget: &ReplanBudget,
) -> OrchestrationError {
    match trigger.trigger_type {
        TriggerType::ToolErrorFatal => OrchestrationError::Tool {
            tool: trigger.tool.clone().unwrap_or_else(|| "unknown".to_string()),
            message: trigger.detail.clone(),
            retryable: false,
        },
        TriggerType::PolicyBlocked => OrchestrationError::PolicyViolation(trigger.detail.clone()),
        _ if decision.unresolved && deadline_exceeded => OrchestrationError::Timeout(format!(
            "{} unresolved at request deadline",
            trigger.trigger_type
        )),
        _ if decision.unresolved && budget.exhausted() => {
            OrchestrationError::ReplanBudgetExhausted(budget.used)
        }
        _ => OrchestrationError::Validation(format!(
            "{}: {} ({})",
            trigger.trigger_type, trigger.detail, decision.reason
        )),
    }
}
