//! Validate 阶段：按 PolicyAsset 检查预算与安全策略
//!
//! 预算超限（步数、深度、行数、时间窗口）会被收敛到上限，产生 soft policy_blocked；
//! 安全违规（不允许的操作、被禁止的字段）产生 hard policy_blocked，且不输出 ValidatedPlan。
//! 重规划后的计划回到 Execute 前，runner 也用 check_policy 重新校验。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Diagnostics, StageContext, StageExecutor, StageInput, StageName, StageOutcome};
use crate::assets::{PolicyAsset, QueryAsset};
use crate::core::OrchestrationError;
use crate::plan::Plan;
use crate::replan::{Trigger, TriggerType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateInput {
    pub plan: Plan,
}

impl StageInput for ValidateInput {
    fn check(&self) -> Result<(), OrchestrationError> {
        if self.plan.data_specs().is_empty() {
            return Err(OrchestrationError::Validation(
                "plan has no data specs".to_string(),
            ));
        }
        Ok(())
    }
}

/// 本次执行生效的预算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedBudget {
    pub max_rows: usize,
    pub max_depth: u32,
    pub max_window_minutes: u64,
    pub timeout_ms: u64,
}

/// 通过策略检查、可以执行的计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedPlan {
    pub plan: Plan,
    /// 做出判定的策略资产引用
    pub policy_id: String,
    pub budget: AppliedBudget,
    pub adjustments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateOutput {
    pub validated: Option<ValidatedPlan>,
    pub violations: Vec<String>,
    pub adjustments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyCheck {
    /// 收敛后的计划（修订号不变）
    pub plan: Plan,
    pub policy_id: String,
    pub budget: AppliedBudget,
    pub adjustments: Vec<String>,
    pub violations: Vec<String>,
}

impl PolicyCheck {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_validated(self) -> Option<ValidatedPlan> {
        if !self.passed() {
            return None;
        }
        Some(ValidatedPlan {
            plan: self.plan,
            policy_id: self.policy_id,
            budget: self.budget,
            adjustments: self.adjustments,
        })
    }
}

/// 纯函数：对计划执行预算收敛与安全检查
pub fn check_policy(plan: &Plan, policy: &PolicyAsset, query: &QueryAsset) -> PolicyCheck {
    let budget = &policy.budget;
    let security = &policy.security;
    let mut spec = plan.spec.clone();
    let mut adjustments = Vec::new();
    let mut violations = Vec::new();

    // 步数：先丢弃尾部 secondary
    let steps = |s: &crate::plan::PlanSpec| {
        usize::from(s.primary.is_some())
            + s.secondary.len()
            + usize::from(s.graph.is_some())
            + usize::from(s.metric.is_some())
            + usize::from(s.history.is_some())
    };
    let mut dropped = 0;
    while steps(&spec) > budget.max_steps && !spec.secondary.is_empty() {
        spec.secondary.pop();
        dropped += 1;
    }
    if dropped > 0 {
        adjustments.push(format!(
            "dropped {dropped} secondary spec(s) to fit max_steps {}",
            budget.max_steps
        ));
    }
    if steps(&spec) > budget.max_steps {
        violations.push(format!(
            "plan needs {} steps, policy allows {}",
            steps(&spec),
            budget.max_steps
        ));
    }

    for (i, tabular) in spec
        .primary
        .iter_mut()
        .chain(spec.secondary.iter_mut())
        .enumerate()
    {
        if let Some(limit) = tabular.limit.filter(|l| *l > budget.max_rows) {
            tabular.limit = Some(budget.max_rows);
            adjustments.push(format!(
                "tabular spec {i}: limit {limit} clamped to {}",
                budget.max_rows
            ));
        }
    }
    if let Some(graph) = spec.graph.as_mut() {
        if let Some(depth) = graph.depth.filter(|d| *d > budget.max_depth) {
            graph.depth = Some(budget.max_depth);
            adjustments.push(format!("graph depth {depth} clamped to {}", budget.max_depth));
        }
    }
    if let Some(metric) = spec.metric.as_mut() {
        if let Some(window) = metric.window.as_mut() {
            if window.last_minutes > budget.max_window_minutes {
                adjustments.push(format!(
                    "metric window {}m clamped to {}m",
                    window.last_minutes, budget.max_window_minutes
                ));
                window.last_minutes = budget.max_window_minutes;
            }
        }
    }
    if let Some(history) = spec.history.as_mut() {
        if let Some(window) = history.window.as_mut() {
            if window.last_minutes > budget.max_window_minutes {
                adjustments.push(format!(
                    "history window {}m clamped to {}m",
                    window.last_minutes, budget.max_window_minutes
                ));
                window.last_minutes = budget.max_window_minutes;
            }
        }
        if let Some(limit) = history.limit.filter(|l| *l > budget.max_rows) {
            history.limit = Some(budget.max_rows);
            adjustments.push(format!("history limit {limit} clamped to {}", budget.max_rows));
        }
    }
    if let Some(rows) = spec.output.max_rows.filter(|r| *r > budget.max_rows) {
        spec.output.max_rows = Some(budget.max_rows);
        adjustments.push(format!("output max_rows {rows} clamped to {}", budget.max_rows));
    }

    let clamped = Plan {
        spec,
        ..plan.clone()
    };

    if !security.allowed_operations.is_empty() {
        for spec_ref in clamped.data_specs() {
            let backend = spec_ref.backend();
            let operation = format!("{}.{}", backend, query.operation_for(backend));
            if !security
                .allowed_operations
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&operation))
                && !violations.iter().any(|v: &String| v.contains(&operation))
            {
                violations.push(format!("operation {operation} is not allowed"));
            }
        }
    }
    for field in clamped.referenced_fields() {
        if security
            .blocked_fields
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(&field))
        {
            let message = format!("field '{field}' is blocked by policy");
            if !violations.contains(&message) {
                violations.push(message);
            }
        }
    }

    PolicyCheck {
        plan: clamped,
        policy_id: format!("{}@{}", policy.id, policy.version),
        budget: AppliedBudget {
            max_rows: budget.max_rows,
            max_depth: budget.max_depth,
            max_window_minutes: budget.max_window_minutes,
            timeout_ms: budget.max_timeout_ms,
        },
        adjustments,
        violations,
    }
}

/// 由策略检查结果生成触发器：违规为 hard，收敛为 soft
pub fn policy_triggers(check: &PolicyCheck, stage: StageName) -> Vec<Trigger> {
    let mut triggers = Vec::new();
    if !check.violations.is_empty() {
        triggers.push(Trigger::hard(
            TriggerType::PolicyBlocked,
            stage,
            check.violations.join("; "),
        ));
    }
    if !check.adjustments.is_empty() {
        triggers.push(Trigger::soft(
            TriggerType::PolicyBlocked,
            stage,
            check.adjustments.join("; "),
        ));
    }
    triggers
}

pub struct ValidateStage;

#[async_trait]
impl StageExecutor for ValidateStage {
    type Input = ValidateInput;
    type Output = ValidateOutput;

    fn stage(&self) -> StageName {
        StageName::Validate
    }

    async fn execute(
        &self,
        input: &ValidateInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome<ValidateOutput>, OrchestrationError> {
        let check = check_policy(&input.plan, ctx.assets.policy(), ctx.assets.query());
        let mut diagnostics = Diagnostics::default();
        for adjustment in &check.adjustments {
            diagnostics.warn(adjustment.clone());
        }
        for violation in &check.violations {
            diagnostics.error(violation.clone());
        }
        let triggers = policy_triggers(&check, StageName::Validate);
        let violations = check.violations.clone();
        let adjustments = check.adjustments.clone();

        Ok(StageOutcome::new(
            ValidateOutput {
                validated: check.into_validated(),
                violations,
                adjustments,
            },
            diagnostics,
            triggers,
        ))
    }
}
