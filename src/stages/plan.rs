//! Plan 阶段：规范化问题并产出 直接回答 / 可执行计划 / 拒绝

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Diagnostics, StageContext, StageExecutor, StageInput, StageName, StageOutcome};
use crate::assets::{ResolvedQuestion, Resolver, SchemaCatalog};
use crate::core::OrchestrationError;
use crate::llm::StructuredGenerator;
use crate::plan::{Plan, PlanDraft, PlanOutcome, RulePlanner};

/// 规划后端
#[derive(Clone)]
pub enum PlannerBackend {
    /// 确定性规则规划
    Rules,
    /// 结构化生成（输出须符合 PlanDraft 的 JSON Schema）
    Llm(Arc<dyn StructuredGenerator>),
}

impl PlannerBackend {
    pub fn name(&self) -> String {
        match self {
            PlannerBackend::Rules => "rules".to_string(),
            PlannerBackend::Llm(generator) => generator.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInput {
    pub question: String,
}

impl StageInput for PlanInput {
    fn check(&self) -> Result<(), OrchestrationError> {
        if self.question.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "question is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStageOutput {
    pub resolved: ResolvedQuestion,
    pub planner: String,
    pub outcome: PlanOutcome,
}

pub struct PlanStage {
    backend: PlannerBackend,
    generation_timeout: Duration,
}

impl PlanStage {
    pub fn new(backend: PlannerBackend) -> Self {
        Self {
            backend,
            generation_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    async fn draft_with_generator(
        &self,
        generator: &dyn StructuredGenerator,
        canonical: &str,
        ctx: &StageContext<'_>,
    ) -> Result<PlanDraft, OrchestrationError> {
        let template = &ctx.assets.prompt().planner_template;
        let prompt = template
            .replace("{schema}", &describe_schema(ctx.assets.schema()))
            .replace("{question}", canonical)
            .replace("{mode}", ctx.mode.as_str());
        let schema = serde_json::to_value(schemars::schema_for!(PlanDraft))?;

        let limit = tokio::time::Instant::now() + self.generation_timeout;
        let deadline = ctx.deadline.min(limit);
        let value = tokio::time::timeout_at(deadline, generator.generate(&prompt, &schema))
            .await
            .map_err(|_| OrchestrationError::Timeout("plan generation exceeded deadline".to_string()))?
            .map_err(OrchestrationError::Llm)?;

        serde_json::from_value(value).map_err(|e| {
            OrchestrationError::Validation(format!("planner output does not match plan schema: {e}"))
        })
    }
}

/// 供提示词使用的实体目录摘要
fn describe_schema(schema: &SchemaCatalog) -> String {
    schema
        .entities
        .iter()
        .map(|e| {
            let fields: Vec<&str> = e.fields.iter().map(|f| f.name.as_str()).collect();
            format!(
                "- {} (source {}): fields [{}]; metrics [{}]",
                e.name,
                e.source,
                fields.join(", "),
                e.metrics.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl StageExecutor for PlanStage {
    type Input = PlanInput;
    type Output = PlanStageOutput;

    fn stage(&self) -> StageName {
        StageName::Plan
    }

    async fn execute(
        &self,
        input: &PlanInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome<PlanStageOutput>, OrchestrationError> {
        let mut diagnostics = Diagnostics::default();

        let resolver = Resolver::compile(ctx.assets.resolver())?;
        let resolved = resolver.resolve(&input.question);
        diagnostics.count("resolver_rules_applied", resolved.applied_rules.len() as u64);

        let draft = match &self.backend {
            PlannerBackend::Rules => {
                RulePlanner::draft(&resolved.canonical, ctx.assets.schema(), ctx.mode)
            }
            PlannerBackend::Llm(generator) => {
                self.draft_with_generator(generator.as_ref(), &resolved.canonical, ctx)
                    .await?
            }
        };

        let outcome = match draft {
            PlanDraft::Direct { answer } => PlanOutcome::Direct { answer },
            PlanDraft::Reject { reason } => {
                diagnostics.warn(format!("rejected: {reason}"));
                PlanOutcome::Reject { reason }
            }
            PlanDraft::Plan(spec) => {
                let plan = Plan::new(resolved.canonical.clone(), spec);
                if plan.data_specs().is_empty() {
                    return Err(OrchestrationError::Validation(
                        "plan has no data specs".to_string(),
                    ));
                }
                diagnostics.count("data_specs", plan.step_count() as u64);
                PlanOutcome::Plan(plan)
            }
        };

        Ok(StageOutcome::new(
            PlanStageOutput {
                resolved,
                planner: self.backend.name(),
                outcome,
            },
            diagnostics,
            Vec::new(),
        ))
    }
}
