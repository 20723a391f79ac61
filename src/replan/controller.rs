//! 重规划控制器
//!
//! 对单个触发器给出 ReplanDecision：是否重规划、跳转的阶段、补丁与补丁后的计划。
//! 规则：
//! - tool_error_fatal / policy_blocked 从不重规划；hard 时为致命
//! - 其余类型在预算和截止时间允许时生成补丁，Execute 类问题跳回 Execute，present_limit 跳回 Present
//! - 补丁不改变计划内容时不算重规划，记为未解决
//!
//! 控制器不消耗预算，由 runner 在真正跳转时扣减。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::trigger::{Severity, Trigger, TriggerType};
use crate::assets::{AssetBundle, SchemaCatalog};
use crate::plan::{FilterOp, FilterSpec, PatchOp, Plan, PlanPatch, SpecRef, View};
use crate::stages::StageName;

/// 重规划预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplanBudget {
    pub max: u32,
    pub used: u32,
}

impl ReplanBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.used)
    }

    pub fn exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn consume(&mut self) {
        self.used = (self.used + 1).min(self.max);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanDecision {
    pub should_replan: bool,
    pub target_stage: Option<StageName>,
    pub patch: Option<PlanPatch>,
    pub patched_plan: Option<Plan>,
    pub reason: String,
    /// 必须终止运行
    pub fatal: bool,
    /// 可重规划的问题因预算、截止时间或无可用补丁而保留
    pub unresolved: bool,
}

impl ReplanDecision {
    fn stop(reason: impl Into<String>, fatal: bool, unresolved: bool) -> Self {
        Self {
            should_replan: false,
            target_stage: None,
            patch: None,
            patched_plan: None,
            reason: reason.into(),
            fatal,
            unresolved,
        }
    }
}

pub const NO_PATCH_REASON: &str = "no structural patch available";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplanController;

impl ReplanController {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        trigger: &Trigger,
        plan: &Plan,
        budget: &ReplanBudget,
        assets: &AssetBundle,
        deadline_exceeded: bool,
    ) -> ReplanDecision {
        let hard = trigger.severity == Severity::Hard;
        if !trigger.trigger_type.is_replannable() {
            let reason = if hard {
                format!("{} is not recoverable by replanning", trigger.trigger_type)
            } else {
                format!("{} recorded, continuing", trigger.trigger_type)
            };
            return ReplanDecision::stop(reason, hard, false);
        }
        if deadline_exceeded {
            return ReplanDecision::stop("request deadline exceeded", hard, true);
        }
        if budget.exhausted() {
            return ReplanDecision::stop(
                format!("replan budget exhausted ({}/{})", budget.used, budget.max),
                hard,
                true,
            );
        }

        let patch = match propose_patch(trigger, plan, assets) {
            Some(patch) if patch.changes(plan) => patch,
            _ => return ReplanDecision::stop(NO_PATCH_REASON, hard, true),
        };
        let patched = patch.apply(plan);
        ReplanDecision {
            should_replan: true,
            target_stage: Some(trigger.trigger_type.target_stage()),
            reason: patch.reason.clone(),
            patch: Some(patch),
            patched_plan: Some(patched),
            fatal: false,
            unresolved: false,
        }
    }
}

/// 根据触发器类型推导补丁；无法推导时返回 None
pub fn propose_patch(trigger: &Trigger, plan: &Plan, assets: &AssetBundle) -> Option<PlanPatch> {
    match trigger.trigger_type {
        TriggerType::SlotMissing => {
            let spec = trigger.spec?;
            let slot = trigger.slot.as_deref()?;
            let value = fill_value(plan, spec, slot, &assets.schema)?;
            Some(PlanPatch::new(
                format!("fill {spec}.{slot} from schema catalog"),
                vec![PatchOp::FillSlot {
                    target: spec,
                    slot: slot.to_string(),
                    value,
                }],
            ))
        }
        TriggerType::EmptyResult => {
            let spec = trigger.spec?;
            let op = widen(plan, spec, assets)?;
            Some(PlanPatch::new(format!("widen {spec} after empty result"), vec![op]))
        }
        TriggerType::ToolErrorRetryable => {
            let spec = trigger.spec?;
            let op = narrow(plan, spec, assets)?;
            Some(PlanPatch::new(
                format!("narrow {spec} after retryable tool error"),
                vec![op],
            ))
        }
        TriggerType::LowEvidence => {
            let targets = match trigger.spec {
                Some(spec) => vec![spec],
                None => plan.data_specs(),
            };
            let ops: Vec<PatchOp> = targets
                .into_iter()
                .flat_map(|spec| broaden(plan, spec, assets))
                .collect();
            if ops.is_empty() {
                return None;
            }
            Some(PlanPatch::new("broaden query for more evidence", ops))
        }
        TriggerType::PresentLimit => match trigger.slot.as_deref() {
            Some("blocks") => Some(PlanPatch::new(
                "cap blocks to screen limit",
                vec![PatchOp::CapBlocks {
                    max_blocks: assets.screen.max_blocks,
                }],
            )),
            _ => Some(PlanPatch::new(
                "switch to summary view with row cap",
                vec![
                    PatchOp::AlternateView { view: View::Summary },
                    PatchOp::CapRows {
                        max_rows: assets.screen.max_table_rows,
                    },
                ],
            )),
        },
        TriggerType::ToolErrorFatal | TriggerType::PolicyBlocked => None,
    }
}

/// 从实体目录推导缺失槽位的值
fn fill_value(plan: &Plan, spec: SpecRef, slot: &str, schema: &SchemaCatalog) -> Option<Value> {
    match (spec, slot) {
        (SpecRef::Primary | SpecRef::Secondary(_), "source") => {
            let t = plan.tabular(spec)?;
            let by_entity = t
                .entity
                .as_deref()
                .and_then(|e| schema.entity(e))
                .map(|e| e.source.clone());
            by_entity
                .or_else(|| {
                    t.keywords.iter().find_map(|k| {
                        schema
                            .entities
                            .iter()
                            .find(|e| e.name.eq_ignore_ascii_case(k) || e.source.eq_ignore_ascii_case(k))
                            .map(|e| e.source.clone())
                    })
                })
                .map(Value::from)
        }
        (SpecRef::Metric, "metric") => {
            let m = plan.spec.metric.as_ref()?;
            let named = m.keywords.iter().find_map(|k| {
                schema
                    .entities
                    .iter()
                    .flat_map(|e| e.metrics.iter())
                    .find(|metric| metric.eq_ignore_ascii_case(k))
                    .cloned()
            });
            named
                .or_else(|| {
                    m.entity
                        .as_deref()
                        .and_then(|e| schema.entity(e))
                        .and_then(|e| e.metrics.first().cloned())
                })
                .map(Value::from)
        }
        (SpecRef::Graph, "root") => {
            let primary = plan.spec.primary.as_ref()?;
            let key_field = primary
                .entity
                .as_deref()
                .and_then(|e| schema.entity(e))
                .map(|e| e.key_field.as_str())
                .unwrap_or("name");
            primary
                .filters
                .iter()
                .find(|f| f.field == key_field && f.op == FilterOp::Eq)
                .and_then(|f| f.value.as_str().map(String::from))
                .or_else(|| primary.keywords.first().cloned())
                .map(Value::from)
        }
        _ => None,
    }
}

/// empty_result：逐级放宽
fn widen(plan: &Plan, spec: SpecRef, assets: &AssetBundle) -> Option<PatchOp> {
    let budget = &assets.policy.budget;
    match spec {
        SpecRef::Primary | SpecRef::Secondary(_) => {
            let t = plan.tabular(spec)?;
            if t.filters.iter().any(|f| f.op == FilterOp::Eq && f.value.is_string()) {
                let filters = t
                    .filters
                    .iter()
                    .map(|f| {
                        if f.op == FilterOp::Eq && f.value.is_string() {
                            FilterSpec {
                                op: FilterOp::Contains,
                                ..f.clone()
                            }
                        } else {
                            f.clone()
                        }
                    })
                    .collect();
                return Some(PatchOp::WidenFilters {
                    target: spec,
                    filters,
                    keywords: t.keywords.clone(),
                });
            }
            if !t.filters.is_empty() {
                let mut filters = t.filters.clone();
                filters.pop();
                return Some(PatchOp::WidenFilters {
                    target: spec,
                    filters,
                    keywords: t.keywords.clone(),
                });
            }
            if !t.keywords.is_empty() {
                return Some(PatchOp::WidenFilters {
                    target: spec,
                    filters: Vec::new(),
                    keywords: Vec::new(),
                });
            }
            None
        }
        SpecRef::History => {
            let h = plan.spec.history.as_ref()?;
            if !h.event_types.is_empty() {
                return Some(PatchOp::WidenFilters {
                    target: spec,
                    filters: Vec::new(),
                    keywords: h.keywords.clone(),
                });
            }
            if !h.keywords.is_empty() {
                return Some(PatchOp::WidenFilters {
                    target: spec,
                    filters: Vec::new(),
                    keywords: Vec::new(),
                });
            }
            let current = h
                .window
                .map(|w| w.last_minutes)
                .unwrap_or(assets.query.default_window_minutes);
            relax_window(spec, current, 4, budget.max_window_minutes)
        }
        SpecRef::Metric => {
            let m = plan.spec.metric.as_ref()?;
            let current = m
                .window
                .map(|w| w.last_minutes)
                .unwrap_or(assets.query.default_window_minutes);
            relax_window(spec, current, 4, budget.max_window_minutes).or_else(|| {
                (!m.keywords.is_empty()).then(|| PatchOp::WidenFilters {
                    target: spec,
                    filters: Vec::new(),
                    keywords: Vec::new(),
                })
            })
        }
        SpecRef::Graph => {
            let g = plan.spec.graph.as_ref()?;
            let depth = g.depth.unwrap_or(assets.query.default_depth);
            if depth < budget.max_depth {
                return Some(PatchOp::ExpandDepth {
                    target: spec,
                    depth: depth + 1,
                });
            }
            (!g.relations.is_empty()).then(|| PatchOp::WidenFilters {
                target: spec,
                filters: Vec::new(),
                keywords: Vec::new(),
            })
        }
    }
}

fn relax_window(spec: SpecRef, current: u64, factor: u64, max: u64) -> Option<PatchOp> {
    let relaxed = current.saturating_mul(factor).min(max);
    (relaxed > current).then_some(PatchOp::RelaxTimeWindow {
        target: spec,
        last_minutes: relaxed,
    })
}

/// tool_error_retryable：缩小范围后重试
fn narrow(plan: &Plan, spec: SpecRef, assets: &AssetBundle) -> Option<PatchOp> {
    let default_limit = assets.query.default_limit.min(assets.policy.budget.max_rows);
    let halve_limit = |limit: Option<usize>| {
        let current = limit.unwrap_or(default_limit);
        let next = (current / 2).max(1);
        (next < current).then_some(next)
    };
    let halve_window = |window: Option<crate::plan::TimeWindow>| {
        let current = window
            .map(|w| w.last_minutes)
            .unwrap_or(assets.query.default_window_minutes);
        let next = (current / 2).max(5);
        (next < current).then_some(next)
    };
    let (limit, last_minutes) = match spec {
        SpecRef::Primary | SpecRef::Secondary(_) => (halve_limit(plan.tabular(spec)?.limit), None),
        SpecRef::Metric => (None, halve_window(plan.spec.metric.as_ref()?.window)),
        SpecRef::History => {
            let h = plan.spec.history.as_ref()?;
            (halve_limit(h.limit), halve_window(h.window))
        }
        SpecRef::Graph => {
            let g = plan.spec.graph.as_ref()?;
            let depth = g.depth.unwrap_or(assets.query.default_depth);
            return (depth > 1).then_some(PatchOp::ExpandDepth {
                target: spec,
                depth: depth - 1,
            });
        }
    };
    if limit.is_none() && last_minutes.is_none() {
        return None;
    }
    Some(PatchOp::NarrowScope {
        target: spec,
        limit,
        last_minutes,
    })
}

/// low_evidence：提高行数上限并放宽时间窗口
fn broaden(plan: &Plan, spec: SpecRef, assets: &AssetBundle) -> Vec<PatchOp> {
    let budget = &assets.policy.budget;
    let default_limit = assets.query.default_limit.min(budget.max_rows);
    let raise = |limit: Option<usize>| {
        let current = limit.unwrap_or(default_limit);
        let next = current.saturating_mul(2).min(budget.max_rows);
        (next > current).then_some(PatchOp::RaiseLimit {
            target: spec,
            limit: next,
        })
    };
    let default_window = assets.query.default_window_minutes;
    match spec {
        SpecRef::Primary | SpecRef::Secondary(_) => plan
            .tabular(spec)
            .and_then(|t| raise(t.limit))
            .into_iter()
            .collect(),
        SpecRef::Metric => plan
            .spec
            .metric
            .as_ref()
            .and_then(|m| {
                relax_window(
                    spec,
                    m.window.map(|w| w.last_minutes).unwrap_or(default_window),
                    2,
                    budget.max_window_minutes,
                )
            })
            .into_iter()
            .collect(),
        SpecRef::History => match plan.spec.history.as_ref() {
            Some(h) => raise(h.limit)
                .into_iter()
                .chain(relax_window(
                    spec,
                    h.window.map(|w| w.last_minutes).unwrap_or(default_window),
                    2,
                    budget.max_window_minutes,
                ))
                .collect(),
            None => Vec::new(),
        },
        SpecRef::Graph => Vec::new(),
    }
}

/// 决策的 JSON 快照（写入 ReplanEvent.decision）
pub fn decision_summary(decision: &ReplanDecision, budget: &ReplanBudget) -> Value {
    json!({
        "reason": decision.reason,
        "replans_used": budget.used,
        "replan_budget": budget.max,
        "fatal": decision.fatal,
        "unresolved": decision.unresolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{GraphSpec, HistorySpec, Intent, MetricSpec, OutputSpec, PlanSpec, TabularSpec, TimeWindow};

    fn plan_with(primary: Option<TabularSpec>, metric: Option<MetricSpec>, graph: Option<GraphSpec>) -> Plan {
        Plan::new(
            "q",
            PlanSpec {
                intent: Intent::Lookup,
                view: View::Table,
                primary,
                secondary: vec![],
                graph,
                metric,
                history: Some(HistorySpec {
                    event_types: vec!["deploy".into()],
                    ..Default::default()
                }),
                output: OutputSpec::default(),
            },
        )
    }

    fn lookup() -> Plan {
        plan_with(
            Some(TabularSpec {
                entity: Some("service".into()),
                filters: vec![FilterSpec::eq("name", "checkout")],
                ..Default::default()
            }),
            None,
            None,
        )
    }

    fn empty(spec: SpecRef) -> Trigger {
        Trigger::soft(TriggerType::EmptyResult, StageName::Execute, "no rows").with_spec(spec)
    }

    #[test]
    fn test_empty_result_widens_eq_to_contains() {
        let assets = AssetBundle::default();
        let decision = ReplanController.evaluate(
            &empty(SpecRef::Primary),
            &lookup(),
            &ReplanBudget::new(2),
            &assets,
            false,
        );
        assert!(decision.should_replan);
        assert_eq!(decision.target_stage, Some(StageName::Execute));
        let patched = decision.patched_plan.unwrap();
        assert_eq!(patched.revision, 2);
        assert_eq!(
            patched.spec.primary.unwrap().filters[0].op,
            FilterOp::Contains
        );
    }

    #[test]
    fn test_second_widen_drops_filter() {
        let assets = AssetBundle::default();
        let once = ReplanController
            .evaluate(&empty(SpecRef::Primary), &lookup(), &ReplanBudget::new(2), &assets, false)
            .patched_plan
            .unwrap();
        let twice = ReplanController
            .evaluate(&empty(SpecRef::Primary), &once, &ReplanBudget::new(2), &assets, false)
            .patched_plan
            .unwrap();
        assert!(twice.spec.primary.unwrap().filters.is_empty());
        assert_eq!(twice.revision, 3);
    }

    #[test]
    fn test_fatal_and_policy_never_replan() {
        let assets = AssetBundle::default();
        let hard = Trigger::hard(TriggerType::ToolErrorFatal, StageName::Execute, "boom");
        let decision = ReplanController.evaluate(&hard, &lookup(), &ReplanBudget::new(2), &assets, false);
        assert!(!decision.should_replan);
        assert!(decision.fatal);

        let soft = Trigger::soft(TriggerType::PolicyBlocked, StageName::Validate, "clamped");
        let decision = ReplanController.evaluate(&soft, &lookup(), &ReplanBudget::new(2), &assets, false);
        assert!(!decision.should_replan);
        assert!(!decision.fatal);
        assert!(!decision.unresolved);
    }

    #[test]
    fn test_budget_and_deadline_leave_unresolved() {
        let assets = AssetBundle::default();
        let mut budget = ReplanBudget::new(1);
        budget.consume();
        let decision = ReplanController.evaluate(&empty(SpecRef::Primary), &lookup(), &budget, &assets, false);
        assert!(!decision.should_replan);
        assert!(decision.unresolved);
        assert!(decision.reason.contains("budget exhausted"));

        let decision =
            ReplanController.evaluate(&empty(SpecRef::Primary), &lookup(), &ReplanBudget::new(2), &assets, true);
        assert!(decision.unresolved);
    }

    #[test]
    fn test_no_op_patch_is_not_a_replan() {
        let assets = AssetBundle::default();
        let bare = plan_with(
            Some(TabularSpec {
                entity: Some("service".into()),
                ..Default::default()
            }),
            None,
            None,
        );
        let decision = ReplanController.evaluate(&empty(SpecRef::Primary), &bare, &ReplanBudget::new(2), &assets, false);
        assert!(!decision.should_replan);
        assert_eq!(decision.reason, NO_PATCH_REASON);
    }

    #[test]
    fn test_slot_missing_fills_source_from_catalog() {
        let assets = AssetBundle::default();
        let plan = plan_with(
            Some(TabularSpec {
                keywords: vec!["hosts".into()],
                ..Default::default()
            }),
            None,
            None,
        );
        let trigger = Trigger::soft(TriggerType::SlotMissing, StageName::Execute, "missing")
            .with_spec(SpecRef::Primary)
            .with_slot("source");
        let decision = ReplanController.evaluate(&trigger, &plan, &ReplanBudget::new(2), &assets, false);
        assert_eq!(
            decision.patched_plan.unwrap().spec.primary.unwrap().source.as_deref(),
            Some("hosts")
        );
    }

    #[test]
    fn test_metric_window_relaxed_to_policy_cap() {
        let assets = AssetBundle::default();
        let plan = plan_with(
            None,
            Some(MetricSpec {
                metric: Some("cpu".into()),
                window: Some(TimeWindow { last_minutes: 5000 }),
                ..Default::default()
            }),
            None,
        );
        let decision = ReplanController.evaluate(&empty(SpecRef::Metric), &plan, &ReplanBudget::new(2), &assets, false);
        let window = decision.patched_plan.unwrap().spec.metric.unwrap().window.unwrap();
        assert_eq!(window.last_minutes, assets.policy.budget.max_window_minutes);
    }

    #[test]
    fn test_graph_depth_expands() {
        let assets = AssetBundle::default();
        let plan = plan_with(
            None,
            None,
            Some(GraphSpec {
                root: Some("checkout-api".into()),
                depth: Some(1),
                relations: vec![],
            }),
        );
        let decision = ReplanController.evaluate(&empty(SpecRef::Graph), &plan, &ReplanBudget::new(2), &assets, false);
        assert_eq!(decision.patched_plan.unwrap().spec.graph.unwrap().depth, Some(2));
    }

    #[test]
    fn test_history_event_types_cleared_first() {
        let assets = AssetBundle::default();
        let decision =
            ReplanController.evaluate(&empty(SpecRef::History), &lookup(), &ReplanBudget::new(2), &assets, false);
        assert!(decision.patched_plan.unwrap().spec.history.unwrap().event_types.is_empty());
    }

    #[test]
    fn test_retryable_error_halves_limit() {
        let assets = AssetBundle::default();
        let trigger = Trigger::soft(TriggerType::ToolErrorRetryable, StageName::Execute, "busy")
            .with_spec(SpecRef::Primary);
        let decision = ReplanController.evaluate(&trigger, &lookup(), &ReplanBudget::new(2), &assets, false);
        assert_eq!(decision.patched_plan.unwrap().spec.primary.unwrap().limit, Some(25));
    }

    #[test]
    fn test_present_limit_targets_present() {
        let assets = AssetBundle::default();
        let trigger = Trigger::soft(TriggerType::PresentLimit, StageName::Present, "rows").with_slot("rows");
        let decision = ReplanController.evaluate(&trigger, &lookup(), &ReplanBudget::new(2), &assets, false);
        assert_eq!(decision.target_stage, Some(StageName::Present));
        let patched = decision.patched_plan.unwrap();
        assert_eq!(patched.spec.view, View::Summary);
        assert_eq!(patched.spec.output.max_rows, Some(assets.screen.max_table_rows));
    }

    #[test]
    fn test_low_evidence_raises_limit() {
        let assets = AssetBundle::default();
        let trigger = Trigger::soft(TriggerType::LowEvidence, StageName::Compose, "thin")
            .with_spec(SpecRef::Primary);
        let decision = ReplanController.evaluate(&trigger, &lookup(), &ReplanBudget::new(2), &assets, false);
        assert_eq!(decision.patched_plan.unwrap().spec.primary.unwrap().limit, Some(100));
    }
}
