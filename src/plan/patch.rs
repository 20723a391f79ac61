//! 计划补丁
//!
//! ReplanController 生成 PlanPatch，runner 以 apply 得到新的 Plan。
//! 每个操作都携带计算好的目标值，apply 只做替换，不再查资产。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{FilterSpec, Plan, PlanSpec, SpecRef, TimeWindow, View};

/// 单个补丁操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// 填充缺失槽位（source / entity / metric / root / keywords）
    FillSlot {
        target: SpecRef,
        slot: String,
        value: Value,
    },
    /// 放宽过滤条件：用给定的 filters / keywords 替换原值
    WidenFilters {
        target: SpecRef,
        filters: Vec<FilterSpec>,
        keywords: Vec<String>,
    },
    RelaxTimeWindow {
        target: SpecRef,
        last_minutes: u64,
    },
    /// 缩小查询范围（可重试错误后降低负载）
    NarrowScope {
        target: SpecRef,
        limit: Option<usize>,
        last_minutes: Option<u64>,
    },
    RaiseLimit {
        target: SpecRef,
        limit: usize,
    },
    ExpandDepth {
        target: SpecRef,
        depth: u32,
    },
    AlternateView {
        view: View,
    },
    CapRows {
        max_rows: usize,
    },
    CapBlocks {
        max_blocks: usize,
    },
}

/// 一组补丁操作及其原因
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanPatch {
    pub reason: String,
    pub ops: Vec<PatchOp>,
}

impl PlanPatch {
    pub fn new(reason: impl Into<String>, ops: Vec<PatchOp>) -> Self {
        Self {
            reason: reason.into(),
            ops,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// 合并同一目标阶段的另一补丁
    pub fn merge(&mut self, other: PlanPatch) {
        if !other.reason.is_empty() {
            if self.reason.is_empty() {
                self.reason = other.reason;
            } else {
                self.reason = format!("{}; {}", self.reason, other.reason);
            }
        }
        self.ops.extend(other.ops);
    }

    /// 应用补丁，返回新修订版；原 Plan 不变
    pub fn apply(&self, plan: &Plan) -> Plan {
        let mut spec = plan.spec.clone();
        for op in &self.ops {
            apply_op(&mut spec, op);
        }
        plan.revise(spec)
    }

    /// 补丁是否真正改变了计划内容
    pub fn changes(&self, plan: &Plan) -> bool {
        let mut spec = plan.spec.clone();
        for op in &self.ops {
            apply_op(&mut spec, op);
        }
        spec != plan.spec
    }
}

fn apply_op(spec: &mut PlanSpec, op: &PatchOp) {
    match op {
        PatchOp::FillSlot {
            target,
            slot,
            value,
        } => fill_slot(spec, *target, slot, value),
        PatchOp::WidenFilters {
            target,
            filters,
            keywords,
        } => match target {
            SpecRef::Primary | SpecRef::Secondary(_) => {
                if let Some(t) = tabular_mut(spec, *target) {
                    t.filters = filters.clone();
                    t.keywords = keywords.clone();
                }
            }
            SpecRef::History => {
                if let Some(h) = spec.history.as_mut() {
                    h.keywords = keywords.clone();
                    h.event_types.clear();
                }
            }
            SpecRef::Metric => {
                if let Some(m) = spec.metric.as_mut() {
                    m.keywords = keywords.clone();
                }
            }
            SpecRef::Graph => {
                if let Some(g) = spec.graph.as_mut() {
                    g.relations.clear();
                }
            }
        },
        PatchOp::RelaxTimeWindow {
            target,
            last_minutes,
        } => set_window(spec, *target, *last_minutes),
        PatchOp::NarrowScope {
            target,
            limit,
            last_minutes,
        } => {
            if let Some(limit) = limit {
                set_limit(spec, *target, *limit);
            }
            if let Some(minutes) = last_minutes {
                set_window(spec, *target, *minutes);
            }
        }
        PatchOp::RaiseLimit { target, limit } => set_limit(spec, *target, *limit),
        PatchOp::ExpandDepth { target, depth } => {
            if *target == SpecRef::Graph {
                if let Some(g) = spec.graph.as_mut() {
                    g.depth = Some(*depth);
                }
            }
        }
        PatchOp::AlternateView { view } => spec.view = *view,
        PatchOp::CapRows { max_rows } => spec.output.max_rows = Some(*max_rows),
        PatchOp::CapBlocks { max_blocks } => spec.output.max_blocks = Some(*max_blocks),
    }
}

fn tabular_mut(spec: &mut PlanSpec, target: SpecRef) -> Option<&mut super::types::TabularSpec> {
    match target {
        SpecRef::Primary => spec.primary.as_mut(),
        SpecRef::Secondary(i) => spec.secondary.get_mut(i),
        _ => None,
    }
}

fn set_window(spec: &mut PlanSpec, target: SpecRef, last_minutes: u64) {
    let window = Some(TimeWindow { last_minutes });
    match target {
        SpecRef::Metric => {
            if let Some(m) = spec.metric.as_mut() {
                m.window = window;
            }
        }
        SpecRef::History => {
            if let Some(h) = spec.history.as_mut() {
                h.window = window;
            }
        }
        _ => {}
    }
}

fn set_limit(spec: &mut PlanSpec, target: SpecRef, limit: usize) {
    match target {
        SpecRef::History => {
            if let Some(h) = spec.history.as_mut() {
                h.limit = Some(limit);
            }
        }
        _ => {
            if let Some(t) = tabular_mut(spec, target) {
                t.limit = Some(limit);
            }
        }
    }
}

fn string_value(value: &Value) -> Option<String> {
    value.as_str().map(|s| s.to_string())
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn fill_slot(spec: &mut PlanSpec, target: SpecRef, slot: &str, value: &Value) {
    match target {
        SpecRef::Primary | SpecRef::Secondary(_) => {
            if let Some(t) = tabular_mut(spec, target) {
                match slot {
                    "source" => t.source = string_value(value),
                    "entity" => t.entity = string_value(value),
                    "keywords" => t.keywords = string_list(value),
                    _ => {}
                }
            }
        }
        SpecRef::Metric => {
            if let Some(m) = spec.metric.as_mut() {
                match slot {
                    "metric" => m.metric = string_value(value),
                    "entity" => m.entity = string_value(value),
                    "keywords" => m.keywords = string_list(value),
                    _ => {}
                }
            }
        }
        SpecRef::Graph => {
            if let Some(g) = spec.graph.as_mut() {
                if slot == "root" {
                    g.root = string_value(value);
                }
            }
        }
        SpecRef::History => {
            if let Some(h) = spec.history.as_mut() {
                match slot {
                    "entity" => h.entity = string_value(value),
                    "keywords" => h.keywords = string_list(value),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::{FilterOp, HistorySpec, Intent, OutputSpec, TabularSpec};

    fn plan() -> Plan {
        Plan::new(
            "show service name = checkout",
            PlanSpec {
                intent: Intent::Lookup,
                view: View::Table,
                primary: Some(TabularSpec {
                    entity: Some("service".into()),
                    filters: vec![FilterSpec::eq("name", "checkout")],
                    ..Default::default()
                }),
                secondary: vec![],
                graph: None,
                metric: None,
                history: Some(HistorySpec::default()),
                output: OutputSpec::default(),
            },
        )
    }

    #[test]
    fn test_apply_creates_new_revision() {
        let original = plan();
        let patch = PlanPatch::new(
            "widen",
            vec![PatchOp::WidenFilters {
                target: SpecRef::Primary,
                filters: vec![FilterSpec {
                    field: "name".into(),
                    op: FilterOp::Contains,
                    value: "checkout".into(),
                }],
                keywords: vec![],
            }],
        );
        let patched = patch.apply(&original);
        assert_eq!(patched.revision, original.revision + 1);
        assert_eq!(patched.id, original.id);
        assert_eq!(original.spec.primary.as_ref().unwrap().filters[0].op, FilterOp::Eq);
        assert_eq!(patched.spec.primary.as_ref().unwrap().filters[0].op, FilterOp::Contains);
    }

    #[test]
    fn test_fill_slot_and_window() {
        let patch = PlanPatch::new(
            "fill",
            vec![
                PatchOp::FillSlot {
                    target: SpecRef::Primary,
                    slot: "source".into(),
                    value: "services".into(),
                },
                PatchOp::RelaxTimeWindow {
                    target: SpecRef::History,
                    last_minutes: 120,
                },
            ],
        );
        let patched = patch.apply(&plan());
        assert_eq!(
            patched.spec.primary.unwrap().source.as_deref(),
            Some("services")
        );
        assert_eq!(patched.spec.history.unwrap().window.unwrap().last_minutes, 120);
    }

    #[test]
    fn test_noop_patch_detected() {
        let original = plan();
        let patch = PlanPatch::new(
            "same",
            vec![PatchOp::AlternateView { view: View::Table }],
        );
        assert!(!patch.changes(&original));
        let patch = PlanPatch::new("cap", vec![PatchOp::CapRows { max_rows: 10 }]);
        assert!(patch.changes(&original));
    }

    #[test]
    fn test_merge_keeps_ops_in_order() {
        let mut a = PlanPatch::new("a", vec![PatchOp::CapRows { max_rows: 5 }]);
        a.merge(PlanPatch::new(
            "b",
            vec![PatchOp::AlternateView { view: View::Summary }],
        ));
        assert_eq!(a.ops.len(), 2);
        assert_eq!(a.reason, "a; b");
    }
}
