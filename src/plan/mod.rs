//! 计划模型、补丁与规则规划器

pub mod classifier;
pub mod patch;
pub mod types;

pub use classifier::RulePlanner;
pub use patch::{PatchOp, PlanPatch};
pub use types::{
    Aggregation, Backend, FilterOp, FilterSpec, GraphSpec, HistorySpec, Intent, MetricSpec,
    OutputSpec, Plan, PlanDraft, PlanOutcome, PlanSpec, SpecRef, TabularSpec, TimeWindow, View,
};
