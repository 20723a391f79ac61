//! 重规划控制环：封闭的触发器分类与补丁决策

pub mod controller;
pub mod trigger;

pub use controller::{
    decision_summary, propose_patch, ReplanBudget, ReplanController, ReplanDecision,
    NO_PATCH_REASON,
};
pub use trigger::{Severity, Trigger, TriggerType};
