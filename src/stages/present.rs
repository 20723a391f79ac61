//! Present 阶段：按 ScreenAsset 把回答块排成 ScreenModel
//!
//! 表格与时间线受 max_table_rows 限制，块数受 max_blocks 限制；plan.output 中的上限优先（只能更小）。
//! 发生截断且计划尚未设置对应上限时报告 present_limit。summary 视图把表格折叠为预览。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::compose::ComposeOutput;
use super::{Diagnostics, StageContext, StageExecutor, StageInput, StageName, StageOutcome};
use crate::answer::{AnswerBlock, ScreenComponent, ScreenModel};
use crate::assets::ScreenAsset;
use crate::core::OrchestrationError;
use crate::plan::{Plan, View};
use crate::replan::{Trigger, TriggerType};

/// summary 视图下表格预览的行数
const SUMMARY_PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentInput {
    pub plan: Plan,
    pub composed: ComposeOutput,
}

impl StageInput for PresentInput {
    fn check(&self) -> Result<(), OrchestrationError> {
        if self.composed.blocks.is_empty() {
            return Err(OrchestrationError::Validation(
                "present needs at least one block".to_string(),
            ));
        }
        Ok(())
    }
}

/// 排版结果与截断情况
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub screen: ScreenModel,
    pub rows_truncated: bool,
    pub blocks_truncated: bool,
}

/// 把回答块排成屏幕模型（Present 阶段与直接回答共用）
pub fn layout_blocks(
    title: &str,
    view: View,
    blocks: &[AnswerBlock],
    screen: &ScreenAsset,
    max_rows: Option<usize>,
    max_blocks: Option<usize>,
) -> Layout {
    let mut row_limit = max_rows
        .map(|r| r.min(screen.max_table_rows))
        .unwrap_or(screen.max_table_rows);
    if view == View::Summary {
        row_limit = row_limit.min(SUMMARY_PREVIEW_ROWS);
    }
    let block_limit = max_blocks
        .map(|b| b.min(screen.max_blocks))
        .unwrap_or(screen.max_blocks)
        .max(1);

    let mut rows_truncated = false;
    let components = blocks
        .iter()
        .take(block_limit)
        .enumerate()
        .map(|(i, block)| {
            let (props, truncated) = props_for(block, row_limit);
            rows_truncated |= truncated;
            ScreenComponent {
                id: format!("{}-{}", block.kind().as_str(), i + 1),
                component: screen.component_for(block.kind()),
                block: block.kind(),
                props,
                truncated,
            }
        })
        .collect();
    let hidden_blocks = blocks.len().saturating_sub(block_limit);

    Layout {
        screen: ScreenModel {
            layout: screen.layout.clone(),
            view,
            title: title.to_string(),
            components,
            hidden_blocks,
        },
        rows_truncated,
        blocks_truncated: hidden_blocks > 0,
    }
}

fn props_for(block: &AnswerBlock, row_limit: usize) -> (Value, bool) {
    match block {
        AnswerBlock::Table {
            title,
            columns,
            rows,
        } => {
            let shown: Vec<&Vec<Value>> = rows.iter().take(row_limit).collect();
            (
                json!({
                    "title": title,
                    "columns": columns,
                    "rows": shown,
                    "total_rows": rows.len(),
                }),
                rows.len() > row_limit,
            )
        }
        AnswerBlock::Timeline { title, events } => {
            let shown: Vec<_> = events.iter().take(row_limit).collect();
            (
                json!({
                    "title": title,
                    "events": shown,
                    "total_events": events.len(),
                }),
                events.len() > row_limit,
            )
        }
        other => (serde_json::to_value(other).unwrap_or(Value::Null), false),
    }
}

pub struct PresentStage;

#[async_trait]
impl StageExecutor for PresentStage {
    type Input = PresentInput;
    type Output = ScreenModel;

    fn stage(&self) -> StageName {
        StageName::Present
    }

    async fn execute(
        &self,
        input: &PresentInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome<ScreenModel>, OrchestrationError> {
        let output = &input.plan.spec.output;
        let layout = layout_blocks(
            &input.plan.question,
            input.plan.spec.view,
            &input.composed.blocks,
            ctx.assets.screen(),
            output.max_rows,
            output.max_blocks,
        );

        let mut diagnostics = Diagnostics::default();
        let mut triggers = Vec::new();
        diagnostics.count("components", layout.screen.components.len() as u64);
        diagnostics.count("hidden_blocks", layout.screen.hidden_blocks as u64);

        if layout.rows_truncated {
            diagnostics.warn("table rows truncated to screen limit");
            if output.max_rows.is_none() {
                triggers.push(
                    Trigger::soft(
                        TriggerType::PresentLimit,
                        StageName::Present,
                        "result rows exceed the screen limit",
                    )
                    .with_slot("rows"),
                );
            }
        }
        if layout.blocks_truncated {
            diagnostics.warn(format!("{} block(s) hidden", layout.screen.hidden_blocks));
            if output.max_blocks.is_none() {
                triggers.push(
                    Trigger::soft(
                        TriggerType::PresentLimit,
                        StageName::Present,
                        "answer has more blocks than the screen shows",
                    )
                    .with_slot("blocks"),
                );
            }
        }

        Ok(StageOutcome::new(layout.screen, diagnostics, triggers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::answer::{BlockKind, NoticeLevel};
    use crate::assets::{AssetBundle, AssetLens};
    use crate::plan::{Intent, OutputSpec, PlanSpec, TabularSpec};
    use crate::stages::RunMode;

    fn table(n: usize) -> AnswerBlock {
        AnswerBlock::Table {
            title: "services".into(),
            columns: vec!["name".into()],
            rows: (0..n).map(|i| vec![json!(format!("svc-{i}"))]).collect(),
        }
    }

    fn input(blocks: Vec<AnswerBlock>, view: View, max_rows: Option<usize>) -> PresentInput {
        PresentInput {
            plan: Plan::new(
                "list services",
                PlanSpec {
                    intent: Intent::Lookup,
                    view,
                    primary: Some(TabularSpec::default()),
                    secondary: vec![],
                    graph: None,
                    metric: None,
                    history: None,
                    output: OutputSpec {
                        max_rows,
                        ..Default::default()
                    },
                },
            ),
            composed: ComposeOutput {
                answer: "a".into(),
                blocks,
                evidence_rows: 0,
            },
        }
    }

    fn ctx(bundle: &AssetBundle) -> StageContext<'_> {
        StageContext {
            trace_id: "p",
            mode: RunMode::Full,
            deadline: tokio::time::Instant::now() + Duration::from_secs(5),
            as_of: chrono::Utc::now(),
            assets: AssetLens::new(bundle),
        }
    }

    #[tokio::test]
    async fn test_components_follow_screen_asset() {
        let bundle = AssetBundle::default();
        let blocks = vec![
            table(3),
            AnswerBlock::notice(NoticeLevel::Info, "partial data"),
        ];
        let outcome = PresentStage
            .execute(&input(blocks, View::Table, None), &ctx(&bundle))
            .await
            .unwrap();
        let screen = &outcome.output;
        assert_eq!(screen.layout, "stack");
        assert_eq!(screen.components[0].component, "data_table");
        assert_eq!(screen.components[0].id, "table-1");
        assert_eq!(screen.components[1].component, "banner");
        assert!(outcome.triggers.is_empty());
    }

    #[tokio::test]
    async fn test_row_truncation_emits_present_limit() {
        let bundle = AssetBundle::default();
        let outcome = PresentStage
            .execute(&input(vec![table(40)], View::Table, None), &ctx(&bundle))
            .await
            .unwrap();
        let component = &outcome.output.components[0];
        assert!(component.truncated);
        assert_eq!(component.props["rows"].as_array().unwrap().len(), 25);
        assert_eq!(component.props["total_rows"], json!(40));
        assert_eq!(outcome.triggers[0].trigger_type, TriggerType::PresentLimit);
        assert_eq!(outcome.triggers[0].slot.as_deref(), Some("rows"));
    }

    #[tokio::test]
    async fn test_capped_plan_does_not_retrigger() {
        let bundle = AssetBundle::default();
        let outcome = PresentStage
            .execute(&input(vec![table(40)], View::Summary, Some(25)), &ctx(&bundle))
            .await
            .unwrap();
        let component = &outcome.output.components[0];
        assert_eq!(component.props["rows"].as_array().unwrap().len(), SUMMARY_PREVIEW_ROWS);
        assert!(outcome.triggers.is_empty());
        assert_eq!(outcome.output.view, View::Summary);
    }

    #[tokio::test]
    async fn test_extra_blocks_are_hidden() {
        let mut bundle = AssetBundle::default();
        bundle.screen.max_blocks = 2;
        let blocks = vec![table(1), table(1), table(1)];
        let outcome = PresentStage
            .execute(&input(blocks, View::Table, None), &ctx(&bundle))
            .await
            .unwrap();
        assert_eq!(outcome.output.components.len(), 2);
        assert_eq!(outcome.output.hidden_blocks, 1);
        assert_eq!(outcome.triggers[0].slot.as_deref(), Some("blocks"));
    }

    #[test]
    fn test_layout_for_direct_answer() {
        let layout = layout_blocks(
            "hi",
            View::Summary,
            &[AnswerBlock::Text {
                title: None,
                body: "hello".into(),
            }],
            &ScreenAsset::default(),
            None,
            None,
        );
        assert_eq!(layout.screen.components[0].block, BlockKind::Text);
        assert_eq!(layout.screen.components[0].component, "markdown");
        assert!(!layout.rows_truncated);
    }

    #[test]
    fn test_empty_blocks_fail_contract() {
        let err = input(vec![], View::Table, None).check().unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
