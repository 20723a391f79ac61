//! 编排端到端场景：重规划、策略、选择器、部分失败、资产覆盖、重放与单阶段测试

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use sonar::assets::AssetBundle;
    use sonar::config::AppConfig;
    use sonar::core::ToolError;
    use sonar::llm::ScriptedGenerator;
    use sonar::orchestrator::{RerunRequest, StageTestRequest};
    use sonar::plan::{Backend, SpecRef};
    use sonar::replan::{Severity, TriggerType};
    use sonar::stages::{ExecuteOutput, RunMode, StageName};
    use sonar::tools::{Edge, GraphTool, ResultSet, TabularTool, Tool, ToolContext, ToolOutcome};
    use sonar::trace::{JsonlTraceSink, RunOutcome, RunStatus};
    use sonar::{OrchestrateRequest, Orchestrator, OrchestratorBuilder};

    fn service(name: &str, team: &str) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("name".into(), json!(name));
        row.insert("team".into(), json!(team));
        row.insert("status".into(), json!("healthy"));
        row
    }

    fn config_items() -> Arc<TabularTool> {
        let mut datasets = HashMap::new();
        datasets.insert(
            "services".to_string(),
            vec![
                service("checkout-api", "payments"),
                service("payments-gateway", "payments"),
                service("search", "discovery"),
            ],
        );
        Arc::new(TabularTool::new("config_items", datasets))
    }

    fn config(max_replans: u32) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.orchestrator.max_replans = max_replans;
        cfg
    }

    fn builder(max_replans: u32) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config(max_replans))
            .with_assets(AssetBundle::default())
            .without_fixtures()
    }

    fn orchestrator(max_replans: u32) -> Orchestrator {
        builder(max_replans)
            .with_tool(config_items())
            .build()
            .unwrap()
    }

    /// 第一次调用返回可重试错误，之后正常返回
    struct FlakyTable {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for FlakyTable {
        fn tool_type(&self) -> &str {
            "flaky_items"
        }

        fn backend(&self) -> Backend {
            Backend::Tabular
        }

        fn description(&self) -> &str {
            "fails once, then answers"
        }

        async fn execute(
            &self,
            _operation: &str,
            params: &Value,
            _ctx: &ToolContext,
        ) -> Result<ResultSet, ToolError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ToolError::retryable("backend busy"));
            }
            let mut row = Map::new();
            row.insert("name".into(), json!("checkout-api"));
            row.insert("limit".into(), params["limit"].clone());
            Ok(ResultSet::new(
                vec!["name".to_string(), "limit".to_string()],
                vec![row],
            ))
        }
    }

    /// 总是失败的指标后端
    struct BrokenMetrics;

    #[async_trait]
    impl Tool for BrokenMetrics {
        fn tool_type(&self) -> &str {
            "broken_metrics"
        }

        fn backend(&self) -> Backend {
            Backend::Metric
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(
            &self,
            _operation: &str,
            _params: &Value,
            _ctx: &ToolContext,
        ) -> Result<ResultSet, ToolError> {
            Err(ToolError::fatal("metric store unreachable"))
        }
    }

    /// 响应很慢的配置库
    struct SlowTable;

    #[async_trait]
    impl Tool for SlowTable {
        fn tool_type(&self) -> &str {
            "config_items"
        }

        fn backend(&self) -> Backend {
            Backend::Tabular
        }

        fn description(&self) -> &str {
            "answers after three seconds"
        }

        async fn execute(
            &self,
            _operation: &str,
            _params: &Value,
            _ctx: &ToolContext,
        ) -> Result<ResultSet, ToolError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(ResultSet::new(vec!["name".to_string()], vec![]))
        }
    }

    fn topology() -> Arc<GraphTool> {
        let edge = |from: &str, to: &str| Edge {
            from: from.into(),
            to: to.into(),
            relation: "calls".into(),
        };
        Arc::new(GraphTool::new(
            "topology",
            vec![edge("checkout-api", "payments-gateway"), edge("checkout-api", "search")],
        ))
    }

    fn execute_output(response: &sonar::RunResponse) -> ExecuteOutput {
        let record = response.trace.last_record(StageName::Execute).unwrap();
        serde_json::from_value(record.output.clone().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_result_is_widened_once() {
        let orchestrator = orchestrator(2);
        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service name = checkout"))
            .await
            .unwrap();

        assert_eq!(response.status, RunStatus::Success, "{:?}", response.trace.error());
        let trace = &response.trace;
        assert_eq!(trace.replans().len(), 1);
        let event = &trace.replans()[0];
        assert_eq!(event.trigger_type, TriggerType::EmptyResult);
        assert!(event.should_replan);
        assert_eq!(event.before.as_ref().unwrap()["revision"], json!(1));
        assert_eq!(event.after.as_ref().unwrap()["revision"], json!(2));
        assert_eq!(
            event.after.as_ref().unwrap()["primary"]["filters"][0]["op"],
            json!("contains")
        );
        assert_eq!(trace.attempts(StageName::Execute), 2);
        assert_eq!(trace.replans_applied(), 1);
        assert!(response.answer.contains("checkout-api") || !response.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_field_fails_with_policy_violation() {
        let planner = Arc::new(ScriptedGenerator::always(json!({
            "kind": "plan",
            "intent": "lookup",
            "view": "table",
            "primary": {
                "entity": "service",
                "fields": ["name", "password"]
            }
        })));
        let orchestrator = builder(2)
            .with_tool(config_items())
            .with_planner(planner)
            .build()
            .unwrap();

        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service passwords"))
            .await
            .unwrap();

        assert_eq!(response.status, RunStatus::Failed);
        assert!(response.screen.is_none());
        let trace = &response.trace;
        assert_eq!(trace.error().unwrap().kind, "policy_violation");
        let last = trace.stages().last().unwrap();
        assert_eq!(last.stage, StageName::Validate);
        assert_eq!(last.error.as_ref().unwrap().kind, "policy_violation");
        assert!(last.output.is_some());
        assert!(trace.tool_calls().is_empty());
        assert_eq!(trace.attempts(StageName::Execute), 0);

        assert_eq!(trace.replans().len(), 1);
        let event = &trace.replans()[0];
        assert_eq!(event.trigger_type, TriggerType::PolicyBlocked);
        assert!(!event.should_replan);
        assert_eq!(event.severity, Severity::Hard);
        assert_eq!(event.stage, StageName::Validate);
        assert_eq!(event.stage_record, last.index);
        assert!(event.after.is_none());
    }

    #[tokio::test]
    async fn test_stored_trace_matches_returned_trace_on_failure() {
        let orchestrator = orchestrator(2);
        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service team = payments").with_overrides(
                json!({"policy": {"security": {"blocked_fields": ["team"]}}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status, RunStatus::Failed);

        let stored = orchestrator.trace(response.trace.trace_id()).unwrap();
        assert_eq!(stored, response.trace);
        let failing: Vec<_> = stored.stages().iter().filter(|r| r.error.is_some()).collect();
        assert_eq!(failing.len(), 1);
        assert_eq!(failing[0].index, stored.stages().len() - 1);
    }

    #[tokio::test]
    async fn test_selector_prefers_metric_store_for_trends() {
        let orchestrator = OrchestratorBuilder::new(AppConfig::default())
            .with_assets_dir("demo/assets")
            .build()
            .unwrap();
        let response = orchestrator
            .orchestrate(
                OrchestrateRequest::ask("latency_p99 for checkout-api over the last 2 hours")
                    .with_mode(RunMode::Fast),
            )
            .await
            .unwrap();

        assert_eq!(response.status, RunStatus::Success, "{:?}", response.trace.error());
        let calls = response.trace.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_type, "metric_store");
        assert!(calls[0].rows > 0);

        let execute = response.trace.last_record(StageName::Execute).unwrap();
        let ranking = &execute.output.as_ref().unwrap()["results"][0]["ranking"];
        assert_eq!(ranking[0]["tool_type"], json!("metric_store"));
        assert!(ranking.as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_huge_default_window_override_cannot_crash_the_run() {
        let orchestrator = OrchestratorBuilder::new(AppConfig::default())
            .with_assets_dir("demo/assets")
            .build()
            .unwrap();
        let question = "latency_p99 for checkout-api";
        let max_window = orchestrator.assets().policy.budget.max_window_minutes;

        let capped = orchestrator
            .orchestrate(
                OrchestrateRequest::ask(question)
                    .with_mode(RunMode::Fast)
                    .with_overrides(json!({"query": {"default_window_minutes": 4_611_686_018_427_387_904u64}})),
            )
            .await
            .unwrap();
        assert_ne!(capped.status, RunStatus::Failed, "{:?}", capped.trace.error());
        let output = execute_output(&capped);
        let metric = output.result_for(SpecRef::Metric).unwrap();
        assert_eq!(metric.call.params["last_minutes"], json!(max_window));
        assert!(metric.result.success);

        let unbounded = orchestrator
            .orchestrate(
                OrchestrateRequest::ask(question)
                    .with_mode(RunMode::Fast)
                    .with_overrides(json!({
                        "query": {"default_window_minutes": 4_611_686_018_427_387_904u64},
                        "policy": {"budget": {"max_window_minutes": 4_611_686_018_427_387_904u64}}
                    })),
            )
            .await
            .unwrap();
        assert_ne!(unbounded.status, RunStatus::Success);
        let output = execute_output(&unbounded);
        let metric = output.result_for(SpecRef::Metric).unwrap();
        assert!(!metric.result.success);
        let error = metric.result.error.as_ref().unwrap();
        assert!(!error.retryable);
        assert!(error.message.contains("out of range"));
        assert!(unbounded.trace.is_finished());
    }

    #[tokio::test]
    async fn test_request_deadline_keeps_completed_results() {
        let planner = Arc::new(ScriptedGenerator::always(json!({
            "kind": "plan",
            "intent": "relationship",
            "view": "topology",
            "primary": {"entity": "service", "keywords": ["checkout"]},
            "graph": {"root": "checkout-api", "depth": 1}
        })));
        let mut cfg = config(2);
        cfg.orchestrator.request_timeout_ms = 300;
        let orchestrator = OrchestratorBuilder::new(cfg)
            .with_assets(AssetBundle::default())
            .without_fixtures()
            .with_tool(Arc::new(SlowTable))
            .with_tool(topology())
            .with_planner(planner)
            .build()
            .unwrap();

        let started = Instant::now();
        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("what does checkout-api call").with_mode(RunMode::Fast))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(response.status, RunStatus::Degraded, "{:?}", response.trace.error());
        let trace = &response.trace;
        assert_eq!(trace.attempts(StageName::Execute), 1);
        let execute = trace.last_record(StageName::Execute).unwrap();
        assert_eq!(execute.diagnostics.counts["succeeded"], 1);
        assert_eq!(execute.diagnostics.counts["failed"], 1);

        let output = execute_output(&response);
        assert!(output.result_for(SpecRef::Graph).unwrap().result.success);
        assert!(!output.result_for(SpecRef::Primary).unwrap().result.success);

        let compose = trace.last_record(StageName::Compose).unwrap();
        let blocks = compose.output.as_ref().unwrap()["blocks"].as_array().unwrap().clone();
        assert!(blocks.iter().any(|b| b["type"] == json!("graph")));
        assert!(trace
            .tool_calls()
            .iter()
            .any(|c| c.tool_type == "config_items" && c.outcome == ToolOutcome::Timeout));
    }

    #[tokio::test]
    async fn test_replan_budget_bounds_the_loop() {
        let orchestrator = orchestrator(1);
        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service name = zzz"))
            .await
            .unwrap();

        let trace = &response.trace;
        assert_eq!(response.status, RunStatus::Degraded, "{:?}", trace.error());
        assert_eq!(trace.replans_applied(), 1);
        assert_eq!(trace.attempts(StageName::Execute), 2);
        let last = trace.replans().last().unwrap();
        assert_eq!(last.trigger_type, TriggerType::EmptyResult);
        assert!(!last.should_replan);
        assert!(last.after.is_none());
    }

    #[tokio::test]
    async fn test_zero_budget_never_replans() {
        let orchestrator = orchestrator(0);
        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service name = checkout"))
            .await
            .unwrap();

        assert_eq!(response.status, RunStatus::Degraded);
        assert_eq!(response.trace.attempts(StageName::Execute), 1);
        assert_eq!(response.trace.replans_applied(), 0);
    }

    #[tokio::test]
    async fn test_failed_fan_out_branch_yields_partial() {
        let planner = Arc::new(ScriptedGenerator::always(json!({
            "kind": "plan",
            "intent": "lookup",
            "view": "table",
            "primary": {
                "entity": "service",
                "filters": [{"field": "team", "op": "eq", "value": "payments"}]
            },
            "metric": {"metric": "latency_p99", "entity": "service"}
        })));
        let orchestrator = builder(2)
            .with_tool(config_items())
            .with_tool(Arc::new(BrokenMetrics))
            .with_planner(planner)
            .build()
            .unwrap();

        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("payments services and their latency"))
            .await
            .unwrap();

        assert_eq!(response.status, RunStatus::Partial, "{:?}", response.trace.error());
        let trace = &response.trace;
        assert_eq!(trace.attempts(StageName::Execute), 1);
        assert!(trace
            .replans()
            .iter()
            .any(|e| e.trigger_type == TriggerType::ToolErrorFatal && !e.should_replan));
        let execute = trace.last_record(StageName::Execute).unwrap();
        let results = execute.output.as_ref().unwrap()["results"].as_array().unwrap().clone();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["result"]["success"], json!(true));
        assert_eq!(results[1]["result"]["success"], json!(false));
    }

    #[tokio::test]
    async fn test_retryable_failure_narrows_and_recovers() {
        let flaky = Arc::new(FlakyTable {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = builder(2).with_tool(flaky.clone()).build().unwrap();

        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service checkout-api"))
            .await
            .unwrap();

        assert_eq!(response.status, RunStatus::Success, "{:?}", response.trace.error());
        let trace = &response.trace;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert_eq!(trace.replans().len(), 1);
        assert_eq!(trace.replans()[0].trigger_type, TriggerType::ToolErrorRetryable);
        assert_eq!(
            trace.replans()[0].after.as_ref().unwrap()["primary"]["limit"],
            json!(25)
        );
        assert_eq!(trace.tool_calls().len(), 2);
        assert_eq!(trace.attempts(StageName::Execute), 2);
    }

    #[tokio::test]
    async fn test_asset_overrides_apply_to_one_request() {
        let orchestrator = orchestrator(2);
        let question = "show service team = payments";

        let blocked = orchestrator
            .orchestrate(OrchestrateRequest::ask(question).with_overrides(json!({
                "policy": {"security": {"blocked_fields": ["team"]}}
            })))
            .await
            .unwrap();
        assert_eq!(blocked.status, RunStatus::Failed);
        assert_eq!(blocked.trace.error().unwrap().kind, "policy_violation");

        let normal = orchestrator
            .orchestrate(OrchestrateRequest::ask(question))
            .await
            .unwrap();
        assert_eq!(normal.status, RunStatus::Success, "{:?}", normal.trace.error());
        assert_eq!(orchestrator.assets().policy.security.blocked_fields.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_overrides_are_rejected_before_running() {
        let orchestrator = orchestrator(2);
        let err = orchestrator
            .orchestrate(OrchestrateRequest::ask("hello").with_overrides(json!({"widgets": {}})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(orchestrator.store().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_links_parent_trace() {
        let orchestrator = orchestrator(2);
        let first = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service name = search"))
            .await
            .unwrap();
        let parent_id = first.trace.trace_id().to_string();

        let rerun = orchestrator
            .orchestrate(OrchestrateRequest {
                rerun: Some(RerunRequest {
                    trace_id: parent_id.clone(),
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_ne!(rerun.trace.trace_id(), parent_id);
        assert_eq!(rerun.trace.parent_trace_id(), Some(parent_id.as_str()));
        assert_eq!(rerun.trace.question(), "show service name = search");
        assert_eq!(orchestrator.store().len(), 2);

        let missing = orchestrator
            .orchestrate(OrchestrateRequest {
                rerun: Some(RerunRequest {
                    trace_id: "nope".to_string(),
                }),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), "trace_not_found");
    }

    #[tokio::test]
    async fn test_stage_test_runs_plan_in_isolation() {
        let orchestrator = orchestrator(2);
        let response = orchestrator
            .stage_test(StageTestRequest {
                stage: StageName::Plan,
                test_plan: Some(json!({"question": "Show SVC name = checkout-api"})),
                asset_overrides: None,
                baseline_trace_id: None,
                mode: RunMode::Fast,
            })
            .await
            .unwrap();

        assert_eq!(response.stage, StageName::Plan);
        assert_eq!(response.result["outcome"]["kind"], json!("plan"));
        assert_eq!(
            response.result["resolved"]["canonical"],
            json!("show service name = checkout-api")
        );
        assert!(response
            .applied_assets
            .iter()
            .any(|a| a.starts_with("resolver:")));
        assert!(orchestrator.store().is_empty());
    }

    #[tokio::test]
    async fn test_stage_test_replays_execute_from_baseline() {
        let orchestrator = orchestrator(2);
        let baseline = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service name = search"))
            .await
            .unwrap();

        let response = orchestrator
            .stage_test(StageTestRequest {
                stage: StageName::Execute,
                test_plan: None,
                asset_overrides: None,
                baseline_trace_id: Some(baseline.trace.trace_id().to_string()),
                mode: RunMode::Fast,
            })
            .await
            .unwrap();

        assert_eq!(response.result["plan_revision"], json!(1));
        assert_eq!(response.result["results"].as_array().unwrap().len(), 1);
        assert!(response.triggers.is_empty());
        assert_eq!(response.tool_calls.len(), 1);

        let missing = orchestrator
            .stage_test(StageTestRequest {
                stage: StageName::Compose,
                test_plan: None,
                asset_overrides: None,
                baseline_trace_id: None,
                mode: RunMode::Fast,
            })
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_trace_records_are_ordered_and_reference_stages() {
        let orchestrator = orchestrator(2);
        let response = orchestrator
            .orchestrate(OrchestrateRequest::ask("show service name = checkout"))
            .await
            .unwrap();
        let trace = orchestrator.trace(response.trace.trace_id()).unwrap();

        assert!(trace.is_finished());
        assert_eq!(trace.status(), Some(RunStatus::Success));
        assert_eq!(trace.outcome(), Some(RunOutcome::Answered));
        for (i, record) in trace.stages().iter().enumerate() {
            assert_eq!(record.index, i);
            assert!(!record.applied_assets.is_empty() || record.stage == StageName::Present);
        }
        for (i, event) in trace.replans().iter().enumerate() {
            assert_eq!(event.index, i);
            assert!(event.stage_record < trace.stages().len());
            assert_eq!(trace.stages()[event.stage_record].stage, event.stage);
        }
        let first_stage = trace.stages().first().unwrap();
        assert_eq!(first_stage.stage, StageName::Plan);
        assert_eq!(first_stage.attempt, 1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_receives_every_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces").join("log.jsonl");
        let orchestrator = builder(2)
            .with_tool(config_items())
            .with_trace_sink(Arc::new(JsonlTraceSink::new(path.clone())))
            .build()
            .unwrap();

        orchestrator
            .orchestrate(OrchestrateRequest::ask("hello"))
            .await
            .unwrap();
        orchestrator
            .orchestrate(OrchestrateRequest::ask("show service name = search"))
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], json!("direct"));
        assert_eq!(lines[1]["status"], json!("success"));
    }
}
