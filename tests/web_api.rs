//! HTTP 入口测试（需 `web` feature）

#![cfg(feature = "web")]

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Map, Value};
    use tower::ServiceExt;

    use sonar::assets::AssetBundle;
    use sonar::config::AppConfig;
    use sonar::tools::TabularTool;
    use sonar::web::create_router;
    use sonar::OrchestratorBuilder;

    fn app() -> Router {
        let mut row = Map::new();
        row.insert("name".into(), json!("search"));
        row.insert("team".into(), json!("discovery"));
        let mut datasets = HashMap::new();
        datasets.insert("services".to_string(), vec![row]);

        let orchestrator = OrchestratorBuilder::new(AppConfig::default())
            .with_assets(AssetBundle::default())
            .without_fixtures()
            .with_tool(Arc::new(TabularTool::new("config_items", datasets)))
            .build()
            .unwrap();
        create_router(Arc::new(orchestrator))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_lists_tools() {
        let app = app();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["tools"], json!(["config_items"]));
    }

    #[tokio::test]
    async fn test_orchestrate_then_fetch_trace() {
        let app = app();
        let (status, body) = send(
            &app,
            post("/orchestrate", json!({"question": "show service name = search", "mode": "fast"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("success"));
        assert!(body["screen"]["components"].as_array().is_some());

        let trace_id = body["trace"]["trace_id"].as_str().unwrap().to_string();
        let (status, trace) = send(&app, get(&format!("/traces/{trace_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(trace["trace_id"], json!(trace_id));
        assert_eq!(trace["stages"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_run_failures_are_reported_in_body() {
        let app = app();
        let (status, body) = send(&app, post("/orchestrate", json!({"question": "  "}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("failed"));
        assert_eq!(body["trace"]["error"]["kind"], json!("validation_error"));
    }

    #[tokio::test]
    async fn test_unknown_trace_is_404() {
        let app = app();
        let (status, body) = send(&app, get("/traces/does-not-exist")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], json!("trace_not_found"));
    }

    #[tokio::test]
    async fn test_bad_overrides_are_400() {
        let app = app();
        let (status, body) = send(
            &app,
            post(
                "/orchestrate",
                json!({"question": "hello", "asset_overrides": {"nonsense": true}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], json!("validation_error"));
    }

    #[tokio::test]
    async fn test_stage_test_endpoint() {
        let app = app();
        let (status, body) = send(
            &app,
            post(
                "/stage-test",
                json!({
                    "stage": "validate",
                    "test_plan": {
                        "question": "show service",
                        "intent": "lookup",
                        "view": "table",
                        "primary": {"entity": "service", "limit": 5000}
                    }
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stage"], json!("validate"));
        assert_eq!(body["result"]["validated"]["plan"]["primary"]["limit"], json!(500));
        assert_eq!(body["triggers"][0]["trigger_type"], json!("policy_blocked"));
    }
}
