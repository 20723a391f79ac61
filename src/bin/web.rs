//! Sonar HTTP 服务
//!
//! 启动: cargo run --bin sonar-web --features web
//! 监听地址取自配置 `[web] bind`（环境变量 SONAR__WEB__BIND 可覆盖）

use std::sync::Arc;

use anyhow::Context;
use sonar::config::load_config;
use sonar::web::create_router;
use sonar::OrchestratorBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sonar::observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    let bind = cfg.web.bind.clone();

    let orchestrator = OrchestratorBuilder::new(cfg)
        .build()
        .context("Failed to build orchestrator")?;
    let app = create_router(Arc::new(orchestrator));

    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    tracing::info!("Sonar server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
