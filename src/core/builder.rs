//! Orchestrator 构建器：统一的初始化逻辑
//!
//! CLI、Web 服务与测试共用同一套装配：配置 → 工具注册表、缓存、追踪、执行器、选择器、生成器、Trace 存储。
//! 所有组件都是显式实例，不使用全局状态。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::assets::{load_assets, AssetBundle};
use crate::config::AppConfig;
use crate::core::OrchestrationError;
use crate::llm::{create_generator_from_config, StructuredGenerator};
use crate::orchestrator::{OrchestrationRunner, Orchestrator};
use crate::stages::{ComposeStage, ExecuteStage, PlanStage, PlannerBackend};
use crate::tools::{
    load_fixture_tools, ExecutionTracer, HttpSourceTool, Tool, ToolExecutor, ToolRegistry,
    ToolResultCache, ToolSelector,
};
use crate::trace::{InMemoryTraceStore, JsonlTraceSink, TraceSink};

/// 在常见位置查找目录（当前目录与上级目录）
fn find_dir(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_dir())
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    assets: Option<AssetBundle>,
    assets_dir: Option<PathBuf>,
    tools: Vec<Arc<dyn Tool>>,
    load_fixtures: bool,
    planner: Option<Arc<dyn StructuredGenerator>>,
    summarizer: Option<Arc<dyn StructuredGenerator>>,
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            assets: None,
            assets_dir: None,
            tools: Vec::new(),
            load_fixtures: true,
            planner: None,
            summarizer: None,
            sinks: Vec::new(),
        }
    }

    /// 直接使用给定资产包（优先于资产目录）
    pub fn with_assets(mut self, assets: AssetBundle) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_assets_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.assets_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// 额外注册一个工具
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// 不加载 fixtures 目录中的参考数据
    pub fn without_fixtures(mut self) -> Self {
        self.load_fixtures = false;
        self
    }

    /// 规划与摘要共用一个生成器
    pub fn with_generator(mut self, generator: Arc<dyn StructuredGenerator>) -> Self {
        self.planner = Some(generator.clone());
        self.summarizer = Some(generator);
        self
    }

    pub fn with_planner(mut self, generator: Arc<dyn StructuredGenerator>) -> Self {
        self.planner = Some(generator);
        self
    }

    pub fn with_summarizer(mut self, generator: Arc<dyn StructuredGenerator>) -> Self {
        self.summarizer = Some(generator);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn build_assets(&mut self) -> Result<AssetBundle, OrchestrationError> {
        if let Some(assets) = self.assets.take() {
            return Ok(assets);
        }
        let dir = self
            .assets_dir
            .clone()
            .or_else(|| self.config.app.assets_dir.clone())
            .or_else(|| find_dir(&["demo/assets", "../demo/assets"]));
        match dir {
            Some(dir) => {
                let bundle = load_assets(&dir)?;
                tracing::info!(dir = %dir.display(), "assets loaded");
                Ok(bundle)
            }
            None => {
                tracing::warn!("no asset directory found, using built-in assets");
                Ok(AssetBundle::default())
            }
        }
    }

    /// 构建工具注册表：fixtures 数据集、配置中的 HTTP 数据源、显式注册的工具
    pub fn build_tool_registry(&mut self) -> Result<ToolRegistry, OrchestrationError> {
        let mut registry = ToolRegistry::new();
        let tool_timeout = Duration::from_millis(self.config.tools.tool_timeout_ms);

        if self.load_fixtures {
            let dir = self
                .config
                .app
                .fixtures_dir
                .clone()
                .or_else(|| find_dir(&["demo/fixtures", "../demo/fixtures"]));
            if let Some(dir) = dir {
                for tool in load_fixture_tools(&dir)? {
                    registry.register(tool);
                }
            }
        }
        for entry in &self.config.tools.http {
            registry.register(Arc::new(HttpSourceTool::from_entry(entry, tool_timeout)?));
        }
        for tool in self.tools.drain(..) {
            registry.register(tool);
        }

        tracing::info!(tools = ?registry.tool_types(), "tool registry built");
        Ok(registry)
    }

    pub fn build(mut self) -> Result<Orchestrator, OrchestrationError> {
        let assets = self.build_assets()?;
        let registry = self.build_tool_registry()?;
        let cfg = &self.config;

        let cache = Arc::new(ToolResultCache::new(
            cfg.cache.max_size,
            Duration::from_secs(cfg.cache.default_ttl_secs),
        ));
        let tracer = Arc::new(ExecutionTracer::new(cfg.tracer.capacity));
        let ttl_overrides = cfg
            .cache
            .ttl_overrides
            .iter()
            .map(|(tool, secs)| (tool.clone(), Duration::from_secs(*secs)))
            .collect();
        let executor = ToolExecutor::new(
            registry,
            cache,
            tracer,
            Duration::from_millis(cfg.tools.tool_timeout_ms),
        )
        .with_ttl_overrides(ttl_overrides)
        .with_max_in_flight(cfg.tools.max_in_flight);
        let selector = ToolSelector::from_config(&cfg.selector);

        let configured = create_generator_from_config(cfg);
        let planner = self.planner.clone().or_else(|| configured.clone());
        let summarizer = self.summarizer.clone().or(configured);
        let generation_timeout = Duration::from_secs(cfg.llm.request_timeout_secs);

        let plan_stage = PlanStage::new(match planner {
            Some(generator) => PlannerBackend::Llm(generator),
            None => PlannerBackend::Rules,
        })
        .with_generation_timeout(generation_timeout);
        let runner = OrchestrationRunner::new(
            plan_stage,
            ExecuteStage::new(Arc::new(executor), Arc::new(selector)),
            ComposeStage::new(summarizer).with_summary_timeout(generation_timeout),
        )
        .with_max_replans(cfg.orchestrator.max_replans)
        .with_request_timeout(Duration::from_millis(cfg.orchestrator.request_timeout_ms));

        let store = Arc::new(InMemoryTraceStore::new(cfg.orchestrator.trace_retention));
        let mut orchestrator = Orchestrator::new(runner, assets, store);
        if let Some(path) = &cfg.app.trace_log {
            tracing::info!(path = %path.display(), "trace log enabled");
            orchestrator = orchestrator.with_sink(Arc::new(JsonlTraceSink::new(path.clone())));
        }
        for sink in self.sinks.drain(..) {
            orchestrator = orchestrator.with_sink(sink);
        }
        Ok(orchestrator)
    }
}
