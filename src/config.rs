//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SONAR__*` 覆盖（双下划线表示嵌套，如 `SONAR__ORCHESTRATOR__MAX_REPLANS=3`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub tools: ToolsSection,
    pub cache: CacheSection,
    pub tracer: TracerSection,
    pub selector: SelectorSection,
    pub llm: LlmSection,
    pub web: WebSection,
}

/// [app] 段：资产目录、演示数据目录、Trace 落盘文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 资产目录（schema.toml / policy.toml / ...），未设置时使用内置默认资产
    pub assets_dir: Option<PathBuf>,
    /// 内存数据集目录（tabular / metric / graph / history 的 JSON fixture）
    pub fixtures_dir: Option<PathBuf>,
    /// Trace 以 JSON Lines 追加写入的文件；未设置时仅保存在内存
    pub trace_log: Option<PathBuf>,
}

/// [orchestrator] 段：重规划预算与请求级超时
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// 整个请求的截止时间（毫秒）
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 内存 Trace 仓库保留的最大条数
    #[serde(default = "default_trace_retention")]
    pub trace_retention: usize,
}

fn default_max_replans() -> u32 {
    2
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_trace_retention() -> usize {
    1_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            request_timeout_ms: default_request_timeout_ms(),
            trace_retention: default_trace_retention(),
        }
    }
}

/// [tools] 段：单次调用超时、单工具并发上限（用于计算负载）、HTTP 数据源
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（毫秒）
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// 单个工具允许的在途调用数；负载 = 在途数 / 该值
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub http: Vec<HttpToolEntry>,
}

fn default_tool_timeout_ms() -> u64 {
    10_000
}

fn default_max_in_flight() -> usize {
    8
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_ms: default_tool_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            http: Vec::new(),
        }
    }
}

/// [[tools.http]]：以 HTTP 方式接入的外部数据源
#[derive(Debug, Clone, Deserialize)]
pub struct HttpToolEntry {
    pub tool_type: String,
    /// tabular / metric / graph / history
    pub backend: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 该工具的缓存 TTL 覆盖（秒）
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// [cache] 段：容量、默认 TTL 与按工具覆盖的 TTL
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// tool_type -> TTL（秒），优先级高于工具自身声明
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,
}

fn default_cache_max_size() -> usize {
    512
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            default_ttl_secs: default_cache_ttl_secs(),
            ttl_overrides: HashMap::new(),
        }
    }
}

/// [tracer] 段：执行记录保留条数
#[derive(Debug, Clone, Deserialize)]
pub struct TracerSection {
    #[serde(default = "default_tracer_capacity")]
    pub capacity: usize,
}

fn default_tracer_capacity() -> usize {
    10_000
}

impl Default for TracerSection {
    fn default() -> Self {
        Self {
            capacity: default_tracer_capacity(),
        }
    }
}

/// [selector] 段：打分权重、工具画像与 intent -> 工具集合表
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SelectorSection {
    #[serde(default)]
    pub weights: SelectorWeights,
    /// 按声明顺序排列，平分时保持该顺序
    #[serde(default)]
    pub tools: Vec<ToolProfileEntry>,
    /// intent（lookup / aggregate / trend / relationship / history / compare）-> tool_type 列表
    #[serde(default)]
    pub intents: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorWeights {
    #[serde(default = "default_w_accuracy")]
    pub accuracy: f64,
    #[serde(default = "default_w_speed")]
    pub speed: f64,
    #[serde(default = "default_w_cache")]
    pub cache: f64,
    #[serde(default = "default_w_load")]
    pub load: f64,
    #[serde(default = "default_w_intent")]
    pub intent: f64,
}

fn default_w_accuracy() -> f64 {
    0.3
}

fn default_w_speed() -> f64 {
    0.25
}

fn default_w_cache() -> f64 {
    0.15
}

fn default_w_load() -> f64 {
    0.2
}

fn default_w_intent() -> f64 {
    0.1
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            accuracy: default_w_accuracy(),
            speed: default_w_speed(),
            cache: default_w_cache(),
            load: default_w_load(),
            intent: default_w_intent(),
        }
    }
}

/// [[selector.tools]]：静态工具画像
#[derive(Debug, Clone, Deserialize)]
pub struct ToolProfileEntry {
    pub tool_type: String,
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
    /// 无历史耗时时使用的预估（毫秒）
    #[serde(default = "default_estimated_time_ms")]
    pub estimated_time_ms: u64,
    /// 与之对齐的 intent，命中时获得 intent_alignment_bonus
    #[serde(default)]
    pub intents: Vec<String>,
}

fn default_accuracy() -> f64 {
    0.8
}

fn default_estimated_time_ms() -> u64 {
    500
}

/// [llm] 段：规划/组合后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// rules（确定性规则规划）/ openai（OpenAI 兼容端点）
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次生成超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "rules".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// [web] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 SONAR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SONAR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SONAR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
