//! 工具层：注册表、执行器、结果缓存、执行追踪、选择器与参考数据后端

pub mod cache;
pub mod dataset;
pub mod executor;
pub mod http;
pub mod registry;
pub mod result;
pub mod selector;
pub mod tracer;

pub use cache::{CacheStats, ToolResultCache};
pub use dataset::{
    load_fixture_tools, ChangeEvent, Edge, GraphTool, HistoryTool, MetricPoint, MetricTool,
    TabularTool,
};
pub use executor::ToolExecutor;
pub use http::HttpSourceTool;
pub use registry::{Tool, ToolRegistry};
pub use result::{ResultSet, ResultSource, ToolCall, ToolContext, ToolResult};
pub use selector::{ScoredTool, SelectionContext, ToolProfile, ToolSelector};
pub use tracer::{ExecutionTracer, ToolExecutionRecord, ToolOutcome};
