//! 资产层：版本化的 schema / resolver / query / policy / prompt / mapping / screen 配置

pub mod lens;
pub mod loader;
pub mod resolver;
pub mod types;

pub use lens::AssetLens;
pub use loader::{apply_overrides, load_assets};
pub use resolver::{ResolvedQuestion, Resolver};
pub use types::{
    AliasRule, AssetBundle, AssetKind, BackendOperations, BudgetPolicy, EntityDef, FieldDef,
    MappingAsset, MappingRule, PatternRule, PolicyAsset, PromptAsset, QueryAsset, ResolverAsset,
    SchemaCatalog, ScreenAsset, SecurityPolicy, Transform,
};
