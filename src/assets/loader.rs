//! 资产加载与按请求覆盖
//!
//! 资产目录下每种资产一个 TOML 文件（schema.toml、policy.toml ...），缺失的文件使用内置默认。
//! 请求中的 asset_overrides 以 JSON 深度合并到资产包上，只对该次请求生效。

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::types::{AssetBundle, AssetKind};
use crate::core::OrchestrationError;

/// 从目录加载资产包
pub fn load_assets(dir: &Path) -> Result<AssetBundle, OrchestrationError> {
    if !dir.is_dir() {
        return Err(OrchestrationError::Asset(format!(
            "asset directory not found: {}",
            dir.display()
        )));
    }

    let mut bundle = AssetBundle::default();
    for kind in AssetKind::ALL {
        let path = dir.join(format!("{}.toml", kind.as_str()));
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| OrchestrationError::Asset(format!("{}: {e}", path.display())))?;
        match kind {
            AssetKind::Schema => bundle.schema = parse(&path, &text)?,
            AssetKind::Resolver => bundle.resolver = parse(&path, &text)?,
            AssetKind::Query => bundle.query = parse(&path, &text)?,
            AssetKind::Policy => bundle.policy = parse(&path, &text)?,
            AssetKind::Prompt => bundle.prompt = parse(&path, &text)?,
            AssetKind::Mapping => bundle.mapping = parse(&path, &text)?,
            AssetKind::Screen => bundle.screen = parse(&path, &text)?,
        }
        tracing::debug!(asset = kind.as_str(), path = %path.display(), "asset loaded");
    }
    Ok(bundle)
}

fn parse<T: DeserializeOwned>(path: &Path, text: &str) -> Result<T, OrchestrationError> {
    toml::from_str(text).map_err(|e| OrchestrationError::Asset(format!("{}: {e}", path.display())))
}

/// 将 overrides 深度合并到资产包上，返回新的资产包
///
/// overrides 顶层键为资产种类（schema / policy / ...），对象递归合并，其余值整体替换。
pub fn apply_overrides(
    bundle: &AssetBundle,
    overrides: &Value,
) -> Result<AssetBundle, OrchestrationError> {
    let Value::Object(map) = overrides else {
        return Err(OrchestrationError::Validation(
            "asset_overrides must be an object".to_string(),
        ));
    };
    for key in map.keys() {
        if !AssetKind::ALL.iter().any(|k| k.as_str() == key) {
            return Err(OrchestrationError::Validation(format!(
                "unknown asset kind in asset_overrides: {key}"
            )));
        }
    }

    let mut base = serde_json::to_value(bundle)?;
    deep_merge(&mut base, overrides);
    serde_json::from_value(base)
        .map_err(|e| OrchestrationError::Validation(format!("invalid asset_overrides: {e}")))
}

fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_assets_partial_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("policy.toml"),
            r#"
id = "strict"
version = "3"

[budget]
max_rows = 10

[security]
blocked_fields = ["owner_email"]
"#,
        )
        .unwrap();

        let bundle = load_assets(dir.path()).unwrap();
        assert_eq!(bundle.policy.budget.max_rows, 10);
        assert_eq!(bundle.policy.budget.max_steps, 6);
        assert_eq!(bundle.asset_ref(AssetKind::Policy), "policy:strict@3");
        assert_eq!(bundle.schema, AssetBundle::default().schema);
    }

    #[test]
    fn test_load_assets_missing_directory() {
        let err = load_assets(Path::new("/nonexistent/sonar-assets")).unwrap_err();
        assert_eq!(err.kind(), "asset_error");
    }

    #[test]
    fn test_overrides_deep_merge() {
        let bundle = AssetBundle::default();
        let merged = apply_overrides(
            &bundle,
            &json!({"policy": {"security": {"blocked_fields": ["team"]}, "version": "2"}}),
        )
        .unwrap();
        assert_eq!(merged.policy.security.blocked_fields, vec!["team".to_string()]);
        assert_eq!(merged.policy.budget, bundle.policy.budget);
        assert_eq!(merged.asset_ref(AssetKind::Policy), "policy:default@2");
        // 原资产包不变
        assert_eq!(bundle.policy.version, "1");
    }

    #[test]
    fn test_overrides_reject_unknown_kind() {
        let err = apply_overrides(&AssetBundle::default(), &json!({"widgets": {}})).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
