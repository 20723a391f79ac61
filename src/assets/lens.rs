//! 资产访问记录
//!
//! 阶段通过 AssetLens 读取资产，每种资产第一次被读取时记下 `kind:id@version`，
//! 写入该次阶段尝试的 StageRecord.applied_assets。

use std::sync::Mutex;

use super::types::{
    AssetBundle, AssetKind, MappingAsset, PolicyAsset, PromptAsset, QueryAsset, ResolverAsset,
    SchemaCatalog, ScreenAsset,
};

pub struct AssetLens<'a> {
    bundle: &'a AssetBundle,
    applied: Mutex<Vec<String>>,
}

impl<'a> AssetLens<'a> {
    pub fn new(bundle: &'a AssetBundle) -> Self {
        Self {
            bundle,
            applied: Mutex::new(Vec::new()),
        }
    }

    fn touch(&self, kind: AssetKind) {
        let reference = self.bundle.asset_ref(kind);
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        if !applied.contains(&reference) {
            applied.push(reference);
        }
    }

    pub fn schema(&self) -> &'a SchemaCatalog {
        self.touch(AssetKind::Schema);
        &self.bundle.schema
    }

    pub fn resolver(&self) -> &'a ResolverAsset {
        self.touch(AssetKind::Resolver);
        &self.bundle.resolver
    }

    pub fn query(&self) -> &'a QueryAsset {
        self.touch(AssetKind::Query);
        &self.bundle.query
    }

    pub fn policy(&self) -> &'a PolicyAsset {
        self.touch(AssetKind::Policy);
        &self.bundle.policy
    }

    pub fn prompt(&self) -> &'a PromptAsset {
        self.touch(AssetKind::Prompt);
        &self.bundle.prompt
    }

    pub fn mapping(&self) -> &'a MappingAsset {
        self.touch(AssetKind::Mapping);
        &self.bundle.mapping
    }

    pub fn screen(&self) -> &'a ScreenAsset {
        self.touch(AssetKind::Screen);
        &self.bundle.screen
    }

    /// 不记录访问的原始资产包（runner 内部使用）
    pub fn bundle(&self) -> &'a AssetBundle {
        self.bundle
    }

    /// 取出已记录的资产引用（按首次访问顺序）
    pub fn take_applied(&self) -> Vec<String> {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *applied)
    }
}
