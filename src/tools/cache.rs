//! 工具结果缓存（TTL + LRU）
//!
//! 键由 tool_type、operation 与规范化后的参数组成：去掉易变字段（request_id、trace_id 等），
//! keywords 类列表小写、排序、去重，filters 按稳定序列化排序，对象键一律排序。
//! 过期条目在访问时惰性淘汰；容量满时淘汰最久未使用的条目。

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::result::ResultSet;

/// 不参与缓存键的字段
const VOLATILE_FIELDS: &[&str] = &["request_id", "trace_id", "call_id", "timestamp", "requested_at"];

/// 顺序无关、大小写无关的列表字段
const SET_FIELDS: &[&str] = &["keywords", "event_types", "relations"];

struct CacheEntry {
    value: ResultSet,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

pub struct ToolResultCache {
    state: Mutex<CacheState>,
    capacity: usize,
    default_ttl: Duration,
}

impl ToolResultCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        let capacity = max_size.max(1);
        let cap = std::num::NonZeroUsize::new(capacity).unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            capacity,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// 命中返回结果副本并将条目移到最近使用；过期则淘汰并视为未命中
    pub async fn get(&self, key: &str) -> Option<ResultSet> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired = match state.entries.peek(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            state.entries.pop(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }
        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.hit_count += 1;
        tracing::debug!(
            key,
            hit_count = entry.hit_count,
            age_ms = now.duration_since(entry.created_at).as_millis() as u64,
            "cache hit"
        );
        Some(entry.value.clone())
    }

    /// 写入；ttl 为 None 时使用默认 TTL
    pub async fn set(&self, key: &str, value: ResultSet, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
        };
        let mut state = self.state.lock().await;
        if let Some((evicted, _)) = state.entries.push(key.to_string(), entry) {
            if evicted != key {
                state.evictions += 1;
                tracing::debug!(key = %evicted, "cache evicted");
            }
        }
    }

    /// 是否存在未过期条目（不影响 LRU 顺序与统计）
    pub async fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().await;
        state
            .entries
            .peek(key)
            .map(|e| !e.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.state.lock().await.entries.pop(key).is_some()
    }

    /// 删除键中包含 pattern 子串的所有条目，返回删除数量
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(k, _)| k.contains(pattern))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            state.entries.pop(key);
        }
        keys.len()
    }

    pub async fn clear(&self) {
        self.state.lock().await.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }

    /// 生成缓存键：`{tool_type}:{operation}:{规范化参数 JSON}`
    pub fn generate_key(tool_type: &str, operation: &str, params: &Value) -> String {
        let normalized = normalize(params);
        format!(
            "{}:{}:{}",
            tool_type.trim().to_lowercase(),
            operation.trim().to_lowercase(),
            canonical_string(&normalized)
        )
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                if VOLATILE_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                let normalized = if SET_FIELDS.contains(&key.as_str()) {
                    normalize_set(v)
                } else if key == "filters" {
                    normalize_filters(v)
                } else {
                    normalize(v)
                };
                out.insert(key.clone(), normalized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

fn normalize_set(value: &Value) -> Value {
    let Value::Array(items) = value else {
        return normalize(value);
    };
    let mut strings: Vec<String> = Vec::with_capacity(items.len());
    let mut others: Vec<Value> = Vec::new();
    for item in items {
        match item {
            Value::String(s) => strings.push(s.trim().to_lowercase()),
            other => others.push(normalize(other)),
        }
    }
    strings.sort();
    strings.dedup();
    let mut out: Vec<Value> = strings.into_iter().map(Value::String).collect();
    out.extend(others);
    Value::Array(out)
}

fn normalize_filters(value: &Value) -> Value {
    let Value::Array(items) = value else {
        return normalize(value);
    };
    let mut keyed: Vec<(String, Value)> = items
        .iter()
        .map(|item| {
            let normalized = normalize(item);
            (canonical_string(&normalized), normalized)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Value::Array(keyed.into_iter().map(|(_, v)| v).collect())
}

/// 对象键排序后的紧凑 JSON，与 serde_json 的 map 实现无关
fn canonical_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let body: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_string(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_string).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> ResultSet {
        let rows = (0..n)
            .map(|i| {
                let mut row = serde_json::Map::new();
                row.insert("i".into(), json!(i));
                row
            })
            .collect();
        ResultSet::new(vec!["i".into()], rows)
    }

    #[test]
    fn test_key_stability_keywords_and_filters() {
        let a = ToolResultCache::generate_key(
            "config_items",
            "query_rows",
            &json!({"keywords": ["B", "a"], "filters": [{"f": 1}]}),
        );
        let b = ToolResultCache::generate_key(
            "config_items",
            "query_rows",
            &json!({"keywords": ["a", "B"], "filters": [{"f": 1}]}),
        );
        assert_eq!(a, b);
        assert!(a.starts_with("config_items:query_rows:"));
    }

    #[test]
    fn test_key_ignores_volatile_fields_and_filter_order() {
        let a = ToolResultCache::generate_key(
            "t",
            "op",
            &json!({
                "request_id": "r-1",
                "filters": [{"field": "team", "op": "eq", "value": "x"}, {"field": "name", "op": "eq", "value": "y"}]
            }),
        );
        let b = ToolResultCache::generate_key(
            "t",
            "op",
            &json!({
                "filters": [{"value": "y", "op": "eq", "field": "name"}, {"field": "team", "op": "eq", "value": "x"}],
                "trace_id": "tr-9"
            }),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_differs_on_field_order_and_values() {
        let a = ToolResultCache::generate_key("t", "op", &json!({"fields": ["a", "b"]}));
        let b = ToolResultCache::generate_key("t", "op", &json!({"fields": ["b", "a"]}));
        assert_ne!(a, b);
        let c = ToolResultCache::generate_key("t", "op", &json!({"limit": 10}));
        let d = ToolResultCache::generate_key("t", "op", &json!({"limit": 20}));
        assert_ne!(c, d);
    }

    #[tokio::test]
    async fn test_set_get_within_ttl() {
        let cache = ToolResultCache::new(8, Duration::from_secs(60));
        cache.set("k", rows(2), None).await;
        assert_eq!(cache.get("k").await, Some(rows(2)));
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let cache = ToolResultCache::new(8, Duration::from_secs(60));
        cache.set("k", rows(1), Some(Duration::from_millis(20))).await;
        assert!(cache.contains("k").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.contains("k").await);
        assert_eq!(cache.get("k").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_access() {
        let cache = ToolResultCache::new(2, Duration::from_secs(60));
        cache.set("a", rows(1), None).await;
        cache.set("b", rows(1), None).await;
        // 访问 a，使 b 成为最久未使用
        assert!(cache.get("a").await.is_some());
        cache.set("c", rows(1), None).await;
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_substring() {
        let cache = ToolResultCache::new(8, Duration::from_secs(60));
        cache.set("metric_store:query_metric:{}", rows(1), None).await;
        cache.set("metric_rollup:query_metric:{}", rows(1), None).await;
        cache.set("config_items:query_rows:{}", rows(1), None).await;
        assert_eq!(cache.invalidate_pattern("query_metric").await, 2);
        assert_eq!(cache.len().await, 1);
        assert!(cache.invalidate("config_items:query_rows:{}").await);
        cache.set("x", rows(1), None).await;
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }
}
