use crate::lock;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BUFFER_MULTIPLIER: f64 = 1.1;

#[derive(Debug, Clone, Copy)]
pub struct GasCacheConfig {
    pub ttl: Duration,
    pub buffer_multiplier: f64,
}

impl Default for GasCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            buffer_multiplier: DEFAULT_BUFFER_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyOptions {
    pub tax_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct GasCacheEntry {
    pub gas_limit: u64,
    pub inserted_at: Instant,
    pub hit_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasCacheStats {
    pub size: usize,
    pub entries: Vec<GasCacheEntryStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasCacheEntryStats {
    pub key: String,
    pub hits: u64,
    pub age: Duration,
}

/// Buffered gas estimates keyed by call shape.
///
/// Two calls to the same system method with arguments of the same shape are
/// assumed to cost about the same, so the live estimate of the first is reused
/// (with headroom) for the rest until the TTL runs out.
#[derive(Debug)]
pub struct GasEstimationCache {
    entries: Mutex<HashMap<String, GasCacheEntry>>,
    ttl: Duration,
    buffer_percent: u128,
}

impl Default for GasEstimationCache {
    fn default() -> Self {
        Self::new(GasCacheConfig::default())
    }
}

impl GasEstimationCache {
    pub fn new(config: GasCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: config.ttl,
            buffer_percent: (config.buffer_multiplier * 100.0).floor().max(0.0) as u128,
        }
    }

    pub fn generate_key(
        &self,
        system: &str,
        method: &str,
        args: &[Value],
        options: KeyOptions,
    ) -> String {
        let shape = args.iter().map(normalize_arg).collect::<Vec<_>>().join(",");
        let tax = if options.tax_enabled { ":tax" } else { "" };
        format!("{system}:{method}:{shape}{tax}")
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            entries.remove(key);
            debug!(key, "gas cache entry expired");
            return None;
        }
        entry.hit_count += 1;
        debug!(key, gas_limit = entry.gas_limit, hits = entry.hit_count, "gas cache hit");
        Some(entry.gas_limit)
    }

    /// Stores the buffered estimate and returns it.
    pub fn set(&self, key: &str, estimate: u64) -> u64 {
        let buffered = self.buffer(estimate);
        lock(&self.entries).insert(
            key.to_string(),
            GasCacheEntry {
                gas_limit: buffered,
                inserted_at: Instant::now(),
                hit_count: 0,
            },
        );
        debug!(key, estimate, buffered, "gas estimate cached");
        buffered
    }

    pub fn delete(&self, key: &str) -> bool {
        lock(&self.entries).remove(key).is_some()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> GasCacheStats {
        let entries = lock(&self.entries);
        let mut stats = entries
            .iter()
            .map(|(key, entry)| GasCacheEntryStats {
                key: key.clone(),
                hits: entry.hit_count,
                age: entry.inserted_at.elapsed(),
            })
            .collect::<Vec<_>>();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        GasCacheStats {
            size: entries.len(),
            entries: stats,
        }
    }

    fn buffer(&self, estimate: u64) -> u64 {
        let buffered = u128::from(estimate) * self.buffer_percent / 100;
        u64::try_from(buffered).unwrap_or(u64::MAX)
    }
}

fn normalize_arg(arg: &Value) -> String {
    match arg {
        Value::Array(items) => format!("array:{}", items.len()),
        Value::Number(_) => "bigint".to_string(),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            "bigint".to_string()
        }
        Value::String(_) => "string".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Null | Value::Object(_) => "object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use serde_json::json;

    #[test]
    fn generate_key__normalizes_argument_shapes() {
        // given
        let cache = GasEstimationCache::default();
        let args = [
            json!(12),
            json!("340282366920938463463374607431768211455"),
            json!("kami"),
            json!([1, 2, 3]),
            json!(true),
            json!({ "a": 1 }),
        ];

        // when
        let key = cache.generate_key("system.harvest", "executeTyped", &args, KeyOptions::default());

        // then
        assert_eq!(
            key,
            "system.harvest:executeTyped:bigint,bigint,string,array:3,boolean,object"
        );
    }

    #[test]
    fn generate_key__same_shape_shares_key_and_tax_is_distinct() {
        let cache = GasEstimationCache::default();
        let a = cache.generate_key("s", "m", &[json!(1), json!("7")], KeyOptions::default());
        let b = cache.generate_key("s", "m", &[json!(99), json!(3)], KeyOptions::default());
        let taxed = cache.generate_key("s", "m", &[json!(1), json!(2)], KeyOptions { tax_enabled: true });

        assert_eq!(a, b);
        assert_eq!(taxed, "s:m:bigint,bigint:tax");
    }

    #[test]
    fn set__stores_buffered_estimate() {
        // given
        let cache = GasEstimationCache::default();

        // when
        let stored = cache.set("k", 100_000);

        // then
        assert_eq!(stored, 110_000);
        assert_eq!(cache.get("k"), Some(110_000));
    }

    #[test]
    fn set__floors_multiplier_to_whole_percent() {
        let cache = GasEstimationCache::new(GasCacheConfig {
            buffer_multiplier: 1.257,
            ..GasCacheConfig::default()
        });
        assert_eq!(cache.set("k", 1_000), 1_250);
    }

    #[tokio::test(start_paused = true)]
    async fn get__evicts_entry_older_than_ttl() {
        // given
        let cache = GasEstimationCache::new(GasCacheConfig {
            ttl: Duration::from_secs(10),
            ..GasCacheConfig::default()
        });
        cache.set("k", 1_000);

        // when
        tokio::time::advance(Duration::from_secs(5)).await;
        let fresh = cache.get("k");
        tokio::time::advance(Duration::from_secs(6)).await;
        let stale = cache.get("k");

        // then
        assert_eq!(fresh, Some(1_100));
        assert_eq!(stale, None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stats__reports_hits_and_age() {
        // given
        let cache = GasEstimationCache::default();
        cache.set("b", 1);
        cache.set("a", 1);
        cache.get("a");
        cache.get("a");

        // when
        tokio::time::advance(Duration::from_secs(3)).await;
        let stats = cache.stats();

        // then
        assert_eq!(stats.size, 2);
        assert_eq!(stats.entries[0].key, "a");
        assert_eq!(stats.entries[0].hits, 2);
        assert_eq!(stats.entries[0].age, Duration::from_secs(3));
        assert_eq!(stats.entries[1].hits, 0);
    }

    #[test]
    fn delete_and_clear__drop_entries() {
        let cache = GasEstimationCache::default();
        cache.set("a", 1);
        cache.set("b", 1);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();

        assert_eq!(cache.get("b"), None);
    }
}
