// Copyright 2025 Evalflow Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Caller-owned cache of metric outputs, shared across runs
//!
//! Entries are only reused when the producer would see identical inputs.

use crate::metric::{MeasureContext, MetricDefinition, MetricOutput};
use crate::target::Target;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache for metric outputs keyed by [`CacheKey`]
pub struct MetricResultCache {
    cache: Cache<CacheKey, MetricOutput>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl MetricResultCache {
    /// Create a new cache with specified TTL in seconds
    pub fn new(ttl_secs: u64) -> Self {
        Self::with_capacity(ttl_secs, 10_000)
    }

    pub fn with_capacity(ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<MetricOutput> {
        match self.cache.get(key).await {
            Some(output) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(output)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: CacheKey, output: MetricOutput) {
        self.cache.insert(key, output).await;
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.cache.entry_count(),
        }
    }
}

impl std::fmt::Debug for MetricResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricResultCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Metric name plus a blake3 digest of everything its producer can see
///
/// The digest covers the metric definition, the target, the enclosing
/// container, the target id and the run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    metric: String,
    digest: String,
}

impl CacheKey {
    pub fn new(metric: &MetricDefinition, target: &Target<'_>, ctx: &MeasureContext<'_>) -> Self {
        let metadata: BTreeMap<&String, &serde_json::Value> = ctx.metadata.iter().collect();
        // serde_json::Value maps are ordered, so the encoding is stable
        let canonical = serde_json::json!({
            "metric": metric.fingerprint(),
            "target": target.fingerprint(),
            "container": ctx.container,
            "target_id": ctx.target_id,
            "metadata": metadata,
        })
        .to_string();
        let digest = blake3::hash(canonical.as_bytes());

        Self {
            metric: metric.name.clone(),
            digest: hex::encode(digest.as_bytes()),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
}
