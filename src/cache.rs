//! Concurrency-safe cache of the latest samples per instance
//!
//! Writers merge per instance: a publish replaces the stored samples only for
//! the instances present in the batch. Instances missing from a batch keep
//! serving their last known samples; stale values are preferred over gaps.
//! An instance removed from configuration is only purged by rebuilding the
//! cache (collector replacement) or by an explicit [`MetricCache::evict`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::trace;

use crate::metrics::{InstanceId, MetricSample, ScrapeBatch};

#[derive(Debug, Clone, Default)]
pub struct MetricCache {
    entries: Arc<RwLock<HashMap<InstanceId, Vec<MetricSample>>>>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a scrape batch into the cache.
    pub async fn publish(&self, batch: ScrapeBatch) {
        let mut entries = self.entries.write().await;
        for (id, samples) in batch {
            trace!("publishing {} samples for {id}", samples.len());
            entries.insert(id, samples);
        }
    }

    /// Every stored sample across every known instance.
    pub async fn snapshot(&self) -> Vec<MetricSample> {
        let entries = self.entries.read().await;
        entries.values().flatten().cloned().collect()
    }

    /// Samples currently stored for one instance
    pub async fn get(&self, id: &InstanceId) -> Option<Vec<MetricSample>> {
        self.entries.read().await.get(id).cloned()
    }

    /// Drop one instance's samples. Never called implicitly.
    pub async fn evict(&self, id: &InstanceId) -> Option<Vec<MetricSample>> {
        self.entries.write().await.remove(id)
    }

    /// Number of instances with stored samples
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
