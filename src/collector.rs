//! Collector - owns the schedulers and the cache of one feature family
//!
//! The collector is the object handed to the exposition path. Reconfiguration
//! replaces everything it owns at once:
//!
//! ```text
//! update(pool) → cancel old schedulers (fire and forget)
//!              → warm new schedulers into a fresh cache
//!              → swap pool, cache, cancellation token and span under one write lock
//! ```
//!
//! Readers either see the complete old state or the complete new one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, instrument};

use crate::cache::MetricCache;
use crate::metrics::MetricSample;
use crate::scheduler::{FeatureFamily, GroupScheduler, Phase, ScheduleHandle, Scraper};
use crate::sessions::SessionPool;

/// Default period of [`reconfigure_every`]
pub const RECONFIGURE_PERIOD: Duration = Duration::from_secs(60);

struct CollectorState {
    pool: Arc<SessionPool>,
    cache: MetricCache,
    cancel: CancellationToken,
    schedules: Vec<ScheduleHandle>,
    span: Span,
}

/// Scrapes one feature family for every session group of a pool
#[derive(Clone)]
pub struct Collector {
    family: FeatureFamily,
    scraper: Arc<dyn Scraper>,
    state: Arc<RwLock<CollectorState>>,
    update_lock: Arc<Mutex<()>>,
}

impl Collector {
    /// Start one scheduler per group. Returns once every group has been
    /// scraped once.
    pub async fn new(pool: SessionPool, family: FeatureFamily, scraper: Arc<dyn Scraper>) -> Self {
        let state = start_schedulers(Arc::new(pool), family, &scraper).await;

        Self {
            family,
            scraper,
            state: Arc::new(RwLock::new(state)),
            update_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn family(&self) -> FeatureFamily {
        self.family
    }

    /// Replace the pool, the schedulers and the cache.
    #[instrument(skip_all, fields(component = self.family.name()))]
    pub async fn update(&self, pool: SessionPool) {
        let _guard = self.update_lock.lock().await;

        info!("canceling the old {} scrapers", self.family);
        self.state.read().await.cancel.cancel();
        info!("the old {} scrapers have been canceled", self.family);

        let next = start_schedulers(Arc::new(pool), self.family, &self.scraper).await;

        let mut state = self.state.write().await;
        *state = next;
    }

    /// All samples currently cached.
    pub async fn snapshot(&self) -> Vec<MetricSample> {
        let state = self.state.read().await;
        state.cache.snapshot().await
    }

    pub async fn pool(&self) -> Arc<SessionPool> {
        self.state.read().await.pool.clone()
    }

    pub async fn cache(&self) -> MetricCache {
        self.state.read().await.cache.clone()
    }

    /// Phase of every scheduler currently owned
    pub async fn phases(&self) -> Vec<Phase> {
        self.state
            .read()
            .await
            .schedules
            .iter()
            .map(ScheduleHandle::phase)
            .collect()
    }

    /// Effective interval of every scheduler currently owned
    pub async fn intervals(&self) -> Vec<Duration> {
        self.state
            .read()
            .await
            .schedules
            .iter()
            .map(ScheduleHandle::interval)
            .collect()
    }

    /// Stop every scheduler. Cached samples stay readable.
    pub async fn shutdown(&self) {
        let state = self.state.read().await;
        debug!(parent: &state.span, "shutting down");
        state.cancel.cancel();
    }
}

async fn start_schedulers(
    pool: Arc<SessionPool>,
    family: FeatureFamily,
    scraper: &Arc<dyn Scraper>,
) -> CollectorState {
    let span = info_span!("collector", component = family.name());
    let cache = MetricCache::new();
    let cancel = CancellationToken::new();

    let schedulers: Vec<_> = pool
        .groups()
        .iter()
        .filter(|group| {
            let enabled = !group.enabled_instances(family).is_empty();
            if !enabled {
                debug!(
                    "session {} has no instances with {family} metrics enabled",
                    group.session().id()
                );
            }
            enabled
        })
        .map(|group| {
            GroupScheduler::new(
                group.clone(),
                family,
                scraper.clone(),
                cache.clone(),
                cancel.child_token(),
            )
        })
        .collect();

    let schedules = join_all(schedulers.into_iter().map(GroupScheduler::start))
        .instrument(span.clone())
        .await;

    CollectorState {
        pool,
        cache,
        cancel,
        schedules,
        span,
    }
}

/// Rebuild the session pool every `period` and hand it to every collector.
///
/// Returns `Ok` once `cancel` fires. A failed rebuild ends the loop with the
/// error; the caller is expected to terminate.
pub async fn reconfigure_every<F, Fut>(
    period: Duration,
    cancel: CancellationToken,
    collectors: Vec<Collector>,
    mut rebuild: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<SessionPool>>,
{
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("reconfiguration loop cancelled");
                return Ok(());
            }

            _ = ticker.tick() => {}
        }

        info!("periodic reinitialization of sessions and configuration");
        let pool = rebuild().await.context("failed to rebuild sessions")?;

        for collector in &collectors {
            collector.update(pool.clone()).await;
        }
    }
}
