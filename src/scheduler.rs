//! Per-group scrape scheduler
//!
//! Each session group gets one scheduler per feature family. A scheduler goes
//! through `Idle → Warming → Running → Cancelled`:
//!
//! - **Warming**: one scrape runs before [`GroupScheduler::start`] returns, so
//!   the cache already holds samples when the first reader arrives
//! - **Running**: a ticking task scrapes at the effective interval and hands
//!   every batch over a channel to a publisher task that merges it into the
//!   cache
//! - **Cancelled**: both tasks have observed the cancellation token; nothing is
//!   published anymore, already published samples stay
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → scrape(session, instances) → mpsc → publisher → MetricCache
//!     ↑                                                ↑
//!     └──────────── CancellationToken ─────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace};

use crate::cache::MetricCache;
use crate::metrics::ScrapeBatch;
use crate::provider::Session;
use crate::sessions::{MonitoredInstance, SessionGroup};

/// Lower bound of the scrape interval, keeps API pressure in check
pub const MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound of the scrape interval, bounds staleness
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Families of metrics that can be disabled per instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFamily {
    Basic,
    Enhanced,
    PerformanceInsights,
}

impl FeatureFamily {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureFamily::Basic => "basic",
            FeatureFamily::Enhanced => "enhanced",
            FeatureFamily::PerformanceInsights => "performance-insights",
        }
    }

    /// Default exposition path of this family
    pub fn default_path(&self) -> &'static str {
        match self {
            FeatureFamily::Basic => "/basic",
            FeatureFamily::Enhanced => "/enhanced",
            FeatureFamily::PerformanceInsights => "/performance-insights",
        }
    }
}

impl fmt::Display for FeatureFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scrape function of one feature family
///
/// Implementations return the latest samples for (a subset of) `instances`.
/// Returning an error discards the whole batch; the cache keeps the previous
/// samples of every instance.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        instances: &[MonitoredInstance],
    ) -> anyhow::Result<ScrapeBatch>;
}

/// Minimum positive monitoring interval of `instances`, clamped to
/// [`MIN_INTERVAL`, `MAX_INTERVAL`].
pub fn effective_interval(instances: &[MonitoredInstance]) -> Duration {
    instances
        .iter()
        .map(|instance| instance.monitoring_interval)
        .filter(|interval| !interval.is_zero())
        .min()
        .unwrap_or(MAX_INTERVAL)
        .clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Lifecycle of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Warming,
    Running,
    Cancelled,
}

/// Scheduler for one session group and one feature family
pub struct GroupScheduler {
    group: Arc<SessionGroup>,
    family: FeatureFamily,
    instances: Vec<MonitoredInstance>,
    scraper: Arc<dyn Scraper>,
    cache: MetricCache,
    cancel: CancellationToken,
    interval: Duration,
    phase: watch::Sender<Phase>,
}

impl GroupScheduler {
    /// Create an idle scheduler. Instances with `family` disabled are left out.
    pub fn new(
        group: Arc<SessionGroup>,
        family: FeatureFamily,
        scraper: Arc<dyn Scraper>,
        cache: MetricCache,
        cancel: CancellationToken,
    ) -> Self {
        for instance in group.instances() {
            if !instance.is_enabled(family) {
                debug!("instance {instance} has disabled {family} metrics, skipping");
            }
        }
        let instances = group.enabled_instances(family);
        let interval = effective_interval(&instances);
        let (phase, _) = watch::channel(Phase::Idle);

        Self {
            group,
            family,
            instances,
            scraper,
            cache,
            cancel,
            interval,
            phase,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Instances this scheduler scrapes
    pub fn instances(&self) -> &[MonitoredInstance] {
        &self.instances
    }

    /// Run the warming scrape, then spawn the ticking and publishing tasks.
    #[instrument(skip_all, fields(family = %self.family, session = self.group.session().id()))]
    pub async fn start(self) -> ScheduleHandle {
        let session_id = self.group.session().id();

        if self.cancel.is_cancelled() {
            debug!("cancelled before warming, not starting");
            self.phase.send_replace(Phase::Cancelled);
            return ScheduleHandle {
                family: self.family,
                session_id,
                interval: self.interval,
                cancel: self.cancel,
                phase: self.phase.subscribe(),
                ticker: None,
                publisher: None,
            };
        }

        self.phase.send_replace(Phase::Warming);
        info!(
            "updating {} metrics every {:?}",
            self.family, self.interval
        );

        // first scrape runs synchronously so the cache is populated on return
        match self
            .scraper
            .scrape(&self.cancel, self.group.session(), &self.instances)
            .await
        {
            Ok(batch) => self.cache.publish(batch).await,
            Err(e) => error!("warming scrape failed: {e:#}"),
        }

        let (batch_tx, batch_rx) = mpsc::channel(1);
        let span = info_span!("scheduler", family = %self.family, session = session_id);

        let publisher = tokio::spawn(
            publish_loop(batch_rx, self.cache.clone(), self.cancel.clone()).instrument(span.clone()),
        );

        let phase_rx = self.phase.subscribe();
        self.phase.send_replace(Phase::Running);

        let ticker = tokio::spawn(
            tick_loop(
                self.group.clone(),
                self.instances,
                self.scraper,
                self.interval,
                batch_tx,
                self.cancel.clone(),
                self.phase,
            )
            .instrument(span),
        );

        ScheduleHandle {
            family: self.family,
            session_id,
            interval: self.interval,
            cancel: self.cancel,
            phase: phase_rx,
            ticker: Some(ticker),
            publisher: Some(publisher),
        }
    }
}

async fn tick_loop(
    group: Arc<SessionGroup>,
    instances: Vec<MonitoredInstance>,
    scraper: Arc<dyn Scraper>,
    period: Duration,
    batch_tx: mpsc::Sender<ScrapeBatch>,
    cancel: CancellationToken,
    phase: watch::Sender<Phase>,
) {
    debug!("start performing scrapes periodically");

    // the warming scrape stands in for the first tick
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("cancelled, stopping scrapes");
                break;
            }

            _ = ticker.tick() => {}
        }

        let batch = match scraper.scrape(&cancel, group.session(), &instances).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("scrape failed: {e:#}");
                continue;
            }
        };

        trace!("scraped {} instances", batch.len());

        if batch_tx.send(batch).await.is_err() {
            debug!("publisher gone, stopping scrapes");
            break;
        }
    }

    phase.send_replace(Phase::Cancelled);
}

async fn publish_loop(
    mut batch_rx: mpsc::Receiver<ScrapeBatch>,
    cache: MetricCache,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("cancelled, exiting metrics publisher");
                break;
            }

            batch = batch_rx.recv() => {
                match batch {
                    Some(batch) => cache.publish(batch).await,
                    None => {
                        debug!("batch channel closed, exiting metrics publisher");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to a started scheduler
pub struct ScheduleHandle {
    family: FeatureFamily,
    session_id: u64,
    interval: Duration,
    cancel: CancellationToken,
    phase: watch::Receiver<Phase>,
    ticker: Option<JoinHandle<()>>,
    publisher: Option<JoinHandle<()>>,
}

impl ScheduleHandle {
    pub fn family(&self) -> FeatureFamily {
        self.family
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Request cancellation without waiting for in-flight scrapes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for both tasks to exit.
    pub async fn join(mut self) {
        for task in [self.ticker.take(), self.publisher.take()].into_iter().flatten() {
            if let Err(e) = task.await {
                error!("scheduler task panicked: {e}");
            }
        }
    }
}

impl fmt::Debug for ScheduleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("family", &self.family)
            .field("session_id", &self.session_id)
            .field("interval", &self.interval)
            .field("phase", &self.phase())
            .finish()
    }
}
