//! Session pool: groups monitored instances by authentication scope
//!
//! Instances that share a region and an explicit access key (or share "no
//! key") share one [`Session`]. After grouping, every instance is resolved
//! against the provider's description API to learn its durable resource id
//! and its monitoring interval; unresolved instances and empty groups are
//! dropped before anything is scheduled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use crate::config::InstanceConfig;
use crate::credentials::{self, SessionError};
use crate::metrics::InstanceId;
use crate::provider::{InstanceDescriber, InstanceDiscovery, Session};
use crate::scheduler::FeatureFamily;

/// Runtime view of one monitored instance
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredInstance {
    pub region: String,
    pub instance: String,
    /// Durable resource identifier, empty until resolved
    pub resource_id: String,
    pub labels: HashMap<String, String>,
    pub disable_basic_metrics: bool,
    pub disable_enhanced_metrics: bool,
    pub disable_performance_insights: bool,
    /// Provider-reported monitoring interval (zero when monitoring is off)
    pub monitoring_interval: Duration,
}

impl MonitoredInstance {
    fn from_config(config: &InstanceConfig, name: &str) -> Self {
        Self {
            region: config.region.clone(),
            instance: name.to_string(),
            resource_id: String::new(),
            labels: config.labels.clone(),
            disable_basic_metrics: config.disable_basic_metrics,
            disable_enhanced_metrics: config.disable_enhanced_metrics,
            disable_performance_insights: config.disable_performance_insights,
            monitoring_interval: Duration::ZERO,
        }
    }

    pub fn id(&self) -> InstanceId {
        InstanceId::new(&self.region, &self.instance)
    }

    pub fn is_resolved(&self) -> bool {
        !self.resource_id.is_empty()
    }

    pub fn is_enabled(&self, family: FeatureFamily) -> bool {
        match family {
            FeatureFamily::Basic => !self.disable_basic_metrics,
            FeatureFamily::Enhanced => !self.disable_enhanced_metrics,
            FeatureFamily::PerformanceInsights => !self.disable_performance_insights,
        }
    }
}

impl fmt::Display for MonitoredInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.instance)?;
        if self.is_resolved() {
            write!(f, " ({})", self.resource_id)?;
        }
        Ok(())
    }
}

/// A session and the instances it authenticates
#[derive(Debug, Clone)]
pub struct SessionGroup {
    session: Session,
    instances: Vec<MonitoredInstance>,
}

impl SessionGroup {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn instances(&self) -> &[MonitoredInstance] {
        &self.instances
    }

    /// Instances of this group that have `family` enabled, in group order
    pub fn enabled_instances(&self, family: FeatureFamily) -> Vec<MonitoredInstance> {
        self.instances
            .iter()
            .filter(|instance| instance.is_enabled(family))
            .cloned()
            .collect()
    }

    fn push_unique(&mut self, instance: MonitoredInstance) {
        if self
            .instances
            .iter()
            .any(|existing| existing.instance == instance.instance)
        {
            debug!("{instance} is already monitored by this session, skipping duplicate");
            return;
        }
        self.instances.push(instance);
    }

    async fn resolve_descriptions(&mut self, describer: &dyn InstanceDescriber) {
        let mut page_token: Option<String> = None;

        loop {
            let page = match describer.describe(&self.session, page_token.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    error!(
                        "{}: failed to get resource ids: {e:#}",
                        self.session.region()
                    );
                    break;
                }
            };

            for record in &page.records {
                for instance in self
                    .instances
                    .iter_mut()
                    .filter(|instance| instance.instance == record.name)
                {
                    instance.resource_id = record.resource_id.clone();
                    instance.monitoring_interval =
                        Duration::from_secs(record.monitoring_interval_secs);
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
    }

    fn drop_unresolved(&mut self) {
        self.instances.retain(|instance| {
            if !instance.is_resolved() {
                error!("skipping {instance} - can't determine resource id");
            }
            instance.is_resolved()
        });
    }
}

/// Pool of provider sessions and their instance groups
#[derive(Debug, Clone, Default)]
pub struct SessionPool {
    groups: Vec<Arc<SessionGroup>>,
}

impl SessionPool {
    /// Build the pool for the given instance entries.
    ///
    /// Credential and session construction failures abort the whole build.
    /// Discovery and description failures only degrade the affected group.
    #[instrument(skip_all, fields(component = "sessions"))]
    pub async fn build(
        configs: &[InstanceConfig],
        client: reqwest::Client,
        trace: bool,
        discovery: &dyn InstanceDiscovery,
        describer: &dyn InstanceDescriber,
    ) -> Result<Self, SessionError> {
        info!("creating sessions...");
        credentials::ensure_trace_allowed(trace)?;

        let mut groups: Vec<SessionGroup> = Vec::new();
        // region/key => index into `groups`
        let mut shared: HashMap<String, usize> = HashMap::new();

        for config in configs {
            let key = config.session_key();

            let idx = match shared.get(&key) {
                Some(&idx) => idx,
                None => {
                    let credentials = credentials::resolve(config)?;
                    let session =
                        Session::new(&config.region, credentials, client.clone(), trace)?;
                    debug!("created session {} for {}", session.id(), config.region);

                    groups.push(SessionGroup {
                        session,
                        instances: Vec::new(),
                    });
                    shared.insert(key, groups.len() - 1);
                    groups.len() - 1
                }
            };

            let names = expand_instance_names(config, &groups[idx].session, discovery).await;
            for name in names {
                groups[idx].push_unique(MonitoredInstance::from_config(config, &name));
            }
        }

        join_all(
            groups
                .iter_mut()
                .map(|group| group.resolve_descriptions(describer)),
        )
        .await;

        for group in &mut groups {
            group.drop_unresolved();
        }
        groups.retain(|group| {
            if group.instances.is_empty() {
                warn!(
                    "dropping session for {} - no instances left",
                    group.session.region()
                );
            }
            !group.instances.is_empty()
        });

        let pool = Self {
            groups: groups.into_iter().map(Arc::new).collect(),
        };
        pool.log_summary();
        Ok(pool)
    }

    /// Wrap already-resolved groups; unresolved instances and empty groups
    /// are dropped just like in [`SessionPool::build`].
    pub fn from_groups(groups: Vec<(Session, Vec<MonitoredInstance>)>) -> Self {
        let groups = groups
            .into_iter()
            .map(|(session, instances)| {
                let mut group = SessionGroup { session, instances };
                group.drop_unresolved();
                group
            })
            .filter(|group| !group.instances.is_empty())
            .map(Arc::new)
            .collect();
        Self { groups }
    }

    pub fn groups(&self) -> &[Arc<SessionGroup>] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// First session and instance matching `region` and `instance`.
    pub fn get_session(&self, region: &str, instance: &str) -> Option<(&Session, &MonitoredInstance)> {
        self.groups.iter().find_map(|group| {
            group
                .instances
                .iter()
                .find(|i| i.region == region && i.instance == instance)
                .map(|i| (&group.session, i))
        })
    }

    fn log_summary(&self) {
        for group in &self.groups {
            for instance in &group.instances {
                info!(
                    region = %instance.region,
                    instance = %instance.instance,
                    resource_id = %instance.resource_id,
                    interval = ?instance.monitoring_interval,
                    "monitored instance"
                );
            }
        }
        info!("using {} sessions", self.groups.len());
    }
}

async fn expand_instance_names(
    config: &InstanceConfig,
    session: &Session,
    discovery: &dyn InstanceDiscovery,
) -> Vec<String> {
    if !config.instance.is_empty() {
        return vec![config.instance.clone()];
    }

    match discovery.discover(session).await {
        Ok(names) => {
            debug!("{}: discovered {} instances", config.region, names.len());
            names
        }
        Err(e) => {
            error!("{}: failed to discover instances: {e:#}", config.region);
            Vec::new()
        }
    }
}
