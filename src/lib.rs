//! Telemetry collection for managed database instances.
//!
//! Configured instances are resolved into a [`SessionPool`] of per-credential
//! session groups. A [`Collector`] runs one [`GroupScheduler`] per group for a
//! single [`FeatureFamily`] and publishes the scraped samples into a
//! [`MetricCache`], which the exposition path renders on demand.

pub mod cache;
pub mod collector;
pub mod config;
pub mod credentials;
pub mod exposition;
pub mod logging;
pub mod metrics;
pub mod performance_insights;
pub mod provider;
pub mod scheduler;
pub mod sessions;

pub use cache::MetricCache;
pub use collector::{Collector, reconfigure_every};
pub use config::{Config, InstanceConfig, read_config_file};
pub use credentials::{CredentialHandle, SessionError};
pub use metrics::{InstanceId, Labels, MetricSample, MetricValue, ScrapeBatch};
pub use provider::Session;
pub use scheduler::{FeatureFamily, GroupScheduler, Phase, ScheduleHandle, Scraper};
pub use sessions::{MonitoredInstance, SessionGroup, SessionPool};
