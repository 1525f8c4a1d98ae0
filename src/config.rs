use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::trace;

use crate::metrics::is_valid_label_name;

/// Top-level exporter configuration
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// One configured instance entry.
///
/// An empty `instance` means "every instance visible in this account and
/// region" and is expanded through discovery when the session pool is built.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct InstanceConfig {
    pub region: String,
    #[serde(default)]
    pub instance: String,

    #[serde(default)]
    pub aws_access_key: String,
    #[serde(default)]
    pub aws_secret_key: String,
    #[serde(default)]
    pub aws_role_arn: String,

    /// Use workload identity (ambient credentials of the pod/host)
    #[serde(default)]
    pub irsa_enabled: bool,

    #[serde(default)]
    pub disable_basic_metrics: bool,
    #[serde(default)]
    pub disable_enhanced_metrics: bool,
    #[serde(default)]
    pub disable_performance_insights: bool,

    /// Extra labels attached to every sample of this instance
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl InstanceConfig {
    /// Key under which instances share one session.
    pub fn session_key(&self) -> String {
        format!("{}/{}", self.region, self.aws_access_key)
    }
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        for (idx, instance) in self.instances.iter().enumerate() {
            if instance.region.is_empty() {
                anyhow::bail!("instance entry #{idx} ({:?}) has no region", instance.instance);
            }
            if let Some(name) = instance.labels.keys().find(|name| !is_valid_label_name(name)) {
                anyhow::bail!(
                    "instance entry #{idx} ({:?}) has invalid label name {name:?}",
                    instance.instance
                );
            }
        }
        Ok(())
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("can't read configuration file {}", path.display()))?;
    let config: Config = serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
