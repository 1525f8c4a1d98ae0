//! Session handle and the provider collaborators consumed by the core
//!
//! The raw provider API calls live outside this crate. Implementations of the
//! traits below receive a [`Session`] carrying the region, the resolved
//! credentials and the shared HTTP client, and do the actual requests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::credentials::{CredentialHandle, SessionError};
use crate::sessions::MonitoredInstance;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Authenticated provider session shared by every instance of a group
#[derive(Clone)]
pub struct Session {
    id: u64,
    region: String,
    credentials: CredentialHandle,
    client: reqwest::Client,
    trace: bool,
}

impl Session {
    /// Bind a region, credentials and the shared HTTP client together.
    pub fn new(
        region: &str,
        credentials: CredentialHandle,
        client: reqwest::Client,
        trace: bool,
    ) -> Result<Self, SessionError> {
        if region.trim().is_empty() {
            return Err(SessionError::SessionConstruction {
                region: region.to_string(),
                reason: "region must not be empty".to_string(),
            });
        }

        if region.chars().any(char::is_whitespace) {
            return Err(SessionError::SessionConstruction {
                region: region.to_string(),
                reason: "region must not contain whitespace".to_string(),
            });
        }

        Ok(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            region: region.to_string(),
            credentials,
            client,
            trace,
        })
    }

    /// Process-unique identity of this session
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn credentials(&self) -> &CredentialHandle {
        &self.credentials
    }

    /// Shared HTTP client, reused across all requests of all sessions
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Whether requests made through this session should be traced verbosely
    pub fn trace(&self) -> bool {
        self.trace
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .field("trace", &self.trace)
            .finish()
    }
}

/// Lists every instance visible under a session's authentication scope
#[async_trait]
pub trait InstanceDiscovery: Send + Sync {
    async fn discover(&self, session: &Session) -> anyhow::Result<Vec<String>>;
}

/// One record of the instance description API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub name: String,
    pub resource_id: String,
    pub monitoring_interval_secs: u64,
}

/// One page of the instance description API
#[derive(Debug, Clone, Default)]
pub struct DescribePage {
    pub records: Vec<InstanceDescription>,
    pub next_page_token: Option<String>,
}

/// Paginated instance description API
#[async_trait]
pub trait InstanceDescriber: Send + Sync {
    async fn describe(
        &self,
        session: &Session,
        page_token: Option<&str>,
    ) -> anyhow::Result<DescribePage>;
}

/// Fetches the raw performance-insights payload of one instance
#[async_trait]
pub trait PerformanceInsightsSource: Send + Sync {
    async fn fetch(&self, session: &Session, instance: &MonitoredInstance) -> anyhow::Result<Vec<u8>>;
}
