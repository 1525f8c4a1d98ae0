//! Credential resolution for configured instances
//!
//! A [`CredentialHandle`] only describes *how* the provider client should
//! authenticate; secrets are never fetched here. Resolution order, first
//! match wins:
//!
//! 1. workload identity requested → platform default chain
//! 2. role ARN present → role assumption on top of static keys (or the
//!    default chain when no keys are given)
//! 3. static key/secret present → static credentials
//! 4. otherwise → platform default chain with verbose diagnostics

use std::fmt;

use tracing::debug;

use crate::config::InstanceConfig;

/// Environment variable whose presence marks a CI environment
const CI_ENV: &str = "CI";

/// Reusable credential handle for one session
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialHandle {
    /// Defer to the platform's default credential chain
    DefaultChain {
        /// Report every provider tried while resolving the chain
        verbose: bool,
    },

    /// Explicit static access key and secret
    Static {
        access_key: String,
        secret_key: String,
    },

    /// Short-lived credentials obtained by assuming `role_arn` with `base`
    AssumeRole {
        role_arn: String,
        base: Box<CredentialHandle>,
    },
}

// Hand-written so secrets never end up in logs.
impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialHandle::DefaultChain { verbose } => f
                .debug_struct("DefaultChain")
                .field("verbose", verbose)
                .finish(),
            CredentialHandle::Static { access_key, .. } => f
                .debug_struct("Static")
                .field("access_key", access_key)
                .field("secret_key", &"****")
                .finish(),
            CredentialHandle::AssumeRole { role_arn, base } => f
                .debug_struct("AssumeRole")
                .field("role_arn", role_arn)
                .field("base", base)
                .finish(),
        }
    }
}

impl CredentialHandle {
    /// Whether this handle relies on the ambient credential chain somewhere.
    pub fn uses_default_chain(&self) -> bool {
        match self {
            CredentialHandle::DefaultChain { .. } => true,
            CredentialHandle::Static { .. } => false,
            CredentialHandle::AssumeRole { base, .. } => base.uses_default_chain(),
        }
    }
}

/// Resolve the credential handle for a configured instance.
pub fn resolve(instance: &InstanceConfig) -> Result<CredentialHandle, SessionError> {
    if instance.irsa_enabled {
        debug!("{}: using workload identity credentials", instance.region);
        return Ok(CredentialHandle::DefaultChain { verbose: false });
    }

    let has_static = !instance.aws_access_key.is_empty() || !instance.aws_secret_key.is_empty();

    if !instance.aws_role_arn.is_empty() {
        let base = if has_static {
            static_handle(instance)?
        } else {
            CredentialHandle::DefaultChain { verbose: false }
        };
        debug!(
            "{}: assuming role {}",
            instance.region, instance.aws_role_arn
        );
        return Ok(CredentialHandle::AssumeRole {
            role_arn: instance.aws_role_arn.clone(),
            base: Box::new(base),
        });
    }

    if has_static {
        return static_handle(instance);
    }

    Ok(CredentialHandle::DefaultChain { verbose: true })
}

fn static_handle(instance: &InstanceConfig) -> Result<CredentialHandle, SessionError> {
    if instance.aws_access_key.is_empty() || instance.aws_secret_key.is_empty() {
        return Err(SessionError::Credentials {
            region: instance.region.clone(),
            reason: "static credentials need both an access key and a secret key".to_string(),
        });
    }

    Ok(CredentialHandle::Static {
        access_key: instance.aws_access_key.clone(),
        secret_key: instance.aws_secret_key.clone(),
    })
}

/// Refuse request tracing inside CI, where logs are public and the trace
/// output contains signed requests.
pub fn ensure_trace_allowed(trace: bool) -> Result<(), SessionError> {
    check_trace(trace, std::env::var_os(CI_ENV).is_some())
}

fn check_trace(trace: bool, on_ci: bool) -> Result<(), SessionError> {
    if trace && on_ci {
        return Err(SessionError::UnsafeTracing);
    }
    Ok(())
}

/// Errors that abort building the session pool
#[derive(Debug)]
pub enum SessionError {
    /// Request tracing was requested in a CI environment
    UnsafeTracing,

    /// Credentials for an instance entry could not be resolved
    Credentials { region: String, reason: String },

    /// The provider session could not be constructed
    SessionConstruction { region: String, reason: String },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::UnsafeTracing => write!(
                f,
                "refusing to enable request tracing on CI - output would contain credentials"
            ),
            SessionError::Credentials { region, reason } => {
                write!(f, "failed to resolve credentials for {region}: {reason}")
            }
            SessionError::SessionConstruction { region, reason } => {
                write!(f, "failed to create session for {region}: {reason}")
            }
        }
    }
}

impl std::error::Error for SessionError {}
