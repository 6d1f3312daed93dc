//! Cloud provider reconcilers for `WorkloadIdentity`.
//!
//! Every provider follows the same shape: `prepare` resolves credentials and
//! builds the remote store clients, `reconcile` converges the remote identity
//! and the cluster objects bound to it, `finalize` removes the identity.
//! Remote stores are reached through the traits in each provider module so
//! the SDK wiring stays outside the reconcile logic.

pub mod aws;
pub mod azure;
mod credentials;
pub mod gcp;
mod service_accounts;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::cluster::ClusterClient;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::types::{Provider, WorkloadIdentity};

/// Failure reported by a remote identity store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("not found")]
    NotFound,
    #[error("{message}")]
    Api { code: String, message: String },
}

impl CloudError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError::Api {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Builds remote store clients from resolved provider configuration.
#[cfg_attr(test, automock)]
pub trait CloudBackends: Send + Sync {
    fn aws(&self, config: &aws::AwsConfig) -> Result<aws::AwsClients>;
    fn azure(&self, config: &azure::AzureConfig) -> Result<azure::AzureClients>;
    fn gcp(&self, config: &gcp::GcpConfig) -> Result<Arc<dyn gcp::GcpIamApi>>;
}

/// Backends used when no cloud SDK is linked in. Every provider reconcile
/// fails with [`Error::BackendUnavailable`].
pub struct Unconfigured;

impl CloudBackends for Unconfigured {
    fn aws(&self, _config: &aws::AwsConfig) -> Result<aws::AwsClients> {
        Err(Error::BackendUnavailable(Provider::Aws))
    }

    fn azure(&self, _config: &azure::AzureConfig) -> Result<azure::AzureClients> {
        Err(Error::BackendUnavailable(Provider::Azure))
    }

    fn gcp(&self, _config: &gcp::GcpConfig) -> Result<Arc<dyn gcp::GcpIamApi>> {
        Err(Error::BackendUnavailable(Provider::Gcp))
    }
}

/// Immutable dependencies shared by all provider reconcilers.
#[derive(Clone)]
pub struct ProviderContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub backends: Arc<dyn CloudBackends>,
    pub options: Arc<Options>,
}

#[async_trait]
pub trait IdentityReconciler: Send {
    /// Resolves credentials and connects to the provider.
    async fn prepare(&mut self, resource: &WorkloadIdentity) -> Result<()>;

    async fn reconcile(&mut self, resource: &mut WorkloadIdentity) -> Result<()>;

    async fn finalize(&mut self, resource: &mut WorkloadIdentity) -> Result<()>;
}

pub fn for_provider(provider: Provider, context: ProviderContext) -> Box<dyn IdentityReconciler> {
    match provider {
        Provider::Aws => Box::new(aws::RoleReconciler::new(context)),
        Provider::Azure => Box::new(azure::IdentityReconciler::new(context)),
        Provider::Gcp => Box::new(gcp::ServiceAccountReconciler::new(context)),
    }
}

/// Falls back to `default` when `value` is empty.
pub(crate) fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}
