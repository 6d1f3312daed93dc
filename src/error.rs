use thiserror::Error;

use crate::providers::CloudError;
use crate::types::{Condition, Provider};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Stops the reconcile without touching the status or requeueing.
    #[error("IgnoreError")]
    Ignore,
    /// Adopted verbatim as the resource's condition.
    #[error("{}", .0.message)]
    Condition(Condition),

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get resource: {0}")]
    GetResourceFailed(#[source] kube::Error),
    #[error("Failed to update resource: {0}")]
    UpdateResourceFailed(#[source] kube::Error),
    #[error("Failed to serialize status: {0}")]
    SerializeStatusFailed(#[source] serde_json::Error),
    #[error("Failed to update status: {0}")]
    UpdateStatusFailed(#[source] kube::Error),
    #[error("Failed to {operation}: {source}")]
    Kube {
        operation: &'static str,
        #[source]
        source: kube::Error,
    },
    #[error("Failed to serialize {kind}: {source}")]
    SerializeObjectFailed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing {0} spec")]
    MissingProviderSpec(Provider),
    #[error("missing secretRef for credentials")]
    MissingSecretRef,
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { name: String, namespace: String },
    #[error("invalid {provider} credentials: {source}")]
    InvalidCredentials {
        provider: Provider,
        #[source]
        source: serde_json::Error,
    },
    #[error("no {0} backend configured")]
    BackendUnavailable(Provider),
    #[error("{0} reconciler used before prepare")]
    NotPrepared(Provider),
    #[error("{operation}: {source}")]
    Provider {
        provider: Provider,
        operation: &'static str,
        #[source]
        source: CloudError,
    },

    #[error("unable to create serviceaccount {namespace}/{name}: serviceaccount already exists")]
    ServiceAccountExists { name: String, namespace: String },
    #[error("missing serviceaccount {namespace}/{name}, cannot update")]
    ServiceAccountMissing { name: String, namespace: String },

    #[error("invalid assume role policy document: {0}")]
    InvalidPolicyDocument(#[source] std::str::Utf8Error),
    #[error("role {0} not found")]
    RoleDefinitionNotFound(String),
    #[error("found multiple role definitions with name {0:?}")]
    AmbiguousRoleDefinition(String),
    #[error("unsupported alias {0}")]
    UnsupportedScopeAlias(String),

    #[error("Failed to parse {key} of configmap {name}: {source}")]
    ParseAwsAuthFailed {
        name: String,
        key: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to serialize {key}: {source}")]
    SerializeAwsAuthFailed {
        key: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
}

impl Error {
    pub(crate) fn kube(operation: &'static str) -> impl FnOnce(kube::Error) -> Self {
        move |source| Error::Kube { operation, source }
    }

    pub(crate) fn provider(
        provider: Provider,
        operation: &'static str,
    ) -> impl FnOnce(CloudError) -> Self {
        move |source| Error::Provider {
            provider,
            operation,
            source,
        }
    }
}
