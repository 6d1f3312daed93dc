//! AWS IAM roles bound to ServiceAccounts through IRSA.

mod iam;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

pub use iam::{CreateRole, IamApi, Role, StsApi};
#[cfg(test)]
pub use iam::{MockIamApi, MockStsApi};

use self::iam::{role_name, DesiredRole, IamClient};
use super::credentials::{self, env_first, process_env};
use super::service_accounts::{reconcile_service_account, restart_pods};
use super::{or_default, IdentityReconciler, ProviderContext};
use crate::error::{Error, Result};
use crate::types::{Condition, Provider, WorkloadIdentity};

/// Annotation carrying an existing role ARN. Imported roles are never
/// created, updated or deleted.
pub const IMPORT_ANNOTATION: &str = "identity-manager.io/import";
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";
const ROLE_ARN_ENV: &str = "AWS_ROLE_ARN";

/// Connection settings read from the credentials properties, falling back to
/// the standard AWS environment variables.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AwsConfig {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub aws_access_key_id: String,
    #[serde(default)]
    pub aws_secret_access_key: String,
    #[serde(default)]
    pub aws_session_token: String,
    /// Role assumed before managing IAM.
    #[serde(default)]
    pub role_arn: String,
    #[serde(default)]
    pub external_id: String,
}

impl AwsConfig {
    pub fn from_properties(
        properties: Option<&BTreeMap<String, String>>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config: AwsConfig = match properties {
            Some(properties) => serde_json::to_value(properties)
                .and_then(serde_json::from_value)
                .map_err(|source| Error::InvalidCredentials {
                    provider: Provider::Aws,
                    source,
                })?,
            None => AwsConfig::default(),
        };
        if config.region.is_empty() {
            config.region = env_first(env, &["AWS_REGION", "AWS_DEFAULT_REGION"]).unwrap_or_default();
        }
        Ok(config)
    }
}

pub struct AwsClients {
    pub iam: Arc<dyn IamApi>,
    pub sts: Arc<dyn StsApi>,
}

pub struct RoleReconciler {
    context: ProviderContext,
    client: Option<IamClient>,
}

fn imported_arn(resource: &WorkloadIdentity) -> Option<String> {
    resource
        .annotations()
        .get(IMPORT_ANNOTATION)
        .filter(|arn| !arn.is_empty())
        .cloned()
}

impl RoleReconciler {
    pub fn new(context: ProviderContext) -> Self {
        Self {
            context,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&mut IamClient> {
        self.client.as_mut().ok_or(Error::NotPrepared(Provider::Aws))
    }
}

#[async_trait]
impl IdentityReconciler for RoleReconciler {
    async fn prepare(&mut self, resource: &WorkloadIdentity) -> Result<()> {
        if imported_arn(resource).is_some() {
            return Ok(());
        }
        let properties = credentials::resolve(self.context.cluster.as_ref(), resource).await?;
        let config = AwsConfig::from_properties(properties.as_ref(), &process_env)?;
        let clients = self.context.backends.aws(&config)?;
        self.client = Some(IamClient::new(clients.iam, clients.sts));
        Ok(())
    }

    async fn reconcile(&mut self, resource: &mut WorkloadIdentity) -> Result<()> {
        let spec = resource
            .spec
            .aws
            .clone()
            .ok_or(Error::MissingProviderSpec(Provider::Aws))?;

        if let Some(arn) = imported_arn(resource) {
            tracing::debug!(%arn, "role is imported, skipping IAM");
            resource.status.get_or_insert_with(Default::default).id = arn;
        } else {
            let options = self.context.options.clone();
            let namespace = resource.namespace().unwrap_or_default();
            let desired = DesiredRole {
                name: role_name(
                    &resource.spec.name,
                    &namespace,
                    &resource.name(),
                    &options.name_prefix,
                ),
                description: &resource.spec.description,
                spec: &spec,
                permissions_boundary_arn: or_default(
                    &spec.permissions_boundary_arn,
                    &options.aws_permissions_boundary_arn,
                ),
                tags: options.tags(),
            };
            let previous = resource
                .status
                .as_ref()
                .map(|status| status.name.clone())
                .unwrap_or_default();

            let role = self.client()?.create_or_update(&previous, &desired).await?;

            let status = resource.status.get_or_insert_with(Default::default);
            status.name = role.name;
            status.id = role.arn;
        }

        let arn = resource
            .status
            .as_ref()
            .map(|status| status.id.clone())
            .unwrap_or_default();
        if arn.is_empty() {
            return Err(Error::Condition(Condition::waiting(
                "waiting for role to be created! ARN is empty",
            )));
        }

        let cluster = self.context.cluster.as_ref();
        for service_account in &spec.service_accounts {
            reconcile_service_account(cluster, resource, service_account, ROLE_ARN_ANNOTATION, &arn)
                .await?;
        }
        for selector in &spec.pods {
            restart_pods(cluster, resource, selector, ROLE_ARN_ENV, &arn).await?;
        }
        Ok(())
    }

    async fn finalize(&mut self, resource: &mut WorkloadIdentity) -> Result<()> {
        if imported_arn(resource).is_some() {
            return Ok(());
        }
        let role = resource
            .status
            .as_ref()
            .map(|status| status.name.clone())
            .unwrap_or_default();
        self.client()?.delete(&role).await
    }
}
