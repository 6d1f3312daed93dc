//! GCP service accounts bound to Kubernetes ServiceAccounts through GKE
//! Workload Identity.

mod iam;

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

pub use iam::{Binding, GcpIamApi, IamPolicy, ServiceAccount};
#[cfg(test)]
pub use iam::MockGcpIamApi;

use self::iam::{DesiredAccount, IamClient};
use super::credentials::{self, env_first, process_env};
use super::service_accounts::reconcile_service_account;
use super::{or_default, IdentityReconciler, ProviderContext};
use crate::error::{Error, Result};
use crate::types::{Condition, Provider, WorkloadIdentity};

pub const SERVICE_ACCOUNT_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GcpConfig {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub credentials_file: String,
    /// Service account key JSON.
    #[serde(default)]
    pub credentials: String,
}

impl GcpConfig {
    pub fn from_properties(
        properties: Option<&BTreeMap<String, String>>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config: GcpConfig = match properties {
            Some(properties) => serde_json::to_value(properties)
                .and_then(serde_json::from_value)
                .map_err(|source| Error::InvalidCredentials {
                    provider: Provider::Gcp,
                    source,
                })?,
            None => GcpConfig::default(),
        };

        let fallbacks: [(&mut String, &[&str]); 4] = [
            (
                &mut config.project,
                &["GOOGLE_PROJECT", "GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT", "CLOUDSDK_CORE_PROJECT"],
            ),
            (
                &mut config.location,
                &["GOOGLE_REGION", "GCLOUD_REGION", "CLOUDSDK_COMPUTE_REGION"],
            ),
            (
                &mut config.zone,
                &["GOOGLE_ZONE", "GCLOUD_ZONE", "CLOUDSDK_COMPUTE_ZONE"],
            ),
            (&mut config.credentials_file, &["GOOGLE_APPLICATION_CREDENTIALS"]),
        ];
        for (field, keys) in fallbacks {
            if field.is_empty() {
                *field = env_first(env, keys).unwrap_or_default();
            }
        }
        Ok(config)
    }
}

pub struct ServiceAccountReconciler {
    context: ProviderContext,
    client: Option<IamClient>,
}

impl ServiceAccountReconciler {
    pub fn new(context: ProviderContext) -> Self {
        Self {
            context,
            client: None,
        }
    }

    fn client(&self) -> Result<&IamClient> {
        self.client.as_ref().ok_or(Error::NotPrepared(Provider::Gcp))
    }
}

#[async_trait]
impl IdentityReconciler for ServiceAccountReconciler {
    async fn prepare(&mut self, resource: &WorkloadIdentity) -> Result<()> {
        let properties = credentials::resolve(self.context.cluster.as_ref(), resource).await?;
        let config = GcpConfig::from_properties(properties.as_ref(), &process_env)?;
        let api = self.context.backends.gcp(&config)?;
        self.client = Some(IamClient::new(api, &config.project));
        Ok(())
    }

    async fn reconcile(&mut self, resource: &mut WorkloadIdentity) -> Result<()> {
        let spec = resource
            .spec
            .gcp
            .clone()
            .ok_or(Error::MissingProviderSpec(Provider::Gcp))?;
        let resource_name = resource.name();
        let resource_namespace = resource.namespace().unwrap_or_default();
        let name = or_default(&resource.spec.name, &resource_name).to_string();

        let email = self
            .client()?
            .ensure_service_account(&DesiredAccount {
                account_id: &name,
                display_name: &resource.spec.display_name,
                description: &resource.spec.description,
                workload_members: spec
                    .service_accounts
                    .iter()
                    .map(|sa| {
                        (
                            or_default(&sa.namespace, &resource_namespace).to_string(),
                            or_default(&sa.name, &resource_name).to_string(),
                        )
                    })
                    .collect(),
                roles: &spec.roles,
            })
            .await?;

        let status = resource.status.get_or_insert_with(Default::default);
        status.id = email;
        status.name = name;
        if status.id.is_empty() {
            return Err(Error::Condition(Condition::waiting(
                "waiting for identity to be created",
            )));
        }
        let email = status.id.clone();

        for service_account in &spec.service_accounts {
            reconcile_service_account(
                self.context.cluster.as_ref(),
                resource,
                service_account,
                SERVICE_ACCOUNT_ANNOTATION,
                &email,
            )
            .await?;
        }
        Ok(())
    }

    async fn finalize(&mut self, resource: &mut WorkloadIdentity) -> Result<()> {
        let email = resource
            .status
            .as_ref()
            .map(|status| status.id.as_str())
            .unwrap_or_default();
        self.client()?.delete_service_account(email).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::predicate::eq;

    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::config::Options;
    use crate::providers::MockCloudBackends;
    use crate::types::{
        ServiceAccountAction, ServiceAccountSpec, WorkloadIdentityGcp, WorkloadIdentitySpec,
        WorkloadIdentityStatus,
    };

    fn resource(gcp: WorkloadIdentityGcp) -> WorkloadIdentity {
        let mut resource = WorkloadIdentity::new(
            "ccs",
            WorkloadIdentitySpec {
                name: String::new(),
                display_name: "CCS".into(),
                description: String::new(),
                credentials: None,
                provider: Provider::Gcp,
                aws: None,
                azure: None,
                gcp: Some(gcp),
                write_to_secret_ref: None,
            },
        );
        resource.metadata.namespace = Some("dev".into());
        resource.metadata.uid = Some("0ae5c03d-5fb3-4eb9-9de8-2bd4b51606ba".into());
        resource
    }

    fn reconciler(api: MockGcpIamApi, cluster: MockClusterClient) -> ServiceAccountReconciler {
        let mut backends = MockCloudBackends::new();
        let api: Arc<dyn GcpIamApi> = Arc::new(api);
        backends
            .expect_gcp()
            .withf(|config| config.project == "proj")
            .return_once(move |_| Ok(api));
        ServiceAccountReconciler::new(ProviderContext {
            cluster: Arc::new(cluster),
            backends: Arc::new(backends),
            options: Arc::new(Options::default()),
        })
    }

    fn with_project(mut resource: WorkloadIdentity) -> WorkloadIdentity {
        resource.spec.credentials = Some(crate::types::Credentials {
            properties: BTreeMap::from([("project".to_string(), "proj".to_string())]),
            ..Default::default()
        });
        resource
    }

    #[test]
    fn project_falls_back_to_environment() {
        let env = |key: &str| match key {
            "GOOGLE_CLOUD_PROJECT" => Some("env-proj".to_string()),
            "CLOUDSDK_COMPUTE_ZONE" => Some("europe-west1-b".to_string()),
            _ => None,
        };

        let config = GcpConfig::from_properties(None, &env).unwrap();
        assert_eq!(config.project, "env-proj");
        assert_eq!(config.zone, "europe-west1-b");

        let properties = BTreeMap::from([("project".to_string(), "proj".to_string())]);
        let config = GcpConfig::from_properties(Some(&properties), &env).unwrap();
        assert_eq!(config.project, "proj");
    }

    #[tokio::test]
    async fn binds_kubernetes_service_account() {
        let mut api = MockGcpIamApi::new();
        api.expect_get_service_account().returning(|_| {
            Ok(ServiceAccount {
                email: "ccs@proj.iam.gserviceaccount.com".into(),
                display_name: "CCS".into(),
                description: String::new(),
            })
        });
        api.expect_get_service_account_policy().returning(|_| {
            Ok(IamPolicy {
                bindings: vec![Binding {
                    role: "roles/iam.workloadIdentityUser".into(),
                    members: vec!["serviceAccount:proj.svc.id.goog[dev/web]".into()],
                }],
                etag: String::new(),
            })
        });
        api.expect_get_project_policy()
            .returning(|_| Ok(IamPolicy::default()));

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_service_account()
            .with(eq("dev"), eq("web"))
            .returning(|_, _| Ok(None));
        cluster
            .expect_create_service_account()
            .withf(|sa| {
                sa.annotations().get(SERVICE_ACCOUNT_ANNOTATION).map(String::as_str)
                    == Some("ccs@proj.iam.gserviceaccount.com")
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut resource = with_project(resource(WorkloadIdentityGcp {
            service_accounts: vec![ServiceAccountSpec {
                action: ServiceAccountAction::Create,
                name: "web".into(),
                ..ServiceAccountSpec::default()
            }],
            roles: vec![],
        }));
        let mut reconciler = reconciler(api, cluster);
        reconciler.prepare(&resource).await.unwrap();

        reconciler.reconcile(&mut resource).await.unwrap();

        let status = resource.status.unwrap();
        assert_eq!(status.id, "ccs@proj.iam.gserviceaccount.com");
        assert_eq!(status.name, "ccs");
    }

    #[tokio::test]
    async fn finalize_deletes_recorded_account() {
        let mut api = MockGcpIamApi::new();
        api.expect_delete_service_account()
            .with(eq("projects/proj/serviceAccounts/ccs@proj.iam.gserviceaccount.com"))
            .times(1)
            .returning(|_| Ok(()));
        let mut resource = with_project(resource(WorkloadIdentityGcp::default()));
        resource.status = Some(WorkloadIdentityStatus {
            id: "ccs@proj.iam.gserviceaccount.com".into(),
            ..WorkloadIdentityStatus::default()
        });
        let mut reconciler = reconciler(api, MockClusterClient::new());
        reconciler.prepare(&resource).await.unwrap();

        reconciler.finalize(&mut resource).await.unwrap();
    }
}
