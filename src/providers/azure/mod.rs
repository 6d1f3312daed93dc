//! Azure user assigned managed identities, bound to pods through
//! aad-pod-identity.

mod rbac;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub use rbac::{Identity, MsiApi, RbacApi, RoleAssignmentRecord, RoleDefinitionProperties};
#[cfg(test)]
pub use rbac::{MockMsiApi, MockRbacApi};

use self::rbac::{stable_id, RbacClient};
use super::credentials::{self, process_env};
use super::{or_default, IdentityReconciler as ProviderReconciler, ProviderContext};
use crate::cluster::controller_owner_reference;
use crate::error::{Error, Result};
use crate::types::{
    Condition, ObjectOverrides, Provider, RoleAssignment, WorkloadIdentity, WorkloadIdentityAzure,
};

const POD_IDENTITY_API_VERSION: &str = "aadpodidentity.k8s.io/v1";
const BEHAVIOR_ANNOTATION: &str = "aadpodidentity.k8s.io/Behavior";
const MANAGED_BY_TAG: (&str, &str) = ("managed-by", "identity-manager.io");

/// Connection settings. Environment variables provide the defaults, the
/// credentials properties override them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub certificate_path: String,
    #[serde(default)]
    pub certificate_password: String,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub location: String,
}

const ENV_KEYS: &[(&str, &str)] = &[
    ("subscriptionId", "AZURE_SUBSCRIPTION_ID"),
    ("tenantId", "AZURE_TENANT_ID"),
    ("clientId", "AZURE_CLIENT_ID"),
    ("clientSecret", "AZURE_CLIENT_SECRET"),
    ("environment", "AZURE_ENVIRONMENT"),
    ("location", "AZURE_LOCATION"),
    ("resourceGroup", "AZURE_RESOURCE_GROUP"),
];

impl AzureConfig {
    pub fn from_properties(
        properties: Option<&BTreeMap<String, String>>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut values = serde_json::Map::new();
        for (key, variable) in ENV_KEYS {
            if let Some(value) = env(variable).filter(|value| !value.is_empty()) {
                values.insert(key.to_string(), value.into());
            }
        }
        for (key, value) in properties.into_iter().flatten() {
            values.insert(key.clone(), value.clone().into());
        }
        if let Some(region) = values.get("region").cloned() {
            values.insert("location".to_string(), region);
        }

        serde_json::from_value(values.into()).map_err(|source| Error::InvalidCredentials {
            provider: Provider::Azure,
            source,
        })
    }
}

pub struct AzureClients {
    pub msi: Arc<dyn MsiApi>,
    pub rbac: Arc<dyn RbacApi>,
}

struct Prepared {
    config: AzureConfig,
    msi: Arc<dyn MsiApi>,
    rbac: RbacClient,
}

pub struct IdentityReconciler {
    context: ProviderContext,
    prepared: Option<Prepared>,
}

fn azure_error(operation: &'static str) -> impl FnOnce(super::CloudError) -> Error {
    Error::provider(Provider::Azure, operation)
}

/// Replaces `<(key)` placeholders with their values. Unknown keys render
/// empty.
fn render_template(template: &str, values: &BTreeMap<&str, &str>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("<(") {
        let end = match rest[start + 2..].find(')') {
            Some(end) => end,
            None => break,
        };
        rendered.push_str(&rest[..start]);
        let key = &rest[start + 2..start + 2 + end];
        rendered.push_str(values.get(key).copied().unwrap_or_default());
        rest = &rest[start + 2 + end + 1..];
    }
    rendered.push_str(rest);
    rendered
}

fn template_values(identity: &Identity) -> BTreeMap<&str, &str> {
    BTreeMap::from([
        ("identity.id", identity.id.as_str()),
        ("identity.resourceID", identity.id.as_str()),
        ("identity.clientID", identity.client_id.as_str()),
        ("identity.principalID", identity.principal_id.as_str()),
        ("identity.name", identity.name.as_str()),
        ("identity.tenantID", identity.tenant_id.as_str()),
        ("tenantId", identity.tenant_id.as_str()),
        ("subscriptionId", identity.subscription_id.as_str()),
        ("resourceGroup", identity.resource_group.as_str()),
        ("location", identity.location.as_str()),
    ])
}

/// Dynamic object with the given defaults and overrides applied.
struct PodIdentityObject {
    resource: ApiResource,
    object: DynamicObject,
}

fn pod_identity_object(
    owner: &WorkloadIdentity,
    kind: &str,
    name: &str,
    namespace: &str,
    api_version: &str,
    kind_override: &str,
    metadata: Option<&ObjectOverrides>,
) -> Result<PodIdentityObject> {
    let api_version = or_default(api_version, POD_IDENTITY_API_VERSION);
    let kind = or_default(kind_override, kind);
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));

    let mut name = name;
    let mut namespace = namespace;
    let mut labels = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    if let Some(metadata) = metadata {
        name = or_default(&metadata.name, name);
        namespace = or_default(&metadata.namespace, namespace);
        labels.extend(metadata.labels.clone());
        annotations.extend(metadata.annotations.clone());
    }

    let mut object = DynamicObject::new(name, &resource).within(namespace);
    object.metadata.labels = (!labels.is_empty()).then(|| labels);
    object.metadata.annotations = (!annotations.is_empty()).then(|| annotations);
    object.metadata.owner_references = Some(vec![controller_owner_reference(owner)?]);
    Ok(PodIdentityObject { resource, object })
}

impl IdentityReconciler {
    pub fn new(context: ProviderContext) -> Self {
        Self {
            context,
            prepared: None,
        }
    }

    fn prepared(&self) -> Result<&Prepared> {
        self.prepared
            .as_ref()
            .ok_or(Error::NotPrepared(Provider::Azure))
    }

    async fn create_or_update_identity(
        &self,
        resource: &WorkloadIdentity,
        spec: &WorkloadIdentityAzure,
    ) -> Result<Identity> {
        let prepared = self.prepared()?;
        let config = &prepared.config;
        let resource_name = resource.name();
        let name = or_default(&resource.spec.name, &resource_name);

        let mut tags = self.context.options.tags();
        tags.insert(MANAGED_BY_TAG.0.to_string(), MANAGED_BY_TAG.1.to_string());
        let mut identity = prepared
            .msi
            .create_or_update(&config.resource_group, name, &config.location, &tags)
            .await
            .map_err(azure_error("CreateOrUpdate"))?;
        identity.location = config.location.clone();
        identity.resource_group = config.resource_group.clone();
        identity.subscription_id = config.subscription_id.clone();

        let uid = resource.uid().unwrap_or_default();
        let namespace = resource.namespace().unwrap_or_default();
        for definition in &spec.role_definitions {
            let id = stable_id(&[
                &uid,
                &namespace,
                &resource_name,
                &definition.id,
                &definition.role_name,
            ]);
            prepared
                .rbac
                .create_or_update_role_definition(
                    &id,
                    &RoleDefinitionProperties {
                        role_name: definition.role_name.clone(),
                        role_type: definition.role_type.clone(),
                        description: definition.description.clone(),
                        assignable_scopes: definition.assignable_scopes.clone(),
                        permissions: definition.permissions.clone(),
                    },
                )
                .await?;
        }

        let assignments: BTreeMap<String, RoleAssignment> = spec
            .role_assignments
            .iter()
            .map(|(key, assignment)| {
                let id = stable_id(&[
                    &identity.principal_id,
                    &namespace,
                    &resource_name,
                    key,
                    &assignment.role,
                    &assignment.scope,
                ]);
                (id, assignment.clone())
            })
            .collect();
        prepared
            .rbac
            .sync_role_assignments(&identity.principal_id, &assignments)
            .await?;

        Ok(identity)
    }

    /// Deletes the identity and, first, the role assignments of its
    /// principal. A missing identity is not an error.
    async fn delete_identity(&self, name: &str) -> Result<()> {
        let prepared = self.prepared()?;
        let resource_group = &prepared.config.resource_group;

        let principal_id = match prepared.msi.get(resource_group, name).await {
            Ok(identity) => identity.principal_id,
            Err(super::CloudError::NotFound) => return Ok(()),
            Err(error) => return Err(azure_error("Get")(error)),
        };
        if !principal_id.is_empty() {
            prepared.rbac.delete_role_assignments(&principal_id).await?;
        }

        match prepared.msi.delete(resource_group, name).await {
            Ok(()) | Err(super::CloudError::NotFound) => {
                tracing::info!(identity = %name, "deleted managed identity");
                Ok(())
            }
            Err(error) => Err(azure_error("Delete")(error)),
        }
    }

    async fn apply_pod_identity(
        &self,
        resource: &WorkloadIdentity,
        spec: &WorkloadIdentityAzure,
        identity: &Identity,
    ) -> Result<()> {
        let cluster = self.context.cluster.as_ref();
        let resource_name = resource.name();
        let resource_namespace = resource.namespace().unwrap_or_default();
        let id = resource
            .status
            .as_ref()
            .map(|status| status.id.as_str())
            .unwrap_or_default();

        let overrides = spec.identity.clone().unwrap_or_default();
        let mut azure_identity = pod_identity_object(
            resource,
            "AzureIdentity",
            or_default(&resource.spec.name, &resource_name),
            &resource_namespace,
            &overrides.api_version,
            &overrides.kind,
            overrides.metadata.as_ref(),
        )?;
        if overrides
            .metadata
            .as_ref()
            .map_or(true, |metadata| metadata.annotations.is_empty())
        {
            azure_identity
                .object
                .annotations_mut()
                .insert(BEHAVIOR_ANNOTATION.to_string(), "namespaced".to_string());
        }
        let identity_type = overrides.spec.map_or(0, |spec| spec.type_);
        azure_identity.object.data = json!({
            "spec": {
                "type": identity_type,
                "resourceID": id,
                "clientID": identity.client_id,
            }
        });
        cluster
            .apply_dynamic(&azure_identity.resource, &azure_identity.object)
            .await?;

        let identity_name = azure_identity.object.name();
        let identity_namespace = azure_identity.object.namespace().unwrap_or_default();
        let overrides = spec.identity_binding.clone().unwrap_or_default();
        let mut binding = pod_identity_object(
            resource,
            "AzureIdentityBinding",
            &identity_name,
            &identity_namespace,
            &overrides.api_version,
            &overrides.kind,
            overrides.metadata.as_ref(),
        )?;
        let selector = overrides
            .spec
            .map(|spec| spec.selector)
            .filter(|selector| !selector.is_empty())
            .unwrap_or_else(|| identity_name.clone());
        binding.object.data = json!({
            "spec": {
                "azureIdentity": identity_name,
                "selector": selector,
            }
        });
        cluster.apply_dynamic(&binding.resource, &binding.object).await
    }

    async fn write_secret(&self, resource: &WorkloadIdentity, identity: &Identity) -> Result<()> {
        let target = match &resource.spec.write_to_secret_ref {
            Some(target) => target,
            None => return Ok(()),
        };
        let resource_name = resource.name();
        let resource_namespace = resource.namespace().unwrap_or_default();
        let values = template_values(identity);

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(or_default(&target.name, &resource_name).to_string()),
                namespace: Some(or_default(&target.namespace, &resource_namespace).to_string()),
                owner_references: Some(vec![controller_owner_reference(resource)?]),
                ..ObjectMeta::default()
            },
            data: Some(
                target
                    .template_data
                    .iter()
                    .map(|(key, template)| {
                        (
                            key.clone(),
                            ByteString(render_template(template, &values).into_bytes()),
                        )
                    })
                    .collect(),
            ),
            ..Secret::default()
        };
        self.context.cluster.apply_secret(&secret).await
    }
}

#[async_trait]
impl ProviderReconciler for IdentityReconciler {
    async fn prepare(&mut self, resource: &WorkloadIdentity) -> Result<()> {
        let properties = credentials::resolve(self.context.cluster.as_ref(), resource).await?;
        let config = AzureConfig::from_properties(properties.as_ref(), &process_env)?;
        let clients = self.context.backends.azure(&config)?;
        self.prepared = Some(Prepared {
            rbac: RbacClient::new(clients.rbac, &config.subscription_id, &config.resource_group),
            msi: clients.msi,
            config,
        });
        Ok(())
    }

    async fn reconcile(&mut self, resource: &mut WorkloadIdentity) -> Result<()> {
        let spec = resource
            .spec
            .azure
            .clone()
            .ok_or(Error::MissingProviderSpec(Provider::Azure))?;

        let previous = resource
            .status
            .as_ref()
            .map(|status| status.name.clone())
            .unwrap_or_default();
        let resource_name = resource.name();
        let name = or_default(&resource.spec.name, &resource_name);
        if !previous.is_empty() && previous != name {
            tracing::info!(%previous, identity = %name, "identity renamed, deleting previous identity");
            self.delete_identity(&previous).await?;
        }

        let identity = self.create_or_update_identity(resource, &spec).await?;
        let status = resource.status.get_or_insert_with(Default::default);
        status.id = identity.id.clone();
        status.name = identity.name.clone();
        if status.id.is_empty() {
            return Err(Error::Condition(Condition::waiting(
                "waiting for identity to be created",
            )));
        }

        self.apply_pod_identity(resource, &spec, &identity).await?;
        self.write_secret(resource, &identity).await
    }

    async fn finalize(&mut self, resource: &mut WorkloadIdentity) -> Result<()> {
        let resource_name = resource.name();
        self.delete_identity(or_default(&resource.spec.name, &resource_name))
            .await
    }
}
