use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{Conditioned, ConditionedStatus};

/// WorkloadIdentitySpec defines the desired state of WorkloadIdentity
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, PartialEq)]
#[kube(
    group = "identity-manager.io",
    version = "v1alpha1",
    kind = "WorkloadIdentity",
    shortname = "wi",
    namespaced
)]
#[kube(status = "WorkloadIdentityStatus")]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentitySpec {
    /// Name of the cloud identity. Defaults to a name derived from the
    /// resource. A trailing `-` turns it into a prefix.
    #[serde(default)]
    pub name: String,

    /// Display name of the cloud identity, where the provider supports one.
    #[serde(default)]
    pub display_name: String,

    /// Description of the cloud identity.
    #[serde(default)]
    pub description: String,

    /// Credentials used to manage the cloud identity. When absent the
    /// controller's ambient credentials are used.
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Cloud provider that owns the identity.
    pub provider: Provider,

    #[serde(default)]
    pub aws: Option<WorkloadIdentityAws>,

    #[serde(default)]
    pub azure: Option<WorkloadIdentityAzure>,

    #[serde(default)]
    pub gcp: Option<WorkloadIdentityGcp>,

    /// Secret to render identity details into.
    #[serde(default)]
    pub write_to_secret_ref: Option<WriteToSecretRef>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "Azure")]
    Azure,
    #[serde(rename = "GCP")]
    Gcp,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::Aws => "AWS",
            Provider::Azure => "Azure",
            Provider::Gcp => "GCP",
        })
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialsSource {
    Secret,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Where the credentials come from.
    #[serde(default)]
    pub source: Option<CredentialsSource>,

    /// Secret holding the credentials, required when source is Secret.
    #[serde(default)]
    pub secret_ref: Option<SecretRef>,

    /// Extra properties, overriding keys read from the secret.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct SecretRef {
    /// Defaults to the resource name.
    #[serde(default)]
    pub name: String,

    /// Defaults to the resource namespace.
    #[serde(default)]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteToSecretRef {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    /// Secret keys mapped to templates. Placeholders look like
    /// `<(identity.clientID)`.
    pub template_data: BTreeMap<String, String>,
}

/// WorkloadIdentityAws is the provider spec for AWS IAM roles
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityAws {
    /// Path of the role.
    #[serde(default)]
    pub path: String,

    /// Maximum session duration of the role, in seconds.
    #[serde(default)]
    pub max_session_duration: i64,

    /// Trust relationship of the role.
    pub assume_role_policy: String,

    /// Inline policy documents keyed by policy name.
    #[serde(default)]
    pub inline_policies: BTreeMap<String, String>,

    /// Managed policies to attach, as names or ARNs.
    #[serde(default)]
    pub policies: Vec<String>,

    /// Permissions boundary of the role. Defaults to the controller option.
    #[serde(default)]
    pub permissions_boundary_arn: String,

    #[serde(default)]
    pub service_accounts: Vec<ServiceAccountSpec>,

    /// Pods restarted when they do not reference the role yet.
    #[serde(default)]
    pub pods: Vec<PodSelector>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    /// Defaults to the resource namespace.
    #[serde(default)]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceAccountAction {
    Create,
    Update,
    #[serde(rename = "")]
    None,
}

impl Default for ServiceAccountAction {
    fn default() -> Self {
        ServiceAccountAction::None
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSpec {
    /// Create a new ServiceAccount or update an existing one.
    #[serde(default)]
    pub action: ServiceAccountAction,

    /// Defaults to the resource name.
    #[serde(default)]
    pub name: String,

    /// Defaults to the resource namespace.
    #[serde(default)]
    pub namespace: String,

    /// Extra annotations put on the ServiceAccount.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// WorkloadIdentityAzure is the provider spec for Azure managed identities
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityAzure {
    #[serde(default)]
    pub role_definitions: Vec<RoleDefinition>,

    /// Role assignments keyed by a stable local name.
    #[serde(default)]
    pub role_assignments: BTreeMap<String, RoleAssignment>,

    #[serde(default)]
    pub identity: Option<AzureIdentity>,

    #[serde(default)]
    pub identity_binding: Option<AzureIdentityBinding>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleDefinition {
    /// Local id, used to derive the role definition UUID.
    pub id: String,
    pub role_name: String,
    #[serde(default)]
    pub role_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignable_scopes: Vec<String>,
    pub permissions: Vec<RolePermission>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolePermission {
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub not_actions: Vec<String>,
    #[serde(default)]
    pub data_actions: Vec<String>,
    #[serde(default)]
    pub not_data_actions: Vec<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct RoleAssignment {
    /// Role name, role definition UUID or full role definition id.
    pub role: String,

    /// Defaults to the configured resource group.
    #[serde(default)]
    pub scope: String,
}

/// Overrides for the aad-pod-identity AzureIdentity object.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureIdentity {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Option<ObjectOverrides>,
    #[serde(default)]
    pub spec: Option<AzureIdentitySpec>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct AzureIdentitySpec {
    #[serde(default, rename = "type")]
    pub type_: i32,
}

/// Overrides for the aad-pod-identity AzureIdentityBinding object.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureIdentityBinding {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Option<ObjectOverrides>,
    #[serde(default)]
    pub spec: Option<AzureIdentityBindingSpec>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct AzureIdentityBindingSpec {
    #[serde(default)]
    pub selector: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct ObjectOverrides {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// WorkloadIdentityGcp is the provider spec for GCP service accounts
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityGcp {
    /// Kubernetes ServiceAccounts allowed to impersonate the GCP service
    /// account.
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccountSpec>,

    /// Project roles granted to the GCP service account.
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityStatus {
    #[serde(flatten)]
    pub conditioned: ConditionedStatus,

    /// Provider id of the identity (role ARN, resource id or account email).
    #[serde(default)]
    pub id: String,

    /// Provider name of the identity.
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ManagedObject>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_resources: Vec<ExternalResource>,
}

impl Conditioned for WorkloadIdentityStatus {
    fn conditioned_status(&self) -> &ConditionedStatus {
        &self.conditioned
    }

    fn conditioned_status_mut(&mut self) -> &mut ConditionedStatus {
        &mut self.conditioned
    }
}

/// Kubernetes object managed on behalf of the identity.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct ExternalResource {
    pub id: String,
    #[serde(default, rename = "type")]
    pub type_: String,
}
