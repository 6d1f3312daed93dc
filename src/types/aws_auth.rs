use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{Conditioned, ConditionedStatus};

/// AWSAuthSpec defines the desired state of AWSAuth
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "identity-manager.io",
    version = "v1alpha1",
    kind = "AWSAuth",
    namespaced
)]
#[kube(status = "AWSAuthStatus")]
#[serde(rename_all = "camelCase")]
pub struct AWSAuthSpec {
    /// IAM roles mapped to Kubernetes users and groups.
    #[serde(default)]
    pub map_roles: Vec<MapRoleItem>,

    /// IAM users mapped to Kubernetes users and groups.
    #[serde(default)]
    pub map_users: Vec<MapUserItem>,
}

/// One entry of the `mapRoles` list in the aws-auth ConfigMap.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct MapRoleItem {
    /// Object the entry was collected from. Entries without a source were
    /// not written by this controller and are always kept.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    /// The ARN of the IAM role to add
    #[serde(default)]
    pub rolearn: String,

    /// The user name within Kubernetes to map to the IAM role
    #[serde(default)]
    pub username: String,

    /// A list of groups within Kubernetes to which the role is mapped
    #[serde(default)]
    pub groups: Vec<String>,
}

impl MapRoleItem {
    pub fn is_valid(&self) -> bool {
        !self.rolearn.is_empty() && !self.username.is_empty() && !self.groups.is_empty()
    }
}

/// One entry of the `mapUsers` list in the aws-auth ConfigMap.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct MapUserItem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    /// The ARN of the IAM user to add
    #[serde(default)]
    pub userarn: String,

    /// The user name within Kubernetes to map to the IAM user
    #[serde(default)]
    pub username: String,

    /// A list of groups within Kubernetes to which the user is mapped to
    #[serde(default)]
    pub groups: Vec<String>,
}

impl MapUserItem {
    pub fn is_valid(&self) -> bool {
        !self.userarn.is_empty() && !self.username.is_empty() && !self.groups.is_empty()
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
pub struct AWSAuthStatus {
    #[serde(flatten)]
    pub conditioned: ConditionedStatus,
}

impl Conditioned for AWSAuthStatus {
    fn conditioned_status(&self) -> &ConditionedStatus {
        &self.conditioned
    }

    fn conditioned_status_mut(&mut self) -> &mut ConditionedStatus {
        &mut self.conditioned
    }
}
