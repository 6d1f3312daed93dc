use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::providers::CloudError;
use crate::sync::find_sync_steps;
use crate::types::Provider;

pub const WORKLOAD_IDENTITY_USER: &str = "roles/iam.workloadIdentityUser";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceAccount {
    pub email: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Binding {
    pub role: String,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IamPolicy {
    pub bindings: Vec<Binding>,
    /// Concurrency token, sent back unchanged.
    pub etag: String,
}

impl IamPolicy {
    fn roles_of(&self, member: &str) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|binding| binding.members.iter().any(|m| m == member))
            .map(|binding| binding.role.clone())
            .collect()
    }

    fn add(&mut self, member: &str, role: &str) {
        match self.bindings.iter_mut().find(|binding| binding.role == role) {
            Some(binding) => binding.members.push(member.to_string()),
            None => self.bindings.push(Binding {
                role: role.to_string(),
                members: vec![member.to_string()],
            }),
        }
    }

    fn remove(&mut self, member: &str, role: &str) {
        for binding in self.bindings.iter_mut().filter(|binding| binding.role == role) {
            binding.members.retain(|m| m != member);
        }
        self.bindings.retain(|binding| !binding.members.is_empty());
    }

    /// Grants `member` exactly `roles`. Returns whether the policy changed.
    pub fn ensure_member_roles(&mut self, member: &str, roles: &[&str]) -> bool {
        let steps = find_sync_steps(
            self.roles_of(member),
            roles.iter().map(|role| role.to_string()),
        );
        for role in &steps.add {
            self.add(member, role);
        }
        for role in &steps.delete {
            self.remove(member, role);
        }
        !steps.is_empty()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait GcpIamApi: Send + Sync {
    /// `name` is `projects/{project}/serviceAccounts/{email}`.
    async fn get_service_account(&self, name: &str) -> Result<ServiceAccount, CloudError>;
    async fn create_service_account(
        &self,
        project: &str,
        account_id: &str,
        display_name: &str,
        description: &str,
    ) -> Result<ServiceAccount, CloudError>;
    async fn update_service_account(
        &self,
        name: &str,
        display_name: &str,
        description: &str,
    ) -> Result<(), CloudError>;
    async fn delete_service_account(&self, name: &str) -> Result<(), CloudError>;

    async fn get_service_account_policy(&self, name: &str) -> Result<IamPolicy, CloudError>;
    async fn set_service_account_policy(&self, name: &str, policy: &IamPolicy) -> Result<(), CloudError>;

    /// `resource` is `projects/{project}`.
    async fn get_project_policy(&self, resource: &str) -> Result<IamPolicy, CloudError>;
    async fn set_project_policy(&self, resource: &str, policy: &IamPolicy) -> Result<(), CloudError>;
}

fn gcp_error(operation: &'static str) -> impl FnOnce(CloudError) -> Error {
    Error::provider(Provider::Gcp, operation)
}

/// Desired service account and who may use it.
#[derive(Clone, Debug)]
pub struct DesiredAccount<'a> {
    pub account_id: &'a str,
    pub display_name: &'a str,
    pub description: &'a str,
    /// Kubernetes ServiceAccounts as `(namespace, name)`.
    pub workload_members: Vec<(String, String)>,
    pub roles: &'a [String],
}

pub struct IamClient {
    api: Arc<dyn GcpIamApi>,
    project: String,
}

impl IamClient {
    pub fn new(api: Arc<dyn GcpIamApi>, project: &str) -> Self {
        Self {
            api,
            project: project.to_string(),
        }
    }

    pub fn email(&self, account_id: &str) -> String {
        format!("{}@{}.iam.gserviceaccount.com", account_id, self.project)
    }

    fn resource_name(&self, email: &str) -> String {
        format!("projects/{}/serviceAccounts/{}", self.project, email)
    }

    /// Converges the service account, its workload identity bindings and its
    /// project roles. Returns the account email.
    pub async fn ensure_service_account(&self, desired: &DesiredAccount<'_>) -> Result<String> {
        let email = self.email(desired.account_id);
        let name = self.resource_name(&email);

        match self.api.get_service_account(&name).await {
            Err(CloudError::NotFound) => {
                self.api
                    .create_service_account(
                        &self.project,
                        desired.account_id,
                        desired.display_name,
                        desired.description,
                    )
                    .await
                    .map_err(gcp_error("CreateServiceAccount"))?;
                tracing::info!(%email, "created service account");
            }
            Err(error) => return Err(gcp_error("GetServiceAccount")(error)),
            Ok(existing) => {
                if existing.display_name != desired.display_name
                    || existing.description != desired.description
                {
                    self.api
                        .update_service_account(&name, desired.display_name, desired.description)
                        .await
                        .map_err(gcp_error("UpdateServiceAccount"))?;
                }
                self.ensure_workload_bindings(&name, &desired.workload_members)
                    .await?;
            }
        }

        self.ensure_project_roles(&email, desired.roles).await?;
        Ok(email)
    }

    async fn ensure_workload_bindings(&self, name: &str, members: &[(String, String)]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut policy = self
            .api
            .get_service_account_policy(name)
            .await
            .map_err(gcp_error("GetIamPolicy"))?;
        let mut changed = false;
        for (namespace, service_account) in members {
            let member = format!(
                "serviceAccount:{}.svc.id.goog[{}/{}]",
                self.project, namespace, service_account
            );
            changed |= policy.ensure_member_roles(&member, &[WORKLOAD_IDENTITY_USER]);
        }
        if changed {
            self.api
                .set_service_account_policy(name, &policy)
                .await
                .map_err(gcp_error("SetIamPolicy"))?;
        }
        Ok(())
    }

    async fn ensure_project_roles(&self, email: &str, roles: &[String]) -> Result<()> {
        let resource = format!("projects/{}", self.project);
        let mut policy = self
            .api
            .get_project_policy(&resource)
            .await
            .map_err(gcp_error("GetProjectIamPolicy"))?;
        let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
        if policy.ensure_member_roles(&format!("serviceAccount:{}", email), &roles) {
            self.api
                .set_project_policy(&resource, &policy)
                .await
                .map_err(gcp_error("SetProjectIamPolicy"))?;
        }
        Ok(())
    }

    /// Deletes the account. A missing account is not an error.
    pub async fn delete_service_account(&self, email: &str) -> Result<()> {
        if email.is_empty() {
            return Ok(());
        }
        match self.api.delete_service_account(&self.resource_name(email)).await {
            Ok(()) | Err(CloudError::NotFound) => Ok(()),
            Err(error) => Err(gcp_error("DeleteServiceAccount")(error)),
        }
    }
}
