//! IAM role convergence on top of the [`IamApi`] store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use percent_encoding::percent_decode_str;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::providers::CloudError;
use crate::sync::find_sync_steps;
use crate::types::{Provider, WorkloadIdentityAws};

const MAX_ROLE_NAME_LEN: usize = 64;
const MAX_POLICY_NAME_LEN: usize = 128;

/// Remote view of an IAM role.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Role {
    pub name: String,
    pub arn: String,
    pub description: String,
    pub max_session_duration: i64,
    /// URL encoded, as returned by IAM.
    pub assume_role_policy_document: String,
    pub permissions_boundary_arn: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateRole {
    pub name: String,
    pub path: Option<String>,
    pub description: Option<String>,
    pub assume_role_policy_document: String,
    pub max_session_duration: Option<i64>,
    pub permissions_boundary_arn: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamApi: Send + Sync {
    async fn get_role(&self, role: &str) -> Result<Role, CloudError>;
    async fn create_role(&self, input: &CreateRole) -> Result<Role, CloudError>;
    async fn delete_role(&self, role: &str) -> Result<(), CloudError>;
    async fn update_max_session_duration(&self, role: &str, seconds: i64) -> Result<(), CloudError>;
    async fn update_role_description(&self, role: &str, description: &str) -> Result<(), CloudError>;
    async fn update_assume_role_policy(&self, role: &str, document: &str) -> Result<(), CloudError>;

    /// Names of the role's inline policies, across all pages.
    async fn list_role_policies(&self, role: &str) -> Result<Vec<String>, CloudError>;
    async fn put_role_policy(&self, role: &str, policy: &str, document: &str) -> Result<(), CloudError>;
    async fn delete_role_policy(&self, role: &str, policy: &str) -> Result<(), CloudError>;

    /// ARNs of the managed policies attached to the role, across all pages.
    async fn list_attached_role_policies(&self, role: &str) -> Result<Vec<String>, CloudError>;
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), CloudError>;
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<(), CloudError>;

    async fn put_role_permissions_boundary(&self, role: &str, policy_arn: &str) -> Result<(), CloudError>;
    async fn delete_role_permissions_boundary(&self, role: &str) -> Result<(), CloudError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StsApi: Send + Sync {
    /// Account id of the calling identity.
    async fn caller_account(&self) -> Result<String, CloudError>;
}

/// Name and ARN of a converged role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleStatus {
    pub name: String,
    pub arn: String,
}

/// Role settings the reconciler wants IAM to hold.
#[derive(Clone, Debug)]
pub struct DesiredRole<'a> {
    pub name: String,
    pub description: &'a str,
    pub spec: &'a WorkloadIdentityAws,
    pub permissions_boundary_arn: &'a str,
    pub tags: BTreeMap<String, String>,
}

pub struct IamClient {
    iam: Arc<dyn IamApi>,
    sts: Arc<dyn StsApi>,
    account_id: Option<String>,
}

fn aws_error(operation: &'static str) -> impl FnOnce(CloudError) -> Error {
    move |source| Error::provider(Provider::Aws, operation)(normalize(source))
}

/// Shortens provider messages: access denied errors collapse to their code
/// and the trailing request id is dropped.
fn normalize(error: CloudError) -> CloudError {
    match error {
        CloudError::Api { code, message } => {
            if code.starts_with("AccessDenied") || message.starts_with("AccessDenied") {
                return CloudError::api(code, "AccessDenied");
            }
            let message = match message.find("request id:") {
                Some(index) => message[..index].trim_end().trim_end_matches(',').to_string(),
                None => message,
            };
            CloudError::Api { code, message }
        }
        other => other,
    }
}

/// Cuts `name` to at most `max` bytes on a character boundary.
pub(crate) fn truncate(mut name: String, max: usize) -> String {
    if name.len() > max {
        let mut end = max;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// IAM role name for a resource.
///
/// The declared name wins over `<namespace>-<name>`; a global prefix always
/// prefixes `<namespace>-<name>`; a declared name ending in `-` is used as a
/// prefix the same way.
pub fn role_name(declared: &str, namespace: &str, name: &str, name_prefix: &str) -> String {
    let internal = format!("{}-{}", namespace, name);
    let mut role = if declared.is_empty() {
        internal.clone()
    } else {
        declared.to_string()
    };
    if !name_prefix.is_empty() {
        role = format!("{}{}", name_prefix, internal);
    }
    if role.ends_with('-') {
        role.push_str(&internal);
    }
    truncate(role, MAX_ROLE_NAME_LEN)
}

/// Remote inline policy names keyed to the declared policy names. The
/// content hash makes a changed document a new policy.
pub fn inline_policy_names(policies: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    policies
        .iter()
        .map(|(name, document)| {
            let mut remote = name.clone();
            if remote.len() < MAX_POLICY_NAME_LEN {
                remote = format!("{}-{:x}", remote, Md5::digest(document.as_bytes()));
            }
            (truncate(remote, MAX_POLICY_NAME_LEN), name.clone())
        })
        .collect()
}

/// Compacts JSON for comparison, leaving invalid documents untouched.
pub(crate) fn compact_json(document: &str) -> String {
    serde_json::from_str::<serde_json::Value>(document)
        .ok()
        .and_then(|value| serde_json::to_string(&value).ok())
        .unwrap_or_else(|| document.to_string())
}

fn is_arn(policy: &str) -> bool {
    policy.contains("arn:aws:iam")
}

impl IamClient {
    pub fn new(iam: Arc<dyn IamApi>, sts: Arc<dyn StsApi>) -> Self {
        Self {
            iam,
            sts,
            account_id: None,
        }
    }

    /// Creates or syncs the desired role. A role recorded under another name
    /// is deleted first.
    pub async fn create_or_update(
        &mut self,
        previous_name: &str,
        desired: &DesiredRole<'_>,
    ) -> Result<RoleStatus> {
        if !previous_name.is_empty() && previous_name != desired.name {
            tracing::info!(previous = %previous_name, role = %desired.name, "role renamed, deleting previous role");
            self.delete(previous_name).await?;
        }

        match self.find_role(&desired.name).await? {
            Some(role) => self.sync(role, desired).await,
            None => self.create(desired).await,
        }
    }

    /// Deletes the role and its policies. A missing role is not an error.
    pub async fn delete(&self, role_name: &str) -> Result<()> {
        if role_name.is_empty() || self.find_role(role_name).await?.is_none() {
            return Ok(());
        }

        for policy in self
            .iam
            .list_role_policies(role_name)
            .await
            .map_err(aws_error("ListRolePolicies"))?
        {
            self.delete_inline_policy(role_name, &policy).await?;
        }
        for policy_arn in self
            .iam
            .list_attached_role_policies(role_name)
            .await
            .map_err(aws_error("ListAttachedRolePolicies"))?
        {
            self.iam
                .detach_role_policy(role_name, &policy_arn)
                .await
                .map_err(aws_error("DetachRolePolicy"))?;
        }
        match self.iam.delete_role(role_name).await {
            Ok(()) | Err(CloudError::NotFound) => Ok(()),
            Err(error) => Err(aws_error("DeleteRole")(error)),
        }
    }

    async fn find_role(&self, role_name: &str) -> Result<Option<Role>> {
        match self.iam.get_role(role_name).await {
            Ok(role) => Ok(Some(role)),
            Err(CloudError::NotFound) => Ok(None),
            Err(error) => Err(aws_error("GetRole")(error)),
        }
    }

    async fn create(&mut self, desired: &DesiredRole<'_>) -> Result<RoleStatus> {
        let spec = desired.spec;
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        let input = CreateRole {
            name: desired.name.clone(),
            path: non_empty(&spec.path),
            description: non_empty(desired.description),
            assume_role_policy_document: spec.assume_role_policy.clone(),
            max_session_duration: (spec.max_session_duration > 0)
                .then(|| spec.max_session_duration),
            permissions_boundary_arn: non_empty(desired.permissions_boundary_arn),
            tags: desired.tags.clone(),
        };
        let role = self
            .iam
            .create_role(&input)
            .await
            .map_err(aws_error("CreateRole"))?;
        tracing::info!(role = %role.name, arn = %role.arn, "created role");

        for (remote, declared) in inline_policy_names(&spec.inline_policies) {
            self.put_inline_policy(&desired.name, &remote, &spec.inline_policies[&declared])
                .await?;
        }
        for policy in &spec.policies {
            let policy_arn = self.policy_arn(policy).await?;
            self.iam
                .attach_role_policy(&desired.name, &policy_arn)
                .await
                .map_err(aws_error("AttachRolePolicy"))?;
        }

        Ok(RoleStatus {
            name: role.name,
            arn: role.arn,
        })
    }

    async fn sync(&mut self, role: Role, desired: &DesiredRole<'_>) -> Result<RoleStatus> {
        let spec = desired.spec;

        let existing_trust = percent_decode_str(&role.assume_role_policy_document)
            .decode_utf8()
            .map_err(Error::InvalidPolicyDocument)?;
        if compact_json(&existing_trust) != compact_json(&spec.assume_role_policy) {
            self.iam
                .update_assume_role_policy(&role.name, &spec.assume_role_policy)
                .await
                .map_err(aws_error("UpdateAssumeRolePolicy"))?;
        }

        self.sync_inline_policies(&role.name, &spec.inline_policies)
            .await?;
        self.sync_attached_policies(&role.name, &spec.policies)
            .await?;

        if spec.max_session_duration > 0 && role.max_session_duration != spec.max_session_duration {
            self.iam
                .update_max_session_duration(&role.name, spec.max_session_duration)
                .await
                .map_err(aws_error("UpdateRole"))?;
        }

        if !desired.description.is_empty() && role.description != desired.description {
            self.iam
                .update_role_description(&role.name, desired.description)
                .await
                .map_err(aws_error("UpdateRoleDescription"))?;
        }

        self.sync_permissions_boundary(&role, desired.permissions_boundary_arn)
            .await?;

        Ok(RoleStatus {
            name: role.name,
            arn: role.arn,
        })
    }

    async fn sync_permissions_boundary(&self, role: &Role, desired: &str) -> Result<()> {
        match (desired.is_empty(), role.permissions_boundary_arn.as_deref()) {
            (false, Some(current)) if current == desired => Ok(()),
            (false, _) => self
                .iam
                .put_role_permissions_boundary(&role.name, desired)
                .await
                .map_err(aws_error("PutRolePermissionsBoundary")),
            (true, Some(_)) => self
                .iam
                .delete_role_permissions_boundary(&role.name)
                .await
                .map_err(aws_error("DeleteRolePermissionsBoundary")),
            (true, None) => Ok(()),
        }
    }

    async fn sync_inline_policies(
        &self,
        role_name: &str,
        policies: &BTreeMap<String, String>,
    ) -> Result<()> {
        let existing = self
            .iam
            .list_role_policies(role_name)
            .await
            .map_err(aws_error("ListRolePolicies"))?;
        let desired = inline_policy_names(policies);
        let steps = find_sync_steps(existing, desired.keys().cloned());

        for remote in &steps.add {
            self.put_inline_policy(role_name, remote, &policies[&desired[remote]])
                .await?;
        }
        for remote in &steps.delete {
            self.delete_inline_policy(role_name, remote).await?;
        }
        Ok(())
    }

    async fn sync_attached_policies(&mut self, role_name: &str, policies: &[String]) -> Result<()> {
        let attached = self
            .iam
            .list_attached_role_policies(role_name)
            .await
            .map_err(aws_error("ListAttachedRolePolicies"))?;
        let mut desired = Vec::with_capacity(policies.len());
        for policy in policies {
            desired.push(self.policy_arn(policy).await?);
        }
        let steps = find_sync_steps(attached, desired);

        for policy_arn in &steps.add {
            self.iam
                .attach_role_policy(role_name, policy_arn)
                .await
                .map_err(aws_error("AttachRolePolicy"))?;
        }
        for policy_arn in &steps.delete {
            self.iam
                .detach_role_policy(role_name, policy_arn)
                .await
                .map_err(aws_error("DetachRolePolicy"))?;
        }
        Ok(())
    }

    async fn put_inline_policy(&self, role_name: &str, policy: &str, document: &str) -> Result<()> {
        self.iam
            .put_role_policy(role_name, policy, document)
            .await
            .map_err(aws_error("PutRolePolicy"))
    }

    async fn delete_inline_policy(&self, role_name: &str, policy: &str) -> Result<()> {
        match self.iam.delete_role_policy(role_name, policy).await {
            Ok(()) | Err(CloudError::NotFound) => Ok(()),
            Err(error) => Err(aws_error("DeleteRolePolicy")(error)),
        }
    }

    /// Expands a managed policy name to its ARN in the caller's account.
    async fn policy_arn(&mut self, policy: &str) -> Result<String> {
        if is_arn(policy) {
            return Ok(policy.to_string());
        }
        let account_id = match &self.account_id {
            Some(account_id) => account_id.clone(),
            None => {
                let account_id = self
                    .sts
                    .caller_account()
                    .await
                    .map_err(aws_error("GetCallerIdentity"))?;
                self.account_id = Some(account_id.clone());
                account_id
            }
        };
        Ok(format!("arn:aws:iam::{}:policy/{}", account_id, policy))
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;

    #[test]
    fn role_name_resolution() {
        assert_eq!(
            role_name("S3InventoryRole", "dev", "SomeInternalName", ""),
            "S3InventoryRole"
        );
        assert_eq!(
            role_name("", "dev", "SomeInternalName", ""),
            "dev-SomeInternalName"
        );
        assert_eq!(
            role_name("S3InventoryRole-", "dev", "SomeInternalName", ""),
            "S3InventoryRole-dev-SomeInternalName"
        );
        assert_eq!(
            role_name("S3InventoryRole", "dev", "SomeInternalName", "eks-"),
            "eks-dev-SomeInternalName"
        );
        assert_eq!(role_name(&"r".repeat(80), "dev", "x", "").len(), 64);
    }

    #[test]
    fn inline_policy_names_hash_content() {
        let long = "S3ReadPolicy-eks-dev-wlk4-B1267BBA7830580562E3AD71DFC27CE7-2E3AD71DFC27CE7B1267BBA783058056-0562E3AD71DFC27CE7-2E3AD71DF-BA7830580562E3AD71DF";
        let policies = BTreeMap::from([
            ("S3ReadPolicy".to_string(), r#"{"policy":"arn:policy"}"#.to_string()),
            (long.to_string(), r#"{"policy":"arn:policy"}"#.to_string()),
        ]);

        let names = inline_policy_names(&policies);

        assert_eq!(
            names["S3ReadPolicy-3ceca7bf0f96b81a74f9af5ac4f60012"],
            "S3ReadPolicy"
        );
        assert_eq!(names[&long[..128]], long);
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn compact_json_ignores_whitespace() {
        assert_eq!(
            compact_json("{ \"Version\": \"2012-10-17\",\n \"Statement\": [] }"),
            compact_json(r#"{"Version":"2012-10-17","Statement":[]}"#)
        );
        assert_eq!(compact_json("not json"), "not json");
    }

    #[test]
    fn normalizes_provider_messages() {
        assert_eq!(
            normalize(CloudError::api(
                "AccessDenied",
                "AccessDenied: User is not authorized to perform iam:GetRole"
            )),
            CloudError::api("AccessDenied", "AccessDenied")
        );
        assert_eq!(
            normalize(CloudError::api(
                "MalformedPolicyDocument",
                "MalformedPolicyDocument: bad principal status code: 400, request id: abc-123"
            )),
            CloudError::api(
                "MalformedPolicyDocument",
                "MalformedPolicyDocument: bad principal status code: 400"
            )
        );
    }

    #[tokio::test]
    async fn policy_arn_caches_account_id() {
        let iam = MockIamApi::new();
        let mut sts = MockStsApi::new();
        sts.expect_caller_account()
            .times(1)
            .returning(|| Ok("12345678".to_string()));
        let mut client = IamClient::new(Arc::new(iam), Arc::new(sts));

        assert_eq!(
            client.policy_arn("IAMReadOnlyAccess").await.unwrap(),
            "arn:aws:iam::12345678:policy/IAMReadOnlyAccess"
        );
        assert_eq!(
            client.policy_arn("S3ReadOnly").await.unwrap(),
            "arn:aws:iam::12345678:policy/S3ReadOnly"
        );
        assert_eq!(
            client
                .policy_arn("arn:aws:iam::aws:policy/AWSDirectConnectReadOnlyAccess")
                .await
                .unwrap(),
            "arn:aws:iam::aws:policy/AWSDirectConnectReadOnlyAccess"
        );
    }

    fn existing_role(boundary: Option<&str>) -> Role {
        Role {
            name: "ccs-v1".into(),
            arn: "arn:aws:iam::12345678:role/ccs-v1".into(),
            assume_role_policy_document: "%7B%7D".into(),
            permissions_boundary_arn: boundary.map(str::to_string),
            ..Role::default()
        }
    }

    fn quiet_iam() -> MockIamApi {
        let mut iam = MockIamApi::new();
        iam.expect_list_role_policies().returning(|_| Ok(vec![]));
        iam.expect_list_attached_role_policies()
            .returning(|_| Ok(vec![]));
        iam
    }

    fn spec() -> WorkloadIdentityAws {
        WorkloadIdentityAws {
            assume_role_policy: "{}".into(),
            ..WorkloadIdentityAws::default()
        }
    }

    #[tokio::test]
    async fn removes_boundary_no_longer_wanted() {
        let mut iam = quiet_iam();
        iam.expect_delete_role_permissions_boundary()
            .with(eq("ccs-v1"))
            .times(1)
            .returning(|_| Ok(()));
        let mut client = IamClient::new(Arc::new(iam), Arc::new(MockStsApi::new()));
        let spec = spec();
        let desired = DesiredRole {
            name: "ccs-v1".into(),
            description: "",
            spec: &spec,
            permissions_boundary_arn: "",
            tags: BTreeMap::new(),
        };

        client
            .sync(existing_role(Some("arn:aws:iam::12345678:policy/boundary")), &desired)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn replaces_different_boundary() {
        let mut iam = quiet_iam();
        iam.expect_put_role_permissions_boundary()
            .with(eq("ccs-v1"), eq("arn:aws:iam::12345678:policy/new"))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut client = IamClient::new(Arc::new(iam), Arc::new(MockStsApi::new()));
        let spec = spec();
        let desired = DesiredRole {
            name: "ccs-v1".into(),
            description: "",
            spec: &spec,
            permissions_boundary_arn: "arn:aws:iam::12345678:policy/new",
            tags: BTreeMap::new(),
        };

        client
            .sync(existing_role(Some("arn:aws:iam::12345678:policy/old")), &desired)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_of_missing_role_is_a_no_op() {
        let mut iam = MockIamApi::new();
        iam.expect_get_role()
            .returning(|_| Err(CloudError::NotFound));
        let client = IamClient::new(Arc::new(iam), Arc::new(MockStsApi::new()));

        client.delete("ccs-v1").await.unwrap();
    }

    #[tokio::test]
    async fn lookup_failures_are_not_treated_as_missing() {
        let mut iam = MockIamApi::new();
        iam.expect_get_role()
            .returning(|_| Err(CloudError::api("Throttling", "Rate exceeded")));
        iam.expect_create_role().never();
        let mut client = IamClient::new(Arc::new(iam), Arc::new(MockStsApi::new()));
        let spec = spec();
        let desired = DesiredRole {
            name: "ccs-v1".into(),
            description: "",
            spec: &spec,
            permissions_boundary_arn: "",
            tags: BTreeMap::new(),
        };

        let error = client.create_or_update("", &desired).await.unwrap_err();

        assert_eq!(error.to_string(), "GetRole: Rate exceeded");
    }
}
