//! Managed identities and role based access control.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::providers::CloudError;
use crate::sync::find_sync_steps;
use crate::types::{RoleAssignment, RolePermission};

/// User assigned managed identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub type_: String,
    pub location: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub tenant_id: String,
    pub principal_id: String,
    pub client_id: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleDefinitionProperties {
    pub role_name: String,
    pub role_type: String,
    pub description: String,
    pub assignable_scopes: Vec<String>,
    pub permissions: Vec<RolePermission>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleAssignmentRecord {
    /// Fully qualified id, used for deletion.
    pub id: String,
    /// UUID the assignment was created under.
    pub name: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MsiApi: Send + Sync {
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Identity, CloudError>;

    async fn get(&self, resource_group: &str, name: &str) -> Result<Identity, CloudError>;

    async fn delete(&self, resource_group: &str, name: &str) -> Result<(), CloudError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacApi: Send + Sync {
    async fn create_or_update_role_definition(
        &self,
        scope: &str,
        id: &str,
        properties: &RoleDefinitionProperties,
    ) -> Result<(), CloudError>;

    /// Ids of the role definitions named `role_name` visible at `scope`.
    async fn list_role_definitions(&self, scope: &str, role_name: &str) -> Result<Vec<String>, CloudError>;

    async fn list_role_assignments(&self, principal_id: &str) -> Result<Vec<RoleAssignmentRecord>, CloudError>;

    async fn create_role_assignment(
        &self,
        scope: &str,
        name: &str,
        principal_id: &str,
        role_definition_id: &str,
    ) -> Result<String, CloudError>;

    async fn delete_role_assignment(&self, id: &str) -> Result<(), CloudError>;
}

/// Name based UUID (v3, nil namespace) of the `/` joined parts.
pub fn stable_id(parts: &[&str]) -> String {
    Uuid::new_v3(&Uuid::nil(), parts.join("/").as_bytes()).to_string()
}

/// Lowercase, hyphenated UUID of version 1 to 5.
fn is_role_definition_uuid(value: &str) -> bool {
    match Uuid::parse_str(value) {
        Ok(uuid) => {
            uuid.hyphenated().to_string() == value
                && matches!(uuid.get_version_num(), 1..=5)
        }
        Err(_) => false,
    }
}

/// Role definitions and assignments within one subscription.
pub struct RbacClient {
    api: Arc<dyn RbacApi>,
    subscription_id: String,
    resource_group: String,
}

fn rbac_error(operation: &'static str) -> impl FnOnce(CloudError) -> Error {
    Error::provider(crate::types::Provider::Azure, operation)
}

impl RbacClient {
    pub fn new(api: Arc<dyn RbacApi>, subscription_id: &str, resource_group: &str) -> Self {
        Self {
            api,
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
        }
    }

    /// Expands a scope to a resource id. Empty scopes mean the configured
    /// resource group; `name@dnszones` addresses a DNS zone in it.
    pub fn scope(&self, scope: &str) -> Result<String> {
        if scope.is_empty() {
            return Ok(format!(
                "/subscriptions/{}/resourceGroups/{}",
                self.subscription_id, self.resource_group
            ));
        }
        if scope.starts_with('/') {
            return Ok(scope.to_string());
        }

        let mut id = String::new();
        if !scope.starts_with("/subscriptions/") {
            id.push_str("/subscriptions/");
            id.push_str(&self.subscription_id);
        }
        if !scope.contains("/resourceGroups/") {
            id.push_str("/resourceGroups/");
            id.push_str(&self.resource_group);
        }
        id.push('/');
        match scope.split_once('@') {
            Some((name, "dnszones")) => {
                id.push_str("providers/Microsoft.Network/dnszones/");
                id.push_str(name);
            }
            Some((_, alias)) => return Err(Error::UnsupportedScopeAlias(alias.to_string())),
            None => id.push_str(scope),
        }
        Ok(id)
    }

    /// Resolves a role given as full id, UUID or role name.
    pub async fn role_definition_id(&self, role: &str) -> Result<String> {
        if role.starts_with('/') {
            return Ok(role.to_string());
        }
        if is_role_definition_uuid(role) {
            return Ok(format!(
                "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
                self.subscription_id, role
            ));
        }

        let mut ids = self
            .api
            .list_role_definitions(&self.scope("")?, role)
            .await
            .map_err(rbac_error("GetRoleDefinitionIDFromName"))?;
        match ids.len() {
            0 => Err(Error::RoleDefinitionNotFound(role.to_string())),
            1 => Ok(ids.remove(0)),
            _ => Err(Error::AmbiguousRoleDefinition(role.to_string())),
        }
    }

    pub async fn create_or_update_role_definition(
        &self,
        id: &str,
        properties: &RoleDefinitionProperties,
    ) -> Result<()> {
        self.api
            .create_or_update_role_definition(&self.scope("")?, id, properties)
            .await
            .map_err(rbac_error("CreateOrUpdateRoleDefinition"))
    }

    /// Makes the principal's assignments match `desired`, keyed by
    /// assignment name.
    pub async fn sync_role_assignments(
        &self,
        principal_id: &str,
        desired: &BTreeMap<String, RoleAssignment>,
    ) -> Result<()> {
        let existing = self
            .api
            .list_role_assignments(principal_id)
            .await
            .map_err(rbac_error("ListRoleAssignments"))?;
        let steps = find_sync_steps(
            existing.iter().map(|record| record.name.clone()),
            desired.keys().cloned(),
        );
        tracing::debug!(?steps, %principal_id, "role assignment sync steps");

        for name in &steps.add {
            let assignment = &desired[name];
            let role_definition_id = self.role_definition_id(&assignment.role).await?;
            self.api
                .create_role_assignment(
                    &self.scope(&assignment.scope)?,
                    name,
                    principal_id,
                    &role_definition_id,
                )
                .await
                .map_err(rbac_error("CreateRoleAssignment"))?;
            tracing::info!(role = %assignment.role, %name, "created role assignment");
        }
        for record in existing.iter().filter(|record| steps.delete.contains(&record.name)) {
            self.delete_role_assignment(record).await?;
        }
        Ok(())
    }

    /// Removes every assignment of the principal.
    pub async fn delete_role_assignments(&self, principal_id: &str) -> Result<()> {
        let existing = self
            .api
            .list_role_assignments(principal_id)
            .await
            .map_err(rbac_error("ListRoleAssignments"))?;
        for record in &existing {
            self.delete_role_assignment(record).await?;
        }
        Ok(())
    }

    async fn delete_role_assignment(&self, record: &RoleAssignmentRecord) -> Result<()> {
        match self.api.delete_role_assignment(&record.id).await {
            Ok(()) | Err(CloudError::NotFound) => {
                tracing::info!(name = %record.name, "deleted role assignment");
                Ok(())
            }
            Err(error) => Err(rbac_error("DeleteRoleAssignment")(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;

    fn client(api: MockRbacApi) -> RbacClient {
        RbacClient::new(Arc::new(api), "sub-1", "rg-dev")
    }

    #[test]
    fn stable_id_is_deterministic_v3() {
        let a = stable_id(&["uid", "dev", "ccs", "reader", "Reader"]);
        let b = stable_id(&["uid", "dev", "ccs", "reader", "Reader"]);
        let c = stable_id(&["uid", "dev", "ccs", "reader", "Writer"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(Uuid::parse_str(&a).unwrap().get_version_num(), 3);
    }

    #[test]
    fn recognizes_role_definition_uuids() {
        assert!(is_role_definition_uuid("acdd72a7-3385-48ef-bd42-f606fba81ae7"));
        assert!(!is_role_definition_uuid("ACDD72A7-3385-48EF-BD42-F606FBA81AE7"));
        assert!(!is_role_definition_uuid("acdd72a7-3385-08ef-bd42-f606fba81ae7"));
        assert!(!is_role_definition_uuid("Reader"));
    }

    #[test]
    fn expands_scopes() {
        let client = client(MockRbacApi::new());

        assert_eq!(client.scope("").unwrap(), "/subscriptions/sub-1/resourceGroups/rg-dev");
        assert_eq!(client.scope("/subscriptions/other").unwrap(), "/subscriptions/other");
        assert_eq!(
            client.scope("example.com@dnszones").unwrap(),
            "/subscriptions/sub-1/resourceGroups/rg-dev/providers/Microsoft.Network/dnszones/example.com"
        );
        assert_eq!(
            client.scope("providers/Microsoft.Storage/storageAccounts/logs").unwrap(),
            "/subscriptions/sub-1/resourceGroups/rg-dev/providers/Microsoft.Storage/storageAccounts/logs"
        );
        assert!(matches!(
            client.scope("vault@keyvaults"),
            Err(Error::UnsupportedScopeAlias(alias)) if alias == "keyvaults"
        ));
    }

    #[tokio::test]
    async fn resolves_role_definitions() {
        let mut api = MockRbacApi::new();
        api.expect_list_role_definitions()
            .with(eq("/subscriptions/sub-1/resourceGroups/rg-dev"), eq("Reader"))
            .returning(|_, _| Ok(vec!["/subscriptions/sub-1/providers/Microsoft.Authorization/roleDefinitions/r".into()]));
        api.expect_list_role_definitions()
            .with(eq("/subscriptions/sub-1/resourceGroups/rg-dev"), eq("Missing"))
            .returning(|_, _| Ok(vec![]));
        api.expect_list_role_definitions()
            .with(eq("/subscriptions/sub-1/resourceGroups/rg-dev"), eq("Twice"))
            .returning(|_, _| Ok(vec!["a".into(), "b".into()]));
        let client = client(api);

        assert_eq!(
            client.role_definition_id("/custom/role").await.unwrap(),
            "/custom/role"
        );
        assert_eq!(
            client
                .role_definition_id("acdd72a7-3385-48ef-bd42-f606fba81ae7")
                .await
                .unwrap(),
            "/subscriptions/sub-1/providers/Microsoft.Authorization/roleDefinitions/acdd72a7-3385-48ef-bd42-f606fba81ae7"
        );
        assert_eq!(
            client.role_definition_id("Reader").await.unwrap(),
            "/subscriptions/sub-1/providers/Microsoft.Authorization/roleDefinitions/r"
        );
        assert_eq!(
            client.role_definition_id("Missing").await.unwrap_err().to_string(),
            "role Missing not found"
        );
        assert!(matches!(
            client.role_definition_id("Twice").await,
            Err(Error::AmbiguousRoleDefinition(_))
        ));
    }

    #[tokio::test]
    async fn syncs_assignments_by_name() {
        let mut api = MockRbacApi::new();
        api.expect_list_role_assignments()
            .with(eq("principal"))
            .returning(|_| {
                Ok(vec![
                    RoleAssignmentRecord {
                        id: "/assignments/keep".into(),
                        name: "keep".into(),
                    },
                    RoleAssignmentRecord {
                        id: "/assignments/stale".into(),
                        name: "stale".into(),
                    },
                ])
            });
        api.expect_create_role_assignment()
            .withf(|scope, name, principal, role| {
                scope == "/subscriptions/sub-1/resourceGroups/rg-dev"
                    && name == "new"
                    && principal == "principal"
                    && role == "/roles/contributor"
            })
            .times(1)
            .returning(|_, _, _, _| Ok("/assignments/new".into()));
        api.expect_delete_role_assignment()
            .with(eq("/assignments/stale"))
            .times(1)
            .returning(|_| Ok(()));

        let desired = BTreeMap::from([
            (
                "keep".to_string(),
                RoleAssignment {
                    role: "/roles/reader".into(),
                    scope: String::new(),
                },
            ),
            (
                "new".to_string(),
                RoleAssignment {
                    role: "/roles/contributor".into(),
                    scope: String::new(),
                },
            ),
        ]);

        client(api)
            .sync_role_assignments("principal", &desired)
            .await
            .unwrap();
    }
}
