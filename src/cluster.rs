//! Access to the cluster-local objects the reconcilers manage besides their
//! own custom resources.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "identity-manager";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn apply_secret(&self, secret: &Secret) -> Result<()>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;

    async fn create_service_account(&self, service_account: &ServiceAccount) -> Result<()>;

    async fn replace_service_account(&self, service_account: &ServiceAccount) -> Result<()>;

    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn list_config_maps(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>>;

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Server-side applies an object of a kind without generated bindings.
    async fn apply_dynamic(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()>;
}

/// [`ClusterClient`] talking to the API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn label_selector(match_labels: &BTreeMap<String, String>) -> String {
    match_labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

fn not_found_as_none<K>(result: kube::Result<K>, operation: &'static str) -> Result<Option<K>> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(None),
        Err(source) => Err(Error::Kube { operation, source }),
    }
}

fn namespace_of<K: Resource>(object: &K) -> Result<String> {
    object
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        not_found_as_none(self.api::<Secret>(namespace).get(name).await, "get secret")
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        self.api::<Secret>(&namespace_of(secret)?)
            .patch(
                &secret.name(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(secret),
            )
            .await
            .map_err(Error::kube("apply secret"))?;
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        not_found_as_none(
            self.api::<ServiceAccount>(namespace).get(name).await,
            "get serviceaccount",
        )
    }

    async fn create_service_account(&self, service_account: &ServiceAccount) -> Result<()> {
        self.api::<ServiceAccount>(&namespace_of(service_account)?)
            .create(&PostParams::default(), service_account)
            .await
            .map_err(Error::kube("create serviceaccount"))?;
        Ok(())
    }

    async fn replace_service_account(&self, service_account: &ServiceAccount) -> Result<()> {
        self.api::<ServiceAccount>(&namespace_of(service_account)?)
            .replace(
                &service_account.name(),
                &PostParams::default(),
                service_account,
            )
            .await
            .map_err(Error::kube("update serviceaccount"))?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let pods = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(&label_selector(match_labels)))
            .await
            .map_err(Error::kube("list pods"))?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(Error::kube("delete pod"))?;
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        not_found_as_none(
            self.api::<ConfigMap>(namespace).get(name).await,
            "get configmap",
        )
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>> {
        let config_maps = self
            .api::<ConfigMap>(namespace)
            .list(&ListParams::default().labels(&label_selector(match_labels)))
            .await
            .map_err(Error::kube("list configmaps"))?;
        Ok(config_maps.items)
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.api::<ConfigMap>(&namespace_of(config_map)?)
            .patch(
                &config_map.name(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(config_map),
            )
            .await
            .map_err(Error::kube("apply configmap"))?;
        Ok(())
    }

    async fn apply_dynamic(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            &namespace_of(object)?,
            resource,
        );
        api.patch(
            &object.name(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await
        .map_err(Error::kube("apply object"))?;
        Ok(())
    }
}

/// Reference marking `owner` as the controller of a dependent object, so the
/// object is garbage collected with it.
pub fn controller_owner_reference<K: Resource<DynamicType = ()>>(
    owner: &K,
) -> Result<OwnerReference> {
    let meta = owner.meta();
    Ok(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: meta
            .uid
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AWSAuth, AWSAuthSpec};

    #[test]
    fn selector_joins_labels() {
        let labels = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "app=web,tier=front");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }

    #[test]
    fn owner_reference_requires_uid() {
        let mut owner = AWSAuth::new("aws-auth", AWSAuthSpec::default());
        assert!(matches!(
            controller_owner_reference(&owner),
            Err(Error::MissingObjectKey(".metadata.uid"))
        ));

        owner.meta_mut().uid = Some("1234".into());
        let reference = controller_owner_reference(&owner).unwrap();
        assert_eq!(reference.kind, "AWSAuth");
        assert_eq!(reference.api_version, "identity-manager.io/v1alpha1");
        assert_eq!(reference.controller, Some(true));
    }
}
