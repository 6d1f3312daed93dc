//! Generic reconcile machinery shared by every custom resource kind.
//!
//! A kind plugs in by implementing [`ManagedResource`] for the object and
//! [`Reconciler`] for the business logic. The [`driver`] takes care of the
//! finalizer lifecycle, status conditions, persistence and requeueing.

pub mod driver;

use std::fmt::{self, Debug};

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{
    AWSAuth, AWSAuthSpec, AWSAuthStatus, Conditioned, WorkloadIdentity, WorkloadIdentitySpec,
    WorkloadIdentityStatus,
};

pub use driver::{reconcile, Outcome, Persisted, Requeue, WriteOutcome};

pub const FINALIZER: &str = "identity-manager.io/finalizer";
pub const DELETE_POLICY_ANNOTATION: &str = "identity-manager.io/delete-policy";
pub const ORPHAN: &str = "Orphan";

/// Object reconciled by the driver.
pub trait ManagedResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Spec: Clone + Debug + PartialEq + Send + Sync;
    type Status: Conditioned + Clone + Debug + Default + PartialEq + Send + Sync;

    fn spec(&self) -> &Self::Spec;
    fn status(&self) -> Option<&Self::Status>;
    /// Returns the status, initialising it when absent.
    fn status_mut(&mut self) -> &mut Self::Status;
}

impl ManagedResource for WorkloadIdentity {
    type Spec = WorkloadIdentitySpec;
    type Status = WorkloadIdentityStatus;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Self::Status {
        self.status.get_or_insert_with(Default::default)
    }
}

impl ManagedResource for AWSAuth {
    type Spec = AWSAuthSpec;
    type Status = AWSAuthStatus;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Self::Status {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Business logic for one resource kind. Implementations mutate the working
/// copy they are handed; the driver persists whatever changed.
#[async_trait]
pub trait Reconciler<K: ManagedResource>: Send + Sync {
    async fn reconcile(&self, resource: &mut K) -> Result<()>;

    async fn finalize(&self, resource: &mut K) -> Result<()>;

    /// Runs before [`Reconciler::finalize`]. An error keeps the finalizer.
    async fn pre_finalize(&self, _resource: &mut K) -> Result<()> {
        Ok(())
    }
}

/// Namespaced name of a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        Self {
            namespace: resource.namespace(),
            name: resource.name(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// CRUD boundary the driver reads and persists resources through.
#[async_trait]
pub trait ResourceStore<K: ManagedResource>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Writes metadata and spec, returning the stored object.
    async fn update(&self, resource: &K) -> Result<K>;

    /// Writes the status subresource, returning the stored object.
    async fn update_status(&self, resource: &K) -> Result<K>;
}

/// [`ResourceStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: ManagedResource>(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl<K: ManagedResource> ResourceStore<K> for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        match self.api::<K>(key.namespace.as_deref()).get(&key.name).await {
            Ok(resource) => Ok(Some(resource)),
            Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(None),
            Err(error) => Err(Error::GetResourceFailed(error)),
        }
    }

    async fn update(&self, resource: &K) -> Result<K> {
        self.api::<K>(resource.namespace().as_deref())
            .replace(&resource.name(), &PostParams::default(), resource)
            .await
            .map_err(Error::UpdateResourceFailed)
    }

    async fn update_status(&self, resource: &K) -> Result<K> {
        self.api::<K>(resource.namespace().as_deref())
            .replace_status(
                &resource.name(),
                &PostParams::default(),
                serde_json::to_vec(resource).map_err(Error::SerializeStatusFailed)?,
            )
            .await
            .map_err(Error::UpdateStatusFailed)
    }
}
