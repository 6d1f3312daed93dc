use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::ReconcilerAction;
use kube::Resource;
use rand::Rng;

use super::{ManagedResource, ObjectKey, Reconciler, ResourceStore};
use super::{DELETE_POLICY_ANNOTATION, FINALIZER, ORPHAN};
use crate::error::{Error, Result};
use crate::types::{Condition, Conditioned};

/// Kind that never carries the finalizer.
const DEPENDENCY_KIND: &str = "Dependency";

const JITTER_SECS: std::ops::Range<u64> = 30..120;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    Never,
    /// Uniformly distributed in [30s, 120s).
    Jittered,
    After(Duration),
}

impl Requeue {
    pub fn into_action(self) -> ReconcilerAction {
        let requeue_after = match self {
            Requeue::Never => None,
            Requeue::Jittered => Some(Duration::from_secs(
                rand::thread_rng().gen_range(JITTER_SECS),
            )),
            Requeue::After(duration) => Some(duration),
        };
        ReconcilerAction { requeue_after }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Unchanged,
    Written,
    Failed(String),
}

/// What the driver wrote back. Failures are logged here instead of being
/// returned, so a failed write never masks the reconcile result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Persisted {
    pub status: WriteOutcome,
    pub resource: WriteOutcome,
}

impl Persisted {
    fn unchanged() -> Self {
        Self {
            status: WriteOutcome::Unchanged,
            resource: WriteOutcome::Unchanged,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub requeue: Requeue,
    pub persisted: Persisted,
}

impl Outcome {
    fn done() -> Self {
        Self {
            requeue: Requeue::Never,
            persisted: Persisted::unchanged(),
        }
    }
}

struct Snapshot<K: ManagedResource> {
    spec: K::Spec,
    status: Option<K::Status>,
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    finalizers: Vec<String>,
}

impl<K: ManagedResource> Snapshot<K> {
    fn take(resource: &K) -> Self {
        let meta = resource.meta();
        Self {
            spec: resource.spec().clone(),
            status: resource.status().cloned(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            finalizers: meta.finalizers.clone().unwrap_or_default(),
        }
    }

    fn status_changed(&self, resource: &K) -> bool {
        self.status.as_ref() != resource.status()
    }

    fn resource_changed(&self, resource: &K) -> bool {
        let meta = resource.meta();
        self.annotations != meta.annotations.clone().unwrap_or_default()
            || self.labels != meta.labels.clone().unwrap_or_default()
            || self.finalizers != meta.finalizers.clone().unwrap_or_default()
            || &self.spec != resource.spec()
    }
}

/// Reconciles the resource stored under `key`.
///
/// Only failures to read the resource or to drop the finalizer are returned
/// as errors; reconciler failures end up in the status conditions.
pub async fn reconcile<K, S, R>(store: &S, key: &ObjectKey, reconciler: &R) -> Result<Outcome>
where
    K: ManagedResource,
    S: ResourceStore<K> + ?Sized,
    R: Reconciler<K> + ?Sized,
{
    let mut resource = match store.get(key).await? {
        Some(resource) => resource,
        None => {
            tracing::info!(%key, "resource not found. ignoring since object must be deleted");
            return Ok(Outcome::done());
        }
    };
    let snapshot = Snapshot::take(&resource);

    if resource.meta().deletion_timestamp.is_some() {
        return delete(store, resource, &snapshot, reconciler).await;
    }

    if is_finalizer_exempt::<K>() {
        remove_finalizer(resource.meta_mut());
    } else {
        add_finalizer(resource.meta_mut());
    }

    let result = reconciler.reconcile(&mut resource).await;
    Ok(finish(store, resource, &snapshot, result).await)
}

async fn delete<K, S, R>(
    store: &S,
    mut resource: K,
    snapshot: &Snapshot<K>,
    reconciler: &R,
) -> Result<Outcome>
where
    K: ManagedResource,
    S: ResourceStore<K> + ?Sized,
    R: Reconciler<K> + ?Sized,
{
    if !has_finalizer(resource.meta()) {
        return Ok(Outcome::done());
    }

    if is_orphaned(resource.meta()) {
        tracing::info!("delete policy is Orphan, skipping finalize");
        return release(store, resource).await;
    }

    if let Err(error) = reconciler.pre_finalize(&mut resource).await {
        return Ok(finish(store, resource, snapshot, Err(error)).await);
    }
    if let Err(error) = reconciler.finalize(&mut resource).await {
        return Ok(finish(store, resource, snapshot, Err(error)).await);
    }

    release(store, resource).await
}

/// Drops the finalizer so the API server can remove the object.
async fn release<K, S>(store: &S, mut resource: K) -> Result<Outcome>
where
    K: ManagedResource,
    S: ResourceStore<K> + ?Sized,
{
    remove_finalizer(resource.meta_mut());
    store.update(&resource).await?;
    Ok(Outcome {
        requeue: Requeue::Never,
        persisted: Persisted {
            status: WriteOutcome::Unchanged,
            resource: WriteOutcome::Written,
        },
    })
}

async fn finish<K, S>(store: &S, mut resource: K, snapshot: &Snapshot<K>, result: Result<()>) -> Outcome
where
    K: ManagedResource,
    S: ResourceStore<K> + ?Sized,
{
    let requeue = match result {
        Ok(()) => {
            set_condition(&mut resource, Condition::reconcile_success());
            Requeue::Jittered
        }
        Err(Error::Ignore) => Requeue::Never,
        Err(Error::Condition(condition)) => {
            tracing::info!(reason = %condition.reason, message = %condition.message, "reconcile not complete");
            set_condition(&mut resource, condition);
            Requeue::Jittered
        }
        Err(error) => {
            tracing::warn!(%error, "reconcile failed");
            set_condition(&mut resource, Condition::reconcile_error(&error));
            Requeue::Jittered
        }
    };

    let persisted = persist(store, &mut resource, snapshot).await;
    Outcome { requeue, persisted }
}

fn set_condition<K: ManagedResource>(resource: &mut K, condition: Condition) {
    resource
        .status_mut()
        .conditioned_status_mut()
        .set_conditions([condition]);
}

async fn persist<K, S>(store: &S, resource: &mut K, snapshot: &Snapshot<K>) -> Persisted
where
    K: ManagedResource,
    S: ResourceStore<K> + ?Sized,
{
    let status = if snapshot.status_changed(resource) {
        match store.update_status(resource).await {
            Ok(stored) => {
                resource.meta_mut().resource_version = stored.meta().resource_version.clone();
                WriteOutcome::Written
            }
            Err(error) => {
                tracing::info!(%error, "error updating resource status");
                WriteOutcome::Failed(error.to_string())
            }
        }
    } else {
        WriteOutcome::Unchanged
    };

    let written = if snapshot.resource_changed(resource) {
        match store.update(resource).await {
            Ok(_) => WriteOutcome::Written,
            Err(error) => {
                tracing::info!(%error, "error updating resource");
                WriteOutcome::Failed(error.to_string())
            }
        }
    } else {
        WriteOutcome::Unchanged
    };

    Persisted {
        status,
        resource: written,
    }
}

/// Objects of the Dependency kind are never held back by the finalizer.
fn is_finalizer_exempt<K: ManagedResource>() -> bool {
    K::kind(&()) == DEPENDENCY_KIND
}

fn is_orphaned(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(DELETE_POLICY_ANNOTATION))
        .map_or(false, |policy| policy == ORPHAN)
}

fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .map_or(false, |finalizers| finalizers.iter().any(|f| f == FINALIZER))
}

fn add_finalizer(meta: &mut ObjectMeta) {
    if !has_finalizer(meta) {
        meta.finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER.to_string());
    }
}

fn remove_finalizer(meta: &mut ObjectMeta) {
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != FINALIZER);
    }
}
