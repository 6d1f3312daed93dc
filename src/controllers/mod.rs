//! Glue between `kube::runtime::Controller` and the reconcile driver.

pub mod aws_auth;
pub mod workload_identity;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::{Context, ReconcilerAction};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::providers::ProviderContext;
use crate::reconciler::{self, KubeStore, ManagedResource, ObjectKey, Reconciler};

pub struct Data {
    pub store: KubeStore,
    pub context: ProviderContext,
}

/// Runs the driver for the object the controller handed us.
async fn run<K, R>(resource: Arc<K>, store: &KubeStore, reconciler: &R) -> Result<ReconcilerAction>
where
    K: ManagedResource,
    R: Reconciler<K>,
{
    let key = ObjectKey::from_resource(resource.as_ref());
    let span = tracing::info_span!("reconcile", kind = %K::kind(&()), %key);
    let outcome = reconciler::reconcile(store, &key, reconciler)
        .instrument(span)
        .await?;
    tracing::debug!(?outcome, %key, "reconcile finished");
    Ok(outcome.requeue.into_action())
}

pub fn error_policy(error: &Error, _ctx: Context<Data>) -> ReconcilerAction {
    tracing::error!(%error);
    ReconcilerAction {
        requeue_after: Some(Duration::from_secs(3)),
    }
}
