use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::controller::{Context, ReconcilerAction};

use super::Data;
use crate::error::Result;
use crate::providers::{self, ProviderContext};
use crate::reconciler::Reconciler;
use crate::types::WorkloadIdentity;

/// Hands a `WorkloadIdentity` to the reconciler of its provider.
pub struct WorkloadIdentityReconciler {
    context: ProviderContext,
}

impl WorkloadIdentityReconciler {
    pub fn new(context: ProviderContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Reconciler<WorkloadIdentity> for WorkloadIdentityReconciler {
    async fn reconcile(&self, resource: &mut WorkloadIdentity) -> Result<()> {
        let mut provider = providers::for_provider(resource.spec.provider, self.context.clone());
        provider.prepare(resource).await?;
        provider.reconcile(resource).await
    }

    async fn finalize(&self, resource: &mut WorkloadIdentity) -> Result<()> {
        let mut provider = providers::for_provider(resource.spec.provider, self.context.clone());
        provider.prepare(resource).await?;
        provider.finalize(resource).await
    }
}

pub async fn reconcile(
    resource: Arc<WorkloadIdentity>,
    ctx: Context<Data>,
) -> Result<ReconcilerAction> {
    let data = ctx.get_ref();
    let reconciler = WorkloadIdentityReconciler::new(data.context.clone());
    super::run(resource, &data.store, &reconciler).await
}
