mod cluster;
mod config;
mod controllers;
mod error;
mod providers;
mod reconciler;
mod sync;
mod types;

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures_util::future;
use futures_util::stream::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Context, Controller};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use crate::config::Options;
use crate::controllers::Data;
use crate::providers::ProviderContext;
use crate::reconciler::KubeStore;

fn watched<K>(client: &Client, options: &Options) -> Api<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match &options.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Arc::new(Options::parse());
    tracing::info!(?options, "starting identity-manager");

    let client = Client::try_default().await?;

    let context = ProviderContext {
        cluster: Arc::new(cluster::KubeCluster::new(client.clone())),
        backends: Arc::new(providers::Unconfigured),
        options: options.clone(),
    };
    let data = || {
        Context::new(Data {
            store: KubeStore::new(client.clone()),
            context: context.clone(),
        })
    };

    let workload_identities = Controller::new(
        watched::<types::WorkloadIdentity>(&client, &options),
        ListParams::default(),
    )
    .shutdown_on_signal()
    .run(
        controllers::workload_identity::reconcile,
        controllers::error_policy,
        data(),
    )
    .for_each(|res| async move {
        match res {
            Ok(o) => tracing::info!("reconciled {:?}", o),
            Err(e) => tracing::warn!("reconcile failed: {}", e),
        }
    });

    let aws_auths = Controller::new(
        watched::<types::AWSAuth>(&client, &options),
        ListParams::default(),
    )
    .shutdown_on_signal()
    .run(
        controllers::aws_auth::reconcile,
        controllers::error_policy,
        data(),
    )
    .for_each(|res| async move {
        match res {
            Ok(o) => tracing::info!("reconciled {:?}", o),
            Err(e) => tracing::warn!("reconcile failed: {}", e),
        }
    });

    future::join(workload_identities, aws_auths).await;

    tracing::info!("controller terminated");

    Ok(())
}
