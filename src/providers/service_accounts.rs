use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::or_default;
use crate::cluster::{controller_owner_reference, ClusterClient};
use crate::error::{Error, Result};
use crate::types::{PodSelector, ServiceAccountAction, ServiceAccountSpec, WorkloadIdentity};

pub(crate) const MANAGED_BY_LABEL: &str = "identity-manager.io";
pub(crate) const MANAGED_BY_VALUE: &str = "managed";
pub(crate) const NAME_LABEL: &str = "identity-manager.io/name";

/// Binds a Kubernetes ServiceAccount to a cloud identity through
/// `annotation_key`, creating the ServiceAccount when the spec asks for it.
pub(crate) async fn reconcile_service_account(
    cluster: &dyn ClusterClient,
    resource: &WorkloadIdentity,
    spec: &ServiceAccountSpec,
    annotation_key: &str,
    identity: &str,
) -> Result<()> {
    if spec.action == ServiceAccountAction::None {
        return Ok(());
    }

    let resource_name = resource.name();
    let resource_namespace = resource.namespace().unwrap_or_default();
    let name = or_default(&spec.name, &resource_name);
    let namespace = or_default(&spec.namespace, &resource_namespace);

    let existing = cluster.get_service_account(namespace, name).await?;
    let existing = match (spec.action, existing) {
        (ServiceAccountAction::Create, None) => {
            let service_account =
                new_service_account(resource, spec, name, namespace, annotation_key, identity)?;
            cluster.create_service_account(&service_account).await?;
            tracing::info!(%name, %namespace, "created serviceaccount");
            return Ok(());
        }
        (ServiceAccountAction::Create, Some(existing)) if !is_managed_by(&existing, &resource_name) => {
            return Err(Error::ServiceAccountExists {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        (ServiceAccountAction::Update, None) => {
            return Err(Error::ServiceAccountMissing {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        (_, Some(existing)) => existing,
        (ServiceAccountAction::None, None) => return Ok(()),
    };

    if identity.is_empty() {
        return Ok(());
    }

    let mut updated = existing.clone();
    let annotations = updated.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.extend(spec.annotations.clone());
    annotations.insert(annotation_key.to_string(), identity.to_string());
    if updated.metadata.annotations != existing.metadata.annotations {
        cluster.replace_service_account(&updated).await?;
        tracing::info!(%name, %namespace, "updated serviceaccount annotations");
    }
    Ok(())
}

fn is_managed_by(service_account: &ServiceAccount, resource_name: &str) -> bool {
    service_account
        .labels()
        .get(NAME_LABEL)
        .map_or(false, |owner| owner == resource_name)
}

fn new_service_account(
    resource: &WorkloadIdentity,
    spec: &ServiceAccountSpec,
    name: &str,
    namespace: &str,
    annotation_key: &str,
    identity: &str,
) -> Result<ServiceAccount> {
    let mut annotations = spec.annotations.clone();
    annotations.insert(annotation_key.to_string(), identity.to_string());

    Ok(ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (NAME_LABEL.to_string(), resource.name()),
            ])),
            annotations: Some(annotations),
            owner_references: Some(vec![controller_owner_reference(resource)?]),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    })
}

/// Deletes the selected pods that do not carry `env_name=value` in any
/// container, so they restart with the identity injected. Delete failures
/// are logged and skipped.
pub(crate) async fn restart_pods(
    cluster: &dyn ClusterClient,
    resource: &WorkloadIdentity,
    selector: &PodSelector,
    env_name: &str,
    value: &str,
) -> Result<()> {
    let resource_namespace = resource.namespace().unwrap_or_default();
    let namespace = or_default(&selector.namespace, &resource_namespace);

    for pod in cluster.list_pods(namespace, &selector.match_labels).await? {
        if has_env(&pod, env_name, value) {
            continue;
        }
        let name = pod.name();
        match cluster.delete_pod(namespace, &name).await {
            Ok(()) => tracing::info!(pod = %name, %namespace, "deleted pod to pick up identity"),
            Err(error) => tracing::warn!(pod = %name, %namespace, %error, "unable to delete pod"),
        }
    }
    Ok(())
}

fn has_env(pod: &Pod, env_name: &str, value: &str) -> bool {
    pod.spec.iter().flat_map(|spec| &spec.containers).any(|container| {
        container.env.iter().flatten().any(|env| {
            env.name == env_name && env.value.as_deref() == Some(value)
        })
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};

    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::types::{Provider, WorkloadIdentitySpec};

    const ROLE_ARN: &str = "arn:aws:iam::12345678:role/ccs-v1";
    const ANNOTATION: &str = "eks.amazonaws.com/role-arn";

    fn identity() -> WorkloadIdentity {
        let mut resource = WorkloadIdentity::new(
            "ccs-v1",
            WorkloadIdentitySpec {
                name: "ccs-v1".into(),
                display_name: String::new(),
                description: String::new(),
                credentials: None,
                provider: Provider::Aws,
                aws: None,
                azure: None,
                gcp: None,
                write_to_secret_ref: None,
            },
        );
        resource.metadata.namespace = Some("dev".into());
        resource.metadata.uid = Some("0ae5c03d-5fb3-4eb9-9de8-2bd4b51606ba".into());
        resource
    }

    fn sa_spec(action: ServiceAccountAction) -> ServiceAccountSpec {
        ServiceAccountSpec {
            action,
            name: "dev-sa".into(),
            namespace: "dev".into(),
            annotations: BTreeMap::new(),
        }
    }

    fn existing_sa(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ServiceAccount {
        let pairs = |items: &[(&str, &str)]| {
            items
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some("dev-sa".into()),
                namespace: Some("dev".into()),
                labels: Some(pairs(labels)),
                annotations: Some(pairs(annotations)),
                ..ObjectMeta::default()
            },
            ..ServiceAccount::default()
        }
    }

    #[tokio::test]
    async fn no_action_touches_nothing() {
        let cluster = MockClusterClient::new();
        reconcile_service_account(
            &cluster,
            &identity(),
            &sa_spec(ServiceAccountAction::None),
            ANNOTATION,
            ROLE_ARN,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn creates_labelled_and_owned_service_account() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        cluster
            .expect_create_service_account()
            .withf(|sa| {
                sa.labels().get(NAME_LABEL).map(String::as_str) == Some("ccs-v1")
                    && sa.annotations().get(ANNOTATION).map(String::as_str) == Some(ROLE_ARN)
                    && sa.owner_references()[0].controller == Some(true)
            })
            .times(1)
            .returning(|_| Ok(()));

        reconcile_service_account(
            &cluster,
            &identity(),
            &sa_spec(ServiceAccountAction::Create),
            ANNOTATION,
            ROLE_ARN,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_refuses_foreign_service_account() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_service_account()
            .returning(|_, _| Ok(Some(existing_sa(&[], &[]))));

        let error = reconcile_service_account(
            &cluster,
            &identity(),
            &sa_spec(ServiceAccountAction::Create),
            ANNOTATION,
            ROLE_ARN,
        )
        .await
        .unwrap_err();

        assert!(matches!(error, Error::ServiceAccountExists { .. }));
    }

    #[tokio::test]
    async fn create_updates_own_service_account() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_service_account().returning(|_, _| {
            Ok(Some(existing_sa(
                &[(NAME_LABEL, "ccs-v1")],
                &[(ANNOTATION, "arn:aws:iam::12345678:role/old")],
            )))
        });
        cluster
            .expect_replace_service_account()
            .withf(|sa| sa.annotations().get(ANNOTATION).map(String::as_str) == Some(ROLE_ARN))
            .times(1)
            .returning(|_| Ok(()));

        reconcile_service_account(
            &cluster,
            &identity(),
            &sa_spec(ServiceAccountAction::Create),
            ANNOTATION,
            ROLE_ARN,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn update_requires_existing_service_account() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_service_account()
            .returning(|_, _| Ok(None));

        let error = reconcile_service_account(
            &cluster,
            &identity(),
            &sa_spec(ServiceAccountAction::Update),
            ANNOTATION,
            ROLE_ARN,
        )
        .await
        .unwrap_err();

        assert!(matches!(error, Error::ServiceAccountMissing { .. }));
    }

    #[tokio::test]
    async fn update_skips_write_when_annotated() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_service_account()
            .returning(|_, _| Ok(Some(existing_sa(&[], &[(ANNOTATION, ROLE_ARN)]))));
        cluster.expect_replace_service_account().never();

        reconcile_service_account(
            &cluster,
            &identity(),
            &sa_spec(ServiceAccountAction::Update),
            ANNOTATION,
            ROLE_ARN,
        )
        .await
        .unwrap();
    }

    fn pod(name: &str, env: Option<(&str, &str)>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    env: env.map(|(name, value)| {
                        vec![EnvVar {
                            name: name.into(),
                            value: Some(value.into()),
                            value_from: None,
                        }]
                    }),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn restarts_only_pods_without_identity_env() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_pods().returning(|_, _| {
            Ok(vec![
                pod("ready", Some(("AWS_ROLE_ARN", ROLE_ARN))),
                pod("stale", Some(("AWS_ROLE_ARN", "arn:aws:iam::12345678:role/old"))),
                pod("bare", None),
            ])
        });
        cluster
            .expect_delete_pod()
            .withf(|_, name| name == "stale")
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_delete_pod()
            .withf(|_, name| name == "bare")
            .times(1)
            .returning(|_, _| Err(Error::MissingObjectKey(".metadata.name")));

        let selector = PodSelector {
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            namespace: String::new(),
        };
        restart_pods(&cluster, &identity(), &selector, "AWS_ROLE_ARN", ROLE_ARN)
            .await
            .unwrap();
    }
}
