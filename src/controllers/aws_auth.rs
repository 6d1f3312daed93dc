//! Maintains the EKS `aws-auth` ConfigMap from labelled fragments.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::{Context, ReconcilerAction};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Data;
use crate::cluster::ClusterClient;
use crate::error::{Error, Result};
use crate::reconciler::Reconciler;
use crate::types::{AWSAuth, MapRoleItem, MapUserItem};

/// Label selecting the ConfigMaps that contribute to an `AWSAuth`.
pub const NAME_LABEL: &str = "aws-auth.identity-manager.io/name";
const MAP_ROLES: &str = "mapRoles";
const MAP_USERS: &str = "mapUsers";

pub struct AwsAuthReconciler {
    cluster: Arc<dyn ClusterClient>,
}

fn parse_items<T: DeserializeOwned>(
    config_map: &str,
    key: &'static str,
    data: &BTreeMap<String, String>,
) -> Result<Vec<T>> {
    match data.get(key).map(String::as_str) {
        None | Some("") => Ok(Vec::new()),
        Some(yaml) => serde_yaml::from_str(yaml).map_err(|source| Error::ParseAwsAuthFailed {
            name: config_map.to_string(),
            key,
            source,
        }),
    }
}

fn to_yaml<T: Serialize>(key: &'static str, items: &[T]) -> Result<String> {
    serde_yaml::to_string(items).map_err(|source| Error::SerializeAwsAuthFailed { key, source })
}

impl AwsAuthReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Valid entries from the resource and from the labelled ConfigMaps,
    /// each tagged with where it came from.
    async fn collect(
        &self,
        resource: &AWSAuth,
        namespace: &str,
    ) -> Result<(Vec<MapRoleItem>, Vec<MapUserItem>)> {
        let name = resource.name();
        let mut roles = Vec::new();
        let mut users = Vec::new();

        let mut sources = vec![(
            name.clone(),
            resource.spec.map_roles.clone(),
            resource.spec.map_users.clone(),
        )];
        let selector = BTreeMap::from([(NAME_LABEL.to_string(), name.clone())]);
        for config_map in self.cluster.list_config_maps(namespace, &selector).await? {
            let source = config_map.name();
            let data = config_map.data.unwrap_or_default();
            let map_roles = parse_items(&source, MAP_ROLES, &data).unwrap_or_else(|error| {
                tracing::warn!(%error, configmap = %source, "ignoring unparseable mapRoles");
                Vec::new()
            });
            let map_users = parse_items(&source, MAP_USERS, &data).unwrap_or_else(|error| {
                tracing::warn!(%error, configmap = %source, "ignoring unparseable mapUsers");
                Vec::new()
            });
            sources.push((source, map_roles, map_users));
        }

        for (source, map_roles, map_users) in sources {
            roles.extend(map_roles.into_iter().filter(MapRoleItem::is_valid).map(|item| MapRoleItem {
                source: source.clone(),
                ..item
            }));
            users.extend(map_users.into_iter().filter(MapUserItem::is_valid).map(|item| MapUserItem {
                source: source.clone(),
                ..item
            }));
        }
        Ok((roles, users))
    }
}

#[async_trait]
impl Reconciler<AWSAuth> for AwsAuthReconciler {
    async fn reconcile(&self, resource: &mut AWSAuth) -> Result<()> {
        let name = resource.name();
        let namespace = resource
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

        let existing = self
            .cluster
            .get_config_map(&namespace, &name)
            .await?
            .and_then(|config_map| config_map.data)
            .unwrap_or_default();
        let mut map_roles: Vec<MapRoleItem> = parse_items(&name, MAP_ROLES, &existing)?;
        map_roles.retain(|item| item.source.is_empty());

        let (roles, users) = self.collect(resource, &namespace).await?;
        if roles.is_empty() && users.is_empty() {
            tracing::debug!(%name, "no aws-auth entries to write");
            return Ok(());
        }
        map_roles.extend(roles);

        let data = BTreeMap::from([
            (MAP_ROLES.to_string(), to_yaml(MAP_ROLES, &map_roles)?),
            (MAP_USERS.to_string(), to_yaml(MAP_USERS, &users)?),
        ]);
        if existing.get(MAP_ROLES) == data.get(MAP_ROLES)
            && existing.get(MAP_USERS) == data.get(MAP_USERS)
        {
            return Ok(());
        }

        self.cluster
            .apply_config_map(&ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.clone()),
                    ..ObjectMeta::default()
                },
                data: Some(data),
                ..ConfigMap::default()
            })
            .await?;
        tracing::info!(%name, %namespace, roles = map_roles.len(), users = users.len(), "updated aws-auth configmap");
        Ok(())
    }

    async fn finalize(&self, _resource: &mut AWSAuth) -> Result<()> {
        Ok(())
    }
}

pub async fn reconcile(resource: Arc<AWSAuth>, ctx: Context<Data>) -> Result<ReconcilerAction> {
    let data = ctx.get_ref();
    let reconciler = AwsAuthReconciler::new(data.context.cluster.clone());
    super::run(resource, &data.store, &reconciler).await
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::types::AWSAuthSpec;

    const EXISTING: &str = "- rolearn: arn:aws:iam::12345678:role/node\n  username: system:node:{{EC2PrivateDNSName}}\n  groups:\n  - system:nodes\n- source: stale\n  rolearn: arn:aws:iam::12345678:role/gone\n  username: gone\n  groups:\n  - gone\n";

    fn aws_auth(spec: AWSAuthSpec) -> AWSAuth {
        let mut resource = AWSAuth::new("aws-auth", spec);
        resource.metadata.namespace = Some("kube-system".into());
        resource
    }

    fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("kube-system".into()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ConfigMap::default()
        }
    }

    fn role(arn: &str) -> MapRoleItem {
        MapRoleItem {
            source: String::new(),
            rolearn: arn.into(),
            username: "admin".into(),
            groups: vec!["system:masters".into()],
        }
    }

    #[tokio::test]
    async fn merges_fragments_and_keeps_foreign_entries() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_config_map()
            .with(eq("kube-system"), eq("aws-auth"))
            .returning(|_, _| Ok(Some(config_map("aws-auth", &[(MAP_ROLES, EXISTING)]))));
        cluster
            .expect_list_config_maps()
            .withf(|namespace, labels| {
                namespace == "kube-system"
                    && labels.get(NAME_LABEL).map(String::as_str) == Some("aws-auth")
            })
            .returning(|_, _| {
                Ok(vec![
                    config_map(
                        "team-a",
                        &[(
                            MAP_ROLES,
                            "- rolearn: arn:aws:iam::12345678:role/team-a\n  username: team-a\n  groups: [team-a]\n- rolearn: arn:aws:iam::12345678:role/incomplete\n",
                        )],
                    ),
                    config_map("broken", &[(MAP_USERS, "{not: [a list")]),
                ])
            });
        cluster
            .expect_apply_config_map()
            .withf(|config_map| {
                let data = config_map.data.as_ref().unwrap();
                let roles: Vec<MapRoleItem> = serde_yaml::from_str(&data[MAP_ROLES]).unwrap();
                let sources: Vec<&str> = roles.iter().map(|r| r.source.as_str()).collect();
                let users: Vec<MapUserItem> = serde_yaml::from_str(&data[MAP_USERS]).unwrap();
                sources == ["", "aws-auth", "team-a"] && users.is_empty()
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut resource = aws_auth(AWSAuthSpec {
            map_roles: vec![role("arn:aws:iam::12345678:role/admin")],
            map_users: vec![],
        });
        AwsAuthReconciler::new(Arc::new(cluster))
            .reconcile(&mut resource)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nothing_to_contribute_writes_nothing() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_config_map().returning(|_, _| Ok(None));
        cluster.expect_list_config_maps().returning(|_, _| Ok(vec![]));
        cluster.expect_apply_config_map().never();

        let mut resource = aws_auth(AWSAuthSpec::default());
        AwsAuthReconciler::new(Arc::new(cluster))
            .reconcile(&mut resource)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unchanged_data_is_not_rewritten() {
        let spec = AWSAuthSpec {
            map_roles: vec![role("arn:aws:iam::12345678:role/admin")],
            map_users: vec![],
        };
        let written = to_yaml(
            MAP_ROLES,
            &[MapRoleItem {
                source: "aws-auth".into(),
                ..role("arn:aws:iam::12345678:role/admin")
            }],
        )
        .unwrap();
        let users = to_yaml::<MapUserItem>(MAP_USERS, &[]).unwrap();

        let mut cluster = MockClusterClient::new();
        cluster.expect_get_config_map().returning(move |_, _| {
            Ok(Some(config_map(
                "aws-auth",
                &[(MAP_ROLES, written.as_str()), (MAP_USERS, users.as_str())],
            )))
        });
        cluster.expect_list_config_maps().returning(|_, _| Ok(vec![]));
        cluster.expect_apply_config_map().never();

        AwsAuthReconciler::new(Arc::new(cluster))
            .reconcile(&mut aws_auth(spec))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unparseable_target_is_an_error() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_config_map()
            .returning(|_, _| Ok(Some(config_map("aws-auth", &[(MAP_ROLES, "{not: [a list")]))));

        let error = AwsAuthReconciler::new(Arc::new(cluster))
            .reconcile(&mut aws_auth(AWSAuthSpec::default()))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::ParseAwsAuthFailed { key: MAP_ROLES, .. }));
    }
}
