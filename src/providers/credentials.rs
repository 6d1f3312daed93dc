use std::collections::BTreeMap;

use kube::ResourceExt;

use super::or_default;
use crate::cluster::ClusterClient;
use crate::error::{Error, Result};
use crate::types::{CredentialsSource, WorkloadIdentity};

/// Reads the resource's credential properties: the referenced secret's keys
/// overlaid with `spec.credentials.properties`. `None` means the controller's
/// own environment credentials apply.
pub(crate) async fn resolve(
    cluster: &dyn ClusterClient,
    resource: &WorkloadIdentity,
) -> Result<Option<BTreeMap<String, String>>> {
    let credentials = match &resource.spec.credentials {
        Some(credentials) => credentials,
        None => return Ok(None),
    };

    let mut properties = BTreeMap::new();
    if credentials.source == Some(CredentialsSource::Secret) {
        let secret_ref = credentials
            .secret_ref
            .as_ref()
            .ok_or(Error::MissingSecretRef)?;
        let resource_name = resource.name();
        let resource_namespace = resource.namespace().unwrap_or_default();
        let name = or_default(&secret_ref.name, &resource_name);
        let namespace = or_default(&secret_ref.namespace, &resource_namespace);

        let secret = cluster
            .get_secret(namespace, name)
            .await?
            .ok_or_else(|| Error::SecretNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;
        for (key, value) in secret.data.unwrap_or_default() {
            properties.insert(key, String::from_utf8_lossy(&value.0).into_owned());
        }
        properties.extend(secret.string_data.unwrap_or_default());
    }
    properties.extend(credentials.properties.clone());

    Ok(Some(properties))
}

/// First non-empty value among the given environment variables.
pub(crate) fn env_first(lookup: &dyn Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.is_empty())
}

pub(crate) fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
