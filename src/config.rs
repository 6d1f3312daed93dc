use std::collections::BTreeMap;

use clap::Parser;

/// Manages cloud workload identities for Kubernetes workloads
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "identity-manager", version, about)]
pub struct Options {
    /// Prefix for the names of the cloud identities
    #[arg(long, env = "NAME_PREFIX", default_value = "")]
    pub name_prefix: String,

    /// Tags put on created cloud identities (key=value)
    #[arg(long = "tags", env = "TAGS", value_delimiter = ',', value_parser = parse_tag)]
    pub tags: Vec<(String, String)>,

    /// Permissions boundary for IAM roles that do not declare one
    #[arg(long, env = "AWS_PERMISSIONS_BOUNDARY_ARN", default_value = "")]
    pub aws_permissions_boundary_arn: String,

    /// Only watch resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl Options {
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.tags.iter().cloned().collect()
    }
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid tag {:?}: expected key=value", s))?;
    if key.is_empty() {
        return Err(format!("invalid tag {:?}: empty key", s));
    }
    Ok((key.to_string(), value.to_string()))
}
