#[path = "../types/mod.rs"]
mod types;

use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&types::WorkloadIdentity::crd())?);
    print!("{}", serde_yaml::to_string(&types::AWSAuth::crd())?);
    Ok(())
}
