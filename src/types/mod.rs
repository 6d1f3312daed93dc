mod aws_auth;
mod condition;
mod workload_identity;

pub use aws_auth::*;
pub use condition::*;
pub use workload_identity::*;
