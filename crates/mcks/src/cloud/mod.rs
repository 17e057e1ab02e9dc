//! Per-CSP helpers.
//!
//! Two concerns live here: resolving the cloud-assigned hostname a node
//! boots with (used as the Kubernetes node name in `SINGLE` mode), and
//! the AWS-specific preparation the cloud-controller-manager needs
//! (instance profiles and resource tags).

pub mod aws;
pub mod openstack;

use thiserror::Error;

use crate::model::Csp;
use crate::ssh::{RemoteExecutor, SshTarget};

/// Cloud adapter failures.
#[derive(Error, Debug)]
pub enum CloudError {
    /// A metadata or server lookup came back empty or failed.
    #[error("Failed to look up '{node}' in the cloud: {cause}")]
    Lookup { node: String, cause: String },

    /// Cloud API call failed.
    #[error("Cloud API error: {0}")]
    Api(String),

    /// Required authentication environment is missing or rejected.
    #[error("Cloud auth error: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Resolve the hostname the CSP assigned to a machine.
///
/// AWS answers through the instance metadata service, queried from the
/// machine itself; OpenStack through the compute API. CSPs without a
/// metadata integration keep the requested name.
pub async fn resolve_local_hostname(
    csp: Csp,
    exec: &dyn RemoteExecutor,
    target: &SshTarget,
) -> Result<String, CloudError> {
    match csp {
        Csp::Aws => aws::local_hostname(exec, target).await,
        Csp::Openstack => {
            let client = openstack::OpenStackClient::from_env().await?;
            client.server_name(&target.name).await
        }
        _ => Ok(target.name.clone()),
    }
}
