//! Public service entry points.
//!
//! [`ClusterService`] and [`NodeService`] wrap the provisioner with
//! store lookups, validation and rollback. They are the only writers of
//! cluster lifecycle phases; everything durable funnels through the
//! store's compare-and-swap put.

mod cluster;
mod node;

pub use cluster::ClusterService;
pub use node::NodeService;

use serde::Deserialize;

use crate::broker::BrokerClient;
use crate::error::{Error, Result};
use crate::model::{KubernetesConfig, NetworkCni, Role, ServiceType};

/// One pool of nodes requested through a single connection config.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    /// Broker connection config (one credential in one CSP region).
    pub connection: String,
    /// Number of VMs to create from this spec.
    #[serde(default = "default_count")]
    pub count: u32,
    /// CSP machine spec (e.g. `t3.medium`).
    pub spec: String,
    #[serde(default)]
    pub root_disk_type: String,
    #[serde(default)]
    pub root_disk_size: String,
}

fn default_count() -> u32 {
    1
}

/// Request to create a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterReq {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub service_type: ServiceType,
    pub network_cni: NetworkCni,
    pub kubernetes: KubernetesConfig,
    pub control_plane: Vec<NodeSpec>,
    pub worker: Vec<NodeSpec>,
}

fn default_version() -> String {
    "1.23.13".to_string()
}

/// Request to add worker nodes to an existing cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeReq {
    pub worker: Vec<NodeSpec>,
}

/// Generated sequential node name.
pub(crate) fn node_name(role: Role, idx: u32) -> String {
    format!("{}-{idx}", role.name_prefix())
}

/// Namespaces are owned by the broker; nothing proceeds without one.
pub(crate) async fn verify_namespace(broker: &BrokerClient, namespace: &str) -> Result<()> {
    if broker.namespace_exists(namespace).await? {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Namespace '{namespace}' does not exist"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_format() {
        assert_eq!(node_name(Role::Worker, 3), "worker-3");
        assert_eq!(node_name(Role::ControlPlane, 1), "control-plane-1");
    }

    #[test]
    fn test_cluster_req_defaults() {
        let req: ClusterReq = serde_json::from_str(
            r#"{
                "name": "c1",
                "service_type": "MULTI",
                "network_cni": "canal",
                "kubernetes": {
                    "pod_cidr": "10.244.0.0/16",
                    "service_cidr": "10.96.0.0/12",
                    "service_dns_domain": "cluster.local"
                },
                "control_plane": [{"connection": "aws-conn", "spec": "t3.medium"}],
                "worker": [{"connection": "aws-conn", "spec": "t3.medium", "count": 2}]
            }"#,
        )
        .unwrap();
        assert_eq!(req.version, "1.23.13");
        assert_eq!(req.control_plane[0].count, 1);
        assert_eq!(req.worker[0].count, 2);
    }
}
