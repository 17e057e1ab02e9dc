//! Persisted cluster model.
//!
//! A [`Cluster`] is the durable record of one provisioned Kubernetes
//! cluster: identity, service type, CNI choice, the control-plane leader
//! and the node roster. Nodes are value objects; the in-memory machine
//! counterpart used during provisioning lives in [`crate::machine`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cloud service provider a node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Csp {
    Aws,
    Gcp,
    Azure,
    Alibaba,
    Tencent,
    Openstack,
}

impl std::fmt::Display for Csp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::Gcp => write!(f, "gcp"),
            Self::Azure => write!(f, "azure"),
            Self::Alibaba => write!(f, "alibaba"),
            Self::Tencent => write!(f, "tencent"),
            Self::Openstack => write!(f, "openstack"),
        }
    }
}

impl std::str::FromStr for Csp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            "alibaba" => Ok(Self::Alibaba),
            "tencent" => Ok(Self::Tencent),
            "openstack" => Ok(Self::Openstack),
            _ => Err(()),
        }
    }
}

/// Whether a cluster's nodes share one CSP's private network (`Single`)
/// or span providers and talk over public IPs (`Multi`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceType {
    Single,
    Multi,
}

/// Container-network-interface plug-in installed on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkCni {
    Canal,
    Kilo,
    Flannel,
    Calico,
}

impl std::fmt::Display for NetworkCni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Canal => write!(f, "canal"),
            Self::Kilo => write!(f, "kilo"),
            Self::Flannel => write!(f, "flannel"),
            Self::Calico => write!(f, "calico"),
        }
    }
}

/// Node role within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    Worker,
}

impl Role {
    /// Prefix used when generating sequential node names.
    #[must_use]
    pub fn name_prefix(self) -> &'static str {
        match self {
            Self::ControlPlane => "control-plane",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name_prefix())
    }
}

/// Lifecycle phase of a cluster record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    Pending,
    Provisioning,
    Provisioned,
    Failed,
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Provisioned => write!(f, "Provisioned"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Observable status of a cluster record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub phase: ClusterPhase,
}

/// One node of a cluster as persisted in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: Role,
    pub public_ip: String,
    pub private_ip: String,
    pub csp: Csp,
    pub region: String,
    pub zone: String,
    pub spec: String,
    /// Reference to the SSH credential (private key material).
    pub credential: String,
    pub created_time: Option<DateTime<Utc>>,
}

/// Durable record of one Kubernetes cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub namespace: String,
    pub name: String,
    pub status: ClusterStatus,
    pub service_type: ServiceType,
    pub network_cni: NetworkCni,
    /// Kubernetes version the cluster was bootstrapped with.
    pub version: String,
    /// Name of the control-plane leader node; empty until the first
    /// control-plane machine has been registered.
    pub cp_leader: String,
    /// Infrastructure-broker grouping id backing this cluster.
    pub mcis: String,
    pub nodes: Vec<Node>,
    /// Admin kubeconfig captured when the control plane was initialized.
    #[serde(default)]
    pub kubeconfig: String,
    /// Store revision for compare-and-swap writes. Zero means "never
    /// persisted"; the store bumps it on every successful put.
    #[serde(default)]
    pub revision: u64,
}

impl Cluster {
    /// Create an empty cluster record in phase `Pending`.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        service_type: ServiceType,
        network_cni: NetworkCni,
        version: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            namespace: namespace.into(),
            mcis: name.clone(),
            name,
            status: ClusterStatus {
                phase: ClusterPhase::Pending,
            },
            service_type,
            network_cni,
            version: version.into(),
            cp_leader: String::new(),
            nodes: Vec::new(),
            kubeconfig: String::new(),
            revision: 0,
        }
    }

    #[must_use]
    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    #[must_use]
    pub fn exists_node(&self, name: &str) -> bool {
        self.find_node(name).is_some()
    }

    /// Remove a node entity from the roster. Returns whether it existed.
    pub fn delete_node(&mut self, name: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.name != name);
        self.nodes.len() != before
    }

    /// Next free index for generated `<role>-<idx>` node names: one past
    /// the highest numeric suffix currently in use for that role.
    #[must_use]
    pub fn next_node_index(&self, role: Role) -> u32 {
        let prefix = format!("{}-", role.name_prefix());
        self.nodes
            .iter()
            .filter(|n| n.role == role)
            .filter_map(|n| n.name.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// Key/value pair carried in cloud-config requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Kubernetes networking parameters handed to `kubeadm init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    pub pod_cidr: String,
    pub service_cidr: String,
    pub service_dns_domain: String,
    /// Optional cloud.conf contents rendered on the leader in `SINGLE`
    /// mode, one `key=value` line per entry.
    #[serde(default)]
    pub cloud_config: Vec<KeyValue>,
}

/// Outcome code of a service operation that is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    Success,
    NotFound,
}

/// Structured status returned by node/cluster removal operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Success,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::NotFound,
            message: message.into(),
        }
    }
}
