//! In-memory machine representation and its primitive operations.
//!
//! A [`Machine`] is the provisioner's working view of one VM: the node
//! fields plus the SSH username and a lazily cached CSP-assigned
//! hostname. Machines never outlive the service call that created their
//! provisioner.

use std::path::Path;

use tracing::{debug, info};

use crate::cloud;
use crate::error::{Error, Result};
use crate::model::{Csp, NetworkCni, Node, Role, ServiceType};
use crate::remote::{BOOTSTRAP_CENTOS_SCRIPT, BOOTSTRAP_UBUNTU_SCRIPT, REMOTE_TARGET_PATH};
use crate::ssh::{RemoteExecutor, SshTarget};

/// Marker kubeadm prints when a node joined successfully.
const JOIN_SUCCESS_MARKER: &str = "This node has joined the cluster";

/// One VM as the provisioner works with it.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub csp: Csp,
    pub role: Role,
    pub region: String,
    pub zone: String,
    pub spec: String,
    pub public_ip: String,
    pub private_ip: String,
    pub username: String,
    /// Private key material used for SSH.
    pub credential: String,
    /// CSP-assigned hostname, resolved lazily in `SINGLE` mode.
    full_name: Option<String>,
}

impl Machine {
    /// A staged machine that still awaits its VM descriptor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        csp: Csp,
        role: Role,
        region: impl Into<String>,
        zone: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            csp,
            role,
            region: region.into(),
            zone: zone.into(),
            spec: String::new(),
            public_ip: String::new(),
            private_ip: String::new(),
            username: String::new(),
            credential: credential.into(),
            full_name: None,
        }
    }

    /// Rebuild a machine from a persisted node record.
    #[must_use]
    pub fn from_node(node: &Node, username: impl Into<String>) -> Self {
        Self {
            name: node.name.clone(),
            csp: node.csp,
            role: node.role,
            region: node.region.clone(),
            zone: node.zone.clone(),
            spec: node.spec.clone(),
            public_ip: node.public_ip.clone(),
            private_ip: node.private_ip.clone(),
            username: username.into(),
            credential: node.credential.clone(),
            full_name: None,
        }
    }

    /// Node record snapshot of this machine.
    #[must_use]
    pub fn to_node(&self) -> Node {
        Node {
            name: self.name.clone(),
            role: self.role,
            public_ip: self.public_ip.clone(),
            private_ip: self.private_ip.clone(),
            csp: self.csp,
            region: self.region.clone(),
            zone: self.zone.clone(),
            spec: self.spec.clone(),
            credential: self.credential.clone(),
            created_time: None,
        }
    }

    /// Connection coordinates for the remote executor. Machines are
    /// dialed on their public IP when one is bound, which is always the
    /// case in `MULTI` mode; `SINGLE`-mode machines without a public
    /// address fall back to the private one.
    #[must_use]
    pub fn ssh_target(&self) -> SshTarget {
        let host = if self.public_ip.is_empty() {
            self.private_ip.clone()
        } else {
            self.public_ip.clone()
        };
        SshTarget {
            name: self.name.clone(),
            host,
            port: 22,
            username: self.username.clone(),
            private_key: self.credential.clone(),
        }
    }

    /// Drop the cached CSP hostname so it is re-resolved.
    pub fn reset_full_name(&mut self) {
        self.full_name = None;
    }

    /// Liveness probe ahead of bootstrap.
    pub async fn connection_test(&self, exec: &dyn RemoteExecutor) -> Result<()> {
        exec.connection_test(&self.ssh_target()).await?;
        Ok(())
    }

    /// Stage the bootstrap assets and run the distribution-appropriate
    /// bootstrap script. In `SINGLE` mode the CSP-assigned hostname is
    /// resolved and cached afterwards.
    pub async fn bootstrap(
        &mut self,
        exec: &dyn RemoteExecutor,
        scripts_dir: &Path,
        cni: NetworkCni,
        version: &str,
        service_type: ServiceType,
    ) -> Result<()> {
        let target = self.ssh_target();

        exec.upload_dir(&target, scripts_dir, REMOTE_TARGET_PATH)
            .await?;

        let distro = exec
            .execute(&target, ". /etc/os-release; echo $ID")
            .await?;
        let script = match distro.as_str() {
            "ubuntu" | "debian" => BOOTSTRAP_UBUNTU_SCRIPT,
            _ => BOOTSTRAP_CENTOS_SCRIPT,
        };
        debug!(machine = %self.name, distro = %distro, script = %script, "bootstrapping");

        exec.execute(
            &target,
            &format!("cd {REMOTE_TARGET_PATH} && chmod +x ./*.sh && sudo ./{script} {cni} {version}"),
        )
        .await?;

        if service_type == ServiceType::Single {
            let full_name = cloud::resolve_local_hostname(self.csp, exec, &target).await?;
            info!(machine = %self.name, full_name = %full_name, "resolved csp hostname");
            self.full_name = Some(full_name);
        }

        Ok(())
    }

    /// The CSP-assigned hostname, resolving and caching it on first use.
    pub async fn full_name(&mut self, exec: &dyn RemoteExecutor) -> Result<String> {
        if let Some(name) = &self.full_name {
            return Ok(name.clone());
        }
        let full_name = cloud::resolve_local_hostname(self.csp, exec, &self.ssh_target()).await?;
        self.full_name = Some(full_name.clone());
        Ok(full_name)
    }

    /// Join this machine to the cluster as a worker.
    pub async fn join_worker(&self, exec: &dyn RemoteExecutor, join_cmd: &str) -> Result<()> {
        self.join(exec, join_cmd).await
    }

    /// Join this machine as an additional control plane.
    pub async fn join_control_plane(
        &self,
        exec: &dyn RemoteExecutor,
        join_cmd: &str,
    ) -> Result<()> {
        self.join(exec, join_cmd).await
    }

    async fn join(&self, exec: &dyn RemoteExecutor, join_cmd: &str) -> Result<()> {
        let output = exec
            .execute(&self.ssh_target(), &format!("sudo {join_cmd}"))
            .await
            .map_err(|e| Error::JoinFailed {
                node: self.name.clone(),
                cause: e.to_string(),
            })?;
        if output.contains(JOIN_SUCCESS_MARKER) {
            info!(machine = %self.name, "joined the cluster");
            Ok(())
        } else {
            Err(Error::JoinFailed {
                node: self.name.clone(),
                cause: "output does not contain the kubeadm join marker".to_string(),
            })
        }
    }
}
