//! Cluster provisioning orchestrator.
//!
//! A [`Provisioner`] carries one cluster record through bootstrap,
//! control-plane initialization, CNI and CCM installation, node joins
//! and label assignment. It is confined to a single service invocation:
//! machines staged here never outlive the call, and every durable
//! mutation goes back through the store in the calling service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::broker::{BrokerClient, Vm, VM_USER_ACCOUNT};
use crate::error::{Error, Result};
use crate::join::{parse_join_commands, JoinCommands};
use crate::machine::Machine;
use crate::model::{Cluster, Csp, KubernetesConfig, NetworkCni, Node, Role, ServiceType};
use crate::remote::{
    CCM_AWS_DS_FILE, CCM_AWS_ROLE_SA_FILE, CCM_CLOUD_CONFIG_FILE, CCM_OPENSTACK_DS_FILE,
    CCM_OPENSTACK_ROLES_FILE, CCM_OPENSTACK_ROLE_BINDINGS_FILE, CNI_CALICO_FILE, CNI_CANAL_FILE,
    CNI_FLANNEL_FILE, CNI_KILO_CRDS_FILE, CNI_KILO_FLANNEL_FILE, CNI_KILO_KUBEADM_FILE,
    GEN_CLOUD_CONFIG_SCRIPT, HAPROXY_SCRIPT, K8S_INIT_SCRIPT, REMOTE_TARGET_PATH,
};
use crate::ssh::RemoteExecutor;

/// Marker kubeadm prints when the control plane initialized.
const CONTROL_PLANE_INIT_MARKER: &str =
    "Your Kubernetes control-plane has initialized successfully";

/// Node labels applied to every machine.
pub const LABEL_KEY_CSP: &str = "topology.mcks.io/csp";
pub const LABEL_KEY_REGION: &str = "topology.kubernetes.io/region";
pub const LABEL_KEY_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_KEY_CLUSTER: &str = "topology.mcks.io/cluster";

/// JSON payload occasionally carried in a failed VM's system message.
#[derive(Deserialize)]
struct SystemStatus {
    #[serde(default)]
    message: String,
}

/// Orchestrates provisioning of one cluster.
pub struct Provisioner {
    pub cluster: Cluster,
    exec: Arc<dyn RemoteExecutor>,
    broker: Arc<BrokerClient>,
    scripts_dir: PathBuf,
    /// Name of the control-plane leader machine.
    leader_name: Option<String>,
    /// Leader rebuilt from the persisted record during node expansion;
    /// never present when the leader was appended in this invocation.
    detached_leader: Option<Machine>,
    control_planes: HashMap<String, Machine>,
    workers: HashMap<String, Machine>,
    cp_order: Vec<String>,
    worker_order: Vec<String>,
}

impl Provisioner {
    /// Wrap a cluster record. When the record already names a
    /// control-plane leader, the leader machine is reconstructed from
    /// its node entity without entering the control-plane map.
    #[must_use]
    pub fn new(
        cluster: Cluster,
        exec: Arc<dyn RemoteExecutor>,
        broker: Arc<BrokerClient>,
        scripts_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut leader_name = None;
        let mut detached_leader = None;
        if !cluster.cp_leader.is_empty() {
            if let Some(node) = cluster.find_node(&cluster.cp_leader) {
                leader_name = Some(node.name.clone());
                detached_leader = Some(Machine::from_node(node, VM_USER_ACCOUNT));
            }
        }
        Self {
            cluster,
            exec,
            broker,
            scripts_dir: scripts_dir.into(),
            leader_name,
            detached_leader,
            control_planes: HashMap::new(),
            workers: HashMap::new(),
            cp_order: Vec::new(),
            worker_order: Vec::new(),
        }
    }

    /// Stage a control-plane machine. The first one becomes the leader;
    /// later appends never displace it.
    pub fn append_control_plane_machine(
        &mut self,
        name: &str,
        csp: Csp,
        region: &str,
        zone: &str,
        credential: &str,
    ) {
        let machine = Machine::new(name, csp, Role::ControlPlane, region, zone, credential);
        if self.leader_name.is_none() {
            self.leader_name = Some(machine.name.clone());
        }
        self.cp_order.push(machine.name.clone());
        self.control_planes.insert(machine.name.clone(), machine);
    }

    /// Stage a worker machine.
    pub fn append_worker_node_machine(
        &mut self,
        name: &str,
        csp: Csp,
        region: &str,
        zone: &str,
        credential: &str,
    ) {
        let machine = Machine::new(name, csp, Role::Worker, region, zone, credential);
        self.worker_order.push(machine.name.clone());
        self.workers.insert(machine.name.clone(), machine);
    }

    #[must_use]
    pub fn leader_name(&self) -> Option<&str> {
        self.leader_name.as_deref()
    }

    /// Names of every staged machine, control planes first, in append
    /// order. The detached leader is not staged and not included.
    #[must_use]
    pub fn machine_names(&self) -> Vec<String> {
        self.cp_order
            .iter()
            .chain(self.worker_order.iter())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn control_plane_names(&self) -> Vec<String> {
        self.cp_order.clone()
    }

    #[must_use]
    pub fn worker_names(&self) -> Vec<String> {
        self.worker_order.clone()
    }

    fn leader(&self) -> Result<&Machine> {
        let name = self
            .leader_name
            .as_ref()
            .ok_or_else(|| Error::Validation("no control-plane leader machine".to_string()))?;
        self.control_planes
            .get(name)
            .or(self.detached_leader.as_ref())
            .ok_or_else(|| Error::Validation("no control-plane leader machine".to_string()))
    }

    /// Match a name against the detached leader, then the control-plane
    /// map, then the worker map.
    fn find_machine_mut(&mut self, name: &str) -> Option<&mut Machine> {
        if let Some(leader) = self.detached_leader.as_mut() {
            if leader.name == name {
                return Some(leader);
            }
        }
        if self.control_planes.contains_key(name) {
            return self.control_planes.get_mut(name);
        }
        self.workers.get_mut(name)
    }

    fn contains_machine(&self, name: &str) -> bool {
        self.detached_leader
            .as_ref()
            .is_some_and(|l| l.name == name)
            || self.control_planes.contains_key(name)
            || self.workers.contains_key(name)
    }

    /// Reconcile freshly created VM descriptors with the staged
    /// machines, by name. Returns the node records of every bound
    /// machine.
    pub fn bind_vm(&mut self, vms: &[Vm]) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();

        for vm in vms {
            if vm.is_failed() {
                let cause = serde_json::from_str::<SystemStatus>(&vm.system_message)
                    .map_or_else(|_| vm.system_message.clone(), |s| s.message);
                return Err(Error::VmCreation {
                    status: vm.status.clone(),
                    cause,
                });
            }
            if vm.public_ip.is_empty() && self.cluster.service_type == ServiceType::Multi {
                return Err(Error::VmUnboundedIp {
                    status: vm.status.clone(),
                    kind: "public",
                });
            }
            if vm.private_ip.is_empty() && self.cluster.service_type == ServiceType::Single {
                return Err(Error::VmUnboundedIp {
                    status: vm.status.clone(),
                    kind: "private",
                });
            }

            let Some(machine) = self.find_machine_mut(&vm.name) else {
                return Err(Error::UnknownMachine(vm.name.clone()));
            };
            machine.public_ip = vm.public_ip.clone();
            machine.private_ip = vm.private_ip.clone();
            machine.username = if vm.user_account.is_empty() {
                VM_USER_ACCOUNT.to_string()
            } else {
                vm.user_account.clone()
            };
            // the broker occasionally reports empty region/zone; keep
            // the originally requested placement then
            if !vm.region.region.is_empty() {
                machine.region = vm.region.region.clone();
            }
            if !vm.region.zone.is_empty() {
                machine.zone = vm.region.zone.clone();
            }
            machine.spec = vm.csp_view_vm_detail.vm_spec_name.clone();
            nodes.push(machine.to_node());
            // hostname may change across the creation reboot
            machine.reset_full_name();
        }

        Ok(nodes)
    }

    /// Probe and bootstrap every staged machine concurrently. The first
    /// failure cancels the remaining work and is returned; half-done
    /// peers are left for the caller's cleanup.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let cni = self.cluster.network_cni;
        let service_type = self.cluster.service_type;
        let version = self.cluster.version.clone();
        let exec = Arc::clone(&self.exec);
        let scripts_dir = self.scripts_dir.clone();

        let tasks = self
            .control_planes
            .values_mut()
            .chain(self.workers.values_mut())
            .map(|machine| {
                let exec = Arc::clone(&exec);
                let version = version.clone();
                let scripts_dir = scripts_dir.clone();
                async move {
                    machine.connection_test(exec.as_ref()).await?;
                    machine
                        .bootstrap(exec.as_ref(), &scripts_dir, cni, &version, service_type)
                        .await
                }
            });

        futures::future::try_join_all(tasks).await?;
        Ok(())
    }

    /// Initialize the control plane on the leader and return the join
    /// commands plus the admin kubeconfig.
    pub async fn init_control_plane(
        &mut self,
        k8s: &KubernetesConfig,
    ) -> Result<(JoinCommands, String)> {
        let leader = self.leader()?;
        let target = leader.ssh_target();
        let leader_csp = leader.csp;

        let output = self
            .exec
            .execute(
                &target,
                &format!(
                    "cd {REMOTE_TARGET_PATH}; ./{K8S_INIT_SCRIPT} {} {} {} {} {}",
                    k8s.pod_cidr,
                    k8s.service_cidr,
                    k8s.service_dns_domain,
                    leader.public_ip,
                    leader.private_ip
                ),
            )
            .await
            .map_err(|e| Error::ControlPlaneInit(format!("{K8S_INIT_SCRIPT}, err={e}")))?;
        if !output.contains(CONTROL_PLANE_INIT_MARKER) {
            return Err(Error::ControlPlaneInit(format!(
                "the output not contains '{CONTROL_PLANE_INIT_MARKER}'"
            )));
        }
        let join_commands = parse_join_commands(&output);
        info!(cluster = %self.cluster.name, "control-plane initialized");

        if self.cluster.service_type == ServiceType::Single && !k8s.cloud_config.is_empty() {
            let contents: String = k8s
                .cloud_config
                .iter()
                .map(|kv| format!("{}={}\n", kv.key, kv.value))
                .collect();
            self.exec
                .execute(
                    &target,
                    &format!(
                        "cd {REMOTE_TARGET_PATH}; ./{GEN_CLOUD_CONFIG_SCRIPT} {leader_csp} $'{contents}'"
                    ),
                )
                .await
                .map_err(|e| {
                    Error::ControlPlaneInit(format!("{GEN_CLOUD_CONFIG_SCRIPT}, err={e}"))
                })?;
        }

        let kubeconfig = self
            .exec
            .execute(&target, "sudo cat /etc/kubernetes/admin.conf")
            .await
            .unwrap_or_default();

        Ok((join_commands, kubeconfig))
    }

    /// Render one `server` line per control-plane machine into the
    /// staged haproxy template and execute the result on the leader.
    pub async fn install_haproxy(&mut self) -> Result<()> {
        let single = self.cluster.service_type == ServiceType::Single;
        let exec = Arc::clone(&self.exec);

        let mut servers = String::new();
        for name in self.cp_order.clone() {
            let Some(machine) = self.control_planes.get_mut(&name) else {
                continue;
            };
            let host = if single {
                machine.full_name(exec.as_ref()).await?
            } else {
                machine.name.clone()
            };
            servers.push_str(&format!(
                "  server  {}  {}:6443  check\\n",
                host, machine.private_ip
            ));
        }

        let target = self.leader()?.ssh_target();
        let rendered = self
            .exec
            .execute(
                &target,
                &format!(
                    "sudo sed 's/^{{{{SERVERS}}}}/{servers}/g' {REMOTE_TARGET_PATH}/{HAPROXY_SCRIPT}"
                ),
            )
            .await?;
        self.exec.execute(&target, &rendered).await?;
        Ok(())
    }

    /// Apply the manifest set of the cluster's CNI choice.
    pub async fn install_network_cni(&self) -> Result<()> {
        let files: &[&str] = match self.cluster.network_cni {
            NetworkCni::Canal => &[CNI_CANAL_FILE],
            NetworkCni::Kilo => &[
                CNI_KILO_FLANNEL_FILE,
                CNI_KILO_CRDS_FILE,
                CNI_KILO_KUBEADM_FILE,
            ],
            NetworkCni::Flannel => &[CNI_FLANNEL_FILE],
            NetworkCni::Calico => &[CNI_CALICO_FILE],
        };
        for file in files {
            self.kubectl(&format!("apply -f {REMOTE_TARGET_PATH}/{file}"))
                .await?;
        }
        Ok(())
    }

    /// Install the leader CSP's cloud-controller-manager bundle. CSPs
    /// without one are a no-op.
    pub async fn install_ccm(&self) -> Result<()> {
        let files: &[&str] = match self.leader()?.csp {
            Csp::Aws => &[CCM_AWS_ROLE_SA_FILE, CCM_AWS_DS_FILE],
            Csp::Openstack => &[
                CCM_OPENSTACK_ROLE_BINDINGS_FILE,
                CCM_OPENSTACK_ROLES_FILE,
                CCM_OPENSTACK_DS_FILE,
            ],
            _ => &[],
        };
        if files.is_empty() {
            return Ok(());
        }

        self.kubectl(&format!(
            "create secret -n kube-system generic cloud-config --from-file=cloud.conf={REMOTE_TARGET_PATH}/{CCM_CLOUD_CONFIG_FILE}"
        ))
        .await?;
        for file in files {
            self.kubectl(&format!("apply -f {REMOTE_TARGET_PATH}/{file}"))
                .await?;
        }
        Ok(())
    }

    /// Join every non-leader control-plane machine, serially to keep
    /// etcd quorum forming predictably.
    pub async fn join_control_plane_machines(&self, join_cmd: &str) -> Result<()> {
        for name in &self.cp_order {
            if self.leader_name.as_deref() == Some(name) {
                continue;
            }
            if let Some(machine) = self.control_planes.get(name) {
                machine.join_control_plane(self.exec.as_ref(), join_cmd).await?;
            }
        }
        Ok(())
    }

    /// Join every staged worker, strictly serialized and in append
    /// order; simultaneous joins can race the kubeadm control plane.
    pub async fn join_workers(&self, join_cmd: &str) -> Result<()> {
        for name in &self.worker_order {
            if let Some(machine) = self.workers.get(name) {
                machine.join_worker(self.exec.as_ref(), join_cmd).await?;
            }
        }
        Ok(())
    }

    /// Label every staged machine with its placement, and wire kilo's
    /// full-mesh annotations when that CNI is installed.
    pub async fn assign_node_label_annotation(&mut self) -> Result<()> {
        let single = self.cluster.service_type == ServiceType::Single;
        let cluster_name = self.cluster.name.clone();
        let exec = Arc::clone(&self.exec);

        // resolve kubectl node identities before touching the leader
        let mut entries = Vec::new();
        for name in self.machine_names() {
            let Some(machine) = self.find_machine_mut(&name) else {
                continue;
            };
            let k8s_name = if single {
                machine.full_name(exec.as_ref()).await?
            } else {
                machine.name.clone()
            };
            entries.push((
                k8s_name,
                machine.csp,
                machine.region.clone(),
                machine.zone.clone(),
                machine.name.clone(),
            ));
        }

        for (k8s_name, csp, region, zone, _) in &entries {
            self.kubectl(&format!("label nodes {k8s_name} {LABEL_KEY_CSP}={csp}"))
                .await?;
            self.kubectl(&format!("label nodes {k8s_name} {LABEL_KEY_REGION}={region}"))
                .await?;
            self.kubectl(&format!("label nodes {k8s_name} {LABEL_KEY_ZONE}={zone}"))
                .await?;
            self.kubectl(&format!(
                "label nodes {k8s_name} {LABEL_KEY_CLUSTER}={cluster_name}"
            ))
            .await?;
        }

        if self.cluster.network_cni == NetworkCni::Kilo {
            for (_, _, _, _, name) in &entries {
                self.kubectl(&format!(
                    "annotate nodes {name} kilo.squat.ai/location={name}"
                ))
                .await?;
                self.kubectl(&format!(
                    "annotate nodes {name} kilo.squat.ai/persistent-keepalive=25"
                ))
                .await?;
            }
        }

        Ok(())
    }

    /// Ask kubeadm for a freshly printed worker join command.
    pub async fn new_worker_join_command(&self) -> Result<String> {
        let leader = self.leader()?;
        let join_cmd = self
            .exec
            .execute(
                &leader.ssh_target(),
                "sudo kubeadm token create --print-join-command",
            )
            .await?;
        if join_cmd.is_empty() {
            return Err(Error::JoinTokenEmpty);
        }
        Ok(join_cmd)
    }

    /// Run a kubectl command on the leader against the admin kubeconfig.
    pub async fn kubectl(&self, args: &str) -> Result<String> {
        let command = format!("sudo kubectl {args} --kubeconfig=/etc/kubernetes/admin.conf");
        let leader = self.leader()?;
        self.exec
            .execute(&leader.ssh_target(), &command)
            .await
            .map_err(|_| Error::KubectlFailed { command })
    }

    /// Drain a node, delete it from Kubernetes and destroy its VM. No
    /// partial progress is reversed here; higher-level cleanup belongs
    /// to the caller.
    pub async fn drain_and_delete_node(&mut self, node_name: &str) -> Result<()> {
        let mut k8s_node_name = node_name.to_string();

        if self.cluster.service_type == ServiceType::Single
            && self.leader_name.as_deref() != Some(node_name)
        {
            let exec = Arc::clone(&self.exec);
            let resolved = if self.contains_machine(node_name) {
                match self.find_machine_mut(node_name) {
                    Some(machine) => Some(machine.full_name(exec.as_ref()).await),
                    None => None,
                }
            } else if let Some(node) = self.cluster.find_node(node_name) {
                let mut transient = Machine::from_node(node, VM_USER_ACCOUNT);
                Some(transient.full_name(exec.as_ref()).await)
            } else {
                None
            };
            if let Some(resolved) = resolved {
                k8s_node_name = resolved.map_err(|_| {
                    Error::Validation(format!("Failed to find a node (node={node_name})"))
                })?;
            }
        }

        self.kubectl(&format!(
            "drain {k8s_node_name} --ignore-daemonsets --force --delete-local-data"
        ))
        .await?;
        self.kubectl(&format!("delete node {k8s_node_name}")).await?;

        let existed = self
            .broker
            .delete_vm(&self.cluster.namespace, &self.cluster.mcis, node_name)
            .await
            .map_err(|e| {
                warn!(vm = %node_name, error = %e, "vm removal failed");
                Error::Validation(format!("Failed to remove a VM ({node_name})"))
            })?;
        if !existed {
            return Err(Error::Validation(format!(
                "Failed to remove a VM (vm={node_name}, cause='Could not be found a VM')"
            )));
        }
        info!(node = %node_name, "node drained and removed");
        Ok(())
    }
}
