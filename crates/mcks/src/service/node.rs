//! Node lifecycle service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::{node_name, verify_namespace, NodeReq};
use crate::broker::{BrokerClient, Vm, VmCreateReq};
use crate::cloud::aws::{self, AwsTagging, Ec2Api};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ClusterPhase, Csp, Node, Role, ServiceType, Status};
use crate::provision::Provisioner;
use crate::ssh::RemoteExecutor;
use crate::store::Store;

/// Settle delay between VM binding and bootstrap, giving cloud
/// networking a moment to stabilize.
const BOOTSTRAP_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Entry points for listing, adding and removing cluster nodes.
pub struct NodeService {
    store: Arc<dyn Store>,
    broker: Arc<BrokerClient>,
    exec: Arc<dyn RemoteExecutor>,
    ec2: Arc<dyn Ec2Api>,
    config: Config,
}

impl NodeService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<BrokerClient>,
        exec: Arc<dyn RemoteExecutor>,
        ec2: Arc<dyn Ec2Api>,
        config: Config,
    ) -> Self {
        Self {
            store,
            broker,
            exec,
            ec2,
            config,
        }
    }

    /// All nodes of a cluster. A missing cluster yields an empty list.
    pub async fn list_node(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Node>> {
        verify_namespace(&self.broker, namespace).await?;
        Ok(self
            .store
            .get(namespace, cluster_name)
            .await?
            .map(|cluster| cluster.nodes)
            .unwrap_or_default())
    }

    /// One node by name.
    pub async fn get_node(
        &self,
        namespace: &str,
        cluster_name: &str,
        name: &str,
    ) -> Result<Node> {
        verify_namespace(&self.broker, namespace).await?;
        self.store
            .get(namespace, cluster_name)
            .await?
            .and_then(|cluster| cluster.find_node(name).cloned())
            .ok_or_else(|| Error::NodeNotFound {
                namespace: namespace.to_string(),
                cluster: cluster_name.to_string(),
                node: name.to_string(),
            })
    }

    /// Add worker nodes to a provisioned cluster.
    ///
    /// Any failure after VM creation rolls the new nodes back through
    /// the best-effort cleanup; the cluster record ends up with either
    /// every requested worker or none of them.
    pub async fn add_node(
        &self,
        namespace: &str,
        cluster_name: &str,
        req: &NodeReq,
    ) -> Result<Vec<Node>> {
        verify_namespace(&self.broker, namespace).await?;

        let cluster = self
            .store
            .get(namespace, cluster_name)
            .await?
            .ok_or_else(|| Error::ClusterNotFound {
                namespace: namespace.to_string(),
                cluster: cluster_name.to_string(),
            })?;
        if cluster.status.phase != ClusterPhase::Provisioned {
            return Err(Error::Validation(format!(
                "Unable to add a node. status is '{}'.",
                cluster.status.phase
            )));
        }

        let mcis = self
            .broker
            .get_mcis(namespace, &cluster.mcis)
            .await?
            .ok_or_else(|| {
                Error::Validation(format!("Can't be found a MCIS '{}'.", cluster.mcis))
            })?;
        info!(namespace = %namespace, cluster = %cluster_name, "the inquiry has been completed");

        // a single-CSP cluster may not be extended into another provider
        if cluster.service_type == ServiceType::Single {
            let Some(first_vm) = mcis.vms.first() else {
                return Err(Error::Validation(format!(
                    "There is no VMs. (cluster={cluster_name})"
                )));
            };
            for worker in &req.worker {
                if worker.connection != first_vm.connection_name {
                    return Err(Error::Validation(format!(
                        "The new node must be the same connection config. (connection={})",
                        worker.connection
                    )));
                }
            }
        }

        let mcis_name = cluster.mcis.clone();
        let mut provisioner = Provisioner::new(
            cluster,
            Arc::clone(&self.exec),
            Arc::clone(&self.broker),
            self.config.scripts_dir.clone(),
        );

        // a fresh join command, before any VM exists to roll back
        let worker_join_cmd = provisioner.new_worker_join_command().await?;
        info!(namespace = %namespace, cluster = %cluster_name,
              "worker join-command inquiry has been completed");

        // create the MCIR set and the VMs
        let mut idx = provisioner.cluster.next_node_index(Role::Worker);
        let mut vms: Vec<Vm> = Vec::new();
        let mut worker_csp: Option<Csp> = None;
        for worker in &req.worker {
            let mcir = self
                .broker
                .ensure_mcir(namespace, &worker.connection, &worker.spec)
                .await?;
            worker_csp.get_or_insert(mcir.csp);

            for _ in 0..worker.count.max(1) {
                let name = node_name(Role::Worker, idx);
                let vm_req = VmCreateReq {
                    name: name.clone(),
                    connection_name: worker.connection.clone(),
                    image_id: mcir.image_id.clone(),
                    spec_id: mcir.spec_id.clone(),
                    v_net_id: mcir.v_net_id.clone(),
                    security_group_ids: vec![mcir.security_group_id.clone()],
                    ssh_key_id: mcir.ssh_key_id.clone(),
                    user_account: mcir.username.clone(),
                    root_disk_type: worker.root_disk_type.clone(),
                    root_disk_size: worker.root_disk_size.clone(),
                };
                match self.broker.create_vm(namespace, &mcis_name, &vm_req).await {
                    Ok(vm) => {
                        vms.push(vm);
                        provisioner.append_worker_node_machine(
                            &name,
                            mcir.csp,
                            &mcir.region,
                            &mcir.zone,
                            &mcir.credential,
                        );
                        idx += 1;
                    }
                    Err(e) => {
                        clean_up_nodes(&mut provisioner, self.store.as_ref()).await;
                        return Err(e.into());
                    }
                }
            }
        }
        info!(namespace = %namespace, cluster = %cluster_name, vms = vms.len(),
              "vm creation has been completed");

        // bind descriptors and persist the partial roster
        let nodes = match provisioner.bind_vm(&vms) {
            Ok(nodes) => nodes,
            Err(e) => {
                clean_up_nodes(&mut provisioner, self.store.as_ref()).await;
                return Err(e);
            }
        };
        provisioner.cluster.nodes.extend(nodes);
        if let Err(e) = self.store.put(&mut provisioner.cluster).await {
            clean_up_nodes(&mut provisioner, self.store.as_ref()).await;
            return Err(e.into());
        }

        tokio::time::sleep(BOOTSTRAP_SETTLE_DELAY).await;
        if let Err(e) = provisioner.bootstrap().await {
            clean_up_nodes(&mut provisioner, self.store.as_ref()).await;
            return Err(e);
        }
        info!(namespace = %namespace, cluster = %cluster_name, "bootstrap has been completed");

        if let Err(e) = provisioner.join_workers(&worker_join_cmd).await {
            clean_up_nodes(&mut provisioner, self.store.as_ref()).await;
            return Err(e);
        }
        info!(namespace = %namespace, cluster = %cluster_name,
              "worker-nodes join has been completed");

        // labels are advisory; failure is not worth the new nodes
        match provisioner.assign_node_label_annotation().await {
            Ok(()) => info!(namespace = %namespace, cluster = %cluster_name,
                            "node label assignment has been completed"),
            Err(e) => warn!(namespace = %namespace, cluster = %cluster_name, error = %e,
                            "failed to assign node labels"),
        }

        if provisioner.cluster.service_type == ServiceType::Single
            && worker_csp == Some(Csp::Aws)
        {
            let prepared = match AwsTagging::new(cluster_name) {
                Ok(tagging) => {
                    aws::prepare_ccm(
                        self.ec2.as_ref(),
                        &tagging,
                        &self.config.aws,
                        &vms,
                        &provisioner.control_plane_names(),
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = prepared {
                clean_up_nodes(&mut provisioner, self.store.as_ref()).await;
                return Err(e.into());
            }
        }

        // stamp the new nodes and persist the final roster
        let now = Utc::now();
        for node in &mut provisioner.cluster.nodes {
            if node.created_time.is_none() {
                node.created_time = Some(now);
            }
        }
        if let Err(e) = self.store.put(&mut provisioner.cluster).await {
            clean_up_nodes(&mut provisioner, self.store.as_ref()).await;
            return Err(e.into());
        }
        info!(namespace = %namespace, cluster = %cluster_name,
              "nodes creation has been completed");

        Ok(provisioner.cluster.nodes)
    }

    /// Remove one node: drain it, delete it from Kubernetes, destroy
    /// its VM and drop its entity. The control-plane leader is never
    /// removable; a missing node is a status, not an error.
    pub async fn remove_node(
        &self,
        namespace: &str,
        cluster_name: &str,
        node_name: &str,
    ) -> Result<Status> {
        verify_namespace(&self.broker, namespace).await?;

        let cluster = self
            .store
            .get(namespace, cluster_name)
            .await?
            .ok_or_else(|| Error::ClusterNotFound {
                namespace: namespace.to_string(),
                cluster: cluster_name.to_string(),
            })?;
        if cluster.status.phase != ClusterPhase::Provisioned {
            return Err(Error::Validation(format!(
                "Unable to remove a node. status is '{}'.",
                cluster.status.phase
            )));
        }

        if node_name == cluster.cp_leader {
            return Err(Error::RemoveLeader);
        }
        if !cluster.exists_node(node_name) {
            return Ok(Status::not_found(format!(
                "Could not be found a node-entity '{node_name}'"
            )));
        }

        if self
            .broker
            .get_mcis(namespace, &cluster.mcis)
            .await?
            .is_none()
        {
            return Err(Error::Validation(format!(
                "Can't be found a MCIS '{}'.",
                cluster.mcis
            )));
        }
        info!(namespace = %namespace, cluster = %cluster_name, "the inquiry has been completed");

        let mut provisioner = Provisioner::new(
            cluster,
            Arc::clone(&self.exec),
            Arc::clone(&self.broker),
            self.config.scripts_dir.clone(),
        );
        provisioner.drain_and_delete_node(node_name).await?;

        provisioner.cluster.delete_node(node_name);
        self.store.put(&mut provisioner.cluster).await?;

        info!(namespace = %namespace, cluster = %cluster_name, node = %node_name,
              "node deletion has been completed");
        Ok(Status::success(format!(
            "Node '{node_name}' has been deleted"
        )))
    }
}

/// Best-effort rollback of the machines staged in a provisioner.
///
/// For every staged machine with a node entity: clear its credential and
/// addresses, drain and destroy it, and drop the entity, so a failed
/// expansion leaves no partial insertion behind. Failures are logged and
/// swallowed; the cluster is persisted regardless. A provisioner with no
/// staged machines makes this a no-op.
pub(crate) async fn clean_up_nodes(provisioner: &mut Provisioner, store: &dyn Store) {
    let namespace = provisioner.cluster.namespace.clone();
    let cluster_name = provisioner.cluster.name.clone();

    for name in provisioner.machine_names() {
        let mut exists = false;
        for node in &mut provisioner.cluster.nodes {
            if node.name == name {
                node.credential.clear();
                node.public_ip.clear();
                node.private_ip.clear();
                exists = true;
                break;
            }
        }
        if !exists {
            continue;
        }
        if let Err(e) = provisioner.drain_and_delete_node(&name).await {
            warn!(namespace = %namespace, cluster = %cluster_name, error = %e,
                  "clean-up of a node failed");
        }
        provisioner.cluster.delete_node(&name);
    }

    if let Err(e) = store.put(&mut provisioner.cluster).await {
        warn!(namespace = %namespace, cluster = %cluster_name, error = %e,
              "failed to update the cluster-entity during clean-up");
    }
    info!(namespace = %namespace, cluster = %cluster_name, "garbage data has been cleaned");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cluster, NetworkCni};
    use crate::ssh::SshExecutor;
    use crate::store::MemStore;

    #[tokio::test]
    async fn test_clean_up_on_clean_provisioner_is_a_noop() {
        let store = MemStore::new();
        let mut cluster = Cluster::new(
            "ns",
            "c1",
            ServiceType::Multi,
            NetworkCni::Canal,
            "1.23.13",
        );
        store.put(&mut cluster).await.unwrap();

        // nothing staged: no drains, no roster changes
        let mut provisioner = Provisioner::new(
            cluster,
            Arc::new(SshExecutor::new(&crate::config::SshConfig::default())),
            Arc::new(BrokerClient::new("http://127.0.0.1:1").unwrap()),
            "/opt/mcks/scripts",
        );
        clean_up_nodes(&mut provisioner, &store).await;

        let stored = store.get("ns", "c1").await.unwrap().unwrap();
        assert!(stored.nodes.is_empty());
    }
}
