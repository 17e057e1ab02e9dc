//! Cluster lifecycle service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::{node_name, verify_namespace, ClusterReq};
use crate::broker::{BrokerClient, McisCreateReq, VmCreateReq};
use crate::cloud::aws::{self, AwsTagging, Ec2Api};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Cluster, ClusterPhase, Csp, Role, ServiceType, Status};
use crate::provision::Provisioner;
use crate::ssh::RemoteExecutor;
use crate::store::Store;

/// Settle delay between VM binding and bootstrap.
const BOOTSTRAP_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Entry points for creating, inspecting and deleting clusters.
pub struct ClusterService {
    store: Arc<dyn Store>,
    broker: Arc<BrokerClient>,
    exec: Arc<dyn RemoteExecutor>,
    ec2: Arc<dyn Ec2Api>,
    config: Config,
}

impl ClusterService {
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

    /// All clusters of a namespace.
    pub async fn list_cluster(&self, namespace: &str) -> Result<Vec<Cluster>> {
        verify_namespace(&self.broker, namespace).await?;
        Ok(self.store.list(namespace).await?)
    }

    /// One cluster by name.
    pub async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Cluster> {
        verify_namespace(&self.broker, namespace).await?;
        self.store
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::ClusterNotFound {
                namespace: namespace.to_string(),
                cluster: name.to_string(),
            })
    }

    /// Create a cluster: create its infrastructure through the broker,
    /// bootstrap every machine, initialize the control plane on the
    /// leader, wire CNI and CCM, join the remaining nodes and persist
    /// the roster. Failures after VM creation destroy the MCIS and park
    /// the record in phase `Failed`.
    pub async fn create_cluster(&self, namespace: &str, req: &ClusterReq) -> Result<Cluster> {
        verify_namespace(&self.broker, namespace).await?;

        if req.control_plane.is_empty() {
            return Err(Error::Validation(
                "At least one control-plane node is required".to_string(),
            ));
        }
        if self.store.get(namespace, &req.name).await?.is_some() {
            return Err(Error::Validation(format!(
                "Cluster '{}' already exists. (namespace={namespace})",
                req.name
            )));
        }

        // claim the name; concurrent creators lose on the CAS
        let mut cluster = Cluster::new(
            namespace,
            &req.name,
            req.service_type,
            req.network_cni,
            &req.version,
        );
        self.store.put(&mut cluster).await?;

        let mcis_name = cluster.mcis.clone();
        let mut provisioner = Provisioner::new(
            cluster,
            Arc::clone(&self.exec),
            Arc::clone(&self.broker),
            self.config.scripts_dir.clone(),
        );

        // resolve the MCIR sets and stage one machine per requested VM
        let mut vm_reqs: Vec<VmCreateReq> = Vec::new();
        for (role, pools) in [
            (Role::ControlPlane, &req.control_plane),
            (Role::Worker, &req.worker),
        ] {
            let mut idx = 1;
            for pool in pools {
                let mcir = match self
                    .broker
                    .ensure_mcir(namespace, &pool.connection, &pool.spec)
                    .await
                {
                    Ok(mcir) => mcir,
                    Err(e) => {
                        self.fail_cluster(&mut provisioner, false).await;
                        return Err(e.into());
                    }
                };
                for _ in 0..pool.count.max(1) {
                    let name = node_name(role, idx);
                    vm_reqs.push(VmCreateReq {
                        name: name.clone(),
                        connection_name: pool.connection.clone(),
                        image_id: mcir.image_id.clone(),
                        spec_id: mcir.spec_id.clone(),
                        v_net_id: mcir.v_net_id.clone(),
                        security_group_ids: vec![mcir.security_group_id.clone()],
                        ssh_key_id: mcir.ssh_key_id.clone(),
                        user_account: mcir.username.clone(),
                        root_disk_type: pool.root_disk_type.clone(),
                        root_disk_size: pool.root_disk_size.clone(),
                    });
                    match role {
                        Role::ControlPlane => provisioner.append_control_plane_machine(
                            &name,
                            mcir.csp,
                            &mcir.region,
                            &mcir.zone,
                            &mcir.credential,
                        ),
                        Role::Worker => provisioner.append_worker_node_machine(
                            &name,
                            mcir.csp,
                            &mcir.region,
                            &mcir.zone,
                            &mcir.credential,
                        ),
                    }
                    idx += 1;
                }
            }
        }

        provisioner.cluster.status.phase = ClusterPhase::Provisioning;
        if let Err(e) = self.store.put(&mut provisioner.cluster).await {
            self.fail_cluster(&mut provisioner, false).await;
            return Err(e.into());
        }

        let mcis = match self
            .broker
            .create_mcis(
                namespace,
                &McisCreateReq {
                    name: mcis_name,
                    vms: vm_reqs,
                },
            )
            .await
        {
            Ok(mcis) => mcis,
            Err(e) => {
                self.fail_cluster(&mut provisioner, true).await;
                return Err(e.into());
            }
        };
        info!(namespace = %namespace, cluster = %req.name, vms = mcis.vms.len(),
              "mcis creation has been completed");

        let result = self.provision(&mut provisioner, req, &mcis).await;
        if let Err(e) = result {
            self.fail_cluster(&mut provisioner, true).await;
            return Err(e);
        }

        info!(namespace = %namespace, cluster = %req.name, "cluster creation has been completed");
        Ok(provisioner.cluster)
    }

    /// The provisioning sequence proper, separated so any failure takes
    /// the single cleanup path in `create_cluster`.
    async fn provision(
        &self,
        provisioner: &mut Provisioner,
        req: &ClusterReq,
        mcis: &crate::broker::Mcis,
    ) -> Result<()> {
        let namespace = provisioner.cluster.namespace.clone();
        let cluster_name = provisioner.cluster.name.clone();

        let nodes = provisioner.bind_vm(&mcis.vms)?;
        provisioner.cluster.nodes = nodes;
        provisioner.cluster.cp_leader = provisioner
            .leader_name()
            .map(ToString::to_string)
            .unwrap_or_default();
        self.store.put(&mut provisioner.cluster).await?;

        tokio::time::sleep(BOOTSTRAP_SETTLE_DELAY).await;
        provisioner.bootstrap().await?;
        info!(namespace = %namespace, cluster = %cluster_name, "bootstrap has been completed");

        if provisioner.control_plane_names().len() > 1 {
            provisioner.install_haproxy().await?;
        }

        let (join_cmds, kubeconfig) = provisioner.init_control_plane(&req.kubernetes).await?;
        provisioner.cluster.kubeconfig = kubeconfig;
        info!(namespace = %namespace, cluster = %cluster_name,
              "control-plane initialization has been completed");

        provisioner
            .join_control_plane_machines(&join_cmds.control_plane)
            .await?;
        provisioner.install_network_cni().await?;
        provisioner.install_ccm().await?;
        provisioner.join_workers(&join_cmds.worker).await?;
        info!(namespace = %namespace, cluster = %cluster_name, "node joins have been completed");

        match provisioner.assign_node_label_annotation().await {
            Ok(()) => info!(namespace = %namespace, cluster = %cluster_name,
                            "node label assignment has been completed"),
            Err(e) => warn!(namespace = %namespace, cluster = %cluster_name, error = %e,
                            "failed to assign node labels"),
        }

        if provisioner.cluster.service_type == ServiceType::Single
            && provisioner.cluster.nodes.iter().any(|n| n.csp == Csp::Aws)
        {
            let tagging = AwsTagging::new(&cluster_name)?;
            aws::prepare_ccm(
                self.ec2.as_ref(),
                &tagging,
                &self.config.aws,
                &mcis.vms,
                &provisioner.control_plane_names(),
            )
            .await?;
        }

        let now = Utc::now();
        for node in &mut provisioner.cluster.nodes {
            node.created_time = Some(now);
        }
        provisioner.cluster.status.phase = ClusterPhase::Provisioned;
        self.store.put(&mut provisioner.cluster).await?;
        Ok(())
    }

    /// Park a failed creation: destroy the MCIS when VMs may exist,
    /// record phase `Failed`. Best-effort on both counts.
    async fn fail_cluster(&self, provisioner: &mut Provisioner, destroy_mcis: bool) {
        let namespace = provisioner.cluster.namespace.clone();
        let cluster_name = provisioner.cluster.name.clone();

        if destroy_mcis {
            if let Err(e) = self
                .broker
                .delete_mcis(&namespace, &provisioner.cluster.mcis)
                .await
            {
                warn!(namespace = %namespace, cluster = %cluster_name, error = %e,
                      "failed to destroy the mcis of a failed cluster");
            }
        }
        provisioner.cluster.status.phase = ClusterPhase::Failed;
        if let Err(e) = self.store.put(&mut provisioner.cluster).await {
            warn!(namespace = %namespace, cluster = %cluster_name, error = %e,
                  "failed to record the Failed phase");
        }
    }

    /// Delete a cluster: destroy its MCIS and remove the record. A
    /// missing cluster is a status, not an error.
    pub async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<Status> {
        verify_namespace(&self.broker, namespace).await?;

        let Some(mut cluster) = self.store.get(namespace, name).await? else {
            return Ok(Status::not_found(format!(
                "Could not be found a cluster '{name}'"
            )));
        };

        cluster.status.phase = ClusterPhase::Deleting;
        self.store.put(&mut cluster).await?;

        if !self.broker.delete_mcis(namespace, &cluster.mcis).await? {
            warn!(namespace = %namespace, cluster = %name, "mcis was already gone");
        }
        self.store.remove(namespace, name).await?;

        info!(namespace = %namespace, cluster = %name, "cluster deletion has been completed");
        Ok(Status::success(format!(
            "Cluster '{name}' has been deleted"
        )))
    }
}
