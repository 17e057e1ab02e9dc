//! Remote target filesystem layout.
//!
//! Every machine carries a fixed directory of staged scripts and
//! manifests. The core invokes them by name and interprets their output;
//! their contents ship with the deployment, not with this crate.

/// Directory the bootstrap assets are staged under on every machine.
pub const REMOTE_TARGET_PATH: &str = "/tmp/mcks";

/// Bootstrap scripts, chosen by the machine's distribution family.
pub const BOOTSTRAP_UBUNTU_SCRIPT: &str = "bootstrap-ubuntu.sh";
pub const BOOTSTRAP_CENTOS_SCRIPT: &str = "bootstrap-centos.sh";

/// Control-plane initialization and supporting scripts.
pub const K8S_INIT_SCRIPT: &str = "k8s-init.sh";
pub const HAPROXY_SCRIPT: &str = "haproxy.sh";
pub const GEN_CLOUD_CONFIG_SCRIPT: &str = "gen-cloud-config.sh";

/// CNI manifests.
pub const CNI_CANAL_FILE: &str = "canal.yaml";
pub const CNI_FLANNEL_FILE: &str = "flannel.yaml";
pub const CNI_CALICO_FILE: &str = "calico.yaml";
pub const CNI_KILO_FLANNEL_FILE: &str = "kilo-flannel.yaml";
pub const CNI_KILO_CRDS_FILE: &str = "kilo-crds.yaml";
pub const CNI_KILO_KUBEADM_FILE: &str = "kilo-kubeadm.yaml";

/// Cloud-controller-manager manifests.
pub const CCM_AWS_ROLE_SA_FILE: &str = "ccm-aws-role-sa.yaml";
pub const CCM_AWS_DS_FILE: &str = "ccm-aws-daemonset.yaml";
pub const CCM_OPENSTACK_ROLE_BINDINGS_FILE: &str = "ccm-openstack-role-bindings.yaml";
pub const CCM_OPENSTACK_ROLES_FILE: &str = "ccm-openstack-roles.yaml";
pub const CCM_OPENSTACK_DS_FILE: &str = "ccm-openstack-daemonset.yaml";

/// cloud.conf rendered by [`GEN_CLOUD_CONFIG_SCRIPT`] on the leader.
pub const CCM_CLOUD_CONFIG_FILE: &str = "cloud.conf";
