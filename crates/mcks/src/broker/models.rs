//! Wire types of the infrastructure broker.

use serde::{Deserialize, Serialize};

/// User account provisioned on every VM the broker creates.
pub const VM_USER_ACCOUNT: &str = "cb-user";

/// VM status value reported while the VM is usable.
pub const VM_STATUS_RUNNING: &str = "Running";

/// VM status value reported when creation failed.
pub const VM_STATUS_FAILED: &str = "FAILED";

/// Identifier pair of a broker-managed resource: the name the caller
/// chose and the id the CSP assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iid {
    #[serde(default)]
    pub name_id: String,
    #[serde(default)]
    pub system_id: String,
}

/// Placement the broker reports for a VM. Occasionally empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmRegion {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
}

/// CSP-side details of a VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CspViewVmDetail {
    #[serde(default)]
    pub iid: Iid,
    #[serde(default)]
    pub vm_spec_name: String,
    #[serde(default)]
    pub subnet_iid: Iid,
    #[serde(default)]
    pub security_group_iids: Vec<Iid>,
}

/// One VM descriptor as returned by the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub user_account: String,
    #[serde(default)]
    pub region: VmRegion,
    /// Connection config the VM was created through.
    #[serde(default)]
    pub connection_name: String,
    /// Free-form broker message; for failed VMs this is occasionally a
    /// JSON-encoded `{"message": …}` payload.
    #[serde(default)]
    pub system_message: String,
    #[serde(default)]
    pub csp_view_vm_detail: CspViewVmDetail,
}

impl Vm {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == VM_STATUS_FAILED
    }
}

/// Broker grouping of the VMs backing one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mcis {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "vm")]
    pub vms: Vec<Vm>,
}

/// Request to create a VM inside an MCIS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmCreateReq {
    pub name: String,
    pub connection_name: String,
    pub image_id: String,
    pub spec_id: String,
    pub v_net_id: String,
    pub security_group_ids: Vec<String>,
    pub ssh_key_id: String,
    pub user_account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_disk_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_disk_size: String,
}

/// Request to create an MCIS with its initial VM set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McisCreateReq {
    pub name: String,
    #[serde(rename = "vm")]
    pub vms: Vec<VmCreateReq>,
}

/// Connection configuration registered with the broker: one credential
/// in one CSP region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnConfig {
    pub config_name: String,
    pub provider_name: String,
    #[serde(default)]
    pub region_name: String,
    #[serde(default)]
    pub zone_name: String,
}

/// A cached infrastructure resource (image, spec, vNet, security group
/// or keypair) as the broker reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McirResource {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Only present on keypair resources.
    #[serde(default)]
    pub private_key: String,
}

/// Request body for `CreateIfNotExist` resource calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McirResourceReq {
    pub name: String,
    pub connection_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub csp_spec_name: String,
}

/// The resolved infrastructure set one node pool is created from.
#[derive(Debug, Clone)]
pub struct Mcir {
    pub csp: crate::model::Csp,
    pub region: String,
    pub zone: String,
    pub image_id: String,
    pub spec_id: String,
    pub v_net_id: String,
    pub security_group_id: String,
    pub ssh_key_id: String,
    /// Private key material of the keypair resource.
    pub credential: String,
    pub username: String,
}
