//! Resource records exchanged with the cloud control plane and the orchestrator.
//!
//! Field names serialize in camelCase so inventory snapshots look like the
//! cloud's own JSON.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Provisioning state reported for a NIC that cannot be mutated.
pub const NIC_FAILED_STATE: &str = "Failed";

/// Scale sets in this state reject create-or-update calls.
pub const SCALE_SET_DEALLOCATING_STATE: &str = "Deallocating";

/// Instance view status codes describing power state start with this prefix.
pub const VM_POWER_STATE_PREFIX: &str = "PowerState/";

/// Reported when a VM has no instance view (for example while deleting).
pub const VM_POWER_STATE_STOPPED: &str = "stopped";

/// Node label marking a node as excluded from external load balancers.
pub const LABEL_EXCLUDE_FROM_LB: &str = "node.kubernetes.io/exclude-from-external-load-balancers";

/// Node label set to "false" on nodes not managed by the cloud provider.
pub const LABEL_MANAGED: &str = "kubernetes.azure.com/managed";

/// Node label carrying the resource group the node's VM lives in.
pub const LABEL_RESOURCE_GROUP: &str = "kubernetes.azure.com/resource-group";

/// Node label carrying the host name.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

pub const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_MASTER: &str = "node-role.kubernetes.io/master";
pub const LABEL_ROLE: &str = "kubernetes.io/role";

/// Service annotation selecting which VM sets back the service.
pub const ANNOTATION_LB_MODE: &str = "service.beta.kubernetes.io/azure-load-balancer-mode";

/// Mode annotation value selecting every agent pool VM set.
pub const LB_MODE_AUTO: &str = "__auto__";

/// Group tags overriding the per-node CIDR mask sizes.
pub const TAG_CIDR_MASK_IPV4: &str = "kubernetesNodeCIDRMaskIPV4";
pub const TAG_CIDR_MASK_IPV6: &str = "kubernetesNodeCIDRMaskIPV6";

/// A reference to another resource by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResource {
    pub id: String,
}

impl SubResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

// =============================================================================
// Orchestrator objects
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAddressType {
    Hostname,
    InternalIP,
    ExternalIP,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: NodeAddressType,
    pub address: String,
}

/// A Kubernetes node as seen by the cloud provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    pub name: String,
    pub provider_id: String,
    pub labels: HashMap<String, String>,
    pub addresses: Vec<NodeAddress>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// The host name alias: the `Hostname` address, else the hostname label.
    pub fn host_name(&self) -> Option<&str> {
        self.addresses
            .iter()
            .rev()
            .find(|a| a.kind == NodeAddressType::Hostname)
            .map(|a| a.address.as_str())
            .filter(|a| !a.is_empty())
            .or_else(|| self.labels.get(LABEL_HOSTNAME).map(String::as_str))
    }

    /// True if the node carries a control-plane role label.
    pub fn is_control_plane(&self) -> bool {
        self.labels.contains_key(LABEL_CONTROL_PLANE)
            || self.labels.contains_key(LABEL_MASTER)
            || self.labels.get(LABEL_ROLE).is_some_and(|v| v == "master")
    }
}

/// The subset of a Kubernetes Service the backend pool logic looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub cluster_ip: String,
    pub annotations: HashMap<String, String>,
}

impl Service {
    pub fn new(namespace: &str, name: &str, cluster_ip: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            cluster_ip: cluster_ip.to_string(),
            annotations: HashMap::new(),
        }
    }

    /// "namespace/name", used in logs and metric labels.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.cluster_ip.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
    }

    /// Returns (has_mode, is_auto, vm_set_name) from the mode annotation.
    pub fn load_balancer_mode(&self) -> (bool, bool, String) {
        match self.annotations.get(ANNOTATION_LB_MODE) {
            None => (false, false, String::new()),
            Some(mode) => {
                let mode = mode.trim();
                (true, mode == LB_MODE_AUTO, mode.to_string())
            }
        }
    }
}

// =============================================================================
// Compute
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    pub vm_size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceViewStatus {
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceView {
    pub platform_fault_domain: Option<i32>,
    pub statuses: Vec<InstanceViewStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceReference {
    pub id: String,
    #[serde(default)]
    pub primary: Option<bool>,
}

/// A virtual machine and its instance view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub location: String,
    pub zones: Vec<String>,
    pub computer_name: Option<String>,
    pub hardware_profile: Option<HardwareProfile>,
    pub provisioning_state: Option<String>,
    pub availability_set: Option<SubResource>,
    pub virtual_machine_scale_set: Option<SubResource>,
    pub network_interfaces: Vec<NetworkInterfaceReference>,
    pub instance_view: Option<InstanceView>,
    pub tags: HashMap<String, String>,
}

impl VirtualMachine {
    /// ID of the primary NIC: the only NIC, else the one flagged primary.
    pub fn primary_interface_id(&self) -> Option<&str> {
        if self.network_interfaces.len() == 1 {
            return Some(&self.network_interfaces[0].id);
        }
        self.network_interfaces
            .iter()
            .find(|nic| nic.primary.unwrap_or(false))
            .map(|nic| nic.id.as_str())
    }

    /// The orchestrator node name of a scale set VM (lower-cased computer name).
    pub fn node_name(&self) -> String {
        self.computer_name
            .as_deref()
            .unwrap_or(&self.name)
            .to_lowercase()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvailabilitySet {
    pub id: String,
    pub name: String,
    pub location: String,
    pub tags: HashMap<String, String>,
    pub virtual_machines: Vec<SubResource>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationMode {
    #[default]
    Uniform,
    Flexible,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleSetIpConfiguration {
    pub name: String,
    pub primary: Option<bool>,
    pub private_ip_address_version: IpVersion,
    pub load_balancer_backend_address_pools: Vec<SubResource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleSetNetworkConfiguration {
    pub name: String,
    pub primary: Option<bool>,
    pub ip_configurations: Vec<ScaleSetIpConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleSetNetworkProfile {
    pub network_interface_configurations: Vec<ScaleSetNetworkConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleSetVmProfile {
    pub network_profile: Option<ScaleSetNetworkProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleSet {
    pub id: String,
    pub name: String,
    pub location: String,
    pub tags: HashMap<String, String>,
    pub provisioning_state: Option<String>,
    pub orchestration_mode: OrchestrationMode,
    pub virtual_machine_profile: Option<ScaleSetVmProfile>,
}

impl ScaleSet {
    pub fn network_configurations_mut(&mut self) -> Option<&mut Vec<ScaleSetNetworkConfiguration>> {
        self.virtual_machine_profile
            .as_mut()?
            .network_profile
            .as_mut()
            .map(|p| &mut p.network_interface_configurations)
    }
}

// =============================================================================
// Network
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    #[default]
    IPv4,
    IPv6,
}

impl IpVersion {
    pub fn from_ipv6(ipv6: bool) -> Self {
        if ipv6 { Self::IPv6 } else { Self::IPv4 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpConfiguration {
    pub id: String,
    pub name: String,
    pub primary: Option<bool>,
    pub private_ip_address: Option<String>,
    pub private_ip_address_version: IpVersion,
    pub public_ip_address: Option<SubResource>,
    pub load_balancer_backend_address_pools: Vec<SubResource>,
}

impl IpConfiguration {
    pub fn is_primary(&self) -> bool {
        self.primary.unwrap_or(false)
    }
}

/// A network interface and its IP configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    pub id: String,
    pub name: String,
    pub location: String,
    pub provisioning_state: String,
    pub virtual_machine: Option<SubResource>,
    pub ip_configurations: Vec<IpConfiguration>,
}

impl NetworkInterface {
    pub fn is_failed(&self) -> bool {
        self.provisioning_state == NIC_FAILED_STATE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublicIpAddress {
    pub id: String,
    pub name: String,
    pub ip_address: Option<String>,
}

/// A load balancer backend pool and the IP configurations it contains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendAddressPool {
    pub id: String,
    pub backend_ip_configurations: Vec<SubResource>,
}

/// Placement of a node: a zone or fault domain plus its region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub failure_domain: String,
    pub region: String,
}
