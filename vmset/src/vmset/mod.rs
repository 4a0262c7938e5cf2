//! VM sets: resolving nodes to cloud resources and managing their backend
//! pool membership.
//!
//! Two implementations exist. [`AvailabilitySet`] serves clusters of
//! standalone VMs grouped in availability sets; [`FlexScaleSet`] serves
//! clusters built from flexible scale sets. [`new_vm_set`] picks one from
//! the configuration.

pub mod availability_set;
pub mod common;
pub mod flex;

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend_pool::EnsureOutcome;
use crate::cloud::CloudClient;
use crate::config::{Config, VmType};
use crate::error::Result;
use crate::model::{BackendAddressPool, NetworkInterface, Node, Service, Zone};

pub use availability_set::AvailabilitySet;
pub use common::CloudContext;
pub use flex::FlexScaleSet;

/// Operations shared by every VM set implementation.
#[async_trait]
pub trait VmSet: Send + Sync {
    /// Provider ID of the node's VM, with its resource group lower-cased.
    async fn get_instance_id_by_node_name(&self, name: &str) -> Result<String>;

    /// VM size of the node.
    async fn get_instance_type_by_node_name(&self, name: &str) -> Result<String>;

    /// Availability zone of the node, falling back to its fault domain.
    async fn get_zone_by_node_name(&self, name: &str) -> Result<Zone>;

    async fn get_provisioning_state_by_node_name(&self, name: &str) -> Result<String>;

    async fn get_power_status_by_node_name(&self, name: &str) -> Result<String>;

    async fn get_node_name_by_provider_id(&self, provider_id: &str) -> Result<String>;

    async fn get_primary_interface(&self, node_name: &str) -> Result<NetworkInterface>;

    /// (private IP, public IP) of the node's primary IP configuration. The
    /// public IP is empty when none is attached.
    async fn get_ip_by_node_name(&self, name: &str) -> Result<(String, String)>;

    async fn get_private_ips_by_node_name(&self, name: &str) -> Result<Vec<String>>;

    /// Name of the VM set the node belongs to, empty for standalone VMs.
    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String>;

    /// VM sets a service's load balancer should target.
    async fn get_vm_set_names(&self, service: &Service, nodes: &[Node]) -> Result<Vec<String>>;

    /// VM sets of the given agent (non control plane) nodes.
    async fn get_agent_pool_vm_set_names(&self, nodes: &[Node]) -> Result<Vec<String>>;

    /// (IPv4, IPv6) node CIDR mask sizes of the node's VM set.
    async fn get_node_cidr_masks_by_provider_id(&self, provider_id: &str) -> Result<(u32, u32)>;

    /// (node name, lower-cased VM set name) owning an IP configuration.
    /// Both are empty when the NIC is not attached to a VM.
    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<(String, String)>;

    fn get_primary_vm_set_name(&self) -> &str;

    /// Record labels of the current node list.
    fn observe_nodes(&self, nodes: &[Node]);

    /// Add one node's primary IP configuration to a backend pool.
    async fn ensure_host_in_pool(
        &self,
        service: &Service,
        node_name: &str,
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<EnsureOutcome>;

    /// Add every eligible node to a backend pool concurrently.
    async fn ensure_hosts_in_pool(
        &self,
        service: &Service,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()>;

    /// Remove the members of a backend pool that belong to `vm_set_name`.
    async fn ensure_backend_pool_deleted(
        &self,
        service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<()>;

    /// Remove a backend pool from the VM sets themselves. VM sets that do
    /// not keep pools at the set level have nothing to do.
    async fn ensure_backend_pool_deleted_from_vm_sets(
        &self,
        _vm_set_names: &[String],
        _backend_pool_id: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Build the VM set implementation selected by `config.vm_type`.
pub fn new_vm_set(config: Config, client: Arc<dyn CloudClient>) -> Result<Arc<dyn VmSet>> {
    let vm_type = config.vm_type;
    let ctx = Arc::new(CloudContext::new(config, client)?);
    let vm_set: Arc<dyn VmSet> = match vm_type {
        VmType::Standard => Arc::new(AvailabilitySet::new(ctx)?),
        VmType::VmssFlex => Arc::new(FlexScaleSet::new(ctx)?),
    };
    Ok(vm_set)
}
