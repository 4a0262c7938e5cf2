//! State and helpers shared by both VM set implementations.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::{debug, error, info, warn};

use crate::backend_pool::{self, EnsureOutcome, PoolChange, SkipReason};
use crate::cache::{CacheReadType, TimedCache};
use crate::cloud::CloudClient;
use crate::config::{Config, DEFAULT_NODE_CIDR_MASK_IPV4, DEFAULT_NODE_CIDR_MASK_IPV6};
use crate::error::{Result, VmSetError};
use crate::fanout;
use crate::ids::{self, IdBuilder};
use crate::model::{
    LABEL_EXCLUDE_FROM_LB, LABEL_MANAGED, LABEL_RESOURCE_GROUP, NetworkInterface, Node,
    PublicIpAddress, Service, SubResource, TAG_CIDR_MASK_IPV4, TAG_CIDR_MASK_IPV6, VM_POWER_STATE_PREFIX,
    VM_POWER_STATE_STOPPED, VirtualMachine, Zone,
};

/// Everything a VM set needs from the environment: configuration, the cloud
/// client, caches shared by both variants and what is known about nodes.
pub struct CloudContext {
    pub config: Config,
    pub ids: IdBuilder,
    pub client: Arc<dyn CloudClient>,
    vm_cache: TimedCache<Option<VirtualMachine>>,
    public_ip_cache: TimedCache<Option<PublicIpAddress>>,
    /// Lower-cased node name to the resource group its VM lives in.
    node_resource_groups: Arc<DashMap<String, String>>,
    unmanaged_nodes: DashSet<String>,
    excluded_nodes: DashSet<String>,
}

impl CloudContext {
    pub fn new(config: Config, client: Arc<dyn CloudClient>) -> Result<Self> {
        config.validate()?;

        let node_resource_groups: Arc<DashMap<String, String>> = Arc::new(DashMap::new());

        let vm_client = client.clone();
        let vm_groups = node_resource_groups.clone();
        let default_group = config.resource_group.clone();
        let vm_cache = TimedCache::new("vm", config.vm_cache_ttl(), move |name: String| {
            let client = vm_client.clone();
            let resource_group = vm_groups
                .get(&name)
                .map(|rg| rg.clone())
                .unwrap_or_else(|| default_group.clone());
            async move {
                match client.get_virtual_machine(&resource_group, &name).await {
                    Ok(vm) => Ok(Some(vm)),
                    Err(e) if e.is_not_found() => {
                        debug!("virtual machine {}/{} not found", resource_group, name);
                        Ok(None)
                    }
                    Err(e) => Err(VmSetError::cloud("GetVirtualMachine", resource_group, name, e)),
                }
            }
        })?;

        let pip_client = client.clone();
        let public_ip_cache =
            TimedCache::new("public_ip", config.public_ip_cache_ttl(), move |key: String| {
                let client = pip_client.clone();
                async move {
                    let (resource_group, name) = key.split_once('/').unwrap_or(("", key.as_str()));
                    match client.get_public_ip_address(resource_group, name).await {
                        Ok(pip) => Ok(Some(pip)),
                        Err(e) if e.is_not_found() => Ok(None),
                        Err(e) => Err(VmSetError::cloud("GetPublicIPAddress", resource_group, name, e)),
                    }
                }
            })?;

        let ids = IdBuilder::new(
            config.subscription_id.clone(),
            config.network_resource_subscription_id.clone(),
        );

        Ok(Self {
            config,
            ids,
            client,
            vm_cache,
            public_ip_cache,
            node_resource_groups,
            unmanaged_nodes: DashSet::new(),
            excluded_nodes: DashSet::new(),
        })
    }

    // =========================================================================
    // Node registry
    // =========================================================================

    /// Record resource group and exclusion labels of `nodes`.
    pub fn observe_nodes(&self, nodes: &[Node]) {
        for node in nodes {
            let name = node.name.to_lowercase();
            match node.labels.get(LABEL_RESOURCE_GROUP) {
                Some(rg) if !rg.is_empty() => {
                    self.node_resource_groups.insert(name.clone(), rg.to_lowercase());
                }
                _ => {
                    self.node_resource_groups.remove(&name);
                }
            }
            if node.labels.get(LABEL_MANAGED).is_some_and(|v| v == "false") {
                self.unmanaged_nodes.insert(name.clone());
            } else {
                self.unmanaged_nodes.remove(&name);
            }
            if node.labels.contains_key(LABEL_EXCLUDE_FROM_LB) {
                self.excluded_nodes.insert(name);
            } else {
                self.excluded_nodes.remove(&name);
            }
        }
    }

    /// The resource group of a node's VM, defaulting to the configured one.
    pub fn node_resource_group(&self, node_name: &str) -> String {
        self.node_resource_groups
            .get(&node_name.to_lowercase())
            .map(|rg| rg.clone())
            .unwrap_or_else(|| self.config.resource_group.clone())
    }

    /// The configured resource group plus every group seen on a node.
    pub fn resource_groups(&self) -> Vec<String> {
        let mut groups = vec![self.config.resource_group.to_lowercase()];
        for entry in self.node_resource_groups.iter() {
            if !groups.contains(entry.value()) {
                groups.push(entry.value().clone());
            }
        }
        groups
    }

    /// Unmanaged nodes, nodes labelled for exclusion and nodes in a foreign
    /// resource group stay out of load balancers.
    pub fn should_exclude_from_load_balancer(&self, node_name: &str) -> bool {
        let name = node_name.to_lowercase();
        if self.unmanaged_nodes.contains(&name) {
            return true;
        }
        if let Some(rg) = self.node_resource_groups.get(&name)
            && !rg.eq_ignore_ascii_case(&self.config.resource_group)
        {
            return true;
        }
        self.excluded_nodes.contains(&name)
    }

    /// Nodes that should be placed in a backend pool.
    pub fn hosts_for_pool<'a>(&self, nodes: &'a [Node], backend_pool_id: &str) -> Vec<&'a Node> {
        let exclude_control_plane =
            self.config.use_standard_load_balancer() && self.config.exclude_master_from_standard_lb;
        nodes
            .iter()
            .filter(|node| {
                if exclude_control_plane && node.is_control_plane() {
                    debug!(
                        "excluding control plane node {} from backend pool {}",
                        node.name, backend_pool_id
                    );
                    return false;
                }
                if self.should_exclude_from_load_balancer(&node.name) {
                    debug!("excluding unmanaged/external-resource-group node {}", node.name);
                    return false;
                }
                true
            })
            .collect()
    }

    /// Whether a node's VM set must match the requested one.
    ///
    /// Basic load balancers and multiple standard load balancers are scoped
    /// to one VM set, except for VM sets sharing the primary standard load
    /// balancer when the primary one is requested.
    pub fn needs_vm_set_check(&self, requested: &str, node_vm_set: &str) -> bool {
        if !self.config.use_standard_load_balancer() {
            return true;
        }
        if !self.config.enable_multiple_standard_load_balancers {
            return false;
        }
        !(self.config.primary_vm_set_name().eq_ignore_ascii_case(requested)
            && self.config.shares_primary_load_balancer(node_vm_set))
    }

    // =========================================================================
    // Cached lookups
    // =========================================================================

    /// Get a VM by name through the VM cache.
    pub async fn get_virtual_machine(
        &self,
        name: &str,
        read_type: CacheReadType,
    ) -> Result<VirtualMachine> {
        let cached = self.vm_cache.get(&name.to_lowercase(), read_type).await?;
        match &*cached {
            Some(vm) => Ok(vm.clone()),
            None => {
                warn!("unable to find node {}: instance not found", name);
                Err(VmSetError::InstanceNotFound)
            }
        }
    }

    /// List the VMs of the configured resource group.
    pub async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>> {
        let rg = &self.config.resource_group;
        self.client
            .list_virtual_machines(rg)
            .await
            .map_err(|e| VmSetError::cloud("ListVirtualMachines", rg.as_str(), "", e))
    }

    pub async fn get_public_ip_address(
        &self,
        resource_group: &str,
        name: &str,
        read_type: CacheReadType,
    ) -> Result<Option<PublicIpAddress>> {
        let key = format!("{}/{}", resource_group.to_lowercase(), name.to_lowercase());
        let cached = self.public_ip_cache.get(&key, read_type).await?;
        Ok((*cached).clone())
    }

    /// Fetch the primary NIC referenced by `vm`.
    pub async fn get_primary_nic_of(&self, vm: &VirtualMachine) -> Result<NetworkInterface> {
        let nic_id = vm.primary_interface_id().ok_or_else(|| {
            VmSetError::InvalidResource(format!(
                "failed to find a primary nic for the vm. vmname={:?}",
                vm.name
            ))
        })?;
        let nic_name = ids::last_segment(nic_id, '/')?;
        let nic_rg = ids::resource_group_from_nic_id(nic_id)?;
        self.client
            .get_network_interface(nic_rg, nic_name)
            .await
            .map_err(|e| VmSetError::cloud("GetInterface", nic_rg, nic_name, e))
    }

    /// Fetch the NIC owning an IP configuration.
    pub async fn get_nic_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<NetworkInterface> {
        let (nic_rg, nic_name) = ids::parse_ip_configuration_id(ip_configuration_id)?;
        if nic_rg.is_empty() || nic_name.is_empty() {
            return Err(VmSetError::invalid_id("IP configuration", ip_configuration_id));
        }
        self.client
            .get_network_interface(nic_rg, nic_name)
            .await
            .map_err(|e| VmSetError::cloud("GetInterface", nic_rg, nic_name, e))
    }

    /// Push a modified NIC back to the cloud in the NIC's own resource group.
    pub async fn create_or_update_interface(
        &self,
        service: &Service,
        nic: NetworkInterface,
    ) -> Result<()> {
        let rg = ids::resource_group_from_nic_id(&nic.id)?.to_string();
        let name = nic.name.clone();
        info!("nicupdate({}): nic({}/{}) - updating", service.full_name(), rg, name);
        self.client
            .create_or_update_network_interface(&rg, &name, nic)
            .await
            .map_err(|e| {
                error!("CreateOrUpdateInterface({}/{}) failed: {}", rg, name, e);
                VmSetError::cloud("CreateOrUpdateInterface", rg.as_str(), name.as_str(), e)
            })
    }

    // =========================================================================
    // Resolution helpers
    // =========================================================================

    /// Private and public address of a NIC's primary IP configuration.
    pub async fn ip_of_nic(&self, node_name: &str, nic: &NetworkInterface) -> Result<(String, String)> {
        let index = backend_pool::primary_ip_config_index(nic)?;
        let config = &nic.ip_configurations[index];
        let private_ip = config.private_ip_address.clone().unwrap_or_default();

        let Some(pip_ref) = config.public_ip_address.as_ref().filter(|p| !p.id.is_empty()) else {
            return Ok((private_ip, String::new()));
        };
        let pip_name = ids::last_segment(&pip_ref.id, '/').map_err(|_| {
            VmSetError::InvalidResource(format!(
                "failed to get public IP name for node {:?} with pipID {:?}",
                node_name, pip_ref.id
            ))
        })?;
        let public_ip = self
            .get_public_ip_address(&self.config.resource_group, pip_name, CacheReadType::Default)
            .await?
            .and_then(|pip| pip.ip_address)
            .unwrap_or_default();
        Ok((private_ip, public_ip))
    }

    /// Add a NIC's service IP configuration to `backend_pool_id`.
    pub async fn ensure_nic_in_pool(
        &self,
        service: &Service,
        node_name: &str,
        mut nic: NetworkInterface,
        backend_pool_id: &str,
    ) -> Result<EnsureOutcome> {
        if nic.is_failed() {
            warn!(
                "ensure_host_in_pool skips node {} because its primary nic {} is in Failed state",
                node_name, nic.name
            );
            return Ok(EnsureOutcome::Skipped(SkipReason::NicFailed));
        }

        let index = backend_pool::service_ip_config_index(
            &nic,
            self.config.ipv6_dual_stack_enabled,
            service.is_ipv6(),
        )?;
        let config = &mut nic.ip_configurations[index];
        match backend_pool::plan_pool_addition(
            &config.load_balancer_backend_address_pools,
            backend_pool_id,
            self.config.use_standard_load_balancer(),
        )? {
            PoolChange::AlreadyMember => return Ok(EnsureOutcome::AlreadyMember),
            PoolChange::Conflict { existing_lb } => {
                info!(
                    "node {} has already been added to LB {}, omit adding it to a new one",
                    node_name, existing_lb
                );
                return Ok(EnsureOutcome::Skipped(SkipReason::ConflictingLoadBalancer));
            }
            PoolChange::Add => {}
        }
        config
            .load_balancer_backend_address_pools
            .push(SubResource::new(backend_pool_id));

        self.create_or_update_interface(service, nic).await?;
        Ok(EnsureOutcome::Updated)
    }

    /// Strip `backend_pool_id` from each NIC and push the changed ones
    /// concurrently.
    pub async fn remove_pool_from_nics(
        self: &Arc<Self>,
        service: &Service,
        nics: Vec<NetworkInterface>,
        backend_pool_id: &str,
    ) -> Result<()> {
        let mut updates = Vec::new();
        for mut nic in nics {
            if !backend_pool::strip_pool_from_nic(&mut nic, backend_pool_id) {
                continue;
            }
            let ctx = self.clone();
            let service = service.clone();
            let pool = backend_pool_id.to_string();
            updates.push(async move {
                info!(
                    "ensure_backend_pool_deleted begins to update NIC {} with backendPoolID {}",
                    nic.name, pool
                );
                ctx.create_or_update_interface(&service, nic).await
            });
        }
        fanout::aggregate_tasks(updates).await
    }
}

/// Resolve the VM sets a service should use from its mode annotation.
pub fn select_vm_set_names(
    config: &Config,
    service: &Service,
    agent_pools: Vec<String>,
    node_count: usize,
) -> Result<Vec<String>> {
    let (_, is_auto, requested) = service.load_balancer_mode();
    if agent_pools.is_empty() {
        error!("no vm sets found for nodes in the cluster, node count({})", node_count);
        return Err(VmSetError::NoAgentPoolVmSets(node_count));
    }
    if is_auto {
        return Ok(agent_pools);
    }
    match agent_pools.iter().find(|name| name.eq_ignore_ascii_case(&requested)) {
        Some(name) => Ok(vec![name.clone()]),
        None => {
            error!(
                "vm set ({}) in service annotation of {} not found (primary {})",
                requested,
                service.full_name(),
                config.primary_vm_set_name()
            );
            Err(VmSetError::VmSetNotFound(requested))
        }
    }
}

/// Whether the service annotation can be ignored in favour of the primary VM set.
pub fn uses_primary_vm_set(config: &Config, service: &Service) -> bool {
    let (has_mode, _, _) = service.load_balancer_mode();
    let single_slb =
        config.use_standard_load_balancer() && !config.enable_multiple_standard_load_balancers;
    !has_mode || single_slb
}

/// Zone of a VM: `{region}-{zone}` when zoned, else its fault domain.
pub fn zone_of(vm: &VirtualMachine, node_name: &str) -> Result<Zone> {
    let region = vm.location.to_lowercase();
    let failure_domain = if let Some(zone) = vm.zones.first() {
        let zone_id: i32 = zone.parse().map_err(|source| VmSetError::InvalidZone {
            zone: zone.clone(),
            source,
        })?;
        format!("{}-{}", region, zone_id)
    } else if let Some(fd) = vm.instance_view.as_ref().and_then(|v| v.platform_fault_domain) {
        fd.to_string()
    } else {
        error!("failed to get zone info for node {}", node_name);
        return Err(VmSetError::ZoneUnavailable(node_name.to_string()));
    };
    Ok(Zone {
        failure_domain: failure_domain.to_lowercase(),
        region,
    })
}

/// Power state from the instance view, `stopped` when there is none.
pub fn power_status_of(vm: &VirtualMachine, node_name: &str) -> String {
    let state = vm.instance_view.as_ref().and_then(|view| {
        view.statuses
            .iter()
            .find_map(|s| s.code.strip_prefix(VM_POWER_STATE_PREFIX))
    });
    match state {
        Some(state) => state.to_string(),
        None => {
            debug!("instance view for node {} is empty, assuming it's stopped", node_name);
            VM_POWER_STATE_STOPPED.to_string()
        }
    }
}

pub fn provisioning_state_of(vm: &VirtualMachine) -> String {
    vm.provisioning_state.clone().unwrap_or_default()
}

pub fn instance_type_of(vm: &VirtualMachine, node_name: &str) -> Result<String> {
    vm.hardware_profile
        .as_ref()
        .map(|hw| hw.vm_size.clone())
        .ok_or_else(|| {
            VmSetError::InvalidResource(format!("HardwareProfile of node({}) is nil", node_name))
        })
}

/// Instance ID of a VM: its resource ID with the resource group lower-cased.
pub fn instance_id_of(vm: &VirtualMachine, node_name: &str) -> Result<String> {
    if vm.id.is_empty() {
        return Err(VmSetError::InvalidResource(format!(
            "ProviderID of node({}) is empty",
            node_name
        )));
    }
    ids::convert_resource_group_name_to_lower(&vm.id)
}

/// Every private address on a NIC.
pub fn private_ips_of(nic: &NetworkInterface) -> Vec<String> {
    nic.ip_configurations
        .iter()
        .filter_map(|c| c.private_ip_address.clone())
        .collect()
}

/// CIDR mask sizes from group tags. Malformed values are logged and read as 0.
pub fn cidr_masks_from_tags(tags: &HashMap<String, String>) -> (u32, u32) {
    let parse = |key: &str| -> u32 {
        match tags.get(key) {
            None => 0,
            Some(value) => value.trim().parse().unwrap_or_else(|e| {
                error!("error when parsing the value of {} {:?}: {}", key, value, e);
                0
            }),
        }
    };
    (parse(TAG_CIDR_MASK_IPV4), parse(TAG_CIDR_MASK_IPV6))
}

pub const DEFAULT_NODE_CIDR_MASKS: (u32, u32) =
    (DEFAULT_NODE_CIDR_MASK_IPV4, DEFAULT_NODE_CIDR_MASK_IPV6);
