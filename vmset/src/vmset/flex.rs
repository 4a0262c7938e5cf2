//! VM set for flexible-orchestration scale sets.
//!
//! Nodes map to VMs by computer name. Scale sets of every known resource
//! group are cached under one key; each scale set's VM list is cached under
//! the scale set ID. Loading a VM list also fills the node and VM name
//! indexes used for lookups in the other direction.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::VmSet;
use super::common::{self, CloudContext};
use crate::backend_pool::{self, EnsureOutcome, PoolChange, SkipReason};
use crate::cache::{CacheReadType, TimedCache};
use crate::error::{AggregateError, Result, VmSetError};
use crate::fanout;
use crate::ids;
use crate::metrics::MetricContext;
use crate::model::{
    BackendAddressPool, NetworkInterface, Node, OrchestrationMode, SCALE_SET_DEALLOCATING_STATE,
    ScaleSet, Service, SubResource, VirtualMachine, Zone,
};

const SCALE_SETS_KEY: &str = "vmss_flex_key";

const NODE_SCALE_SET_LOCK: &str = "get_node_scale_set_id";
const NODE_NAME_BY_VM_NAME_LOCK: &str = "get_node_name_by_vm_name";

/// Named async locks. An entry is dropped once nobody holds or waits on it.
#[derive(Default)]
struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    async fn with_lock<T, F>(&self, key: &str, f: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let out = {
            let _guard = lock.lock().await;
            f.await
        };

        // One reference in the map, one held here.
        self.locks
            .remove_if(key, |_, current| Arc::ptr_eq(current, &lock) && Arc::strong_count(current) == 2);
        out
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

fn is_deallocating(scale_set: &ScaleSet) -> bool {
    scale_set
        .provisioning_state
        .as_deref()
        .is_some_and(|state| state.eq_ignore_ascii_case(SCALE_SET_DEALLOCATING_STATE))
}

/// [`VmSet`] over flexible scale sets.
#[derive(Clone)]
pub struct FlexScaleSet {
    ctx: Arc<CloudContext>,
    /// Lower-cased scale set ID to scale set.
    scale_sets: Arc<TimedCache<HashMap<String, ScaleSet>>>,
    /// VMs of one scale set, keyed by lower-cased scale set ID.
    scale_set_vms: Arc<TimedCache<Vec<VirtualMachine>>>,
    /// Node name to lower-cased scale set ID.
    node_to_scale_set: Arc<DashMap<String, String>>,
    /// Lower-cased VM name to node name.
    vm_name_to_node: Arc<DashMap<String, String>>,
    locks: Arc<KeyLocks>,
}

impl FlexScaleSet {
    pub fn new(ctx: Arc<CloudContext>) -> Result<Self> {
        let lister = ctx.clone();
        let scale_sets = TimedCache::new(
            "vmss_flex",
            ctx.config.scale_set_cache_ttl(),
            move |_key: String| {
                let ctx = lister.clone();
                async move {
                    let mut all = HashMap::new();
                    for rg in ctx.resource_groups() {
                        let sets = ctx.client.list_scale_sets(&rg).await.map_err(|e| {
                            error!("ScaleSetsClient.List({}) failed: {}", rg, e);
                            VmSetError::cloud("ListScaleSets", rg.as_str(), "", e)
                        })?;
                        for set in sets {
                            if set.id.is_empty() || set.orchestration_mode != OrchestrationMode::Flexible {
                                continue;
                            }
                            all.insert(set.id.to_lowercase(), set);
                        }
                    }
                    Ok(all)
                }
            },
        )?;

        let node_to_scale_set: Arc<DashMap<String, String>> = Arc::new(DashMap::new());
        let vm_name_to_node: Arc<DashMap<String, String>> = Arc::new(DashMap::new());

        let vm_client = ctx.client.clone();
        let nodes = node_to_scale_set.clone();
        let vm_names = vm_name_to_node.clone();
        let scale_set_vms = TimedCache::new(
            "vmss_flex_vm",
            ctx.config.scale_set_vm_cache_ttl(),
            move |scale_set_id: String| {
                let client = vm_client.clone();
                let nodes = nodes.clone();
                let vm_names = vm_names.clone();
                async move {
                    let vms = client
                        .list_scale_set_virtual_machines(&scale_set_id)
                        .await
                        .map_err(|e| {
                            error!("ListVmssFlexVMs({}) failed: {}", scale_set_id, e);
                            VmSetError::cloud("ListScaleSetVirtualMachines", "", scale_set_id.as_str(), e)
                        })?;
                    for vm in &vms {
                        let node_name = vm.node_name();
                        if node_name.is_empty() {
                            continue;
                        }
                        nodes.insert(node_name.clone(), scale_set_id.clone());
                        if !vm.name.is_empty() {
                            vm_names.insert(vm.name.to_lowercase(), node_name);
                        }
                    }
                    Ok(vms)
                }
            },
        )?;

        Ok(Self {
            ctx,
            scale_sets: Arc::new(scale_sets),
            scale_set_vms: Arc::new(scale_set_vms),
            node_to_scale_set,
            vm_name_to_node,
            locks: Arc::new(KeyLocks::default()),
        })
    }

    pub fn context(&self) -> &Arc<CloudContext> {
        &self.ctx
    }

    async fn scale_set_by_id(&self, scale_set_id: &str) -> Result<ScaleSet> {
        let key = scale_set_id.to_lowercase();
        for read_type in [CacheReadType::Default, CacheReadType::ForceRefresh] {
            let sets = self.scale_sets.get(SCALE_SETS_KEY, read_type).await?;
            if let Some(set) = sets.get(&key) {
                return Ok(set.clone());
            }
        }
        warn!("scale set {} not found", scale_set_id);
        Err(VmSetError::InstanceNotFound)
    }

    /// Read the current state of a cached scale set before changing it.
    async fn latest_scale_set(&self, cached: &ScaleSet) -> Result<ScaleSet> {
        let rg = ids::resource_group_from_id(&cached.id)?;
        self.ctx
            .client
            .get_scale_set(rg, &cached.name)
            .await
            .map_err(|e| VmSetError::cloud("GetScaleSet", rg, cached.name.as_str(), e))
    }

    async fn scale_set_id_by_name(&self, name: &str) -> Result<String> {
        let sets = self
            .scale_sets
            .get(SCALE_SETS_KEY, CacheReadType::Default)
            .await?;
        sets.iter()
            .find(|(_, set)| set.name.eq_ignore_ascii_case(name))
            .map(|(id, _)| id.clone())
            .ok_or(VmSetError::InstanceNotFound)
    }

    /// Lower-cased ID of the scale set hosting `node_name`.
    async fn node_scale_set_id(&self, node_name: &str) -> Result<String> {
        let key = node_name.to_lowercase();
        if let Some(id) = self.node_to_scale_set.get(&key) {
            return Ok(id.clone());
        }

        self.locks
            .with_lock(NODE_SCALE_SET_LOCK, async {
                if let Some(id) = self.node_to_scale_set.get(&key) {
                    return Ok(id.clone());
                }
                let sets = self
                    .scale_sets
                    .get(SCALE_SETS_KEY, CacheReadType::Unsafe)
                    .await?;
                for scale_set_id in sets.keys() {
                    self.scale_set_vms
                        .get(scale_set_id, CacheReadType::ForceRefresh)
                        .await?;
                    if let Some(id) = self.node_to_scale_set.get(&key) {
                        return Ok(id.clone());
                    }
                }
                debug!("node {} does not belong to any scale set", node_name);
                Err(VmSetError::InstanceNotFound)
            })
            .await
    }

    async fn scale_set_name_of_node(&self, node_name: &str) -> Result<String> {
        let scale_set_id = self.node_scale_set_id(node_name).await?;
        Ok(self.scale_set_by_id(&scale_set_id).await?.name)
    }

    /// The VM backing `node_name`.
    async fn flex_vm(&self, node_name: &str, read_type: CacheReadType) -> Result<VirtualMachine> {
        let scale_set_id = self.node_scale_set_id(node_name).await?;
        let vms = self.scale_set_vms.get(&scale_set_id, read_type).await?;
        let key = node_name.to_lowercase();
        if let Some(vm) = vms.iter().find(|vm| vm.node_name() == key) {
            return Ok(vm.clone());
        }
        // The VM left its scale set since the index was built.
        self.node_to_scale_set.remove(&key);
        warn!("unable to find node {} in scale set {}", node_name, scale_set_id);
        Err(VmSetError::InstanceNotFound)
    }

    async fn node_name_by_vm_name(&self, vm_name: &str) -> Result<String> {
        let key = vm_name.to_lowercase();
        if let Some(node_name) = self.vm_name_to_node.get(&key) {
            return Ok(node_name.clone());
        }

        self.locks
            .with_lock(NODE_NAME_BY_VM_NAME_LOCK, async {
                for read_type in [CacheReadType::Default, CacheReadType::ForceRefresh] {
                    if let Some(node_name) = self.vm_name_to_node.get(&key) {
                        return Ok(node_name.clone());
                    }
                    let sets = self.scale_sets.get(SCALE_SETS_KEY, read_type).await?;
                    for scale_set_id in sets.keys() {
                        self.scale_set_vms.get(scale_set_id, read_type).await?;
                    }
                }
                match self.vm_name_to_node.get(&key) {
                    Some(node_name) => Ok(node_name.clone()),
                    None => {
                        debug!("vm {} does not belong to any scale set", vm_name);
                        Err(VmSetError::InstanceNotFound)
                    }
                }
            })
            .await
    }

    /// Add `backend_pool_id` to the network profile of the scale sets the
    /// hosts belong to, so new instances join the pool on creation.
    async fn ensure_scale_sets_in_pool(
        &self,
        service: &Service,
        hosts: &[&Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()> {
        let config = &self.ctx.config;
        let mut scale_set_ids: Vec<String> = Vec::new();

        if !config.use_multiple_standard_load_balancers() {
            for node in hosts {
                if !self
                    .ctx
                    .node_resource_group(&node.name)
                    .eq_ignore_ascii_case(&config.resource_group)
                {
                    continue;
                }
                match self.node_scale_set_id(&node.name).await {
                    Ok(id) if !scale_set_ids.contains(&id) => scale_set_ids.push(id),
                    Ok(_) => {}
                    Err(e) => {
                        debug!("node {} is not in a scale set: {}", node.name, e);
                        continue;
                    }
                }
            }
        } else if vm_set_name.is_empty() {
            debug!("no vm set requested for {}, leaving scale set profiles", service.full_name());
        } else {
            scale_set_ids.push(self.scale_set_id_by_name(vm_set_name).await?);
        }

        for scale_set_id in scale_set_ids {
            let cached = self.scale_set_by_id(&scale_set_id).await?;
            let mut scale_set = self.latest_scale_set(&cached).await?;
            if is_deallocating(&scale_set) {
                debug!("scale set {} is being deallocated, skipping", scale_set.name);
                continue;
            }
            let name = scale_set.name.clone();

            {
                let Some(configs) = scale_set.network_configurations_mut() else {
                    debug!("scale set {} has no network profile", name);
                    continue;
                };
                let network_index = backend_pool::primary_network_config_index(configs, &name)?;
                let ip_index = backend_pool::scale_set_ip_config_index(
                    &configs[network_index],
                    config.ipv6_dual_stack_enabled,
                    service.is_ipv6(),
                )?;
                let pools = &mut configs[network_index].ip_configurations[ip_index]
                    .load_balancer_backend_address_pools;
                match backend_pool::plan_pool_addition(pools, backend_pool_id, true)? {
                    PoolChange::AlreadyMember => continue,
                    PoolChange::Conflict { existing_lb } => {
                        info!(
                            "scale set {} has already been added to LB {}, omit adding it to a new one",
                            name, existing_lb
                        );
                        continue;
                    }
                    PoolChange::Add => pools.push(SubResource::new(backend_pool_id)),
                }
            }

            let rg = ids::resource_group_from_id(&scale_set.id)?.to_string();
            info!(
                "ensure_scale_sets_in_pool({}): adding backend pool {} to scale set {}",
                service.full_name(),
                backend_pool_id,
                name
            );
            self.ctx
                .client
                .create_or_update_scale_set(&rg, &name, scale_set)
                .await
                .map_err(|e| VmSetError::cloud("CreateOrUpdateScaleSet", rg.as_str(), name.as_str(), e))?;
            self.scale_sets.delete(SCALE_SETS_KEY);
        }
        Ok(())
    }

    /// Strip `backend_pool_id` from the network profile of the named scale
    /// sets and push the changed ones concurrently.
    async fn remove_pool_from_scale_sets(
        &self,
        scale_set_names: &[String],
        backend_pool_id: &str,
    ) -> Result<()> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        let mut updates = Vec::new();

        for name in scale_set_names {
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                continue;
            }
            let scale_set = match self.scale_set_id_by_name(name).await {
                Ok(id) => match self.scale_set_by_id(&id).await {
                    Ok(cached) => self.latest_scale_set(&cached).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            let mut scale_set = match scale_set {
                Ok(set) => set,
                Err(e) if e.is_not_found() => {
                    debug!("scale set {} not found, nothing to remove", name);
                    continue;
                }
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if is_deallocating(&scale_set) {
                debug!("scale set {} is being deallocated, skipping", scale_set.name);
                continue;
            }

            let changed = scale_set.network_configurations_mut().is_some_and(|configs| {
                configs
                    .iter_mut()
                    .flat_map(|c| c.ip_configurations.iter_mut())
                    .fold(false, |changed, ip_config| {
                        backend_pool::strip_pool(&mut ip_config.load_balancer_backend_address_pools, backend_pool_id)
                            || changed
                    })
            });
            if !changed {
                continue;
            }

            let rg = match ids::resource_group_from_id(&scale_set.id) {
                Ok(rg) => rg.to_string(),
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let client = self.ctx.client.clone();
            let pool = backend_pool_id.to_string();
            updates.push(async move {
                let name = scale_set.name.clone();
                info!("removing backend pool {} from scale set {}", pool, name);
                client
                    .create_or_update_scale_set(&rg, &name, scale_set)
                    .await
                    .map_err(|e| VmSetError::cloud("CreateOrUpdateScaleSet", rg.as_str(), name.as_str(), e))
            });
        }

        let pushed = !updates.is_empty();
        if let Err(e) = fanout::aggregate_tasks(updates).await {
            errors.push(e);
        }
        if pushed {
            self.scale_sets.delete(SCALE_SETS_KEY);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(errors).into())
        }
    }

    async fn remove_pool_members(
        &self,
        service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<()> {
        let mut errors = Vec::new();
        let mut nics = Vec::new();
        let mut seen = HashSet::new();
        let mut scale_set_names = Vec::new();

        for ip_config_id in backend_pool::member_ip_configuration_ids(backend_pools, backend_pool_id) {
            let (node_name, scale_set_name) =
                match self.get_node_name_by_ip_configuration_id(&ip_config_id).await {
                    Ok(found) => found,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => {
                        error!("failed to resolve ip configuration {}: {}", ip_config_id, e);
                        errors.push(e);
                        continue;
                    }
                };
            if node_name.is_empty() {
                continue;
            }
            if !scale_set_name.eq_ignore_ascii_case(vm_set_name) {
                debug!(
                    "ensure_backend_pool_deleted: skipping the node {} belonging to another vm set {}",
                    node_name, scale_set_name
                );
                continue;
            }

            let nic = match self.get_primary_interface(&node_name).await {
                Ok(nic) => nic,
                Err(e) => {
                    error!("failed to get the primary interface of {}: {}", node_name, e);
                    errors.push(e);
                    continue;
                }
            };
            if nic.is_failed() {
                warn!(
                    "ensure_backend_pool_deleted skips node {} because its primary nic {} is in Failed state",
                    node_name, nic.name
                );
                continue;
            }
            if seen.insert(nic.id.to_lowercase()) {
                nics.push(nic);
            }
            if !scale_set_names.contains(&scale_set_name) {
                scale_set_names.push(scale_set_name);
            }
        }

        if delete_from_vm_set {
            scale_set_names.push(vm_set_name.to_string());
            if let Err(e) = self
                .remove_pool_from_scale_sets(&scale_set_names, backend_pool_id)
                .await
            {
                errors.push(e);
            }
        }

        if let Err(e) = self
            .ctx
            .remove_pool_from_nics(service, nics, backend_pool_id)
            .await
        {
            errors.push(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(errors).into())
        }
    }
}

#[async_trait]
impl VmSet for FlexScaleSet {
    async fn get_instance_id_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self.flex_vm(name, CacheReadType::Unsafe).await?;
        common::instance_id_of(&vm, name)
    }

    async fn get_instance_type_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self.flex_vm(name, CacheReadType::Unsafe).await?;
        common::instance_type_of(&vm, name)
    }

    async fn get_zone_by_node_name(&self, name: &str) -> Result<Zone> {
        let vm = self.flex_vm(name, CacheReadType::Unsafe).await?;
        common::zone_of(&vm, name)
    }

    async fn get_provisioning_state_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self.flex_vm(name, CacheReadType::Default).await?;
        Ok(common::provisioning_state_of(&vm))
    }

    async fn get_power_status_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self.flex_vm(name, CacheReadType::Default).await?;
        Ok(common::power_status_of(&vm, name))
    }

    async fn get_node_name_by_provider_id(&self, provider_id: &str) -> Result<String> {
        let vm_name = ids::node_name_from_provider_id(provider_id)?;
        self.node_name_by_vm_name(vm_name).await
    }

    async fn get_primary_interface(&self, node_name: &str) -> Result<NetworkInterface> {
        let vm = self.flex_vm(node_name, CacheReadType::Default).await?;
        self.ctx.get_primary_nic_of(&vm).await
    }

    async fn get_ip_by_node_name(&self, name: &str) -> Result<(String, String)> {
        let nic = self.get_primary_interface(name).await?;
        self.ctx.ip_of_nic(name, &nic).await
    }

    async fn get_private_ips_by_node_name(&self, name: &str) -> Result<Vec<String>> {
        let nic = self.get_primary_interface(name).await?;
        Ok(common::private_ips_of(&nic))
    }

    async fn get_node_vm_set_name(&self, node: &Node) -> Result<String> {
        let name = self.scale_set_name_of_node(&node.name).await?;
        debug!("found scale set name {} from node name {}", name, node.name);
        Ok(name)
    }

    async fn get_vm_set_names(&self, service: &Service, nodes: &[Node]) -> Result<Vec<String>> {
        if common::uses_primary_vm_set(&self.ctx.config, service) {
            return Ok(vec![self.get_primary_vm_set_name().to_string()]);
        }
        let agent_pools = self.get_agent_pool_vm_set_names(nodes).await?;
        common::select_vm_set_names(&self.ctx.config, service, agent_pools, nodes.len())
    }

    async fn get_agent_pool_vm_set_names(&self, nodes: &[Node]) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for node in nodes {
            if node.is_control_plane() {
                continue;
            }
            match self.scale_set_name_of_node(&node.name).await {
                Ok(name) => {
                    let name = name.to_lowercase();
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                Err(e) => {
                    error!("unable to get the scale set of node {}: {}", node.name, e);
                    continue;
                }
            }
        }
        Ok(names)
    }

    async fn get_node_cidr_masks_by_provider_id(&self, provider_id: &str) -> Result<(u32, u32)> {
        let lookup = async {
            let node_name = self.get_node_name_by_provider_id(provider_id).await?;
            let scale_set_id = self.node_scale_set_id(&node_name).await?;
            self.scale_set_by_id(&scale_set_id).await
        };
        match lookup.await {
            Ok(scale_set) => Ok(common::cidr_masks_from_tags(&scale_set.tags)),
            Err(VmSetError::InstanceNotFound) => Ok(common::DEFAULT_NODE_CIDR_MASKS),
            Err(e) => Err(e),
        }
    }

    async fn get_node_name_by_ip_configuration_id(
        &self,
        ip_configuration_id: &str,
    ) -> Result<(String, String)> {
        let nic = self
            .ctx
            .get_nic_by_ip_configuration_id(ip_configuration_id)
            .await?;
        let Some(vm_id) = nic
            .virtual_machine
            .as_ref()
            .map(|vm| vm.id.as_str())
            .filter(|id| !id.is_empty())
        else {
            debug!("ip configuration {} has no virtual machine", ip_configuration_id);
            return Ok((String::new(), String::new()));
        };

        let vm_name = ids::vm_name_from_vm_id(vm_id)?;
        let node_name = self.node_name_by_vm_name(vm_name).await?;
        let scale_set_name = self.scale_set_name_of_node(&node_name).await?;
        Ok((node_name, scale_set_name.to_lowercase()))
    }

    fn get_primary_vm_set_name(&self) -> &str {
        &self.ctx.config.primary_scale_set_name
    }

    fn observe_nodes(&self, nodes: &[Node]) {
        self.ctx.observe_nodes(nodes);
    }

    async fn ensure_host_in_pool(
        &self,
        service: &Service,
        node_name: &str,
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<EnsureOutcome> {
        let scale_set_name = match self.scale_set_name_of_node(node_name).await {
            Ok(name) => name,
            Err(e) => {
                error!("ensure_host_in_pool: failed to get the scale set of {}: {}", node_name, e);
                return Ok(EnsureOutcome::Skipped(SkipReason::NotInVmSet));
            }
        };

        if !vm_set_name.is_empty()
            && self.ctx.needs_vm_set_check(vm_set_name, &scale_set_name)
            && !scale_set_name.eq_ignore_ascii_case(vm_set_name)
        {
            debug!(
                "ensure_host_in_pool skips node {} because it is not in the scale set {}",
                node_name, vm_set_name
            );
            return Ok(EnsureOutcome::Skipped(SkipReason::NotInVmSet));
        }

        let nic = self.get_primary_interface(node_name).await?;
        self.ctx
            .ensure_nic_in_pool(service, node_name, nic, backend_pool_id)
            .await
    }

    async fn ensure_hosts_in_pool(
        &self,
        service: &Service,
        nodes: &[Node],
        backend_pool_id: &str,
        vm_set_name: &str,
    ) -> Result<()> {
        let mc = MetricContext::new(
            "vmssflex_ensure_hosts_in_pool",
            &self.ctx.config.resource_group,
            &service.full_name(),
        );
        self.ctx.observe_nodes(nodes);
        let hosts = self.ctx.hosts_for_pool(nodes, backend_pool_id);

        let tasks: Vec<_> = hosts
            .iter()
            .map(|node| {
                let this = self.clone();
                let service = service.clone();
                let node_name = node.name.clone();
                let backend_pool_id = backend_pool_id.to_string();
                let vm_set_name = vm_set_name.to_string();
                async move {
                    let outcome = this
                        .ensure_host_in_pool(&service, &node_name, &backend_pool_id, &vm_set_name)
                        .await
                        .inspect_err(|e| {
                            error!(
                                "ensure({}): backendPoolID({}) - failed to ensure host {} in pool: {}",
                                service.full_name(),
                                backend_pool_id,
                                node_name,
                                e
                            )
                        })
                        .map_err(|e| e.for_node(node_name.as_str()))?;
                    debug!("ensure_host_in_pool({}): {:?}", node_name, outcome);
                    Ok::<(), VmSetError>(())
                }
            })
            .collect();

        info!(
            "ensuring {} hosts in backend pool {} for {}",
            tasks.len(),
            backend_pool_id,
            service.full_name()
        );
        let mut errors = Vec::new();
        if let Err(e) = fanout::aggregate_tasks(tasks).await {
            errors.push(e);
        }

        // Profiles go after the NICs and never gate them.
        if let Err(e) = self
            .ensure_scale_sets_in_pool(service, &hosts, backend_pool_id, vm_set_name)
            .await
        {
            error!(
                "ensure_hosts_in_pool({}): failed to add backend pool {} to scale sets: {}",
                service.full_name(),
                backend_pool_id,
                e
            );
            errors.push(e);
        }

        let result: Result<()> = if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(errors).into())
        };
        mc.observe(result)
    }

    async fn ensure_backend_pool_deleted(
        &self,
        service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
        delete_from_vm_set: bool,
    ) -> Result<()> {
        if backend_pools.is_empty() {
            return Ok(());
        }
        let mc = MetricContext::new(
            "vmssflex_ensure_backend_pool_deleted",
            &self.ctx.config.resource_group,
            &service.full_name(),
        );
        mc.observe(
            self.remove_pool_members(
                service,
                backend_pool_id,
                vm_set_name,
                backend_pools,
                delete_from_vm_set,
            )
            .await,
        )
    }

    async fn ensure_backend_pool_deleted_from_vm_sets(
        &self,
        vm_set_names: &[String],
        backend_pool_id: &str,
    ) -> Result<()> {
        self.remove_pool_from_scale_sets(vm_set_names, backend_pool_id)
            .await
    }
}
