//! VM set for standalone VMs grouped in availability sets.
//!
//! A node's name is its VM's name. VMs are read through the shared VM cache;
//! availability sets of every known resource group sit in one cache entry.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::VmSet;
use super::common::{self, CloudContext};
use crate::backend_pool::{self, EnsureOutcome, SkipReason};
use crate::cache::{CacheReadType, TimedCache};
use crate::error::{AggregateError, Result, VmSetError};
use crate::fanout;
use crate::ids;
use crate::metrics::MetricContext;
use crate::model::{self, BackendAddressPool, NetworkInterface, Node, Service, Zone};

const AVAILABILITY_SETS_KEY: &str = "vmas_key";

/// [`VmSet`] over availability sets.
#[derive(Clone)]
pub struct AvailabilitySet {
    ctx: Arc<CloudContext>,
    /// Lower-cased availability set name to availability set.
    availability_sets: Arc<TimedCache<HashMap<String, model::AvailabilitySet>>>,
}

impl AvailabilitySet {
    pub fn new(ctx: Arc<CloudContext>) -> Result<Self> {
        let lister = ctx.clone();
        let availability_sets = TimedCache::new(
            "availability_sets",
            ctx.config.availability_set_cache_ttl(),
            move |_key: String| {
                let ctx = lister.clone();
                async move {
                    let mut all = HashMap::new();
                    for rg in ctx.resource_groups() {
                        let sets = ctx.client.list_availability_sets(&rg).await.map_err(|e| {
                            error!("AvailabilitySetsClient.List({}) failed: {}", rg, e);
                            VmSetError::cloud("ListAvailabilitySets", rg.as_str(), "", e)
                        })?;
                        for set in sets {
                            if set.name.is_empty() {
                                warn!("failed to get the name of an availability set in {}", rg);
                                continue;
                            }
                            all.insert(set.name.to_lowercase(), set);
                        }
                    }
                    Ok(all)
                }
            },
        )?;

        Ok(Self {
            ctx,
            availability_sets: Arc::new(availability_sets),
        })
    }

    pub fn context(&self) -> &Arc<CloudContext> {
        &self.ctx
    }

    /// Primary NIC of a node together with its availability set ID.
    ///
    /// Fails with [`VmSetError::NotInVmSet`] when `vm_set_name` is given, the
    /// load balancer setup scopes pools to one VM set and the node is in
    /// another.
    async fn primary_interface_with_vm_set(
        &self,
        node_name: &str,
        vm_set_name: &str,
    ) -> Result<(NetworkInterface, String)> {
        let vm = self
            .ctx
            .get_virtual_machine(node_name, CacheReadType::Default)
            .await?;
        let availability_set_id = vm
            .availability_set
            .as_ref()
            .map(|set| set.id.clone())
            .unwrap_or_default();

        if !vm_set_name.is_empty() {
            let node_vm_set = ids::last_segment(&availability_set_id, '/').unwrap_or("");
            if self.ctx.needs_vm_set_check(vm_set_name, node_vm_set) {
                let expected = self
                    .ctx
                    .ids
                    .availability_set_id(&self.ctx.node_resource_group(node_name), vm_set_name)?;
                if !availability_set_id.eq_ignore_ascii_case(&expected) {
                    debug!(
                        "primary interface of {} is not in the availability set {}",
                        node_name, vm_set_name
                    );
                    return Err(VmSetError::NotInVmSet);
                }
            }
        }

        let nic = self.ctx.get_primary_nic_of(&vm).await?;
        Ok((nic, availability_set_id))
    }

    /// The availability set listing `node_name` as a member.
    async fn availability_set_by_node_name(
        &self,
        node_name: &str,
        read_type: CacheReadType,
    ) -> Result<model::AvailabilitySet> {
        let sets = self
            .availability_sets
            .get(AVAILABILITY_SETS_KEY, read_type)
            .await?;
        for set in sets.values() {
            for vm_ref in &set.virtual_machines {
                if vm_ref.id.is_empty() {
                    continue;
                }
                let vm_name = ids::vm_name_from_vm_id(&vm_ref.id)?;
                if vm_name.eq_ignore_ascii_case(node_name) {
                    return Ok(set.clone());
                }
            }
        }
        warn!("unable to find the availability set of node {}", node_name);
        Err(VmSetError::InstanceNotFound)
    }

    /// Availability set names of the given agent nodes, lower-cased, in
    /// node order without repeats.
    fn agent_pool_availability_sets(
        vms: &[model::VirtualMachine],
        nodes: &[Node],
    ) -> Result<Vec<String>> {
        let vm_to_set: HashMap<String, &str> = vms
            .iter()
            .filter_map(|vm| {
                vm.availability_set
                    .as_ref()
                    .map(|set| (vm.name.to_lowercase(), set.id.as_str()))
            })
            .collect();

        let mut names: Vec<String> = Vec::new();
        for node in nodes {
            if node.is_control_plane() {
                continue;
            }
            let Some(set_id) = vm_to_set.get(&node.name.to_lowercase()) else {
                warn!("node {} has no availability set", node.name);
                continue;
            };
            let name = ids::last_segment(set_id, '/')
                .inspect_err(|e| error!("node {}: {}", node.name, e))?
                .to_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn remove_pool_members(
        &self,
        service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
    ) -> Result<()> {
        let mut errors = Vec::new();
        let mut nics = Vec::new();
        let mut seen = HashSet::new();

        for ip_config_id in backend_pool::member_ip_configuration_ids(backend_pools, backend_pool_id) {
            let node_name = match self.get_node_name_by_ip_configuration_id(&ip_config_id).await {
                Ok((node_name, _)) => node_name,
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

            let (nic, availability_set_id) =
                match self.primary_interface_with_vm_set(&node_name, vm_set_name).await {
                    Ok(found) => found,
                    Err(VmSetError::NotInVmSet) => {
                        debug!(
                            "ensure_backend_pool_deleted skips node {} because it is not in the vm set {}",
                            node_name, vm_set_name
                        );
                        continue;
                    }
                    Err(e) => {
                        error!("failed to get the primary interface of {}: {}", node_name, e);
                        errors.push(e);
                        continue;
                    }
                };

            let node_vm_set = match ids::availability_set_name_from_id(&availability_set_id) {
                Ok(name) => name,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if !node_vm_set.eq_ignore_ascii_case(vm_set_name) {
                debug!(
                    "ensure_backend_pool_deleted: skipping the node {} belonging to another vm set {}",
                    node_name, node_vm_set
                );
                continue;
            }
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
impl VmSet for AvailabilitySet {
    async fn get_instance_id_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self
            .ctx
            .get_virtual_machine(name, CacheReadType::Unsafe)
            .await?;
        common::instance_id_of(&vm, name)
    }

    async fn get_instance_type_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self
            .ctx
            .get_virtual_machine(name, CacheReadType::Unsafe)
            .await
            .inspect_err(|e| error!("get_instance_type_by_node_name({}) failed: {}", name, e))?;
        common::instance_type_of(&vm, name)
    }

    async fn get_zone_by_node_name(&self, name: &str) -> Result<Zone> {
        let vm = self
            .ctx
            .get_virtual_machine(name, CacheReadType::Unsafe)
            .await?;
        common::zone_of(&vm, name)
    }

    async fn get_provisioning_state_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self
            .ctx
            .get_virtual_machine(name, CacheReadType::Default)
            .await?;
        Ok(common::provisioning_state_of(&vm))
    }

    async fn get_power_status_by_node_name(&self, name: &str) -> Result<String> {
        let vm = self
            .ctx
            .get_virtual_machine(name, CacheReadType::Default)
            .await?;
        Ok(common::power_status_of(&vm, name))
    }

    async fn get_node_name_by_provider_id(&self, provider_id: &str) -> Result<String> {
        // The VM name is the node name.
        Ok(ids::node_name_from_provider_id(provider_id)?.to_string())
    }

    async fn get_primary_interface(&self, node_name: &str) -> Result<NetworkInterface> {
        let (nic, _) = self.primary_interface_with_vm_set(node_name, "").await?;
        Ok(nic)
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
        let Some(host_name) = node.host_name() else {
            warn!("cannot get host name from node {}", node.name);
            return Ok(String::new());
        };

        let vms = self.ctx.list_virtual_machines().await?;
        let name = match vms.iter().find(|vm| vm.name.eq_ignore_ascii_case(host_name)) {
            Some(vm) => match vm.availability_set.as_ref().filter(|s| !s.id.is_empty()) {
                Some(set) => ids::last_segment(&set.id, '/')?.to_string(),
                None => String::new(),
            },
            None => String::new(),
        };
        debug!("found availability set name {:?} from node name {}", name, node.name);
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
        let vms = self.ctx.list_virtual_machines().await?;
        Self::agent_pool_availability_sets(&vms, nodes)
    }

    async fn get_node_cidr_masks_by_provider_id(&self, provider_id: &str) -> Result<(u32, u32)> {
        let node_name = self.get_node_name_by_provider_id(provider_id).await?;
        match self
            .availability_set_by_node_name(&node_name, CacheReadType::Default)
            .await
        {
            Ok(set) => Ok(common::cidr_masks_from_tags(&set.tags)),
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
        let vm = self
            .ctx
            .get_virtual_machine(vm_name, CacheReadType::Default)
            .await?;
        let set_name = match vm.availability_set.as_ref() {
            Some(set) => ids::availability_set_name_from_id(&set.id)?.to_lowercase(),
            None => String::new(),
        };
        Ok((vm_name.to_string(), set_name))
    }

    fn get_primary_vm_set_name(&self) -> &str {
        &self.ctx.config.primary_availability_set_name
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
        let nic = match self
            .primary_interface_with_vm_set(node_name, vm_set_name)
            .await
        {
            Ok((nic, _)) => nic,
            Err(VmSetError::NotInVmSet) => {
                debug!(
                    "ensure_host_in_pool skips node {} because it is not in the vm set {}",
                    node_name, vm_set_name
                );
                return Ok(EnsureOutcome::Skipped(SkipReason::NotInVmSet));
            }
            Err(e) => {
                error!(
                    "ensure_host_in_pool({}): failed to get the primary interface of {} in {}: {}",
                    service.full_name(),
                    node_name,
                    vm_set_name,
                    e
                );
                return Err(e);
            }
        };
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
            "vmas_ensure_hosts_in_pool",
            &self.ctx.config.resource_group,
            &service.full_name(),
        );
        self.ctx.observe_nodes(nodes);

        let tasks: Vec<_> = self
            .ctx
            .hosts_for_pool(nodes, backend_pool_id)
            .into_iter()
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
        mc.observe(fanout::aggregate_tasks(tasks).await)
    }

    async fn ensure_backend_pool_deleted(
        &self,
        service: &Service,
        backend_pool_id: &str,
        vm_set_name: &str,
        backend_pools: &[BackendAddressPool],
        _delete_from_vm_set: bool,
    ) -> Result<()> {
        if backend_pools.is_empty() {
            return Ok(());
        }
        let mc = MetricContext::new(
            "vmas_ensure_backend_pool_deleted",
            &self.ctx.config.resource_group,
            &service.full_name(),
        );
        mc.observe(
            self.remove_pool_members(service, backend_pool_id, vm_set_name, backend_pools)
                .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{InMemoryCloud, Inventory};
    use crate::config::Config;
    use crate::model::{LABEL_MASTER, SubResource, VirtualMachine};

    fn vm(name: &str, set: Option<&str>) -> VirtualMachine {
        VirtualMachine {
            name: name.to_string(),
            availability_set: set.map(|s| {
                SubResource::new(format!(
                    "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/availabilitySets/{}",
                    s
                ))
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_agent_pool_availability_sets() {
        let vms = vec![
            vm("node-0", Some("AS-1")),
            vm("node-1", Some("as-1")),
            vm("node-2", Some("as-2")),
            vm("master-0", Some("as-master")),
            vm("standalone", None),
        ];
        let nodes = vec![
            Node::new("node-0"),
            Node::new("node-1"),
            Node::new("NODE-2"),
            Node::new("master-0").with_label(LABEL_MASTER, ""),
            Node::new("standalone"),
            Node::new("unknown"),
        ];

        let names = AvailabilitySet::agent_pool_availability_sets(&vms, &nodes).unwrap();
        assert_eq!(names, vec!["as-1".to_string(), "as-2".to_string()]);
    }

    #[tokio::test]
    async fn test_availability_sets_keyed_by_lower_case_name() {
        let inventory = Inventory {
            availability_sets: vec![
                model::AvailabilitySet {
                    id: "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/availabilitySets/AS-Upper".to_string(),
                    name: "AS-Upper".to_string(),
                    ..Default::default()
                },
                model::AvailabilitySet::default(),
            ],
            ..Default::default()
        };
        let config = Config {
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            ..Default::default()
        };
        let ctx = CloudContext::new(config, InMemoryCloud::shared(inventory)).unwrap();
        let vm_set = AvailabilitySet::new(Arc::new(ctx)).unwrap();

        let sets = vm_set
            .availability_sets
            .get(AVAILABILITY_SETS_KEY, CacheReadType::Default)
            .await
            .unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets["as-upper"].name, "AS-Upper");
    }
}
