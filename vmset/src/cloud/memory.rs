//! In-memory cloud backed by an inventory snapshot.
//!
//! Resources are addressed the way the real control plane addresses them:
//! by resource group (taken from the resource ID) and name, both compared
//! case-insensitively. Mutations are applied to the snapshot and can be
//! written back to disk.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::{CloudClient, CloudError};
use crate::ids;
use crate::model::{
    AvailabilitySet, NetworkInterface, PublicIpAddress, ScaleSet, VirtualMachine,
};

/// Every resource known to the in-memory cloud.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Inventory {
    pub virtual_machines: Vec<VirtualMachine>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub availability_sets: Vec<AvailabilitySet>,
    pub scale_sets: Vec<ScaleSet>,
    pub public_ip_addresses: Vec<PublicIpAddress>,
}

impl Inventory {
    /// Load an inventory from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        serde_json::from_slice(&data).map_err(std::io::Error::other)
    }

    /// Write the inventory as pretty-printed JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        tokio::fs::write(path, data).await
    }
}

fn in_group(id: &str, resource_group: &str) -> bool {
    ids::resource_group_from_id(id).is_ok_and(|rg| rg.eq_ignore_ascii_case(resource_group))
}

fn matches(id: &str, name: &str, resource_group: &str, wanted: &str) -> bool {
    name.eq_ignore_ascii_case(wanted) && in_group(id, resource_group)
}

fn not_found(kind: &str, resource_group: &str, name: &str) -> CloudError {
    CloudError::NotFound(format!("{} {}/{}", kind, resource_group, name))
}

/// A [`CloudClient`] over an [`Inventory`] held in memory.
///
/// Counts calls per operation and supports injecting failures and latency,
/// which the test-suite uses to observe caching and error paths.
#[derive(Default)]
pub struct InMemoryCloud {
    inventory: RwLock<Inventory>,
    calls: DashMap<&'static str, usize>,
    failures: DashMap<&'static str, CloudError>,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryCloud {
    pub fn new(inventory: Inventory) -> Self {
        Self {
            inventory: RwLock::new(inventory),
            ..Default::default()
        }
    }

    pub fn shared(inventory: Inventory) -> Arc<Self> {
        Arc::new(Self::new(inventory))
    }

    /// Clone of the current inventory.
    pub async fn snapshot(&self) -> Inventory {
        self.inventory.read().await.clone()
    }

    /// Apply `f` to the inventory.
    pub async fn update<F: FnOnce(&mut Inventory)>(&self, f: F) {
        let mut inventory = self.inventory.write().await;
        f(&mut inventory);
    }

    /// Number of times `operation` has been called.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    /// Make every later call to `operation` fail with `err`.
    pub fn fail(&self, operation: &'static str, err: CloudError) {
        self.failures.insert(operation, err);
    }

    pub fn clear_failure(&self, operation: &str) {
        self.failures.remove(operation);
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    async fn enter(&self, operation: &'static str) -> Result<(), CloudError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        debug!(operation, "in-memory cloud call");

        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match self.failures.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudClient for InMemoryCloud {
    async fn get_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine, CloudError> {
        self.enter("get_virtual_machine").await?;
        let inventory = self.inventory.read().await;
        inventory
            .virtual_machines
            .iter()
            .find(|vm| matches(&vm.id, &vm.name, resource_group, name))
            .cloned()
            .ok_or_else(|| not_found("virtual machine", resource_group, name))
    }

    async fn list_virtual_machines(
        &self,
        resource_group: &str,
    ) -> Result<Vec<VirtualMachine>, CloudError> {
        self.enter("list_virtual_machines").await?;
        let inventory = self.inventory.read().await;
        Ok(inventory
            .virtual_machines
            .iter()
            .filter(|vm| in_group(&vm.id, resource_group))
            .cloned()
            .collect())
    }

    async fn list_scale_set_virtual_machines(
        &self,
        scale_set_id: &str,
    ) -> Result<Vec<VirtualMachine>, CloudError> {
        self.enter("list_scale_set_virtual_machines").await?;
        let inventory = self.inventory.read().await;
        if !inventory
            .scale_sets
            .iter()
            .any(|ss| ss.id.eq_ignore_ascii_case(scale_set_id))
        {
            return Err(CloudError::NotFound(format!("scale set {}", scale_set_id)));
        }
        Ok(inventory
            .virtual_machines
            .iter()
            .filter(|vm| {
                vm.virtual_machine_scale_set
                    .as_ref()
                    .is_some_and(|ss| ss.id.eq_ignore_ascii_case(scale_set_id))
            })
            .cloned()
            .collect())
    }

    async fn get_network_interface(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<NetworkInterface, CloudError> {
        self.enter("get_network_interface").await?;
        let inventory = self.inventory.read().await;
        inventory
            .network_interfaces
            .iter()
            .find(|nic| matches(&nic.id, &nic.name, resource_group, name))
            .cloned()
            .ok_or_else(|| not_found("network interface", resource_group, name))
    }

    async fn create_or_update_network_interface(
        &self,
        resource_group: &str,
        name: &str,
        nic: NetworkInterface,
    ) -> Result<(), CloudError> {
        self.enter("create_or_update_network_interface").await?;
        let mut inventory = self.inventory.write().await;
        match inventory
            .network_interfaces
            .iter_mut()
            .find(|n| matches(&n.id, &n.name, resource_group, name))
        {
            Some(existing) => *existing = nic,
            None => inventory.network_interfaces.push(nic),
        }
        Ok(())
    }

    async fn list_availability_sets(
        &self,
        resource_group: &str,
    ) -> Result<Vec<AvailabilitySet>, CloudError> {
        self.enter("list_availability_sets").await?;
        let inventory = self.inventory.read().await;
        Ok(inventory
            .availability_sets
            .iter()
            .filter(|set| in_group(&set.id, resource_group))
            .cloned()
            .collect())
    }

    async fn list_scale_sets(&self, resource_group: &str) -> Result<Vec<ScaleSet>, CloudError> {
        self.enter("list_scale_sets").await?;
        let inventory = self.inventory.read().await;
        Ok(inventory
            .scale_sets
            .iter()
            .filter(|ss| in_group(&ss.id, resource_group))
            .cloned()
            .collect())
    }

    async fn get_scale_set(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<ScaleSet, CloudError> {
        self.enter("get_scale_set").await?;
        let inventory = self.inventory.read().await;
        inventory
            .scale_sets
            .iter()
            .find(|ss| matches(&ss.id, &ss.name, resource_group, name))
            .cloned()
            .ok_or_else(|| not_found("scale set", resource_group, name))
    }

    async fn create_or_update_scale_set(
        &self,
        resource_group: &str,
        name: &str,
        scale_set: ScaleSet,
    ) -> Result<(), CloudError> {
        self.enter("create_or_update_scale_set").await?;
        let mut inventory = self.inventory.write().await;
        match inventory
            .scale_sets
            .iter_mut()
            .find(|ss| matches(&ss.id, &ss.name, resource_group, name))
        {
            Some(existing) => *existing = scale_set,
            None => inventory.scale_sets.push(scale_set),
        }
        Ok(())
    }

    async fn get_public_ip_address(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<PublicIpAddress, CloudError> {
        self.enter("get_public_ip_address").await?;
        let inventory = self.inventory.read().await;
        inventory
            .public_ip_addresses
            .iter()
            .find(|pip| matches(&pip.id, &pip.name, resource_group, name))
            .cloned()
            .ok_or_else(|| not_found("public IP address", resource_group, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubResource;

    fn vm(rg: &str, name: &str) -> VirtualMachine {
        VirtualMachine {
            id: format!(
                "/subscriptions/sub/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
                rg, name
            ),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive_and_group_scoped() {
        let cloud = InMemoryCloud::new(Inventory {
            virtual_machines: vec![vm("RG", "vm-0"), vm("other", "vm-1")],
            ..Default::default()
        });

        assert!(cloud.get_virtual_machine("rg", "VM-0").await.is_ok());
        let err = cloud.get_virtual_machine("rg", "vm-1").await.unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(cloud.list_virtual_machines("rg").await.unwrap().len(), 1);
        assert_eq!(cloud.calls("get_virtual_machine"), 2);
        assert_eq!(cloud.calls("list_virtual_machines"), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let cloud = InMemoryCloud::new(Inventory {
            virtual_machines: vec![vm("rg", "vm-0")],
            ..Default::default()
        });
        let err = CloudError::Api {
            status: 500,
            message: "internal".to_string(),
        };
        cloud.fail("get_virtual_machine", err.clone());
        assert_eq!(cloud.get_virtual_machine("rg", "vm-0").await.unwrap_err(), err);

        cloud.clear_failure("get_virtual_machine");
        assert!(cloud.get_virtual_machine("rg", "vm-0").await.is_ok());
    }

    #[tokio::test]
    async fn test_scale_set_membership() {
        let ss_id = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/ss";
        let mut member = vm("rg", "vm-0");
        member.virtual_machine_scale_set = Some(SubResource::new(ss_id));
        let cloud = InMemoryCloud::new(Inventory {
            virtual_machines: vec![member, vm("rg", "vm-1")],
            scale_sets: vec![ScaleSet {
                id: ss_id.to_string(),
                name: "ss".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });

        let vms = cloud.list_scale_set_virtual_machines(ss_id).await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "vm-0");

        assert!(
            cloud
                .list_scale_set_virtual_machines("missing")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_create_or_update_replaces_nic() {
        let nic_id = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/nic-0";
        let nic = NetworkInterface {
            id: nic_id.to_string(),
            name: "nic-0".to_string(),
            provisioning_state: "Succeeded".to_string(),
            ..Default::default()
        };
        let cloud = InMemoryCloud::new(Inventory {
            network_interfaces: vec![nic.clone()],
            ..Default::default()
        });

        let mut updated = nic.clone();
        updated.provisioning_state = "Updating".to_string();
        cloud
            .create_or_update_network_interface("rg", "nic-0", updated)
            .await
            .unwrap();

        let snapshot = cloud.snapshot().await;
        assert_eq!(snapshot.network_interfaces.len(), 1);
        assert_eq!(snapshot.network_interfaces[0].provisioning_state, "Updating");
    }

    #[tokio::test]
    async fn test_inventory_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        let inventory = Inventory {
            virtual_machines: vec![vm("rg", "vm-0")],
            ..Default::default()
        };

        inventory.save(&path).await.unwrap();
        let loaded = Inventory::load(&path).await.unwrap();
        assert_eq!(loaded, inventory);
    }
}
