//! Shared fixtures for vmset integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use vmset::backend_pool::pool_from_nics;
use vmset::model::{
    AvailabilitySet, BackendAddressPool, HardwareProfile, InstanceView, InstanceViewStatus,
    IpConfiguration, NetworkInterface, NetworkInterfaceReference, Node, OrchestrationMode,
    PublicIpAddress, ScaleSet, ScaleSetIpConfiguration, ScaleSetNetworkConfiguration,
    ScaleSetNetworkProfile, ScaleSetVmProfile, Service, SubResource, VirtualMachine,
};
use vmset::{CloudClient, Config, InMemoryCloud, Inventory, LoadBalancerSku, VmSet, VmType};

pub const SUB: &str = "sub";
pub const RG: &str = "rg";
pub const LOCATION: &str = "eastus";

pub fn vm_id(name: &str) -> String {
    format!("/subscriptions/{SUB}/resourceGroups/{RG}/providers/Microsoft.Compute/virtualMachines/{name}")
}

pub fn nic_id(name: &str) -> String {
    format!("/subscriptions/{SUB}/resourceGroups/{RG}/providers/Microsoft.Network/networkInterfaces/{name}")
}

pub fn ip_config_id(nic: &str) -> String {
    format!("{}/ipConfigurations/ipconfig1", nic_id(nic))
}

pub fn availability_set_id(name: &str) -> String {
    format!("/subscriptions/{SUB}/resourceGroups/{RG}/providers/Microsoft.Compute/availabilitySets/{name}")
}

pub fn scale_set_id(name: &str) -> String {
    format!("/subscriptions/{SUB}/resourceGroups/{RG}/providers/Microsoft.Compute/virtualMachineScaleSets/{name}")
}

pub fn public_ip_id(name: &str) -> String {
    format!("/subscriptions/{SUB}/resourceGroups/{RG}/providers/Microsoft.Network/publicIPAddresses/{name}")
}

pub fn pool_id(lb: &str, pool: &str) -> String {
    format!(
        "/subscriptions/{SUB}/resourceGroups/{RG}/providers/Microsoft.Network/loadBalancers/{lb}/backendAddressPools/{pool}"
    )
}

pub fn provider_id(vm_name: &str) -> String {
    format!("azure://{}", vm_id(vm_name))
}

pub fn standard_config() -> Config {
    Config {
        subscription_id: SUB.to_string(),
        resource_group: RG.to_string(),
        location: LOCATION.to_string(),
        primary_availability_set_name: "as-1".to_string(),
        primary_scale_set_name: "ss-1".to_string(),
        load_balancer_sku: LoadBalancerSku::Standard,
        ..Default::default()
    }
}

pub fn flex_config() -> Config {
    Config {
        vm_type: VmType::VmssFlex,
        ..standard_config()
    }
}

pub fn service() -> Service {
    Service::new("default", "web", "10.0.0.10")
}

pub fn nodes(names: &[&str]) -> Vec<Node> {
    names.iter().map(|name| Node::new(*name)).collect()
}

/// Builds an inventory of VMs, NICs and VM sets in one resource group.
#[derive(Default)]
pub struct Fixture {
    pub inventory: Inventory,
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn availability_set(mut self, name: &str) -> Self {
        self.inventory.availability_sets.push(AvailabilitySet {
            id: availability_set_id(name),
            name: name.to_string(),
            location: LOCATION.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn scale_set(mut self, name: &str) -> Self {
        self.inventory.scale_sets.push(ScaleSet {
            id: scale_set_id(name),
            name: name.to_string(),
            location: LOCATION.to_string(),
            provisioning_state: Some("Succeeded".to_string()),
            orchestration_mode: OrchestrationMode::Flexible,
            virtual_machine_profile: Some(ScaleSetVmProfile {
                network_profile: Some(ScaleSetNetworkProfile {
                    network_interface_configurations: vec![ScaleSetNetworkConfiguration {
                        name: format!("{name}-nic"),
                        primary: Some(true),
                        ip_configurations: vec![ScaleSetIpConfiguration {
                            name: "ipconfig1".to_string(),
                            primary: Some(true),
                            ..Default::default()
                        }],
                    }],
                }),
            }),
            ..Default::default()
        });
        self
    }

    fn add_vm(&mut self, mut vm: VirtualMachine) {
        let nic_name = format!("{}-nic", vm.name);
        let address = format!("10.0.0.{}", self.inventory.network_interfaces.len() + 4);
        vm.network_interfaces = vec![NetworkInterfaceReference {
            id: nic_id(&nic_name),
            primary: Some(true),
        }];
        self.inventory.network_interfaces.push(NetworkInterface {
            id: nic_id(&nic_name),
            name: nic_name,
            location: LOCATION.to_string(),
            provisioning_state: "Succeeded".to_string(),
            virtual_machine: Some(SubResource::new(vm.id.clone())),
            ip_configurations: vec![IpConfiguration {
                id: ip_config_id(&format!("{}-nic", vm.name)),
                name: "ipconfig1".to_string(),
                primary: Some(true),
                private_ip_address: Some(address),
                ..Default::default()
            }],
        });
        self.inventory.virtual_machines.push(vm);
    }

    fn base_vm(name: &str) -> VirtualMachine {
        VirtualMachine {
            id: vm_id(name),
            name: name.to_string(),
            location: LOCATION.to_string(),
            hardware_profile: Some(HardwareProfile {
                vm_size: "Standard_D2s_v3".to_string(),
            }),
            provisioning_state: Some("Succeeded".to_string()),
            instance_view: Some(InstanceView {
                platform_fault_domain: Some(1),
                statuses: vec![InstanceViewStatus {
                    code: "PowerState/running".to_string(),
                }],
            }),
            ..Default::default()
        }
    }

    /// A standalone VM, optionally in an availability set created beforehand.
    pub fn vm(mut self, name: &str, availability_set: Option<&str>) -> Self {
        let mut vm = Self::base_vm(name);
        if let Some(set_name) = availability_set {
            vm.availability_set = Some(SubResource::new(availability_set_id(set_name)));
            if let Some(set) = self
                .inventory
                .availability_sets
                .iter_mut()
                .find(|s| s.name == set_name)
            {
                set.virtual_machines.push(SubResource::new(vm_id(name)));
            }
        }
        self.add_vm(vm);
        self
    }

    /// A VM in a flexible scale set. `computer_name` is the node name.
    pub fn flex_vm(mut self, name: &str, computer_name: &str, scale_set: &str) -> Self {
        let mut vm = Self::base_vm(name);
        vm.computer_name = Some(computer_name.to_string());
        vm.virtual_machine_scale_set = Some(SubResource::new(scale_set_id(scale_set)));
        self.add_vm(vm);
        self
    }

    pub fn public_ip(mut self, vm: &str, address: &str) -> Self {
        let pip_name = format!("{vm}-pip");
        self.inventory.public_ip_addresses.push(PublicIpAddress {
            id: public_ip_id(&pip_name),
            name: pip_name.clone(),
            ip_address: Some(address.to_string()),
        });
        self.with_nic(&format!("{vm}-nic"), |nic| {
            nic.ip_configurations[0].public_ip_address = Some(SubResource::new(public_ip_id(&pip_name)));
        })
    }

    pub fn with_vm(mut self, name: &str, f: impl FnOnce(&mut VirtualMachine)) -> Self {
        if let Some(vm) = self.inventory.virtual_machines.iter_mut().find(|vm| vm.name == name) {
            f(vm);
        }
        self
    }

    pub fn with_nic(mut self, name: &str, f: impl FnOnce(&mut NetworkInterface)) -> Self {
        if let Some(nic) = self
            .inventory
            .network_interfaces
            .iter_mut()
            .find(|nic| nic.name == name)
        {
            f(nic);
        }
        self
    }

    pub fn with_availability_set(mut self, name: &str, f: impl FnOnce(&mut AvailabilitySet)) -> Self {
        if let Some(set) = self.inventory.availability_sets.iter_mut().find(|s| s.name == name) {
            f(set);
        }
        self
    }

    pub fn with_scale_set(mut self, name: &str, f: impl FnOnce(&mut ScaleSet)) -> Self {
        if let Some(set) = self.inventory.scale_sets.iter_mut().find(|s| s.name == name) {
            f(set);
        }
        self
    }

    pub fn build(self) -> Arc<InMemoryCloud> {
        InMemoryCloud::shared(self.inventory)
    }
}

pub fn new_vm_set(config: Config, cloud: &Arc<InMemoryCloud>) -> Arc<dyn VmSet> {
    let client: Arc<dyn CloudClient> = cloud.clone();
    vmset::new_vm_set(config, client).expect("vm set builds")
}

pub async fn nic(cloud: &InMemoryCloud, name: &str) -> NetworkInterface {
    cloud
        .snapshot()
        .await
        .network_interfaces
        .into_iter()
        .find(|nic| nic.name == name)
        .expect("nic exists")
}

pub async fn scale_set(cloud: &InMemoryCloud, name: &str) -> ScaleSet {
    cloud
        .snapshot()
        .await
        .scale_sets
        .into_iter()
        .find(|ss| ss.name == name)
        .expect("scale set exists")
}

/// Pool IDs on the primary IP configuration of a NIC.
pub async fn nic_pools(cloud: &InMemoryCloud, name: &str) -> Vec<String> {
    nic(cloud, name).await.ip_configurations[0]
        .load_balancer_backend_address_pools
        .iter()
        .map(|p| p.id.clone())
        .collect()
}

/// Pool IDs on the scale set's primary IP configuration profile.
pub async fn scale_set_pools(cloud: &InMemoryCloud, name: &str) -> Vec<String> {
    let mut ss = scale_set(cloud, name).await;
    ss.network_configurations_mut().expect("network profile")[0].ip_configurations[0]
        .load_balancer_backend_address_pools
        .iter()
        .map(|p| p.id.clone())
        .collect()
}

/// The load balancer's view of `pool` built from the current NICs.
pub async fn pool_members(cloud: &InMemoryCloud, pool: &str) -> Vec<BackendAddressPool> {
    vec![pool_from_nics(&cloud.snapshot().await.network_interfaces, pool)]
}
