//! Cloud control plane APIs consumed by the VM sets.
//!
//! The [`CloudClient`] trait is the only way the rest of the crate talks to
//! compute and network resources. [`memory::InMemoryCloud`] implements it
//! over a JSON inventory snapshot.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    AvailabilitySet, NetworkInterface, PublicIpAddress, ScaleSet, VirtualMachine,
};

pub use memory::{Inventory, InMemoryCloud};

/// Errors returned by the cloud control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("request failed with status {status}: {message}")]
    Api { status: u16, message: String },
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api { status, .. } => *status == 404,
        }
    }
}

/// Compute and network operations needed to resolve nodes and update
/// backend pools.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Get a VM with its instance view expanded.
    async fn get_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine, CloudError>;

    async fn list_virtual_machines(
        &self,
        resource_group: &str,
    ) -> Result<Vec<VirtualMachine>, CloudError>;

    /// List the VMs owned by a flexible scale set.
    async fn list_scale_set_virtual_machines(
        &self,
        scale_set_id: &str,
    ) -> Result<Vec<VirtualMachine>, CloudError>;

    async fn get_network_interface(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<NetworkInterface, CloudError>;

    async fn create_or_update_network_interface(
        &self,
        resource_group: &str,
        name: &str,
        nic: NetworkInterface,
    ) -> Result<(), CloudError>;

    async fn list_availability_sets(
        &self,
        resource_group: &str,
    ) -> Result<Vec<AvailabilitySet>, CloudError>;

    async fn list_scale_sets(&self, resource_group: &str) -> Result<Vec<ScaleSet>, CloudError>;

    async fn get_scale_set(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<ScaleSet, CloudError>;

    async fn create_or_update_scale_set(
        &self,
        resource_group: &str,
        name: &str,
        scale_set: ScaleSet,
    ) -> Result<(), CloudError>;

    async fn get_public_ip_address(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<PublicIpAddress, CloudError>;
}
