//! Cloud provider configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmSetError};

pub const DEFAULT_VM_CACHE_TTL_SECS: u64 = 60;
pub const DEFAULT_AVAILABILITY_SET_CACHE_TTL_SECS: u64 = 600;
pub const DEFAULT_SCALE_SET_CACHE_TTL_SECS: u64 = 600;
pub const DEFAULT_SCALE_SET_VM_CACHE_TTL_SECS: u64 = 600;
pub const DEFAULT_PUBLIC_IP_CACHE_TTL_SECS: u64 = 120;

pub const DEFAULT_NODE_CIDR_MASK_IPV4: u32 = 24;
pub const DEFAULT_NODE_CIDR_MASK_IPV6: u32 = 64;

/// Which VM set implementation backs the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    #[default]
    Standard,
    #[serde(rename = "vmssflex")]
    VmssFlex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerSku {
    Basic,
    #[default]
    Standard,
}

/// Settings consumed by the VM sets. Every field has a default so partial
/// JSON documents load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
    /// Subscription of network resources, when it differs.
    pub network_resource_subscription_id: Option<String>,
    pub vm_type: VmType,
    pub load_balancer_sku: LoadBalancerSku,
    /// VM set used for services without a mode annotation.
    pub primary_availability_set_name: String,
    pub primary_scale_set_name: String,
    pub enable_multiple_standard_load_balancers: bool,
    pub exclude_master_from_standard_lb: bool,
    /// VM sets sharing the primary standard load balancer.
    pub node_pools_without_dedicated_slb: Vec<String>,
    pub ipv6_dual_stack_enabled: bool,

    pub vm_cache_ttl_secs: u64,
    pub availability_set_cache_ttl_secs: u64,
    pub scale_set_cache_ttl_secs: u64,
    pub scale_set_vm_cache_ttl_secs: u64,
    pub public_ip_cache_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            resource_group: String::new(),
            location: String::new(),
            network_resource_subscription_id: None,
            vm_type: VmType::default(),
            load_balancer_sku: LoadBalancerSku::default(),
            primary_availability_set_name: String::new(),
            primary_scale_set_name: String::new(),
            enable_multiple_standard_load_balancers: false,
            exclude_master_from_standard_lb: true,
            node_pools_without_dedicated_slb: Vec::new(),
            ipv6_dual_stack_enabled: false,
            vm_cache_ttl_secs: DEFAULT_VM_CACHE_TTL_SECS,
            availability_set_cache_ttl_secs: DEFAULT_AVAILABILITY_SET_CACHE_TTL_SECS,
            scale_set_cache_ttl_secs: DEFAULT_SCALE_SET_CACHE_TTL_SECS,
            scale_set_vm_cache_ttl_secs: DEFAULT_SCALE_SET_VM_CACHE_TTL_SECS,
            public_ip_cache_ttl_secs: DEFAULT_PUBLIC_IP_CACHE_TTL_SECS,
        }
    }
}

impl Config {
    /// Parse a JSON document and validate it.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| VmSetError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| VmSetError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscription_id.is_empty() {
            return Err(VmSetError::InvalidConfig("subscriptionId is required".into()));
        }
        if self.resource_group.is_empty() {
            return Err(VmSetError::InvalidConfig("resourceGroup is required".into()));
        }
        for (field, ttl) in [
            ("vmCacheTtlSecs", self.vm_cache_ttl_secs),
            ("availabilitySetCacheTtlSecs", self.availability_set_cache_ttl_secs),
            ("scaleSetCacheTtlSecs", self.scale_set_cache_ttl_secs),
            ("scaleSetVmCacheTtlSecs", self.scale_set_vm_cache_ttl_secs),
            ("publicIpCacheTtlSecs", self.public_ip_cache_ttl_secs),
        ] {
            if ttl == 0 {
                return Err(VmSetError::InvalidConfig(format!("{} must be positive", field)));
            }
        }
        if self.vm_type == VmType::VmssFlex && self.load_balancer_sku == LoadBalancerSku::Basic {
            return Err(VmSetError::BasicLoadBalancerUnsupported);
        }
        Ok(())
    }

    pub fn use_standard_load_balancer(&self) -> bool {
        self.load_balancer_sku == LoadBalancerSku::Standard
    }

    /// True when several standard load balancers serve the cluster.
    pub fn use_multiple_standard_load_balancers(&self) -> bool {
        self.use_standard_load_balancer() && self.enable_multiple_standard_load_balancers
    }

    /// Whether `vm_set_name` shares the primary standard load balancer.
    pub fn shares_primary_load_balancer(&self, vm_set_name: &str) -> bool {
        self.node_pools_without_dedicated_slb
            .iter()
            .any(|pool| pool.eq_ignore_ascii_case(vm_set_name))
    }

    /// The primary VM set name for the configured VM type.
    pub fn primary_vm_set_name(&self) -> &str {
        match self.vm_type {
            VmType::Standard => &self.primary_availability_set_name,
            VmType::VmssFlex => &self.primary_scale_set_name,
        }
    }

    pub fn vm_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.vm_cache_ttl_secs)
    }

    pub fn availability_set_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.availability_set_cache_ttl_secs)
    }

    pub fn scale_set_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.scale_set_cache_ttl_secs)
    }

    pub fn scale_set_vm_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.scale_set_vm_cache_ttl_secs)
    }

    pub fn public_ip_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.public_ip_cache_ttl_secs)
    }
}
