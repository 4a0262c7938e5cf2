//! Backend pool membership rules.
//!
//! Pure functions deciding how an IP configuration's pool list changes. The
//! VM sets fetch and push resources; everything here works on plain values.

use std::fmt;

use crate::error::{Result, VmSetError};
use crate::ids;
use crate::model::{
    BackendAddressPool, IpConfiguration, IpVersion, NetworkInterface, ScaleSetIpConfiguration,
    ScaleSetNetworkConfiguration, SubResource,
};

/// Why a node was left out of a backend pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The node's VM set differs from the requested one.
    NotInVmSet,
    /// The primary NIC is in a failed provisioning state.
    NicFailed,
    /// The IP configuration already belongs to another load balancer.
    ConflictingLoadBalancer,
    /// Labels exclude the node from load balancing.
    Excluded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NotInVmSet => "not in vm set",
            Self::NicFailed => "nic failed",
            Self::ConflictingLoadBalancer => "conflicting load balancer",
            Self::Excluded => "excluded",
        };
        f.write_str(reason)
    }
}

/// Result of ensuring a single host in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The NIC was updated to reference the pool.
    Updated,
    /// The pool was already referenced. Nothing was written.
    AlreadyMember,
    Skipped(SkipReason),
}

/// What adding a pool to an existing pool list requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolChange {
    AlreadyMember,
    /// Existing pools sit on `existing_lb`, a different load balancer.
    Conflict { existing_lb: String },
    Add,
}

/// Decide how `backend_pool_id` joins `pools`.
///
/// Under the standard SKU an IP configuration may reference pools of one
/// load balancer only, so a pool on a different load balancer conflicts.
pub fn plan_pool_addition(
    pools: &[SubResource],
    backend_pool_id: &str,
    standard_sku: bool,
) -> Result<PoolChange> {
    if pools.iter().any(|p| p.id.eq_ignore_ascii_case(backend_pool_id)) {
        return Ok(PoolChange::AlreadyMember);
    }
    if standard_sku && !pools.is_empty() {
        let existing: Vec<String> = pools.iter().map(|p| p.id.clone()).collect();
        let (same_lb, existing_lb) = ids::is_backend_pool_on_same_lb(backend_pool_id, &existing)?;
        if !same_lb {
            return Ok(PoolChange::Conflict { existing_lb });
        }
    }
    Ok(PoolChange::Add)
}

/// Remove every reference to `backend_pool_id`. Returns true if any was removed.
pub fn strip_pool(pools: &mut Vec<SubResource>, backend_pool_id: &str) -> bool {
    let before = pools.len();
    pools.retain(|p| !p.id.eq_ignore_ascii_case(backend_pool_id));
    pools.len() != before
}

/// Index of the primary IP configuration: the only one, else the one
/// flagged primary.
pub fn primary_ip_config_index(nic: &NetworkInterface) -> Result<usize> {
    match nic.ip_configurations.len() {
        0 => Err(VmSetError::InvalidResource(format!(
            "nic {} has no ip configurations",
            nic.name
        ))),
        1 => Ok(0),
        _ => nic
            .ip_configurations
            .iter()
            .position(IpConfiguration::is_primary)
            .ok_or_else(|| {
                VmSetError::InvalidResource(format!(
                    "failed to determine the primary ipconfig. nicname={:?}",
                    nic.name
                ))
            }),
    }
}

/// Index of the first IP configuration with a private address of the family.
pub fn ip_config_index_by_family(nic: &NetworkInterface, ipv6: bool) -> Result<usize> {
    let version = IpVersion::from_ipv6(ipv6);
    nic.ip_configurations
        .iter()
        .position(|c| c.private_ip_address.is_some() && c.private_ip_address_version == version)
        .ok_or_else(|| {
            VmSetError::InvalidResource(format!(
                "failed to determine the ipconfig(IPv6={}). nicname={:?}",
                ipv6, nic.name
            ))
        })
}

/// The IP configuration a service of the given family should use.
///
/// Single-stack IPv4 uses the primary configuration; otherwise the first
/// configuration of the service's family.
pub fn service_ip_config_index(
    nic: &NetworkInterface,
    dual_stack: bool,
    service_ipv6: bool,
) -> Result<usize> {
    if !dual_stack && !service_ipv6 {
        primary_ip_config_index(nic)
    } else {
        ip_config_index_by_family(nic, service_ipv6)
    }
}

/// Strip `backend_pool_id` from every primary IP configuration of `nic`.
/// Returns true if the NIC changed.
pub fn strip_pool_from_nic(nic: &mut NetworkInterface, backend_pool_id: &str) -> bool {
    let single = nic.ip_configurations.len() == 1;
    let mut changed = false;
    for config in nic.ip_configurations.iter_mut() {
        if !single && !config.is_primary() {
            continue;
        }
        changed |= strip_pool(&mut config.load_balancer_backend_address_pools, backend_pool_id);
    }
    changed
}

/// Index of the primary network configuration of a scale set profile.
pub fn primary_network_config_index(
    configs: &[ScaleSetNetworkConfiguration],
    scale_set_name: &str,
) -> Result<usize> {
    if configs.len() == 1 {
        return Ok(0);
    }
    configs
        .iter()
        .position(|c| c.primary.unwrap_or(false))
        .ok_or_else(|| {
            VmSetError::InvalidResource(format!(
                "failed to find a primary network configuration for the scale set {}",
                scale_set_name
            ))
        })
}

/// Index of the scale set IP configuration a service should use.
pub fn scale_set_ip_config_index(
    config: &ScaleSetNetworkConfiguration,
    dual_stack: bool,
    service_ipv6: bool,
) -> Result<usize> {
    let configs: &[ScaleSetIpConfiguration] = &config.ip_configurations;
    let found = if !dual_stack && !service_ipv6 {
        if configs.len() == 1 {
            Some(0)
        } else {
            configs.iter().position(|c| c.primary.unwrap_or(false))
        }
    } else {
        let version = IpVersion::from_ipv6(service_ipv6);
        configs
            .iter()
            .position(|c| c.private_ip_address_version == version)
    };
    found.ok_or_else(|| {
        VmSetError::InvalidResource(format!(
            "failed to find an ip configuration(IPv6={}) in network configuration {}",
            service_ipv6, config.name
        ))
    })
}

/// IDs of the IP configurations that are members of `backend_pool_id`.
pub fn member_ip_configuration_ids(
    pools: &[BackendAddressPool],
    backend_pool_id: &str,
) -> Vec<String> {
    pools
        .iter()
        .filter(|p| p.id.eq_ignore_ascii_case(backend_pool_id))
        .flat_map(|p| p.backend_ip_configurations.iter())
        .filter(|c| !c.id.is_empty())
        .map(|c| c.id.clone())
        .collect()
}

/// The load balancer's view of `backend_pool_id`: every IP configuration
/// across `nics` that references it.
pub fn pool_from_nics(nics: &[NetworkInterface], backend_pool_id: &str) -> BackendAddressPool {
    let backend_ip_configurations = nics
        .iter()
        .flat_map(|nic| nic.ip_configurations.iter())
        .filter(|c| {
            c.load_balancer_backend_address_pools
                .iter()
                .any(|p| p.id.eq_ignore_ascii_case(backend_pool_id))
        })
        .map(|c| SubResource::new(c.id.clone()))
        .collect();
    BackendAddressPool {
        id: backend_pool_id.to_string(),
        backend_ip_configurations,
    }
}
