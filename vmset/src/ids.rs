//! Resource identifier codec.
//!
//! Cloud resources are addressed by path-like IDs such as
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{ns}/{type}/{name}`.
//! This module extracts components from those IDs and builds new ones.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, VmSetError};

const COMPUTE_PROVIDER: &str = "Microsoft.Compute";
const NETWORK_PROVIDER: &str = "Microsoft.Network";

static PROVIDER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i).*/subscriptions/(?:.*)/Microsoft\.Compute/virtualMachines/(.+)$")
        .expect("provider ID pattern compiles")
});

static BACKEND_POOL_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^/subscriptions/(?:.*)/resourceGroups/(?:.*)/providers/Microsoft\.Network/loadBalancers/(.+)/backendAddressPools/(?:.*)",
    )
    .expect("backend pool ID pattern compiles")
});

static NIC_RESOURCE_GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i).*/subscriptions/(?:.*)/resourceGroups/(.+)/providers/Microsoft\.Network/networkInterfaces/(?:.*)",
    )
    .expect("NIC resource group pattern compiles")
});

static IP_CONFIGURATION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)/subscriptions/(?:.*)/resourceGroups/(.+)/providers/Microsoft\.Network/networkInterfaces/(.+)/ipConfigurations/(?:.*)",
    )
    .expect("IP configuration ID pattern compiles")
});

static VM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)/subscriptions/(?:.*)/resourceGroups/(?:.*)/providers/Microsoft\.Compute/virtualMachines/(.+)",
    )
    .expect("VM ID pattern compiles")
});

static AVAILABILITY_SET_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)/subscriptions/(?:.*)/resourceGroups/(?:.*)/providers/Microsoft\.Compute/availabilitySets/(.+)",
    )
    .expect("availability set ID pattern compiles")
});

static RESOURCE_GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/resourceGroups/([^/]+)(?:/|$)").expect("resource group pattern compiles")
});

/// Run `re` against `id` and return its capture groups, requiring exactly
/// `groups` of them to be present.
fn captures<'a>(re: &Regex, id: &'a str, groups: usize, kind: &'static str) -> Result<Vec<&'a str>> {
    let caps = re
        .captures(id)
        .ok_or_else(|| VmSetError::invalid_id(kind, id))?;
    if caps.len() != groups + 1 {
        return Err(VmSetError::invalid_id(kind, id));
    }
    caps.iter()
        .skip(1)
        .map(|m| m.map(|m| m.as_str()).ok_or_else(|| VmSetError::invalid_id(kind, id)))
        .collect()
}

fn single_capture<'a>(re: &Regex, id: &'a str, kind: &'static str) -> Result<&'a str> {
    Ok(captures(re, id, 1, kind)?[0])
}

/// The segment after the last `sep`. An empty trailing segment is an error.
pub fn last_segment(id: &str, sep: char) -> Result<&str> {
    match id.rsplit(sep).next() {
        Some(segment) if !segment.is_empty() => Ok(segment),
        _ => Err(VmSetError::invalid_id("resource", id)),
    }
}

/// Extract the VM name from a node's provider ID (`azure:///subscriptions/...`).
pub fn node_name_from_provider_id(provider_id: &str) -> Result<&str> {
    single_capture(&PROVIDER_ID_RE, provider_id, "provider")
}

/// Extract the load balancer name from a backend pool ID.
pub fn load_balancer_name_from_backend_pool_id(pool_id: &str) -> Result<&str> {
    single_capture(&BACKEND_POOL_ID_RE, pool_id, "backend pool")
}

/// Extract the resource group from a network interface ID.
pub fn resource_group_from_nic_id(nic_id: &str) -> Result<&str> {
    single_capture(&NIC_RESOURCE_GROUP_RE, nic_id, "network interface")
}

/// Split an IP configuration ID into (NIC resource group, NIC name).
pub fn parse_ip_configuration_id(ip_config_id: &str) -> Result<(&str, &str)> {
    let caps = captures(&IP_CONFIGURATION_ID_RE, ip_config_id, 2, "IP configuration")?;
    Ok((caps[0], caps[1]))
}

/// Extract the VM name from a VM ID.
pub fn vm_name_from_vm_id(vm_id: &str) -> Result<&str> {
    single_capture(&VM_ID_RE, vm_id, "virtual machine")
}

/// Extract the availability set name from its ID.
///
/// An empty ID denotes a standalone VM and yields an empty name.
pub fn availability_set_name_from_id(id: &str) -> Result<&str> {
    if id.is_empty() {
        return Ok("");
    }
    single_capture(&AVAILABILITY_SET_ID_RE, id, "availability set")
}

/// Extract the resource group segment of any resource ID.
pub fn resource_group_from_id(id: &str) -> Result<&str> {
    single_capture(&RESOURCE_GROUP_RE, id, "resource")
}

/// Lower-case the resource group segment of `id`, leaving the rest intact.
pub fn convert_resource_group_name_to_lower(id: &str) -> Result<String> {
    let caps = RESOURCE_GROUP_RE
        .captures(id)
        .ok_or_else(|| VmSetError::invalid_id("resource", id))?;
    let group = caps
        .get(1)
        .ok_or_else(|| VmSetError::invalid_id("resource", id))?;
    let mut out = String::with_capacity(id.len());
    out.push_str(&id[..group.start()]);
    out.push_str(&group.as_str().to_lowercase());
    out.push_str(&id[group.end()..]);
    Ok(out)
}

/// Check whether `new_pool` sits on the same load balancer as every pool in
/// `existing_pools`.
///
/// Returns `(true, "")` when they agree, otherwise `(false, old_lb)` naming
/// the load balancer already referenced. An existing pool ID that does not
/// parse is an error.
pub fn is_backend_pool_on_same_lb(new_pool: &str, existing_pools: &[String]) -> Result<(bool, String)> {
    let new_lb = load_balancer_name_from_backend_pool_id(new_pool)?;
    for pool in existing_pools {
        let lb = load_balancer_name_from_backend_pool_id(pool)?;
        if !lb.eq_ignore_ascii_case(new_lb) {
            return Ok((false, lb.to_string()));
        }
    }
    Ok((true, String::new()))
}

/// Builds resource IDs for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdBuilder {
    pub subscription_id: String,
    /// Subscription holding network resources. Defaults to `subscription_id`.
    pub network_subscription_id: String,
}

impl IdBuilder {
    pub fn new(subscription_id: impl Into<String>, network_subscription_id: Option<String>) -> Self {
        let subscription_id = subscription_id.into();
        let network_subscription_id = network_subscription_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| subscription_id.clone());
        Self {
            subscription_id,
            network_subscription_id,
        }
    }

    fn resource_id(
        subscription: &str,
        resource_group: &str,
        provider: &str,
        kind: &str,
        name: &str,
    ) -> Result<String> {
        for (what, value) in [
            ("subscription", subscription),
            ("resource group", resource_group),
            ("name", name),
        ] {
            if value.is_empty() {
                return Err(VmSetError::InvalidResource(format!(
                    "cannot build {} ID with an empty {}",
                    kind, what
                )));
            }
        }
        Ok(format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            subscription, resource_group, provider, kind, name
        ))
    }

    pub fn machine_id(&self, resource_group: &str, machine_name: &str) -> Result<String> {
        Self::resource_id(
            &self.subscription_id,
            resource_group,
            COMPUTE_PROVIDER,
            "virtualMachines",
            machine_name,
        )
    }

    pub fn availability_set_id(&self, resource_group: &str, name: &str) -> Result<String> {
        Self::resource_id(
            &self.subscription_id,
            resource_group,
            COMPUTE_PROVIDER,
            "availabilitySets",
            name,
        )
    }

    pub fn network_interface_id(&self, resource_group: &str, name: &str) -> Result<String> {
        Self::resource_id(
            &self.network_subscription_id,
            resource_group,
            NETWORK_PROVIDER,
            "networkInterfaces",
            name,
        )
    }

    fn load_balancer_child_id(
        &self,
        resource_group: &str,
        lb_name: &str,
        child_kind: &str,
        child_name: &str,
    ) -> Result<String> {
        if child_name.is_empty() {
            return Err(VmSetError::InvalidResource(format!(
                "cannot build {} ID with an empty name",
                child_kind
            )));
        }
        let lb = Self::resource_id(
            &self.network_subscription_id,
            resource_group,
            NETWORK_PROVIDER,
            "loadBalancers",
            lb_name,
        )?;
        Ok(format!("{}/{}/{}", lb, child_kind, child_name))
    }

    pub fn frontend_ip_config_id(&self, resource_group: &str, lb_name: &str, name: &str) -> Result<String> {
        self.load_balancer_child_id(resource_group, lb_name, "frontendIPConfigurations", name)
    }

    pub fn backend_pool_id(&self, resource_group: &str, lb_name: &str, name: &str) -> Result<String> {
        self.load_balancer_child_id(resource_group, lb_name, "backendAddressPools", name)
    }

    pub fn load_balancer_probe_id(&self, resource_group: &str, lb_name: &str, name: &str) -> Result<String> {
        self.load_balancer_child_id(resource_group, lb_name, "probes", name)
    }
}
