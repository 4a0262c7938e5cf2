//! vmsetctl: resolve nodes and manage backend pool membership against a
//! cloud inventory snapshot.
//!
//! The inventory is a JSON file holding VMs, NICs, availability sets, scale
//! sets and public IPs. Commands that change pool membership write the
//! updated inventory back to the same file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmset::backend_pool::pool_from_nics;
use vmset::model::{ANNOTATION_LB_MODE, Node, Service};
use vmset::{
    BackendPoolReconciler, BackendPoolSpec, CloudClient, Config, InMemoryCloud, Inventory,
    Reconciler, VmSet,
};

/// Node resolution and backend pool reconciliation
#[derive(Parser, Debug)]
#[command(name = "vmsetctl", version, about)]
struct Cli {
    /// Cloud configuration (JSON)
    #[arg(short, long, default_value = "vmset.json")]
    config: PathBuf,

    /// Inventory snapshot (JSON)
    #[arg(short, long, default_value = "inventory.json")]
    inventory: PathBuf,

    /// Print metrics in the prometheus text format before exiting
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct ServiceArgs {
    /// Service namespace
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Service name
    #[arg(long, default_value = "default")]
    service: String,

    /// Service cluster IP, selects the address family
    #[arg(long, default_value = "10.0.0.10")]
    cluster_ip: String,

    /// Load balancer mode annotation (`__auto__` or a VM set name)
    #[arg(long)]
    mode: Option<String>,
}

impl ServiceArgs {
    fn to_service(&self) -> Service {
        let mut service = Service::new(&self.namespace, &self.service, &self.cluster_ip);
        if let Some(mode) = &self.mode {
            service
                .annotations
                .insert(ANNOTATION_LB_MODE.to_string(), mode.clone());
        }
        service
    }
}

#[derive(clap::Args, Debug)]
struct NodeArgs {
    /// Comma-separated node names
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// JSON file with a list of nodes, including labels
    #[arg(long, conflicts_with = "nodes")]
    nodes_file: Option<PathBuf>,
}

impl NodeArgs {
    async fn load(&self) -> Result<Vec<Node>> {
        match &self.nodes_file {
            Some(path) => read_json(path).await,
            None => Ok(self.nodes.iter().map(Node::new).collect()),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what is known about a node
    Show {
        /// Node name
        node: String,
    },

    /// Resolve a provider ID to a node name
    NodeName {
        /// Provider ID (azure:///subscriptions/...)
        provider_id: String,
    },

    /// Show the node CIDR mask sizes for a provider ID
    Cidr {
        /// Provider ID (azure:///subscriptions/...)
        provider_id: String,
    },

    /// Find the node and VM set owning an IP configuration
    Owner {
        /// IP configuration ID
        ip_configuration_id: String,
    },

    /// List the VM sets a service should use
    VmSets {
        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        nodes: NodeArgs,
    },

    /// Add nodes to a backend pool
    Ensure {
        /// Backend pool ID
        #[arg(long)]
        pool: String,

        /// VM set to scope the pool to
        #[arg(long, default_value = "")]
        vm_set: String,

        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        nodes: NodeArgs,
    },

    /// Remove the members of one VM set from a backend pool
    Remove {
        /// Backend pool ID
        #[arg(long)]
        pool: String,

        /// VM set whose members are removed
        #[arg(long, default_value = "")]
        vm_set: String,

        /// Also strip the pool from VM set profiles
        #[arg(long)]
        delete_from_vm_set: bool,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Reconcile a backend pool spec (JSON), optionally finalizing it
    Reconcile {
        /// Backend pool spec file
        spec: PathBuf,

        /// Tear the pool down after reconciling
        #[arg(long)]
        finalize: bool,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeReport {
    name: String,
    instance_id: String,
    instance_type: String,
    zone: String,
    region: String,
    power_state: String,
    provisioning_state: String,
    private_ip: String,
    public_ip: String,
    vm_set: String,
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn save_inventory(cloud: &InMemoryCloud, path: &Path) -> Result<()> {
    cloud
        .snapshot()
        .await
        .save(path)
        .await
        .with_context(|| format!("failed to write inventory {}", path.display()))?;
    debug!("Inventory written to {}", path.display());
    Ok(())
}

async fn show_node(vm_set: &dyn VmSet, name: &str) -> Result<NodeReport> {
    let zone = vm_set.get_zone_by_node_name(name).await?;
    let (private_ip, public_ip) = vm_set.get_ip_by_node_name(name).await?;
    Ok(NodeReport {
        name: name.to_string(),
        instance_id: vm_set.get_instance_id_by_node_name(name).await?,
        instance_type: vm_set.get_instance_type_by_node_name(name).await?,
        zone: zone.failure_domain,
        region: zone.region,
        power_state: vm_set.get_power_status_by_node_name(name).await?,
        provisioning_state: vm_set.get_provisioning_state_by_node_name(name).await?,
        private_ip,
        public_ip,
        vm_set: vm_set.get_node_vm_set_name(&Node::new(name)).await?,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    let inventory = Inventory::load(&cli.inventory)
        .await
        .with_context(|| format!("failed to load inventory {}", cli.inventory.display()))?;
    info!(
        "Loaded {} VMs and {} NICs from {}",
        inventory.virtual_machines.len(),
        inventory.network_interfaces.len(),
        cli.inventory.display()
    );

    let cloud = InMemoryCloud::shared(inventory);
    let client: Arc<dyn CloudClient> = cloud.clone();
    let vm_set = vmset::new_vm_set(config, client).context("failed to build vm set")?;

    match cli.command {
        Commands::Show { node } => {
            let report = show_node(vm_set.as_ref(), &node)
                .await
                .with_context(|| format!("failed to resolve node {}", node))?;
            print_json(&report)?;
        }
        Commands::NodeName { provider_id } => {
            println!("{}", vm_set.get_node_name_by_provider_id(&provider_id).await?);
        }
        Commands::Cidr { provider_id } => {
            let (ipv4, ipv6) = vm_set
                .get_node_cidr_masks_by_provider_id(&provider_id)
                .await?;
            println!("IPv4: /{}", ipv4);
            println!("IPv6: /{}", ipv6);
        }
        Commands::Owner { ip_configuration_id } => {
            let (node, vm_set_name) = vm_set
                .get_node_name_by_ip_configuration_id(&ip_configuration_id)
                .await?;
            if node.is_empty() {
                println!("IP configuration is not attached to a VM");
            } else {
                println!("Node:   {}", node);
                println!("VM set: {}", if vm_set_name.is_empty() { "-" } else { vm_set_name.as_str() });
            }
        }
        Commands::VmSets { service, nodes } => {
            let nodes = nodes.load().await?;
            vm_set.observe_nodes(&nodes);
            for name in vm_set.get_vm_set_names(&service.to_service(), &nodes).await? {
                println!("{}", name);
            }
        }
        Commands::Ensure {
            pool,
            vm_set: vm_set_name,
            service,
            nodes,
        } => {
            let nodes = nodes.load().await?;
            if nodes.is_empty() {
                bail!("no nodes given, use --nodes or --nodes-file");
            }
            let result = vm_set
                .ensure_hosts_in_pool(&service.to_service(), &nodes, &pool, &vm_set_name)
                .await;
            save_inventory(&cloud, &cli.inventory).await?;
            result.with_context(|| format!("failed to ensure hosts in pool {}", pool))?;
            println!("Ensured {} nodes in {}", nodes.len(), pool);
        }
        Commands::Remove {
            pool,
            vm_set: vm_set_name,
            delete_from_vm_set,
            service,
        } => {
            let members = vec![pool_from_nics(&cloud.snapshot().await.network_interfaces, &pool)];
            let count = members[0].backend_ip_configurations.len();
            let result = vm_set
                .ensure_backend_pool_deleted(
                    &service.to_service(),
                    &pool,
                    &vm_set_name,
                    &members,
                    delete_from_vm_set,
                )
                .await;
            save_inventory(&cloud, &cli.inventory).await?;
            result.with_context(|| format!("failed to remove members of pool {}", pool))?;
            println!("Processed {} pool members of {}", count, pool);
        }
        Commands::Reconcile { spec, finalize } => {
            let spec: BackendPoolSpec = read_json(&spec).await?;
            let id = format!("{}/{}", spec.service.full_name(), spec.backend_pool_id);
            let reconciler = BackendPoolReconciler::new(vm_set.clone());

            let status = reconciler.reconcile(&id, &spec).await?;
            if finalize {
                let members = pool_from_nics(
                    &cloud.snapshot().await.network_interfaces,
                    &spec.backend_pool_id,
                );
                reconciler.update_members(&id, vec![members]);
                reconciler.finalize(&id).await?;
            }
            save_inventory(&cloud, &cli.inventory).await?;
            print_json(&status)?;
        }
    }

    if cli.metrics {
        let text = vmset::metrics::render().context("failed to render metrics")?;
        print!("{}", text);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vmset=info,vmsetctl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    run(Cli::parse()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_args_mode_annotation() {
        let args = ServiceArgs {
            namespace: "kube-system".to_string(),
            service: "dns".to_string(),
            cluster_ip: "fd00::10".to_string(),
            mode: Some("__auto__".to_string()),
        };
        let service = args.to_service();
        assert_eq!(service.full_name(), "kube-system/dns");
        assert!(service.is_ipv6());
        assert_eq!(service.load_balancer_mode(), (true, true, "__auto__".to_string()));
    }

    #[test]
    fn test_cli_parses_ensure() {
        let cli = Cli::parse_from([
            "vmsetctl",
            "--inventory",
            "inv.json",
            "ensure",
            "--pool",
            "pool-id",
            "--nodes",
            "node-0,node-1",
        ]);
        match cli.command {
            Commands::Ensure { pool, nodes, vm_set, .. } => {
                assert_eq!(pool, "pool-id");
                assert_eq!(nodes.nodes, vec!["node-0".to_string(), "node-1".to_string()]);
                assert!(vm_set.is_empty());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.inventory, PathBuf::from("inv.json"));
    }

    #[tokio::test]
    async fn test_ensure_writes_inventory_back() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vmset.json");
        let inventory_path = dir.path().join("inventory.json");

        tokio::fs::write(
            &config_path,
            r#"{"subscriptionId": "sub", "resourceGroup": "rg", "location": "eastus"}"#,
        )
        .await
        .unwrap();
        let inventory: Inventory = serde_json::from_str(
            r#"{
                "virtualMachines": [{
                    "id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/node-0",
                    "name": "node-0",
                    "networkInterfaces": [{"id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/node-0-nic"}]
                }],
                "networkInterfaces": [{
                    "id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/node-0-nic",
                    "name": "node-0-nic",
                    "provisioningState": "Succeeded",
                    "ipConfigurations": [{
                        "id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/node-0-nic/ipConfigurations/ipconfig1",
                        "name": "ipconfig1",
                        "privateIpAddress": "10.0.0.4"
                    }]
                }]
            }"#,
        )
        .unwrap();
        inventory.save(&inventory_path).await.unwrap();

        let pool = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/kubernetes/backendAddressPools/kubernetes";
        let cli = Cli::parse_from([
            "vmsetctl",
            "--config",
            config_path.to_str().unwrap(),
            "--inventory",
            inventory_path.to_str().unwrap(),
            "ensure",
            "--pool",
            pool,
            "--nodes",
            "node-0",
        ]);
        run(cli).await.unwrap();

        let saved = Inventory::load(&inventory_path).await.unwrap();
        let pools = &saved.network_interfaces[0].ip_configurations[0].load_balancer_backend_address_pools;
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].id, pool);
    }
}
