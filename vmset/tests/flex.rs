mod common;

use common::*;
use vmset::model::{LABEL_CONTROL_PLANE, Node, SubResource};
use vmset::{CloudClient, CloudError, EnsureOutcome, LoadBalancerSku, SkipReason, VmSetError};

fn two_scale_sets() -> Fixture {
    Fixture::new()
        .scale_set("ss-1")
        .scale_set("ss-2")
        .flex_vm("ss-1_0a1b2c", "Node-0", "ss-1")
        .flex_vm("ss-1_3d4e5f", "node-1", "ss-1")
        .flex_vm("ss-2_6a7b8c", "node-2", "ss-2")
}

#[tokio::test]
async fn test_node_resolution() {
    let cloud = two_scale_sets().build();
    let vm_set = new_vm_set(flex_config(), &cloud);

    assert_eq!(
        vm_set
            .get_node_name_by_provider_id(&provider_id("ss-1_0a1b2c"))
            .await
            .unwrap(),
        "node-0"
    );
    assert_eq!(
        vm_set.get_node_vm_set_name(&Node::new("node-2")).await.unwrap(),
        "ss-2"
    );
    assert_eq!(
        vm_set.get_instance_type_by_node_name("node-1").await.unwrap(),
        "Standard_D2s_v3"
    );
    assert_eq!(vm_set.get_power_status_by_node_name("node-0").await.unwrap(), "running");
    assert!(
        vm_set
            .get_instance_id_by_node_name("node-0")
            .await
            .unwrap()
            .ends_with("/virtualMachines/ss-1_0a1b2c")
    );
    assert_eq!(
        vm_set.get_ip_by_node_name("node-2").await.unwrap(),
        ("10.0.0.6".to_string(), String::new())
    );
    assert_eq!(vm_set.get_primary_vm_set_name(), "ss-1");

    assert!(matches!(
        vm_set.get_instance_type_by_node_name("unknown").await,
        Err(VmSetError::InstanceNotFound)
    ));
}

#[tokio::test]
async fn test_node_index_is_built_once() {
    let cloud = two_scale_sets().build();
    let vm_set = new_vm_set(flex_config(), &cloud);

    for _ in 0..3 {
        vm_set.get_node_vm_set_name(&Node::new("node-1")).await.unwrap();
    }
    assert_eq!(cloud.calls("list_scale_sets"), 1);
    assert!(cloud.calls("list_scale_set_virtual_machines") <= 2);
}

#[tokio::test]
async fn test_basic_load_balancer_rejected() {
    let cloud = two_scale_sets().build();
    let client: std::sync::Arc<dyn CloudClient> = cloud.clone();
    let config = vmset::Config {
        load_balancer_sku: LoadBalancerSku::Basic,
        ..flex_config()
    };
    assert!(matches!(
        vmset::new_vm_set(config, client),
        Err(VmSetError::BasicLoadBalancerUnsupported)
    ));
}

#[tokio::test]
async fn test_ensure_hosts_updates_nics_and_scale_set_profiles() {
    let cloud = two_scale_sets().build();
    let vm_set = new_vm_set(flex_config(), &cloud);
    let pool = pool_id("kubernetes", "kubernetes");
    let nodes = nodes(&["node-0", "node-1", "node-2"]);

    vm_set
        .ensure_hosts_in_pool(&service(), &nodes, &pool, "ss-1")
        .await
        .unwrap();
    for nic in ["ss-1_0a1b2c-nic", "ss-1_3d4e5f-nic", "ss-2_6a7b8c-nic"] {
        assert_eq!(nic_pools(&cloud, nic).await, vec![pool.clone()]);
    }
    assert_eq!(scale_set_pools(&cloud, "ss-1").await, vec![pool.clone()]);
    assert_eq!(scale_set_pools(&cloud, "ss-2").await, vec![pool.clone()]);
    assert_eq!(cloud.calls("create_or_update_scale_set"), 2);
    assert_eq!(cloud.calls("create_or_update_network_interface"), 3);

    vm_set
        .ensure_hosts_in_pool(&service(), &nodes, &pool, "ss-1")
        .await
        .unwrap();
    assert_eq!(cloud.calls("create_or_update_scale_set"), 2);
    assert_eq!(cloud.calls("create_or_update_network_interface"), 3);
}

#[tokio::test]
async fn test_profile_update_starts_from_latest_scale_set() {
    let cloud = two_scale_sets().build();
    let vm_set = new_vm_set(flex_config(), &cloud);
    // warm the scale set cache
    vm_set.get_node_vm_set_name(&Node::new("node-0")).await.unwrap();

    let outbound = pool_id("kubernetes", "outbound");
    let added = outbound.clone();
    cloud
        .update(move |inventory| {
            let ss = inventory
                .scale_sets
                .iter_mut()
                .find(|ss| ss.name == "ss-1")
                .unwrap();
            ss.network_configurations_mut().unwrap()[0].ip_configurations[0]
                .load_balancer_backend_address_pools
                .push(SubResource::new(added));
        })
        .await;

    let pool = pool_id("kubernetes", "kubernetes");
    vm_set
        .ensure_hosts_in_pool(&service(), &nodes(&["node-0"]), &pool, "")
        .await
        .unwrap();
    assert_eq!(scale_set_pools(&cloud, "ss-1").await, vec![outbound, pool]);
    assert_eq!(cloud.calls("get_scale_set"), 1);
}

#[tokio::test]
async fn test_failed_profile_update_still_updates_nics() {
    let cloud = two_scale_sets().build();
    cloud.fail(
        "create_or_update_scale_set",
        CloudError::Api {
            status: 500,
            message: "boom".to_string(),
        },
    );
    let vm_set = new_vm_set(flex_config(), &cloud);
    let pool = pool_id("kubernetes", "kubernetes");

    let err = vm_set
        .ensure_hosts_in_pool(&service(), &nodes(&["node-0", "node-1"]), &pool, "")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("boom"), "{err}");
    assert_eq!(cloud.calls("create_or_update_network_interface"), 2);
    assert_eq!(nic_pools(&cloud, "ss-1_0a1b2c-nic").await, vec![pool.clone()]);
    assert_eq!(nic_pools(&cloud, "ss-1_3d4e5f-nic").await, vec![pool]);
    assert!(scale_set_pools(&cloud, "ss-1").await.is_empty());
}

#[tokio::test]
async fn test_deallocating_scale_set_profile_untouched() {
    let cloud = two_scale_sets()
        .with_scale_set("ss-2", |ss| ss.provisioning_state = Some("Deallocating".to_string()))
        .build();
    let vm_set = new_vm_set(flex_config(), &cloud);
    let pool = pool_id("kubernetes", "kubernetes");

    vm_set
        .ensure_hosts_in_pool(&service(), &nodes(&["node-0", "node-2"]), &pool, "")
        .await
        .unwrap();
    assert_eq!(scale_set_pools(&cloud, "ss-1").await, vec![pool.clone()]);
    assert!(scale_set_pools(&cloud, "ss-2").await.is_empty());
    assert_eq!(nic_pools(&cloud, "ss-2_6a7b8c-nic").await, vec![pool]);
}

#[tokio::test]
async fn test_scale_set_profile_conflict_is_left_alone() {
    let other = pool_id("internal", "kubernetes");
    let cloud = two_scale_sets()
        .with_scale_set("ss-1", |ss| {
            ss.network_configurations_mut().unwrap()[0].ip_configurations[0]
                .load_balancer_backend_address_pools
                .push(SubResource::new(other.clone()));
        })
        .build();
    let vm_set = new_vm_set(flex_config(), &cloud);

    vm_set
        .ensure_hosts_in_pool(&service(), &nodes(&["node-0"]), &pool_id("kubernetes", "kubernetes"), "")
        .await
        .unwrap();
    assert_eq!(scale_set_pools(&cloud, "ss-1").await, vec![other]);
    assert_eq!(cloud.calls("create_or_update_scale_set"), 0);
}

#[tokio::test]
async fn test_multiple_load_balancers_use_named_scale_set() {
    let cloud = two_scale_sets().build();
    let config = vmset::Config {
        enable_multiple_standard_load_balancers: true,
        ..flex_config()
    };
    let vm_set = new_vm_set(config, &cloud);
    let pool = pool_id("ss-2", "ss-2");

    vm_set
        .ensure_hosts_in_pool(&service(), &nodes(&["node-0", "node-2"]), &pool, "ss-2")
        .await
        .unwrap();
    assert!(scale_set_pools(&cloud, "ss-1").await.is_empty());
    assert_eq!(scale_set_pools(&cloud, "ss-2").await, vec![pool.clone()]);
    assert!(nic_pools(&cloud, "ss-1_0a1b2c-nic").await.is_empty());
    assert_eq!(nic_pools(&cloud, "ss-2_6a7b8c-nic").await, vec![pool.clone()]);

    assert_eq!(
        vm_set
            .ensure_host_in_pool(&service(), "node-0", &pool, "ss-2")
            .await
            .unwrap(),
        EnsureOutcome::Skipped(SkipReason::NotInVmSet)
    );
}

#[tokio::test]
async fn test_backend_pool_deleted_from_nics_and_scale_set() {
    let cloud = two_scale_sets().build();
    let vm_set = new_vm_set(flex_config(), &cloud);
    let pool = pool_id("kubernetes", "kubernetes");

    vm_set
        .ensure_hosts_in_pool(&service(), &nodes(&["node-0", "node-1", "node-2"]), &pool, "")
        .await
        .unwrap();
    let members = pool_members(&cloud, &pool).await;

    vm_set
        .ensure_backend_pool_deleted(&service(), &pool, "ss-1", &members, true)
        .await
        .unwrap();
    assert!(nic_pools(&cloud, "ss-1_0a1b2c-nic").await.is_empty());
    assert!(nic_pools(&cloud, "ss-1_3d4e5f-nic").await.is_empty());
    assert!(scale_set_pools(&cloud, "ss-1").await.is_empty());
    assert_eq!(nic_pools(&cloud, "ss-2_6a7b8c-nic").await, vec![pool.clone()]);
    assert_eq!(scale_set_pools(&cloud, "ss-2").await, vec![pool.clone()]);

    vm_set
        .ensure_backend_pool_deleted_from_vm_sets(&["ss-2".to_string()], &pool)
        .await
        .unwrap();
    assert!(scale_set_pools(&cloud, "ss-2").await.is_empty());
}

#[tokio::test]
async fn test_reverse_lookup_and_cidr_masks() {
    let cloud = two_scale_sets()
        .with_scale_set("ss-2", |ss| {
            ss.tags
                .insert("kubernetesNodeCIDRMaskIPV4".to_string(), "25".to_string());
        })
        .build();
    let vm_set = new_vm_set(flex_config(), &cloud);

    assert_eq!(
        vm_set
            .get_node_name_by_ip_configuration_id(&ip_config_id("ss-2_6a7b8c-nic"))
            .await
            .unwrap(),
        ("node-2".to_string(), "ss-2".to_string())
    );
    assert_eq!(
        vm_set
            .get_node_cidr_masks_by_provider_id(&provider_id("ss-2_6a7b8c"))
            .await
            .unwrap(),
        (25, 0)
    );
    assert_eq!(
        vm_set
            .get_node_cidr_masks_by_provider_id(&provider_id("not-a-member"))
            .await
            .unwrap(),
        (24, 64)
    );
}

#[tokio::test]
async fn test_agent_pool_names() {
    let cloud = two_scale_sets()
        .flex_vm("ss-1_9z9z9z", "master-0", "ss-1")
        .build();
    let vm_set = new_vm_set(flex_config(), &cloud);

    let nodes = vec![
        Node::new("node-0"),
        Node::new("node-2"),
        Node::new("node-1"),
        Node::new("master-0").with_label(LABEL_CONTROL_PLANE, ""),
        Node::new("unknown"),
    ];
    assert_eq!(
        vm_set.get_agent_pool_vm_set_names(&nodes).await.unwrap(),
        vec!["ss-1".to_string(), "ss-2".to_string()]
    );
}
