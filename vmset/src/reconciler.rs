//! Reconciler for backend pool membership.
//!
//! A reconciler compares the desired membership of a service's backend pool
//! with what the cloud reports and converges it through a [`VmSet`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{AggregateError, Result};
use crate::model::{BackendAddressPool, Node, Service};
use crate::vmset::VmSet;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Desired state.
    type Spec;
    /// State reported back after a pass.
    type Status;

    /// Compare desired and actual state and act on the difference.
    async fn reconcile(&self, id: &str, spec: &Self::Spec) -> Result<Self::Status>;

    /// Tear down whatever `reconcile` set up for `id`.
    async fn finalize(&self, id: &str) -> Result<()>;
}

/// Desired membership of one backend pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendPoolSpec {
    pub service: Service,
    pub backend_pool_id: String,
    pub nodes: Vec<Node>,
    /// Current pool membership as reported by the load balancer. Used when
    /// the pool is finalized.
    pub members: Vec<BackendAddressPool>,
    /// Also strip the pool from VM set level profiles on finalize.
    pub delete_from_vm_set: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolPhase {
    #[default]
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendPoolStatus {
    pub id: String,
    pub phase: PoolPhase,
    pub vm_set_names: Vec<String>,
    pub message: Option<String>,
}

struct Applied {
    spec: BackendPoolSpec,
    vm_set_names: Vec<String>,
}

/// Backend pool reconciler driving a [`VmSet`].
pub struct BackendPoolReconciler {
    vm_set: Arc<dyn VmSet>,
    applied: DashMap<String, Applied>,
}

impl BackendPoolReconciler {
    pub fn new(vm_set: Arc<dyn VmSet>) -> Self {
        Self {
            vm_set,
            applied: DashMap::new(),
        }
    }

    /// Refresh the membership snapshot used by a later finalize.
    pub fn update_members(&self, id: &str, members: Vec<BackendAddressPool>) {
        if let Some(mut applied) = self.applied.get_mut(id) {
            applied.spec.members = members;
        }
    }
}

#[async_trait]
impl Reconciler for BackendPoolReconciler {
    type Spec = BackendPoolSpec;
    type Status = BackendPoolStatus;

    async fn reconcile(&self, id: &str, spec: &Self::Spec) -> Result<Self::Status> {
        info!(
            "Reconciling backend pool {} for service {}",
            spec.backend_pool_id,
            spec.service.full_name()
        );

        self.vm_set.observe_nodes(&spec.nodes);
        let vm_set_names = self
            .vm_set
            .get_vm_set_names(&spec.service, &spec.nodes)
            .await?;

        let mut errors = Vec::new();
        for vm_set_name in &vm_set_names {
            if let Err(e) = self
                .vm_set
                .ensure_hosts_in_pool(&spec.service, &spec.nodes, &spec.backend_pool_id, vm_set_name)
                .await
            {
                error!(
                    "Failed to ensure backend pool {} in vm set {}: {}",
                    spec.backend_pool_id, vm_set_name, e
                );
                errors.push(e);
            }
        }

        self.applied.insert(
            id.to_string(),
            Applied {
                spec: spec.clone(),
                vm_set_names: vm_set_names.clone(),
            },
        );

        if errors.is_empty() {
            Ok(BackendPoolStatus {
                id: id.to_string(),
                phase: PoolPhase::Ready,
                vm_set_names,
                message: None,
            })
        } else {
            Ok(BackendPoolStatus {
                id: id.to_string(),
                phase: PoolPhase::Failed,
                vm_set_names,
                message: Some(AggregateError::new(errors).to_string()),
            })
        }
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        let Some((_, applied)) = self.applied.remove(id) else {
            info!("Backend pool {} was never reconciled, nothing to finalize", id);
            return Ok(());
        };
        info!(
            "Finalizing backend pool {} for service {}",
            applied.spec.backend_pool_id,
            applied.spec.service.full_name()
        );

        let spec = &applied.spec;
        let mut errors = Vec::new();
        for vm_set_name in &applied.vm_set_names {
            if let Err(e) = self
                .vm_set
                .ensure_backend_pool_deleted(
                    &spec.service,
                    &spec.backend_pool_id,
                    vm_set_name,
                    &spec.members,
                    spec.delete_from_vm_set,
                )
                .await
            {
                errors.push(e);
            }
        }
        if spec.delete_from_vm_set
            && let Err(e) = self
                .vm_set
                .ensure_backend_pool_deleted_from_vm_sets(&applied.vm_set_names, &spec.backend_pool_id)
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
