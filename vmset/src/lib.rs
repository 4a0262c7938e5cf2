pub mod backend_pool;
pub mod cache;
pub mod cloud;
pub mod config;
pub mod error;
pub mod fanout;
pub mod ids;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod vmset;

pub use backend_pool::{EnsureOutcome, SkipReason};
pub use cache::{CacheReadType, TimedCache};
pub use cloud::{CloudClient, CloudError, InMemoryCloud, Inventory};
pub use config::{Config, LoadBalancerSku, VmType};
pub use error::{AggregateError, Result, VmSetError};
pub use reconciler::{BackendPoolReconciler, BackendPoolSpec, BackendPoolStatus, Reconciler};
pub use vmset::{AvailabilitySet, CloudContext, FlexScaleSet, VmSet, new_vm_set};
