//! Error types for node resolution and backend pool reconciliation.

use std::fmt;

use thiserror::Error;

use crate::cloud::CloudError;

/// Errors that can occur while resolving nodes or mutating backend pools.
#[derive(Debug, Error)]
pub enum VmSetError {
    /// The node has no backing virtual machine. Callers treat this as
    /// "node gone" rather than a transient failure.
    #[error("instance not found")]
    InstanceNotFound,

    /// The node is not a member of the requested VM set.
    #[error("vm is not in the vmset")]
    NotInVmSet,

    /// A resource path did not match the expected shape.
    #[error("invalid {kind} ID {id:?}")]
    InvalidIdentifier { kind: &'static str, id: String },

    /// A resource returned by the cloud is missing a field we depend on.
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    /// Neither zones nor a fault domain could be derived for the node.
    #[error("failed to get zone info for node {0}")]
    ZoneUnavailable(String),

    /// The first zone of a VM is not an integer.
    #[error("failed to parse zone {zone:?}: {source}")]
    InvalidZone {
        zone: String,
        #[source]
        source: std::num::ParseIntError,
    },

    /// A VM set named in a service annotation does not exist.
    #[error("{0} - not found")]
    VmSetNotFound(String),

    /// None of the given nodes belongs to an agent pool VM set.
    #[error("no vm sets found for nodes, node count({0})")]
    NoAgentPoolVmSets(usize),

    /// Flexible scale sets only work behind standard SKU load balancers.
    #[error("VMSS Flex does not support Basic Load Balancer")]
    BasicLoadBalancerUnsupported,

    /// An upstream cloud API call failed.
    #[error("{operation}({resource_group}/{name}): {source}")]
    Cloud {
        operation: &'static str,
        resource_group: String,
        name: String,
        #[source]
        source: CloudError,
    },

    /// A fan-out task panicked or was cancelled.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// An operation on one node failed.
    #[error("node {node}: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<VmSetError>,
    },

    /// Several per-node operations failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// The configuration cannot be used.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl VmSetError {
    /// Build a [`VmSetError::Cloud`] with resource context attached.
    pub fn cloud(
        operation: &'static str,
        resource_group: impl Into<String>,
        name: impl Into<String>,
        source: CloudError,
    ) -> Self {
        Self::Cloud {
            operation,
            resource_group: resource_group.into(),
            name: name.into(),
            source,
        }
    }

    pub fn invalid_id(kind: &'static str, id: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            kind,
            id: id.into(),
        }
    }

    /// Attach the name of the node the error came from.
    pub fn for_node(self, node: impl Into<String>) -> Self {
        Self::Node {
            node: node.into(),
            source: Box::new(self),
        }
    }

    /// True when the error means the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::InstanceNotFound => true,
            Self::Cloud { source, .. } => source.is_not_found(),
            Self::Node { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// A flattened collection of errors from concurrent per-node operations.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<VmSetError>,
}

impl AggregateError {
    /// Build an aggregate, flattening nested aggregates.
    pub fn new(errors: Vec<VmSetError>) -> Self {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                VmSetError::Aggregate(inner) => flat.extend(inner.errors),
                other => flat.push(other),
            }
        }
        Self { errors: flat }
    }

    pub fn errors(&self) -> &[VmSetError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_errors(self) -> Vec<VmSetError> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "{}", self.errors[0]);
        }
        write!(f, "[")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", err)?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for AggregateError {}

/// Result type for vmset operations.
pub type Result<T> = std::result::Result<T, VmSetError>;
