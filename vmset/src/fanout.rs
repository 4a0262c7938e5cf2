//! Run one task per item and collect every error.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::error;

use crate::error::{AggregateError, Result, VmSetError};

/// Spawn every future as its own task and wait for all of them.
///
/// No task is cancelled when another fails. Errors (including panics) are
/// returned together as [`VmSetError::Aggregate`], nested aggregates
/// flattened.
pub async fn aggregate_tasks<I, F>(tasks: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<()>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for task in tasks {
        set.spawn(task);
    }

    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => {
                error!("fan-out task failed: {}", e);
                errors.push(VmSetError::TaskFailed(e.to_string()));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AggregateError::new(errors).into())
    }
}
