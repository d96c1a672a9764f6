//! Partial-failure tolerant fan-out

use crate::error::{ProvisionError, Result, TargetFailure};
use crate::poll::ensure_active;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run `op` for every target in order, collecting per-target failures
///
/// Cancellation is checked before each target and stops the loop with
/// `Cancelled`, as does a `Cancelled` error returned by `op`. Other failures
/// are collected and reported together once every target has been tried;
/// targets that succeeded are not rolled back.
pub async fn fan_out<'a, F, Fut>(cancel: &CancellationToken, targets: &'a [String], mut op: F) -> Result<()>
where
    F: FnMut(usize, &'a str) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failures = Vec::new();

    for (index, target) in targets.iter().enumerate() {
        ensure_active(cancel)?;

        match op(index, target.as_str()).await {
            Ok(()) => debug!(deploy_target = %target, "Target done"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(deploy_target = %target, error = %e, "Target failed");
                failures.push(TargetFailure {
                    target: target.clone(),
                    error: e,
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::PartialDeployFailure {
            failures,
            total: targets.len(),
        })
    }
}
