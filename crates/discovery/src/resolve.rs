//! One-shot resolvers

use std::time::Duration;

use contracts::{Predicate, Result, StreamDescriptor};
use tracing::{info, warn};
use transport::{query_streams, StreamContext};

/// Every stream visible on the network, after waiting the full `wait_time`
pub async fn resolve_all(ctx: &StreamContext, wait_time: Duration) -> Result<Vec<StreamDescriptor>> {
    Ok(run_query(ctx, Predicate::any(), 0, wait_time).await)
}

/// Streams whose `property` equals `value`.
///
/// Returns once `minimum` streams answered or `timeout` elapsed.
///
/// # Errors
/// `Argument` if `property` is not queryable.
pub async fn resolve_byprop(
    ctx: &StreamContext,
    property: &str,
    value: &str,
    minimum: usize,
    timeout: Duration,
) -> Result<Vec<StreamDescriptor>> {
    let predicate = Predicate::equals(property, value)?;
    Ok(run_query(ctx, predicate, minimum, timeout).await)
}

/// Streams matching a predicate such as `type='EEG' and nominal_srate>100`.
///
/// # Errors
/// `Argument` for a malformed predicate. Network trouble and timeouts only
/// shorten the result.
pub async fn resolve_bypred(
    ctx: &StreamContext,
    predicate: &str,
    minimum: usize,
    timeout: Duration,
) -> Result<Vec<StreamDescriptor>> {
    let predicate = Predicate::parse(predicate)?;
    Ok(run_query(ctx, predicate, minimum, timeout).await)
}

async fn run_query(
    ctx: &StreamContext,
    predicate: Predicate,
    minimum: usize,
    timeout: Duration,
) -> Vec<StreamDescriptor> {
    let shown = predicate.to_string();
    match query_streams(ctx, predicate, minimum, timeout).await {
        Ok(found) => {
            info!(predicate = %shown, found = found.len(), "Resolve finished");
            found
        }
        Err(e) => {
            warn!(predicate = %shown, error = %e, "Resolve failed");
            Vec::new()
        }
    }
}
