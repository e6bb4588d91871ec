use std::future::Future;

use super::UpgradeTimings;
use crate::ports::CommandError;

/// Run `op`, retrying transient channel failures up to `command_retries` times.
pub(crate) async fn with_channel_retry<T, F, Fut>(
    timings: &UpgradeTimings,
    what: &str,
    mut op: F,
) -> Result<T, CommandError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CommandError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < timings.command_retries => {
                attempt += 1;
                tracing::debug!(what, attempt, error = %err, "retrying device command");
                tokio::time::sleep(timings.command_retry_delay).await;
            }
            other => return other,
        }
    }
}
