use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Attempts made before the cloud is declared unreachable
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ReachabilityError {
    #[error("Cloud '{url}' is unreachable after {attempts} attempts")]
    Unreachable { url: String, attempts: u32 },

    #[error("Unexpected error during cloud reachability check: {0}")]
    Client(#[from] reqwest::Error),
}

/// Probe `url` with HEAD requests until it answers with a 2xx or 3xx status.
///
/// Network errors and other statuses are retried every `interval`, up to
/// `max_attempts` times.
#[instrument(skip(interval, max_attempts), err)]
pub async fn wait_for_cloud_reachable(
    url: &str,
    interval: Duration,
    max_attempts: u32,
) -> Result<(), ReachabilityError> {
    info!(
        "Start checking cloud reachability (interval: {}s, max_attempts: {max_attempts})",
        interval.as_secs()
    );
    let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;

    for attempt in 1..=max_attempts {
        match client.head(url).send().await {
            Ok(res) if res.status().is_success() || res.status().is_redirection() => {
                info!("Cloud reachability - OK");
                return Ok(());
            }
            Ok(res) => debug!(
                "Attempt {attempt}/{max_attempts}: cloud '{url}' unreachable (status {})",
                res.status().as_u16()
            ),
            Err(e) => debug!(
                "Attempt {attempt}/{max_attempts}: cloud '{url}' unreachable due to network issue: {e}"
            ),
        }

        if attempt < max_attempts {
            debug!("Retrying in {}s...", interval.as_secs());
            tokio::time::sleep(interval).await;
        }
    }

    Err(ReachabilityError::Unreachable {
        url: url.to_owned(),
        attempts: max_attempts,
    })
}
