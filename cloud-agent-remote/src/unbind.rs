use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::util::config::Settings;

use super::transport::{Request, RetryPolicy, Transport, TransportError};

/// Upper bound for the unbind request, connection included
pub const UNBIND_TIMEOUT: Duration = Duration::from_secs(7);

#[derive(Debug, Error)]
pub enum UnbindError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Not a 204 status while making delete-controller request: {0}")]
    Status(u16),
}

/// Ask the cloud to forget this controller.
///
/// A single bounded attempt is made, so an unreachable cloud cannot hold up
/// the caller for long.
pub async fn delete_controller(
    transport: &dyn Transport,
    settings: &Settings,
) -> Result<(), UnbindError> {
    let request =
        Request::delete("delete-controller/").with_retry(RetryPolicy::Bounded(UNBIND_TIMEOUT));

    let response = match transport.request(settings, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                "The controller on the remote server could not be detached due to network problems. \
                 Unbind it manually using the command: 'wb-cloud-agent cloud-unbind {}'",
                settings.cloud_base_url
            );
            debug!("Error while sending delete-controller event: {e}");
            return Err(e.into());
        }
    };

    if response.status != StatusCode::NO_CONTENT {
        error!(
            "Not a 204 status while making delete-controller request: {}",
            response.status.as_u16()
        );
        return Err(UnbindError::Status(response.status.as_u16()));
    }

    info!(
        "Controller has been successfully detached from: {}",
        settings.cloud_base_url
    );
    Ok(())
}
