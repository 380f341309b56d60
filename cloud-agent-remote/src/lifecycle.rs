use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use crate::util::config::UNKNOWN_LINK;
use crate::util::providers::{ProviderError, Providers};

use super::context::Context;
use super::unbind::delete_controller;

/// How long teardown waits for the cloud to acknowledge the unbind
pub const UNBIND_WAIT: Duration = Duration::from_secs(8);

/// Remove the provider the context was built for.
///
/// A controller bound to the cloud is detached first, without letting a slow
/// cloud block the teardown. Its services are then stopped and disabled and
/// its config and data directories deleted.
#[instrument(skip_all, fields(provider = %ctx.settings.provider), err)]
pub async fn teardown(ctx: &Context) -> Result<(), ProviderError> {
    let settings = &ctx.settings;
    let providers = Providers::new(&ctx.paths);

    // no stored link means the activation state is unknown
    let link = providers.activation_link(&settings.provider).await?;
    if link.as_deref().unwrap_or(UNKNOWN_LINK) == UNKNOWN_LINK {
        let transport = ctx.transport.clone();
        let unbind_settings = settings.clone();
        let unbind = tokio::spawn(async move {
            delete_controller(transport.as_ref(), &unbind_settings).await
        });

        match tokio::time::timeout(UNBIND_WAIT, unbind).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("unbind failed: {e}"),
            Ok(Err(e)) => error!("unbind task failed: {e}"),
            Err(_) => warn!(
                "Controller unbind from {} did not finish in {}s",
                settings.cloud_base_url,
                UNBIND_WAIT.as_secs()
            ),
        }
    }

    for unit in [
        &settings.agent_service,
        &settings.tunnel_service,
        &settings.metrics_service,
    ] {
        if let Err(e) = ctx.services.stop_and_disable(unit).await {
            error!("failed to stop {unit}: {e}");
        }
    }

    providers.delete(&settings.provider).await?;
    debug!("removed provider {}", settings.provider);
    Ok(())
}
