use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, instrument};

use crate::util::connectivity::ConnectionState;

use super::activation::read_activation_link;
use super::context::Context;
use super::events::{EventError, process_one_event};
use super::startup::{StartupError, send_hardware_revision, send_packages_version, start_up};
use super::transport::TransportError;

/// How a single poll went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Connected,
    Timeout,
    Network,
    Failed,
}

impl Outcome {
    fn status(&self) -> &'static str {
        match self {
            Self::Connected => "Cloud Agent is successfully connected to the cloud!",
            Self::Timeout => "Request timeout. Retrying...",
            Self::Network => "Network or Cloud is unreachable! Retrying...",
            Self::Failed => "Error making request to cloud! Retrying...",
        }
    }
}

/// Handshake with the cloud and report the installed versions
pub async fn start(ctx: &Context) -> Result<(), StartupError> {
    start_up(ctx).await?;
    send_packages_version(ctx).await;
    Ok(())
}

/// Show the agent on the bus before polling starts
pub async fn announce(ctx: &Context) {
    let settings = &ctx.settings;

    ctx.bus.update_providers_list(&ctx.paths).await;
    ctx.bus.publish_vdev();
    match read_activation_link(settings).await {
        Ok(link) => ctx.bus.publish_ctrl("activation_link", &link),
        Err(e) => error!("failed to read the activation link: {e}"),
    }
    ctx.bus.publish_ctrl("cloud_base_url", &settings.cloud_base_url);
    ctx.bus.publish_ctrl("status", "connecting");

    info!("Cloud Agent initialization - OK");
}

/// Poll the cloud for events until `shutdown` resolves.
///
/// A failed poll is reported and retried, the loop never ends on its own.
/// The virtual device is removed from the bus once `shutdown` resolves.
pub async fn run<F>(ctx: &Context, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = poll(ctx) => {},
        _ = shutdown => info!("shutting down"),
    }

    ctx.bus.remove_vdev();
}

#[instrument(name = "poll", skip_all)]
async fn poll(ctx: &Context) {
    let mut cloud = ConnectionState::new();

    loop {
        let started = Instant::now();
        debug!("Sending event request");

        let outcome = match process_one_event(ctx).await {
            Ok(()) => Outcome::Connected,
            Err(EventError::Transport(e @ TransportError::Timeout(_))) => {
                debug!("{e}");
                Outcome::Timeout
            }
            Err(EventError::Transport(e @ TransportError::Network { .. })) => {
                debug!("{e}");
                Outcome::Network
            }
            Err(e) => {
                error!("Cloud connection exception: {e}");
                Outcome::Failed
            }
        };

        let connected = outcome == Outcome::Connected;
        if cloud.update(connected) {
            if connected {
                info!("Cloud Agent successfully connected to the cloud!");
            } else {
                info!("Cloud Agent disconnected from the cloud");
            }
            ctx.bus.publish_ctrl("status", outcome.status());
        }

        debug!(
            "Event request completed in {} ms",
            started.elapsed().as_millis()
        );

        // a timed out request already waited long enough
        if outcome != Outcome::Timeout {
            tokio::time::sleep(ctx.settings.request_period.get()).await;
        }
    }
}

/// Report every hardware revision received from the bus
pub fn spawn_hardware_revision_reporter(
    ctx: &Context,
    mut revisions: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(
        async move {
            while let Some(revision) = revisions.recv().await {
                debug!("reporting hardware revision {revision}");
                if let Err(e) = send_hardware_revision(&ctx, &revision).await {
                    error!("failed to report hardware revision: {e}");
                }
            }
        }
        .instrument(info_span!("hardware_revision")),
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::bus::PROVIDERS_TOPIC;
    use crate::testing::{fixture, reply};
    use crate::transport::Method;
    use crate::util::providers::Providers;

    fn network_error() -> Result<crate::transport::Response, TransportError> {
        Err(TransportError::Network {
            endpoint: "events/".to_owned(),
            base_url: "https://wirenboard.cloud".to_owned(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn it_reports_connectivity_only_on_transitions() {
        let f = fixture();
        for _ in 0..3 {
            f.transport.push(network_error());
        }
        f.transport.push(reply(204, json!({})));
        f.transport.push(reply(204, json!({})));

        run(&f.ctx, tokio::time::sleep(Duration::from_secs(45))).await;

        assert_eq!(f.transport.requests().len(), 5);
        assert_eq!(
            f.broker.control_values("status"),
            vec![
                "Network or Cloud is unreachable! Retrying...",
                "Cloud Agent is successfully connected to the cloud!",
                // cleared on exit
                "",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_reports_unexpected_failures() {
        let f = fixture();
        f.transport.push(reply(500, json!({})));

        run(&f.ctx, tokio::time::sleep(Duration::from_secs(5))).await;

        assert_eq!(
            f.broker.control_values("status"),
            vec!["Error making request to cloud! Retrying...", ""]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_polls_at_the_current_interval() {
        let f = fixture();
        f.ctx.settings.request_period.set(Duration::from_secs(60));

        run(&f.ctx, tokio::time::sleep(Duration::from_secs(100))).await;

        assert_eq!(f.transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn it_retries_right_away_after_a_timeout() {
        let f = fixture();
        f.ctx.settings.request_period.set(Duration::from_secs(60));
        f.transport
            .push(Err(TransportError::Timeout(Duration::from_secs(360))));

        run(&f.ctx, tokio::time::sleep(Duration::from_secs(30))).await;

        assert_eq!(f.transport.requests().len(), 2);
        assert_eq!(
            f.broker.control_values("status"),
            vec![
                "Request timeout. Retrying...",
                "Cloud Agent is successfully connected to the cloud!",
                "",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_keeps_polling_after_a_certificate_mismatch() {
        let f = fixture();
        f.transport.push(Err(TransportError::ClientCert {
            cert: PathBuf::from("/var/lib/wb-cloud-agent/device_bundle.crt.pem"),
            key: "ATECCx08:00:02:C0:00".to_owned(),
        }));

        run(&f.ctx, tokio::time::sleep(Duration::from_secs(15))).await;

        assert_eq!(f.transport.requests().len(), 2);
        assert_eq!(
            f.broker.control_values("status"),
            vec![
                "Error making request to cloud! Retrying...",
                "Cloud Agent is successfully connected to the cloud!",
                "",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_reports_consecutive_failures_once() {
        let f = fixture();
        f.transport.push(network_error());
        f.transport.push(network_error());
        f.transport.push(reply(500, json!({})));
        f.transport.push(reply(500, json!({})));

        run(&f.ctx, tokio::time::sleep(Duration::from_secs(45))).await;

        assert_eq!(f.transport.requests().len(), 5);
        assert_eq!(
            f.broker.control_values("status"),
            vec![
                "Network or Cloud is unreachable! Retrying...",
                "Cloud Agent is successfully connected to the cloud!",
                "",
            ]
        );
    }

    #[tokio::test]
    async fn it_starts_up_and_reports_versions() {
        let f = fixture();
        f.transport.push(reply(
            200,
            json!({"activated": true, "activationLink": ""}),
        ));
        f.transport.push(reply(200, json!({})));

        start(&f.ctx).await.unwrap();

        assert_eq!(
            f.transport.endpoints(),
            vec!["agent-start-up/", "update_device_data/"]
        );
        assert_eq!(f.broker.control_values("activation_link"), vec!["unknown"]);
    }

    #[tokio::test]
    async fn it_announces_the_agent() {
        let f = fixture();
        Providers::new(&f.ctx.paths)
            .generate_config("test", "https://wirenboard.cloud")
            .await
            .unwrap();

        announce(&f.ctx).await;

        let published = f.broker.published();
        assert_eq!(
            published[0],
            (PROVIDERS_TOPIC.to_owned(), "test".to_owned())
        );
        assert!(published.contains(&(
            "/devices/system__wb-cloud-agent__test/meta/driver".to_owned(),
            "wb-cloud-agent".to_owned()
        )));
        assert_eq!(f.broker.control_values("activation_link"), vec!["unknown"]);
        assert_eq!(
            f.broker.control_values("cloud_base_url"),
            vec!["https://wirenboard.cloud"]
        );
        assert_eq!(f.broker.control_values("status"), vec!["connecting"]);
    }

    #[tokio::test]
    async fn it_forwards_hardware_revisions() {
        let f = fixture();
        f.transport.push(reply(200, json!({})));
        let (tx, rx) = mpsc::unbounded_channel();

        let reporter = spawn_hardware_revision_reporter(&f.ctx, rx);
        tx.send("WB8-v1.2".to_owned()).unwrap();
        drop(tx);
        reporter.await.unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].method,
            Method::Put(Some(json!({"hardware_revision": "WB8-v1.2"})))
        );
    }
}
