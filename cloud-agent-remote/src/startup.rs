use std::io;

use http::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::util::config::UNKNOWN_LINK;
use crate::util::host;

use super::activation::write_activation_link;
use super::context::Context;
use super::transport::{Request, TransportError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Not a 200 status while making start up request: {0}")]
    Status(u16),

    #[error("Invalid response data while making start up request: {0}")]
    InvalidData(Value),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StartupError {
    /// The handshake failed because the client certificate does not match the key
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_fatal())
    }
}

/// Tell the cloud the agent is up and store the activation link it returns.
///
/// An activated device, or one without a pending link, gets the `unknown`
/// link.
#[instrument(skip_all, err)]
pub async fn start_up(ctx: &Context) -> Result<Value, StartupError> {
    let response = ctx
        .transport
        .request(&ctx.settings, Request::get("agent-start-up/"))
        .await?;

    if response.status != StatusCode::OK {
        debug!(
            "http_status={} status_data={}",
            response.status.as_u16(),
            response.body
        );
        return Err(StartupError::Status(response.status.as_u16()));
    }

    let data = response.body;
    let (Some(activated), Some(link)) = (data.get("activated"), data.get("activationLink")) else {
        return Err(StartupError::InvalidData(data));
    };

    let activated = activated.as_bool().unwrap_or(false);
    let link = link.as_str().unwrap_or_default();
    let link = if activated || link.is_empty() {
        UNKNOWN_LINK
    } else {
        link
    };
    write_activation_link(&ctx.settings, &ctx.bus, link).await?;

    Ok(data)
}

/// Report the agent and metrics collector versions, failures are only logged
pub async fn send_packages_version(ctx: &Context) {
    let agent_version = env!("CARGO_PKG_VERSION");
    let telegraf_version = host::telegraf_version().await;
    info!("Sending package versions: agent={agent_version}, telegraf={telegraf_version}");

    let request = Request::put(
        "update_device_data/",
        json!({
            "agent_version": agent_version,
            "telegraf_version": telegraf_version,
            "crypto_engine_key": ctx.settings.client_cert_engine_key,
        }),
    );
    match ctx.transport.request(&ctx.settings, request).await {
        Ok(res) if res.status == StatusCode::OK => {}
        Ok(res) => error!(
            "Not a 200 status while making send_packages_version request: {}",
            res.status.as_u16()
        ),
        Err(e) => error!("failed to send package versions: {e}"),
    }
}

/// Report the board hardware revision read from the bus
pub async fn send_hardware_revision(ctx: &Context, revision: &str) -> Result<(), StartupError> {
    let request = Request::put(
        "update_device_data/",
        json!({ "hardware_revision": revision }),
    );
    let response = ctx.transport.request(&ctx.settings, request).await?;
    if response.status != StatusCode::OK {
        return Err(StartupError::Status(response.status.as_u16()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::testing::{fixture, reply};
    use crate::transport::Method;

    #[tokio::test]
    async fn it_stores_the_pending_activation_link() {
        let f = fixture();
        f.transport.push(reply(
            200,
            json!({"activated": false, "activationLink": "https://wirenboard.cloud/activate/X"}),
        ));

        start_up(&f.ctx).await.unwrap();

        assert_eq!(
            f.broker.control_values("activation_link"),
            vec!["https://wirenboard.cloud/activate/X"]
        );
    }

    #[tokio::test]
    async fn it_stores_unknown_for_activated_devices() {
        for body in [
            json!({"activated": true, "activationLink": "https://wirenboard.cloud/activate/X"}),
            json!({"activated": false, "activationLink": ""}),
        ] {
            let f = fixture();
            f.transport.push(reply(200, body));

            start_up(&f.ctx).await.unwrap();

            let stored = tokio::fs::read_to_string(&f.ctx.settings.activation_link_config)
                .await
                .unwrap();
            assert_eq!(stored, "unknown");
        }
    }

    #[tokio::test]
    async fn it_rejects_incomplete_start_up_data() {
        let f = fixture();
        f.transport.push(reply(200, json!({"activated": true})));

        let err = start_up(&f.ctx).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Invalid response data while making start up request: {\"activated\":true}"
        );
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test]
    async fn it_rejects_unexpected_start_up_statuses() {
        let f = fixture();
        f.transport.push(reply(503, json!({})));

        let err = start_up(&f.ctx).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Not a 200 status while making start up request: 503"
        );
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn it_flags_certificate_mismatch_as_fatal() {
        let f = fixture();
        f.transport.push(Err(TransportError::ClientCert {
            cert: PathBuf::from("/tmp/cert.pem"),
            key: "KEY".to_owned(),
        }));

        let err = start_up(&f.ctx).await.unwrap_err();

        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn it_sends_package_versions() {
        let f = fixture();
        f.transport.push(reply(500, json!({})));

        send_packages_version(&f.ctx).await;

        let requests = f.transport.requests();
        assert_eq!(requests[0].endpoint, "update_device_data/");
        let Method::Put(Some(body)) = &requests[0].method else {
            panic!("unexpected method {:?}", requests[0].method);
        };
        assert_eq!(body["agent_version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["crypto_engine_key"], "ATECCx08:00:02:C0:00");
        assert!(body["telegraf_version"].is_string());
    }

    #[tokio::test]
    async fn it_sends_the_hardware_revision() {
        let f = fixture();
        f.transport.push(reply(200, json!({})));

        send_hardware_revision(&f.ctx, "WB7-v3.5").await.unwrap();

        assert_eq!(
            f.transport.requests()[0].method,
            Method::Put(Some(json!({"hardware_revision": "WB7-v3.5"})))
        );
    }
}
