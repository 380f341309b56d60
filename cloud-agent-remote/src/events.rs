use http::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::util::json;

use super::context::Context;
use super::handlers::{self, HandlerError};
use super::transport::{Request, TransportError};

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Not a 200 status while retrieving event: {0}")]
    FetchStatus(u16),

    #[error("Unknown event id: {0}")]
    UnknownId(String),

    #[error("Empty payload")]
    EmptyPayload,

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Not a 204 status on event confirmation: {0}")]
    ConfirmStatus(u16),
}

/// The commands the cloud can send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    UpdateActivationLink,
    UpdateTunnelConfig,
    UpdateMetricsConfig,
    FetchDiagnostics,
    /// A command added to the cloud after this agent was released
    Unknown(String),
}

impl From<&str> for EventKind {
    fn from(code: &str) -> Self {
        match code {
            "update_activation_link" => Self::UpdateActivationLink,
            "update_tunnel_config" => Self::UpdateTunnelConfig,
            "update_metrics_config" => Self::UpdateMetricsConfig,
            "fetch_diagnostics" => Self::FetchDiagnostics,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

/// A pending command fetched from the cloud
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub payload: Value,
}

impl TryFrom<&Value> for Event {
    type Error = EventError;

    fn try_from(data: &Value) -> Result<Self, Self::Error> {
        let code = data.get("code").and_then(Value::as_str).unwrap_or_default();

        let id = match data.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) if id.as_u64() != Some(0) => id.to_string(),
            None | Some(Value::Null) => return Err(EventError::UnknownId("None".to_owned())),
            Some(Value::String(id)) => return Err(EventError::UnknownId(id.clone())),
            Some(other) => return Err(EventError::UnknownId(other.to_string())),
        };

        let payload = data.get("payload").cloned().unwrap_or(Value::Null);
        if json::is_empty(&payload) {
            return Err(EventError::EmptyPayload);
        }

        Ok(Self {
            id,
            kind: EventKind::from(code),
            payload,
        })
    }
}

/// Fetch, apply and confirm at most one pending event.
///
/// Events are validated before any side effect. Unknown events are still
/// confirmed so they cannot block the queue.
#[instrument(skip_all, err)]
pub async fn process_one_event(ctx: &Context) -> Result<(), EventError> {
    let response = ctx
        .transport
        .request(&ctx.settings, Request::get("events/"))
        .await?;
    debug!(
        "Checked for new events. Status {}. Data: {}",
        response.status.as_u16(),
        response.body
    );

    if response.status == StatusCode::NO_CONTENT {
        return Ok(());
    }
    if response.status != StatusCode::OK {
        return Err(EventError::FetchStatus(response.status.as_u16()));
    }

    let event = Event::try_from(&response.body)?;
    handlers::dispatch(ctx, &event).await?;
    debug!("Event {:?} handled successfully, event id {}", event.kind, event.id);

    confirm(ctx, &event.id).await
}

async fn confirm(ctx: &Context, id: &str) -> Result<(), EventError> {
    let response = ctx
        .transport
        .request(
            &ctx.settings,
            Request::post(format!("events/{id}/confirm/"), None),
        )
        .await?;
    if response.status != StatusCode::NO_CONTENT {
        return Err(EventError::ConfirmStatus(response.status.as_u16()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{fixture, reply};
    use crate::transport::Method;

    #[tokio::test]
    async fn it_does_nothing_without_pending_events() {
        let f = fixture();
        f.transport.push(reply(204, json!({})));

        process_one_event(&f.ctx).await.unwrap();

        assert_eq!(f.transport.endpoints(), vec!["events/"]);
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test]
    async fn it_rejects_unexpected_fetch_statuses() {
        let f = fixture();
        f.transport.push(reply(500, json!({})));

        let err = process_one_event(&f.ctx).await.unwrap_err();

        assert_eq!(err.to_string(), "Not a 200 status while retrieving event: 500");
    }

    #[tokio::test]
    async fn it_confirms_unknown_events() {
        let f = fixture();
        f.transport.push(reply(
            200,
            json!({"id": "42", "code": "reboot_in_future", "payload": {"when": "now"}}),
        ));
        f.transport.push(reply(204, json!({})));

        process_one_event(&f.ctx).await.unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].endpoint, "events/42/confirm/");
        assert_eq!(requests[1].method, Method::Post(None));
    }

    #[tokio::test]
    async fn it_rejects_events_without_id() {
        let f = fixture();
        f.transport.push(reply(
            200,
            json!({"code": "update_activation_link", "payload": {"activationLink": "L"}}),
        ));

        let err = process_one_event(&f.ctx).await.unwrap_err();

        assert_eq!(err.to_string(), "Unknown event id: None");
        assert_eq!(f.transport.endpoints(), vec!["events/"]);
        assert!(f.broker.published().is_empty());
        assert!(!f.ctx.settings.activation_link_config.exists());
    }

    #[tokio::test]
    async fn it_rejects_events_with_empty_payload() {
        for payload in [json!(null), json!({}), json!([]), json!(""), json!(0)] {
            let f = fixture();
            f.transport.push(reply(
                200,
                json!({"id": "1", "code": "update_tunnel_config", "payload": payload}),
            ));

            let err = process_one_event(&f.ctx).await.unwrap_err();

            assert!(matches!(err, EventError::EmptyPayload), "{payload}");
            assert_eq!(f.transport.endpoints(), vec!["events/"]);
            assert!(f.services.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn it_applies_and_confirms_events() {
        let f = fixture();
        f.transport.push(reply(
            200,
            json!({
                "id": "7",
                "code": "update_activation_link",
                "payload": {"activationLink": "https://wirenboard.cloud/activate/7"},
            }),
        ));
        f.transport.push(reply(204, json!({})));

        process_one_event(&f.ctx).await.unwrap();

        assert_eq!(
            f.broker.control_values("activation_link"),
            vec!["https://wirenboard.cloud/activate/7"]
        );
        assert_eq!(f.transport.endpoints(), vec!["events/", "events/7/confirm/"]);
    }

    #[tokio::test]
    async fn it_requires_a_204_confirmation() {
        let f = fixture();
        f.transport.push(reply(
            200,
            json!({"id": "9", "code": "unknown", "payload": {"a": 1}}),
        ));
        f.transport.push(reply(200, json!({})));

        let err = process_one_event(&f.ctx).await.unwrap_err();

        assert_eq!(err.to_string(), "Not a 204 status on event confirmation: 200");
    }

    #[test]
    fn it_maps_event_codes() {
        assert_eq!(
            EventKind::from("fetch_diagnostics"),
            EventKind::FetchDiagnostics
        );
        assert_eq!(
            EventKind::from("something_new"),
            EventKind::Unknown("something_new".to_owned())
        );
    }
}
