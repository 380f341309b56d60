use std::io;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::util::config::UNKNOWN_LINK;
use crate::util::fs::write_to_file;
use crate::util::systemd;

use super::activation::write_activation_link;
use super::context::Context;
use super::diagnostics::fetch_diagnostics;
use super::events::{Event, EventKind};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: missing '{0}'")]
    MissingField(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Service(#[from] systemd::Error),
}

fn string_field<'a>(payload: &'a Value, field: &'static str) -> Result<&'a str, HandlerError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or(HandlerError::MissingField(field))
}

/// Substitute `$BROKER_URL` and `${BROKER_URL}` in a config template.
///
/// `$$` is an escaped dollar, any other placeholder is left untouched.
fn substitute_broker_url(template: &str, broker_url: &str) -> String {
    const NAME: &str = "BROKER_URL";

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(tail) = after.strip_prefix("{BROKER_URL}") {
            out.push_str(broker_url);
            rest = tail;
        } else {
            let ident_len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if &after[..ident_len] == NAME {
                out.push_str(broker_url);
            } else {
                out.push('$');
                out.push_str(&after[..ident_len]);
            }
            rest = &after[ident_len..];
        }
    }
    out.push_str(rest);
    out
}

/// Apply the side effects of a remote event.
///
/// Unknown events are left alone so they can still be confirmed.
pub async fn dispatch(ctx: &Context, event: &Event) -> Result<(), HandlerError> {
    match &event.kind {
        EventKind::UpdateActivationLink => update_activation_link(ctx, &event.payload).await,
        EventKind::UpdateTunnelConfig => update_tunnel_config(ctx, &event.payload).await,
        EventKind::UpdateMetricsConfig => update_metrics_config(ctx, &event.payload).await,
        EventKind::FetchDiagnostics => {
            // runs in the background, the event is confirmed right away
            let _ = fetch_diagnostics(ctx).await;
            Ok(())
        }
        EventKind::Unknown(code) => {
            warn!("Got an unknown event '{code}'. Try to update wb-cloud-agent package.");
            Ok(())
        }
    }
}

async fn update_activation_link(ctx: &Context, payload: &Value) -> Result<(), HandlerError> {
    let link = string_field(payload, "activationLink")?;
    write_activation_link(&ctx.settings, &ctx.bus, link).await?;
    Ok(())
}

async fn update_tunnel_config(ctx: &Context, payload: &Value) -> Result<(), HandlerError> {
    let config = string_field(payload, "config")?;
    let settings = &ctx.settings;

    debug!("writing tunnel config to {}", settings.tunnel_config.display());
    write_to_file(&settings.tunnel_config, config).await?;
    ctx.services
        .start_and_enable(&settings.tunnel_service, true)
        .await?;
    info!("tunnel config updated, {} restarted", settings.tunnel_service);

    write_activation_link(settings, &ctx.bus, UNKNOWN_LINK).await?;
    Ok(())
}

async fn update_metrics_config(ctx: &Context, payload: &Value) -> Result<(), HandlerError> {
    let template = string_field(payload, "config")?;
    let settings = &ctx.settings;
    let config = substitute_broker_url(template, &settings.broker_url);

    debug!("writing metrics config to {}", settings.metrics_config.display());
    write_to_file(&settings.metrics_config, &config).await?;
    ctx.services
        .start_and_enable(&settings.metrics_service, true)
        .await?;
    info!("metrics config updated, {} restarted", settings.metrics_service);

    write_activation_link(settings, &ctx.bus, UNKNOWN_LINK).await?;
    Ok(())
}
