use std::future::Future;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};
use url::Url;

use crate::bus::{BusError, Presence};
use crate::remote::{
    self, Context, Curl, ReachabilityError, StartupError, Transport, UnbindError,
};
use crate::util::config::{ConfigError, NOCONNECT_LINK, Paths, Settings};
use crate::util::host;
use crate::util::providers::{ProviderError, Providers};
use crate::util::systemd::{self, ServiceManager, Systemd};

/// systemd `NOTCONFIGURED`, tells the service manager not to restart us
const EXIT_NOT_CONFIGURED: u8 = 6;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Provider {0} already exists")]
    Exists(String),

    #[error("Provider {0} does not exists")]
    Missing(String),

    #[error("No one provider was found")]
    NoProviders,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Service(#[from] systemd::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Failed to read the controller serial number: {0}")]
    Serial(#[source] io::Error),

    #[error(transparent)]
    Unreachable(#[from] ReachabilityError),

    #[error("Startup request failed: {0}")]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Unbind(#[from] UnbindError),
}

impl CommandError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_NOT_CONFIGURED,
            Self::Startup(e) if e.is_fatal() => EXIT_NOT_CONFIGURED,
            _ => 1,
        }
    }

    /// Errors meant for the person running the command rather than the log
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Exists(_) | Self::Missing(_) | Self::NoProviders)
    }
}

/// Connect the daemon to the bus, or keep going without it if the broker is unusable
fn start_daemon_bus(settings: &Settings) -> (Arc<Presence>, mpsc::UnboundedReceiver<String>) {
    match Presence::start(settings, true) {
        Ok(started) => started,
        Err(e) => {
            error!("Error starting MQTT client, running without it: {e}");
            let (_, revisions) = mpsc::unbounded_channel();
            (Presence::detached(&settings.mqtt_prefix), revisions)
        }
    }
}

/// Provider name for a base URL: its host and explicit port
fn provider_name(base_url: &str) -> Option<String> {
    let url = Url::parse(base_url).ok()?;
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

/// Render rows as a markdown table
fn render_table(headers: [&str; 2], rows: &[(String, String)]) -> String {
    let mut widths = headers.map(str::len);
    for (name, url) in rows {
        widths[0] = widths[0].max(name.len());
        widths[1] = widths[1].max(url.len());
    }

    let [w0, w1] = widths;
    let line = |a: &str, b: &str| format!("| {a:<w0$} | {b:<w1$} |\n");
    let mut table = line(headers[0], headers[1]);
    table.push_str(&format!(
        "|{}|{}|\n",
        "-".repeat(w0 + 2),
        "-".repeat(w1 + 2)
    ));
    for (name, url) in rows {
        table.push_str(&line(name, url));
    }
    table
}

/// What the provider management commands act on
pub struct Agent {
    paths: Paths,
    services: Arc<dyn ServiceManager>,
    transport: Arc<dyn Transport>,
}

impl Agent {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            services: Arc::new(Systemd::new()),
            transport: Arc::new(Curl::new()),
        }
    }

    fn providers(&self) -> Providers {
        Providers::new(&self.paths)
    }

    /// Connect to the local bus for publishing, the agent works without it
    fn connect_bus(settings: &Settings) -> Option<Arc<Presence>> {
        match Presence::start(settings, false) {
            Ok((presence, _)) => Some(presence),
            Err(e) => {
                error!("Error starting MQTT client: {e}");
                None
            }
        }
    }

    async fn provider_rows(&self) -> Result<Vec<(String, String)>, CommandError> {
        let mut serial = None;
        let mut rows = Vec::new();
        for provider in self.providers().load().await? {
            let link = &provider.activation_link;
            let bound = !link.starts_with("http") && link != NOCONNECT_LINK;
            if bound && serial.is_none() {
                serial = Some(host::serial_number().await.map_err(CommandError::Serial)?);
            }

            let url = provider.display_url(serial.as_deref().unwrap_or_default());
            rows.push((provider.name, url));
        }
        Ok(rows)
    }

    pub async fn show_providers(&self) -> Result<(), CommandError> {
        let rows = self.provider_rows().await?;
        if rows.is_empty() {
            println!("No one provider was found");
            return Ok(());
        }
        print!(
            "{}",
            render_table(["Provider", "Controller Url / Activation Url"], &rows)
        );
        Ok(())
    }

    pub async fn add_provider(
        &self,
        base_url: &str,
        name: Option<String>,
    ) -> Result<(), CommandError> {
        let name = name
            .or_else(|| provider_name(base_url))
            .unwrap_or_else(|| base_url.to_owned());
        let providers = self.providers();
        if providers.contains(&name).await? {
            return Err(CommandError::Exists(name));
        }

        let settings = Settings::new(&self.paths, &name)?;
        let bus = Self::connect_bus(&settings);

        providers.generate_config(&name, base_url).await?;
        self.services
            .start_and_enable(&settings.agent_service, false)
            .await?;

        if let Some(bus) = bus {
            bus.update_providers_list(&self.paths).await;
            bus.shutdown().await;
        }
        println!("Provider {name} successfully added");
        Ok(())
    }

    /// Replace every configured provider with the given one
    pub async fn use_on_premise(
        &self,
        base_url: &str,
        name: Option<String>,
    ) -> Result<(), CommandError> {
        for provider in self.providers().names().await? {
            self.remove_provider(&provider).await?;
        }
        self.add_provider(base_url, name).await
    }

    pub async fn del_provider(&self, provider: &str) -> Result<(), CommandError> {
        let name = provider_name(provider).unwrap_or_else(|| provider.to_owned());
        if !self.providers().contains(&name).await? {
            return Err(CommandError::Missing(name));
        }
        self.remove_provider(&name).await
    }

    pub async fn del_all_providers(&self) -> Result<(), CommandError> {
        let names = self.providers().names().await?;
        if names.is_empty() {
            return Err(CommandError::NoProviders);
        }
        for name in names {
            self.remove_provider(&name).await?;
        }
        Ok(())
    }

    async fn remove_provider(&self, name: &str) -> Result<(), CommandError> {
        let settings = Settings::load(&self.paths, name).await?;
        let (bus, _) = Presence::start(&settings, false)?;
        let ctx = Context {
            settings,
            paths: self.paths.clone(),
            transport: self.transport.clone(),
            bus,
            services: self.services.clone(),
        };

        let result = remote::teardown(&ctx).await;
        ctx.bus.update_providers_list(&self.paths).await;
        ctx.bus.shutdown().await;
        result?;

        println!("Provider {name} successfully deleted");
        Ok(())
    }

    /// Detach the controller from the cloud at `base_url`
    pub async fn cloud_unbind(&self, base_url: &str) -> Result<(), CommandError> {
        let settings = Settings::for_base_url(&self.paths, base_url)?;
        remote::delete_controller(self.transport.as_ref(), &settings).await?;
        Ok(())
    }

    /// Keep the provider connected until `shutdown` resolves
    pub async fn run_daemon<F>(&self, settings: Settings, shutdown: F) -> Result<(), CommandError>
    where
        F: Future<Output = ()>,
    {
        info!(
            "====== Cloud Agent started (provider: {}) ======",
            settings.cloud_base_url
        );
        remote::wait_for_cloud_reachable(
            &settings.cloud_base_url,
            settings.ping_period,
            remote::DEFAULT_MAX_ATTEMPTS,
        )
        .await?;

        let (bus, revisions) = start_daemon_bus(&settings);
        let ctx = Context {
            settings,
            paths: self.paths.clone(),
            transport: self.transport.clone(),
            bus,
            services: self.services.clone(),
        };
        let reporter = remote::spawn_hardware_revision_reporter(&ctx, revisions);

        let result = match remote::start(&ctx).await {
            Ok(()) => {
                remote::announce(&ctx).await;
                remote::run(&ctx, shutdown).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        };

        reporter.abort();
        ctx.bus.shutdown().await;
        result
    }
}
