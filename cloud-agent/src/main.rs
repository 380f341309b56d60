use std::process::ExitCode;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, level_filters::LevelFilter, warn};
use tracing_subscriber::{
    EnvFilter,
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;
mod commands;

use cloud_agent_bus as bus;
use cloud_agent_remote as remote;
use cloud_agent_util as util;

use crate::cli::Command;
use crate::commands::{Agent, CommandError};
use crate::util::config::{Paths, Settings};

/// Map a configured log level name onto a tracing level
fn level_filter(level: &str) -> LevelFilter {
    match level.to_ascii_uppercase().as_str() {
        "CRITICAL" | "FATAL" | "ERROR" => LevelFilter::ERROR,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "DEBUG" => LevelFilter::DEBUG,
        "TRACE" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

fn initialize_tracing(level: &str) {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        ["hyper=error", "reqwest=warn", "rumqttc=warn", "zbus=error"]
            .into_iter()
            .filter_map(|directive| directive.parse::<Directive>().ok())
            .fold(
                EnvFilter::default().add_directive(level_filter(level).into()),
                EnvFilter::add_directive,
            )
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NONE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

/// Resolve once SIGINT or SIGTERM is received
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => Some(terminate),
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            None
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        Some(_) = async {
            match terminate.as_mut() {
                Some(terminate) => terminate.recv().await,
                None => std::future::pending().await,
            }
        } => {},
    }
}

async fn run_daemon(
    agent: &Agent,
    paths: &Paths,
    provider: &str,
    broker: Option<String>,
) -> Result<(), CommandError> {
    let mut settings = match Settings::load(paths, provider).await {
        Ok(settings) => settings,
        Err(e) => {
            initialize_tracing("INFO");
            return Err(e.into());
        }
    };
    initialize_tracing(&settings.log_level);

    if let Some(broker) = broker {
        settings.broker_url = broker;
    }
    agent.run_daemon(settings, shutdown_signal()).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::parse();
    let paths = Paths::default();
    let agent = Agent::new(paths.clone());

    let command = cli.command.unwrap_or(Command::ShowProviders);
    // the daemon logs at the level configured for its provider
    if !matches!(command, Command::RunDaemon { .. }) {
        initialize_tracing("INFO");
    }

    let result = match command {
        Command::ShowProviders => agent.show_providers().await,
        Command::AddProvider { base_url, name } => agent.add_provider(&base_url, name).await,
        Command::UseOnPremise { base_url, name } => agent.use_on_premise(&base_url, name).await,
        Command::DelProvider { provider } => agent.del_provider(&provider).await,
        Command::DelAllProviders => agent.del_all_providers().await,
        Command::CloudUnbind { base_url } => agent.cloud_unbind(&base_url).await,
        Command::RunDaemon { provider, broker } => {
            run_daemon(&agent, &paths, &provider, broker).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_usage() {
                println!("{e}");
            } else {
                error!("{e}");
            }
            ExitCode::from(e.exit_code())
        }
    }
}
