use clap::{Parser, Subcommand};
use url::Url;

/// Accept a cloud base URL: http(s), with a host and nothing after it
fn parse_base_url(value: &str) -> Result<String, String> {
    let invalid = || format!("Invalid URL: {value}");
    let url = Url::parse(value).map_err(|_| invalid())?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(invalid());
    }

    Ok(value.trim_end_matches('/').to_owned())
}

#[derive(Clone, Debug, Parser)]
#[command(name = "wb-cloud-agent", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// List cloud service providers (default)
    ShowProviders,

    /// Add new cloud service provider
    AddProvider {
        /// Cloud Provider base URL, e.g. https://wirenboard.cloud
        #[arg(value_parser = parse_base_url, value_name = "base_url")]
        base_url: String,

        /// Cloud Provider name to add (override url hostname)
        #[arg(long)]
        name: Option<String>,
    },

    /// Replace all cloud service providers with an on-premise one
    UseOnPremise {
        /// On-Premise Cloud Provider base URL, e.g. https://on-premise.cloud
        #[arg(value_parser = parse_base_url, value_name = "base_url")]
        base_url: String,

        /// On-Premise Cloud Provider name to add (override url hostname)
        #[arg(long)]
        name: Option<String>,
    },

    /// Delete cloud service provider
    DelProvider {
        /// Cloud Provider name or base URL to delete
        #[arg(value_name = "provider_name")]
        provider: String,
    },

    /// Delete all cloud service providers
    DelAllProviders,

    /// Run cloud agent in daemon mode
    RunDaemon {
        /// Cloud Provider name to run
        #[arg(value_name = "provider_name")]
        provider: String,

        /// MQTT broker url
        #[arg(long, env = "WB_CLOUD_AGENT_BROKER", value_name = "url")]
        broker: Option<String>,
    },

    /// Detach this controller from a cloud
    CloudUnbind {
        /// Cloud base URL, e.g. https://wirenboard.cloud
        #[arg(value_parser = parse_base_url, value_name = "base_url")]
        base_url: String,
    },
}

pub fn parse() -> Cli {
    Parser::parse()
}
