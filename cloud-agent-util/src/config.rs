use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::http::{InvalidUriError, Uri};
use crate::json::deserialize_optional_duration_from_secs;

/// Link value meaning that no activation link is meaningful right now
pub const UNKNOWN_LINK: &str = "unknown";

/// Link value shown for providers that never reached the cloud
pub const NOCONNECT_LINK: &str = "noconnect";

/// Name of the per-provider configuration file
pub const CONFIG_FILE_NAME: &str = "wb-cloud-agent.conf";

const DEFAULT_BROKER_URL: &str = "unix:///var/run/mosquitto/mosquitto.sock";
const DEFAULT_CLOUD_BASE_URL: &str = "https://wirenboard.cloud";
const DEFAULT_CLIENT_CERT_ENGINE_KEY: &str = "ATECCx08:00:02:C0:00";
const DEFAULT_REQUEST_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(5);
const MIN_REQUEST_PERIOD: u64 = 1;

/// Filesystem roots used by the agent
#[derive(Clone, Debug)]
pub struct Paths {
    /// Template every new provider config is generated from
    pub default_config: PathBuf,
    /// One sub-directory per provider holding its config file
    pub providers_config_dir: PathBuf,
    /// Agent data directory, holds the device certificate and provider state
    pub app_data_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            default_config: PathBuf::from("/etc/wb-cloud-agent.conf"),
            providers_config_dir: PathBuf::from("/etc/wb-cloud-agent/providers"),
            app_data_dir: PathBuf::from("/var/lib/wb-cloud-agent"),
        }
    }
}

impl Paths {
    /// Use `root` as a prefix for every default path
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        let defaults = Self::default();
        let rebase = |path: &Path| root.join(path.strip_prefix("/").unwrap_or(path));
        Self {
            default_config: rebase(&defaults.default_config),
            providers_config_dir: rebase(&defaults.providers_config_dir),
            app_data_dir: rebase(&defaults.app_data_dir),
        }
    }

    pub fn providers_data_dir(&self) -> PathBuf {
        self.app_data_dir.join("providers")
    }

    pub fn provider_config_dir(&self, provider: &str) -> PathBuf {
        self.providers_config_dir.join(provider)
    }

    pub fn provider_config_file(&self, provider: &str) -> PathBuf {
        self.provider_config_dir(provider).join(CONFIG_FILE_NAME)
    }

    pub fn provider_data_dir(&self, provider: &str) -> PathBuf {
        self.providers_data_dir().join(provider)
    }

    pub fn activation_link_file(&self, provider: &str) -> PathBuf {
        self.provider_data_dir(provider).join("activation_link.conf")
    }
}

/// The cloud event poll interval.
///
/// The interval can be changed by the remote on any response, so clones
/// share the same underlying value. It never drops below one second.
#[derive(Clone, Debug)]
pub struct PollInterval(Arc<AtomicU64>);

impl PollInterval {
    pub fn new(interval: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(
            interval.as_secs().max(MIN_REQUEST_PERIOD),
        )))
    }

    pub fn get(&self) -> Duration {
        Duration::from_secs(self.0.load(Ordering::Acquire))
    }

    /// Store a new interval, returning `true` if it differs from the previous one
    pub fn set(&self, interval: Duration) -> bool {
        let secs = interval.as_secs().max(MIN_REQUEST_PERIOD);
        self.0.swap(secs, Ordering::AcqRel) != secs
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_PERIOD)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("The file was not found in: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("Error parsing JSON in: {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid cloud base URL: {0}")]
    InvalidUrl(#[from] InvalidUriError),
}

/// Overrides read from a JSON config file
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct SettingsFile {
    log_level: Option<String>,
    broker_url: Option<String>,
    client_cert_engine_key: Option<String>,
    client_cert_file: Option<PathBuf>,
    cloud_base_url: Option<String>,

    #[serde(default, deserialize_with = "deserialize_optional_duration_from_secs")]
    request_period_seconds: Option<Duration>,

    #[serde(default, deserialize_with = "deserialize_optional_duration_from_secs")]
    ping_period_seconds: Option<Duration>,
}

/// Runtime settings for a single provider
#[derive(Clone, Debug)]
pub struct Settings {
    pub provider: String,
    pub log_level: String,
    pub broker_url: String,

    pub client_cert_engine_key: String,
    pub client_cert_file: PathBuf,

    pub cloud_base_url: String,
    pub cloud_agent_url: Uri,

    /// Seconds between event polls, adjustable by the remote
    pub request_period: PollInterval,
    /// Seconds between reachability probes on start
    pub ping_period: Duration,

    pub agent_service: String,
    pub tunnel_service: String,
    pub metrics_service: String,

    pub tunnel_config: PathBuf,
    pub metrics_config: PathBuf,
    pub activation_link_config: PathBuf,

    /// Directory where the diagnostics collector drops its archives
    pub diag_archive: PathBuf,
    pub diag_collect_command: Vec<String>,

    /// Topic prefix of the virtual device on the bus
    pub mqtt_prefix: String,
}

impl Settings {
    /// Built-in settings for `provider`, without reading any file
    pub fn new(paths: &Paths, provider: &str) -> Result<Self, ConfigError> {
        let pkg = env!("AGENT_PKG_NAME");
        let data_dir = paths.provider_data_dir(provider);
        let cloud_agent_url = DEFAULT_CLOUD_BASE_URL.parse::<Uri>()?.agent_url()?;

        Ok(Self {
            provider: provider.to_owned(),
            log_level: "INFO".to_owned(),
            broker_url: DEFAULT_BROKER_URL.to_owned(),
            client_cert_engine_key: DEFAULT_CLIENT_CERT_ENGINE_KEY.to_owned(),
            client_cert_file: paths.app_data_dir.join("device_bundle.crt.pem"),
            cloud_base_url: DEFAULT_CLOUD_BASE_URL.to_owned(),
            cloud_agent_url,
            request_period: PollInterval::default(),
            ping_period: DEFAULT_PING_PERIOD,
            agent_service: format!("{pkg}@{provider}.service"),
            tunnel_service: format!("{pkg}-frpc@{provider}.service"),
            metrics_service: format!("{pkg}-telegraf@{provider}.service"),
            tunnel_config: data_dir.join("frpc.conf"),
            metrics_config: data_dir.join("telegraf.conf"),
            activation_link_config: paths.activation_link_file(provider),
            diag_archive: PathBuf::from("/tmp"),
            diag_collect_command: vec!["wb-diag-collect".to_owned(), "diag".to_owned()],
            mqtt_prefix: format!("/devices/system__{pkg}__{provider}"),
        })
    }

    /// Load settings for `provider`.
    ///
    /// Built-in defaults are overridden by the template config, if any, and
    /// then by the provider config, which must exist.
    pub async fn load(paths: &Paths, provider: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::new(paths, provider)?;

        if let Some(template) = read_settings_file(&paths.default_config).await? {
            settings.apply(template)?;
        }

        let config_file = paths.provider_config_file(provider);
        let overrides = read_settings_file(&config_file)
            .await?
            .ok_or(ConfigError::NotFound(config_file))?;
        settings.apply(overrides)?;

        Ok(settings)
    }

    /// Settings for talking to an arbitrary cloud, ignoring provider configs
    pub fn for_base_url(paths: &Paths, base_url: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::new(paths, "")?;
        settings.set_cloud_base_url(base_url)?;
        Ok(settings)
    }

    pub fn set_cloud_base_url(&mut self, base_url: &str) -> Result<(), ConfigError> {
        self.cloud_agent_url = base_url.parse::<Uri>()?.agent_url()?;
        self.cloud_base_url = base_url.to_owned();
        Ok(())
    }

    fn apply(&mut self, file: SettingsFile) -> Result<(), ConfigError> {
        if let Some(base_url) = file.cloud_base_url {
            self.set_cloud_base_url(&base_url)?;
        }
        if let Some(log_level) = file.log_level {
            self.log_level = log_level;
        }
        if let Some(broker_url) = file.broker_url {
            self.broker_url = broker_url;
        }
        if let Some(key) = file.client_cert_engine_key {
            self.client_cert_engine_key = key;
        }
        if let Some(cert) = file.client_cert_file {
            self.client_cert_file = cert;
        }
        if let Some(period) = file.request_period_seconds {
            self.request_period.set(period);
        }
        if let Some(period) = file.ping_period_seconds {
            self.ping_period = period;
        }
        Ok(())
    }
}

async fn read_settings_file(path: &Path) -> Result<Option<SettingsFile>, ConfigError> {
    debug!("reading settings from {}", path.display());
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
