use std::io;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::{CONFIG_FILE_NAME, ConfigError, NOCONNECT_LINK, Paths, Settings};
use crate::http::Uri;
use crate::store::{Store, StoreError};

const ACTIVATION_LINK_FILE_NAME: &str = "activation_link.conf";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A configured cloud provider as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub base_url: String,
    pub activation_link: String,
}

impl Provider {
    /// The URL to show for this provider.
    ///
    /// A pending activation link takes precedence, a provider that never
    /// reached the cloud is reported as such, and a bound controller links
    /// to its page on the cloud.
    pub fn display_url(&self, serial: &str) -> String {
        if self.activation_link.starts_with("http") {
            return self.activation_link.clone();
        }
        if self.activation_link == NOCONNECT_LINK {
            return format!("No connect to: {}", self.base_url);
        }

        let controller_path = format!("/controllers/{serial}");
        self.base_url
            .parse::<Uri>()
            .and_then(|base| Uri::from_parts(base, &controller_path))
            .map(|uri| uri.to_string())
            .unwrap_or_else(|_| {
                format!("{}{controller_path}", self.base_url.trim_end_matches('/'))
            })
    }
}

/// On-disk provider configuration and state
#[derive(Clone, Debug)]
pub struct Providers {
    paths: Paths,
    configs: Store,
    data: Store,
}

impl Providers {
    pub fn new(paths: &Paths) -> Self {
        Self {
            paths: paths.clone(),
            configs: Store::new(&paths.providers_config_dir),
            data: Store::new(paths.providers_data_dir()),
        }
    }

    /// Names of all configured providers, sorted
    pub async fn names(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.configs.list_dirs("/").await?)
    }

    pub async fn contains(&self, name: &str) -> Result<bool, ProviderError> {
        Ok(self.names().await?.iter().any(|p| p == name))
    }

    /// Create the provider config from the template, pointing it at `base_url`
    pub async fn generate_config(&self, name: &str, base_url: &str) -> Result<(), ProviderError> {
        let template = &self.paths.default_config;
        let mut config: Map<String, Value> = match tokio::fs::read_to_string(template).await {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: template.clone(),
                    source,
                })?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: template.clone(),
                    source,
                }
                .into());
            }
        };
        config.insert("CLOUD_BASE_URL".to_owned(), Value::from(base_url));

        debug!("generating config for provider {name}");
        self.configs
            .write(format!("{name}/{CONFIG_FILE_NAME}"), &config)
            .await?;
        Ok(())
    }

    /// Remove the provider config and data directories
    pub async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        debug!("deleting config and data of provider {name}");
        self.configs.delete_all(name).await?;
        self.data.delete_all(name).await?;
        Ok(())
    }

    /// The stored activation link of a provider, if any
    pub async fn activation_link(&self, name: &str) -> Result<Option<String>, ProviderError> {
        let link = self
            .data
            .read_text(format!("{name}/{ACTIVATION_LINK_FILE_NAME}"))
            .await?;
        Ok(link.map(|l| l.lines().next().unwrap_or_default().trim().to_owned()))
    }

    /// Load every configured provider.
    ///
    /// Each provider must have a readable config file. Providers that never
    /// stored an activation link are reported as `noconnect`.
    pub async fn load(&self) -> Result<Vec<Provider>, ProviderError> {
        let mut providers = Vec::new();
        for name in self.names().await? {
            let settings = Settings::load(&self.paths, &name).await?;
            let activation_link = self
                .activation_link(&name)
                .await?
                .unwrap_or_else(|| NOCONNECT_LINK.to_owned());

            providers.push(Provider {
                name,
                base_url: settings.cloud_base_url,
                activation_link,
            });
        }
        Ok(providers)
    }
}
