use std::io;

use tracing::debug;

use crate::bus::Presence;
use crate::util::config::{Settings, UNKNOWN_LINK};
use crate::util::fs::write_to_file;

/// Read the stored activation link, `unknown` if there is none
pub async fn read_activation_link(settings: &Settings) -> io::Result<String> {
    let path = &settings.activation_link_config;
    debug!("reading activation link from {}", path.display());

    match tokio::fs::read_to_string(path).await {
        Ok(link) => Ok(link.trim().to_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(UNKNOWN_LINK.to_owned()),
        Err(e) => Err(e),
    }
}

/// Store the activation link and show it on the bus
pub async fn write_activation_link(
    settings: &Settings,
    bus: &Presence,
    link: &str,
) -> io::Result<()> {
    let path = &settings.activation_link_config;
    debug!("writing activation link {link} to {}", path.display());

    write_to_file(path, link).await?;
    bus.publish_ctrl("activation_link", link);
    Ok(())
}
