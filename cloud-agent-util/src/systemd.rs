use async_trait::async_trait;
use tracing::debug;
use zbus::Connection;
use zbus::zvariant::OwnedObjectPath;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to {action} unit {unit}: {source}")]
    Unit {
        action: &'static str,
        unit: String,
        source: zbus::Error,
    },
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),
}

// systemd Manager D-Bus interface
#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Manager {
    /// StartUnit method
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// RestartUnit method
    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// StopUnit method
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// EnableUnitFiles method - returns (carries_install_info, changes)
    fn enable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> zbus::Result<(bool, Vec<(String, String, String)>)>;

    /// DisableUnitFiles method
    fn disable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
    ) -> zbus::Result<Vec<(String, String, String)>>;

    /// Reload method - same as `systemctl daemon-reload`
    fn reload(&self) -> zbus::Result<()>;
}

/// Controls the services that belong to a provider
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Enable `unit` and start it, or restart it if `restart` is set
    async fn start_and_enable(&self, unit: &str, restart: bool) -> Result<(), Error>;

    /// Stop `unit` and disable it
    async fn stop_and_disable(&self, unit: &str) -> Result<(), Error>;
}

/// [`ServiceManager`] talking to the host systemd over the system bus
#[derive(Clone, Debug, Default)]
pub struct Systemd;

impl Systemd {
    pub fn new() -> Self {
        Self
    }

    async fn manager(&self) -> Result<ManagerProxy<'static>, Error> {
        let connection = Connection::system().await?;
        Ok(ManagerProxy::new(&connection).await?)
    }
}

fn log_changes(changes: &[(String, String, String)]) {
    for (kind, file, dest) in changes {
        debug!("{kind} {file} -> {dest}");
    }
}

#[async_trait]
impl ServiceManager for Systemd {
    async fn start_and_enable(&self, unit: &str, restart: bool) -> Result<(), Error> {
        let manager = self.manager().await?;
        let unit_error = |action| {
            let unit = unit.to_owned();
            move |source| Error::Unit {
                action,
                unit,
                source,
            }
        };

        debug!("enabling service {unit}");
        let (_, changes) = manager
            .enable_unit_files(&[unit], false, true)
            .await
            .map_err(unit_error("enable"))?;
        log_changes(&changes);
        manager.reload().await?;

        if restart {
            debug!("restarting service {unit}");
            manager
                .restart_unit(unit, "replace")
                .await
                .map_err(unit_error("restart"))?;
        } else {
            debug!("starting service {unit}");
            manager
                .start_unit(unit, "replace")
                .await
                .map_err(unit_error("start"))?;
        }
        Ok(())
    }

    async fn stop_and_disable(&self, unit: &str) -> Result<(), Error> {
        let manager = self.manager().await?;

        debug!("stopping service {unit}");
        manager
            .stop_unit(unit, "replace")
            .await
            .map_err(|source| Error::Unit {
                action: "stop",
                unit: unit.to_owned(),
                source,
            })?;

        debug!("disabling service {unit}");
        let changes = manager
            .disable_unit_files(&[unit], false)
            .await
            .map_err(|source| Error::Unit {
                action: "disable",
                unit: unit.to_owned(),
                source,
            })?;
        log_changes(&changes);
        manager.reload().await?;
        Ok(())
    }
}
