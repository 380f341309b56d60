//! Information about the controller the agent runs on

use std::io;

use tokio::process::Command;
use tracing::debug;

const TELEGRAF_PACKAGE: &str = "telegraf-wb-cloud-agent";

/// Run `program` and return its trimmed standard output.
///
/// A non-zero exit is reported as an error carrying the trimmed stderr.
pub async fn command_output(program: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// The controller serial number, as reported by `wb-gen-serial`
pub async fn serial_number() -> io::Result<String> {
    command_output("wb-gen-serial", &["-s"]).await
}

/// Installed version of a Debian package, or `unknown`
pub async fn package_version(package: &str) -> String {
    match command_output("dpkg-query", &["-W", "-f=${Version}", package]).await {
        Ok(version) if !version.is_empty() => version,
        Ok(_) => "unknown".to_owned(),
        Err(err) => {
            debug!("could not query version of {package}: {err}");
            "unknown".to_owned()
        }
    }
}

pub async fn telegraf_version() -> String {
    package_version(TELEGRAF_PACKAGE).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_trims_command_output() {
        let output = command_output("echo", &["  ABC123  "]).await.unwrap();
        assert_eq!(output, "ABC123");
    }

    #[tokio::test]
    async fn it_reports_failing_commands() {
        assert!(command_output("false", &[]).await.is_err());
        assert!(command_output("/nonexistent/wb-gen-serial", &[]).await.is_err());
    }

    #[tokio::test]
    async fn it_falls_back_to_unknown_versions() {
        let version = package_version("surely-not-an-installed-package-name").await;
        assert_eq!(version, "unknown");
    }
}
