use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use globset::{Glob, GlobMatcher};
use http::StatusCode;
use serde_json::json;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::context::Context;
use super::transport::Request;

const ARCHIVE_PATTERN: &str = "diag_*.zip";

fn archive_matcher() -> Option<GlobMatcher> {
    Glob::new(ARCHIVE_PATTERN)
        .map(|glob| glob.compile_matcher())
        .ok()
}

/// Diagnostic archives in `dir` with their modification time
async fn find_archives(dir: &Path) -> io::Result<Vec<(PathBuf, SystemTime)>> {
    let Some(matcher) = archive_matcher() else {
        return Ok(Vec::new());
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut archives = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !matcher.is_match(entry.file_name()) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            archives.push((entry.path(), metadata.modified()?));
        }
    }
    Ok(archives)
}

async fn remove_archives(dir: &Path) -> io::Result<()> {
    for (path, _) in find_archives(dir).await? {
        debug!("removing old diagnostics {}", path.display());
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

async fn run_collector(ctx: &Context) {
    let settings = &ctx.settings;
    let Some((program, args)) = settings.diag_collect_command.split_first() else {
        return;
    };

    debug!("running {program} in {}", settings.diag_archive.display());
    let status = Command::new(program)
        .args(args)
        .current_dir(&settings.diag_archive)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("{program} exited with {status}"),
        Err(e) => error!("failed to run {program}: {e}"),
    }
}

/// Upload the newest diagnostic archive, or report that there is none
pub async fn upload_diagnostic(ctx: &Context) {
    let settings = &ctx.settings;
    let archives = match find_archives(&settings.diag_archive).await {
        Ok(archives) => archives,
        Err(e) => {
            error!("failed to look for diagnostics: {e}");
            Vec::new()
        }
    };

    let Some((newest, _)) = archives.into_iter().max_by_key(|(_, modified)| *modified) else {
        error!("No diagnostics collected");
        let request = Request::put("diagnostic-status/", json!({"status": "error"}));
        match ctx.transport.request(settings, request).await {
            Ok(res) if res.status == StatusCode::OK => {}
            Ok(res) => error!(
                "Not a 200 status while updating diagnostic status: {}",
                res.status.as_u16()
            ),
            Err(e) => error!("failed to update diagnostic status: {e}"),
        }
        return;
    };

    info!("Diagnostics collected: {}", newest.display());
    let request = Request::upload("upload-diagnostic/", &newest);
    match ctx.transport.request(settings, request).await {
        Ok(res) if res.status == StatusCode::OK => {}
        Ok(res) => error!(
            "Not a 200 status while making upload_diagnostic request: {}",
            res.status.as_u16()
        ),
        Err(e) => error!("failed to upload diagnostics: {e}"),
    }

    if let Err(e) = tokio::fs::remove_file(&newest).await {
        warn!("failed to remove {}: {e}", newest.display());
    }
}

/// Collect and upload diagnostics in the background.
///
/// Old archives are removed before the collector starts so the upload
/// never picks up a stale one.
pub async fn fetch_diagnostics(ctx: &Context) -> JoinHandle<()> {
    if let Err(e) = remove_archives(&ctx.settings.diag_archive).await {
        warn!("Erase diagnostic files failed: {e}");
    }

    let ctx = ctx.clone();
    tokio::spawn(
        async move {
            run_collector(&ctx).await;
            upload_diagnostic(&ctx).await;
        }
        .instrument(info_span!("diagnostics")),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{fixture, reply};
    use crate::transport::Method;

    #[tokio::test]
    async fn it_uploads_the_newest_archive() {
        let mut f = fixture();
        let diag_dir = f.ctx.settings.diag_archive.clone();
        tokio::fs::create_dir_all(&diag_dir).await.unwrap();
        // the collector drops a new archive in the working directory
        f.ctx.settings.diag_collect_command = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "touch diag_old.zip && sleep 0.05 && touch diag_new.zip notes.txt".to_owned(),
        ];
        tokio::fs::write(diag_dir.join("diag_stale.zip"), "")
            .await
            .unwrap();
        f.transport.push(reply(200, json!({})));

        fetch_diagnostics(&f.ctx).await.await.unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].endpoint, "upload-diagnostic/");
        assert_eq!(
            requests[0].method,
            Method::Upload(diag_dir.join("diag_new.zip"))
        );
        assert!(!diag_dir.join("diag_stale.zip").exists());
        assert!(!diag_dir.join("diag_new.zip").exists());
        assert!(diag_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn it_reports_missing_diagnostics() {
        let mut f = fixture();
        tokio::fs::create_dir_all(&f.ctx.settings.diag_archive)
            .await
            .unwrap();
        f.ctx.settings.diag_collect_command = vec!["true".to_owned()];
        f.transport.push(reply(200, json!({})));

        let handle = fetch_diagnostics(&f.ctx).await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].endpoint, "diagnostic-status/");
        assert_eq!(
            requests[0].method,
            Method::Put(Some(json!({"status": "error"})))
        );
    }
}
