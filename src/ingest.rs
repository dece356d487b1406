//! Resource sync orchestration.
//!
//! Coordinates the full flow for one resource: freshness check → fetch →
//! fingerprint → write-if-changed, plus the `pmirror fetch` and
//! `pmirror reconcile` commands built on it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};

use portal_mirror_core::models::{fingerprint, FetchRequest, HttpMethod};
use portal_mirror_core::store::BlobStore;

use crate::artifact::Artifact;
use crate::config::Config;
use crate::db;
use crate::error::ArtifactError;
use crate::reconcile::{ItemStatus, Reconciler, WriteOutcome};
use crate::sqlite_store::SqliteBlobStore;
use crate::transport::Transport;

/// Result of [`sync_resource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub path: String,
    /// Whether the body came from the portal rather than the store.
    pub fresh: bool,
    pub hash: String,
    pub write: WriteOutcome,
}

/// Mirror one resource into the primary bucket.
///
/// `method` and `expected_mime` override the request's own.
pub async fn sync_resource(
    reconciler: &mut Reconciler,
    request: &FetchRequest,
    method: HttpMethod,
    expected_mime: &str,
    force: bool,
) -> Result<SyncOutcome, ArtifactError> {
    let request = FetchRequest {
        method,
        expected_mime: expected_mime.to_string(),
        ..request.clone()
    };
    let mut artifact = Artifact::from_request(&request);

    let fresh = reconciler
        .fetch_if_stale(&mut artifact, &request, force)
        .await?;
    let hash = fingerprint(&artifact.body);
    let write = reconciler.write_if_changed(&mut artifact, &hash).await?;

    Ok(SyncOutcome {
        path: artifact.path(),
        fresh,
        hash,
        write,
    })
}

/// Primary and backup buckets of the configured database.
pub async fn open_stores(config: &Config) -> Result<(Arc<dyn BlobStore>, Arc<dyn BlobStore>)> {
    let pool = db::connect(config).await?;
    let primary = SqliteBlobStore::new(pool.clone(), &config.store.bucket_fetched);
    let backup = SqliteBlobStore::new(pool, &config.store.bucket_backup);
    Ok((Arc::new(primary), Arc::new(backup)))
}

pub async fn build_reconciler(config: &Config) -> Result<Reconciler> {
    let (primary, backup) = open_stores(config).await?;
    let transport = Transport::from_config(config).context("Failed to set up HTTP transport")?;
    Ok(Reconciler::new(
        primary,
        backup,
        transport,
        config.store.min_age_before_download(),
    )
    .with_content_language(&config.store.content_language))
}

/// Options of `pmirror fetch`.
#[derive(Debug, Clone)]
pub struct FetchArgs {
    pub url: String,
    pub folder: String,
    pub name: String,
    pub ending: String,
    pub form: Vec<(String, String)>,
    pub expect: String,
    pub redownload: bool,
    pub force: bool,
    pub created: Option<String>,
}

pub async fn run_fetch(config: &Config, args: FetchArgs) -> Result<()> {
    let created = match &args.created {
        Some(raw) => parse_time(raw)?,
        None => Utc::now(),
    };
    let mut request = FetchRequest::new(&args.folder, &args.name, &args.ending, created, &args.url)
        .with_redownload(args.redownload, false);
    if !args.form.is_empty() {
        request = request.with_form(args.form);
    }

    let mut reconciler = build_reconciler(config).await?;
    let outcome = sync_resource(
        &mut reconciler,
        &request,
        request.method,
        &args.expect,
        args.force,
    )
    .await
    .with_context(|| format!("Failed to sync {}", args.url))?;

    println!("fetch {}", outcome.path);
    println!("  source: {}", if outcome.fresh { "portal" } else { "store" });
    println!("  hash: {}", outcome.hash);
    match &outcome.write {
        WriteOutcome::Created => println!("  result: created"),
        WriteOutcome::Updated { backup_path } => {
            println!("  result: updated (previous version in {})", backup_path)
        }
        WriteOutcome::Touched => println!("  result: unchanged, touched"),
        WriteOutcome::Unchanged => println!("  result: unchanged"),
    }
    println!("ok");
    Ok(())
}

/// Read a live-path file: one full object path per line, blanks and `#`
/// comments ignored.
pub fn read_live_set(path: &Path) -> Result<HashSet<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read live set: {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub async fn run_reconcile(
    config: &Config,
    prefix: &str,
    live_file: &Path,
    child_folders: Vec<String>,
    since: Option<String>,
) -> Result<()> {
    let live = read_live_set(live_file)?;
    let min_time = match since {
        Some(raw) => parse_time(&raw)?,
        None => DateTime::<Utc>::MIN_UTC,
    };

    let reconciler = build_reconciler(config).await?;
    let report = reconciler
        .reconcile_missing(prefix, &live, &child_folders, min_time)
        .await?;

    println!("reconcile {}", prefix);
    println!("  scanned: {}", report.scanned);
    println!("  kept: {}", report.kept);
    println!("  skipped (before cut-off): {}", report.skipped);
    for outcome in report.outcomes() {
        match &outcome.status {
            ItemStatus::Removed { backup_path } => {
                println!("  removed {} -> {}", outcome.path, backup_path)
            }
            ItemStatus::Failed { error } => println!("  FAILED {}: {}", outcome.path, error),
        }
    }
    let failures = report.failures().len();
    if failures > 0 {
        println!("{} failure(s)", failures);
    } else {
        println!("ok");
    }
    Ok(())
}

/// Accept RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Invalid time '{}': expected RFC 3339 or YYYY-MM-DD", raw))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .context("Invalid date")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_time_accepts_both_forms() {
        assert_eq!(
            parse_time("2024-02-03").unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time("2024-02-03T10:00:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 3, 8, 0, 0).unwrap()
        );
        assert!(parse_time("03.02.2024").is_err());
    }

    #[test]
    fn live_set_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("live.txt");
        std::fs::write(&file, "# current\nvorlagen/a.html\n\n  vorlagen/b.html  \n").unwrap();
        let live = read_live_set(&file).unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.contains("vorlagen/b.html"));
    }
}
