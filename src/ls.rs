//! Stored artifact listing for `pmirror ls`.

use anyhow::Result;

use crate::config::Config;
use crate::ingest::open_stores;
use crate::reconcile::list_artifacts;

pub async fn run_ls(config: &Config, prefix: &str) -> Result<()> {
    let (primary, _) = open_stores(config).await?;
    let artifacts = list_artifacts(primary.as_ref(), prefix).await?;

    if artifacts.is_empty() {
        println!("No artifacts under '{}'.", prefix);
        return Ok(());
    }

    println!(
        "{:<48} {:<28} {:<14} {:<20}",
        "PATH", "CONTENT TYPE", "HASH", "UPDATED"
    );
    for artifact in &artifacts {
        let hash = artifact.content_hash.as_deref().unwrap_or("-");
        println!(
            "{:<48} {:<28} {:<14} {:<20}",
            artifact.path(),
            artifact.content_type.as_deref().unwrap_or("-"),
            short_hash(hash),
            artifact
                .updated_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    println!("{} artifact(s)", artifacts.len());
    Ok(())
}

/// First twelve characters of a hash.
fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}
