//! SQLite-backed [`BlobStore`].
//!
//! All buckets live in the `objects` table created by
//! [`migrate::ensure_schema`](crate::migrate::ensure_schema), keyed by
//! `(bucket, path)`. Timestamps are stored as Unix milliseconds, free-form
//! metadata as a JSON object.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use portal_mirror_core::models::{ObjectMeta, WriteAttrs};
use portal_mirror_core::store::BlobStore;

const META_COLUMNS: &str = "path, content_type, content_encoding, content_language, \
     custom_time, updated_at, size, metadata_json";

pub struct SqliteBlobStore {
    pool: SqlitePool,
    bucket: String,
}

impl SqliteBlobStore {
    pub fn new(pool: SqlitePool, bucket: impl Into<String>) -> Self {
        Self {
            pool,
            bucket: bucket.into(),
        }
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn row_to_meta(row: &SqliteRow) -> Result<ObjectMeta> {
    let custom_time: Option<i64> = row.try_get("custom_time")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata_json).context("Invalid metadata_json")?;
    let size: i64 = row.try_get("size")?;

    Ok(ObjectMeta {
        path: row.try_get("path")?,
        content_type: row.try_get("content_type")?,
        content_encoding: row.try_get("content_encoding")?,
        content_language: row.try_get("content_language")?,
        custom_time: custom_time.map(from_millis).transpose()?,
        updated: from_millis(row.try_get("updated_at")?)?,
        size: size.max(0) as u64,
        metadata,
    })
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get_attributes(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM objects WHERE bucket = ? AND path = ?",
            META_COLUMNS
        ))
        .bind(&self.bucket)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_meta).transpose()
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let body: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT body FROM objects WHERE bucket = ? AND path = ?")
                .bind(&self.bucket)
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;

        body.ok_or_else(|| anyhow!("object not found: {}/{}", self.bucket, path))
    }

    async fn write(&self, path: &str, body: &[u8], attrs: WriteAttrs) -> Result<ObjectMeta> {
        let updated = Utc::now();
        let metadata_json = serde_json::to_string(&attrs.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO objects (bucket, path, body, content_type, content_encoding,
                                 content_language, custom_time, updated_at, size, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, path) DO UPDATE SET
                body = excluded.body,
                content_type = excluded.content_type,
                content_encoding = excluded.content_encoding,
                content_language = excluded.content_language,
                custom_time = excluded.custom_time,
                updated_at = excluded.updated_at,
                size = excluded.size,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&self.bucket)
        .bind(path)
        .bind(body)
        .bind(&attrs.content_type)
        .bind(attrs.content_encoding.as_deref())
        .bind(attrs.content_language.as_deref())
        .bind(attrs.custom_time.map(to_millis))
        .bind(to_millis(updated))
        .bind(body.len() as i64)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write {}/{}", self.bucket, path))?;

        Ok(ObjectMeta {
            path: path.to_string(),
            content_type: attrs.content_type,
            content_encoding: attrs.content_encoding,
            content_language: attrs.content_language,
            custom_time: attrs.custom_time,
            updated: from_millis(to_millis(updated))?,
            size: body.len() as u64,
            metadata: attrs.metadata,
        })
    }

    async fn touch(&self, path: &str) -> Result<ObjectMeta> {
        let result = sqlx::query("UPDATE objects SET updated_at = ? WHERE bucket = ? AND path = ?")
            .bind(to_millis(Utc::now()))
            .bind(&self.bucket)
            .bind(path)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("object not found: {}/{}", self.bucket, path);
        }

        self.get_attributes(path)
            .await?
            .ok_or_else(|| anyhow!("object vanished during touch: {}/{}", self.bucket, path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND path = ?")
            .bind(&self.bucket)
            .bind(path)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("object not found: {}/{}", self.bucket, path);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM objects WHERE bucket = ? AND substr(path, 1, ?) = ? ORDER BY path",
            META_COLUMNS
        ))
        .bind(&self.bucket)
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_meta).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::ensure_schema;

    async fn store(dir: &tempfile::TempDir, bucket: &str) -> SqliteBlobStore {
        let pool = db::open(&dir.path().join("mirror.sqlite")).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        SqliteBlobStore::new(pool, bucket)
    }

    fn attrs() -> WriteAttrs {
        let mut a = WriteAttrs {
            content_type: "text/html;charset=utf-8".into(),
            content_encoding: Some("gzip".into()),
            content_language: Some("de".into()),
            custom_time: Some(Utc.with_ymd_and_hms(2023, 9, 1, 8, 0, 0).unwrap()),
            ..Default::default()
        };
        a.metadata.insert("hash".into(), "abc".into());
        a
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, "fetched").await;

        assert!(s.get_attributes("a/b.html").await.unwrap().is_none());
        let written = s.write("a/b.html", b"\x1f\x8bdata", attrs()).await.unwrap();
        let read = s.get_attributes("a/b.html").await.unwrap().unwrap();

        assert_eq!(read, written);
        assert_eq!(read.hash(), Some("abc"));
        assert_eq!(s.read("a/b.html").await.unwrap(), b"\x1f\x8bdata");
    }

    #[tokio::test]
    async fn buckets_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let fetched = store(&dir, "fetched").await;
        let backup = store(&dir, "backup").await;

        fetched.write("x", b"1", attrs()).await.unwrap();
        assert!(backup.get_attributes("x").await.unwrap().is_none());
        assert!(backup.read("x").await.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_prefix_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, "fetched").await;
        for p in ["anlagen/vo1-2.pdf", "anlagen/vo1-1.pdf", "anlagen/vo10.pdf", "vorlagen/vo1.html"] {
            s.write(p, b"x", attrs()).await.unwrap();
        }

        let paths: Vec<String> = s
            .list("anlagen/vo1-")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(paths, vec!["anlagen/vo1-1.pdf", "anlagen/vo1-2.pdf"]);
        assert_eq!(s.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn touch_and_delete_missing_fail() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, "fetched").await;
        assert!(s.touch("nope").await.is_err());
        assert!(s.delete("nope").await.is_err());

        s.write("p", b"x", attrs()).await.unwrap();
        let touched = s.touch("p").await.unwrap();
        assert_eq!(touched.hash(), Some("abc"));
        s.delete("p").await.unwrap();
        assert!(!s.list("").await.unwrap().iter().any(|m| m.path == "p"));
    }
}
