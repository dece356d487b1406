//! # Integration tests for the store reconciler
//!
//! Drives [`Reconciler`] and [`sync_resource`] against in-memory buckets, a
//! manually advanced clock and a wiremock origin. Both buckets share one
//! journal, so the tests can check the order of writes and deletes across
//! buckets.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use portal_mirror::artifact::Artifact;
use portal_mirror::config::HttpConfig;
use portal_mirror::error::ArtifactError;
use portal_mirror::ingest::sync_resource;
use portal_mirror::reconcile::{Clock, FixedClock, ItemStatus, Reconciler, WriteOutcome};
use portal_mirror::retry::{NoJitter, RecordingSleeper, RetryPolicy};
use portal_mirror::transport::Transport;
use portal_mirror_core::models::{
    fingerprint, FetchRequest, HttpMethod, ObjectMeta, META_CHANGED_BY, META_HASH,
};
use portal_mirror_core::store::memory::{InMemoryBlobStore, Journal};
use portal_mirror_core::store::BlobStore;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap()
}

struct Harness {
    primary: Arc<InMemoryBlobStore>,
    backup: Arc<InMemoryBlobStore>,
    journal: Journal,
    clock: Arc<FixedClock>,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    harness_with_min_age(chrono::Duration::days(1))
}

fn harness_with_min_age(min_age: chrono::Duration) -> Harness {
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let clock = Arc::new(FixedClock::new(t0()));

    let primary_clock = clock.clone();
    let primary = Arc::new(
        InMemoryBlobStore::new("fetched")
            .with_journal(journal.clone())
            .with_clock(move || primary_clock.now()),
    );
    let backup_clock = clock.clone();
    let backup = Arc::new(
        InMemoryBlobStore::new("backup")
            .with_journal(journal.clone())
            .with_clock(move || backup_clock.now()),
    );

    let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10), Duration::ZERO)
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_jitter(Arc::new(NoJitter));
    let transport = Transport::new(&HttpConfig::default(), None).with_policy(policy);

    let reconciler = Reconciler::new(
        primary.clone(),
        backup.clone(),
        transport,
        min_age,
    )
    .with_clock(clock.clone());

    Harness {
        primary,
        backup,
        journal,
        clock,
        reconciler,
    }
}

fn journal(h: &Harness) -> Vec<String> {
    h.journal.lock().unwrap().clone()
}

fn request(server: &MockServer) -> FetchRequest {
    FetchRequest::new(
        "vorlagen/",
        "vo12",
        ".pdf",
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
        format!("{}/docs/vo12.pdf", server.uri()),
    )
}

async fn serve(server: &MockServer, body: &[u8]) {
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

async fn requests(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

async fn sync(
    h: &mut Harness,
    req: &FetchRequest,
    force: bool,
) -> Result<portal_mirror::ingest::SyncOutcome, ArtifactError> {
    sync_resource(&mut h.reconciler, req, req.method, &req.expected_mime, force).await
}

// ── Freshness and write policy ───────────────────────────────────────────

#[tokio::test]
async fn first_sync_creates_artifact() {
    let server = MockServer::start().await;
    serve(&server, b"%PDF v1").await;
    let mut h = harness();

    let outcome = sync(&mut h, &request(&server), false).await.unwrap();

    assert!(outcome.fresh);
    assert_eq!(outcome.write, WriteOutcome::Created);
    assert_eq!(outcome.path, "vorlagen/vo12.pdf");
    assert_eq!(outcome.hash, fingerprint(b"%PDF v1"));

    let meta = h.primary.get_attributes("vorlagen/vo12.pdf").await.unwrap().unwrap();
    assert_eq!(meta.metadata[META_HASH], fingerprint(b"%PDF v1"));
    assert_eq!(meta.metadata[META_CHANGED_BY], "Create");
    assert_eq!(meta.custom_time, Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()));
    assert!(meta.is_gzip());
}

#[tokio::test]
async fn stored_copy_is_served_without_redownload() {
    let server = MockServer::start().await;
    serve(&server, b"%PDF v1").await;
    let mut h = harness();
    let req = request(&server);

    sync(&mut h, &req, false).await.unwrap();
    h.clock.advance(chrono::Duration::days(30));
    let outcome = sync(&mut h, &req, false).await.unwrap();

    assert!(!outcome.fresh);
    assert_eq!(outcome.write, WriteOutcome::Unchanged);
    assert_eq!(requests(&server).await, 1);
    assert_eq!(h.primary.write_count("vorlagen/vo12.pdf"), 1);
    assert_eq!(h.primary.touch_count("vorlagen/vo12.pdf"), 0);
}

#[tokio::test]
async fn redownload_waits_for_min_age() {
    let server = MockServer::start().await;
    serve(&server, b"%PDF v1").await;
    let mut h = harness();
    let req = request(&server).with_redownload(true, false);

    sync(&mut h, &req, false).await.unwrap();
    h.clock.advance(chrono::Duration::hours(23));
    let outcome = sync(&mut h, &req, false).await.unwrap();

    assert!(!outcome.fresh, "younger than min age must come from the store");
    assert_eq!(requests(&server).await, 1);
}

#[tokio::test]
async fn unchanged_refetch_only_touches() {
    let server = MockServer::start().await;
    serve(&server, b"%PDF v1").await;
    let mut h = harness();
    let req = request(&server).with_redownload(true, false);

    sync(&mut h, &req, false).await.unwrap();
    h.clock.advance(chrono::Duration::days(2));
    let outcome = sync(&mut h, &req, false).await.unwrap();

    assert!(outcome.fresh);
    assert_eq!(outcome.write, WriteOutcome::Touched);
    assert_eq!(h.primary.write_count("vorlagen/vo12.pdf"), 1);
    assert_eq!(h.primary.touch_count("vorlagen/vo12.pdf"), 1);
    assert!(h.backup.paths().is_empty());

    let meta = h.primary.get_attributes("vorlagen/vo12.pdf").await.unwrap().unwrap();
    assert_eq!(meta.updated, t0() + chrono::Duration::days(2));
}

#[tokio::test]
async fn repeated_write_with_same_hash_touches_once() {
    let server = MockServer::start().await;
    serve(&server, b"%PDF v1").await;
    let mut h = harness();
    let req = request(&server);
    sync(&mut h, &req, false).await.unwrap();

    let mut artifact = Artifact::from_request(&req);
    h.reconciler
        .fetch_if_stale(&mut artifact, &req, true)
        .await
        .unwrap();
    let hash = fingerprint(&artifact.body);

    let first = h.reconciler.write_if_changed(&mut artifact, &hash).await.unwrap();
    let second = h.reconciler.write_if_changed(&mut artifact, &hash).await.unwrap();

    assert_eq!(first, WriteOutcome::Touched);
    assert_eq!(second, WriteOutcome::Unchanged);
    assert_eq!(h.primary.touch_count("vorlagen/vo12.pdf"), 1);
    assert_eq!(h.primary.write_count("vorlagen/vo12.pdf"), 1);
}

#[tokio::test]
async fn reused_artifact_is_touched_again_after_fresh_fetch() {
    let server = MockServer::start().await;
    serve(&server, b"%PDF v1").await;
    let mut h = harness();
    let req = request(&server);
    let mut artifact = Artifact::from_request(&req);

    h.reconciler
        .fetch_if_stale(&mut artifact, &req, true)
        .await
        .unwrap();
    let hash = fingerprint(&artifact.body);
    let created = h.reconciler.write_if_changed(&mut artifact, &hash).await.unwrap();

    h.clock.advance(chrono::Duration::days(2));
    h.reconciler
        .fetch_if_stale(&mut artifact, &req, true)
        .await
        .unwrap();
    let refetched = h.reconciler.write_if_changed(&mut artifact, &hash).await.unwrap();

    assert_eq!(created, WriteOutcome::Created);
    assert_eq!(refetched, WriteOutcome::Touched);
    assert_eq!(requests(&server).await, 2);
    assert_eq!(h.primary.write_count("vorlagen/vo12.pdf"), 1);
    assert_eq!(h.primary.touch_count("vorlagen/vo12.pdf"), 1);
}

#[tokio::test]
async fn unbounded_min_age_keeps_serving_the_store() {
    let server = MockServer::start().await;
    serve(&server, b"%PDF v1").await;
    let mut h = harness_with_min_age(chrono::Duration::MAX);
    let req = request(&server).with_redownload(true, false);

    sync(&mut h, &req, false).await.unwrap();
    h.clock.advance(chrono::Duration::days(365));
    let outcome = sync(&mut h, &req, false).await.unwrap();

    assert!(!outcome.fresh);
    assert_eq!(requests(&server).await, 1);
}

#[tokio::test]
async fn changed_content_is_backed_up_before_overwrite() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(b"%PDF v1".to_vec()),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve(&server, b"%PDF v2").await;
    let mut h = harness();
    let req = request(&server);

    sync(&mut h, &req, false).await.unwrap();
    h.clock.advance(chrono::Duration::hours(1));
    let outcome = sync(&mut h, &req, true).await.unwrap();

    let backup_path = "vorlagen/vo12_2024-05-06-08-00-00.pdf";
    assert_eq!(
        outcome.write,
        WriteOutcome::Updated {
            backup_path: backup_path.to_string()
        }
    );
    assert_eq!(
        journal(&h),
        vec![
            "fetched:write:vorlagen/vo12.pdf".to_string(),
            format!("backup:write:{}", backup_path),
            "fetched:write:vorlagen/vo12.pdf".to_string(),
        ]
    );

    let old = h.backup.get_attributes(backup_path).await.unwrap().unwrap();
    assert_eq!(old.hash(), Some(fingerprint(b"%PDF v1").as_str()));
    let new = h.primary.get_attributes("vorlagen/vo12.pdf").await.unwrap().unwrap();
    assert_eq!(new.hash(), Some(fingerprint(b"%PDF v2").as_str()));
    assert_eq!(new.metadata[META_CHANGED_BY], "Update");
}

#[tokio::test]
async fn unexpected_mime_is_rejected_before_writing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/zip")
                .set_body_bytes(b"PK".to_vec()),
        )
        .mount(&server)
        .await;
    let mut h = harness();
    let req = request(&server);

    let err = sync_resource(&mut h.reconciler, &req, HttpMethod::Get, "application/pdf", false)
        .await
        .unwrap_err();

    assert!(matches!(err, ArtifactError::UnexpectedMime { .. }));
    assert!(h.primary.paths().is_empty());
}

#[tokio::test]
async fn missing_form_target_leaves_store_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).insert_header("content-type", "text/html"))
        .mount(&server)
        .await;
    let mut h = harness();
    let req = request(&server).with_form(vec![("VOLFDNR".into(), "12".into())]);

    let err = sync(&mut h, &req, false).await.unwrap_err();

    assert!(matches!(err, ArtifactError::EmptyContent { .. }));
    assert!(h.primary.paths().is_empty());
}

#[tokio::test]
async fn exhausted_fetch_surfaces_as_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;
    let mut h = harness();

    let err = sync(&mut h, &request(&server), false).await.unwrap_err();
    assert!(matches!(err, ArtifactError::Fetch(_)));
}

// ── Orphan removal ───────────────────────────────────────────────────────

async fn store_artifact(h: &Harness, path: &str, source_time: DateTime<Utc>) {
    let (folder, name) = portal_mirror_core::path::split(path);
    let mut artifact = Artifact::new(folder, name);
    artifact.body = path.as_bytes().to_vec();
    artifact.content_hash = Some(fingerprint(path.as_bytes()));
    artifact.content_type = Some("application/pdf".to_string());
    artifact.source_time = Some(source_time);
    artifact
        .write(h.primary.as_ref(), "de", h.clock.now())
        .await
        .unwrap();
}

fn live(paths: &[&str]) -> HashSet<String> {
    paths.iter().map(|p| p.to_string()).collect()
}

fn cut_off() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
}

fn recent() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn orphan_is_removed_with_its_children() {
    let h = harness();
    store_artifact(&h, "vorlagen/vo1.html", recent()).await;
    store_artifact(&h, "vorlagen/vo2.html", recent()).await;
    store_artifact(&h, "vorlagen/vo0.html", Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()).await;
    store_artifact(&h, "anlagen/vo1-1.pdf", recent()).await;
    store_artifact(&h, "anlagen/vo2-1.pdf", recent()).await;
    store_artifact(&h, "anlagen/vo2-2.pdf", recent()).await;
    h.journal.lock().unwrap().clear();

    let report = h
        .reconciler
        .reconcile_missing(
            "vorlagen/",
            &live(&["vorlagen/vo1.html"]),
            &["anlagen/".to_string()],
            cut_off(),
        )
        .await
        .unwrap();

    assert_eq!((report.scanned, report.kept, report.skipped), (3, 1, 1));
    assert_eq!(
        report.removed_paths(),
        vec!["vorlagen/vo2.html", "anlagen/vo2-1.pdf", "anlagen/vo2-2.pdf"]
    );
    assert!(report.failures().is_empty());
    assert_eq!(
        h.primary.paths(),
        vec!["anlagen/vo1-1.pdf", "vorlagen/vo0.html", "vorlagen/vo1.html"]
    );
    assert_eq!(h.backup.paths().len(), 3);

    // Every delete follows the backup write of the same object.
    let entries = journal(&h);
    assert_eq!(entries.len(), 6);
    for pair in entries.chunks(2) {
        assert!(pair[0].starts_with("backup:write:"), "{:?}", pair);
        assert!(pair[1].starts_with("fetched:delete:"), "{:?}", pair);
    }
}

#[tokio::test]
async fn failed_orphan_keeps_children_and_others_proceed() {
    let h = harness();
    store_artifact(&h, "vorlagen/vo2.html", recent()).await;
    store_artifact(&h, "vorlagen/vo3.html", recent()).await;
    store_artifact(&h, "anlagen/vo2-1.pdf", recent()).await;
    store_artifact(&h, "anlagen/vo3-1.pdf", recent()).await;
    h.primary.fail_delete("vorlagen/vo2.html");

    let report = h
        .reconciler
        .reconcile_missing("vorlagen/", &live(&[]), &["anlagen/".to_string()], cut_off())
        .await
        .unwrap();

    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].path, "vorlagen/vo2.html");
    assert!(failures[0].children.is_empty());
    assert!(h.primary.contains("vorlagen/vo2.html"));
    assert!(h.primary.contains("anlagen/vo2-1.pdf"));

    assert_eq!(
        report.removed_paths(),
        vec!["vorlagen/vo3.html", "anlagen/vo3-1.pdf"]
    );
}

#[tokio::test]
async fn orphan_without_fetch_time_is_reported() {
    let h = harness();
    store_artifact(&h, "vorlagen/vo4.html", recent()).await;
    h.primary.seed(
        ObjectMeta {
            path: "vorlagen/broken.html".to_string(),
            content_type: "text/html".to_string(),
            content_encoding: None,
            content_language: None,
            custom_time: Some(recent()),
            updated: t0(),
            size: 1,
            metadata: BTreeMap::new(),
        },
        b"x".to_vec(),
    );

    let report = h
        .reconciler
        .reconcile_missing("vorlagen/", &live(&[]), &[], cut_off())
        .await
        .unwrap();

    assert_eq!(report.removed_paths(), vec!["vorlagen/vo4.html"]);
    match &report.failures()[..] {
        [failed] => {
            assert_eq!(failed.path, "vorlagen/broken.html");
            assert!(matches!(failed.status, ItemStatus::Failed { .. }));
        }
        other => panic!("expected one failure, got {:?}", other),
    }
    assert!(h.primary.contains("vorlagen/broken.html"));
}

#[tokio::test]
async fn items_at_cut_off_are_not_removed() {
    let h = harness();
    store_artifact(&h, "vorlagen/vo5.html", cut_off()).await;

    let report = h
        .reconciler
        .reconcile_missing("vorlagen/", &live(&[]), &[], cut_off())
        .await
        .unwrap();

    assert_eq!(report.skipped, 1);
    assert!(report.items.is_empty());
    assert!(h.primary.contains("vorlagen/vo5.html"));
}
