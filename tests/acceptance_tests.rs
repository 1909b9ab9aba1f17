use aggregatord::aggregator::{Aggregator, Metrics, ExpectedResult};
use aggregatord::http::routes::routes;
use std::sync::Arc;
use std::time::Duration;
use warp::http::StatusCode;
use warp::Reply;

fn test_aggregator(expected: Vec<ExpectedResult>) -> (Arc<Aggregator>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let agg = Aggregator::new(
        expected,
        tmp.path().to_path_buf(),
        Duration::from_millis(50),
        Arc::new(Metrics::new()),
    );
    (Arc::new(agg), tmp)
}

/// S1: a plugin uploads its per-node result and the run completes once every
/// expected (plugin, node) pair has been received.
#[tokio::test]
async fn per_node_upload_is_persisted_and_completes_the_run() {
    let (agg, tmp) = test_aggregator(vec![ExpectedResult::new("systemd_logs", "node1")]);
    let filter = routes(agg.clone());

    let res = warp::test::request()
        .method("PUT")
        .path("/api/v1/results/by-node/node1/systemd_logs")
        .header("content-type", "text/plain")
        .header("content-disposition", r#"attachment; filename="logs.txt""#)
        .body("hello from node1")
        .reply(&filter)
        .await;

    assert_eq!(res.status(), StatusCode::OK);
    assert!(agg.is_complete().await);
    assert!(tmp
        .path()
        .join("plugins/systemd_logs/results/node1/logs.txt")
        .exists());
}

/// S2: an upload from a node outside the Expected-Result Registry is refused
/// with 403 and never reaches disk.
#[tokio::test]
async fn upload_for_unexpected_node_is_forbidden() {
    let (agg, tmp) = test_aggregator(vec![ExpectedResult::new("systemd_logs", "node1")]);
    let filter = routes(agg.clone());

    let res = warp::test::request()
        .method("PUT")
        .path("/api/v1/results/by-node/node99/systemd_logs")
        .body("unsolicited")
        .reply(&filter)
        .await;

    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert!(!agg.is_complete().await);
    assert!(!tmp.path().join("plugins/systemd_logs").exists());
}

/// S3: a second upload for a key that already succeeded is rejected as a
/// duplicate rather than silently overwriting the first artifact.
#[tokio::test]
async fn second_upload_for_same_key_is_rejected_as_duplicate() {
    let (agg, _tmp) = test_aggregator(vec![ExpectedResult::new("systemd_logs", "node1")]);
    let filter = routes(agg.clone());

    let first = warp::test::request()
        .method("PUT")
        .path("/api/v1/results/by-node/node1/systemd_logs")
        .body("first")
        .reply(&filter)
        .await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = warp::test::request()
        .method("PUT")
        .path("/api/v1/results/by-node/node1/systemd_logs")
        .body("second")
        .reply(&filter)
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

/// S4: a global (non-node-scoped) plugin uploads a gzipped tarball, which is
/// expanded under the plugin's output directory rather than stored whole.
#[tokio::test]
async fn global_tarball_upload_is_expanded_on_disk() {
    let (agg, tmp) = test_aggregator(vec![ExpectedResult::new("cluster_info", "")]);
    let filter = routes(agg.clone());

    let tar_gz = build_test_tar_gz(&[("report.json", b"{\"ok\":true}")]);

    let res = warp::test::request()
        .method("PUT")
        .path("/api/v1/results/global/cluster_info")
        .header("content-type", "application/gzip")
        .body(tar_gz)
        .reply(&filter)
        .await;

    assert_eq!(res.status(), StatusCode::OK);
    assert!(agg.is_complete().await);
    let expanded = tmp
        .path()
        .join("plugins/cluster_info/results/global/report.json");
    assert!(expanded.exists());
    assert_eq!(std::fs::read(expanded).unwrap(), b"{\"ok\":true}");
}

/// S5: a progress update for an unexpected key is rejected; for an expected
/// key it is accepted and supersedes the previous update on read-back.
#[tokio::test]
async fn progress_updates_are_scoped_to_expected_keys() {
    let (agg, _tmp) = test_aggregator(vec![ExpectedResult::new("systemd_logs", "node1")]);
    let filter = routes(agg.clone());

    let forbidden = warp::test::request()
        .method("POST")
        .path("/api/v1/progress/by-node/node1/unknown_plugin")
        .body(r#"{"message":"starting","total":10,"completed":0}"#)
        .reply(&filter)
        .await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let accepted = warp::test::request()
        .method("POST")
        .path("/api/v1/progress/by-node/node1/systemd_logs")
        .body(r#"{"message":"half done","total":10,"completed":5}"#)
        .reply(&filter)
        .await;
    assert_eq!(accepted.status(), StatusCode::OK);

    let progress = agg.snapshot_progress("systemd_logs/node1").await.unwrap();
    assert_eq!(progress.completed, 5);
    assert_eq!(progress.message, "half done");
}

/// S6: a Supervisor-synthesized failure is recorded as a result, keeping the
/// key outstanding until a retry supersedes it within the retry window.
#[tokio::test]
async fn synthetic_failure_is_recorded_and_superseded_by_retry() {
    use aggregatord::aggregator::{ProcessOutcome, ResultPayload};

    let (agg, tmp) = test_aggregator(vec![ExpectedResult::new("systemd_logs", "node1")]);

    let failure = ResultPayload::synthetic_error("systemd_logs", "node1", "pod failed: OOMKilled");
    let outcome = agg.process_result(failure).await;
    assert_eq!(outcome, ProcessOutcome::Persisted);
    assert!(agg.is_complete().await);
    assert!(tmp
        .path()
        .join("plugins/systemd_logs/errors/node1/error.json")
        .exists());

    let retry = ResultPayload {
        plugin: "systemd_logs".into(),
        node: "node1".into(),
        mime_type: "text/plain".into(),
        filename: Some("logs.txt".into()),
        body: bytes::Bytes::from_static(b"recovered"),
        error_message: None,
    };
    let outcome = agg.process_result(retry).await;
    assert_eq!(outcome, ProcessOutcome::Persisted);
    assert!(tmp
        .path()
        .join("plugins/systemd_logs/results/node1/logs.txt")
        .exists());
}

fn build_test_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.finish().unwrap();
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}
