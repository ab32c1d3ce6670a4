// End-to-end exercise of the Collector against real files on disk, covering
// the no-skip/idempotent-upsert/flush-atomicity properties: a collector run
// gets stopped mid-stream, a fresh Collector is built against the same
// SQLite file and log path, and resumes without re-counting or dropping
// lines. Grounded on `original_source/tests/test_log_contract.py` and
// `test_tailer.py`'s tmp_path fixture style, adapted to the async
// Collector/StateStore shape this crate uses instead of pytest fixtures.

use proxy_audit::collector::Collector;
use proxy_audit::config::Settings;
use proxy_audit::storage::StateStore;
use std::io::Write;
use std::time::Duration;

fn access_line(i: u64) -> String {
    format!(
        "2026/02/18 10:00:{:02}.000000 from 1.2.3.{}:12345 accepted tcp:example{}.com:443 [socks-in -> direct] email: user{}@example.com\n",
        i % 60,
        i % 255,
        i,
        i % 5
    )
}

fn count_rows(db_path: &std::path::Path, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

async fn run_collector_for(settings: Settings, duration: Duration) {
    let store = StateStore::open(&settings.db_path).unwrap();
    let mut collector = Collector::new(settings, store).await.unwrap();
    let stop = collector.stop_signal();

    let handle = tokio::spawn(async move {
        collector.run().await.unwrap();
    });

    tokio::time::sleep(duration).await;
    stop.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn resumes_after_stop_without_dropping_or_duplicating_lines() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let db_path = dir.path().join("audit.db");

    let mut file = std::fs::File::create(&log_path).unwrap();
    for i in 0..20 {
        write!(file, "{}", access_line(i)).unwrap();
    }
    drop(file);

    let settings = || Settings {
        node_id: "integration-node".to_string(),
        log_path: log_path.clone(),
        db_path: db_path.clone(),
        error_log_enabled: false,
        redis_enabled: false,
        batch_size: 5,
        flush_interval_seconds: 0.05,
        poll_interval_seconds: 0.02,
        ..Settings::default()
    };

    run_collector_for(settings(), Duration::from_millis(300)).await;
    let first_pass_count = count_rows(&db_path, "access_events");
    assert_eq!(first_pass_count, 20, "all 20 lines should have been ingested");

    // Append more lines after the first collector stopped, then resume with
    // a fresh Collector/StateStore pair against the same files.
    let mut file = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
    for i in 20..30 {
        write!(file, "{}", access_line(i)).unwrap();
    }
    drop(file);

    run_collector_for(settings(), Duration::from_millis(300)).await;
    let second_pass_count = count_rows(&db_path, "access_events");
    assert_eq!(
        second_pass_count, 30,
        "resumed collector should pick up only the newly appended lines"
    );

    // Re-running over the same file contents must not duplicate rows: the
    // tailer has already advanced past everything, so a third run is a
    // no-op against the store.
    run_collector_for(settings(), Duration::from_millis(150)).await;
    assert_eq!(count_rows(&db_path, "access_events"), 30);
}

#[tokio::test]
async fn copytruncate_resets_offset_and_keeps_ingesting() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let db_path = dir.path().join("audit.db");

    std::fs::write(&log_path, access_line(0)).unwrap();

    let settings = Settings {
        node_id: "truncate-node".to_string(),
        log_path: log_path.clone(),
        db_path: db_path.clone(),
        error_log_enabled: false,
        redis_enabled: false,
        batch_size: 5,
        flush_interval_seconds: 0.05,
        poll_interval_seconds: 0.02,
        ..Settings::default()
    };

    let store = StateStore::open(&db_path).unwrap();
    let mut collector = Collector::new(settings, store).await.unwrap();
    let stop = collector.stop_signal();
    let handle = tokio::spawn(async move {
        collector.run().await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    std::fs::write(&log_path, "").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    std::fs::write(&log_path, access_line(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    stop.stop();
    handle.await.unwrap();

    assert_eq!(count_rows(&db_path, "access_events"), 2);
}
