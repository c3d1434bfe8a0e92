use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use cdr_common::checkpoint::Checkpoint;
use cdr_common::record::RECORD_LEN;
use cdr_common::retry_store::RetryStore;
use cdr_worker::config::{Config, EnvMsDuration};
use cdr_worker::scheduler::Scheduler;
use chrono::NaiveDate;
use httpmock::prelude::*;

fn config(dir: &Path, upload_url: String) -> Config {
    Config {
        bil_path: format!("{}/", dir.display()),
        upload_url,
        upload_concurrency: NonZeroUsize::new(2).unwrap(),
        max_retry: 5,
        request_timeout: EnvMsDuration(Duration::from_secs(2)),
        access_token: "token".to_owned(),
        signing_salt: "salt".to_owned(),
        checkpoint_path: dir.join("point.save"),
        retry_store_path: dir.join("log").join("reserveList.save"),
        log_dir: dir.join("log"),
    }
}

/// A record with a valid checksum whose calling number is `phone`, packed with a terminator.
fn record(phone: [u8; 2]) -> [u8; RECORD_LEN] {
    let mut raw = [0u8; RECORD_LEN];
    raw[26] = phone[0];
    raw[27] = phone[1];
    raw[5] = raw[6..]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    raw
}

#[tokio::test]
async fn test_two_records_one_delivered_one_pending() {
    let dir = tempfile::tempdir().unwrap();
    let billing_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

    let server = MockServer::start_async().await;
    let accepted = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/cdr")
                .body_contains(r#""FPhone":"111""#);
            then.status(200).body("ok");
        })
        .await;
    let rejected = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/cdr")
                .body_contains(r#""FPhone":"222""#);
            then.status(500).body("internal error");
        })
        .await;

    std::fs::write(dir.path().join("point.save"), "20240101|0").unwrap();
    let mut contents = Vec::new();
    contents.extend_from_slice(&record([0x11, 0x1f]));
    contents.extend_from_slice(&record([0x22, 0x2f]));
    std::fs::write(dir.path().join("20240101.bil"), contents).unwrap();

    let config = config(dir.path(), server.url("/cdr"));
    let scheduler = Scheduler::new(&config).unwrap();
    let checkpoint = scheduler.run_at(billing_date).await.unwrap();

    assert_eq!(checkpoint, Checkpoint::new(billing_date, 2));
    assert_eq!(
        std::fs::read_to_string(&config.checkpoint_path).unwrap(),
        "20240101|2"
    );
    assert_eq!(accepted.hits_async().await, 1);
    assert_eq!(rejected.hits_async().await, 1);

    let pending = RetryStore::new();
    assert_eq!(pending.load(&config.retry_store_path).await.unwrap(), 1);
    let entries = pending.snapshot_all();
    assert_eq!(entries[0].event.from_phone, "222");
    assert_eq!(entries[0].attempt_count, 1);

    // A restart finds nothing new to read, and the pending entry is still backing off.
    let scheduler = Scheduler::new(&config).unwrap();
    let checkpoint = scheduler.run_at(billing_date).await.unwrap();

    assert_eq!(checkpoint, Checkpoint::new(billing_date, 2));
    assert_eq!(accepted.hits_async().await, 1);
    assert_eq!(rejected.hits_async().await, 1);

    let pending = RetryStore::new();
    assert_eq!(pending.load(&config.retry_store_path).await.unwrap(), 1);
    assert_eq!(pending.snapshot_all(), entries);
}
