use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gpu_report_ingest::database_ops::stream_reader::{stream_json_array, StreamOptions};
use serde_json::{json, Value};

fn write_reports(n: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[").unwrap();
    for i in 0..n {
        if i > 0 {
            write!(file, ",").unwrap();
        }
        let report = json!({
            "_report_id": i,
            "properties": {"deviceName": format!("device {i}"), "limits": {"maxImageDimension2D": 16384}},
        });
        serde_json::to_writer(&mut file, &report).unwrap();
    }
    write!(file, "]").unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_batches_never_exceed_concurrency() {
    let file = write_reports(10_000);
    let outstanding = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);

    let stats = stream_json_array(file.path(), StreamOptions::new(100, 3), |batch: Vec<Value>| {
        let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        let outstanding = &outstanding;
        async move {
            assert_eq!(batch.len(), 100);
            // slower than the parser so the limit is actually reached
            tokio::time::sleep(Duration::from_millis(2)).await;
            outstanding.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(stats.processed, 10_000);
    assert_eq!(stats.parsed, 10_000);
    assert_eq!(stats.batches, 100);
    assert!(stats.pauses > 0, "the in-flight limit was never reached");
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight was {peak}");
    assert_eq!(outstanding.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn trailing_garbage_after_array_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"[{{"_report_id":1}}] {{"extra":true}}"#).unwrap();
    file.flush().unwrap();

    let res = stream_json_array(file.path(), StreamOptions::new(10, 2), |_b: Vec<Value>| async {
        Ok(())
    })
    .await;
    let err = format!("{:#}", res.unwrap_err());
    assert!(err.contains("trailing data"), "{err}");
}
