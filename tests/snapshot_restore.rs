mod common;

use common::{collector_with, test_config, FakeTransport};
use spreadwatch::domain::TickSource;
use std::sync::Arc;

#[tokio::test]
async fn test_legacy_snapshot_upgrades_on_restore() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::write(
        &config.snapshot.path,
        r#"{
            "BTC-USD-PERP": [
                {"symbol":"BTC-USD-PERP","bid":100.0,"ask":100.0,"spread":0.0,"spreadPercent":0.0,"timestamp":1000,"proxy":"direct"},
                {"symbol":"BTC-USD-PERP","bid":100.0,"ask":100.0,"spread":0.0,"spreadPercent":0.0,"timestamp":2000,"proxy":"direct"},
                {"symbol":"BTC-USD-PERP","bid":100.0,"ask":100.0,"spread":0.0,"spreadPercent":0.0,"timestamp":3000,"proxy":"direct"}
            ]
        }"#,
    )
    .unwrap();

    let collector = collector_with(config, Arc::new(FakeTransport::streaming()), &[]);
    assert_eq!(collector.restore_snapshot().await.unwrap(), 1);

    let store = collector.pipeline().store();
    assert_eq!(store.window_for("BTC-USD-PERP", TickSource::Streamed).len(), 3);
    assert!(store.window_for("BTC-USD-PERP", TickSource::Polled).is_empty());

    let analysis = collector.analysis_set();
    assert_eq!(analysis.len(), 1);
    assert_eq!(analysis[0].data_source, TickSource::Streamed);
}

#[tokio::test]
async fn test_cold_start_without_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let collector = collector_with(
        test_config(dir.path()),
        Arc::new(FakeTransport::streaming()),
        &[],
    );
    assert_eq!(collector.restore_snapshot().await.unwrap(), 0);
    assert!(collector.analysis_set().is_empty());
}

#[tokio::test]
async fn test_save_then_restore_in_fresh_collector() {
    let dir = tempfile::tempdir().unwrap();
    let first = collector_with(
        test_config(dir.path()),
        Arc::new(FakeTransport::streaming()),
        &[],
    );
    for i in 0..4 {
        first.pipeline().on_streamed("ETH-USD-PERP", 10.0, 10.001, i * 1_000);
        first.pipeline().on_polled("ETH-USD-PERP", 10.0, 10.002, i * 1_000 + 500);
    }
    first.save_snapshot().await.unwrap();

    let second = collector_with(
        test_config(dir.path()),
        Arc::new(FakeTransport::streaming()),
        &[],
    );
    assert_eq!(second.restore_snapshot().await.unwrap(), 1);
    assert_eq!(second.history("ETH-USD-PERP"), first.history("ETH-USD-PERP"));
}

#[tokio::test]
async fn test_restore_caps_oversized_windows() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let ticks: Vec<String> = (0..250)
        .map(|i| {
            format!(
                r#"{{"bid":1.0,"ask":1.0,"spread":0.0,"spreadPercent":0.0,"timestamp":{},"source":"streamed"}}"#,
                i
            )
        })
        .collect();
    std::fs::write(
        &config.snapshot.path,
        format!(r#"{{"X":{{"streamed":[{}],"polled":[]}}}}"#, ticks.join(",")),
    )
    .unwrap();

    let collector = collector_with(config, Arc::new(FakeTransport::streaming()), &[]);
    collector.restore_snapshot().await.unwrap();
    let window = collector.pipeline().store().window_for("X", TickSource::Streamed);
    assert_eq!(window.len(), 180);
    assert_eq!(window[0].timestamp, 70);
    assert_eq!(window[0].symbol, "X");
}
