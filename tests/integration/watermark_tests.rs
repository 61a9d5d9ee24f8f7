//! Watermark monotonicity across writes and reopens.

use std::sync::Arc;

use botfleet::persistence::db;
use botfleet::persistence::watermarks::WatermarkRepo;

#[tokio::test]
async fn watermark_never_moves_backwards() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let watermarks = WatermarkRepo::new(database);

    watermarks.advance("C1", "alpha", "100.000200").await.expect("set");
    watermarks.advance("C1", "alpha", "103.000100").await.expect("advance");

    // A stale (lower) timestamp is ignored.
    watermarks.advance("C1", "alpha", "101.000500").await.expect("stale write");
    assert_eq!(
        watermarks.get("C1").await.expect("get").as_deref(),
        Some("103.000100")
    );

    // Equal timestamps are ignored too.
    watermarks.advance("C1", "alpha", "103.000100").await.expect("equal write");
    assert_eq!(
        watermarks.get("C1").await.expect("get").as_deref(),
        Some("103.000100")
    );
}

#[tokio::test]
async fn watermarks_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("wm.db").to_string_lossy().to_string();

    {
        let database = Arc::new(db::connect(&path).await.expect("open"));
        let watermarks = WatermarkRepo::new(database);
        watermarks.advance("C9", "ops", "555.000001").await.expect("set");
    }

    let database = Arc::new(db::connect(&path).await.expect("reopen"));
    let watermarks = WatermarkRepo::new(database);
    assert_eq!(
        watermarks.get("C9").await.expect("get").as_deref(),
        Some("555.000001")
    );

    let all = watermarks.all().await.expect("all");
    assert_eq!(all.get("C9").map(String::as_str), Some("555.000001"));
}

#[tokio::test]
async fn channels_are_independent() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let watermarks = WatermarkRepo::new(database);

    watermarks.advance("C1", "alpha", "200.1").await.expect("c1");
    watermarks.advance("C2", "beta", "100.1").await.expect("c2");

    assert_eq!(watermarks.get("C1").await.expect("get").as_deref(), Some("200.1"));
    assert_eq!(watermarks.get("C2").await.expect("get").as_deref(), Some("100.1"));
}
