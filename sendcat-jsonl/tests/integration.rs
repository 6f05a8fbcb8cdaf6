use sendcat_core::{PolicyEvent, RateLimitEvent};
use sendcat_jsonl::JsonlSink;
use std::path::PathBuf;
use tower_service::Service;

#[tokio::test]
async fn writes_json_lines() {
    let path = PathBuf::from("/tmp/sendcat-jsonl-test.log");
    let _ = std::fs::remove_file(&path);
    let mut sink = JsonlSink::new(path.to_string_lossy().to_string());

    let event = PolicyEvent::RateLimit(RateLimitEvent::Allowed {
        bucket: "chat_stream_session".to_string(),
        count: 1,
        limit: 60,
    });
    sink.call(event).await.unwrap();

    let contents = std::fs::read_to_string(&path).expect("file");
    assert!(contents.contains("rate_limit_allowed"));
}
