//! Behavioural tests for the single-shot result collector.

use std::time::Duration;

use rntape::test_support::post_result;
use rntape::{CollectorError, ResultCollector};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn started() -> ResultCollector {
    ResultCollector::start(0).await.expect("collector binds")
}

#[tokio::test]
async fn first_submission_wins() {
    let mut collector = started().await;
    let pending = collector.take_pending().expect("pending result");

    let first = post_result(collector.port(), r#"{"finished": 0, "output": "PASS 12/12"}"#)
        .await
        .expect("first post");
    let second = post_result(collector.port(), r#"{"finished": 1, "output": "FAIL 2/12"}"#)
        .await
        .expect("second post");

    assert!(first.starts_with("HTTP/1.1 200"), "{first}");
    assert!(first.ends_with("ok"), "{first}");
    assert!(second.ends_with("ok"), "{second}");

    let payload = pending.wait().await.expect("settled");
    assert_eq!(payload.exit_code(), 0);
    assert_eq!(payload.output_text(), "PASS 12/12");
    collector.stop().await.expect("stops");
}

#[tokio::test]
async fn pending_result_is_handed_out_once() {
    let mut collector = started().await;
    assert!(collector.take_pending().is_some());
    assert!(collector.take_pending().is_none());
    collector.stop().await.expect("stops");
}

#[tokio::test]
async fn truncated_json_is_a_parse_error() {
    let mut collector = started().await;
    let pending = collector.take_pending().expect("pending result");

    let response = post_result(collector.port(), r#"{"finished": 0, "outp"#)
        .await
        .expect("post");

    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.ends_with("fail"), "{response}");
    let err = pending.wait().await.expect_err("parse failure");
    assert!(matches!(err, CollectorError::Parse { .. }), "{err}");
    collector.stop().await.expect("stops");
}

#[tokio::test]
async fn a_body_cut_short_is_a_transport_error() {
    let mut collector = started().await;
    let pending = collector.take_pending().expect("pending result");

    let mut stream = TcpStream::connect(("127.0.0.1", collector.port()))
        .await
        .expect("connect");
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 100\r\n\r\n{\"finished\"")
        .await
        .expect("partial write");
    stream.shutdown().await.expect("shutdown");
    drop(stream);

    let err = tokio::time::timeout(Duration::from_secs(5), pending.wait())
        .await
        .expect("settles promptly")
        .expect_err("transport failure");
    assert!(matches!(err, CollectorError::Transport { .. }), "{err}");
    collector.stop().await.expect("stops");
}

#[tokio::test]
async fn busy_port_fails_to_bind() {
    let mut first = started().await;

    let err = ResultCollector::start(first.port())
        .await
        .expect_err("port in use");

    assert!(
        matches!(err, CollectorError::Bind { port, .. } if port == first.port()),
        "{err}"
    );
    first.stop().await.expect("stops");
}

#[tokio::test]
async fn stop_releases_the_socket_and_closes_the_pending_result() {
    let mut collector = started().await;
    let pending = collector.take_pending().expect("pending result");
    let port = collector.port();

    collector.stop().await.expect("stops");

    assert!(collector.is_closed());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert_eq!(pending.wait().await, Err(CollectorError::Closed));
}

#[tokio::test]
async fn oversized_body_is_a_parse_error() {
    let mut collector = ResultCollector::start_with_limit(0, 16)
        .await
        .expect("collector binds");
    let pending = collector.take_pending().expect("pending result");

    let response = post_result(
        collector.port(),
        r#"{"finished": 0, "output": "far more than sixteen bytes"}"#,
    )
    .await
    .expect("post");

    assert!(response.starts_with("HTTP/1.1 413"), "{response}");
    assert!(response.ends_with("fail"), "{response}");
    let err = pending.wait().await.expect_err("body rejected");
    assert!(matches!(err, CollectorError::Parse { .. }), "{err}");
    collector.stop().await.expect("stops");
}
