//! Unit tests for the device farm client.

use camino::Utf8PathBuf;
use mockito::Matcher;
use rstest::{fixture, rstest};
use serde_json::json;
use tempfile::TempDir;

use super::*;

const BASIC_AUTH: &str = "Basic dXNlcjprZXk=";

#[fixture]
fn credentials() -> Credentials {
    Credentials {
        user: String::from("user"),
        key: String::from("key"),
    }
}

fn farm(server: &mockito::Server) -> BrowserStackFarm {
    BrowserStackFarm::new(&FarmConfig {
        upload_url: format!("{}/upload", server.url()),
        hub_url: format!("{}/wd/hub/", server.url()),
        ..FarmConfig::default()
    })
}

fn url_artifact() -> BuildArtifact {
    BuildArtifact {
        source: ArtifactSource::Url(String::from("https://expo.io/artifacts/abc.aab")),
        device: String::from("Google Pixel 3"),
        os_version: String::from("9.0"),
    }
}

fn session(credentials: Credentials) -> SessionHandle {
    SessionHandle {
        id: String::from("sess-1"),
        credentials,
    }
}

#[rstest]
fn capabilities_carry_credentials_and_clamped_timeout(credentials: Credentials) {
    let config = RunConfig::builder()
        .target("android")
        .package_dir("/pkg")
        .user(Some(String::from("user")))
        .access_key(Some(String::from("key")))
        .idle_timeout_secs(Some(900))
        .run_id(Some(String::from("77")))
        .build()
        .expect("valid config");
    let caps = SessionCapabilities::for_run(&config, &url_artifact(), "widgets", "bs://app");

    assert_eq!(
        caps.to_json(&credentials),
        json!({
            "device": "Google Pixel 3",
            "os_version": "9.0",
            "browserstack.user": "user",
            "browserstack.key": "key",
            "browserstack.networkLogs": true,
            "browserstack.idleTimeout": 300,
            "project": "widgets",
            "build": "77:react-native:android:Google Pixel 3:9.0",
            "name": "widgets",
            "app": "bs://app",
        })
    );
}

#[rstest]
#[case(200, r#"{"sessionId":"abc","status":0,"value":{}}"#, "abc")]
#[case(200, r#"{"value":{"sessionId":"w3c","capabilities":{}}}"#, "w3c")]
fn session_ids_are_read_from_either_protocol(
    #[case] status: u16,
    #[case] body: &str,
    #[case] expected: &str,
) {
    assert_eq!(parse_session_id(status, body).as_deref(), Ok(expected));
}

#[rstest]
fn session_errors_surface_the_reported_message() {
    let err = parse_session_id(
        500,
        r#"{"value":{"error":"session not created","message":"no devices"}}"#,
    )
    .expect_err("error response");
    assert_eq!(
        err,
        FarmError::Rejected {
            message: String::from("session not created"),
        }
    );
}

#[rstest]
fn unparseable_session_response_keeps_the_body() {
    let err = parse_session_id(502, "<html>bad gateway</html>").expect_err("not json");
    assert_eq!(err.response_body(), Some("<html>bad gateway</html>"));
}

#[rstest]
#[tokio::test]
async fn url_artifacts_upload_as_json(credentials: Credentials) {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/upload")
        .match_header("authorization", BASIC_AUTH)
        .match_body(Matcher::Json(json!({"url": "https://expo.io/artifacts/abc.aab"})))
        .with_status(200)
        .with_body(r#"{"app_url":"bs://hosted"}"#)
        .create_async()
        .await;

    let app_url = farm(&server)
        .upload(&credentials, &url_artifact())
        .await
        .expect("upload succeeds");

    assert_eq!(app_url, "bs://hosted");
    mock.assert_async().await;
}

#[rstest]
#[tokio::test]
async fn file_artifacts_upload_as_multipart(credentials: Credentials) {
    let dir = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("app-release.apk")).expect("utf8 path");
    std::fs::write(&path, b"apk bytes").expect("artifact");

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/upload")
        .match_header("authorization", BASIC_AUTH)
        .match_header("content-type", Matcher::Regex(String::from("^multipart/form-data")))
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(String::from(r#"filename="app-release.apk""#)),
            Matcher::Regex(String::from("apk bytes")),
        ]))
        .with_status(200)
        .with_body(r#"{"app_url":"bs://apk"}"#)
        .create_async()
        .await;

    let artifact = BuildArtifact {
        source: ArtifactSource::File(path),
        ..url_artifact()
    };
    let app_url = farm(&server)
        .upload(&credentials, &artifact)
        .await
        .expect("upload succeeds");

    assert_eq!(app_url, "bs://apk");
    mock.assert_async().await;
}

#[rstest]
#[tokio::test]
async fn upload_error_field_is_a_rejection(credentials: Credentials) {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/upload")
        .with_status(422)
        .with_body(r#"{"error":"Invalid file type"}"#)
        .create_async()
        .await;

    let err = farm(&server)
        .upload(&credentials, &url_artifact())
        .await
        .expect_err("rejected");

    assert_eq!(
        err,
        FarmError::Rejected {
            message: String::from("Invalid file type"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn missing_local_artifact_is_reported(credentials: Credentials) {
    let server = mockito::Server::new_async().await;
    let artifact = BuildArtifact {
        source: ArtifactSource::File(Utf8PathBuf::from("/nonexistent/app.ipa")),
        ..url_artifact()
    };

    let err = farm(&server)
        .upload(&credentials, &artifact)
        .await
        .expect_err("no such file");

    assert!(matches!(err, FarmError::Artifact { ref path, .. } if path == "/nonexistent/app.ipa"));
}

#[rstest]
#[tokio::test]
async fn session_lifecycle_hits_the_hub(credentials: Credentials) {
    let mut server = mockito::Server::new_async().await;
    let start = server
        .mock("POST", "/wd/hub/session")
        .match_header("authorization", BASIC_AUTH)
        .match_body(Matcher::PartialJson(json!({
            "desiredCapabilities": {"app": "bs://app", "browserstack.idleTimeout": 90}
        })))
        .with_status(200)
        .with_body(r#"{"sessionId":"sess-1","status":0,"value":{}}"#)
        .create_async()
        .await;
    let ping = server
        .mock("POST", "/wd/hub/session/sess-1/execute")
        .match_body(Matcher::PartialJson(json!({"script": IDLE_PING_SCRIPT})))
        .with_status(200)
        .with_body(r#"{"status":0,"value":null}"#)
        .create_async()
        .await;
    let quit = server
        .mock("DELETE", "/wd/hub/session/sess-1")
        .with_status(200)
        .with_body(r#"{"status":0}"#)
        .create_async()
        .await;

    let client = farm(&server);
    let caps = SessionCapabilities {
        device: String::from("iPhone XS"),
        os_version: String::from("12"),
        idle_timeout_secs: 90,
        project: String::from("widgets"),
        build: String::from("dirty:react-native:ios:iPhone XS:12"),
        name: String::from("widgets"),
        app_url: String::from("bs://app"),
    };
    let handle = client
        .start_session(&credentials, &caps)
        .await
        .expect("session starts");
    assert_eq!(handle, session(credentials));

    client.ping(&handle).await.expect("ping");
    client.quit(&handle).await.expect("quit");

    start.assert_async().await;
    ping.assert_async().await;
    quit.assert_async().await;
}

#[rstest]
#[tokio::test]
async fn failed_ping_keeps_the_response_body(credentials: Credentials) {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/wd/hub/session/sess-1/execute")
        .with_status(404)
        .with_body(r#"{"value":{"error":"invalid session id"}}"#)
        .create_async()
        .await;

    let err = farm(&server)
        .ping(&session(credentials))
        .await
        .expect_err("session gone");

    assert_eq!(
        err.response_body(),
        Some(r#"{"value":{"error":"invalid session id"}}"#)
    );
}

#[rstest]
#[tokio::test]
async fn unresponsive_hub_cannot_stall_quit(credentials: Credentials) {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let accepting = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let client = BrowserStackFarm::new(&FarmConfig {
        hub_url: format!("http://{addr}/wd/hub"),
        ..FarmConfig::default()
    })
    .with_request_timeout(std::time::Duration::from_millis(200));

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(4),
        client.quit(&session(credentials)),
    )
    .await;

    accepting.abort();
    let err = result.expect("quit is bounded").expect_err("no answer");
    assert!(matches!(err, FarmError::Transport { .. }), "{err}");
}
