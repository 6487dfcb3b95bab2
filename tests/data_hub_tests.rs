// Data hub client and upload runner against a mocked service

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use csv2adh::auth::{AuthError, Authenticator, TokenManager, TokenState};
use csv2adh::readings::{self, StreamGroup};
use csv2adh::sds::{SdsClient, SdsError, SdsStream, SdsType};
use csv2adh::{RunMode, Runner};
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;

const NAMESPACE: &str = "/api/v1/Tenants/tenant-1/Namespaces/ns-1";
const TYPE_ID: &str = "TemperatureReadings";
const LAST_VALUE: &str = r#"{"Timestamp":"2017-01-11T22:23:23.430Z","Temperature":11.25}"#;

struct StaticAuthenticator;

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn login(&self) -> Result<TokenState, AuthError> {
        Ok(TokenState {
            access_token: "tok".to_string(),
            expiry: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

struct DeniedAuthenticator;

#[async_trait]
impl Authenticator for DeniedAuthenticator {
    async fn login(&self) -> Result<TokenState, AuthError> {
        Err(AuthError::Login {
            error: "access_denied".to_string(),
            description: None,
        })
    }
}

/// Login that never completes in test time, like a browser prompt left open
struct PendingAuthenticator;

#[async_trait]
impl Authenticator for PendingAuthenticator {
    async fn login(&self) -> Result<TokenState, AuthError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(AuthError::CallbackTimeout(Duration::from_secs(60)))
    }
}

fn client(server: &ServerGuard, authenticator: Arc<dyn Authenticator>) -> SdsClient {
    SdsClient::new(
        &server.url(),
        "v1",
        "tenant-1",
        "ns-1",
        Arc::new(TokenManager::new(authenticator)),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn path(suffix: &str) -> String {
    format!("{}{}", NAMESPACE, suffix)
}

/// Matches the path with or without a query string
fn path_with_query(suffix: &str) -> Matcher {
    Matcher::Regex(format!(r"^{}(\?.*)?$", regex::escape(&path(suffix))))
}

fn groups() -> Vec<StreamGroup> {
    let data = "\
StreamId,Timestamp,Temperature
s1,2017-01-11T22:21:23.430Z,10.5
s2,2017-01-11T22:22:23.430Z,20
s1,2017-01-11T22:23:23.430Z,11.25
";
    readings::group_by_stream(&readings::from_reader(data.as_bytes()).unwrap())
}

fn type_body() -> String {
    serde_json::to_string(&SdsType::temperature_readings(TYPE_ID)).unwrap()
}

fn stream_body(id: &str) -> String {
    serde_json::to_string(&SdsStream::new(id, TYPE_ID)).unwrap()
}

async fn respond(server: &mut ServerGuard, method: &str, suffix: &str, status: usize, body: &str) -> Mock {
    server
        .mock(method, path(suffix).as_str())
        .with_status(status)
        .with_body(body)
        .create_async()
        .await
}

#[tokio::test]
async fn test_requests_carry_bearer_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", path("/Types/TemperatureReadings").as_str())
        .match_header("authorization", "Bearer tok")
        .match_body(Matcher::PartialJson(json!({
            "Id": "TemperatureReadings",
            "SdsTypeCode": 1,
        })))
        .with_status(200)
        .with_body(type_body())
        .expect(1)
        .create_async()
        .await;

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let created = sds.get_or_create_type(&SdsType::temperature_readings(TYPE_ID)).await.unwrap();

    assert_eq!(created.id, TYPE_ID);
    assert_eq!(created.properties.len(), 2);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_status_mapping() {
    let mut server = Server::new_async().await;
    let _missing = respond(&mut server, "GET", "/Streams/missing", 404, "").await;
    let _broken = respond(&mut server, "GET", "/Types/broken", 500, "internal failure").await;

    let sds = client(&server, Arc::new(StaticAuthenticator));

    let err = sds.get_stream("missing").await.unwrap_err();
    assert!(err.is_not_found());

    match sds.get_type("broken").await.unwrap_err() {
        SdsError::Status { method, status, body, .. } => {
            assert_eq!(method, "GET");
            assert_eq!(status, 500);
            assert_eq!(body, "internal failure");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_last_value() {
    let mut server = Server::new_async().await;
    let _empty = respond(&mut server, "GET", "/Streams/empty/Data/Last", 204, "").await;
    let _s1 = respond(&mut server, "GET", "/Streams/s1/Data/Last", 200, LAST_VALUE).await;

    let sds = client(&server, Arc::new(StaticAuthenticator));

    assert!(sds.get_last_value("empty").await.unwrap().is_none());
    let last = sds.get_last_value("s1").await.unwrap().unwrap();
    assert_eq!(last.temperature, 11.25);
}

#[tokio::test]
async fn test_values_are_addressed_by_index() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", path_with_query("/Streams/s1/Data"))
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("index".into(), "2017-01-11T22:21:23.430Z".into()),
            Matcher::UrlEncoded("index".into(), "2017-01-11T22:23:23.430Z".into()),
        ]))
        .with_status(200)
        .with_body(format!("[{}, null]", LAST_VALUE))
        .expect(1)
        .create_async()
        .await;

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let indices = groups()[0].indices();
    let values = sds.get_values("s1", &indices).await.unwrap();

    assert_eq!(values.len(), 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_failed_login_sends_nothing() {
    let mut server = Server::new_async().await;
    let mock = server.mock("GET", Matcher::Any).expect(0).create_async().await;

    let sds = client(&server, Arc::new(DeniedAuthenticator));
    let err = sds.get_stream("s1").await.unwrap_err();

    assert!(
        matches!(err, SdsError::Auth(AuthError::AuthenticationRequired(_))),
        "unexpected error: {err:?}"
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_upload_creates_metadata_and_sends_values() {
    let mut server = Server::new_async().await;
    let mut mocks = Vec::new();

    mocks.push(
        server
            .mock("POST", path("/Types/TemperatureReadings").as_str())
            .with_body(type_body())
            .expect(1)
            .create_async()
            .await,
    );
    for stream in ["s1", "s2"] {
        mocks.push(
            server
                .mock("POST", path(&format!("/Streams/{}", stream)).as_str())
                .match_body(Matcher::PartialJson(json!({ "Id": stream, "TypeId": TYPE_ID })))
                .with_body(stream_body(stream))
                .expect(1)
                .create_async()
                .await,
        );
    }
    mocks.push(
        server
            .mock("POST", path("/Streams/s1/Data").as_str())
            .match_body(Matcher::Json(json!([
                { "Timestamp": "2017-01-11T22:21:23.430Z", "Temperature": 10.5 },
                { "Timestamp": "2017-01-11T22:23:23.430Z", "Temperature": 11.25 }
            ])))
            .expect(1)
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("POST", path("/Streams/s2/Data").as_str())
            .expect(1)
            .create_async()
            .await,
    );

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let summary = Runner::new(&sds, TYPE_ID, true)
        .run(&groups(), RunMode::Upload)
        .await
        .unwrap();

    assert_eq!(summary.streams, 2);
    assert_eq!(summary.values_sent, 3);
    for mock in mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_upload_failure_is_reported() {
    let mut server = Server::new_async().await;
    let _data = respond(&mut server, "POST", "/Streams/s1/Data", 503, "unavailable").await;

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let err = Runner::new(&sds, TYPE_ID, false)
        .run(&groups(), RunMode::Upload)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("503"), "error: {}", err);
}

/// Mocks for a test-mode run that creates metadata. Returns the delete mocks first.
async fn test_mode_server(delete_s1_status: usize, s1_after_delete_status: usize) -> (ServerGuard, Vec<Mock>, Vec<Mock>) {
    let mut server = Server::new_async().await;
    let mut deletes = Vec::new();
    let mut others = Vec::new();

    others.push(respond(&mut server, "POST", "/Types/TemperatureReadings", 200, &type_body()).await);
    for stream in ["s1", "s2"] {
        others.push(respond(&mut server, "POST", &format!("/Streams/{}", stream), 200, &stream_body(stream)).await);
        others.push(respond(&mut server, "POST", &format!("/Streams/{}/Data", stream), 200, "").await);
        others.push(respond(&mut server, "GET", &format!("/Streams/{}/Data/Last", stream), 200, LAST_VALUE).await);
    }

    for (suffix, status) in [
        ("/Streams/s1", delete_s1_status),
        ("/Streams/s2", 204),
        ("/Types/TemperatureReadings", 204),
    ] {
        deletes.push(
            server
                .mock("DELETE", path(suffix).as_str())
                .with_status(status)
                .expect(1)
                .create_async()
                .await,
        );
    }

    let s1_body = if s1_after_delete_status == 200 { stream_body("s1") } else { String::new() };
    others.push(respond(&mut server, "GET", "/Streams/s1", s1_after_delete_status, &s1_body).await);
    others.push(respond(&mut server, "GET", "/Streams/s2", 404, "").await);
    others.push(respond(&mut server, "GET", "/Types/TemperatureReadings", 404, "").await);

    (server, deletes, others)
}

#[tokio::test]
async fn test_test_mode_verifies_and_tears_down() {
    let (server, deletes, _others) = test_mode_server(204, 404).await;

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let summary = Runner::new(&sds, TYPE_ID, true)
        .run(&groups(), RunMode::Test)
        .await
        .unwrap();

    assert_eq!(summary.values_sent, 3);
    for mock in deletes {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_teardown_attempts_every_step_and_reports_all_errors() {
    let (server, deletes, _others) = test_mode_server(500, 200).await;

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let err = Runner::new(&sds, TYPE_ID, true)
        .run(&groups(), RunMode::Test)
        .await
        .unwrap_err();
    let message = err.to_string();

    assert!(message.starts_with("Encountered 2 error(s)"), "error: {}", message);
    assert!(message.contains("returned 500"), "error: {}", message);
    assert!(message.contains("stream s1 still exists after delete"), "error: {}", message);

    // Remaining deletes still ran
    for mock in deletes {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_test_mode_without_metadata_removes_values() {
    let mut server = Server::new_async().await;
    let mut others = Vec::new();
    let mut removes = Vec::new();

    for (stream, value) in [
        ("s1", LAST_VALUE),
        ("s2", r#"{"Timestamp":"2017-01-11T22:22:23.430Z","Temperature":20.0}"#),
    ] {
        others.push(respond(&mut server, "POST", &format!("/Streams/{}/Data", stream), 200, "").await);
        others.push(respond(&mut server, "GET", &format!("/Streams/{}/Data/Last", stream), 200, value).await);

        // Values are present until the remove call
        let reads = Arc::new(AtomicUsize::new(0));
        let body = format!("[{}]", value);
        others.push(
            server
                .mock("GET", path_with_query(&format!("/Streams/{}/Data", stream)))
                .match_query(Matcher::Regex("index=".into()))
                .with_body_from_request(move |_| {
                    if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                        body.clone().into_bytes()
                    } else {
                        b"[null]".to_vec()
                    }
                })
                .expect(2)
                .create_async()
                .await,
        );

        removes.push(
            server
                .mock("DELETE", path_with_query(&format!("/Streams/{}/Data", stream)))
                .match_query(Matcher::Regex("index=2017-01-11T22(%3A|:)2".into()))
                .with_status(204)
                .expect(1)
                .create_async()
                .await,
        );
    }

    let sds = client(&server, Arc::new(StaticAuthenticator));
    Runner::new(&sds, TYPE_ID, false)
        .run(&groups(), RunMode::Test)
        .await
        .unwrap();

    for mock in removes {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_values_left_behind_are_reported() {
    let mut server = Server::new_async().await;
    let mut mocks = Vec::new();

    for stream in ["s1", "s2"] {
        mocks.push(respond(&mut server, "POST", &format!("/Streams/{}/Data", stream), 200, "").await);
        mocks.push(respond(&mut server, "GET", &format!("/Streams/{}/Data/Last", stream), 200, LAST_VALUE).await);
        mocks.push(
            server
                .mock("GET", path_with_query(&format!("/Streams/{}/Data", stream)))
                .with_body(format!("[{}]", LAST_VALUE))
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("DELETE", path_with_query(&format!("/Streams/{}/Data", stream)))
                .with_status(204)
                .create_async()
                .await,
        );
    }

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let err = Runner::new(&sds, TYPE_ID, false)
        .run(&groups(), RunMode::Test)
        .await
        .unwrap_err();
    let message = err.to_string();

    assert!(message.starts_with("Encountered 2 error(s)"), "error: {}", message);
    assert!(message.contains("stream s1 still contains values"), "error: {}", message);
    assert!(message.contains("stream s2 still contains values"), "error: {}", message);
}

#[tokio::test]
async fn test_shutdown_interrupts_run() {
    let mut server = Server::new_async().await;
    let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

    let sds = client(&server, Arc::new(PendingAuthenticator));
    let shutdown = tokio::time::sleep(Duration::from_millis(100));

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        Runner::new(&sds, TYPE_ID, true).run_until(&groups(), RunMode::Test, shutdown),
    )
    .await
    .expect("run was not interrupted")
    .unwrap_err();

    assert_eq!(err.to_string(), "Run interrupted");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_run_until_completes_without_shutdown() {
    let mut server = Server::new_async().await;
    let _s1 = respond(&mut server, "POST", "/Streams/s1/Data", 200, "").await;
    let _s2 = respond(&mut server, "POST", "/Streams/s2/Data", 200, "").await;

    let sds = client(&server, Arc::new(StaticAuthenticator));
    let summary = Runner::new(&sds, TYPE_ID, false)
        .run_until(&groups(), RunMode::Upload, std::future::pending())
        .await
        .unwrap();

    assert_eq!(summary.values_sent, 3);
}
