use gen_core::llm::{GenError, GenOpts, TextGenerator};
use mockito::Matcher;
use providers::kobold::{CancelFailure, Dialect, KoboldClient, KoboldConfig};
use serde_json::json;
use std::io::Write;
use std::time::Duration;

fn client_for(url: &str) -> KoboldClient {
    KoboldClient::new(KoboldConfig::new(format!("{}/api", url))).unwrap()
}

#[tokio::test]
async fn agenerate_posts_prompt_and_strips_stop() {
    let mut server = mockito::Server::new_async().await;
    let m = server
        .mock("POST", "/api/v1/generate")
        .match_body(Matcher::PartialJson(json!({
            "prompt": "Say hi",
            "max_length": 80,
            "stop_sequence": ["world."],
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"results":[{"text":"Hello world.   "}]}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let opts = GenOpts::default().with_stop(["world."]);
    let out = client.agenerate("Say hi", &opts).await.unwrap();
    assert_eq!(out, "Hello");
    m.assert_async().await;
}

#[tokio::test]
async fn agenerate_surfaces_malformed_payload() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/api/v1/generate")
        .with_status(200)
        .with_body(r#"{"detail":"busy"}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let err = client.agenerate("x", &GenOpts::default()).await.unwrap_err();
    assert!(matches!(err, GenError::MalformedResponse { .. }));
    assert_eq!(err.payload(), Some(r#"{"detail":"busy"}"#));
}

#[tokio::test]
async fn agenerate_non_success_is_transport() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/api/v1/generate")
        .with_status(503)
        .with_body("server busy")
        .create_async()
        .await;

    let client = client_for(&server.url());
    let err = client.agenerate("x", &GenOpts::default()).await.unwrap_err();
    match err {
        GenError::Transport(msg) => assert!(msg.starts_with("503")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn agenerate_connection_refused_is_transport() {
    let client = KoboldClient::new(KoboldConfig::new("http://127.0.0.1:1")).unwrap();
    let err = client.agenerate("x", &GenOpts::default()).await.unwrap_err();
    assert!(matches!(err, GenError::Transport(_)));
}

#[tokio::test]
async fn probe_prefers_extended_dialect() {
    let mut server = mockito::Server::new_async().await;
    let extra = server
        .mock("GET", "/api/extra/version")
        .with_status(200)
        .with_body(r#"{"version":"1.2"}"#)
        .create_async()
        .await;
    let v1 = server
        .mock("GET", "/api/v1/version")
        .with_status(200)
        .with_body(r#"{"result":"1.2.4"}"#)
        .expect(0)
        .create_async()
        .await;

    let client = client_for(&server.url());
    assert_eq!(client.check_version_async().await.unwrap(), 1.2);
    assert_eq!(client.dialect(), Dialect::Extended);
    extra.assert_async().await;
    v1.assert_async().await;
}

#[tokio::test]
async fn probe_falls_back_to_basic_dialect() {
    let mut server = mockito::Server::new_async().await;
    let _extra = server
        .mock("GET", "/api/extra/version")
        .with_status(404)
        .create_async()
        .await;
    let _v1 = server
        .mock("GET", "/api/v1/version")
        .with_status(200)
        .with_body(r#"{"result":"1.2.4"}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    client.set_dialect(Dialect::Extended);
    assert_eq!(client.check_version_async().await.unwrap(), 0.0);
    assert_eq!(client.dialect(), Dialect::Basic);
}

#[tokio::test]
async fn probe_without_any_dialect_is_unavailable() {
    let mut server = mockito::Server::new_async().await;
    let _extra = server
        .mock("GET", "/api/extra/version")
        .with_status(404)
        .create_async()
        .await;
    let _v1 = server
        .mock("GET", "/api/v1/version")
        .with_status(500)
        .create_async()
        .await;

    let client = client_for(&server.url());
    let err = client.check_version_async().await.unwrap_err();
    assert!(matches!(err, GenError::EndpointUnavailable(_)));
    assert_eq!(client.dialect(), Dialect::Basic);
}

#[tokio::test]
async fn extended_generation_sends_registered_genkey_and_abort_uses_it() {
    let mut server = mockito::Server::new_async().await;
    let _extra = server
        .mock("GET", "/api/extra/version")
        .with_status(200)
        .with_body(r#"{"result":"KoboldCpp","version":"1.45"}"#)
        .create_async()
        .await;
    let generate = server
        .mock("POST", "/api/v1/generate")
        .match_body(Matcher::Regex(r#""genkey":"[A-Z0-9]{10}""#.to_string()))
        .with_status(200)
        .with_body(r#"{"results":[{"text":"ok"}]}"#)
        .expect(2)
        .create_async()
        .await;

    let client = client_for(&server.url());
    client.check_version_async().await.unwrap();

    let opts = GenOpts::default().with_channel("chan-1");
    client.agenerate("one", &opts).await.unwrap();
    let first = client.genkeys().get("chan-1").unwrap();
    client.agenerate("two", &opts).await.unwrap();
    let second = client.genkeys().get("chan-1").unwrap();
    assert_ne!(first, second);
    assert_eq!(client.genkeys().len(), 1);
    generate.assert_async().await;

    let abort = server
        .mock("POST", "/api/extra/abort")
        .match_body(Matcher::Json(json!({ "genkey": second })))
        .with_status(200)
        .with_body(r#"{"success":true}"#)
        .create_async()
        .await;
    assert!(client.abort("chan-1").await.is_ok());
    abort.assert_async().await;
}

#[tokio::test]
async fn abort_without_key_sends_nothing() {
    let mut server = mockito::Server::new_async().await;
    let abort = server
        .mock("POST", "/api/extra/abort")
        .expect(0)
        .create_async()
        .await;

    let client = client_for(&server.url());
    client.set_dialect(Dialect::Extended);
    let res = client.abort("never-used").await;
    assert!(matches!(res, Err(CancelFailure::NoGenKey(_))));
    abort.assert_async().await;
}

#[tokio::test]
async fn abort_rejection_is_reported() {
    let mut server = mockito::Server::new_async().await;
    let _abort = server
        .mock("POST", "/api/extra/abort")
        .with_status(200)
        .with_body(r#"{"success":false}"#)
        .create_async()
        .await;

    let client = client_for(&server.url());
    client.set_dialect(Dialect::Extended);
    client.genkeys().insert("c", "ABCDEFGHIJ".into());
    assert!(matches!(
        client.abort("c").await,
        Err(CancelFailure::Rejected(_))
    ));
}

#[tokio::test]
async fn abort_in_basic_dialect_is_unsupported() {
    let client = KoboldClient::new(KoboldConfig::new("http://127.0.0.1:1")).unwrap();
    client.genkeys().insert("c", "ABCDEFGHIJ".into());
    assert!(matches!(
        client.abort("c").await,
        Err(CancelFailure::Unsupported)
    ));
}

#[tokio::test]
async fn agenerate_honours_configured_timeout() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/api/v1/generate")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(Duration::from_secs(3));
            w.write_all(br#"{"results":[{"text":"late"}]}"#)
        })
        .create_async()
        .await;

    let mut cfg = KoboldConfig::new(server.url());
    cfg.timeout = Some(Duration::from_millis(300));
    let client = KoboldClient::new(cfg).unwrap();
    assert!(matches!(
        client.agenerate("x", &GenOpts::default()).await,
        Err(GenError::Transport(_))
    ));
}

// Blocking mode runs without a tokio runtime on the test thread.

#[test]
fn generate_blocking_matches_async_semantics() {
    let mut server = mockito::Server::new();
    let m = server
        .mock("POST", "/api/v1/generate")
        .match_body(Matcher::PartialJson(json!({ "prompt": "Say hi" })))
        .with_status(200)
        .with_body(r#"{"results":[{"text":"  Hi there.\nUser:"}]}"#)
        .create();

    let client = client_for(&server.url());
    let opts = GenOpts::default().with_stop(["\nUser:", "there."]);
    assert_eq!(client.generate("Say hi", &opts).unwrap(), "Hi there.");
    m.assert();
}

#[test]
fn generate_blocking_malformed() {
    let mut server = mockito::Server::new();
    let _m = server
        .mock("POST", "/api/v1/generate")
        .with_status(200)
        .with_body(r#"{"results":[]}"#)
        .create();

    let client = client_for(&server.url());
    let err = client.generate("x", &GenOpts::default()).unwrap_err();
    assert_eq!(err.payload(), Some(r#"{"results":[]}"#));
}

#[test]
fn check_version_blocking_extended_then_abort_blocking() {
    let mut server = mockito::Server::new();
    let _extra = server
        .mock("GET", "/api/extra/version")
        .with_status(200)
        .with_body(r#"{"version":1.3}"#)
        .create();
    let _gen = server
        .mock("POST", "/api/v1/generate")
        .with_status(200)
        .with_body(r#"{"results":[{"text":"x"}]}"#)
        .create();
    let abort = server
        .mock("POST", "/api/extra/abort")
        .with_status(200)
        .with_body(r#"{"success":true}"#)
        .create();

    let client = client_for(&server.url());
    assert_eq!(client.check_version().unwrap(), 1.3);
    client
        .generate("x", &GenOpts::default().with_channel("c"))
        .unwrap();
    assert!(client.abort_blocking("c").is_ok());
    abort.assert();
}

#[test]
fn check_version_blocking_falls_back_to_basic() {
    let mut server = mockito::Server::new();
    let _extra = server
        .mock("GET", "/api/extra/version")
        .with_status(404)
        .create();
    let _v1 = server
        .mock("GET", "/api/v1/version")
        .with_status(200)
        .with_body(r#"{"result":"1.2.4"}"#)
        .create();

    let client = client_for(&server.url());
    client.set_dialect(Dialect::Extended);
    assert_eq!(client.check_version().unwrap(), 0.0);
    assert_eq!(client.dialect(), Dialect::Basic);
}

fn slow_generate(server: &mut mockito::Server, delay: Duration) -> mockito::Mock {
    server
        .mock("POST", "/api/v1/generate")
        .with_status(200)
        .with_chunked_body(move |w| {
            std::thread::sleep(delay);
            w.write_all(br#"{"results":[{"text":"slow but done"}]}"#)
        })
        .create()
}

// Long CPU generations must not hit a timeout the async mode does not have.
#[test]
fn generate_blocking_waits_past_thirty_seconds_without_timeout() {
    let mut server = mockito::Server::new();
    let m = slow_generate(&mut server, Duration::from_secs(32));

    let client = client_for(&server.url());
    assert_eq!(client.config().timeout, None);
    assert_eq!(
        client.generate("x", &GenOpts::default()).unwrap(),
        "slow but done"
    );
    m.assert();
}

#[test]
fn generate_blocking_honours_configured_timeout() {
    let mut server = mockito::Server::new();
    let _m = slow_generate(&mut server, Duration::from_secs(3));

    let mut cfg = KoboldConfig::new(server.url());
    cfg.timeout = Some(Duration::from_millis(300));
    let client = KoboldClient::new(cfg).unwrap();
    assert!(matches!(
        client.generate("x", &GenOpts::default()),
        Err(GenError::Transport(_))
    ));
}

#[test]
fn check_version_blocking_unavailable() {
    let server = mockito::Server::new();
    let client = client_for(&server.url());
    assert!(matches!(
        client.check_version(),
        Err(GenError::EndpointUnavailable(_))
    ));
}
