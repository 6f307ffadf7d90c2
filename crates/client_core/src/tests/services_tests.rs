use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;

#[derive(Clone)]
struct ServiceState {
    status: StatusCode,
    reply: Value,
    seen: Arc<Mutex<Vec<(HashMap<String, String>, Value)>>>,
}

async fn handle_call(
    State(state): State<ServiceState>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.seen.lock().await.push((query, body));
    (state.status, Json(state.reply.clone()))
}

async fn spawn_service(status: StatusCode, reply: Value) -> Result<(String, ServiceState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServiceState {
        status,
        reply,
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/call", post(handle_call))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/call"), state))
}

fn speech_config() -> SpeechConfig {
    SpeechConfig {
        encoding: "WEBM_OPUS".into(),
        sample_rate_hertz: 48_000,
        language_code: "en-US".into(),
    }
}

#[tokio::test]
async fn translator_posts_text_and_target_with_key() {
    let (url, state) = spawn_service(
        StatusCode::OK,
        json!({ "data": { "translations": [{ "translatedText": "hola mundo" }] } }),
    )
    .await
    .expect("spawn server");

    let translator = HttpTranslator::new(url, "secret-key");
    let translated = translator
        .translate("hello world", "es")
        .await
        .expect("translate");
    assert_eq!(translated, "hola mundo");

    let seen = state.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.get("key").map(String::as_str), Some("secret-key"));
    assert_eq!(seen[0].1, json!({ "q": "hello world", "target": "es" }));
}

#[tokio::test]
async fn translator_surfaces_http_status() {
    let (url, _) = spawn_service(StatusCode::FORBIDDEN, json!({ "error": "denied" }))
        .await
        .expect("spawn server");
    let err = HttpTranslator::new(url, "k")
        .translate("hi", "de")
        .await
        .expect_err("forbidden");
    assert!(matches!(err, ServiceError::Status { status: 403, .. }));
}

#[tokio::test]
async fn translator_rejects_unexpected_shapes() {
    let (url, _) = spawn_service(StatusCode::OK, json!({ "data": { "translations": [] } }))
        .await
        .expect("spawn server");
    let err = HttpTranslator::new(&url, "k")
        .translate("hi", "de")
        .await
        .expect_err("empty list");
    assert!(matches!(err, ServiceError::Malformed { .. }));

    let (url, _) = spawn_service(StatusCode::OK, json!({ "unexpected": true }))
        .await
        .expect("spawn server");
    let err = HttpTranslator::new(&url, "k")
        .translate("hi", "de")
        .await
        .expect_err("wrong shape");
    assert!(matches!(err, ServiceError::Malformed { .. }));
}

#[tokio::test]
async fn speech_sends_fixed_config_and_base64_audio() {
    let (url, state) = spawn_service(
        StatusCode::OK,
        json!({ "results": [
            { "alternatives": [{ "transcript": "meet at noon" }, { "transcript": "meat at noon" }] },
            { "alternatives": [{ "transcript": " by the lake " }] }
        ] }),
    )
    .await
    .expect("spawn server");

    let transcript = HttpSpeechToText::new(url, "speech-key")
        .transcribe(b"abc", &speech_config())
        .await
        .expect("transcribe");
    assert_eq!(transcript.as_deref(), Some("meet at noon by the lake"));

    let seen = state.seen.lock().await;
    assert_eq!(seen[0].0.get("key").map(String::as_str), Some("speech-key"));
    assert_eq!(
        seen[0].1,
        json!({
            "config": { "encoding": "WEBM_OPUS", "sampleRateHertz": 48000, "languageCode": "en-US" },
            "audio": { "content": "YWJj" }
        })
    );
}

#[tokio::test]
async fn speech_without_results_is_none() {
    let (url, _) = spawn_service(StatusCode::OK, json!({}))
        .await
        .expect("spawn server");
    let transcript = HttpSpeechToText::new(url, "k")
        .transcribe(b"silence", &speech_config())
        .await
        .expect("transcribe");
    assert_eq!(transcript, None);
}

#[tokio::test]
async fn unreachable_service_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = HttpTranslator::new(format!("http://{addr}/call"), "k")
        .translate("hi", "fr")
        .await
        .expect_err("closed port");
    assert!(matches!(err, ServiceError::Transport { .. }));
}

#[tokio::test]
async fn missing_credentials_never_call_out() {
    let err = MissingTranslator
        .translate("hi", "fr")
        .await
        .expect_err("no key");
    assert!(matches!(err, ServiceError::MissingCredential { .. }));

    let err = MissingSpeechToText
        .transcribe(b"x", &speech_config())
        .await
        .expect_err("no key");
    assert!(matches!(err, ServiceError::MissingCredential { .. }));
}
