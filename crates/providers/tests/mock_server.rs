//! Adapters against a local HTTP server speaking each provider's wire format.

use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chatminds_core::error::ProviderError;
use chatminds_core::message::ChatMessage;
use chatminds_core::provider::{GenerationParams, Provider, ProviderRequest};
use chatminds_providers::{GeminiProvider, OpenAiCompatProvider};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn sse(frames: Vec<&'static str>) -> Response {
    let stream = futures::stream::iter(
        frames
            .into_iter()
            .map(|f| Ok::<_, std::io::Error>(Bytes::from_static(f.as_bytes()))),
    );
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn request(model: &str) -> ProviderRequest {
    ProviderRequest::new(
        model,
        vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Hello"),
        ],
        GenerationParams::default(),
    )
}

async fn collect(provider: &dyn Provider, model: &str) -> (String, Option<ProviderError>, bool) {
    let mut rx = provider.stream(request(model)).await.unwrap();
    let mut text = String::new();
    let mut done = false;
    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => {
                if let Some(c) = chunk.content {
                    text.push_str(&c);
                }
                done |= chunk.done;
            }
            Err(e) => return (text, Some(e), done),
        }
    }
    (text, None, done)
}

#[tokio::test]
async fn openai_stream_concatenates_until_done() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            sse(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                // Frame split mid-line
                "data: {\"choices\":[{\"delta\":{\"con",
                "tent\":\"lo\"}}]}\n\n",
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
                "data: [DONE]\n\n",
            ])
        }),
    );
    let base = serve(app).await;
    let provider = OpenAiCompatProvider::new("openai", format!("{base}/v1"), "sk-test").unwrap();

    let (text, err, done) = collect(&provider, "gpt-4o").await;
    assert_eq!(text, "Hello");
    assert!(err.is_none());
    assert!(done);
}

#[tokio::test]
async fn openai_stream_without_done_is_interrupted() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { sse(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n\n"]) }),
    );
    let base = serve(app).await;
    let provider = OpenAiCompatProvider::new("openai", format!("{base}/v1"), "sk-test").unwrap();

    let (text, err, _) = collect(&provider, "gpt-4o").await;
    assert_eq!(text, "part");
    assert!(matches!(err, Some(ProviderError::StreamInterrupted(_))));
}

#[tokio::test]
async fn openai_unterminated_done_line_ends_cleanly() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            sse(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"whole\"}}]}\n\n",
                "data: [DONE]",
            ])
        }),
    );
    let base = serve(app).await;
    let provider = OpenAiCompatProvider::new("openai", format!("{base}/v1"), "sk-test").unwrap();

    let (text, err, done) = collect(&provider, "gpt-4o").await;
    assert_eq!(text, "whole");
    assert!(err.is_none());
    assert!(done);
}

#[tokio::test]
async fn openai_stream_with_finish_reason_but_no_done_ends_cleanly() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            sse(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"fin\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            ])
        }),
    );
    let base = serve(app).await;
    let provider = OpenAiCompatProvider::new("openai", format!("{base}/v1"), "sk-test").unwrap();

    let (text, err, done) = collect(&provider, "gpt-4o").await;
    assert_eq!(text, "fin");
    assert!(err.is_none());
    assert!(done);
}

#[tokio::test]
async fn openai_complete_maps_rate_limit() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "7")],
                "slow down",
            )
        }),
    );
    let base = serve(app).await;
    let provider = OpenAiCompatProvider::new("openai", format!("{base}/v1"), "sk-test").unwrap();

    let err = provider.complete(request("gpt-4o")).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { retry_after_secs: 7 }));
}

#[tokio::test]
async fn openai_complete_parses_choice() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["messages"][0]["role"], "system");
            assert_eq!(body["max_tokens"], 1000);
            Json(serde_json::json!({
                "model": "gpt-4o",
                "choices": [{"message": {"role": "assistant", "content": "Hi!"}}]
            }))
        }),
    );
    let base = serve(app).await;
    let provider = OpenAiCompatProvider::new("openai", format!("{base}/v1"), "sk-test").unwrap();

    let response = provider.complete(request("gpt-4o")).await.unwrap();
    assert_eq!(response.message.content, "Hi!");
}

type Captured = Arc<Mutex<Vec<(String, Option<String>, serde_json::Value)>>>;

async fn gemini_handler(
    State(captured): State<Captured>,
    Path(target): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let key = headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    captured.lock().unwrap().push((target.clone(), key, body));

    if target.ends_with(":streamGenerateContent") {
        sse(vec![
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"echo: \"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hello\"}]}}],",
            "\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":3,\"totalTokenCount\":7}}\r\n\r\n",
        ])
    } else {
        Json(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "echo: Hello"}]}}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 3, "totalTokenCount": 7}
        }))
        .into_response()
    }
}

#[tokio::test]
async fn gemini_complete_and_stream_agree() {
    let captured: Captured = Arc::default();
    let app = Router::new()
        .route("/v1beta/models/{target}", post(gemini_handler))
        .with_state(captured.clone());
    let base = serve(app).await;
    let provider = GeminiProvider::new("gm-key").unwrap().with_base_url(&base);

    let one_shot = provider.complete(request("gemini-2.0-flash")).await.unwrap();
    assert_eq!(one_shot.message.content, "echo: Hello");
    assert_eq!(one_shot.usage.unwrap().total_tokens, 7);

    let (streamed, err, done) = collect(&provider, "gemini-2.0-flash").await;
    assert!(err.is_none());
    assert!(done);
    assert_eq!(streamed, one_shot.message.content);

    let calls = captured.lock().unwrap();
    assert_eq!(calls[0].0, "gemini-2.0-flash:generateContent");
    assert_eq!(calls[1].0, "gemini-2.0-flash:streamGenerateContent");
    assert_eq!(calls[0].1.as_deref(), Some("gm-key"));

    let contents = &calls[0].2["contents"];
    assert_eq!(contents.as_array().unwrap().len(), 1);
    assert_eq!(contents[0]["role"], "user");
    assert_eq!(contents[0]["parts"][0]["text"], "SYSTEM: You are a helpful assistant.");
    assert_eq!(contents[0]["parts"][1]["text"], "Hello");
    assert_eq!(calls[0].2["generationConfig"]["maxOutputTokens"], 1000);
}

#[tokio::test]
async fn gemini_invalid_key_is_auth_failure() {
    let app = Router::new().route(
        "/v1beta/models/{target}",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                r#"{"error":{"code":400,"status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#,
            )
        }),
    );
    let base = serve(app).await;
    let provider = GeminiProvider::new("bad").unwrap().with_base_url(&base);

    let err = provider.complete(request("gemini-2.0-flash")).await.unwrap_err();
    assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
}
