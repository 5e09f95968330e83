use std::time::Duration;

use platformed_orchestrator::{
    CompletionProvider, ErrorKind, OpenAIProvider, Parameters, RateLimitSnapshot,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::completion_body;

fn provider(server: &MockServer) -> OpenAIProvider {
    OpenAIProvider::new_with_base_url("test-api-key".to_string(), server.uri())
        .expect("Failed to create OpenAI provider")
        .with_model("deepseek-chat")
        .with_name("Deepseek")
}

fn params(value: serde_json::Value) -> Parameters {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn test_completion_payload_and_rate_limit_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-api-key"))
        .and(body_json(json!({
            "model": "deepseek-chat",
            "messages": [
                { "role": "system", "content": "You are a children's story writer." },
                { "role": "user", "content": "Write a story about a brave rabbit" }
            ],
            "temperature": 0.7,
            "max_tokens": 100,
            "stream": false
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("cmpl-42", "Once upon a time..."))
                .insert_header("x-ratelimit-remaining-requests", "7")
                .insert_header("x-ratelimit-reset-requests", "6s"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let raw = provider(&server)
        .complete(
            "Write a story about a brave rabbit",
            &params(json!({
                "system": "You are a children's story writer.",
                "temperature": 0.7,
                "max_tokens": 100
            })),
            Duration::from_secs(5),
        )
        .await
        .expect("completion should succeed");

    assert_eq!(raw.provider, "Deepseek");
    assert_eq!(raw.provider_id.as_deref(), Some("cmpl-42"));
    assert_eq!(
        raw.rate_limit,
        Some(RateLimitSnapshot {
            remaining: Some(7),
            reset_after: Some(Duration::from_secs(6)),
        })
    );
}

#[tokio::test]
async fn test_throttling_is_transient_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "2")
                .insert_header("x-ratelimit-remaining-requests", "0")
                .insert_header("x-ratelimit-reset-requests", "1m0s")
                .set_body_json(json!({
                    "error": { "message": "Rate limit reached", "type": "rate_limit_error" }
                })),
        )
        .mount(&server)
        .await;

    let err = provider(&server)
        .complete("hi", &Parameters::new(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransientProviderError);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    assert_eq!(
        err.rate_limit(),
        Some(RateLimitSnapshot {
            remaining: Some(0),
            reset_after: Some(Duration::from_secs(60)),
        })
    );
    assert!(err.to_string().contains("Rate limit reached (rate_limit_error)"));
}

#[tokio::test]
async fn test_auth_failure_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {
                "message": "Authentication Fails, Your api key is invalid",
                "type": "authentication_error",
                "code": "invalid_request_error"
            }
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .complete("hi", &Parameters::new(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermanentProviderError);
    assert!(err.to_string().contains("HTTP 401"));
    assert!(err.to_string().contains("Your api key is invalid"));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .complete("hi", &Parameters::new(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert!(err.to_string().contains("upstream overloaded"));
}

#[tokio::test]
async fn test_slow_response_times_out_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("cmpl-slow", "late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = provider(&server)
        .complete("hi", &Parameters::new(), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(err.is_transient(), "{err}");
}
