use std::time::Duration;

use platformed_orchestrator::{
    ContentKind, ErrorKind, GenerationRequest, MediaProviderSettings, OrchestratorFactory,
    ProviderKind, RetryPolicy, Router, Settings, TextProviderSettings,
};
use serde_json::json;
use tracing_test::traced_test;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::providers::{completion_body, fast_polling, status_events};

/// Both providers pointed at one mock server, with short backoff.
fn router(server: &MockServer) -> Router {
    let mut text = TextProviderSettings::new("sk-test");
    text.base_url = server.uri();
    text.model = "deepseek-chat".to_string();
    text.limits.retry = RetryPolicy::text_default().with_initial_delay(Duration::from_millis(20));

    let mut media = MediaProviderSettings::new("fal-test");
    media.queue_url = server.uri();
    media.poll = fast_polling();
    media.limits.retry = RetryPolicy::media_default().with_initial_delay(Duration::from_millis(20));

    let settings = Settings {
        text: Some(text),
        media: Some(media),
        ..Settings::default()
    };
    OrchestratorFactory::create(&settings).expect("router should build")
}

async fn mount_image_job(server: &MockServer, job_id: &str) {
    Mock::given(method("POST"))
        .and(path("/fal-ai/flux/dev"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "request_id": job_id })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/fal-ai/flux/dev/requests/{job_id}/status/stream")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(status_events(&[
                    json!({ "status": "IN_PROGRESS" }),
                    json!({ "status": "COMPLETED" }),
                ])),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/fal-ai/flux/dev/requests/{job_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "images": [{
                "url": format!("https://fal.media/files/{job_id}.png"),
                "content_type": "image/png"
            }]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
#[traced_test]
async fn test_throttled_twice_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "Rate limit reached", "type": "rate_limit_error" }
        })))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("cmpl-7", "The brave rabbit crossed the river."))
                .insert_header("x-ratelimit-remaining-requests", "5"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let router = router(&server);
    let result = router
        .dispatch(
            GenerationRequest::text("Write a story about a brave rabbit")
                .with_request_id("story-1")
                .with_timeout(Duration::from_secs(10)),
        )
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.request_id, "story-1");
    assert_eq!(result.text(), Some("The brave rabbit crossed the river."));
    assert_eq!(result.metadata.attempts, 3);
    assert_eq!(result.metadata.provider, "OpenAI");
    assert_eq!(result.metadata.provider_id.as_deref(), Some("cmpl-7"));
    assert_eq!(result.metadata.usage.as_ref().map(|u| u.output_tokens), Some(40));

    let delays = &result.metadata.retry_delays;
    assert_eq!(delays.len(), 2);
    assert!(delays[0] < delays[1], "{delays:?}");

    let remaining = router
        .coordinator()
        .remaining_budget(ProviderKind::TextCompletion)
        .unwrap();
    assert!(remaining <= 5);
    assert!(logs_contain("retrying after transient error"));
}

#[tokio::test]
async fn test_throttle_headers_on_error_drain_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-ratelimit-remaining-requests", "0")
                .insert_header("x-ratelimit-reset-requests", "60s")
                .set_body_json(json!({
                    "error": { "message": "Rate limit reached", "type": "rate_limit_error" }
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let router = router(&server);
    let result = router
        .dispatch(GenerationRequest::text("hi").with_timeout(Duration::from_secs(1)))
        .await;

    assert!(!result.is_success());
    assert_eq!(
        router
            .coordinator()
            .remaining_budget(ProviderKind::TextCompletion),
        Some(0)
    );
}

#[tokio::test]
async fn test_oversized_retry_after_ends_in_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "1e20")
                .insert_header("x-ratelimit-reset", "99999999999999999999999s"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let router = router(&server);
    let dispatched = tokio::spawn(async move {
        router
            .dispatch(GenerationRequest::text("hi").with_timeout(Duration::from_secs(5)))
            .await
    });

    let result = dispatched.await.expect("dispatch should not panic");
    assert_eq!(result.error_kind(), Some(ErrorKind::TransientProviderError));
    assert_eq!(result.metadata.attempts, 1);
}

#[tokio::test]
async fn test_image_submission_retried_once_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fal-ai/flux/dev"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "detail": "overloaded" })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_image_job(&server, "req-retry").await;

    let result = router(&server)
        .dispatch(GenerationRequest::media("a lighthouse at dusk").with_timeout(Duration::from_secs(10)))
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.metadata.attempts, 2);
    assert_eq!(result.metadata.retry_delays.len(), 1);
    assert_eq!(result.metadata.provider_id.as_deref(), Some("req-retry"));

    let submissions = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.method == wiremock::http::Method::POST)
        .count();
    assert_eq!(submissions, 2);
}

#[tokio::test]
async fn test_image_job_end_to_end() {
    let server = MockServer::start().await;
    mount_image_job(&server, "req-fox").await;

    let result = router(&server)
        .dispatch(
            GenerationRequest::media("a fox reading under a tree")
                .with_parameter("image_size", "landscape_4_3")
                .with_timeout(Duration::from_secs(10)),
        )
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.kind, Some(ContentKind::Image));
    assert_eq!(result.remote_url(), Some("https://fal.media/files/req-fox.png"));
    assert_eq!(result.metadata.provider, "fal");
    assert_eq!(result.metadata.provider_id.as_deref(), Some("req-fox"));
}

#[tokio::test]
async fn test_invalid_request_makes_no_provider_calls() {
    let server = MockServer::start().await;
    let router = router(&server);

    let result = router
        .dispatch(GenerationRequest::media("a fox").with_parameter("num_inference_steps", 500))
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::ValidationError));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_provider_hits_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("cmpl-slow", "late"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let result = router(&server)
        .dispatch(GenerationRequest::text("hi").with_timeout(Duration::from_secs(2)))
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::JobTimeout));
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(2500), "{elapsed:?}");
}

#[tokio::test]
async fn test_story_with_illustrations() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("cmpl-1", "Scene one.")))
        .mount(&server)
        .await;
    mount_image_job(&server, "req-scene").await;

    let router = router(&server);
    let results = router
        .dispatch_all(vec![
            GenerationRequest::text("Write scene one").with_request_id("text"),
            GenerationRequest::media("Illustrate scene one").with_request_id("image"),
        ])
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].request_id, "text");
    assert_eq!(results[0].kind, Some(ContentKind::Text));
    assert_eq!(results[1].request_id, "image");
    assert_eq!(results[1].kind, Some(ContentKind::Image));
}
