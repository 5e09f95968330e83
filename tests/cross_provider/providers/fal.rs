use std::time::Duration;

use platformed_orchestrator::{ErrorKind, FalProvider, JobProvider, JobState, Parameters, RawPayload};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::{fast_polling, status_events};

const MODEL_PATH: &str = "/fal-ai/flux/dev";
const JOB_PATH: &str = "/fal-ai/flux/dev/requests/req-123";

fn provider(server: &MockServer) -> FalProvider {
    FalProvider::new_with_base_url("fal-test-key".to_string(), server.uri())
        .expect("Failed to create fal provider")
        .with_poll_schedule(fast_polling())
}

async fn mount_submission(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .and(header("authorization", "Key fal-test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "request_id": "req-123" })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_result(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(JOB_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "images": [{
                "url": "https://fal.media/files/fox/reading.png",
                "content_type": "image/png",
                "width": 1024,
                "height": 768
            }],
            "seed": 42
        })))
        .mount(server)
        .await;
}

fn image_url(payload: &RawPayload) -> Option<&str> {
    match payload {
        RawPayload::Json(body) => body.pointer("/images/0/url").and_then(|v| v.as_str()),
        RawPayload::Bytes { .. } => None,
    }
}

#[tokio::test]
async fn test_submission_body_includes_prompt_and_options() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fal-ai/flux/schnell"))
        .and(body_json(json!({
            "prompt": "a fox reading under a tree",
            "image_size": "landscape_4_3",
            "num_inference_steps": 4
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "request_id": "req-9" })))
        .expect(1)
        .mount(&server)
        .await;

    let parameters: Parameters = serde_json::from_value(json!({
        "model": "fal-ai/flux/schnell",
        "image_size": "landscape_4_3",
        "num_inference_steps": 4
    }))
    .unwrap();

    let provider = provider(&server);
    let handle = provider
        .submit("a fox reading under a tree", &parameters)
        .await
        .unwrap();

    assert_eq!(handle.job_id(), "req-9");
    assert_eq!(handle.state(), JobState::Submitted);
    assert_eq!(provider.active_jobs(), 1);
    assert_eq!(provider.job_state("req-9"), Some(JobState::Submitted));
}

#[tokio::test]
async fn test_status_stream_completes_job() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status/stream")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(status_events(&[
                    json!({ "status": "IN_QUEUE", "queue_position": 2 }),
                    json!({ "status": "IN_PROGRESS", "logs": [{ "message": "step 1/28" }] }),
                    json!({ "status": "COMPLETED" }),
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "COMPLETED" })))
        .expect(0)
        .mount(&server)
        .await;
    mount_result(&server).await;

    let provider = provider(&server);
    let handle = provider.submit("a fox", &Parameters::new()).await.unwrap();
    let raw = provider
        .await_completion(&handle, Duration::from_secs(5))
        .await
        .expect("job should complete");

    assert_eq!(raw.provider_id.as_deref(), Some("req-123"));
    assert_eq!(image_url(&raw.payload), Some("https://fal.media/files/fox/reading.png"));
    assert_eq!(handle.state(), JobState::Completed);
    assert_eq!(provider.active_jobs(), 0);
}

#[tokio::test]
async fn test_dropped_stream_falls_back_to_polling_same_job() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    // The stream closes after a progress event, before any terminal status.
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status/stream")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(status_events(&[json!({ "status": "IN_PROGRESS" })])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "status": "IN_PROGRESS" })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "COMPLETED" })))
        .mount(&server)
        .await;
    mount_result(&server).await;

    let provider = provider(&server);
    let handle = provider.submit("a fox", &Parameters::new()).await.unwrap();
    let mut states = handle.subscribe();

    let raw = provider
        .await_completion(&handle, Duration::from_secs(5))
        .await
        .expect("polling should finish the job");

    assert_eq!(raw.provider_id.as_deref(), Some("req-123"));
    assert_eq!(*states.borrow_and_update(), JobState::Completed);

    let polls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == format!("{JOB_PATH}/status"))
        .count();
    assert_eq!(polls, 3);
    // `mount_submission` expects one POST; checked when the server drops.
}

#[tokio::test]
async fn test_unavailable_stream_falls_back_to_polling() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status/stream")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "detail": "Not Found" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "COMPLETED" })))
        .expect(1)
        .mount(&server)
        .await;
    mount_result(&server).await;

    let provider = provider(&server);
    let handle = provider.submit("a fox", &Parameters::new()).await.unwrap();
    let raw = provider
        .await_completion(&handle, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(image_url(&raw.payload).is_some());
    assert_eq!(handle.state(), JobState::Completed);
}

#[tokio::test]
async fn test_transient_poll_errors_are_tolerated() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "COMPLETED" })))
        .mount(&server)
        .await;
    mount_result(&server).await;

    let provider = provider(&server).with_status_stream(false);
    let handle = provider.submit("a fox", &Parameters::new()).await.unwrap();
    assert!(provider
        .await_completion(&handle, Duration::from_secs(5))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_failed_job_is_permanent() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "FAILED",
            "error": "NSFW content detected"
        })))
        .mount(&server)
        .await;

    let provider = provider(&server).with_status_stream(false);
    let handle = provider.submit("a fox", &Parameters::new()).await.unwrap();
    let err = provider
        .await_completion(&handle, Duration::from_secs(5))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermanentProviderError);
    assert!(err.to_string().contains("NSFW content detected"));
    assert_eq!(handle.state(), JobState::Failed);
    assert_eq!(provider.active_jobs(), 0);
}

#[tokio::test]
async fn test_deadline_marks_job_timed_out() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("{JOB_PATH}/status")))
        .respond_with(
            ResponseTemplate::new(202).set_body_json(json!({ "status": "IN_QUEUE", "queue_position": 5 })),
        )
        .mount(&server)
        .await;

    let provider = provider(&server).with_status_stream(false);
    let handle = provider.submit("a fox", &Parameters::new()).await.unwrap();

    let started = std::time::Instant::now();
    let err = provider
        .await_completion(&handle, Duration::from_millis(300))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::JobTimeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.state(), JobState::TimedOut);
    assert_eq!(provider.active_jobs(), 0);
}

#[tokio::test]
async fn test_rejected_submission_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "detail": "Invalid API key" })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .submit("a fox", &Parameters::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermanentProviderError);
    assert!(err.to_string().contains("Invalid API key"));
}

#[tokio::test]
async fn test_cancel_uses_cancel_endpoint() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    Mock::given(method("PUT"))
        .and(path(format!("{JOB_PATH}/cancel")))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "status": "CANCELLATION_REQUESTED" })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server);
    let handle = provider.submit("a fox", &Parameters::new()).await.unwrap();
    provider.cancel(&handle).await.unwrap();
}
