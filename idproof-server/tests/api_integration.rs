//! API integration tests for idproof-server.
//!
//! Requests go through the full router (auth extractors, middleware, error
//! mapping) against in-memory storage and scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::DateTime;
use idproof_core::{
    DispatchPolicy, EngineConfig, FakeCeremonyVerifier, ManualClock, RecordingProvider, ScriptedClassifier,
    SequenceCodeGenerator, VerificationEngine,
};
use idproof_server::{create_router, AppState, Storage};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const TOKEN: &str = "test-service-token";
const BOUNDARY: &str = "----TestBoundary7MA4YWxkTrZu0gW";

struct TestApp {
    router: Router,
    outbox: Arc<RecordingProvider>,
    classifier: Arc<ScriptedClassifier>,
}

fn test_app() -> TestApp {
    let storage = Storage::in_memory();
    let clock = Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ));
    let outbox = Arc::new(RecordingProvider::new());
    let classifier = Arc::new(ScriptedClassifier::new());

    let engine = VerificationEngine::builder(EngineConfig::default())
        .repository(storage.repository.clone())
        .counter_store(storage.counters.clone())
        .clock(clock)
        .delivery(outbox.clone())
        .classifier(classifier.clone())
        .ceremony_verifier(Arc::new(FakeCeremonyVerifier::new()))
        .code_generator(Arc::new(SequenceCodeGenerator::new(["482913"])))
        .dispatch_policy(DispatchPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_secs(2),
        })
        .build()
        .unwrap();

    let state = AppState::new(Arc::new(engine), Arc::new(storage), Some(TOKEN));
    TestApp {
        router: create_router(state),
        outbox,
        classifier,
    }
}

fn authed(method: &str, uri: &str, user: Uuid) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header("x-user-id", user.to_string())
}

fn json_request(method: &str, uri: &str, user: Uuid, body: Value) -> Request<Body> {
    authed(method, uri, user)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str, user: Uuid) -> Request<Body> {
    authed(method, uri, user).body(Body::empty()).unwrap()
}

const JPEG_HEADER: [u8; 6] = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

fn document_multipart(
    document_type: &str,
    image_content_type: &str,
    image: &[u8],
) -> (String, Vec<u8>) {
    let mut body = Vec::new();

    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"document_type\"\r\n\r\n");
    body.extend_from_slice(document_type.as_bytes());
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"metadata\"\r\n\r\n");
    body.extend_from_slice(br#"{"country":"FR"}"#);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"image\"; filename=\"front.jpg\"\r\n",
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", image_content_type).as_bytes());
    body.extend_from_slice(image);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    (format!("multipart/form-data; boundary={}", BOUNDARY), body)
}

fn submit_document_request(user: Uuid, image_content_type: &str) -> Request<Body> {
    submit_document_with_image(user, image_content_type, &JPEG_HEADER)
}

fn submit_document_with_image(user: Uuid, image_content_type: &str, image: &[u8]) -> Request<Body> {
    let (content_type, body) = document_multipart("PASSPORT", image_content_type, image);
    authed("POST", "/v1/documents", user)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

// ============================================================================
// Health & Docs
// ============================================================================

#[tokio::test]
async fn test_health_and_ready() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "idproof-server");
    assert_eq!(body["persistent_storage"], false);

    let (status, body) = send(
        &app.router,
        Request::get("/ready").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let app = test_app();
    let (status, body) = send(
        &app.router,
        Request::get("/api-docs/openapi.json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/v1/otp/initiate"].is_object());
}

#[tokio::test]
async fn test_request_id_is_returned() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

// ============================================================================
// Caller authentication
// ============================================================================

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = test_app();
    let request = Request::get("/v1/verification-state")
        .header("x-user-id", Uuid::new_v4().to_string())
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_MISSING_TOKEN");
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let app = test_app();
    let request = Request::get("/v1/verification-state")
        .header(header::AUTHORIZATION, "Bearer not-the-token")
        .header("x-user-id", Uuid::new_v4().to_string())
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_INVALID_TOKEN");
}

#[tokio::test]
async fn test_missing_user_header_is_bad_request() {
    let app = test_app();
    let request = Request::get("/v1/verification-state")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");
}

// ============================================================================
// OTP
// ============================================================================

#[tokio::test]
async fn test_otp_round_trip_and_replay() {
    let app = test_app();
    let user = Uuid::new_v4();

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/otp/initiate",
            user,
            json!({"destination": "+15551234567", "purpose": "LOGIN"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["challenge_ref"].is_string());
    assert_eq!(body["delivery"]["status"], "sent");
    assert!(body.get("code").is_none());

    let sent = app.outbox.last().unwrap();
    assert_eq!(sent.code().as_deref(), Some("482913"));

    let verify = json!({"purpose": "LOGIN", "code": "482913"});
    let (status, body) = send(
        &app.router,
        json_request("POST", "/v1/otp/verify", user, verify.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["phone_verified"], true);
    assert_eq!(body["state"]["verification_level"], "PHONE");

    let (status, body) = send(
        &app.router,
        json_request("POST", "/v1/otp/verify", user, verify),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "CHALLENGE_EXPIRED");
}

#[tokio::test]
async fn test_failed_delivery_can_be_resent() {
    let app = test_app();
    let user = Uuid::new_v4();
    app.outbox.fail_next(3);

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/otp/initiate",
            user,
            json!({"destination": "user@example.com", "purpose": "LOGIN"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivery"]["status"], "failed");
    assert_eq!(body["delivery"]["attempts"], 3);
    let challenge_ref = body["challenge_ref"].clone();

    let resend = json!({"purpose": "LOGIN"});
    let (status, body) = send(
        &app.router,
        json_request("POST", "/v1/otp/resend", user, resend.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivery"]["status"], "sent");
    assert_eq!(body["challenge_ref"], challenge_ref);
    assert_eq!(app.outbox.last().unwrap().code().as_deref(), Some("482913"));

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/otp/verify",
            user,
            json!({"purpose": "LOGIN", "code": "482913"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["email_verified"], true);

    let (status, body) = send(
        &app.router,
        json_request("POST", "/v1/otp/resend", user, resend),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "CHALLENGE_EXPIRED");
}

#[tokio::test]
async fn test_otp_wrong_code_is_generic() {
    let app = test_app();
    let user = Uuid::new_v4();

    send(
        &app.router,
        json_request(
            "POST",
            "/v1/otp/initiate",
            user,
            json!({"destination": "user@example.com", "purpose": "SETUP"}),
        ),
    )
    .await;

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/otp/verify",
            user,
            json!({"purpose": "SETUP", "code": "000000"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_PROOF");
    assert_eq!(body["error"], "Verification failed");
}

#[tokio::test]
async fn test_otp_unknown_purpose_is_bad_request() {
    let app = test_app();
    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/otp/initiate",
            Uuid::new_v4(),
            json!({"destination": "+15551234567", "purpose": "WHATEVER"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_otp_initiation_rate_limited() {
    let app = test_app();
    let user = Uuid::new_v4();
    let initiate = || {
        json_request(
            "POST",
            "/v1/otp/initiate",
            user,
            json!({"destination": "+15551234567", "purpose": "LOGIN"}),
        )
    };

    for _ in 0..5 {
        let (status, _) = send(&app.router, initiate()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = app.router.clone().oneshot(initiate()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
}

// ============================================================================
// WebAuthn
// ============================================================================

#[tokio::test]
async fn test_webauthn_register_authenticate_revoke() {
    let app = test_app();
    let user = Uuid::new_v4();

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/webauthn/register/start",
            user,
            json!({"device_label": "YubiKey"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let challenge = body["options"]["challenge"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/webauthn/register/finish",
            user,
            FakeCeremonyVerifier::registration_response("cred-1", &challenge, 0),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["credential"]["device_label"], "YubiKey");
    assert_eq!(body["state"]["two_factor_enabled"], true);

    let (status, body) = send(
        &app.router,
        empty_request("GET", "/v1/webauthn/credentials", user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app.router,
        empty_request("POST", "/v1/webauthn/authenticate/start", user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let challenge = body["options"]["challenge"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/webauthn/authenticate/finish",
            user,
            FakeCeremonyVerifier::assertion_response("cred-1", &challenge, 1),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sign_count"], 1);

    let (status, body) = send(
        &app.router,
        empty_request("DELETE", "/v1/webauthn/credentials/cred-1", user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["two_factor_enabled"], false);

    let (status, _) = send(
        &app.router,
        empty_request("DELETE", "/v1/webauthn/credentials/cred-1", user),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Documents & Review
// ============================================================================

#[tokio::test]
async fn test_document_review_rejection_flow() {
    let app = test_app();
    let user = Uuid::new_v4();
    app.classifier.push_confidence(0.42);

    let (status, body) = send(&app.router, submit_document_request(user, "image/jpeg")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["attempt"]["status"], "UNDER_REVIEW");
    assert_eq!(body["attempt"]["metadata"]["country"], "FR");
    let attempt_id = body["attempt"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app.router, empty_request("GET", "/v1/reviews", user)).await;
    assert_eq!(status, StatusCode::OK);
    let pending = body.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["attempt"]["id"], attempt_id.as_str());
    assert!(pending[0]["analysis"].is_object());

    let decision_uri = format!("/v1/reviews/{attempt_id}/decision");
    let decide = || {
        authed("POST", &decision_uri, user)
            .header("x-reviewer-id", "reviewer-7")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"decision": "REJECT", "notes": "blurry photo"}).to_string(),
            ))
            .unwrap()
    };

    let (status, body) = send(&app.router, decide()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempt"]["status"], "REJECTED");
    assert_eq!(body["attempt"]["resubmission_allowed"], true);
    assert_eq!(body["attempt"]["reviewer_id"], "reviewer-7");
    assert_eq!(body["state"]["identity_verified"], false);

    let (status, body) = send(&app.router, decide()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICTING_DECISION");

    let (status, body) = send(
        &app.router,
        empty_request("GET", &format!("/v1/reviews/{attempt_id}/history"), user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["notes"], "blurry photo");

    let (status, body) = send(
        &app.router,
        empty_request("GET", "/v1/documents/latest", user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempt"]["status"], "REJECTED");

    let (status, _) = send(
        &app.router,
        empty_request("GET", &format!("/v1/documents/{attempt_id}"), Uuid::new_v4()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_high_confidence_document_auto_approves() {
    let app = test_app();
    let user = Uuid::new_v4();
    app.classifier.push_confidence(0.93);

    let (status, body) = send(&app.router, submit_document_request(user, "image/png")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["attempt"]["status"], "AUTO_APPROVED");
    assert_eq!(body["state"]["identity_verified"], true);
    assert_eq!(body["state"]["verification_level"], "IDENTITY");
}

#[tokio::test]
async fn test_camera_sized_document_is_accepted() {
    let app = test_app();
    let user = Uuid::new_v4();
    app.classifier.push_confidence(0.93);

    let mut image = JPEG_HEADER.to_vec();
    image.resize(3 * 1024 * 1024, 0x5A);

    let (status, body) = send(
        &app.router,
        submit_document_with_image(user, "image/jpeg", &image),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["attempt"]["status"], "AUTO_APPROVED");
    assert_eq!(app.classifier.calls(), 1);
}

#[tokio::test]
async fn test_oversized_document_image_is_rejected() {
    let app = test_app();
    let mut image = JPEG_HEADER.to_vec();
    image.resize(10 * 1024 * 1024 + 1, 0x5A);

    let (status, _) = send(
        &app.router,
        submit_document_with_image(Uuid::new_v4(), "image/jpeg", &image),
    )
    .await;
    assert!(status.is_client_error());
    assert_eq!(app.classifier.calls(), 0);
}

#[tokio::test]
async fn test_document_unsupported_image_type() {
    let app = test_app();
    let (status, body) = send(
        &app.router,
        submit_document_request(Uuid::new_v4(), "application/pdf"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");
    assert_eq!(app.classifier.calls(), 0);
}

#[tokio::test]
async fn test_classifier_outage_is_service_unavailable() {
    let app = test_app();
    let user = Uuid::new_v4();
    app.classifier.push_failure("classifier timed out");

    let (status, body) = send(&app.router, submit_document_request(user, "image/jpeg")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "PROVIDER_UNAVAILABLE");

    let (status, body) = send(
        &app.router,
        empty_request("GET", "/v1/documents/latest", user),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempt"]["status"], "SUBMITTED");
    assert!(body["analysis"].is_null());
}

#[tokio::test]
async fn test_review_decision_requires_reviewer() {
    let app = test_app();
    let request = authed("POST", &format!("/v1/reviews/{}/decision", Uuid::new_v4()), Uuid::new_v4())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"decision": "APPROVE", "notes": "ok"}).to_string(),
        ))
        .unwrap();

    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Verification state
// ============================================================================

#[tokio::test]
async fn test_fresh_user_has_no_level() {
    let app = test_app();
    let (status, body) = send(
        &app.router,
        empty_request("GET", "/v1/verification-state", Uuid::new_v4()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verification_level"], "NONE");
    assert_eq!(body["phone_verified"], false);
    assert_eq!(body["two_factor_enabled"], false);
}
