//! Control API Integration Tests

mod common;

use axum::http::StatusCode;
use common::TestPhone;
use serde_json::json;
use yakphone::infrastructure::protocols::sip::{ResponseBuilder, SipHeaders};

#[tokio::test]
async fn test_call_rejected_until_registered() {
    let phone = TestPhone::start(&[]);

    let (status, body) = phone
        .post("/call", Some(json!({ "destination": "200" })))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "SIP softphone not running");

    let (status, body) = phone.get("/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, json!({ "status": "unhealthy", "sip_registered": false }));
}

#[tokio::test]
async fn test_validation_comes_first() {
    let phone = TestPhone::start(&[]);

    let (status, body) = phone.post("/call", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "destination is required");

    let (status, body) = phone.post("/call", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "destination is required");

    let (status, body) = phone.post("/dtmf", Some(json!({ "digits": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "digits is required");

    let (status, _) = phone
        .post("/answer", Some(json!({ "status_code": 100 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_status_and_health_after_registration() {
    let mut phone = TestPhone::start(&[]);
    phone.register().await;

    let (status, body) = phone.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "healthy", "sip_registered": true }));

    let (status, body) = phone.get("/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["registered"], true);
    assert_eq!(body["server"], "pbx.local");
    assert_eq!(body["extension"], "100");
    assert_eq!(body["registrationState"], "Registered");
    assert!(body["registeredUntil"].is_string());
    assert!(body["activeCallState"].is_null());
}

#[tokio::test]
async fn test_register_challenge_answered_with_digest() {
    let mut phone = TestPhone::start(&[]);

    let first = phone.next_request().await;
    assert!(first.header("Authorization").is_none());
    phone
        .reply(
            &first,
            ResponseBuilder::new(401)
                .to_tag("registrar")
                .header("WWW-Authenticate", r#"Digest realm="pbx.local", nonce="n0nce""#),
        )
        .await;

    let second = phone.next_request().await;
    assert_eq!(second.method_name(), "REGISTER");
    assert_eq!(second.call_id(), first.call_id());
    assert!(second.cseq().unwrap().0 > first.cseq().unwrap().0);
    let authorization = second.header("Authorization").unwrap();
    assert!(authorization.contains(r#"username="100""#));
    assert!(authorization.contains(r#"uri="sip:pbx.local""#));

    phone
        .reply(&second, ResponseBuilder::ok().to_tag("registrar"))
        .await;
    phone.wait_for(|s| s.registered).await;
}

fn challenge(nonce: &str, stale: bool) -> ResponseBuilder {
    let mut value = format!(r#"Digest realm="pbx.local", nonce="{}""#, nonce);
    if stale {
        value.push_str(", stale=true");
    }
    ResponseBuilder::new(401)
        .to_tag("registrar")
        .header("WWW-Authenticate", &value)
}

#[tokio::test]
async fn test_stale_nonce_answered_again() {
    let mut phone = TestPhone::start(&[]);

    let first = phone.next_request().await;
    phone.reply(&first, challenge("n0nce", false)).await;
    let second = phone.next_request().await;
    assert!(second.header("Authorization").unwrap().contains(r#"nonce="n0nce""#));

    phone.reply(&second, challenge("fresh", true)).await;
    let third = phone.next_request().await;
    assert_eq!(third.method_name(), "REGISTER");
    assert!(third.cseq().unwrap().0 > second.cseq().unwrap().0);
    assert!(third.header("Authorization").unwrap().contains(r#"nonce="fresh""#));

    phone
        .reply(&third, ResponseBuilder::ok().to_tag("registrar"))
        .await;
    let snapshot = phone.wait_for(|s| s.registered).await;
    assert!(snapshot.last_error.is_none());
}

#[tokio::test]
async fn test_repeated_stale_nonce_is_auth_failure() {
    let mut phone = TestPhone::start(&[]);

    let first = phone.next_request().await;
    phone.reply(&first, challenge("n1", false)).await;
    let second = phone.next_request().await;
    phone.reply(&second, challenge("n2", true)).await;
    let third = phone.next_request().await;
    phone.reply(&third, challenge("n3", true)).await;

    let snapshot = phone
        .wait_for(|s| s.registration_state.name() == "Failed")
        .await;
    assert!(snapshot.last_error.unwrap().contains("Authentication failed"));
}

#[tokio::test]
async fn test_rejected_credentials_reported() {
    let mut phone = TestPhone::start(&[]);
    let challenge = ResponseBuilder::new(401)
        .to_tag("registrar")
        .header("WWW-Authenticate", r#"Digest realm="pbx.local", nonce="n0nce""#);

    let first = phone.next_request().await;
    phone.reply(&first, challenge).await;
    let second = phone.next_request().await;
    phone
        .reply(
            &second,
            ResponseBuilder::new(401)
                .to_tag("registrar")
                .header("WWW-Authenticate", r#"Digest realm="pbx.local", nonce="other""#),
        )
        .await;

    let snapshot = phone
        .wait_for(|s| s.registration_state.name() == "Failed")
        .await;
    assert!(snapshot.last_error.unwrap().contains("Authentication failed"));

    // Restart on demand
    let (status, body) = phone.post("/register", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(phone.next_request().await.method_name(), "REGISTER");
}

#[tokio::test]
async fn test_dtmf_without_call_is_conflict() {
    let mut phone = TestPhone::start(&[]);
    phone.register().await;

    let (status, body) = phone.post("/dtmf", Some(json!({ "digits": "123" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("confirmed call"));
}

#[tokio::test]
async fn test_hangup_without_call_succeeds() {
    let phone = TestPhone::start(&[]);

    let (status, body) = phone.post("/hangup", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "success", "message": "Call hung up" }));
}

#[tokio::test]
async fn test_metrics_endpoint_renders() {
    let phone = TestPhone::start(&[]);

    let (status, _) = phone.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
}
