mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use reqwest::cookie::{CookieStore, Jar};
use serde_json::json;
use tenderdesk_auth::{AuthError, DomainKind, RefreshOutcome, SessionEvent, SessionState, TeardownReason};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_refresh_rotates_credentials_and_rearms() {
    // モックサーバーの起動
    let mock_server = MockServer::start().await;
    let fresh = token(NOW + 2 * DAY);

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("Authorization", "Bearer r"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": fresh,
            "refresh_token": "r2"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &token(NOW + 300), "r");
    let mut events = session.subscribe();

    let outcome = session.coordinator().refresh().await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Refreshed {
            access_token: fresh.clone()
        }
    );

    let stored = session.store().credentials().unwrap().unwrap();
    assert_eq!(stored.access, fresh);
    assert_eq!(stored.refresh, "r2");
    assert_eq!(session.scheduler().fires_at(), Some(NOW + 2 * DAY - 600));
    assert!(!session.coordinator().is_in_flight());
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::TokenRefreshed {
            domain: DomainKind::Client
        }]
    );
}

#[tokio::test]
async fn test_refresh_keeps_refresh_credential_when_not_rotated() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access_token": token(NOW + DAY)})),
        )
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &token(NOW + 60), "r");

    session.coordinator().refresh().await.unwrap();
    assert_eq!(session.store().refresh_token().unwrap(), Some("r".to_string()));
}

#[tokio::test]
async fn test_refresh_without_refresh_credential() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);

    let outcome = session.coordinator().refresh().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::NoRefreshToken);
    assert!(!session.coordinator().is_in_flight());
}

#[tokio::test]
async fn test_refresh_rejection_tears_down() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"detail": "Refresh token expired"})),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"email": "buyer@example.com"})))
        .mount(&mock_server)
        .await;

    let (session, backend) = client_session(&mock_server);
    seed(&session, &token(NOW + DAY), "r");
    assert!(session.mount().await.is_authenticated());
    assert!(session.scheduler().is_armed());
    let mut events = session.subscribe();

    let err = session.coordinator().refresh().await.unwrap_err();
    match &err {
        AuthError::RefreshRejected { status, message } => {
            assert_eq!(*status, 401);
            assert_eq!(message, "Refresh token expired");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_session_fatal());

    assert!(backend.is_empty());
    assert_eq!(session.state(), SessionState::Unauthenticated);
    assert!(!session.scheduler().is_armed());
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::SignedOut {
            domain: DomainKind::Client,
            reason: TeardownReason::RefreshFailed,
            redirect_to: "/login".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_exchange() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": token(NOW + DAY)}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &token(NOW + 60), "r");

    let coordinator = session.coordinator();
    let (first, second) = tokio::join!(coordinator.refresh(), coordinator.refresh());

    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, RefreshOutcome::Skipped));
    assert!(matches!(outcomes[0], RefreshOutcome::Refreshed { .. }));
    assert_eq!(outcomes[1], RefreshOutcome::Skipped);
}

#[tokio::test]
async fn test_interceptor_attaches_credential() {
    let mock_server = MockServer::start().await;
    let access = token(NOW + DAY);

    Mock::given(method("GET"))
        .and(path("/opportunities"))
        .and(header("Authorization", bearer(&access).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &access, "r");

    let response = session
        .api()
        .send(session.api().get("/opportunities"))
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, json!([{"id": 1}]));
}

#[tokio::test]
async fn test_interceptor_refreshes_and_replays_once() {
    let mock_server = MockServer::start().await;
    let stale = token(NOW + 100);
    let fresh = token(NOW + DAY);

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": fresh})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bids"))
        .and(header("Authorization", bearer(&stale).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bids"))
        .and(header("Authorization", bearer(&fresh).as_str()))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &stale, "r");

    let response = session
        .api()
        .send(session.api().post("/bids").json(&json!({"amount": 1000})))
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(session.store().access_token().unwrap(), Some(fresh));
}

#[tokio::test]
async fn test_interceptor_second_rejection_is_final() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access_token": token(NOW + DAY)})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "Not allowed"})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &token(NOW + DAY), "r");

    let err = session
        .api()
        .send(session.api().get("/admin"))
        .await
        .unwrap_err();
    match err {
        AuthError::Unauthorized(message) => assert_eq!(message, "Not allowed"),
        other => panic!("unexpected error: {:?}", other),
    }
    // セッションは維持される
    assert!(session.store().credentials().unwrap().is_some());
}

#[tokio::test]
async fn test_interceptor_without_refresh_credential_rejects() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/opportunities"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);

    let err = session
        .api()
        .send(session.api().get("/opportunities"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized(_)));
}

#[tokio::test]
async fn test_interceptor_refresh_failure_ends_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/opportunities"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (session, backend) = client_session(&mock_server);
    seed(&session, &token(NOW + DAY), "r");

    let err = session
        .api()
        .send(session.api().get("/opportunities"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::SessionExpired));
    assert_eq!(
        err.user_message(),
        "Your session has expired. Please sign in again."
    );
    assert!(backend.is_empty());
    assert_eq!(session.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn test_rate_limit_reports_retry_after_from_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/opportunities"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({"retry_after": 45})))
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &token(NOW + DAY), "r");

    let err = session
        .api()
        .send(session.api().get("/opportunities"))
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(45));
    assert_eq!(err.user_message(), "Too many requests. Try again in 45 seconds.");
    assert!(!err.is_session_fatal());
    assert!(session.store().credentials().unwrap().is_some());
}

#[tokio::test]
async fn test_rate_limit_falls_back_to_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/opportunities"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "12")
                .set_body_json(json!({"detail": "Slow down"})),
        )
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &token(NOW + DAY), "r");

    let err = session
        .api()
        .send(session.api().get("/opportunities"))
        .await
        .unwrap_err();
    match err {
        AuthError::RateLimited {
            retry_after,
            message,
        } => {
            assert_eq!(retry_after, Some(12));
            assert_eq!(message, "Slow down");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_passes_message_through() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/opportunities"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "boom"})))
        .mount(&mock_server)
        .await;

    let (session, _) = client_session(&mock_server);
    seed(&session, &token(NOW + DAY), "r");

    let err = session
        .api()
        .send(session.api().get("/opportunities"))
        .await
        .unwrap_err();
    match err {
        AuthError::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(session.store().credentials().unwrap().is_some());
}

#[tokio::test]
async fn test_writer_refresh_updates_cookie() {
    let mock_server = MockServer::start().await;
    let fresh = token(NOW + DAY);

    Mock::given(method("POST"))
        .and(path("/writer/auth/refresh"))
        .and(header("Authorization", "Bearer wr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": fresh})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let jar = Arc::new(Jar::default());
    let session = writer_session(&mock_server, jar.clone());
    seed(&session, &token(NOW + 60), "wr");

    session.coordinator().refresh().await.unwrap();

    let inside = url::Url::parse(&format!("{}/writer/drafts", mock_server.uri())).unwrap();
    let cookie = jar.cookies(&inside).expect("writer cookie");
    assert_eq!(cookie.to_str().unwrap(), format!("writer_access_token={}", fresh));
    assert_eq!(session.store().access_token().unwrap(), Some(fresh));
}
