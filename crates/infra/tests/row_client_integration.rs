//! HTTP row-store client against a mock server: request shapes, status
//! mapping, and `Retry-After` propagation.

use std::sync::Arc;
use std::time::Duration;

use inkstone_core::RowStore;
use inkstone_domain::{AuthState, RecordTable, RemoteError, RemoteRow};
use inkstone_infra::remote::{AccessTokenProvider, HttpRowStore, RowStoreConfig, StaticTokenProvider};
use serde_json::json;
use wiremock::matchers::{bearer_token, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, tokens: Arc<dyn AccessTokenProvider>) -> HttpRowStore {
    HttpRowStore::new(
        RowStoreConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
            api_key: Some("anon-key".into()),
        },
        tokens,
    )
    .expect("client built")
}

fn sample_row() -> RemoteRow {
    RemoteRow {
        id: "c1".into(),
        project_id: Some("p1".into()),
        updated_at: 100,
        deleted_at: None,
        client_id: Some("device-a".into()),
        client_rev: None,
        client_hash: None,
        encrypted_content: None,
        fields: json!({"title": "One", "body": "text"}).as_object().cloned().unwrap_or_default(),
    }
}

#[tokio::test]
async fn upsert_sends_conflict_key_and_merge_preference() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/chapters"))
        .and(query_param("on_conflict", "id"))
        .and(header("Prefer", "resolution=merge-duplicates"))
        .and(header("apikey", "anon-key"))
        .and(bearer_token("test-token"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("test-token")));
    client
        .upsert_row(RecordTable::Chapters, &sample_row(), "id")
        .await
        .expect("upsert succeeds");
}

#[tokio::test]
async fn rate_limited_upsert_surfaces_retry_after_in_millis() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/chapters"))
        .respond_with(
            ResponseTemplate::new(429)
                .append_header("Retry-After", "2")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("test-token")));
    let result = client.upsert_row(RecordTable::Chapters, &sample_row(), "id").await;

    match result {
        Err(RemoteError::Http { status, retry_after_ms, message }) => {
            assert_eq!(status, 429);
            assert_eq!(retry_after_ms, Some(2_000));
            assert!(message.contains("slow down"));
        }
        other => panic!("expected http 429, got {other:?}"),
    }
}

#[tokio::test]
async fn server_error_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/notes"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("test-token")));
    let result = client.upsert_row(RecordTable::Notes, &sample_row(), "id").await;

    match result {
        Err(RemoteError::Http { status, message, retry_after_ms }) => {
            assert_eq!(status, 503);
            assert_eq!(retry_after_ms, None);
            assert!(message.contains("maintenance"));
        }
        other => panic!("expected http 503, got {other:?}"),
    }
}

#[tokio::test]
async fn fetch_rows_filters_by_project_and_since() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/chapters"))
        .and(query_param("project_id", "eq.p1"))
        .and(query_param("deleted_at", "is.null"))
        .and(query_param("updated_at", "gt.42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "c1", "project_id": "p1", "updated_at": 100, "title": "One", "body": "text"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("test-token")));
    let rows = client
        .fetch_rows(RecordTable::Chapters, "p1", Some(42))
        .await
        .expect("fetch succeeds");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "c1");
    assert_eq!(rows[0].updated_at, 100);
    assert_eq!(rows[0].fields["body"], "text");
}

#[tokio::test]
async fn projects_filter_on_their_own_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/projects"))
        .and(query_param("id", "eq.p1"))
        .and(query_param("deleted_at", "is.null"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "p1", "updated_at": 50, "title": "Tide"}
        ])))
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("test-token")));
    let project = client.fetch_project("p1").await.expect("fetch succeeds");
    assert_eq!(project.expect("present").id, "p1");
}

#[tokio::test]
async fn auth_state_fetches_then_caches_the_user() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .and(bearer_token("test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "writer-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("test-token")));

    let state = client.auth_state().await.expect("auth state");
    assert_eq!(state, AuthState::Authenticated { user_id: "writer-1".into() });

    // Second call is served from the cache (the mock expects one hit).
    let state = client.auth_state().await.expect("auth state");
    assert!(state.is_authenticated());
}

#[tokio::test]
async fn expired_session_reports_anonymous() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client(&server, Arc::new(StaticTokenProvider::new("stale-token")));
    let state = client.auth_state().await.expect("auth state");
    assert_eq!(state, AuthState::Anonymous);
}

#[tokio::test]
async fn signed_out_client_never_touches_the_network() {
    let server = MockServer::start().await;
    let client = client(&server, Arc::new(StaticTokenProvider::signed_out()));

    let state = client.auth_state().await.expect("auth state");
    assert_eq!(state, AuthState::Anonymous);

    let result = client.upsert_row(RecordTable::Chapters, &sample_row(), "id").await;
    assert!(matches!(result, Err(RemoteError::Unauthenticated)));

    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}
