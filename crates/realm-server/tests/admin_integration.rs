#[allow(dead_code)]
mod common;

use realm_core::protocol::ServerMessage;
use realm_server::config::{AdminConfig, ServerConfig};
use serde_json::{Value, json};

use common::{
    ADMIN_TOKEN, TestServer, admin_post, test_config, ws_expect, ws_expect_close, ws_expect_event,
    ws_join,
};

async fn admin_status(server: &TestServer) -> Value {
    let resp = reqwest::Client::new()
        .get(format!("{}/admin/status", server.base_url()))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let server = TestServer::new().await;
    let resp = reqwest::get(format!("{}/health", server.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["simulation"], true);
}

#[tokio::test]
async fn admin_rejects_missing_or_wrong_token() {
    let server = TestServer::new().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/admin/pause", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("{}/admin/pause", server.base_url()))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn admin_disabled_without_configured_token() {
    let config = ServerConfig {
        admin: AdminConfig { bearer_token: None },
        ..test_config()
    };
    let server = TestServer::from_config(config).await;
    let resp = reqwest::Client::new()
        .get(format!("{}/admin/status", server.base_url()))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn status_reports_the_round() {
    let server = TestServer::new().await;
    let body = admin_status(&server).await;
    assert_eq!(body["outcome"], "status");
    assert_eq!(body["round"], 1);
    assert_eq!(body["rounds_played"], 0);
    assert_eq!(body["maintenance"], false);
}

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    let server = TestServer::new().await;

    let resp = admin_post(&server, "pause", json!({})).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["outcome"], "applied");

    let body: Value = admin_post(&server, "pause", json!({})).await.json().await.unwrap();
    assert_eq!(body["outcome"], "unchanged");

    let body: Value = admin_post(&server, "resume", json!({})).await.json().await.unwrap();
    assert_eq!(body["outcome"], "applied");
}

#[tokio::test]
async fn bad_admin_commands_map_to_client_errors() {
    let server = TestServer::new().await;

    let resp = admin_post(&server, "kick", json!({ "id": 9999 })).await;
    assert_eq!(resp.status(), 404);

    let resp = admin_post(&server, "rules", json!({ "key": "no_such_rule", "value": 1 })).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("no_such_rule"));

    let resp = admin_post(&server, "preset", json!({ "name": "missing" })).await;
    assert_eq!(resp.status(), 400);

    let resp = admin_post(&server, "broadcast", json!({ "message": "   " })).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn broadcast_reaches_participants() {
    let server = TestServer::new().await;
    let (mut alice, ..) = ws_join(&server, "alice").await;

    let resp = admin_post(&server, "broadcast", json!({ "message": "hello" })).await;
    assert_eq!(resp.status(), 200);
    let fields = ws_expect_event(&mut alice, "info").await;
    assert!(fields.contains("hello"));
}

#[tokio::test]
async fn kick_closes_the_socket() {
    let server = TestServer::new().await;
    let (mut alice, alice_id, _) = ws_join(&server, "alice").await;

    let resp = admin_post(&server, "kick", json!({ "id": alice_id, "reason": "testing" })).await;
    assert_eq!(resp.status(), 200);
    let msg = ws_expect(&mut alice, |m| matches!(m, ServerMessage::Kicked { .. })).await;
    assert!(matches!(msg, ServerMessage::Kicked { reason } if reason == "testing"));
    assert_eq!(ws_expect_close(&mut alice).await.as_deref(), Some("testing"));
}

#[tokio::test]
async fn ban_kicks_matching_address() {
    let server = TestServer::new().await;
    let (mut mallory, ..) = ws_join(&server, "mallory").await;

    let body: Value = admin_post(&server, "ban", json!({ "address": "mallory" }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["outcome"], "applied");
    assert_eq!(ws_expect_close(&mut mallory).await.as_deref(), Some("banned"));
}

#[tokio::test]
async fn set_field_and_reboot() {
    let server = TestServer::new().await;
    let (_alice, alice_id, _) = ws_join(&server, "alice").await;

    let resp = admin_post(
        &server,
        "participant",
        json!({ "id": alice_id, "field": "score", "value": 42 }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = admin_post(&server, "reboot", json!({ "after_rounds": 2 })).await;
    assert_eq!(resp.status(), 200);
    let body = admin_status(&server).await;
    assert_eq!(body["reboot_after"], 2);
}
