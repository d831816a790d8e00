use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};
use storefront_chat::{
    app::{build_hub, build_router, AppState},
    config::Config,
};

const TOKENS: &str = "tok-c:C:customer:Ana:ana@example.com,tok-op:op-1:support,tok-co:co-1:consultant,tok-ad:ad-1:admin";

async fn spawn_server() -> String {
    let config = Config::from_lookup(|key| match key {
        "CHAT_STORE" => Some("memory".to_string()),
        "CHAT_STATIC_TOKENS" => Some(TOKENS.to_string()),
        _ => None,
    });
    let hub = build_hub(&config).await.unwrap();
    let app = build_router(Arc::new(AppState { hub }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_needs_no_token() {
    let base = spawn_server().await;
    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert!(body["now"].is_string());
}

#[tokio::test]
async fn missing_or_unknown_tokens_are_unauthorized() {
    let base = spawn_server().await;
    let http = reqwest::Client::new();

    let res = http
        .get(format!("{base}/api/conversations"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "unauthenticated");

    let res = http
        .get(format!("{base}/api/conversations"))
        .bearer_auth("forged")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn support_conversation_round_trip() {
    let base = spawn_server().await;
    let http = reqwest::Client::new();

    let res = http
        .post(format!("{base}/api/channels/support/C/messages"))
        .bearer_auth("tok-c")
        .json(&json!({ "id": "local_1", "content": "Hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"]["id"], "local_1");
    assert_eq!(body["message"]["channelId"], "support_C");
    assert!(body["warning"].is_null());

    let list: Value = http
        .get(format!("{base}/api/conversations?topic=support"))
        .bearer_auth("tok-op")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entry = &list["conversations"][0];
    assert_eq!(entry["lastMessagePreview"], "Hello");
    assert_eq!(entry["unreadCount"], 1);
    assert_eq!(entry["customer"]["name"], "Ana");

    let history: Value = http
        .get(format!("{base}/api/channels/support/C/messages"))
        .bearer_auth("tok-op")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["messages"].as_array().unwrap().len(), 1);

    let read: Value = http
        .post(format!("{base}/api/channels/support/C/read"))
        .bearer_auth("tok-op")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["conversation"]["unreadCount"], 0);

    let res = http
        .delete(format!("{base}/api/conversations/support_C"))
        .bearer_auth("tok-op")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let history: Value = http
        .get(format!("{base}/api/channels/support/C/messages"))
        .bearer_auth("tok-ad")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn role_and_validation_errors_map_to_statuses() {
    let base = spawn_server().await;
    let http = reqwest::Client::new();

    let res = http
        .get(format!("{base}/api/channels/consultant/C/messages"))
        .bearer_auth("tok-op")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = http
        .post(format!("{base}/api/channels/support/C/messages"))
        .bearer_auth("tok-c")
        .json(&json!({ "content": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "validation");

    let res = http
        .get(format!("{base}/api/channels/billing/C/messages"))
        .bearer_auth("tok-ad")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn presence_gates_consultation_messages() {
    let base = spawn_server().await;
    let http = reqwest::Client::new();

    let presence: Value = http
        .get(format!("{base}/api/presence"))
        .bearer_auth("tok-c")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(presence["status"], "offline");

    let res = http
        .post(format!("{base}/api/channels/consultant/C/messages"))
        .bearer_auth("tok-c")
        .json(&json!({ "content": "Is this serum ok for oily skin?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let res = http
        .put(format!("{base}/api/presence"))
        .bearer_auth("tok-op")
        .json(&json!({ "status": "online" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = http
        .put(format!("{base}/api/presence"))
        .bearer_auth("tok-co")
        .json(&json!({ "status": "online" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = http
        .post(format!("{base}/api/channels/consultant/C/messages"))
        .bearer_auth("tok-c")
        .json(&json!({ "content": "Is this serum ok for oily skin?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
}
