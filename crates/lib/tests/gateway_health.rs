//! Integration tests: start the gateway on a free port and query it over HTTP.
//! The bot tests point the Telegram client at an in-process fake Bot API, so nothing leaves
//! the machine. Server tasks are left running when a test ends.
//! Assumes TELEGRAM_BOT_TOKEN / TELEGRAM_API_BASE / HERALD_REDIS_URL are unset.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::Uri;
use axum::{Json, Router};
use herald::config::Config;
use herald::gateway;
use herald::transport::{TransportMode, SECRET_HEADER};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Bot API stand-in: records every call and keeps the webhook registration.
#[derive(Clone, Default)]
struct FakeBotApi {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    webhook: Arc<Mutex<String>>,
    /// When set, getWebhookInfo reports this URL instead of the registered one.
    reported_url: Option<String>,
}

impl FakeBotApi {
    fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

async fn bot_api(State(api): State<FakeBotApi>, uri: Uri, body: Bytes) -> Json<Value> {
    let method = uri.path().rsplit('/').next().unwrap_or_default().to_string();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    api.calls.lock().unwrap().push((method.clone(), body.clone()));
    let result = match method.as_str() {
        "setWebhook" => {
            *api.webhook.lock().unwrap() = body["url"].as_str().unwrap_or_default().to_string();
            json!(true)
        }
        "deleteWebhook" => {
            api.webhook.lock().unwrap().clear();
            json!(true)
        }
        "getWebhookInfo" => {
            let url = api
                .reported_url
                .clone()
                .unwrap_or_else(|| api.webhook.lock().unwrap().clone());
            json!({ "url": url, "pending_update_count": 0 })
        }
        "sendMessage" => json!({ "message_id": 77, "date": 0, "chat": { "id": body["chat_id"] } }),
        "getUpdates" => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            json!([])
        }
        _ => json!(true),
    };
    Json(json!({ "ok": true, "result": result }))
}

async fn spawn_fake_bot_api(api: FakeBotApi) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake bot api");
    let addr = listener.local_addr().expect("local_addr");
    let app = Router::new().fallback(bot_api).with_state(api);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn bot_config(port: u16, api_base: String, mode: TransportMode) -> Config {
    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.telegram.bot_token = Some("123:test-token".to_string());
    config.telegram.api_base = Some(api_base);
    config.telegram.mode = mode;
    config.telegram.webhook_url = Some("https://bot.example.com/telegram/webhook".to_string());
    config.telegram.webhook_secret = Some("s3cret".to_string());
    config.telegram.poll_timeout_secs = 1;
    config
        .commands
        .insert("/start".to_string(), "Welcome aboard!".to_string());
    config
}

/// Poll GET / until `transport` matches, returning the health JSON.
async fn wait_for_transport(port: u16, expected: &str) -> Value {
    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let json: Value = resp.json().await.expect("parse JSON");
                if json.get("transport").and_then(|v| v.as_str()) == Some(expected) {
                    return json;
                }
                last = Some(format!("{}", json));
            }
            Ok(resp) => last = Some(format!("status {}", resp.status())),
            Err(e) => last = Some(e.to_string()),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "GET {} never reported transport {:?} within 5s; last: {:?}",
        url, expected, last
    );
}

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let port = free_port();
    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();

    tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });

    let json = wait_for_transport(port, "none").await;
    assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));
}

#[tokio::test]
async fn webhook_delivery_reaches_command_handler() {
    let api = FakeBotApi::default();
    let api_base = spawn_fake_bot_api(api.clone()).await;
    let port = free_port();
    let config = bot_config(port, api_base, TransportMode::Webhook);
    tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });
    wait_for_transport(port, "webhook").await;

    let set = api.calls_to("setWebhook");
    assert_eq!(set.len(), 1);
    assert_eq!(set[0]["secret_token"], json!("s3cret"));

    let url = format!("http://127.0.0.1:{}/telegram/webhook", port);
    let update = json!({
        "update_id": 1,
        "message": { "message_id": 5, "date": 1700000000, "chat": { "id": 42 }, "text": "/start" }
    });
    let client = reqwest::Client::new();

    let resp = client
        .post(&url)
        .header(SECRET_HEADER, "wrong")
        .json(&update)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(resp.status().as_u16(), 403);

    let resp = client
        .post(&url)
        .header(SECRET_HEADER, "s3cret")
        .json(&update)
        .send()
        .await
        .expect("post webhook");
    assert_eq!(resp.status().as_u16(), 200);

    for _ in 0..100 {
        let sent = api.calls_to("sendMessage");
        if let Some(body) = sent.first() {
            assert_eq!(body["chat_id"], json!(42));
            assert_eq!(body["text"], json!("Welcome aboard!"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("command reply was never sent");
}

#[tokio::test]
async fn unverified_webhook_falls_back_to_long_poll() {
    let api = FakeBotApi {
        reported_url: Some(String::new()),
        ..FakeBotApi::default()
    };
    let api_base = spawn_fake_bot_api(api.clone()).await;
    let port = free_port();
    let config = bot_config(port, api_base, TransportMode::Webhook);
    tokio::spawn(async move {
        let _ = gateway::run_gateway(config).await;
    });

    wait_for_transport(port, "longPoll").await;
    assert_eq!(api.calls_to("setWebhook").len(), 1);
    for _ in 0..100 {
        if !api.calls_to("getUpdates").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!api.calls_to("getUpdates").is_empty(), "long-poll loop never fetched");

    // The webhook route refuses deliveries while long-poll is active.
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/telegram/webhook", port))
        .header(SECRET_HEADER, "s3cret")
        .json(&json!({ "update_id": 2, "message": { "message_id": 1, "chat": { "id": 1 }, "text": "hi" } }))
        .send()
        .await
        .expect("post webhook");
    assert_eq!(resp.status().as_u16(), 503);
}

#[tokio::test]
async fn relative_webhook_path_is_rejected_before_serving() {
    let mut config = Config::default();
    config.gateway.port = free_port();
    config.telegram.webhook_path = "telegram/webhook".to_string();

    let err = tokio::time::timeout(Duration::from_secs(5), gateway::run_gateway(config))
        .await
        .expect("returns instead of serving")
        .unwrap_err();
    assert!(format!("{:#}", err).contains("webhookPath"));
}
