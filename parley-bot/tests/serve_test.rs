//! End-to-end serve loop test with mocked Telegram and OpenAI APIs.
//!
//! One private message travels through polling, the pipeline, the completion
//! client, and back out as a reply, with the status indicator retired after
//! the lock is released.

use std::sync::Arc;
use std::time::Duration;

use parley_bot::app::build_pipeline;
use parley_bot::{App, OpenAiCompletion, SqliteAccountStore, TelegramTransport};
use parley_common::Config;
use parley_session::notices;
use parley_session::{create_store, StoreBackend, UserId};
use serde_json::json;
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TOKEN: &str = "123:SERVE";

async fn wait_for<F>(server: &MockServer, done: F)
where
    F: Fn(&[Request]) -> bool,
{
    for _ in 0..100 {
        let requests = server.received_requests().await.unwrap_or_default();
        if done(&requests) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for expected requests");
}

fn calls_to(requests: &[Request], method_name: &str) -> Vec<serde_json::Value> {
    let wanted = format!("/bot{TOKEN}/{method_name}");
    requests
        .iter()
        .filter(|r| r.url.path() == wanted)
        .filter_map(|r| r.body_json().ok())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_round_trip() {
    let telegram_api = MockServer::start().await;
    let openai_api = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getUpdates")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [{
                "update_id": 500,
                "message": {
                    "message_id": 31,
                    "from": { "id": 42, "first_name": "Ada", "username": "ada" },
                    "chat": { "id": 42, "type": "private" },
                    "text": "What is Rust?"
                }
            }]
        })))
        .up_to_n_times(1)
        .mount(&telegram_api)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getUpdates")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": true, "result": [] }))
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&telegram_api)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 700 }
        })))
        .mount(&telegram_api)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/deleteMessage")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })))
        .mount(&telegram_api)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "A systems language." } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 4 }
        })))
        .expect(1)
        .mount(&openai_api)
        .await;

    let mut config = Config::default();
    config.telegram.bot_token = TOKEN.into();
    config.telegram.api_base = telegram_api.uri();
    config.telegram.poll_timeout_secs = 0;
    config.llm.api_key = "sk-test".into();
    config.llm.base_url = openai_api.uri();

    let dir = tempfile::tempdir().unwrap();
    let accounts = Arc::new(
        SqliteAccountStore::open(&dir.path().join("parley.db"), config.quota.clone()).unwrap(),
    );
    let store = create_store(StoreBackend::Memory, &config.redis).await.unwrap();
    let telegram = Arc::new(TelegramTransport::new(&config.telegram));
    let completion = Arc::new(OpenAiCompletion::new(&config.llm).unwrap());
    let pipeline = Arc::new(build_pipeline(
        &config,
        store,
        accounts.clone(),
        completion,
        telegram.clone(),
    ));

    let app = App::new(pipeline.clone(), telegram);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(app.run(async {
        let _ = stop_rx.await;
    }));

    wait_for(&telegram_api, |requests| {
        !calls_to(requests, "deleteMessage").is_empty()
    })
    .await;

    let _ = stop_tx.send(());
    running.await.unwrap().unwrap();

    let requests = telegram_api.received_requests().await.unwrap();
    let texts: Vec<String> = calls_to(&requests, "sendMessage")
        .iter()
        .filter_map(|b| b["text"].as_str().map(str::to_string))
        .collect();
    assert_eq!(
        texts,
        vec![
            notices::WELCOME.to_string(),
            notices::PROCESSING.to_string(),
            "A systems language.".to_string(),
        ]
    );

    let deletes = calls_to(&requests, "deleteMessage");
    assert_eq!(deletes[0]["message_id"], 700);

    assert!(!pipeline
        .coordinator()
        .is_in_flight(UserId(42))
        .await
        .unwrap());
    assert_eq!(pipeline.history().exchange_count(UserId(42)).await.unwrap(), 1);

    let stats = accounts.stats(UserId(42)).unwrap().unwrap();
    assert_eq!(stats.num_requests, 1);
    assert_eq!(stats.num_input_tokens, 12);
    assert_eq!(stats.num_output_tokens, 4);
}
