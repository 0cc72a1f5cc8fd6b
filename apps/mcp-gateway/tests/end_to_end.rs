mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mcp_gateway::model::RunStatus;
use mcp_gateway::store::ServerRunStore;
use reqwest::StatusCode;
use serde_json::{json, Value};
use test_timeout::tokio_timeout_test;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use common::{spawn_gateway, test_state, wait_for_ready_runners, FakeRunner, SseReader, API_TOKEN, INSTANCE};

#[tokio_timeout_test(20)]
async fn sse_session_round_trip() {
    let (state, store) = test_state().await;
    let addr = spawn_gateway(state.clone()).await;
    let _runner = FakeRunner::connect(addr, &["docker"]).await;
    wait_for_ready_runners(&state, 1).await;

    let client = reqwest::Client::new();
    let stream = client
        .get(format!("http://{addr}/{INSTANCE}"))
        .bearer_auth(API_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);
    let session_id = stream.headers()["mcp-session-id"].to_str().unwrap().to_string();
    let mut events = SseReader::new(stream.bytes_stream());

    let (event, endpoint) = events.next_event().await.expect("endpoint event");
    assert_eq!(event, "endpoint");
    assert_eq!(endpoint, format!("/{INSTANCE}/sse?session_id={session_id}"));

    let posted = client
        .post(format!("http://{addr}{endpoint}"))
        .bearer_auth(API_TOKEN)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(posted.status(), StatusCode::ACCEPTED);

    let (event, data) = events.next_event().await.expect("reply event");
    assert_eq!(event, "message");
    let reply: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["echo"], "tools/list");

    let runs = store.runs_for_session(&session_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Active);
}

#[tokio_timeout_test(20)]
async fn streamable_post_streams_batch_replies() {
    let (state, _) = test_state().await;
    let addr = spawn_gateway(state.clone()).await;
    let _runner = FakeRunner::connect(addr, &["docker"]).await;
    wait_for_ready_runners(&state, 1).await;

    let batch = json!([
        {
            "jsonrpc": "2.0",
            "id": "init",
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
        },
        {"jsonrpc": "1.0", "id": 9, "method": "broken"},
        {"jsonrpc": "2.0", "id": 2, "method": "tools/list"}
    ]);
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/{INSTANCE}"))
        .bearer_auth(API_TOKEN)
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut events = SseReader::new(response.bytes_stream());

    let mut replies = Vec::new();
    while let Some((_, data)) = events.next_event().await {
        replies.push(serde_json::from_str::<Value>(&data).unwrap());
    }
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0]["id"], 9);
    assert_eq!(replies[0]["error"]["code"], -32600);
    let mut echoed: Vec<String> = replies[1..]
        .iter()
        .map(|reply| reply["result"]["echo"].as_str().unwrap().to_string())
        .collect();
    echoed.sort();
    assert_eq!(echoed, ["initialize", "tools/list"]);
}

#[tokio_timeout_test(20)]
async fn websocket_client_gets_init_and_replies() {
    let (state, _) = test_state().await;
    let addr = spawn_gateway(state.clone()).await;
    let _runner = FakeRunner::connect(addr, &["docker"]).await;
    wait_for_ready_runners(&state, 1).await;

    let mut request = format!("ws://{addr}/{INSTANCE}/ws")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {API_TOKEN}").parse().unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let next_json = |message: Option<Result<Message, WsError>>| -> Value {
        match message {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    };

    let init = next_json(socket.next().await);
    assert_eq!(init["method"], "metorial/debug");
    assert_eq!(init["params"]["type"], "init");

    socket.send(Message::Text("{not json".into())).await.unwrap();
    let parse_error = next_json(socket.next().await);
    assert_eq!(parse_error["error"]["code"], -32700);

    socket
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}).to_string(),
        ))
        .await
        .unwrap();
    let reply = next_json(socket.next().await);
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["result"]["echo"], "resources/list");
}

#[tokio_timeout_test(20)]
async fn runner_disconnect_fails_open_runs() {
    let (state, store) = test_state().await;
    let addr = spawn_gateway(state.clone()).await;
    let runner = FakeRunner::connect(addr, &["docker"]).await;
    wait_for_ready_runners(&state, 1).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/{INSTANCE}"))
        .bearer_auth(API_TOKEN)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    let session_id = response.headers()["mcp-session-id"].to_str().unwrap().to_string();
    let mut events = SseReader::new(response.bytes_stream());
    assert!(events.next_event().await.is_some());

    runner.disconnect();
    loop {
        let runs = store.runs_for_session(&session_id).await.unwrap();
        let failed = runs.iter().all(|run| run.status == RunStatus::Failed);
        if failed && state.runners().is_empty() {
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].failure_reason.as_deref(), Some("runner_disconnected"));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_frames_reach_the_runner_in_order() {
    const FRAMES: u64 = 1000;
    tokio::time::timeout(Duration::from_secs(30), async {
        let (state, _) = test_state().await;
        let addr = spawn_gateway(state.clone()).await;
        let _runner = FakeRunner::connect(addr, &["docker"]).await;
        wait_for_ready_runners(&state, 1).await;

        let mut request = format!("ws://{addr}/{INSTANCE}/ws")
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {API_TOKEN}").parse().unwrap(),
        );
        let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        for id in 0..FRAMES {
            socket
                .send(Message::Text(
                    json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"}).to_string(),
                ))
                .await
                .unwrap();
        }

        // The runner answers in arrival order, so reply ids must be ascending
        // and complete.
        let mut ids = Vec::new();
        while (ids.len() as u64) < FRAMES {
            let frame: Value = match socket.next().await {
                Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected frame after {} replies: {other:?}", ids.len()),
            };
            if frame.get("method").is_some() {
                continue;
            }
            assert!(frame.get("error").is_none(), "error reply: {frame}");
            ids.push(frame["id"].as_u64().unwrap());
        }
        assert_eq!(ids, (0..FRAMES).collect::<Vec<_>>());
    })
    .await
    .expect("timed out waiting for replies");
}
