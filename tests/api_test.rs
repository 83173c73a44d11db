//! HTTP API tests against a live listener.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::net::TcpListener;

use common::{Harness, activated, harness, noop_node};
use gantry::{
    NodeId, TokenSet,
    events::ChangeStream,
    server::{ApiState, serve},
};

const TOKEN: &str = "tok_test_1";

async fn spawn_api(h: &Harness) -> Result<(SocketAddr, ChangeStream)> {
    let changes = ChangeStream::start(Arc::clone(h.store()));
    let state = ApiState {
        store: Arc::clone(h.store()),
        cache: Arc::clone(h.engine.cache()),
        handle: h.engine.handle(),
        changes: changes.sender(),
        tokens: Arc::new(TokenSet::parse(&format!("tester {TOKEN}\n"))),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(serve(listener, state));
    Ok((addr, changes))
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn requests_without_token_are_rejected() -> Result<()> {
    let h = harness().await;
    let (addr, _changes) = spawn_api(&h).await?;

    let response = client()
        .post(format!("http://{addr}/api/kill"))
        .json(&Vec::<NodeId>::new())
        .send()
        .await?;
    assert_eq!(response.status(), 401);

    let response = client()
        .post(format!("http://{addr}/api/kill"))
        .bearer_auth("wrong-token")
        .json(&Vec::<NodeId>::new())
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    Ok(())
}

#[tokio::test]
async fn submit_and_query_roundtrip() -> Result<()> {
    let h = harness().await;
    let (addr, _changes) = spawn_api(&h).await?;

    let node = activated(noop_node("api-node"));
    let response = client()
        .post(format!("http://{addr}/api/add-nodes"))
        .bearer_auth(TOKEN)
        .json(&vec![node])
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    let ids = body["ids"].as_array().unwrap();
    assert_eq!(ids.len(), 1);
    let id = ids[0].as_str().unwrap().to_string();

    h.settle(2).await;

    let response = client()
        .get(format!("http://{addr}/api/target/{id}"))
        .bearer_auth(TOKEN)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["name"], "api-node");
    assert_eq!(body["status"], "successful");
    let names: Vec<&str> = body["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.first().copied(), Some("passive"));
    assert_eq!(names.last().copied(), Some("finished"));
    assert!(names.contains(&"verified-success"));
    Ok(())
}

#[tokio::test]
async fn unknown_target_is_404() -> Result<()> {
    let h = harness().await;
    let (addr, _changes) = spawn_api(&h).await?;

    let response = client()
        .get(format!("http://{addr}/api/target/ghost"))
        .bearer_auth(TOKEN)
        .send()
        .await?;
    assert_eq!(response.status(), 404);
    Ok(())
}

#[tokio::test]
async fn kill_acknowledges() -> Result<()> {
    let h = harness().await;
    let (addr, _changes) = spawn_api(&h).await?;

    let response = client()
        .post(format!("http://{addr}/api/kill"))
        .bearer_auth(TOKEN)
        .json(&vec![NodeId::from("anything")])
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["ok"], true);
    Ok(())
}

#[tokio::test]
async fn change_stream_pushes_batches() -> Result<()> {
    let h = harness().await;
    let (addr, _changes) = spawn_api(&h).await?;

    let response = client()
        .get(format!("http://{addr}/api/changes?token={TOKEN}"))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let mut body = response.bytes_stream();

    // Produce some changes while the stream is attached.
    let node = activated(noop_node("streamed"));
    let id = node.id.clone();
    h.engine.handle().submit(vec![node]).await.unwrap();
    h.settle(1).await;

    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let chunk = tokio::time::timeout_at(deadline, body.next()).await;
        match chunk {
            Ok(Some(Ok(bytes))) => {
                collected.push_str(&String::from_utf8_lossy(&bytes));
                if collected.contains(id.as_str()) {
                    break;
                }
            }
            Ok(Some(Err(err))) => panic!("stream error: {err}"),
            Ok(None) => panic!("stream closed before any batch"),
            Err(_) => panic!("no batch within the deadline"),
        }
    }
    assert!(collected.contains("event: changes"));
    Ok(())
}
