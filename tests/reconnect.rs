mod common;

use common::{client, config, listen, spawn_responder};
use rabbit_rpc::{
    ConnectionState, ConsumeOptions, MemoryBroker, Message, PublishOptions, RabbitClient,
    RabbitError, RpcOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn wait_for_state(client: &RabbitClient, wanted: impl Fn(&ConnectionState) -> bool) {
    while !wanted(&client.state()) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn requests_made_while_connecting_go_out_in_order() {
    let broker = MemoryBroker::new();
    let mut deliveries = listen(&broker, "ordered").await;
    let attempts_before = broker.connect_attempts();
    broker.fail_next_connects(2);

    let client = client(&broker);
    assert_eq!(client.state(), ConnectionState::Connecting);

    let (a, b, c) = tokio::join!(
        client.publish("ordered", &1, PublishOptions::default()),
        client.publish("ordered", &2, PublishOptions::default()),
        client.publish("ordered", &3, PublishOptions::default()),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    for expected in 1..=3 {
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(
            serde_json::from_slice::<i32>(&delivery.content).unwrap(),
            expected
        );
    }
    assert_eq!(broker.connect_attempts() - attempts_before, 3);
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_everything() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(10);
    let client = client(&broker);

    let err = client
        .rpc_exec::<_, Value>("echo", &json!({}), RpcOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitError::RetriesExhausted { attempts: 3 }));
    assert_eq!(client.state(), ConnectionState::Failed { attempts: 3 });
    assert_eq!(broker.connect_attempts(), 3);

    assert!(matches!(
        client.wait_ready().await,
        Err(RabbitError::RetriesExhausted { attempts: 3 })
    ));
    assert!(matches!(
        client.publish("echo", &1, PublishOptions::default()).await,
        Err(RabbitError::RetriesExhausted { .. })
    ));
    assert_eq!(client.pending_calls(), 0);

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn rpc_survives_a_dropped_connection() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "echo", Duration::ZERO, |body| {
        Some(json!({"data": body}))
    })
    .await;
    let client = client(&broker);

    let first: Value = client
        .rpc_exec("echo", &json!("before"), RpcOptions::default())
        .await
        .unwrap();
    assert_eq!(first, json!("before"));

    broker.fail_next_connects(1);
    broker.drop_connections();
    wait_for_state(&client, |state| {
        matches!(state, ConnectionState::Reconnecting { .. })
    })
    .await;

    // The old server went down with its connection.
    let _server = spawn_responder(&broker, "echo", Duration::ZERO, |body| {
        Some(json!({"data": body}))
    })
    .await;
    let second: Value = client
        .rpc_exec("echo", &json!("after"), RpcOptions::default())
        .await
        .unwrap();
    assert_eq!(second, json!("after"));
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(
        broker
            .queue_names()
            .iter()
            .filter(|name| name.starts_with("amq.gen-"))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn consumers_are_restored_after_reconnect() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .consume(
            "jobs",
            move |message: Message<u32>| {
                let tx = tx.clone();
                async move {
                    tx.send(message.content)?;
                    Ok(())
                }
            },
            ConsumeOptions::default(),
        )
        .await
        .unwrap();
    client.publish("jobs", &1u32, PublishOptions::default()).await.unwrap();
    assert_eq!(rx.recv().await, Some(1));

    let attempts = broker.connect_attempts();
    broker.drop_connections();
    client.publish("jobs", &2u32, PublishOptions::default()).await.unwrap();

    assert_eq!(rx.recv().await, Some(2));
    assert!(broker.connect_attempts() > attempts);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_while_reconnecting_fails_queued_requests() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(10);
    let client = Arc::new(
        RabbitClient::with_connector(
            config().with_reconnect_policy(5, 1_000),
            Arc::new(broker.clone()),
        )
        .unwrap(),
    );

    let publisher = client.clone();
    let queued = tokio::spawn(async move {
        publisher
            .publish("later", &json!({}), PublishOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!queued.is_finished());

    client.close().await.unwrap();

    assert!(matches!(queued.await.unwrap(), Err(RabbitError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(broker.connect_attempts() < 5);
}
