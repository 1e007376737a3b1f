mod common;

use common::{client, listen, reply, reply_queue, server_channel, spawn_responder, EXCHANGE};
use futures::future::join_all;
use rabbit_rpc::PublishOptions;
use rabbit_rpc::{ConnectionState, MemoryBroker, RabbitError, RpcOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn echo_call_resolves_with_reply_data() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "echo", Duration::from_millis(1), |body| {
        Some(json!({"data": body, "error": false}))
    })
    .await;
    let client = client(&broker);

    let result: Value = client
        .rpc_exec("echo", &json!({"n": 1}), RpcOptions::default())
        .await
        .unwrap();

    assert_eq!(result, json!({"n": 1}));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "echo", Duration::ZERO, |_| None).await;
    let client = client(&broker);
    client.wait_ready().await.unwrap();

    let started = Instant::now();
    let err = client
        .rpc_exec::<_, Value>("echo", &json!({}), RpcOptions::with_timeout_ms(50))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.to_string().contains("50"));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn client_error_carries_messages() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "validate", Duration::ZERO, |_| {
        Some(json!({"data": ["bad field"], "error": true, "trace": null}))
    })
    .await;
    let client = client(&broker);

    let err = client
        .rpc_exec::<_, Value>("validate", &json!({"field": 1}), RpcOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_client_error());
    assert_eq!(err.client_messages(), Some(&["bad field".to_string()][..]));
}

#[tokio::test(start_paused = true)]
async fn consumer_crash_is_opaque() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "explode", Duration::ZERO, |_| {
        Some(json!({"data": null, "error": true, "trace": "stack..."}))
    })
    .await;
    let client = client(&broker);

    let err = client
        .rpc_exec::<_, Value>("explode", &json!({}), RpcOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RabbitError::ConsumerFailure));
    assert!(!err.to_string().contains("stack"));
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_has_no_effect() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "slow", Duration::from_millis(100), |body| {
        Some(json!({"data": body}))
    })
    .await;
    let client = client(&broker);

    let err = client
        .rpc_exec::<_, Value>("slow", &json!(1), RpcOptions::with_timeout_ms(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // Let the reply arrive; it must be dropped quietly.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.state(), ConnectionState::Ready);

    let ok: Value = client
        .rpc_exec("slow", &json!(2), RpcOptions::with_timeout_ms(500))
        .await
        .unwrap();
    assert_eq!(ok, json!(2));
}

#[tokio::test(start_paused = true)]
async fn replies_are_matched_by_correlation_id_not_order() {
    let broker = MemoryBroker::new();
    let mut requests = listen(&broker, "batch").await;
    let server = server_channel(&broker).await;
    let client = client(&broker);

    // Collect every request, then answer them newest first.
    tokio::spawn(async move {
        let mut pending = Vec::new();
        while pending.len() < 5 {
            pending.push(requests.recv().await.unwrap());
        }
        for request in pending.into_iter().rev() {
            let body: Value = serde_json::from_slice(&request.content).unwrap();
            reply(&server, &request, json!({"data": {"echo": body}})).await;
        }
    });

    let calls = (0..5).map(|n| {
        let client = &client;
        async move {
            client
                .rpc_exec::<_, Value>("batch", &json!(n), RpcOptions::default())
                .await
        }
    });
    let results = join_all(calls).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!({"echo": n}));
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn request_carries_reply_address_and_expiration() {
    let broker = MemoryBroker::new();
    let mut requests = listen(&broker, "inspect").await;
    let client = Arc::new(client(&broker));

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller
            .rpc_exec::<_, Value>("inspect", &json!({"a": 1}), RpcOptions::with_timeout_ms(750))
            .await
    });

    let request = requests.recv().await.unwrap();
    let props = &request.properties;
    assert_eq!(props.content_type.as_deref(), Some("application/json"));
    assert_eq!(props.expiration.as_deref(), Some("750"));
    assert!(props.correlation_id.is_some());
    assert_eq!(props.reply_to, reply_queue(&broker));
    assert_eq!(request.fields.routing_key, "inspect");
    assert_eq!(serde_json::from_slice::<Value>(&request.content).unwrap(), json!({"a": 1}));

    let reply_to = props.reply_to.clone().unwrap();
    assert_eq!(broker.bindings(&reply_to, EXCHANGE), vec![reply_to.clone()]);

    assert!(call.await.unwrap().unwrap_err().is_timeout());
}

#[tokio::test(start_paused = true)]
async fn unmatched_reply_is_dropped() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "echo", Duration::ZERO, |body| {
        Some(json!({"data": body}))
    })
    .await;
    let client = client(&broker);
    client.wait_ready().await.unwrap();

    let stray = server_channel(&broker).await;
    stray
        .publish(
            EXCHANGE,
            &reply_queue(&broker).unwrap(),
            serde_json::to_vec(&json!({"data": "nobody asked"})).unwrap(),
            PublishOptions {
                correlation_id: Some("not-a-real-call".to_string()),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(client.pending_calls(), 0);
    let ok: Value = client
        .rpc_exec("echo", &json!("still works"), RpcOptions::default())
        .await
        .unwrap();
    assert_eq!(ok, json!("still works"));
}

#[tokio::test(start_paused = true)]
async fn typed_results_deserialize_from_data() {
    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Sum {
        total: i64,
    }

    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "sum", Duration::ZERO, |body| {
        let total: i64 = body
            .as_array()
            .map(|values| values.iter().filter_map(Value::as_i64).sum())
            .unwrap_or(0);
        Some(json!({"data": {"total": total}}))
    })
    .await;
    let client = client(&broker);

    let sum: Sum = client
        .rpc_exec("sum", &[1, 2, 3], RpcOptions::default())
        .await
        .unwrap();
    assert_eq!(sum, Sum { total: 6 });

    let err = client
        .rpc_exec::<_, String>("sum", &[1], RpcOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitError::Deserialization(_)));
}

#[tokio::test(start_paused = true)]
async fn invalid_arguments_are_rejected_up_front() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let err = client
        .rpc_exec::<_, Value>("", &json!({}), RpcOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitError::InvalidArgument(_)));

    let err = client
        .rpc_exec::<_, Value>("echo", &json!({}), RpcOptions::with_timeout(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitError::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn close_rejects_outstanding_calls() {
    let broker = MemoryBroker::new();
    let _server = spawn_responder(&broker, "void", Duration::ZERO, |_| None).await;
    let client = Arc::new(client(&broker));
    client.wait_ready().await.unwrap();

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller
            .rpc_exec::<_, Value>("void", &json!({}), RpcOptions::with_timeout_ms(10_000))
            .await
    });
    while client.pending_calls() == 0 {
        tokio::task::yield_now().await;
    }

    client.close().await.unwrap();

    assert!(matches!(call.await.unwrap(), Err(RabbitError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.publish("void", &json!({}), PublishOptions::default()).await,
        Err(RabbitError::Closed)
    ));
    assert!(reply_queue(&broker).is_none());
}
