// demos/rpc_demo.rs
//
// cargo run --example rpc_demo -- [server|client|memory]
//
// `server` and `client` talk to the broker named by AMQP_ADDR / AMQP_EXCHANGE
// (a `.env` file works too). `memory` runs both sides in-process.
use anyhow::Result;
use rabbit_rpc::{
    ClientConfig, ConsumeOptions, MemoryBroker, Message, PublishOptions, RabbitClient,
    ReplyEnvelope, RpcOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct CalculationRequest {
    values: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalculationResponse {
    result: f64,
}

fn calculate(operation: &str, request: &CalculationRequest) -> ReplyEnvelope {
    if request.values.is_empty() {
        return ReplyEnvelope::client_error(vec!["values must not be empty".to_string()]);
    }
    let result: f64 = match operation {
        "add" => request.values.iter().sum(),
        "multiply" => request.values.iter().product(),
        other => return ReplyEnvelope::fatal(format!("no handler for {}", other)),
    };
    ReplyEnvelope::success(json!({ "result": result }))
}

async fn serve(client: Arc<RabbitClient>) -> Result<()> {
    for operation in ["add", "multiply"] {
        let replier = client.clone();
        client
            .consume(
                operation,
                move |message: Message<CalculationRequest>| {
                    let replier = replier.clone();
                    async move {
                        let (Some(reply_to), Some(correlation_id)) = (
                            message.properties.reply_to.clone(),
                            message.properties.correlation_id.clone(),
                        ) else {
                            anyhow::bail!("request without reply address");
                        };
                        let envelope = calculate(operation, &message.content);
                        let options = PublishOptions {
                            correlation_id: Some(correlation_id),
                            ..PublishOptions::default()
                        };
                        replier.publish(&reply_to, &envelope, options).await?;
                        Ok(())
                    }
                },
                ConsumeOptions::default(),
            )
            .await?;
        info!(operation, "Handler registered");
    }
    Ok(())
}

async fn call(client: &RabbitClient) -> Result<()> {
    let add: CalculationResponse = client
        .rpc_exec(
            "add",
            &CalculationRequest {
                values: vec![1.5, 2.5, 3.5],
            },
            RpcOptions::default(),
        )
        .await?;
    info!("Addition result: {}", add.result);

    let mul: CalculationResponse = client
        .rpc_exec(
            "multiply",
            &CalculationRequest {
                values: vec![2.0, 3.0, 4.0],
            },
            RpcOptions::with_timeout_ms(5_000),
        )
        .await?;
    info!("Multiplication result: {}", mul.result);

    match client
        .rpc_exec::<_, CalculationResponse>(
            "add",
            &CalculationRequest { values: vec![] },
            RpcOptions::default(),
        )
        .await
    {
        Ok(response) => info!("Unexpected result: {}", response.result),
        Err(e) if e.is_client_error() => {
            info!(messages = ?e.client_messages(), "Rejected as expected")
        }
        Err(e) => error!(error = %e, "Call failed"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = std::env::args().nth(1);
    match mode.as_deref() {
        Some("server") => {
            let client = Arc::new(RabbitClient::new(ClientConfig::from_env()?)?);
            serve(client.clone()).await?;
            info!("RPC server started. Press Ctrl+C to exit.");
            tokio::signal::ctrl_c().await?;
            client.close().await?;
        }
        Some("client") => {
            let client = RabbitClient::new(ClientConfig::from_env()?)?;
            call(&client).await?;
            client.close().await?;
        }
        Some("memory") => {
            let broker = MemoryBroker::new();
            let config = ClientConfig::new("memory://demo", "calculations");
            let server = Arc::new(RabbitClient::with_connector(
                config.clone(),
                Arc::new(broker.clone()),
            )?);
            serve(server.clone()).await?;

            let client = RabbitClient::with_connector(config, Arc::new(broker))?;
            call(&client).await?;
            client.close().await?;
            server.close().await?;
        }
        _ => println!("Usage: cargo run --example rpc_demo -- [server|client|memory]"),
    }
    Ok(())
}
