use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::rabbitmq::transport::ExchangeKind;

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const AMQP_EXCHANGE: &str = "AMQP_EXCHANGE";
pub const AMQP_EXCHANGE_KIND: &str = "AMQP_EXCHANGE_KIND";
pub const AMQP_RPC_TIMEOUT_MS: &str = "AMQP_RPC_TIMEOUT_MS";
pub const AMQP_RECONNECT_ATTEMPTS: &str = "AMQP_RECONNECT_ATTEMPTS";
pub const AMQP_RECONNECT_DELAY_MS: &str = "AMQP_RECONNECT_DELAY_MS";

fn parse_kind(value: &str) -> Result<ExchangeKind> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .with_context(|| format!("{} must be direct, topic or fanout, got {}", AMQP_EXCHANGE_KIND, value))
}

impl ClientConfig {
    /// Build a config from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup(AMQP_ADDR).with_context(|| format!("{} is not set", AMQP_ADDR))?;
        let exchange =
            lookup(AMQP_EXCHANGE).with_context(|| format!("{} is not set", AMQP_EXCHANGE))?;
        let mut config = ClientConfig::new(url, exchange);

        if let Some(kind) = lookup(AMQP_EXCHANGE_KIND) {
            config.exchange_kind = parse_kind(&kind)?;
        }
        if let Some(val) = lookup(AMQP_RPC_TIMEOUT_MS) {
            config.rpc_timeout_ms = val
                .parse()
                .with_context(|| format!("{} is not a number", AMQP_RPC_TIMEOUT_MS))?;
        }

        let mut reconnect = ReconnectPolicy::default();
        if let Some(val) = lookup(AMQP_RECONNECT_ATTEMPTS) {
            reconnect.max_attempts = val
                .parse()
                .with_context(|| format!("{} is not a number", AMQP_RECONNECT_ATTEMPTS))?;
        }
        if let Some(val) = lookup(AMQP_RECONNECT_DELAY_MS) {
            reconnect.delay_ms = val
                .parse()
                .with_context(|| format!("{} is not a number", AMQP_RECONNECT_DELAY_MS))?;
        }
        config.reconnect = reconnect;

        config.validate()?;
        Ok(config)
    }
}
