//! Error types for the real-time layer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("NATS connect error: {0}")]
    NatsConnect(#[from] async_nats::ConnectError),

    #[error("NATS subscription error: {0}")]
    NatsSubscribe(#[from] async_nats::SubscribeError),

    #[error("NATS publish error: {0}")]
    NatsPublish(#[from] async_nats::PublishError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Broker closed topic: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
