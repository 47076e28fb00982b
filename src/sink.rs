//! Delivery sinks.
//!
//! A sink sends one rendered entry to one destination. Failures come back as
//! [`DeliveryError`] so the poll cycle can leave the entry unrecorded.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TelegramConfig;
use crate::error::DeliveryError;
use crate::feed::Entry;
use crate::{RelayError, Result};

/// Messaging transport.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Deliver `entry` to `destination`.
    async fn deliver(&self, destination: &str, entry: &Entry) -> std::result::Result<(), DeliveryError>;
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API sink (`sendMessage`).
pub struct TelegramSink {
    client: Client,
    endpoint: String,
    parse_mode: String,
}

impl TelegramSink {
    /// Create a sink from the Telegram configuration.
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if config.bot_token.is_empty() {
            return Err(RelayError::Config("bot token is not set".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
            parse_mode: config.parse_mode.clone(),
        })
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    async fn deliver(&self, destination: &str, entry: &Entry) -> std::result::Result<(), DeliveryError> {
        let body = SendMessage {
            chat_id: destination,
            text: entry.render(),
            parse_mode: &self.parse_mode,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // reqwest errors may carry the URL, which contains the token
                DeliveryError::new(destination, e.without_url().to_string())
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DeliveryError::new(destination, "rate limited"));
        }

        let api: Option<ApiResponse> = response.json().await.ok();
        match api {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => {
                debug!("Delivered {} to {}", entry.id, destination);
                Ok(())
            }
            Some(ApiResponse { description, .. }) => Err(DeliveryError::new(
                destination,
                description.unwrap_or_else(|| format!("HTTP {status}")),
            )),
            None => Err(DeliveryError::new(destination, format!("HTTP {status}"))),
        }
    }
}
