//! Pure Anthropic REST API client
//!
//! A clean, minimal client for the Anthropic Messages API with no
//! domain-specific logic. Supports multi-turn conversations, tool use
//! (including the computer-use tool), image content blocks, and automatic
//! retry with backoff on rate limits.
//!
//! # Example
//!
//! ```rust,ignore
//! use anthropic_client::{AnthropicClient, Message, MessageRequest};
//!
//! let client = AnthropicClient::from_env()?;
//!
//! let response = client
//!     .create_message(
//!         MessageRequest::new("claude-sonnet-4-20250514")
//!             .system("You are a helpful assistant")
//!             .message(Message::user("Hello!")),
//!     )
//!     .await?;
//!
//! println!("{}", response.text());
//! ```

pub mod error;
pub mod types;

pub use error::{AnthropicError, Result};
pub use types::*;

use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const RATE_LIMIT_ATTEMPTS: u32 = 5;

/// Pure Anthropic API client.
#[derive(Clone)]
pub struct AnthropicClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Create a new client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
        }
    }

    /// Create from environment variable `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AnthropicError::Config("ANTHROPIC_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (for proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a Messages API request.
    ///
    /// HTTP 429 responses are retried up to 5 times with exponential
    /// backoff plus jitter; other non-2xx responses fail immediately.
    pub async fn create_message(&self, request: MessageRequest) -> Result<MessageResponse> {
        let start = std::time::Instant::now();

        for attempt in 0..RATE_LIMIT_ATTEMPTS {
            let response = self
                .http_client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "Anthropic request failed");
                    AnthropicError::Network(e.to_string())
                })?;

            let status = response.status();

            if status.as_u16() == 429 {
                let error_text = response.text().await.unwrap_or_default();
                if attempt + 1 == RATE_LIMIT_ATTEMPTS {
                    return Err(AnthropicError::RateLimited {
                        attempts: RATE_LIMIT_ATTEMPTS,
                        message: error_text,
                    });
                }
                let delay = rate_limit_delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs_f64(),
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                warn!(status = %status, error = %error_text, "Anthropic API error");
                return Err(AnthropicError::Api(format!(
                    "Anthropic API error: {}",
                    error_text
                )));
            }

            let message: MessageResponse = response
                .json()
                .await
                .map_err(|e| AnthropicError::Parse(e.to_string()))?;

            debug!(
                model = %request.model,
                duration_ms = start.elapsed().as_millis(),
                stop_reason = ?message.stop_reason,
                "Anthropic message complete"
            );

            return Ok(message);
        }

        unreachable!("retry loop always returns")
    }

    /// Single-turn text completion convenience.
    pub async fn complete(
        &self,
        model: &str,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let response = self
            .create_message(
                MessageRequest::new(model)
                    .system(system)
                    .message(Message::user(user)),
            )
            .await?;
        Ok(response.text())
    }
}

/// Backoff for rate-limit retries: (2^attempt) * 5 seconds plus jitter.
fn rate_limit_delay(attempt: u32) -> Duration {
    let base = (1u64 << attempt) * 5;
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base as f64 + jitter)
}
