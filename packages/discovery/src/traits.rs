//! Seams between the pipeline and its collaborators.
//!
//! The browser, the models, and PDF fetching are all trait objects so the
//! pipeline can run against hand-written mocks in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use anthropic_client::{AnthropicClient, MessageRequest, MessageResponse};

use crate::types::LinkCandidate;

// ============================================================================
// BROWSER
// ============================================================================

/// Current page snapshot.
#[derive(Debug, Clone)]
pub struct PageState {
    pub url: Url,
    pub title: String,
}

/// A file the browser saved during the session.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub filename: String,
    pub url: Option<String>,
}

/// Primitive actions the agent can ask the browser to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ComputerAction {
    Screenshot,
    MouseMove { coordinate: [u32; 2] },
    LeftClick { coordinate: [u32; 2] },
    LeftClickDrag { start_coordinate: [u32; 2], coordinate: [u32; 2] },
    RightClick { coordinate: [u32; 2] },
    DoubleClick { coordinate: [u32; 2] },
    #[serde(rename = "type")]
    TypeText { text: String },
    Key { text: String },
    Scroll {
        coordinate: [u32; 2],
        scroll_direction: String,
        scroll_amount: u32,
    },
}

/// Rendered-browser adapter.
///
/// The pipeline drives one instance per job and never assumes a concrete
/// engine. All methods are cheap to mock.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Navigate and wait for the page to settle.
    async fn goto(&self, url: &Url) -> Result<PageState, Self::Error>;

    async fn current_state(&self) -> Result<PageState, Self::Error>;

    /// Extract links from the rendered DOM, including buttons, onclick
    /// handlers, and expanded accordions.
    async fn extract_links(&self) -> Result<Vec<LinkCandidate>, Self::Error>;

    /// Base64 PNG of the viewport.
    async fn screenshot(&self) -> Result<String, Self::Error>;

    /// Perform a primitive input action, returning a short observation.
    async fn perform(&self, action: &ComputerAction) -> Result<String, Self::Error>;

    /// Files downloaded during this session so far.
    async fn downloads(&self) -> Result<Vec<DownloadedFile>, Self::Error>;

    /// Release the underlying browser. Called on every job exit path.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Launches one browser per job.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    type Driver: BrowserDriver;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn launch(&self, width: u32, height: u32) -> Result<Self::Driver, Self::Error>;
}

// ============================================================================
// MODELS
// ============================================================================

/// Single-turn text completion, used by URL lookup and classification.
#[async_trait]
pub trait ChatModel: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn complete(&self, system: &str, user: &str) -> Result<String, Self::Error>;
}

/// Full multi-turn tool-calling conversation, used by the browser agent.
#[async_trait]
pub trait AgentModel: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create_message(&self, request: MessageRequest)
        -> Result<MessageResponse, Self::Error>;
}

/// An Anthropic client bound to a model id.
#[derive(Clone)]
pub struct BoundModel {
    client: AnthropicClient,
    model: String,
}

impl BoundModel {
    pub fn new(client: AnthropicClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatModel for BoundModel {
    type Error = anthropic_client::AnthropicError;

    async fn complete(&self, system: &str, user: &str) -> Result<String, Self::Error> {
        self.client.complete(&self.model, system, user).await
    }
}

#[async_trait]
impl AgentModel for BoundModel {
    type Error = anthropic_client::AnthropicError;

    async fn create_message(
        &self,
        request: MessageRequest,
    ) -> Result<MessageResponse, Self::Error> {
        // Requests are built by the agent loop; the bound model id wins.
        let request = MessageRequest {
            model: self.model.clone(),
            ..request
        };
        self.client.create_message(request).await
    }
}

// ============================================================================
// DOCUMENT FETCHING
// ============================================================================

/// Bounded document download for classification.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch at most `max_bytes` from the start of the document.
    async fn fetch_prefix(&self, url: &Url, max_bytes: u64) -> Result<Vec<u8>, Self::Error>;
}

/// HTTP fetcher using a `Range` request, falling back to truncating the
/// body when the server ignores the header.
#[derive(Clone, Default)]
pub struct HttpDocumentFetcher {
    client: reqwest::Client,
}

impl HttpDocumentFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    type Error = reqwest::Error;

    async fn fetch_prefix(&self, url: &Url, max_bytes: u64) -> Result<Vec<u8>, Self::Error> {
        let response = self
            .client
            .get(url.clone())
            .header("Range", format!("bytes=0-{}", max_bytes.saturating_sub(1)))
            .send()
            .await?;
        let bytes = response.bytes().await?;
        let take = bytes.len().min(max_bytes as usize);
        Ok(bytes[..take].to_vec())
    }
}
