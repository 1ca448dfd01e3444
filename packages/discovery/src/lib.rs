//! Automated discovery of exhibitor documents for trade fairs.
//!
//! Given a fair name, year, and city, the pipeline locates the official
//! fair website, pre-scans it for candidate PDFs and exhibitor pages,
//! validates candidates with a fast model, and falls back to a
//! tool-calling browser agent for anything the scan missed. Jobs run
//! concurrently under [`JobScheduler`] and report phase-based progress.
//!
//! ```rust,ignore
//! let config = DiscoveryConfig::from_env()?;
//! let engine = DiscoveryEngine::new(provider, fast_model, agent_model, fetcher, store, config);
//! let scheduler = JobScheduler::new(engine);
//! let id = scheduler.start(DiscoveryRequest::new("bauma", 2025, "Munich"));
//! ```

pub mod agent;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fair_match;
pub mod frontier;
pub mod keywords;
pub mod links;
pub mod phases;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod traits;
pub mod types;
pub mod url_lookup;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, Result};
pub use pipeline::DiscoveryEngine;
pub use scheduler::{JobHandle, JobRunner, JobScheduler, JobView};
pub use store::{FairStore, MemoryFairStore, StoredFair};
pub use traits::{
    AgentModel, BoundModel, BrowserDriver, BrowserProvider, ChatModel, DocumentFetcher,
    HttpDocumentFetcher,
};
pub use phases::PhaseId;
pub use types::{Confidence, DiscoveryOutput, DiscoveryRequest, DocumentType, JobStatus};
