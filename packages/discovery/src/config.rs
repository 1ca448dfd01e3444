//! Discovery pipeline configuration.

use std::time::Duration;

/// Budgets, model ids, and timeouts for a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Model driving the browser agent loop
    pub agent_model: String,
    /// Cheaper model for classification and URL lookup
    pub fast_model: String,
    /// Conversation budget for the browser agent
    pub max_agent_iterations: u32,
    /// Pages visited in the first pre-scan pass
    pub first_pass_limit: usize,
    /// Pages visited in the second pre-scan pass
    pub second_pass_limit: usize,
    /// Bytes fetched from a PDF before text extraction
    pub pdf_prefix_bytes: u64,
    /// PDF pages read for validation text
    pub pdf_text_pages: usize,
    /// Candidates validated per document type before giving up
    pub validation_limit: usize,
    /// Attempts to resolve the official website
    pub url_lookup_attempts: u32,
    /// Agent browser viewport
    pub display_width: u32,
    pub display_height: u32,
    /// Age at which terminal jobs become eligible for cleanup
    pub job_max_age: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            agent_model: "claude-sonnet-4-20250514".to_string(),
            fast_model: "claude-3-5-haiku-latest".to_string(),
            max_agent_iterations: 40,
            first_pass_limit: 20,
            second_pass_limit: 15,
            pdf_prefix_bytes: 300_000,
            pdf_text_pages: 10,
            validation_limit: 3,
            url_lookup_attempts: 3,
            display_width: 1280,
            display_height: 800,
            job_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DiscoveryConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(model) = std::env::var("DISCOVERY_AGENT_MODEL") {
            config.agent_model = model;
        }
        if let Ok(model) = std::env::var("DISCOVERY_FAST_MODEL") {
            config.fast_model = model;
        }
        if let Some(n) = env_parse("DISCOVERY_MAX_ITERATIONS") {
            config.max_agent_iterations = n;
        }
        if let Some(n) = env_parse("DISCOVERY_FIRST_PASS_LIMIT") {
            config.first_pass_limit = n;
        }
        if let Some(n) = env_parse("DISCOVERY_SECOND_PASS_LIMIT") {
            config.second_pass_limit = n;
        }
        if let Some(secs) = env_parse::<u64>("DISCOVERY_JOB_MAX_AGE_SECS") {
            config.job_max_age = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_agent_model(mut self, model: impl Into<String>) -> Self {
        self.agent_model = model.into();
        self
    }

    pub fn with_fast_model(mut self, model: impl Into<String>) -> Self {
        self.fast_model = model.into();
        self
    }

    pub fn with_max_agent_iterations(mut self, iterations: u32) -> Self {
        self.max_agent_iterations = iterations;
        self
    }

    pub fn with_scan_limits(mut self, first_pass: usize, second_pass: usize) -> Self {
        self.first_pass_limit = first_pass;
        self.second_pass_limit = second_pass;
        self
    }

    pub fn with_job_max_age(mut self, max_age: Duration) -> Self {
        self.job_max_age = max_age;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.max_agent_iterations, 40);
        assert_eq!(config.first_pass_limit, 20);
        assert_eq!(config.second_pass_limit, 15);
        assert!(config.validation_limit >= 1);
    }

    #[test]
    fn builder_overrides() {
        let config = DiscoveryConfig::default()
            .with_max_agent_iterations(10)
            .with_scan_limits(5, 3);
        assert_eq!(config.max_agent_iterations, 10);
        assert_eq!(config.first_pass_limit, 5);
        assert_eq!(config.second_pass_limit, 3);
    }
}
