//! Keyword registry, loaded once from embedded data.
//!
//! All keyword lists used by the link classifier, pre-scan, and document
//! classifier live in `keywords.json`. Adding a synonym or language is a
//! data edit; nothing here encodes individual keywords.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::types::DocumentType;

const DATA: &str = include_str!("keywords.json");

static REGISTRY: Lazy<KeywordRegistry> =
    Lazy::new(|| serde_json::from_str(DATA).expect("embedded keywords.json is valid"));

/// The process-wide keyword registry.
pub fn registry() -> &'static KeywordRegistry {
    &REGISTRY
}

#[derive(Debug, Deserialize)]
pub struct KeywordRegistry {
    types: HashMap<String, TypeKeywords>,
    pub link_buckets: LinkBuckets,
    pub doc_link_keywords: Vec<String>,
    pub portal_host_indicators: Vec<String>,
    pub platform_host_indicators: Vec<String>,
    pub portal_text_keywords: Vec<String>,
    pub high_value_resource_keywords: Vec<String>,
    pub rejection_keywords: Vec<String>,
    pub pagination_params: Vec<String>,
    pub skip_domains: Vec<String>,
    pub noise_paths: Vec<String>,
    pub cdn_allowlist: Vec<String>,
    /// Multi-edition fairs sharing one domain: fair slug -> city -> slugs of
    /// the OTHER editions, used to reject wrong-edition documents.
    pub edition_map: HashMap<String, HashMap<String, Vec<String>>>,
    pub frontier: FrontierPaths,
}

/// Path and host guesses used when building the pre-scan visit list.
#[derive(Debug, Deserialize)]
pub struct FrontierPaths {
    pub priority_paths: Vec<String>,
    pub subdomain_prefixes: Vec<String>,
    pub generic_paths: Vec<String>,
    pub fair_path_suffixes: Vec<String>,
    pub locale_paths: HashMap<String, Vec<String>>,
    pub ecosystem_hosts: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TypeKeywords {
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub title_keywords: Vec<String>,
    #[serde(default)]
    pub content_keywords: Vec<String>,
    #[serde(default)]
    pub pdf_keywords: Vec<String>,
    #[serde(default)]
    pub pdf_exclusions: Vec<String>,
    #[serde(default)]
    pub download_keywords: Vec<String>,
    #[serde(default)]
    pub download_url_keywords: Vec<String>,
    #[serde(default)]
    pub download_exclusions: Vec<String>,
    #[serde(default)]
    pub scoring_strong: Vec<String>,
    #[serde(default)]
    pub scoring_medium: Vec<String>,
    #[serde(default)]
    pub scoring_penalties: Vec<String>,
}

static EMPTY: Lazy<TypeKeywords> = Lazy::new(TypeKeywords::default);

impl KeywordRegistry {
    pub fn for_type(&self, doc_type: DocumentType) -> &TypeKeywords {
        self.types.get(doc_type.as_str()).unwrap_or(&EMPTY)
    }

    /// URL paths worth probing for every fair, derived from all types.
    pub fn frontier_paths(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        let mut paths = Vec::new();
        for doc_type in DocumentType::ALL {
            for path in &self.for_type(doc_type).url_patterns {
                if seen.insert(path.as_str()) {
                    paths.push(path.as_str());
                }
            }
        }
        paths
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkBuckets {
    pub download: Vec<String>,
    pub exhibitor: Vec<String>,
    pub high_value: Vec<String>,
}
