//! Persistence of completed discovery results.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DiscoveryOutput, DiscoveryRequest, FairStatus};

/// Stable identifier for a fair edition, derived from name and year.
///
/// Lowercased; anything that is not alphanumeric or a space is dropped,
/// then spaces collapse to single hyphens. `"bauma 2025"` becomes
/// `"bauma-2025"`.
pub fn fair_id(fair_name: &str, fair_year: u16) -> String {
    let base = format!("{fair_name} {fair_year}");
    let cleaned: String = base
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join("-")
}

/// A discovery result kept by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFair {
    pub id: String,
    pub request: DiscoveryRequest,
    pub output: DiscoveryOutput,
    pub imported_at: DateTime<Utc>,
}

impl StoredFair {
    pub fn status(&self) -> FairStatus {
        self.output.status()
    }
}

#[async_trait]
pub trait FairStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert or replace the record for this fair edition. Returns the
    /// fair id the record was stored under.
    async fn import(
        &self,
        request: &DiscoveryRequest,
        output: &DiscoveryOutput,
    ) -> Result<String, Self::Error>;

    async fn get(&self, id: &str) -> Result<Option<StoredFair>, Self::Error>;

    /// All stored fairs, newest import first.
    async fn list(&self) -> Result<Vec<StoredFair>, Self::Error>;

    async fn delete(&self, id: &str) -> Result<bool, Self::Error>;
}

/// In-process store backed by a map.
#[derive(Clone, Default)]
pub struct MemoryFairStore {
    fairs: Arc<RwLock<HashMap<String, StoredFair>>>,
}

impl MemoryFairStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, StoredFair>> {
        self.fairs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, StoredFair>> {
        self.fairs.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FairStore for MemoryFairStore {
    type Error = Infallible;

    async fn import(
        &self,
        request: &DiscoveryRequest,
        output: &DiscoveryOutput,
    ) -> Result<String, Self::Error> {
        let id = fair_id(&request.fair_name, request.fair_year);
        let record = StoredFair {
            id: id.clone(),
            request: request.clone(),
            output: output.clone(),
            imported_at: Utc::now(),
        };
        self.write().insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredFair>, Self::Error> {
        Ok(self.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<StoredFair>, Self::Error> {
        let mut fairs: Vec<StoredFair> = self.read().values().cloned().collect();
        fairs.sort_by(|a, b| b.imported_at.cmp(&a.imported_at));
        Ok(fairs)
    }

    async fn delete(&self, id: &str) -> Result<bool, Self::Error> {
        Ok(self.write().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, year: u16) -> DiscoveryRequest {
        DiscoveryRequest {
            fair_name: name.to_string(),
            fair_year: year,
            fair_city: "Munich".to_string(),
            fair_country: "Germany".to_string(),
            client_name: "Acme Stands".to_string(),
            known_url: None,
        }
    }

    #[test]
    fn fair_id_is_a_stable_slug() {
        assert_eq!(fair_id("bauma", 2025), "bauma-2025");
        assert_eq!(fair_id("Salone del Mobile", 2026), "salone-del-mobile-2026");
        assert_eq!(fair_id("K (Kunststoffmesse)!", 2025), "k-kunststoffmesse-2025");
    }

    #[tokio::test]
    async fn import_replaces_existing_edition() {
        let store = MemoryFairStore::new();
        let req = request("bauma", 2025);

        let id = store.import(&req, &DiscoveryOutput::new(&req)).await.unwrap();
        assert_eq!(id, "bauma-2025");

        let mut second = DiscoveryOutput::new(&req);
        second.debug.notes.push("second run".to_string());
        store.import(&req, &second).await.unwrap();

        let fairs = store.list().await.unwrap();
        assert_eq!(fairs.len(), 1);
        assert_eq!(fairs[0].output.debug.notes, vec!["second run".to_string()]);
    }

    #[tokio::test]
    async fn delete_reports_whether_record_existed() {
        let store = MemoryFairStore::new();
        let req = request("bauma", 2025);
        store.import(&req, &DiscoveryOutput::new(&req)).await.unwrap();

        assert!(store.delete("bauma-2025").await.unwrap());
        assert!(!store.delete("bauma-2025").await.unwrap());
        assert!(store.get("bauma-2025").await.unwrap().is_none());
    }
}
