//! Core data model for the discovery pipeline.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::phases::PhaseId;

// ============================================================================
// ENUMS
// ============================================================================

/// The five document types hunted per fair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Floorplan,
    ExhibitorManual,
    Rules,
    Schedule,
    ExhibitorDirectory,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::Floorplan,
        DocumentType::ExhibitorManual,
        DocumentType::Rules,
        DocumentType::Schedule,
        DocumentType::ExhibitorDirectory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Floorplan => "floorplan",
            DocumentType::ExhibitorManual => "exhibitor_manual",
            DocumentType::Rules => "rules",
            DocumentType::Schedule => "schedule",
            DocumentType::ExhibitorDirectory => "exhibitor_directory",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentType::Floorplan => "Floorplan",
            DocumentType::ExhibitorManual => "Exhibitor manual",
            DocumentType::Rules => "Technical regulations",
            DocumentType::Schedule => "Build-up and tear-down schedule",
            DocumentType::ExhibitorDirectory => "Exhibitor directory",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.iter().find(|t| t.as_str() == s).copied()
    }
}

/// How confident we are that a found URL is the real document.
///
/// Variants are ordered so that `Ord` ranks stronger confidence higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Weak,
    Partial,
    Strong,
}

impl Confidence {
    /// A document counts as found only at strong or partial confidence.
    pub fn is_found(&self) -> bool {
        matches!(self, Confidence::Strong | Confidence::Partial)
    }
}

/// Completeness of a fair's document set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairStatus {
    Complete,
    Partial,
    Missing,
}

impl FairStatus {
    pub fn from_counts(found: usize, total: usize) -> Self {
        if total > 0 && found == total {
            FairStatus::Complete
        } else if found > 0 {
            FairStatus::Partial
        } else {
            FairStatus::Missing
        }
    }
}

/// Lifecycle of a discovery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

// ============================================================================
// LINK AND PDF CANDIDATES (ephemeral, pre-scan output)
// ============================================================================

/// A link extracted from a rendered page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCandidate {
    pub url: Url,
    pub text: String,
    pub is_pdf: bool,
}

impl LinkCandidate {
    pub fn new(url: Url, text: impl Into<String>, is_pdf: bool) -> Self {
        Self {
            url,
            text: text.into(),
            is_pdf,
        }
    }
}

/// A PDF spotted during pre-scan, with best-effort year and type tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfCandidate {
    pub url: Url,
    pub text: String,
    pub doc_type: Option<DocumentType>,
    pub year: Option<u16>,
    pub source_page: Url,
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// One build-up or tear-down row extracted from a schedule document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub date: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl ScheduleEntry {
    /// Deduplication key for merged schedule lists.
    pub fn dedup_key(&self) -> (String, Option<String>) {
        (self.date.clone(), self.time.clone())
    }
}

/// Outcome of validating a single document candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentClassification {
    pub url: Url,
    pub doc_type: DocumentType,
    pub confidence: Confidence,
    pub year: Option<u16>,
    pub title: Option<String>,
    pub reason: String,
    pub type_verified: bool,
    pub fair_verified: bool,
    pub year_verified: bool,
    pub content_useful: bool,
    #[serde(default)]
    pub extracted_schedule: FairSchedule,
}

// ============================================================================
// DISCOVERY OUTPUT
// ============================================================================

/// One URL slot per document type, plus the exhibitor overview page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Documents {
    pub floorplan: Option<Url>,
    pub exhibitor_manual: Option<Url>,
    pub rules: Option<Url>,
    pub schedule: Option<Url>,
    pub exhibitor_directory: Option<Url>,
    pub overview: Option<Url>,
}

impl Documents {
    pub fn get(&self, doc_type: DocumentType) -> Option<&Url> {
        self.slot(doc_type).as_ref()
    }

    fn slot(&self, doc_type: DocumentType) -> &Option<Url> {
        match doc_type {
            DocumentType::Floorplan => &self.floorplan,
            DocumentType::ExhibitorManual => &self.exhibitor_manual,
            DocumentType::Rules => &self.rules,
            DocumentType::Schedule => &self.schedule,
            DocumentType::ExhibitorDirectory => &self.exhibitor_directory,
        }
    }

    fn slot_mut(&mut self, doc_type: DocumentType) -> &mut Option<Url> {
        match doc_type {
            DocumentType::Floorplan => &mut self.floorplan,
            DocumentType::ExhibitorManual => &mut self.exhibitor_manual,
            DocumentType::Rules => &mut self.rules,
            DocumentType::Schedule => &mut self.schedule,
            DocumentType::ExhibitorDirectory => &mut self.exhibitor_directory,
        }
    }
}

/// Per-type confidence, defaulting to `None` for empty slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quality {
    pub floorplan: Confidence,
    pub exhibitor_manual: Confidence,
    pub rules: Confidence,
    pub schedule: Confidence,
    pub exhibitor_directory: Confidence,
}

impl Default for Quality {
    fn default() -> Self {
        Self {
            floorplan: Confidence::None,
            exhibitor_manual: Confidence::None,
            rules: Confidence::None,
            schedule: Confidence::None,
            exhibitor_directory: Confidence::None,
        }
    }
}

impl Quality {
    pub fn get(&self, doc_type: DocumentType) -> Confidence {
        match doc_type {
            DocumentType::Floorplan => self.floorplan,
            DocumentType::ExhibitorManual => self.exhibitor_manual,
            DocumentType::Rules => self.rules,
            DocumentType::Schedule => self.schedule,
            DocumentType::ExhibitorDirectory => self.exhibitor_directory,
        }
    }

    fn set(&mut self, doc_type: DocumentType, confidence: Confidence) {
        match doc_type {
            DocumentType::Floorplan => self.floorplan = confidence,
            DocumentType::ExhibitorManual => self.exhibitor_manual = confidence,
            DocumentType::Rules => self.rules = confidence,
            DocumentType::Schedule => self.schedule = confidence,
            DocumentType::ExhibitorDirectory => self.exhibitor_directory = confidence,
        }
    }
}

/// Per-type reasoning text explaining how the slot was filled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reasoning {
    pub floorplan: Option<String>,
    pub exhibitor_manual: Option<String>,
    pub rules: Option<String>,
    pub schedule: Option<String>,
    pub exhibitor_directory: Option<String>,
}

impl Reasoning {
    pub fn get(&self, doc_type: DocumentType) -> Option<&str> {
        let slot = match doc_type {
            DocumentType::Floorplan => &self.floorplan,
            DocumentType::ExhibitorManual => &self.exhibitor_manual,
            DocumentType::Rules => &self.rules,
            DocumentType::Schedule => &self.schedule,
            DocumentType::ExhibitorDirectory => &self.exhibitor_directory,
        };
        slot.as_deref()
    }

    /// Record reasoning for a slot, also used for rejections that leave
    /// the document URL empty.
    pub fn set(&mut self, doc_type: DocumentType, reasoning: String) {
        let slot = match doc_type {
            DocumentType::Floorplan => &mut self.floorplan,
            DocumentType::ExhibitorManual => &mut self.exhibitor_manual,
            DocumentType::Rules => &mut self.rules,
            DocumentType::Schedule => &mut self.schedule,
            DocumentType::ExhibitorDirectory => &mut self.exhibitor_directory,
        };
        *slot = Some(reasoning);
    }
}

/// Build-up and tear-down schedule extracted for the fair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FairSchedule {
    pub build_up: Vec<ScheduleEntry>,
    pub tear_down: Vec<ScheduleEntry>,
}

impl FairSchedule {
    pub fn is_empty(&self) -> bool {
        self.build_up.is_empty() && self.tear_down.is_empty()
    }

    /// Append entries, dropping rows whose (date, time) is already present.
    pub fn merge_build_up(&mut self, entries: impl IntoIterator<Item = ScheduleEntry>) {
        merge_deduped(&mut self.build_up, entries);
    }

    pub fn merge_tear_down(&mut self, entries: impl IntoIterator<Item = ScheduleEntry>) {
        merge_deduped(&mut self.tear_down, entries);
    }
}

fn merge_deduped(target: &mut Vec<ScheduleEntry>, entries: impl IntoIterator<Item = ScheduleEntry>) {
    for entry in entries {
        let key = entry.dedup_key();
        if !target.iter().any(|e| e.dedup_key() == key) {
            target.push(entry);
        }
    }
}

/// Trace data carried alongside the result for inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    pub visited_urls: Vec<String>,
    pub downloaded_files: Vec<String>,
    pub agent_actions: Vec<String>,
    pub notes: Vec<String>,
}

/// Final result of a discovery job.
///
/// A document slot is only ever populated together with a non-`None`
/// quality and a non-empty reasoning; `set_document` is the single write
/// path that maintains this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryOutput {
    pub fair_name: String,
    pub fair_year: u16,
    pub fair_city: String,
    pub fair_country: String,
    pub client_name: String,
    pub official_url: Option<Url>,
    pub documents: Documents,
    pub quality: Quality,
    pub reasoning: Reasoning,
    pub schedule: FairSchedule,
    pub debug: DebugInfo,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveryOutput {
    pub fn new(request: &DiscoveryRequest) -> Self {
        Self {
            fair_name: request.fair_name.clone(),
            fair_year: request.fair_year,
            fair_city: request.fair_city.clone(),
            fair_country: request.fair_country.clone(),
            client_name: request.client_name.clone(),
            official_url: None,
            documents: Documents::default(),
            quality: Quality::default(),
            reasoning: Reasoning::default(),
            schedule: FairSchedule::default(),
            debug: DebugInfo::default(),
            discovered_at: Utc::now(),
        }
    }

    /// Fill a document slot together with its quality and reasoning.
    ///
    /// Rejects `Confidence::None` and empty reasoning so a populated slot
    /// always carries both.
    pub fn set_document(
        &mut self,
        doc_type: DocumentType,
        url: Url,
        quality: Confidence,
        reasoning: impl Into<String>,
    ) {
        let reasoning = reasoning.into();
        if quality == Confidence::None || reasoning.trim().is_empty() {
            return;
        }
        *self.documents.slot_mut(doc_type) = Some(url);
        self.quality.set(doc_type, quality);
        self.reasoning.set(doc_type, reasoning);
    }

    pub fn document(&self, doc_type: DocumentType) -> Option<&Url> {
        self.documents.get(doc_type)
    }

    /// Whether the slot is empty, used for first-writer-wins merges.
    pub fn is_slot_empty(&self, doc_type: DocumentType) -> bool {
        self.documents.get(doc_type).is_none()
    }

    /// Types found at strong or partial confidence.
    pub fn found_count(&self) -> usize {
        DocumentType::ALL
            .iter()
            .filter(|t| self.documents.get(**t).is_some() && self.quality.get(**t).is_found())
            .count()
    }

    pub fn status(&self) -> FairStatus {
        FairStatus::from_counts(self.found_count(), DocumentType::ALL.len())
    }

    pub fn missing_types(&self) -> Vec<DocumentType> {
        DocumentType::ALL
            .iter()
            .filter(|t| !(self.documents.get(**t).is_some() && self.quality.get(**t).is_found()))
            .copied()
            .collect()
    }
}

// ============================================================================
// JOBS
// ============================================================================

/// What to discover: the fair's identity as entered by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub fair_name: String,
    pub fair_year: u16,
    #[serde(default)]
    pub fair_city: String,
    #[serde(default)]
    pub fair_country: String,
    #[serde(default)]
    pub client_name: String,
    /// Skips URL lookup when the official site is already known.
    #[serde(default)]
    pub known_url: Option<Url>,
}

/// Maximum log lines retained per job.
pub const JOB_LOG_CAPACITY: usize = 200;

/// A discovery job and its observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryJob {
    pub id: Uuid,
    pub request: DiscoveryRequest,
    pub status: JobStatus,
    pub current_phase: PhaseId,
    pub logs: VecDeque<String>,
    pub started_at: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<DiscoveryOutput>,
    pub error: Option<String>,
}

impl DiscoveryJob {
    pub fn new(request: DiscoveryRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request,
            status: JobStatus::Pending,
            current_phase: PhaseId::UrlLookup,
            logs: VecDeque::new(),
            started_at: now,
            phase_started_at: now,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    /// Append a timestamped log line, evicting the oldest past capacity.
    pub fn push_log(&mut self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Utc::now().format("%H:%M:%S"), message.as_ref());
        if self.logs.len() >= JOB_LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    pub fn enter_phase(&mut self, phase: PhaseId) {
        self.current_phase = phase;
        self.phase_started_at = Utc::now();
    }
}
