//! Document classification and validation.
//!
//! Pre-scan PDF candidates are bucketed per document type by keyword, sorted
//! by year relevance, then the best few are downloaded and validated by the
//! fast model against strict criteria. The exhibitor directory is picked by
//! URL scoring alone, no download needed.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::keywords::registry;
use crate::traits::{ChatModel, DocumentFetcher, DownloadedFile};
use crate::types::{
    Confidence, DiscoveryOutput, DiscoveryRequest, DocumentClassification, DocumentType,
    FairSchedule, PdfCandidate, ScheduleEntry,
};

/// Types that are backed by a downloadable document. The directory is a web
/// page and goes through URL scoring instead.
pub const PDF_TYPES: [DocumentType; 4] = [
    DocumentType::Floorplan,
    DocumentType::ExhibitorManual,
    DocumentType::Rules,
    DocumentType::Schedule,
];

/// Minimum extracted characters before a document counts as readable.
const MIN_READABLE_CHARS: usize = 100;

/// Strong findings required before the browser agent can be skipped.
const SKIP_AGENT_STRONG_COUNT: usize = 3;

/// Aggregate classification outcome across all document types.
#[derive(Debug, Default)]
pub struct ClassificationSummary {
    pub findings: HashMap<DocumentType, DocumentClassification>,
    pub directory_url: Option<Url>,
    pub schedule: FairSchedule,
    pub found_types: Vec<DocumentType>,
    pub missing_types: Vec<DocumentType>,
    pub strong_count: usize,
}

impl ClassificationSummary {
    pub fn all_found(&self) -> bool {
        self.missing_types.is_empty()
    }

    /// Whether enough strong findings exist to skip the browser agent.
    pub fn skip_agent_safe(&self) -> bool {
        self.strong_count >= SKIP_AGENT_STRONG_COUNT
    }
}

/// Sort key for candidate validation order: exact target year first, then
/// newer years, then older, undated last.
pub fn year_sort_key(year: Option<u16>, target_year: u16) -> u8 {
    match year {
        Some(y) if y == target_year => 0,
        Some(y) if y > target_year => 1,
        Some(_) => 2,
        None => 3,
    }
}

/// URL slugs that identify the WRONG edition of a multi-edition fair.
pub fn edition_exclusions(fair_name: &str, city: &str) -> Vec<String> {
    let fair_lower = fair_name.to_lowercase();
    let city_lower = city.trim().to_lowercase();
    if city_lower.is_empty() {
        return Vec::new();
    }
    for (fair_key, editions) in &registry().edition_map {
        if fair_lower.contains(fair_key.as_str()) {
            if let Some(slugs) = editions.get(&city_lower) {
                let mut out: Vec<String> = slugs.iter().map(|e| format!("/{e}")).collect();
                out.extend(slugs.iter().map(|e| format!("-{e}")));
                return out;
            }
        }
    }
    Vec::new()
}

/// Group candidates into per-type buckets by PDF and title keyword.
/// Membership is non-exclusive: a manual that mentions regulations lands
/// in both buckets. Anchor text often carries the document title, so the
/// title keywords count alongside the filename patterns.
pub fn bucket_candidates(candidates: &[PdfCandidate]) -> HashMap<DocumentType, Vec<&PdfCandidate>> {
    let reg = registry();
    let mut buckets: HashMap<DocumentType, Vec<&PdfCandidate>> = HashMap::new();
    for candidate in candidates {
        let combined = format!(
            "{} {}",
            candidate.url.as_str().to_lowercase(),
            candidate.text.to_lowercase()
        );
        for doc_type in PDF_TYPES {
            let kw = reg.for_type(doc_type);
            if kw.pdf_keywords.is_empty() {
                continue;
            }
            let keyword_hit = kw
                .pdf_keywords
                .iter()
                .chain(kw.title_keywords.iter())
                .any(|k| combined.contains(k.as_str()));
            if !keyword_hit {
                continue;
            }
            if kw.pdf_exclusions.iter().any(|e| combined.contains(e.as_str())) {
                continue;
            }
            buckets.entry(doc_type).or_default().push(candidate);
        }
    }
    buckets
}

fn type_description(doc_type: DocumentType) -> &'static str {
    match doc_type {
        DocumentType::Floorplan => "hall or site plan of the fairgrounds",
        DocumentType::ExhibitorManual => "exhibitor manual or welcome pack with stand build rules",
        DocumentType::Rules => "technical guidelines or regulations for stand construction",
        DocumentType::Schedule => "build-up and tear-down schedule with dates and times",
        DocumentType::ExhibitorDirectory => "searchable list of exhibiting companies",
    }
}

#[derive(Debug, Default, Deserialize)]
struct Verdict {
    #[serde(default)]
    is_correct_type: bool,
    #[serde(default)]
    is_correct_fair: bool,
    #[serde(default)]
    is_correct_year: bool,
    #[serde(default)]
    is_useful: bool,
    #[serde(default)]
    detected_year: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    schedule_found: bool,
    #[serde(default)]
    build_up: Vec<VerdictScheduleRow>,
    #[serde(default)]
    tear_down: Vec<VerdictScheduleRow>,
}

#[derive(Debug, Deserialize)]
struct VerdictScheduleRow {
    date: String,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    description: String,
}

impl VerdictScheduleRow {
    fn into_entry(self, source_url: &Url) -> ScheduleEntry {
        ScheduleEntry {
            date: self.date,
            time: self.time,
            description: self.description,
            source_url: Some(source_url.as_str().to_string()),
        }
    }
}

/// Extract a JSON object from a model reply that may wrap it in a code
/// fence or surround it with prose.
pub(crate) fn parse_json_response<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let trimmed = text.trim();
    if let Some(fenced) = extract_fenced(trimmed) {
        if let Ok(value) = serde_json::from_str(fenced.trim()) {
            return Some(value);
        }
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    // Bare JSON embedded in prose: take the outermost braces.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        serde_json::from_str(&trimmed[start..=end]).ok()
    } else {
        None
    }
}

fn extract_fenced(text: &str) -> Option<&str> {
    let after = text.split_once("```json").or_else(|| text.split_once("```"))?.1;
    Some(after.split_once("```").map(|(inner, _)| inner).unwrap_or(after))
}

/// Strict confidence ladder. Strong needs every check; partial needs the
/// type plus either fair or year plus usefulness; type alone is weak.
fn confidence_ladder(type_ok: bool, fair_ok: bool, year_ok: bool, useful: bool) -> Confidence {
    if type_ok && fair_ok && year_ok && useful {
        Confidence::Strong
    } else if type_ok && (fair_ok || year_ok) && useful {
        Confidence::Partial
    } else if type_ok {
        Confidence::Weak
    } else {
        Confidence::None
    }
}

fn extract_pdf_text(bytes: &[u8], max_pages: usize) -> Option<String> {
    let doc = lopdf::Document::load_mem(bytes).ok()?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().take(max_pages).collect();
    let mut parts = Vec::new();
    for page in pages {
        if let Ok(text) = doc.extract_text(&[page]) {
            if !text.trim().is_empty() {
                parts.push(text);
            }
        }
    }
    let joined = parts.join("\n");
    if joined.trim().len() < MIN_READABLE_CHARS {
        None
    } else {
        Some(joined)
    }
}

const VALIDATION_SYSTEM: &str = "You validate documents for trade fair stand builders. \
Answer with a single JSON object and nothing else.";

fn validation_prompt(
    url: &Url,
    text: &str,
    doc_type: DocumentType,
    request: &DiscoveryRequest,
) -> String {
    let city_note = if request.fair_city.is_empty() {
        String::new()
    } else {
        format!(
            "\nTARGET EDITION: {}. Some fairs run several editions (Americas, Asia, Europe) \
from one website. If this document belongs to a different edition, is_correct_fair is false.",
            request.fair_city
        )
    };
    format!(
        r#"Analyze this document thoroughly.

DOCUMENT URL: {url}
TARGET FAIR: {fair_name}
TARGET YEAR: {year}
EXPECTED TYPE: {type_name} ({type_desc}){city_note}

DOCUMENT TEXT:
---
{text}
---

Answer in JSON:
{{
  "is_correct_type": true/false,
  "is_correct_fair": true/false,
  "is_correct_year": true/false,
  "is_useful": true/false,
  "detected_year": "2026" or "unknown",
  "title": "document title",
  "reason": "short explanation",
  "schedule_found": true/false,
  "build_up": [{{"date": "2026-03-01", "time": "08:00-20:00", "description": "..."}}],
  "tear_down": [{{"date": "2026-03-05", "time": "18:00-22:00", "description": "..."}}]
}}

Requirements:
- is_correct_type only when this really is a {type_name}
- is_correct_fair when the document names {fair_name} or its organizer, for the right edition
- is_correct_year when the document covers {year}
- is_useful when it contains concrete information for stand builders, not just a menu
- Extract build-up and tear-down dates whenever present, one entry per table row,
  even when this is not the expected type"#,
        url = url,
        fair_name = request.fair_name,
        year = request.fair_year,
        type_name = doc_type.as_str(),
        type_desc = type_description(doc_type),
        text = anthropic_client::truncate_to_char_boundary(text, 10_000),
        city_note = city_note,
    )
}

/// Validate already-extracted text against one expected type.
///
/// Local substring checks for year and fair name back up the model's
/// verdict so a conservative model answer cannot drop below what the text
/// plainly shows.
pub async fn validate_text<M: ChatModel>(
    model: &M,
    url: &Url,
    text: &str,
    doc_type: DocumentType,
    request: &DiscoveryRequest,
    fair_keywords: &[String],
) -> DocumentClassification {
    let mut classification = DocumentClassification {
        url: url.clone(),
        doc_type,
        confidence: Confidence::None,
        year: None,
        title: None,
        reason: String::new(),
        type_verified: false,
        fair_verified: false,
        year_verified: false,
        content_useful: false,
        extracted_schedule: FairSchedule::default(),
    };

    let year_full = request.fair_year.to_string();
    let year_short = &year_full[2..];
    let local_year = text.contains(&year_full) || text.contains(year_short);
    let text_lower = text.to_lowercase();
    let local_fair = fair_keywords.iter().any(|kw| text_lower.contains(kw.as_str()));

    let prompt = validation_prompt(url, text, doc_type, request);
    let reply = match model.complete(VALIDATION_SYSTEM, &prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "document validation call failed");
            classification.reason = format!("validation failed: {e}");
            return classification;
        }
    };
    let verdict: Verdict = match parse_json_response(&reply) {
        Some(verdict) => verdict,
        None => {
            tracing::warn!(url = %url, "unparseable validation reply");
            classification.reason = "unparseable validation reply".to_string();
            return classification;
        }
    };

    classification.type_verified = verdict.is_correct_type;
    classification.fair_verified = verdict.is_correct_fair || local_fair;
    classification.year_verified = verdict.is_correct_year || local_year;
    classification.content_useful = verdict.is_useful;
    classification.title = verdict.title;
    classification.reason = verdict.reason;
    classification.year = verdict
        .detected_year
        .as_deref()
        .and_then(|y| y.parse::<u16>().ok());
    if verdict.schedule_found {
        classification.extracted_schedule.merge_build_up(
            verdict.build_up.into_iter().map(|r| r.into_entry(url)),
        );
        classification.extracted_schedule.merge_tear_down(
            verdict.tear_down.into_iter().map(|r| r.into_entry(url)),
        );
    }
    classification.confidence = confidence_ladder(
        classification.type_verified,
        classification.fair_verified,
        classification.year_verified,
        classification.content_useful,
    );
    classification
}

/// Download, extract, and validate one PDF candidate.
async fn validate_candidate<M: ChatModel, F: DocumentFetcher>(
    model: &M,
    fetcher: &F,
    candidate: &PdfCandidate,
    doc_type: DocumentType,
    request: &DiscoveryRequest,
    fair_keywords: &[String],
    exclusions: &[String],
    config: &DiscoveryConfig,
) -> DocumentClassification {
    let mut classification = DocumentClassification {
        url: candidate.url.clone(),
        doc_type,
        confidence: Confidence::None,
        year: candidate.year,
        title: None,
        reason: String::new(),
        type_verified: false,
        fair_verified: false,
        year_verified: false,
        content_useful: false,
        extracted_schedule: FairSchedule::default(),
    };

    let url_lower = candidate.url.as_str().to_lowercase();
    if let Some(excl) = exclusions.iter().find(|e| url_lower.contains(e.as_str())) {
        classification.reason = format!("wrong edition: url contains '{excl}'");
        tracing::debug!(url = %candidate.url, slug = %excl, "wrong-edition candidate rejected");
        return classification;
    }

    let bytes = match fetcher
        .fetch_prefix(&candidate.url, config.pdf_prefix_bytes)
        .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(url = %candidate.url, error = %e, "pdf download failed");
            classification.reason = format!("download failed: {e}");
            return classification;
        }
    };

    match extract_pdf_text(&bytes, config.pdf_text_pages) {
        Some(text) => {
            let mut validated =
                validate_text(model, &candidate.url, &text, doc_type, request, fair_keywords)
                    .await;
            if validated.year.is_none() {
                validated.year = candidate.year;
            }
            validated
        }
        None => {
            // Keyword match stands, content cannot be verified.
            classification.confidence = Confidence::Weak;
            classification.type_verified = true;
            classification.reason = "no readable text extracted".to_string();
            classification
        }
    }
}

/// Score an exhibitor-page URL for how much it looks like the actual
/// directory rather than a resource page. Higher is better; only positive
/// scores are accepted.
pub fn score_directory_url(
    page: &Url,
    fair_host: Option<&str>,
    fair_keywords: &[String],
    exclusions: &[String],
) -> i32 {
    let kw = registry().for_type(DocumentType::ExhibitorDirectory);
    let host = page.host_str().unwrap_or_default().to_lowercase();
    let host = host.trim_start_matches("www.").to_string();
    let path = page.path().trim_end_matches('/').to_lowercase();
    let mut score = 0;

    if kw.url_patterns.iter().any(|p| path.ends_with(p.as_str())) {
        score += 10;
    }
    if kw.scoring_strong.iter().any(|k| path.contains(k.as_str())) {
        score += 5;
    }
    if kw.scoring_medium.iter().any(|k| path.contains(k.as_str())) {
        score += 3;
    }
    if score == 0 && path.contains("exhibitor") {
        score += 1;
    }
    if kw.scoring_penalties.iter().any(|k| path.contains(k.as_str())) {
        score -= 3;
    }

    if let Some(fair_host) = fair_host {
        let fair_host = fair_host.trim_start_matches("www.");
        if host.contains(fair_host) {
            score += 8;
        } else {
            let host_has_fair = fair_keywords
                .iter()
                .any(|kw| kw.len() >= 4 && host.contains(kw.as_str()));
            if !host_has_fair {
                // Off-domain page without the fair's name is likely another
                // fair's directory.
                score -= 6;
            }
        }
    }

    if exclusions.iter().any(|e| path.contains(e.as_str())) {
        score -= 15;
    }
    score
}

fn pick_directory(
    exhibitor_pages: &[Url],
    fair_host: Option<&str>,
    fair_keywords: &[String],
    exclusions: &[String],
) -> Option<Url> {
    let mut best: Option<(&Url, i32)> = None;
    for page in exhibitor_pages {
        let score = score_directory_url(page, fair_host, fair_keywords, exclusions);
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((page, score));
        }
    }
    match best {
        Some((url, score)) if score > 0 => {
            tracing::info!(url = %url, score, "exhibitor directory selected");
            Some(url.clone())
        }
        _ => None,
    }
}

/// Classify all pre-scan candidates for one fair.
///
/// Per type: sort candidates by year relevance, validate the top few
/// sequentially, stop at the first strong result and keep the first partial
/// as fallback. Validations are the slow path, so the loop checks for
/// cancellation between them.
pub async fn classify_documents<M: ChatModel, F: DocumentFetcher>(
    model: &M,
    fetcher: &F,
    candidates: &[PdfCandidate],
    exhibitor_pages: &[Url],
    request: &DiscoveryRequest,
    official_url: Option<&Url>,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Result<ClassificationSummary, DiscoveryError> {
    let fair_keywords = crate::fair_match::extract_fair_keywords(&request.fair_name);
    let exclusions = edition_exclusions(&request.fair_name, &request.fair_city);
    if !exclusions.is_empty() {
        tracing::info!(?exclusions, "edition exclusions active");
    }

    let mut summary = ClassificationSummary::default();
    let buckets = bucket_candidates(candidates);

    for doc_type in PDF_TYPES {
        let Some(bucket) = buckets.get(&doc_type) else {
            continue;
        };
        let mut sorted: Vec<&PdfCandidate> = bucket.clone();
        sorted.sort_by_key(|c| year_sort_key(c.year, request.fair_year));

        for candidate in sorted.into_iter().take(config.validation_limit) {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }
            let classification = validate_candidate(
                model,
                fetcher,
                candidate,
                doc_type,
                request,
                &fair_keywords,
                &exclusions,
                config,
            )
            .await;

            match classification.confidence {
                // Validation stops at the first strong or partial candidate;
                // later candidates in year order cannot displace it.
                Confidence::Strong | Confidence::Partial => {
                    tracing::info!(
                        doc_type = doc_type.as_str(),
                        confidence = ?classification.confidence,
                        url = %classification.url,
                        "document found"
                    );
                    summary.findings.insert(doc_type, classification);
                    break;
                }
                // Weak results are kept so their URL survives to the output,
                // but they never overwrite an earlier finding and the search
                // for something better continues.
                Confidence::Weak if !summary.findings.contains_key(&doc_type) => {
                    summary.findings.insert(doc_type, classification);
                }
                _ => {}
            }
        }
    }

    summary.directory_url = pick_directory(
        exhibitor_pages,
        official_url.and_then(|u| u.host_str()),
        &fair_keywords,
        &exclusions,
    );

    // Merge schedule rows from every validated document, not just the
    // schedule slot. Manuals often carry the build-up table.
    for classification in summary.findings.values() {
        summary
            .schedule
            .merge_build_up(classification.extracted_schedule.build_up.iter().cloned());
        summary
            .schedule
            .merge_tear_down(classification.extracted_schedule.tear_down.iter().cloned());
    }

    for doc_type in PDF_TYPES {
        match summary.findings.get(&doc_type) {
            Some(c) if c.confidence >= Confidence::Partial => {
                summary.found_types.push(doc_type);
                if c.confidence == Confidence::Strong {
                    summary.strong_count += 1;
                }
            }
            _ => summary.missing_types.push(doc_type),
        }
    }
    if summary.directory_url.is_some() {
        summary.found_types.push(DocumentType::ExhibitorDirectory);
    } else {
        summary.missing_types.push(DocumentType::ExhibitorDirectory);
    }

    tracing::info!(
        strong = summary.strong_count,
        found = summary.found_types.len(),
        missing = summary.missing_types.len(),
        "classification finished"
    );
    Ok(summary)
}

#[derive(Debug, Deserialize)]
struct ScheduleExtraction {
    #[serde(default)]
    schedule_found: bool,
    #[serde(default)]
    build_up: Vec<VerdictScheduleRow>,
    #[serde(default)]
    tear_down: Vec<VerdictScheduleRow>,
}

const SCHEDULE_SYSTEM: &str = "You extract build-up and tear-down schedules from trade \
fair documents. Answer with a single JSON object and nothing else.";

fn schedule_extraction_prompt(url: &Url, text: &str, request: &DiscoveryRequest) -> String {
    format!(
        r#"Extract the build-up and tear-down schedule from this document.

FAIR: {fair_name}
YEAR: {year}
DOCUMENT: {url}

TEXT:
---
{text}
---

Find ALL build-up (set-up, move-in) and tear-down (dismantling, move-out) dates and
times. One entry per row or day; if dates differ per stand size, one entry per stand
size. If no concrete dates appear, set schedule_found to false.

Answer in JSON:
{{
  "schedule_found": true/false,
  "build_up": [{{"date": "2026-03-01", "time": "08:00-20:00", "description": "..."}}],
  "tear_down": [{{"date": "2026-03-05", "time": "18:00-22:00", "description": "..."}}]
}}"#,
        fair_name = request.fair_name,
        year = request.fair_year,
        url = url,
        text = anthropic_client::truncate_to_char_boundary(text, 8_000),
    )
}

/// Scan files the browser agent downloaded for schedule data the filename
/// auto-map cannot see.
///
/// Pre-scan candidates get full content validation; agent downloads are
/// mapped by filename only. This pass reads each PDF the classifier has not
/// already seen, gates on schedule content keywords, and asks the fast
/// model to pull out the dates. Returns the number of PDFs sent to the
/// model; failures skip the file.
pub async fn extract_download_schedules<M: ChatModel, F: DocumentFetcher>(
    model: &M,
    fetcher: &F,
    downloads: &[DownloadedFile],
    classified: &HashSet<String>,
    request: &DiscoveryRequest,
    config: &DiscoveryConfig,
    output: &mut DiscoveryOutput,
) -> usize {
    let schedule_keywords = &registry().for_type(DocumentType::Schedule).content_keywords;
    let mut scanned = 0;

    for download in downloads {
        if !download.filename.to_lowercase().ends_with(".pdf") {
            continue;
        }
        let Some(raw_url) = download.url.as_deref() else {
            continue;
        };
        if classified.contains(raw_url) {
            continue;
        }
        let Ok(url) = Url::parse(raw_url) else {
            continue;
        };

        let bytes = match fetcher.fetch_prefix(&url, config.pdf_prefix_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "download fetch failed, skipping");
                continue;
            }
        };
        let Some(text) = extract_pdf_text(&bytes, config.pdf_text_pages) else {
            continue;
        };
        if text.len() < MIN_READABLE_CHARS {
            continue;
        }
        let text_lower = text.to_lowercase();
        if !schedule_keywords.iter().any(|kw| text_lower.contains(kw.as_str())) {
            continue;
        }

        scanned += 1;
        tracing::info!(file = %download.filename, "download carries schedule keywords, extracting");
        let prompt = schedule_extraction_prompt(&url, &text, request);
        let reply = match model.complete(SCHEDULE_SYSTEM, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "schedule extraction failed, skipping");
                continue;
            }
        };
        let Some(extraction) = parse_json_response::<ScheduleExtraction>(&reply) else {
            continue;
        };
        if !extraction.schedule_found {
            continue;
        }

        output
            .schedule
            .merge_build_up(extraction.build_up.into_iter().map(|r| r.into_entry(&url)));
        output
            .schedule
            .merge_tear_down(extraction.tear_down.into_iter().map(|r| r.into_entry(&url)));
    }

    if !output.schedule.is_empty() && output.quality.schedule != Confidence::Strong {
        output.quality.schedule = Confidence::Strong;
        if output.reasoning.schedule.is_none() {
            output.reasoning.schedule = Some(format!(
                "Found {} build-up and {} tear-down entries",
                output.schedule.build_up.len(),
                output.schedule.tear_down.len()
            ));
        }
    }
    scanned
}
