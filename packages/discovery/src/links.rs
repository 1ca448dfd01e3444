//! Pure link classification.
//!
//! Everything here is deterministic and side-effect free: PDF detection,
//! bucket membership, pagination and noise filtering, and the year/type
//! tagging used for PDF candidates. Keyword lists come from the registry.

use url::Url;

use crate::keywords::registry;
use crate::types::{DocumentType, LinkCandidate, PdfCandidate};

/// Years scanned for, newest first. First hit wins.
pub const CANDIDATE_YEARS: [u16; 5] = [2026, 2025, 2024, 2023, 2022];

/// Whether a link points at a PDF document.
///
/// Catches direct extensions, document path segments, CMS and hosting
/// patterns, and anchor text suggesting a download.
pub fn is_pdf_link(url: &str, text: &str) -> bool {
    let url_lower = url.to_lowercase();
    let text_lower = text.to_lowercase();

    url_lower.ends_with(".pdf")
        || url_lower.contains("/pdf/")
        || url_lower.contains(".pdf?")
        || url_lower.contains("/document/")
        || url_lower.contains("/content/dam/")
        || url_lower.contains("/sites/default/files/")
        || url_lower.contains("cloudfront.net")
        || text_lower.contains("pdf")
        || text_lower.contains("download")
}

fn matches_any(url_lower: &str, text_lower: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|kw| url_lower.contains(kw.as_str()) || text_lower.contains(kw.as_str()))
}

/// Download-ish link: document hosting paths, CMS asset patterns.
pub fn is_download_link(link: &LinkCandidate) -> bool {
    let url_lower = link.url.as_str().to_lowercase();
    let text_lower = link.text.to_lowercase();
    matches_any(&url_lower, &text_lower, &registry().link_buckets.download)
}

/// Exhibitor-relevant link across supported languages.
pub fn is_exhibitor_link(link: &LinkCandidate) -> bool {
    let url_lower = link.url.as_str().to_lowercase();
    let text_lower = link.text.to_lowercase();
    matches_any(&url_lower, &text_lower, &registry().link_buckets.exhibitor)
}

/// Likely technical documentation link, worth expanding eagerly.
pub fn is_high_value_link(link: &LinkCandidate) -> bool {
    let url_lower = link.url.as_str().to_lowercase();
    let text_lower = link.text.to_lowercase();
    matches_any(&url_lower, &text_lower, &registry().link_buckets.high_value)
}

/// Anchor text naming a known exhibitor resource (manuals, stand
/// construction, build-up), used when scanning service portals whose URLs
/// carry no recognizable keywords.
pub fn is_resource_link(link: &LinkCandidate) -> bool {
    let text_lower = link.text.to_lowercase();
    registry()
        .high_value_resource_keywords
        .iter()
        .any(|kw| text_lower.contains(kw.as_str()))
}

/// Paginated listing URLs are excluded from the frontier entirely.
pub fn is_pagination_url(url: &str) -> bool {
    let url_lower = url.to_lowercase();
    registry()
        .pagination_params
        .iter()
        .any(|p| url_lower.contains(p.as_str()))
}

/// Login, search, and confirmation pages that never hold documents.
pub fn is_noise_path(url: &str) -> bool {
    let url_lower = url.to_lowercase();
    registry()
        .noise_paths
        .iter()
        .any(|p| url_lower.contains(p.as_str()))
}

/// Individual exhibitor profile pages like `/exhibitors/34391-gsma`.
pub fn is_exhibitor_profile_url(url: &str) -> bool {
    let url_lower = url.to_lowercase();
    if let Some(idx) = url_lower
        .find("/exhibitors/")
        .or_else(|| url_lower.find("/exhibitor/"))
    {
        let rest = &url_lower[idx..];
        let after = rest
            .trim_start_matches("/exhibitors/")
            .trim_start_matches("/exhibitor/");
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        return !digits.is_empty() && after[digits.len()..].starts_with('-');
    }
    false
}

/// Social networks and app stores, never document hosts.
pub fn is_skip_domain(host: &str) -> bool {
    let host_lower = host.to_lowercase();
    registry()
        .skip_domains
        .iter()
        .any(|d| host_lower.contains(d.as_str()))
}

/// Best-effort year tag for a PDF candidate, newest first.
pub fn guess_pdf_year(url: &str, text: &str) -> Option<u16> {
    CANDIDATE_YEARS
        .iter()
        .find(|year| url.contains(&year.to_string()) || text.contains(&year.to_string()))
        .copied()
}

/// Best-effort document type for a PDF candidate.
///
/// First match wins: technical regulations before manuals before
/// floorplans before schedules. The floorplan branch applies its
/// exclusion list (a "technical data sheet" mentioning halls is not a
/// floorplan).
pub fn guess_pdf_type(url: &str, text: &str) -> Option<DocumentType> {
    let url_lower = url.to_lowercase();
    let text_lower = text.to_lowercase();
    let reg = registry();

    let hits = |doc_type: DocumentType| {
        matches_any(&url_lower, &text_lower, &reg.for_type(doc_type).pdf_keywords)
    };

    if hits(DocumentType::Rules) {
        return Some(DocumentType::Rules);
    }
    if hits(DocumentType::ExhibitorManual) {
        return Some(DocumentType::ExhibitorManual);
    }
    if hits(DocumentType::Floorplan) {
        let excluded = matches_any(
            &url_lower,
            &text_lower,
            &reg.for_type(DocumentType::Floorplan).pdf_exclusions,
        );
        if !excluded {
            return Some(DocumentType::Floorplan);
        }
        // Fall through so an excluded "floorplan" can still land as schedule.
        if hits(DocumentType::Schedule) {
            return Some(DocumentType::Schedule);
        }
        return None;
    }
    if hits(DocumentType::Schedule) {
        return Some(DocumentType::Schedule);
    }
    None
}

/// Tag a PDF link with year and type guesses.
pub fn tag_pdf_candidate(link: &LinkCandidate, source_page: &Url) -> PdfCandidate {
    PdfCandidate {
        url: link.url.clone(),
        text: link.text.clone(),
        doc_type: guess_pdf_type(link.url.as_str(), &link.text),
        year: guess_pdf_year(link.url.as_str(), &link.text),
        source_page: source_page.clone(),
    }
}

/// Links grouped by bucket. Buckets are not exclusive; a link may appear
/// in several.
#[derive(Debug, Default)]
pub struct BucketedLinks {
    pub pdf: Vec<LinkCandidate>,
    pub download: Vec<LinkCandidate>,
    pub exhibitor: Vec<LinkCandidate>,
    pub high_value: Vec<LinkCandidate>,
    pub all: Vec<LinkCandidate>,
}

pub fn bucket_links(links: Vec<LinkCandidate>) -> BucketedLinks {
    let mut buckets = BucketedLinks::default();
    for link in &links {
        if link.is_pdf || is_pdf_link(link.url.as_str(), &link.text) {
            buckets.pdf.push(link.clone());
        }
        if is_download_link(link) {
            buckets.download.push(link.clone());
        }
        if is_exhibitor_link(link) {
            buckets.exhibitor.push(link.clone());
        }
        if is_high_value_link(link) {
            buckets.high_value.push(link.clone());
        }
    }
    buckets.all = links;
    buckets
}
