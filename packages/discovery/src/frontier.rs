//! Pre-scan crawl frontier.
//!
//! Builds the ordered URL visit list for a fair website and walks it in two
//! bounded passes, collecting PDF candidates and pages worth handing to the
//! browser agent. Individual page failures never abort the scan.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::keywords::registry;
use crate::links::{
    bucket_links, is_exhibitor_profile_url, is_noise_path, is_pagination_url, is_skip_domain,
    tag_pdf_candidate,
};
use crate::traits::BrowserDriver;
use crate::types::{LinkCandidate, PdfCandidate};

/// Ordered visit list plus the domain knowledge needed for same-domain
/// checks during the scan.
#[derive(Debug, Clone)]
pub struct Frontier {
    pub urls: Vec<Url>,
    /// Registrable domain of the seed, e.g. `fieramilano.it`.
    pub root_domain: String,
    /// Hosts treated as part of the fair's ecosystem even when they do not
    /// share the root domain.
    pub related_hosts: HashSet<String>,
}

impl Frontier {
    /// Whether a host belongs to the seed's site or a recognized related
    /// domain. Updated-base redirects are handled by the caller passing the
    /// landed host as `base_host`.
    pub fn is_related_host(&self, host: &str, base_host: &str) -> bool {
        let host = host.to_lowercase();
        host == base_host
            || host == self.root_domain
            || host.ends_with(&format!(".{}", self.root_domain))
            || self.related_hosts.contains(&host)
    }
}

fn root_domain_of(host: &str) -> String {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2..].join(".")
    } else {
        host.to_string()
    }
}

fn push_unique(urls: &mut Vec<Url>, seen: &mut HashSet<String>, candidate: Url) {
    if seen.insert(candidate.as_str().to_string()) {
        urls.push(candidate);
    }
}

fn join_path(base: &str, path: &str) -> Option<Url> {
    Url::parse(&format!("{base}{path}")).ok()
}

/// Build the ordered, deduplicated visit list for a seed URL.
///
/// Tier order decides scan priority: the seed itself, then known document
/// paths, then related-subdomain roots, then generic exhibitor and service
/// path guesses, then the seed's own path (and its parent) with document
/// suffixes. A URL queued by an earlier tier is never re-queued.
pub fn build_frontier(seed: &Url) -> Frontier {
    let reg = registry();
    let host = seed.host_str().unwrap_or_default().to_lowercase();
    let root_domain = root_domain_of(&host);
    let base = format!("{}://{}", seed.scheme(), host);

    let mut related_hosts = HashSet::new();
    for prefix in &reg.frontier.subdomain_prefixes {
        related_hosts.insert(format!("{prefix}.{root_domain}"));
    }
    for (needle, hosts) in &reg.frontier.ecosystem_hosts {
        if host.contains(needle.as_str()) {
            for h in hosts {
                related_hosts.insert(h.clone());
            }
        }
    }

    let mut urls = Vec::new();
    let mut seen = HashSet::new();

    push_unique(&mut urls, &mut seen, seed.clone());

    for path in &reg.frontier.priority_paths {
        if let Some(url) = join_path(&base, path) {
            push_unique(&mut urls, &mut seen, url);
        }
    }
    for path in reg.frontier_paths() {
        if let Some(url) = join_path(&base, path) {
            push_unique(&mut urls, &mut seen, url);
        }
    }

    for prefix in &reg.frontier.subdomain_prefixes {
        if let Ok(url) = Url::parse(&format!("{}://{prefix}.{root_domain}", seed.scheme())) {
            push_unique(&mut urls, &mut seen, url);
        }
    }
    for (needle, hosts) in &reg.frontier.ecosystem_hosts {
        if host.contains(needle.as_str()) {
            for h in hosts {
                if let Ok(url) = Url::parse(&format!("https://{h}")) {
                    push_unique(&mut urls, &mut seen, url);
                }
            }
        }
    }

    for path in &reg.frontier.generic_paths {
        if let Some(url) = join_path(&base, path) {
            push_unique(&mut urls, &mut seen, url);
        }
    }

    // Seed path and its parent, suffixed with document terms. Matters for
    // sites that nest each fair under its own path.
    let fair_path = seed.path().trim_end_matches('/');
    if !fair_path.is_empty() && fair_path != "/" {
        for suffix in &reg.frontier.fair_path_suffixes {
            if let Some(url) = join_path(&base, &format!("{fair_path}{suffix}")) {
                push_unique(&mut urls, &mut seen, url);
            }
        }
        let segments: Vec<&str> = fair_path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() >= 2 {
            let parent = format!("/{}", segments[..segments.len() - 1].join("/"));
            for suffix in &reg.frontier.fair_path_suffixes {
                if let Some(url) = join_path(&base, &format!("{parent}{suffix}")) {
                    push_unique(&mut urls, &mut seen, url);
                }
            }
        }
    }

    // Generic paths are English-first; on a country TLD the matching
    // language paths move to the front so the visit budget reaches them.
    if let Some(tld) = host.rsplit('.').next() {
        if let Some(paths) = reg.frontier.locale_paths.get(tld) {
            let locale_urls: HashSet<String> = paths
                .iter()
                .filter_map(|p| join_path(&base, p))
                .map(|u| u.as_str().to_string())
                .collect();
            if urls.len() > 1 {
                let rest = urls.split_off(1);
                let (matching, non_matching): (Vec<Url>, Vec<Url>) = rest
                    .into_iter()
                    .partition(|u| locale_urls.contains(u.as_str()));
                if !matching.is_empty() {
                    tracing::debug!(tld, promoted = matching.len(), "promoted locale paths");
                }
                urls.extend(matching);
                urls.extend(non_matching);
            }
        }
    }

    Frontier {
        urls,
        root_domain,
        related_hosts,
    }
}

/// Everything the pre-scan learned about the site.
#[derive(Debug, Clone, Default)]
pub struct PreScanReport {
    pub pdf_candidates: Vec<PdfCandidate>,
    pub exhibitor_pages: Vec<Url>,
    pub portal_pages: Vec<Url>,
    pub visited: Vec<Url>,
    /// Host the seed actually landed on, after redirects.
    pub base_host: String,
}

fn looks_like_portal(link: &LinkCandidate) -> bool {
    let reg = registry();
    let host = link.url.host_str().unwrap_or_default().to_lowercase();
    let text = link.text.to_lowercase();
    reg.platform_host_indicators.iter().any(|p| host.contains(p.as_str()))
        || reg.portal_host_indicators.iter().any(|p| host.contains(p.as_str()))
        || reg.portal_text_keywords.iter().any(|p| text.contains(p.as_str()))
}

fn is_document_page_link(link: &LinkCandidate) -> bool {
    let url_lower = link.url.as_str().to_lowercase();
    let text_lower = link.text.to_lowercase();
    registry()
        .doc_link_keywords
        .iter()
        .any(|kw| url_lower.contains(kw.as_str()) || text_lower.contains(kw.as_str()))
}

fn is_excluded_link(url: &Url) -> bool {
    is_pagination_url(url.as_str())
        || is_noise_path(url.as_str())
        || is_exhibitor_profile_url(url.as_str())
        || is_skip_domain(url.host_str().unwrap_or_default())
}

struct ScanState {
    report: PreScanReport,
    seen_pdfs: HashSet<String>,
    seen_pages: HashSet<String>,
    second_pass: Vec<Url>,
}

/// Walk the frontier in two bounded passes.
///
/// The first pass visits the constructed frontier; pages it discovers that
/// look document-related seed the second pass. Cancellation is checked
/// between visits; page failures are logged and skipped.
pub async fn pre_scan<B: BrowserDriver>(
    browser: &B,
    seed: &Url,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Result<PreScanReport, DiscoveryError> {
    let frontier = build_frontier(seed);
    let mut state = ScanState {
        report: PreScanReport {
            base_host: seed.host_str().unwrap_or_default().to_lowercase(),
            ..PreScanReport::default()
        },
        seen_pdfs: HashSet::new(),
        seen_pages: frontier
            .urls
            .iter()
            .take(config.first_pass_limit)
            .map(|u| u.as_str().to_string())
            .collect(),
        second_pass: Vec::new(),
    };

    tracing::info!(
        urls = frontier.urls.len(),
        limit = config.first_pass_limit,
        "pre-scan starting"
    );

    for (idx, url) in frontier.urls.iter().take(config.first_pass_limit).enumerate() {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        visit_page(browser, url, idx == 0, &frontier, &mut state, true).await;
    }

    let second: Vec<Url> = state
        .second_pass
        .drain(..)
        .take(config.second_pass_limit)
        .collect();
    if !second.is_empty() {
        tracing::info!(pages = second.len(), "pre-scan second pass");
    }
    for url in &second {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        visit_page(browser, url, false, &frontier, &mut state, false).await;
    }

    tracing::info!(
        pdfs = state.report.pdf_candidates.len(),
        exhibitor_pages = state.report.exhibitor_pages.len(),
        visited = state.report.visited.len(),
        "pre-scan finished"
    );
    Ok(state.report)
}

/// Portal pages visited during the portal-scan phase.
const PORTAL_SCAN_LIMIT: usize = 5;

/// Visit the external exhibitor portals the pre-scan discovered and fold
/// their documents into the report. Portals live on foreign hosts, so no
/// same-domain check applies here.
pub async fn portal_scan<B: BrowserDriver>(
    browser: &B,
    report: &mut PreScanReport,
    cancel: &CancellationToken,
) -> Result<(), DiscoveryError> {
    let targets: Vec<Url> = report.portal_pages.iter().take(PORTAL_SCAN_LIMIT).cloned().collect();
    if targets.is_empty() {
        return Ok(());
    }
    let mut seen_pdfs: HashSet<String> = report
        .pdf_candidates
        .iter()
        .map(|c| c.url.as_str().to_string())
        .collect();

    for url in &targets {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        let page = match browser.goto(url).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "portal page failed, skipping");
                continue;
            }
        };
        let links = match browser.extract_links().await {
            Ok(links) => links,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "portal link extraction failed, skipping");
                continue;
            }
        };
        report.visited.push(page.url.clone());

        let buckets = bucket_links(links);
        for link in &buckets.pdf {
            if is_excluded_link(&link.url) {
                continue;
            }
            if seen_pdfs.insert(link.url.as_str().to_string()) {
                report.pdf_candidates.push(tag_pdf_candidate(link, &page.url));
            }
        }
        for link in &buckets.exhibitor {
            if !link.is_pdf && !report.exhibitor_pages.iter().any(|u| u == &link.url) {
                report.exhibitor_pages.push(link.url.clone());
            }
        }
        // Portal URLs are often opaque ids; the anchor text is the only
        // signal that a page holds exhibitor resources.
        for link in &buckets.all {
            if !link.is_pdf
                && crate::links::is_resource_link(link)
                && !is_excluded_link(&link.url)
                && !report.exhibitor_pages.iter().any(|u| u == &link.url)
            {
                report.exhibitor_pages.push(link.url.clone());
            }
        }
    }
    tracing::info!(
        portals = targets.len(),
        pdfs = report.pdf_candidates.len(),
        "portal scan finished"
    );
    Ok(())
}

async fn visit_page<B: BrowserDriver>(
    browser: &B,
    url: &Url,
    is_seed: bool,
    frontier: &Frontier,
    state: &mut ScanState,
    collect_seeds: bool,
) {
    let page = match browser.goto(url).await {
        Ok(page) => page,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "pre-scan page failed, skipping");
            return;
        }
    };

    // The seed may redirect to a different host; later same-domain checks
    // use where we actually landed.
    if is_seed {
        if let Some(landed) = page.url.host_str() {
            let landed = landed.to_lowercase();
            if landed != state.report.base_host {
                tracing::info!(from = %state.report.base_host, to = %landed, "seed redirected");
                state.report.base_host = landed;
            }
        }
    }

    let links = match browser.extract_links().await {
        Ok(links) => links,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "link extraction failed, skipping");
            return;
        }
    };
    state.report.visited.push(page.url.clone());

    let buckets = bucket_links(links);

    for link in &buckets.pdf {
        if is_excluded_link(&link.url) {
            continue;
        }
        if state.seen_pdfs.insert(link.url.as_str().to_string()) {
            let candidate = tag_pdf_candidate(link, &page.url);
            tracing::debug!(url = %candidate.url, doc_type = ?candidate.doc_type, "pdf candidate");
            state.report.pdf_candidates.push(candidate);
        }
    }

    for link in &buckets.exhibitor {
        if is_excluded_link(&link.url) || link.is_pdf {
            continue;
        }
        if !state
            .report
            .exhibitor_pages
            .iter()
            .any(|u| u == &link.url)
        {
            state.report.exhibitor_pages.push(link.url.clone());
        }
    }

    for link in &buckets.all {
        if looks_like_portal(link) && !state.report.portal_pages.iter().any(|u| u == &link.url) {
            state.report.portal_pages.push(link.url.clone());
        }
    }

    if !collect_seeds {
        return;
    }
    for link in buckets
        .high_value
        .iter()
        .chain(buckets.download.iter())
        .chain(buckets.all.iter().filter(|l| is_document_page_link(l)))
    {
        if link.is_pdf || is_excluded_link(&link.url) {
            continue;
        }
        let host = link.url.host_str().unwrap_or_default();
        if !frontier.is_related_host(host, &state.report.base_host) {
            continue;
        }
        if state.seen_pages.insert(link.url.as_str().to_string()) {
            state.second_pass.push(link.url.clone());
        }
    }
}
