//! Tool-calling browser agent.
//!
//! Runs a bounded conversation with the agent model, giving it a rendered
//! browser through three tools: the Anthropic computer-use tool for raw
//! input, `goto_url` for direct navigation, and `deep_scan` for exhaustive
//! link extraction on the current page. The loop nudges the model twice,
//! once mid-run and once near the budget, then parses the final JSON
//! answer into the discovery output.

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use anthropic_client::{ContentBlock, Message, MessageRequest, Role, ToolDefinition};

use crate::classifier::{parse_json_response, ClassificationSummary};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::fair_match;
use crate::frontier::PreScanReport;
use crate::keywords::registry;
use crate::links::bucket_links;
use crate::traits::{AgentModel, BrowserDriver, ComputerAction, DownloadedFile};
use crate::types::{
    Confidence, DiscoveryOutput, DiscoveryRequest, DocumentType, LinkCandidate, ScheduleEntry,
};

const AGENT_MAX_TOKENS: u32 = 4096;

/// Iterations left when the wrap-up warning is injected.
const FINAL_WARNING_MARGIN: u32 = 3;

const PDF_LINK_LIMIT: usize = 20;
const EXHIBITOR_LINK_LIMIT: usize = 15;
const DOWNLOAD_LINK_LIMIT: usize = 10;
const HIGH_VALUE_LINK_LIMIT: usize = 10;

const AGENT_SYSTEM: &str = r#"You are a research agent that finds exhibitor documents on trade fair websites. You control a browser through the computer tool, and you can navigate directly with goto_url or list every document link on the current page with deep_scan.

You are looking for five things, always for the requested edition of the fair:
1. floorplan: hall plan or site plan of the fairground
2. exhibitor_manual: the exhibitor manual, handbook, or service documentation
3. rules: technical guidelines, regulations, or stand construction rules
4. exhibitor_directory: the searchable list of exhibiting companies
5. schedule: build-up and tear-down dates for exhibitors

Where to look:
- "For exhibitors" / "Aussteller" sections and their download or documents pages
- Exhibitor service portals on subdomains or external platforms
- Accordions and dropdowns that hide document lists; use deep_scan when you suspect hidden links
- Open PDF links with goto_url to verify their content before accepting them

Validation rules:
- A document counts only if it is for the requested fair AND the requested year. Reject documents for other editions or other cities.
- When you open a document, read enough of it to confirm what it is.
- Be honest. If a candidate does not meet the criteria, set its url to null and explain why in the validation field. "Not found" is a better answer than a wrong document.

When you are done, or when told to wrap up, answer with a single JSON object:

```json
{
  "floorplan_url": "... or null",
  "floorplan_validation": "what you verified, or why rejected",
  "exhibitor_manual_url": "... or null",
  "exhibitor_manual_validation": "...",
  "rules_url": "... or null",
  "rules_validation": "...",
  "exhibitor_directory_url": "... or null",
  "exhibitor_directory_validation": "...",
  "downloads_page_url": "... or null",
  "schedule": {
    "build_up": [{"date": "YYYY-MM-DD", "time": "", "description": ""}],
    "tear_down": [{"date": "YYYY-MM-DD", "time": "", "description": ""}]
  },
  "schedule_validation": "...",
  "notes": "anything else worth recording"
}
```"#;

/// Half the budget, but never before iteration 5.
pub(crate) fn midpoint_iteration(max_iterations: u32) -> u32 {
    (max_iterations / 2).max(5)
}

fn focused_system(summary: &ClassificationSummary) -> String {
    let mut prompt = String::from(AGENT_SYSTEM);
    prompt.push_str("\n\nAlready validated before your session (do not search for these again):\n");
    for doc_type in DocumentType::ALL {
        if let Some(found) = summary.findings.get(&doc_type) {
            prompt.push_str(&format!("- {}: {}\n", found.doc_type.as_str(), found.url));
        }
    }
    prompt.push_str("\nStill missing, focus only on these:\n");
    for doc_type in &summary.missing_types {
        prompt.push_str(&format!("- {}\n", doc_type.as_str()));
    }
    prompt
}

fn mission_brief(
    request: &DiscoveryRequest,
    summary: Option<&ClassificationSummary>,
    prescan: Option<&PreScanReport>,
    start_url: &Url,
) -> String {
    let mut brief = format!(
        "Find exhibitor documents for: {} {}\n",
        request.fair_name, request.fair_year
    );
    if !request.fair_city.is_empty() {
        brief.push_str(&format!("City: {}\n", request.fair_city));
    }
    if !request.fair_country.is_empty() {
        brief.push_str(&format!("Country: {}\n", request.fair_country));
    }
    brief.push_str(&format!("Start URL: {start_url}\n"));

    if let Some(summary) = summary {
        if !summary.findings.is_empty() {
            brief.push_str("\nPre-scan already validated:\n");
            for doc_type in DocumentType::ALL {
                if let Some(found) = summary.findings.get(&doc_type) {
                    brief.push_str(&format!(
                        "- {} ({:?}): {}\n",
                        doc_type.as_str(),
                        found.confidence,
                        found.url
                    ));
                }
            }
            brief.push_str("\nStill missing:\n");
            for doc_type in &summary.missing_types {
                brief.push_str(&format!("- {}\n", doc_type.as_str()));
            }
        }
    }

    if let Some(prescan) = prescan {
        if !prescan.pdf_candidates.is_empty() {
            brief.push_str("\nPDF candidates found during pre-scan, newest edition first:\n");
            let mut candidates: Vec<_> = prescan.pdf_candidates.iter().collect();
            candidates.sort_by_key(|c| {
                (
                    crate::classifier::year_sort_key(c.year, request.fair_year),
                    c.doc_type.map(|t| t.as_str()).unwrap_or("unknown"),
                )
            });
            for candidate in candidates.iter().take(30) {
                let type_tag = candidate.doc_type.map(|t| t.as_str()).unwrap_or("unknown");
                let year_tag = candidate
                    .year
                    .map(|y| format!(" [{y}]"))
                    .unwrap_or_default();
                brief.push_str(&format!("- [{type_tag}]{year_tag} {}\n", candidate.url));
            }
            brief.push_str("Open these with goto_url to verify them before accepting.\n");
        }
        if !prescan.exhibitor_pages.is_empty() {
            brief.push_str("\nExhibitor pages worth visiting:\n");
            for page in prescan.exhibitor_pages.iter().take(10) {
                brief.push_str(&format!("- {page}\n"));
            }
        }
        if !prescan.portal_pages.is_empty() {
            brief.push_str("\nExternal exhibitor portals, often the best source:\n");
            for page in prescan.portal_pages.iter().take(5) {
                brief.push_str(&format!("- {page}\n"));
            }
        }
    }

    match summary {
        Some(s) if !s.missing_types.is_empty() && !s.findings.is_empty() => {
            brief.push_str("\nFocus only on the missing documents. The others are already validated.");
        }
        _ => {
            brief.push_str("\nNavigate the website and find all requested documents.");
        }
    }
    brief
}

fn midpoint_nudge(
    iteration: u32,
    max_iterations: u32,
    summary: Option<&ClassificationSummary>,
) -> String {
    let remaining = max_iterations - iteration;
    let mut msg = format!("Interim check (iteration {iteration}/{max_iterations}):\n\n");
    match summary {
        Some(s) if !s.missing_types.is_empty() && !s.findings.is_empty() => {
            let missing: Vec<&str> = s.missing_types.iter().map(|t| t.as_str()).collect();
            msg.push_str(&format!("Still looking for: {}\n\n", missing.join(", ")));
            msg.push_str("Have you already tried:\n");
            msg.push_str("1. The downloads/documents page\n");
            msg.push_str("2. External exhibitor portals\n");
            msg.push_str("3. Opening every accordion and dropdown\n");
            msg.push_str("4. deep_scan on the relevant pages\n");
        }
        _ => {
            msg.push_str("Have you visited all of these sections?\n");
            msg.push_str("1. The exhibitors / for-exhibitors section\n");
            msg.push_str("2. Downloads / documents / service documentation\n");
            msg.push_str("3. Participate / how-to-exhibit pages\n");
            msg.push_str("4. Exhibitor subdomains\n");
        }
    }
    msg.push_str(&format!("\nYou have {remaining} actions left. Use them deliberately."));
    msg
}

const FINAL_NUDGE: &str = "You have 3 actions left. Start your JSON answer now.\n\n\
Add a validation field for every document proving it meets the criteria. \
If a document did NOT meet the criteria, set its url to null and explain why. \
Be honest: when in doubt, \"not found\" is better than a wrong document.";

/// Append a nudge to the trailing user message, or start a new one.
///
/// The conversation must alternate roles, so a nudge lands inside the
/// pending tool-result message when there is one.
fn inject_user_text(messages: &mut Vec<Message>, text: String) {
    match messages.last_mut() {
        Some(last) if matches!(last.role, Role::User) => {
            last.content.push(ContentBlock::text(text));
        }
        _ => messages.push(Message::user_blocks(vec![ContentBlock::text(text)])),
    }
}

fn agent_tools(config: &DiscoveryConfig) -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::computer_use(config.display_width, config.display_height),
        ToolDefinition::with_string_arg(
            "goto_url",
            "Navigate directly to a URL. Use this to open PDF links from the extracted \
             link listings, or to visit exhibitor portals and subdomains.",
            "url",
            "The full URL to navigate to",
        ),
        ToolDefinition::custom(
            "deep_scan",
            "Deep-scan the current page for document links. Expands accordions and \
             hidden sections, then lists every PDF and download link. Use this when \
             you suspect a page hides documents.",
            serde_json::json!({"type": "object", "properties": {}, "required": []}),
        ),
    ]
}

// ============================================================================
// LINK FORMATTING
// ============================================================================

fn push_links(out: &mut String, heading: &str, links: &[LinkCandidate], limit: usize) {
    if links.is_empty() {
        return;
    }
    out.push_str(&format!("\n{heading}\n"));
    for link in links.iter().take(limit) {
        let text = if link.text.is_empty() { "Link" } else { link.text.as_str() };
        out.push_str(&format!("- {text}: {}\n", link.url));
    }
}

/// Short link digest appended to every tool result.
fn format_page_links(links: Vec<LinkCandidate>) -> String {
    let buckets = bucket_links(links);
    let mut out = String::new();
    push_links(&mut out, "Key documents on this page:", &buckets.high_value, HIGH_VALUE_LINK_LIMIT);
    push_links(&mut out, "PDF links on this page:", &buckets.pdf, PDF_LINK_LIMIT);
    push_links(&mut out, "Relevant links:", &buckets.exhibitor, EXHIBITOR_LINK_LIMIT);
    let pdf_urls: std::collections::HashSet<&str> =
        buckets.pdf.iter().map(|l| l.url.as_str()).collect();
    let download_only: Vec<LinkCandidate> = buckets
        .download
        .iter()
        .filter(|l| !pdf_urls.contains(l.url.as_str()))
        .cloned()
        .collect();
    push_links(&mut out, "Download links:", &download_only, DOWNLOAD_LINK_LIMIT);
    out
}

/// Full listing produced by the deep_scan tool.
fn deep_scan_report(page_url: &Url, links: Vec<LinkCandidate>) -> String {
    let buckets = bucket_links(links);
    let mut out = format!("Deep scan results for {page_url}\n");

    if buckets.high_value.is_empty() {
        out.push_str("\nNo high-value documents found on this page.\n");
    } else {
        out.push_str("\nHigh-value documents (technical guidelines, regulations, provisions):\n");
        for link in &buckets.high_value {
            out.push_str(&format!("- {}\n  {}\n", link.text, link.url));
        }
    }

    if buckets.pdf.is_empty() {
        out.push_str("\nNo PDF links found.\n");
    } else {
        out.push_str(&format!("\nAll PDF links ({} found):\n", buckets.pdf.len()));
        for link in buckets.pdf.iter().take(30) {
            let text = if link.text.is_empty() { "PDF" } else { link.text.as_str() };
            out.push_str(&format!("- {text}\n  {}\n", link.url));
        }
    }

    if !buckets.download.is_empty() {
        out.push_str(&format!("\nDownload links ({} found):\n", buckets.download.len()));
        for link in buckets.download.iter().take(PDF_LINK_LIMIT) {
            out.push_str(&format!("- {}\n  {}\n", link.text, link.url));
        }
    }

    let current_host = page_url.host_str().unwrap_or_default();
    let external: Vec<&LinkCandidate> = buckets
        .all
        .iter()
        .filter(|l| l.url.host_str().map(|h| h != current_host).unwrap_or(false))
        .collect();
    if !external.is_empty() {
        out.push_str(&format!("\nExternal links ({} found):\n", external.len()));
        for link in external.iter().take(EXHIBITOR_LINK_LIMIT) {
            let text = if link.text.is_empty() { "Link" } else { link.text.as_str() };
            out.push_str(&format!("- {text}\n  {}\n", link.url));
        }
    }

    out.push_str("\nUse goto_url to open a PDF or portal directly.");
    out
}

// ============================================================================
// THE LOOP
// ============================================================================

/// Drive the agent model against the browser until it answers or the
/// iteration budget runs out. Returns the number of iterations used.
pub async fn run_browser_agent<M, B>(
    model: &M,
    browser: &B,
    request: &DiscoveryRequest,
    summary: Option<&ClassificationSummary>,
    prescan: Option<&PreScanReport>,
    output: &mut DiscoveryOutput,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Result<u32>
where
    M: AgentModel,
    B: BrowserDriver,
{
    let start_url = match (&request.known_url, &output.official_url) {
        (Some(url), _) => url.clone(),
        (None, Some(url)) => url.clone(),
        (None, None) => return Err(DiscoveryError::UrlResolution("no start URL".into())),
    };

    if let Err(e) = browser.goto(&start_url).await {
        tracing::warn!(url = %start_url, error = %e, "start URL failed, agent begins on blank page");
    } else {
        output.debug.visited_urls.push(start_url.to_string());
    }

    let system = match summary {
        Some(s) if !s.findings.is_empty() => focused_system(s),
        _ => AGENT_SYSTEM.to_string(),
    };

    let mut initial = vec![ContentBlock::text(mission_brief(
        request, summary, prescan, &start_url,
    ))];
    if let Ok(screenshot) = browser.screenshot().await {
        initial.push(ContentBlock::image_png(screenshot));
    }
    if let Ok(state) = browser.current_state().await {
        initial.push(ContentBlock::text(format!(
            "Current page: {}\nTitle: {}",
            state.url, state.title
        )));
    }

    let mut messages = vec![Message::user_blocks(initial)];
    let max_iterations = config.max_agent_iterations;
    let midpoint = midpoint_iteration(max_iterations);
    let tools = agent_tools(config);

    let mut final_answer: Option<String> = None;
    let mut iterations_used = 0;

    for iteration in 1..=max_iterations {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        iterations_used = iteration;
        tracing::debug!(iteration, max_iterations, "agent iteration");

        if iteration == midpoint && midpoint <= max_iterations.saturating_sub(FINAL_WARNING_MARGIN)
        {
            inject_user_text(
                &mut messages,
                midpoint_nudge(iteration, max_iterations, summary),
            );
        }
        if iteration == max_iterations.saturating_sub(FINAL_WARNING_MARGIN) {
            inject_user_text(&mut messages, FINAL_NUDGE.to_string());
        }

        let request_body = MessageRequest::new(&config.agent_model)
            .system(system.clone())
            .max_tokens(AGENT_MAX_TOKENS)
            .messages(messages.clone());
        let request_body = tools
            .iter()
            .fold(request_body, |req, tool| req.tool(tool.clone()));

        let response = model
            .create_message(request_body)
            .await
            .map_err(|e| DiscoveryError::Model(e.to_string()))?;

        for block in &response.content {
            if let ContentBlock::Text { text } = block {
                if text.contains("floorplan_url") || text.contains("exhibitor_manual_url") {
                    final_answer = Some(text.clone());
                }
            }
        }

        messages.push(Message {
            role: Role::Assistant,
            content: response.content.clone(),
        });

        let tool_uses: Vec<(String, String, serde_json::Value)> = response
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();

        if tool_uses.is_empty() {
            break;
        }

        let mut results = Vec::with_capacity(tool_uses.len());
        for (id, name, input) in &tool_uses {
            output.debug.agent_actions.push(describe_tool_use(name, input));
            results.push(run_tool(browser, id, name, input, output).await);
        }
        messages.push(Message {
            role: Role::User,
            content: results,
        });
    }

    match final_answer {
        Some(text) => apply_answer(&text, request, output),
        None => output
            .debug
            .notes
            .push("Agent produced no final JSON answer".to_string()),
    }

    // Official URL falls back to wherever the browser ended up.
    if output.official_url.is_none() {
        if let Ok(state) = browser.current_state().await {
            output.official_url = Some(state.url);
        }
    }

    match browser.downloads().await {
        Ok(downloads) => {
            for download in &downloads {
                output.debug.downloaded_files.push(download.filename.clone());
                auto_map_download(download, output);
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not list browser downloads"),
    }

    output
        .debug
        .notes
        .push(format!("Agent completed in {iterations_used} iterations"));
    Ok(iterations_used)
}

fn describe_tool_use(name: &str, input: &serde_json::Value) -> String {
    match name {
        "goto_url" => format!(
            "goto_url: {}",
            input.get("url").and_then(|v| v.as_str()).unwrap_or("?")
        ),
        "computer" => format!(
            "computer: {}",
            input.get("action").and_then(|v| v.as_str()).unwrap_or("?")
        ),
        other => other.to_string(),
    }
}

async fn run_tool<B: BrowserDriver>(
    browser: &B,
    id: &str,
    name: &str,
    input: &serde_json::Value,
    output: &mut DiscoveryOutput,
) -> ContentBlock {
    match name {
        "computer" => run_computer(browser, id, input).await,
        "goto_url" => run_goto(browser, id, input, output).await,
        "deep_scan" => run_deep_scan(browser, id).await,
        other => ContentBlock::tool_error(
            id,
            format!("Tool '{other}' is not available. Use computer, goto_url, or deep_scan instead."),
        ),
    }
}

async fn run_computer<B: BrowserDriver>(
    browser: &B,
    id: &str,
    input: &serde_json::Value,
) -> ContentBlock {
    let action: ComputerAction = match serde_json::from_value(input.clone()) {
        Ok(action) => action,
        Err(e) => return ContentBlock::tool_error(id, format!("Unsupported action: {e}")),
    };
    let observation = match browser.perform(&action).await {
        Ok(observation) => observation,
        Err(e) => return ContentBlock::tool_error(id, format!("Action failed: {e}")),
    };

    let mut content = vec![ContentBlock::text(observation)];
    if let Ok(screenshot) = browser.screenshot().await {
        content.push(ContentBlock::image_png(screenshot));
    }
    if let Ok(state) = browser.current_state().await {
        content.push(ContentBlock::text(format!(
            "Current page: {}\nTitle: {}",
            state.url, state.title
        )));
    }
    if let Ok(links) = browser.extract_links().await {
        let digest = format_page_links(links);
        if !digest.is_empty() {
            content.push(ContentBlock::text(digest));
        }
    }
    ContentBlock::ToolResult {
        tool_use_id: id.to_string(),
        content,
        is_error: None,
    }
}

async fn run_goto<B: BrowserDriver>(
    browser: &B,
    id: &str,
    input: &serde_json::Value,
    output: &mut DiscoveryOutput,
) -> ContentBlock {
    let raw = match input.get("url").and_then(|v| v.as_str()) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return ContentBlock::tool_error(id, "goto_url requires a 'url' argument"),
    };
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => return ContentBlock::tool_error(id, format!("Invalid URL '{raw}': {e}")),
    };
    let state = match browser.goto(&url).await {
        Ok(state) => state,
        Err(e) => return ContentBlock::tool_result(id, format!("Navigation to {url} failed: {e}")),
    };
    output.debug.visited_urls.push(state.url.to_string());

    let mut content = vec![ContentBlock::text(format!(
        "Navigated to: {}\nTitle: {}",
        state.url, state.title
    ))];
    if let Ok(screenshot) = browser.screenshot().await {
        content.push(ContentBlock::image_png(screenshot));
    }
    if let Ok(links) = browser.extract_links().await {
        let digest = format_page_links(links);
        if !digest.is_empty() {
            content.push(ContentBlock::text(digest));
        }
    }
    ContentBlock::ToolResult {
        tool_use_id: id.to_string(),
        content,
        is_error: None,
    }
}

async fn run_deep_scan<B: BrowserDriver>(browser: &B, id: &str) -> ContentBlock {
    let state = match browser.current_state().await {
        Ok(state) => state,
        Err(e) => return ContentBlock::tool_error(id, format!("Deep scan failed: {e}")),
    };
    match browser.extract_links().await {
        Ok(links) => ContentBlock::tool_result(id, deep_scan_report(&state.url, links)),
        Err(e) => ContentBlock::tool_error(id, format!("Deep scan failed: {e}")),
    }
}

// ============================================================================
// ANSWER PARSING
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct AgentAnswer {
    #[serde(default)]
    floorplan_url: Option<String>,
    #[serde(default)]
    floorplan_validation: Option<String>,
    #[serde(default)]
    exhibitor_manual_url: Option<String>,
    #[serde(default)]
    exhibitor_manual_validation: Option<String>,
    #[serde(default)]
    rules_url: Option<String>,
    #[serde(default)]
    rules_validation: Option<String>,
    #[serde(default)]
    exhibitor_directory_url: Option<String>,
    #[serde(default)]
    exhibitor_directory_validation: Option<String>,
    #[serde(default)]
    downloads_page_url: Option<String>,
    #[serde(default)]
    schedule: AnswerSchedule,
    #[serde(default)]
    schedule_validation: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnswerSchedule {
    #[serde(default)]
    build_up: Vec<AnswerScheduleRow>,
    #[serde(default)]
    tear_down: Vec<AnswerScheduleRow>,
}

#[derive(Debug, Deserialize)]
struct AnswerScheduleRow {
    date: String,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    description: String,
}

impl AnswerScheduleRow {
    fn into_entry(self, source_url: Option<&str>) -> ScheduleEntry {
        ScheduleEntry {
            date: self.date,
            time: self.time.filter(|t| !t.is_empty()),
            description: self.description,
            source_url: source_url.map(|s| s.to_string()),
        }
    }
}

impl AgentAnswer {
    fn slot(&self, doc_type: DocumentType) -> (Option<&String>, Option<&String>) {
        match doc_type {
            DocumentType::Floorplan => {
                (self.floorplan_url.as_ref(), self.floorplan_validation.as_ref())
            }
            DocumentType::ExhibitorManual => (
                self.exhibitor_manual_url.as_ref(),
                self.exhibitor_manual_validation.as_ref(),
            ),
            DocumentType::Rules => (self.rules_url.as_ref(), self.rules_validation.as_ref()),
            DocumentType::ExhibitorDirectory => (
                self.exhibitor_directory_url.as_ref(),
                self.exhibitor_directory_validation.as_ref(),
            ),
            DocumentType::Schedule => (None, self.schedule_validation.as_ref()),
        }
    }
}

/// Missing or empty validation counts as accepted; only an explicit
/// rejection phrase blocks the URL.
fn validation_accepts(validation: Option<&String>) -> bool {
    match validation {
        None => true,
        Some(text) if text.trim().is_empty() => true,
        Some(text) => {
            let lower = text.to_lowercase();
            !registry()
                .rejection_keywords
                .iter()
                .any(|kw| lower.contains(kw.as_str()))
        }
    }
}

/// Guard against cross-fair contamination in agent answers.
///
/// Accepts the official domain and known document CDNs outright; any other
/// host must carry the fair's name.
fn url_is_relevant(url: &str, fair_name: &str, official_url: Option<&Url>) -> bool {
    let host = match Url::parse(url) {
        Ok(parsed) => parsed.host_str().unwrap_or_default().to_lowercase(),
        Err(_) => return false,
    };

    if let Some(official_host) = official_url.and_then(|u| u.host_str()) {
        let official_base = official_host.to_lowercase();
        let official_base = official_base.trim_start_matches("www.");
        if !official_base.is_empty() && host.contains(official_base) {
            return true;
        }
    }

    if registry().cdn_allowlist.iter().any(|cdn| host.contains(cdn.as_str())) {
        return true;
    }

    let keywords = fair_match::extract_fair_keywords(fair_name);
    if fair_match::any_fair_keyword_in_url(&keywords, url, 3) {
        return true;
    }

    false
}

const ANSWER_TYPES: [DocumentType; 4] = [
    DocumentType::Floorplan,
    DocumentType::ExhibitorManual,
    DocumentType::Rules,
    DocumentType::ExhibitorDirectory,
];

fn apply_answer(text: &str, request: &DiscoveryRequest, output: &mut DiscoveryOutput) {
    let answer: AgentAnswer = match parse_json_response(text) {
        Some(answer) => answer,
        None => {
            output
                .debug
                .notes
                .push("Could not parse final JSON answer".to_string());
            return;
        }
    };

    let official_url = output.official_url.clone();
    for doc_type in ANSWER_TYPES {
        let (url, validation) = answer.slot(doc_type);
        let Some(raw) = url.filter(|u| !u.is_empty()) else {
            if let Some(validation) = validation {
                output.reasoning.set(doc_type, validation.clone());
            }
            continue;
        };

        if !validation_accepts(validation) {
            if let Some(validation) = validation {
                output.reasoning.set(doc_type, validation.clone());
            }
            continue;
        }
        if !url_is_relevant(raw, &request.fair_name, official_url.as_ref()) {
            output.debug.notes.push(format!(
                "{} URL rejected, likely another fair: {raw}",
                doc_type.as_str()
            ));
            continue;
        }
        let Ok(parsed) = Url::parse(raw) else {
            output
                .debug
                .notes
                .push(format!("{} URL unparseable: {raw}", doc_type.as_str()));
            continue;
        };
        let reasoning = validation
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "Found by browser agent".to_string());
        output.set_document(doc_type, parsed, Confidence::Strong, reasoning);
    }

    if let Some(downloads_page) = answer.downloads_page_url.as_deref() {
        if let Ok(parsed) = Url::parse(downloads_page) {
            output.documents.overview = Some(parsed);
        }
    }

    if validation_accepts(answer.schedule_validation.as_ref()) {
        let source = output
            .documents
            .exhibitor_manual
            .as_ref()
            .map(|u| u.to_string())
            .or_else(|| official_url.as_ref().map(|u| u.to_string()));
        output.schedule.merge_build_up(
            answer
                .schedule
                .build_up
                .into_iter()
                .filter(|row| !row.date.is_empty())
                .map(|row| row.into_entry(source.as_deref())),
        );
        output.schedule.merge_tear_down(
            answer
                .schedule
                .tear_down
                .into_iter()
                .filter(|row| !row.date.is_empty())
                .map(|row| row.into_entry(source.as_deref())),
        );
        if !output.schedule.is_empty() {
            output.quality.schedule = Confidence::Strong;
            output.reasoning.schedule = answer
                .schedule_validation
                .clone()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| {
                    Some(format!(
                        "Found {} build-up and {} tear-down entries",
                        output.schedule.build_up.len(),
                        output.schedule.tear_down.len()
                    ))
                });
        }
    } else if let Some(validation) = answer.schedule_validation {
        output.reasoning.schedule = Some(validation);
    }

    if let Some(notes) = answer.notes.filter(|n| !n.trim().is_empty()) {
        output.debug.notes.push(format!("Agent notes: {notes}"));
    }
}

// ============================================================================
// DOWNLOAD AUTO-MAPPING
// ============================================================================

fn keyword_hit(haystack: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|kw| haystack.contains(kw.as_str()))
}

/// Map a browser download to a document slot by filename and URL keywords.
/// First writer wins; the agent answer has already been applied.
fn auto_map_download(download: &DownloadedFile, output: &mut DiscoveryOutput) {
    let Some(raw_url) = download.url.as_deref() else {
        return;
    };
    let Ok(url) = Url::parse(raw_url) else {
        return;
    };
    let filename = download.filename.to_lowercase();
    let url_lower = raw_url.to_lowercase();
    let reg = registry();

    let matches_type = |doc_type: DocumentType| -> bool {
        let kw = reg.for_type(doc_type);
        let hit = keyword_hit(&filename, &kw.download_keywords)
            || keyword_hit(&url_lower, &kw.download_url_keywords);
        hit && !keyword_hit(&filename, &kw.download_exclusions)
    };

    let is_rules = matches_type(DocumentType::Rules);

    if matches_type(DocumentType::Floorplan) && output.is_slot_empty(DocumentType::Floorplan) {
        output.set_document(
            DocumentType::Floorplan,
            url.clone(),
            Confidence::Strong,
            format!("Auto-detected from download: {}", download.filename),
        );
    }
    if is_rules && output.is_slot_empty(DocumentType::Rules) {
        output.set_document(
            DocumentType::Rules,
            url.clone(),
            Confidence::Strong,
            format!("Auto-detected from download: {}", download.filename),
        );
    }
    // A rules match disqualifies the manual slot; "technical manual" PDFs
    // land under rules, not the exhibitor manual.
    if !is_rules
        && matches_type(DocumentType::ExhibitorManual)
        && output.is_slot_empty(DocumentType::ExhibitorManual)
    {
        output.set_document(
            DocumentType::ExhibitorManual,
            url.clone(),
            Confidence::Strong,
            format!("Auto-detected from download: {}", download.filename),
        );
    }
    if matches_type(DocumentType::Schedule) && output.is_slot_empty(DocumentType::Schedule) {
        output.set_document(
            DocumentType::Schedule,
            url,
            Confidence::Strong,
            format!("Auto-detected from download: {}", download.filename),
        );
    }
}

// ============================================================================
// CLASSIFICATION FALLBACK
// ============================================================================

/// Fill slots the agent left empty from pre-scan classification results.
/// Also used directly when the agent is skipped entirely.
pub fn merge_classification_fallback(summary: &ClassificationSummary, output: &mut DiscoveryOutput) {
    for doc_type in [
        DocumentType::Floorplan,
        DocumentType::ExhibitorManual,
        DocumentType::Rules,
        DocumentType::Schedule,
    ] {
        if !output.is_slot_empty(doc_type) {
            continue;
        }
        if let Some(found) = summary.findings.get(&doc_type) {
            // Weak findings fill the slot too; found_count still excludes
            // them, so completeness reporting is unaffected.
            if found.confidence != Confidence::None {
                output.set_document(
                    doc_type,
                    found.url.clone(),
                    found.confidence,
                    format!("Pre-scan: {}", found.reason),
                );
            }
        }
    }

    if output.is_slot_empty(DocumentType::ExhibitorDirectory) {
        if let Some(directory) = &summary.directory_url {
            output.set_document(
                DocumentType::ExhibitorDirectory,
                directory.clone(),
                Confidence::Strong,
                "Pre-scan: exhibitor directory page",
            );
        }
    }

    output.schedule.merge_build_up(summary.schedule.build_up.iter().cloned());
    output.schedule.merge_tear_down(summary.schedule.tear_down.iter().cloned());
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use anthropic_client::{MessageResponse, StopReason};

    use crate::traits::PageState;
    use crate::types::DocumentClassification;
    use crate::types::FairSchedule;

    #[derive(Debug, thiserror::Error)]
    #[error("mock failure: {0}")]
    struct MockError(String);

    // ------------------------------------------------------------------
    // Scripted agent model
    // ------------------------------------------------------------------

    struct ScriptedAgent {
        responses: Mutex<Vec<MessageResponse>>,
        requests: Mutex<Vec<MessageRequest>>,
    }

    impl ScriptedAgent {
        fn new(mut responses: Vec<MessageResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<MessageRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl AgentModel for ScriptedAgent {
        type Error = MockError;

        async fn create_message(
            &self,
            request: MessageRequest,
        ) -> std::result::Result<MessageResponse, MockError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| MockError("script exhausted".into()))
        }
    }

    fn tool_response(name: &str, input: serde_json::Value) -> MessageResponse {
        MessageResponse {
            id: "msg_test".into(),
            content: vec![ContentBlock::ToolUse {
                id: "tool_1".into(),
                name: name.into(),
                input,
            }],
            stop_reason: Some(StopReason::ToolUse),
            usage: None,
        }
    }

    fn text_response(text: &str) -> MessageResponse {
        MessageResponse {
            id: "msg_test".into(),
            content: vec![ContentBlock::text(text)],
            stop_reason: Some(StopReason::EndTurn),
            usage: None,
        }
    }

    // ------------------------------------------------------------------
    // Mock browser
    // ------------------------------------------------------------------

    struct StaticBrowser {
        url: Url,
        links: Vec<LinkCandidate>,
        downloads: Vec<DownloadedFile>,
    }

    impl StaticBrowser {
        fn new(url: &str) -> Self {
            Self {
                url: Url::parse(url).unwrap(),
                links: Vec::new(),
                downloads: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl BrowserDriver for StaticBrowser {
        type Error = MockError;

        async fn goto(&self, url: &Url) -> std::result::Result<PageState, MockError> {
            Ok(PageState {
                url: url.clone(),
                title: "Page".into(),
            })
        }

        async fn current_state(&self) -> std::result::Result<PageState, MockError> {
            Ok(PageState {
                url: self.url.clone(),
                title: "Page".into(),
            })
        }

        async fn extract_links(&self) -> std::result::Result<Vec<LinkCandidate>, MockError> {
            Ok(self.links.clone())
        }

        async fn screenshot(&self) -> std::result::Result<String, MockError> {
            Ok("aGVsbG8=".into())
        }

        async fn perform(&self, _action: &ComputerAction) -> std::result::Result<String, MockError> {
            Ok("done".into())
        }

async fn downloads(&self) -> std::result::Result<Vec<DownloadedFile>, MockError> {
            Ok(self.downloads.clone())
        }

        async fn close(&self) -> std::result::Result<(), MockError> {
            Ok(())
        }
    }

    fn request() -> DiscoveryRequest {
        DiscoveryRequest {
            fair_name: "GreenTech".into(),
            fair_year: 2026,
            fair_city: "Amsterdam".into(),
            fair_country: "Netherlands".into(),
            client_name: "Test Client".into(),
            known_url: Some(Url::parse("https://www.greentech.nl/").unwrap()),
        }
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::default()
    }

    fn count_nudges(requests: &[MessageRequest], needle: &str) -> usize {
        let mut seen = 0;
        // Only count the nudge once per conversation position: take the
        // last (longest) request and scan its user messages.
        if let Some(last) = requests.last() {
            for message in &last.messages {
                for block in &message.content {
                    if let ContentBlock::Text { text } = block {
                        if text.contains(needle) {
                            seen += 1;
                        }
                    }
                }
            }
        }
        seen
    }

    #[tokio::test]
    async fn midpoint_nudge_fires_exactly_once_inside_a_user_message() {
        let max = 10;
        // Nine tool calls, then a final answer.
        let mut responses: Vec<MessageResponse> = (0..9)
            .map(|_| {
                tool_response("goto_url", serde_json::json!({"url": "https://www.greentech.nl/downloads"}))
            })
            .collect();
        responses.push(text_response(
            r#"{"floorplan_url": null, "exhibitor_manual_url": null}"#,
        ));
        let model = ScriptedAgent::new(responses);
        let browser = StaticBrowser::new("https://www.greentech.nl/");
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        let cfg = config().with_max_agent_iterations(max);
        let cancel = CancellationToken::new();

        let used = run_browser_agent(
            &model, &browser, &req, None, None, &mut output, &cfg, &cancel,
        )
        .await
        .unwrap();
        assert_eq!(used, 10);

        let requests = model.requests();
        assert_eq!(count_nudges(&requests, "Interim check"), 1);
        assert_eq!(count_nudges(&requests, "3 actions left"), 1);

        // Roles must strictly alternate; nudges merge into tool results.
        let last = requests.last().unwrap();
        for pair in last.messages.windows(2) {
            assert_ne!(pair[0].role, pair[1].role, "consecutive same-role messages");
        }
    }

    #[tokio::test]
    async fn loop_stops_when_model_answers_without_tools() {
        let model = ScriptedAgent::new(vec![text_response(
            r#"```json
{
  "floorplan_url": "https://www.greentech.nl/fileadmin/floorplan-2026.pdf",
  "floorplan_validation": "Hall plan for GreenTech 2026, all halls visible",
  "exhibitor_manual_url": null,
  "notes": "manual not published yet"
}
```"#,
        )]);
        let browser = StaticBrowser::new("https://www.greentech.nl/");
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        output.official_url = req.known_url.clone();
        let cancel = CancellationToken::new();

        let used = run_browser_agent(
            &model, &browser, &req, None, None, &mut output, &config(), &cancel,
        )
        .await
        .unwrap();
        assert_eq!(used, 1);

        assert_eq!(
            output.document(DocumentType::Floorplan).map(|u| u.as_str()),
            Some("https://www.greentech.nl/fileadmin/floorplan-2026.pdf")
        );
        assert_eq!(output.quality.floorplan, Confidence::Strong);
        assert!(output
            .reasoning
            .floorplan
            .as_deref()
            .unwrap()
            .contains("Hall plan"));
        assert!(output
            .debug
            .notes
            .iter()
            .any(|n| n.contains("manual not published yet")));
    }

    #[tokio::test]
    async fn rejected_validation_keeps_slot_empty() {
        let model = ScriptedAgent::new(vec![text_response(
            r#"{
  "floorplan_url": null,
  "rules_url": "https://www.greentech.nl/rules-2024.pdf",
  "rules_validation": "AFGEWEZEN: document is for the 2024 edition",
  "exhibitor_manual_url": null
}"#,
        )]);
        let browser = StaticBrowser::new("https://www.greentech.nl/");
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        output.official_url = req.known_url.clone();
        let cancel = CancellationToken::new();

        run_browser_agent(
            &model, &browser, &req, None, None, &mut output, &config(), &cancel,
        )
        .await
        .unwrap();

        assert!(output.is_slot_empty(DocumentType::Rules));
        assert!(output
            .reasoning
            .rules
            .as_deref()
            .unwrap()
            .contains("AFGEWEZEN"));
    }

    #[tokio::test]
    async fn cross_fair_url_is_rejected() {
        let model = ScriptedAgent::new(vec![text_response(
            r#"{
  "floorplan_url": "https://www.seafoodexpo.com/floorplan.pdf",
  "floorplan_validation": "Looks like a floorplan",
  "exhibitor_manual_url": "https://dl.cloudfront.net/greentech/manual-2026.pdf",
  "exhibitor_manual_validation": "GreenTech 2026 exhibitor manual, 120 pages"
}"#,
        )]);
        let browser = StaticBrowser::new("https://www.greentech.nl/");
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        output.official_url = req.known_url.clone();
        let cancel = CancellationToken::new();

        run_browser_agent(
            &model, &browser, &req, None, None, &mut output, &config(), &cancel,
        )
        .await
        .unwrap();

        // Foreign fair domain without the fair's name: rejected.
        assert!(output.is_slot_empty(DocumentType::Floorplan));
        assert!(output
            .debug
            .notes
            .iter()
            .any(|n| n.contains("another fair")));
        // Known CDN host: accepted.
        assert!(!output.is_slot_empty(DocumentType::ExhibitorManual));
    }

    #[tokio::test]
    async fn downloads_auto_map_first_writer_wins() {
        let mut browser = StaticBrowser::new("https://www.greentech.nl/");
        browser.downloads = vec![
            DownloadedFile {
                filename: "hallenplan_2026.pdf".into(),
                url: Some("https://www.greentech.nl/files/hallenplan_2026.pdf".into()),
            },
            DownloadedFile {
                filename: "site-overview.pdf".into(),
                url: Some("https://www.greentech.nl/files/site-overview.pdf".into()),
            },
            DownloadedFile {
                filename: "technische-richtlinien-plan.pdf".into(),
                url: Some("https://www.greentech.nl/files/technische-richtlinien-plan.pdf".into()),
            },
        ];
        let model = ScriptedAgent::new(vec![text_response(
            r#"{"floorplan_url": null, "exhibitor_manual_url": null}"#,
        )]);
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        output.official_url = req.known_url.clone();
        let cancel = CancellationToken::new();

        run_browser_agent(
            &model, &browser, &req, None, None, &mut output, &config(), &cancel,
        )
        .await
        .unwrap();

        // First floorplan-looking file wins; the second never overwrites.
        assert_eq!(
            output.document(DocumentType::Floorplan).map(|u| u.as_str()),
            Some("https://www.greentech.nl/files/hallenplan_2026.pdf")
        );
        // "plan" inside a guidelines filename maps to rules, not floorplan.
        assert_eq!(
            output.document(DocumentType::Rules).map(|u| u.as_str()),
            Some("https://www.greentech.nl/files/technische-richtlinien-plan.pdf")
        );
    }

    #[tokio::test]
    async fn schedule_entries_from_answer_are_deduped() {
        let model = ScriptedAgent::new(vec![text_response(
            r#"{
  "floorplan_url": null,
  "exhibitor_manual_url": null,
  "schedule": {
    "build_up": [
      {"date": "2026-06-07", "time": "08:00-18:00", "description": "Build-up day 1"},
      {"date": "2026-06-07", "time": "08:00-18:00", "description": "Duplicate"}
    ],
    "tear_down": [
      {"date": "2026-06-12", "time": "", "description": "Tear-down"}
    ]
  },
  "schedule_validation": "Dates from the exhibitor manual"
}"#,
        )]);
        let browser = StaticBrowser::new("https://www.greentech.nl/");
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        output.official_url = req.known_url.clone();
        let cancel = CancellationToken::new();

        run_browser_agent(
            &model, &browser, &req, None, None, &mut output, &config(), &cancel,
        )
        .await
        .unwrap();

        assert_eq!(output.schedule.build_up.len(), 1);
        assert_eq!(output.schedule.tear_down.len(), 1);
        assert_eq!(output.quality.schedule, Confidence::Strong);
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_result() {
        let browser = StaticBrowser::new("https://www.greentech.nl/");
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        let block = run_tool(&browser, "tool_9", "bash", &serde_json::json!({}), &mut output).await;
        match block {
            ContentBlock::ToolResult { is_error, .. } => assert_eq!(is_error, Some(true)),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn classification_fallback_fills_only_empty_slots() {
        let req = request();
        let mut output = DiscoveryOutput::new(&req);
        output.set_document(
            DocumentType::Rules,
            Url::parse("https://www.greentech.nl/agent-rules.pdf").unwrap(),
            Confidence::Strong,
            "Found by browser agent",
        );

        let mut summary = ClassificationSummary::default();
        summary.findings.insert(
            DocumentType::Rules,
            DocumentClassification {
                url: Url::parse("https://www.greentech.nl/prescan-rules.pdf").unwrap(),
                doc_type: DocumentType::Rules,
                confidence: Confidence::Strong,
                year: Some(2026),
                title: None,
                reason: "verified".into(),
                type_verified: true,
                fair_verified: true,
                year_verified: true,
                content_useful: true,
                extracted_schedule: FairSchedule::default(),
            },
        );
        summary.findings.insert(
            DocumentType::Floorplan,
            DocumentClassification {
                url: Url::parse("https://www.greentech.nl/floorplan.pdf").unwrap(),
                doc_type: DocumentType::Floorplan,
                confidence: Confidence::Partial,
                year: Some(2026),
                title: None,
                reason: "type and year match".into(),
                type_verified: true,
                fair_verified: false,
                year_verified: true,
                content_useful: true,
                extracted_schedule: FairSchedule::default(),
            },
        );
        summary.directory_url = Some(Url::parse("https://exhibitors.greentech.nl/").unwrap());

        merge_classification_fallback(&summary, &mut output);

        // The agent's rules URL survives.
        assert_eq!(
            output.document(DocumentType::Rules).map(|u| u.as_str()),
            Some("https://www.greentech.nl/agent-rules.pdf")
        );
        assert_eq!(
            output.document(DocumentType::Floorplan).map(|u| u.as_str()),
            Some("https://www.greentech.nl/floorplan.pdf")
        );
        assert_eq!(output.quality.floorplan, Confidence::Partial);
        assert!(!output.is_slot_empty(DocumentType::ExhibitorDirectory));
    }

    #[test]
    fn schedule_download_fills_quality_and_reasoning() {
        let req = request();
        let mut output = DiscoveryOutput::new(&req);

        auto_map_download(
            &DownloadedFile {
                filename: "aufbau-schedule-2026.pdf".into(),
                url: Some("https://www.greentech.nl/files/aufbau-schedule-2026.pdf".into()),
            },
            &mut output,
        );

        assert!(!output.is_slot_empty(DocumentType::Schedule));
        assert_eq!(output.quality.schedule, Confidence::Strong);
        assert!(output.reasoning.schedule.is_some());
        assert_eq!(output.found_count(), 1);
    }

    #[test]
    fn weak_fallback_fills_the_slot_without_counting_as_found() {
        let req = request();
        let mut output = DiscoveryOutput::new(&req);

        let mut summary = ClassificationSummary::default();
        summary.findings.insert(
            DocumentType::ExhibitorManual,
            DocumentClassification {
                url: Url::parse("https://www.greentech.nl/manual.pdf").unwrap(),
                doc_type: DocumentType::ExhibitorManual,
                confidence: Confidence::Weak,
                year: None,
                title: None,
                reason: "could not extract readable text".into(),
                type_verified: false,
                fair_verified: false,
                year_verified: false,
                content_useful: false,
                extracted_schedule: FairSchedule::default(),
            },
        );

        merge_classification_fallback(&summary, &mut output);

        assert_eq!(
            output.document(DocumentType::ExhibitorManual).map(|u| u.as_str()),
            Some("https://www.greentech.nl/manual.pdf")
        );
        assert_eq!(output.quality.exhibitor_manual, Confidence::Weak);
        assert_eq!(output.found_count(), 0);
    }

    #[test]
    fn midpoint_is_clamped_to_five() {
        assert_eq!(midpoint_iteration(40), 20);
        assert_eq!(midpoint_iteration(6), 5);
        assert_eq!(midpoint_iteration(4), 5);
    }
}
