//! The discovery pipeline.
//!
//! Wires the phases together: URL lookup, pre-scan, portal scan,
//! classification, the browser agent, and result assembly. One browser is
//! launched per job and released on every exit path. Partial results are
//! stored after each phase so cancelled and failed jobs still expose what
//! was found.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::{merge_classification_fallback, run_browser_agent};
use crate::classifier::{classify_documents, extract_download_schedules};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::frontier::{portal_scan, pre_scan, PreScanReport};
use crate::phases::PhaseId;
use crate::scheduler::{JobHandle, JobRunner};
use crate::store::FairStore;
use crate::traits::{AgentModel, BrowserDriver, BrowserProvider, ChatModel, DocumentFetcher};
use crate::types::{DiscoveryOutput, DiscoveryRequest};
use crate::url_lookup::resolve_fair_url;

/// Runs discoveries against real or mocked collaborators.
pub struct DiscoveryEngine<P, M, A, F, S> {
    browser_provider: P,
    fast_model: M,
    agent_model: A,
    fetcher: F,
    store: S,
    config: DiscoveryConfig,
}

impl<P, M, A, F, S> DiscoveryEngine<P, M, A, F, S>
where
    P: BrowserProvider,
    M: ChatModel,
    A: AgentModel,
    F: DocumentFetcher,
    S: FairStore,
{
    pub fn new(
        browser_provider: P,
        fast_model: M,
        agent_model: A,
        fetcher: F,
        store: S,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            browser_provider,
            fast_model,
            agent_model,
            fetcher,
            store,
            config,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    async fn run_inner(
        &self,
        request: &DiscoveryRequest,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryOutput> {
        handle.set_phase(PhaseId::UrlLookup);
        handle.log(format!(
            "Looking up website for {} {}",
            request.fair_name, request.fair_year
        ));
        handle.ensure_active(cancel)?;

        let official_url =
            resolve_fair_url(&self.fast_model, request, self.config.url_lookup_attempts).await?;
        handle.log(format!("Official website: {official_url}"));

        let mut output = DiscoveryOutput::new(request);
        output.official_url = Some(official_url.clone());
        handle.store_partial(output.clone());
        handle.ensure_active(cancel)?;

        let browser = self
            .browser_provider
            .launch(self.config.display_width, self.config.display_height)
            .await
            .map_err(|e| DiscoveryError::Browser(e.to_string()))?;

        // Keep the outcome aside so the browser is released on every path.
        let outcome = self
            .run_with_browser(&browser, request, &official_url, output, handle, cancel)
            .await;
        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "browser close failed");
        }
        outcome
    }

    async fn run_with_browser<B: BrowserDriver>(
        &self,
        browser: &B,
        request: &DiscoveryRequest,
        official_url: &url::Url,
        mut output: DiscoveryOutput,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryOutput> {
        handle.set_phase(PhaseId::Prescan);
        handle.log("Scanning website for documents");
        let mut report = pre_scan(browser, official_url, &self.config, cancel).await?;
        handle.log(format!(
            "Pre-scan: {} PDF candidates, {} exhibitor pages, {} portals",
            report.pdf_candidates.len(),
            report.exhibitor_pages.len(),
            report.portal_pages.len()
        ));
        for url in &report.visited {
            output.debug.visited_urls.push(url.to_string());
        }
        handle.store_partial(output.clone());

        handle.set_phase(PhaseId::PortalScan);
        if report.portal_pages.is_empty() {
            handle.log("No exhibitor portals found");
        } else {
            handle.log(format!(
                "Scanning {} exhibitor portal(s)",
                report.portal_pages.len()
            ));
            portal_scan(browser, &mut report, cancel).await?;
        }

        handle.set_phase(PhaseId::Classification);
        handle.log(format!(
            "Classifying {} PDF candidates",
            report.pdf_candidates.len()
        ));
        let summary = classify_documents(
            &self.fast_model,
            &self.fetcher,
            &report.pdf_candidates,
            &report.exhibitor_pages,
            request,
            Some(official_url),
            &self.config,
            cancel,
        )
        .await?;
        handle.log(format!(
            "Classification: {} found ({} strong), {} missing",
            summary.found_types.len(),
            summary.strong_count,
            summary.missing_types.len()
        ));
        handle.store_partial(output.clone());
        handle.ensure_active(cancel)?;

        // The agent only runs when classification left gaps: fewer than
        // three strong findings, or no schedule data at all.
        let skip_agent = summary.skip_agent_safe() && !summary.schedule.is_empty();
        if skip_agent {
            handle.log("Enough strong findings, skipping browser agent");
            output
                .debug
                .notes
                .push("Browser agent skipped after classification".to_string());
        } else {
            handle.set_phase(PhaseId::BrowserAgent);
            handle.log("Starting browser agent");
            let iterations = run_browser_agent(
                &self.agent_model,
                browser,
                request,
                Some(&summary),
                Some(&report),
                &mut output,
                &self.config,
                cancel,
            )
            .await?;
            handle.log(format!("Browser agent finished after {iterations} iterations"));

            // Agent downloads are auto-mapped by filename only; read the
            // ones the classifier never saw for schedule data.
            match browser.downloads().await {
                Ok(downloads) if !downloads.is_empty() => {
                    let classified: HashSet<String> = report
                        .pdf_candidates
                        .iter()
                        .map(|c| c.url.as_str().to_string())
                        .collect();
                    let scanned = extract_download_schedules(
                        &self.fast_model,
                        &self.fetcher,
                        &downloads,
                        &classified,
                        request,
                        &self.config,
                        &mut output,
                    )
                    .await;
                    if scanned > 0 {
                        handle.log(format!("Post-scanned {scanned} downloaded PDFs for schedule data"));
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "reading downloads failed"),
            }
            handle.store_partial(output.clone());
        }

        handle.set_phase(PhaseId::Results);
        merge_classification_fallback(&summary, &mut output);
        self.finish(&mut output, &report, handle);
        Ok(output)
    }

    fn finish(&self, output: &mut DiscoveryOutput, report: &PreScanReport, handle: &JobHandle) {
        let found = output.found_count();
        handle.log(format!(
            "Result: {found}/5 documents, status {:?}",
            output.status()
        ));
        for missing in output.missing_types() {
            handle.log(format!("Missing: {}", missing.label()));
        }
        output.debug.notes.push(format!(
            "Visited {} pages during pre-scan",
            report.visited.len()
        ));
    }
}

#[async_trait]
impl<P, M, A, F, S> JobRunner for DiscoveryEngine<P, M, A, F, S>
where
    P: BrowserProvider + Send + Sync + 'static,
    M: ChatModel + Send + Sync + 'static,
    A: AgentModel + Send + Sync + 'static,
    F: DocumentFetcher + Send + Sync + 'static,
    S: FairStore + 'static,
{
    async fn run(
        &self,
        request: DiscoveryRequest,
        handle: JobHandle,
        cancel: CancellationToken,
    ) -> Result<DiscoveryOutput> {
        let output = self.run_inner(&request, &handle, &cancel).await?;
        // Persistence failure does not fail a finished discovery; the
        // result still reaches the caller through the job map.
        match self.store.import(&request, &output).await {
            Ok(id) => handle.log(format!("Stored result as {id}")),
            Err(e) => tracing::warn!(error = %e, "storing discovery result failed"),
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use anthropic_client::{ContentBlock, MessageRequest, MessageResponse, StopReason};
    use url::Url;

    use crate::scheduler::JobScheduler;
    use crate::store::MemoryFairStore;
    use crate::traits::{ComputerAction, DownloadedFile, PageState};
    use crate::types::{Confidence, DocumentType, JobStatus, LinkCandidate};

    #[derive(Debug, thiserror::Error)]
    #[error("mock failure: {0}")]
    struct MockError(String);

    // ------------------------------------------------------------------
    // Browser provider
    // ------------------------------------------------------------------

    #[derive(Default, Clone)]
    struct SiteMap {
        pages: HashMap<String, Vec<LinkCandidate>>,
    }

    impl SiteMap {
        fn page(mut self, url: &str, links: Vec<(&str, &str)>) -> Self {
            let links = links
                .into_iter()
                .map(|(u, t)| {
                    let url = Url::parse(u).unwrap();
                    let is_pdf = crate::links::is_pdf_link(url.as_str(), t);
                    LinkCandidate {
                        url,
                        text: t.to_string(),
                        is_pdf,
                    }
                })
                .collect();
            self.pages.insert(url.to_string(), links);
            self
        }
    }

    struct SiteBrowser {
        pages: HashMap<String, Vec<LinkCandidate>>,
        current: Mutex<String>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl BrowserDriver for SiteBrowser {
        type Error = MockError;

        async fn goto(&self, url: &Url) -> std::result::Result<PageState, MockError> {
            *self.current.lock().unwrap() = url.as_str().to_string();
            Ok(PageState {
                url: url.clone(),
                title: String::new(),
            })
        }

        async fn current_state(&self) -> std::result::Result<PageState, MockError> {
            let current = self.current.lock().unwrap().clone();
            Ok(PageState {
                url: Url::parse(&current).unwrap(),
                title: String::new(),
            })
        }

        async fn extract_links(&self) -> std::result::Result<Vec<LinkCandidate>, MockError> {
            let current = self.current.lock().unwrap().clone();
            Ok(self.pages.get(&current).cloned().unwrap_or_default())
        }

        async fn screenshot(&self) -> std::result::Result<String, MockError> {
            Ok("aGVsbG8=".into())
        }

        async fn perform(&self, _action: &ComputerAction) -> std::result::Result<String, MockError> {
            Ok("done".into())
        }

async fn downloads(&self) -> std::result::Result<Vec<DownloadedFile>, MockError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> std::result::Result<(), MockError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct SiteProvider(SiteMap);

    #[async_trait]
    impl BrowserProvider for SiteProvider {
        type Driver = SiteBrowser;
        type Error = MockError;

        async fn launch(&self, _w: u32, _h: u32) -> std::result::Result<SiteBrowser, MockError> {
            Ok(SiteBrowser {
                pages: self.0.pages.clone(),
                current: Mutex::new("about:blank".into()),
                closed: Mutex::new(false),
            })
        }
    }

    // ------------------------------------------------------------------
    // Models and fetcher
    // ------------------------------------------------------------------

    /// Chat model answering every validation request with the same verdict.
    struct FixedVerdict(&'static str);

    #[async_trait]
    impl ChatModel for FixedVerdict {
        type Error = MockError;

        async fn complete(
            &self,
            _system: &str,
            _user: &str,
        ) -> std::result::Result<String, MockError> {
            Ok(self.0.to_string())
        }
    }

    const STRONG_VERDICT: &str = r#"{
        "is_correct_type": true,
        "is_correct_fair": true,
        "is_correct_year": true,
        "is_useful": true,
        "detected_year": "2026",
        "title": "Verified document",
        "reason": "matches the requested edition",
        "schedule_found": true,
        "build_up": [{"date": "2026-03-28", "time": "07:00-19:00", "description": "Hall setup"}],
        "tear_down": []
    }"#;

    /// Agent model that must never be reached.
    struct UnreachableAgent;

    #[async_trait]
    impl AgentModel for UnreachableAgent {
        type Error = MockError;

        async fn create_message(
            &self,
            _request: MessageRequest,
        ) -> std::result::Result<MessageResponse, MockError> {
            Err(MockError("agent should have been skipped".into()))
        }
    }

    /// Agent model answering immediately with a final JSON.
    struct AnswerAgent(&'static str);

    #[async_trait]
    impl AgentModel for AnswerAgent {
        type Error = MockError;

        async fn create_message(
            &self,
            _request: MessageRequest,
        ) -> std::result::Result<MessageResponse, MockError> {
            Ok(MessageResponse {
                id: "msg_test".into(),
                content: vec![ContentBlock::text(self.0)],
                stop_reason: Some(StopReason::EndTurn),
                usage: None,
            })
        }
    }

    struct PdfFetcher(Vec<u8>);

    #[async_trait]
    impl DocumentFetcher for PdfFetcher {
        type Error = MockError;

        async fn fetch_prefix(
            &self,
            _url: &Url,
            _max_bytes: u64,
        ) -> std::result::Result<Vec<u8>, MockError> {
            Ok(self.0.clone())
        }
    }

    fn pdf_with_text(text: &str) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().unwrap(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn request() -> DiscoveryRequest {
        DiscoveryRequest {
            fair_name: "bauma".into(),
            fair_year: 2026,
            fair_city: "Munich".into(),
            fair_country: "Germany".into(),
            client_name: "Acme Standbouw".into(),
            known_url: Some(Url::parse("https://www.bauma.de/").unwrap()),
        }
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::default().with_scan_limits(2, 0)
    }

    async fn wait_terminal<R: JobRunner>(
        scheduler: &JobScheduler<R>,
        id: uuid::Uuid,
    ) -> crate::scheduler::JobView {
        for _ in 0..400 {
            if let Some(view) = scheduler.get(id) {
                if view.status.is_terminal() {
                    return view;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("job never finished");
    }

    #[tokio::test]
    async fn strong_prescan_findings_skip_the_browser_agent() {
        let site = SiteMap::default().page(
            "https://www.bauma.de/",
            vec![
                ("https://www.bauma.de/d/hallenplan-bauma-2026.pdf", "Hallenplan 2026"),
                (
                    "https://www.bauma.de/d/exhibitor-manual-bauma-2026.pdf",
                    "Exhibitor Manual 2026",
                ),
                (
                    "https://www.bauma.de/d/technical-guidelines-bauma-2026.pdf",
                    "Technical Guidelines 2026",
                ),
            ],
        );
        let pdf = pdf_with_text(
            "bauma 2026 Munich. Official exhibitor document with build-up, stand \
             construction and hall layout details for the 2026 edition of bauma.",
        );
        let engine = DiscoveryEngine::new(
            SiteProvider(site),
            FixedVerdict(STRONG_VERDICT),
            UnreachableAgent,
            PdfFetcher(pdf),
            MemoryFairStore::new(),
            config(),
        );

        let scheduler = JobScheduler::new(engine);
        let id = scheduler.start(request());
        let view = wait_terminal(&scheduler, id).await;

        assert_eq!(view.status, JobStatus::Completed, "error: {:?}", view.error);
        let output = view.result.unwrap();
        assert!(!output.is_slot_empty(DocumentType::Floorplan));
        assert!(!output.is_slot_empty(DocumentType::ExhibitorManual));
        assert!(!output.is_slot_empty(DocumentType::Rules));
        assert_eq!(output.quality.floorplan, Confidence::Strong);
        assert!(output
            .debug
            .notes
            .iter()
            .any(|n| n.contains("agent skipped")));
    }

    #[tokio::test]
    async fn agent_runs_when_prescan_finds_nothing() {
        let site = SiteMap::default().page("https://www.bauma.de/", vec![]);
        let engine = DiscoveryEngine::new(
            SiteProvider(site),
            FixedVerdict("{}"),
            AnswerAgent(
                r#"{
  "floorplan_url": "https://www.bauma.de/d/plan-2026.pdf",
  "floorplan_validation": "Hall plan for bauma 2026",
  "exhibitor_manual_url": null
}"#,
            ),
            PdfFetcher(Vec::new()),
            MemoryFairStore::new(),
            config(),
        );

        let scheduler = JobScheduler::new(engine);
        let id = scheduler.start(request());
        let view = wait_terminal(&scheduler, id).await;

        assert_eq!(view.status, JobStatus::Completed, "error: {:?}", view.error);
        let output = view.result.unwrap();
        assert_eq!(
            output.document(DocumentType::Floorplan).map(|u| u.as_str()),
            Some("https://www.bauma.de/d/plan-2026.pdf")
        );
        assert!(view
            .logs
            .iter()
            .any(|l| l.contains("Starting browser agent")));
    }

    #[tokio::test]
    async fn completed_discovery_is_persisted_to_the_store() {
        let site = SiteMap::default().page("https://www.bauma.de/", vec![]);
        let store = MemoryFairStore::new();
        let engine = DiscoveryEngine::new(
            SiteProvider(site),
            FixedVerdict("{}"),
            AnswerAgent(r#"{"floorplan_url": null, "exhibitor_manual_url": null}"#),
            PdfFetcher(Vec::new()),
            store.clone(),
            config(),
        );

        let scheduler = JobScheduler::new(engine);
        let id = scheduler.start(request());
        let view = wait_terminal(&scheduler, id).await;
        assert_eq!(view.status, JobStatus::Completed);

        let stored = store.get("bauma-2026").await.unwrap().unwrap();
        assert_eq!(stored.request.fair_name, "bauma");
        assert_eq!(
            stored.output.official_url.as_ref().map(|u| u.as_str()),
            Some("https://www.bauma.de/")
        );
    }

    #[tokio::test]
    async fn cancelled_job_keeps_the_official_url_partial() {
        let site = SiteMap::default().page("https://www.bauma.de/", vec![]);
        let engine = DiscoveryEngine::new(
            SiteProvider(site),
            FixedVerdict("{}"),
            AnswerAgent(r#"{"floorplan_url": null, "exhibitor_manual_url": null}"#),
            PdfFetcher(Vec::new()),
            MemoryFairStore::new(),
            config(),
        );

        let scheduler = JobScheduler::new(engine);
        let id = scheduler.start(request());
        scheduler.cancel(id).unwrap();
        let view = wait_terminal(&scheduler, id).await;

        // Cancellation may land before or after the first phase boundary.
        assert!(matches!(
            view.status,
            JobStatus::Cancelled | JobStatus::Completed
        ));
    }
}
