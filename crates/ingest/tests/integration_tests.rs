//! Integration tests for the ingest pipeline
//!
//! The orchestrator runs against a real SQLite tracker and real file writers
//! in a temp directory; only the Gmail side is replaced by in-memory fakes.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use ingest::pipeline::NOT_RETURNED;
use ingest::{
    BatchResult, Collaborators, DiscoverySource, EmailBody, EmailHeader, FetchSource,
    FetchTracker, Ingestor, Label, MarkdownConverter, MarkdownWriter, MessageId, MessageStatus,
    MessageStub, ParsedMessage, PipelineOptions, Progress, RateLimitError, RawEmailStore,
    RunStatus, Stage, StubPages, ThreadId,
};
use tempfile::TempDir;

const PAGE_SIZE: usize = 7;
const BATCH_SIZE: usize = 5;

fn id(n: usize) -> String {
    format!("msg-{:02}", n)
}

// === Fakes ===

struct FakeDiscovery {
    ids: Vec<String>,
    labels: Vec<Label>,
    fail_on_page: Option<usize>,
    empty_page_at: Option<usize>,
    pages_served: Cell<usize>,
}

impl FakeDiscovery {
    fn with_ids(n: usize) -> Self {
        Self {
            ids: (0..n).map(id).collect(),
            labels: vec![Label::new("INBOX", "INBOX"), Label::new("Label_1", "Work")],
            fail_on_page: None,
            empty_page_at: None,
            pages_served: Cell::new(0),
        }
    }
}

impl DiscoverySource for FakeDiscovery {
    fn list_labels(&self) -> Result<Vec<Label>> {
        Ok(self.labels.clone())
    }

    fn discover_message_ids<'a>(
        &'a self,
        _label: &str,
        _query: Option<&str>,
        page_size: usize,
    ) -> StubPages<'a> {
        let mut pages: Vec<Vec<MessageStub>> = self
            .ids
            .chunks(page_size)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|m| MessageStub::new(m.clone(), format!("t-{}", m)))
                    .collect()
            })
            .collect();
        if let Some(at) = self.empty_page_at {
            pages.insert(at, Vec::new());
        }

        Box::new(pages.into_iter().enumerate().map(move |(i, page)| {
            self.pages_served.set(self.pages_served.get() + 1);
            if self.fail_on_page == Some(i) {
                Err(anyhow!("listing page {} failed", i))
            } else {
                Ok(page)
            }
        }))
    }
}

enum BatchFailure {
    Network,
    RateLimited,
}

#[derive(Default)]
struct FakeFetcher {
    unparseable: RefCell<HashSet<String>>,
    dropped: HashSet<String>,
    html_overrides: HashMap<String, String>,
    subject_overrides: HashMap<String, String>,
    batch_failure: RefCell<Option<BatchFailure>>,
    calls: RefCell<Vec<Vec<String>>>,
}

impl FakeFetcher {
    fn parsed(&self, message_id: &str) -> ParsedMessage {
        let date = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let html = self
            .html_overrides
            .get(message_id)
            .cloned()
            .unwrap_or_else(|| format!("<p>Hello from {}</p>", message_id));
        let subject = self
            .subject_overrides
            .get(message_id)
            .cloned()
            .unwrap_or_else(|| format!("Subject {}", message_id));
        let mut header = EmailHeader::new(
            subject,
            "Alice <alice@example.com>",
            "bob@example.com",
            date,
        );
        header.cc = "carol@example.com".to_string();
        header.message_id_header = format!("<{}@mail.example.com>", message_id);
        ParsedMessage {
            id: MessageId::new(message_id),
            thread_id: ThreadId::new(format!("t-{}", message_id)),
            label_ids: vec!["INBOX".to_string(), "Label_1".to_string()],
            header,
            body: EmailBody::new(Some(format!("Body of {}", message_id)), Some(html)),
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.calls.borrow().iter().map(Vec::len).collect()
    }

    fn fetched_order(&self) -> Vec<String> {
        self.calls.borrow().iter().flatten().cloned().collect()
    }
}

impl FetchSource for FakeFetcher {
    fn fetch_messages_batch(&self, ids: &[MessageId]) -> Result<BatchResult> {
        self.calls
            .borrow_mut()
            .push(ids.iter().map(|m| m.as_str().to_string()).collect());

        match self.batch_failure.borrow().as_ref() {
            Some(BatchFailure::Network) => return Err(anyhow!("connection reset by peer")),
            Some(BatchFailure::RateLimited) => {
                return Err(RateLimitError {
                    context: "get message".to_string(),
                    retries: 5,
                }
                .into());
            }
            None => {}
        }

        let unparseable = self.unparseable.borrow();
        Ok(ids
            .iter()
            .filter(|m| !self.dropped.contains(m.as_str()))
            .map(|m| {
                let result = if unparseable.contains(m.as_str()) {
                    Err(anyhow!("malformed payload for {}", m))
                } else {
                    Ok(self.parsed(m.as_str()))
                };
                (m.clone(), result)
            })
            .collect())
    }
}

// === Harness ===

struct Harness {
    dir: TempDir,
    discovery: Rc<FakeDiscovery>,
    fetcher: Rc<FakeFetcher>,
    ingestor: Ingestor,
}

impl Harness {
    fn new(discovery: FakeDiscovery, fetcher: FakeFetcher) -> Self {
        let dir = TempDir::new().unwrap();
        let discovery = Rc::new(discovery);
        let fetcher = Rc::new(fetcher);

        let tracker = FetchTracker::open(dir.path().join("data/ingest.db")).unwrap();
        let collaborators = Collaborators {
            discovery: discovery.clone(),
            fetcher: fetcher.clone(),
            converter: Box::new(MarkdownConverter::new()),
            raw_store: Box::new(RawEmailStore::new(dir.path().join("raw")).unwrap()),
            writer: Box::new(MarkdownWriter::new(dir.path().join("markdown")).unwrap()),
        };
        let options = PipelineOptions {
            label: "INBOX".to_string(),
            page_size: PAGE_SIZE,
            batch_size: BATCH_SIZE,
        };

        Self {
            dir,
            discovery,
            fetcher,
            ingestor: Ingestor::new(tracker, collaborators, options),
        }
    }

    fn with_ids(n: usize) -> Self {
        Self::new(FakeDiscovery::with_ids(n), FakeFetcher::default())
    }

    fn tracker(&self) -> &FetchTracker {
        self.ingestor.tracker()
    }

    fn status_of(&self, n: usize) -> MessageStatus {
        self.tracker()
            .get_message(&MessageId::new(id(n)))
            .unwrap()
            .unwrap()
            .status
    }

    fn discover_all(&mut self) {
        self.ingestor.run_discovery(None, None, None, 0).unwrap();
    }
}

// === Discovery ===

#[test]
fn test_discovery_limit_takes_exactly_limit() {
    let mut h = Harness::with_ids(25);

    let stats = h.ingestor.run_discovery(None, None, Some(10), 0).unwrap();

    assert_eq!(stats.collected, 10);
    assert_eq!(stats.inserted, 10);
    assert_eq!(h.tracker().count_by_status().unwrap().pending, 10);
    // 10 identifiers span two pages of 7; the third page is never requested
    assert_eq!(h.discovery.pages_served.get(), 2);
}

#[test]
fn test_discovery_offset_skips_source_order() {
    let mut h = Harness::with_ids(25);

    let stats = h.ingestor.run_discovery(None, None, Some(3), 5).unwrap();
    assert_eq!(stats.collected, 3);

    let pending = h.tracker().get_pending_ids(100, 0).unwrap();
    let pending: Vec<&str> = pending.iter().map(MessageId::as_str).collect();
    assert_eq!(pending, vec![id(5), id(6), id(7)]);
}

#[test]
fn test_rediscovery_is_idempotent() {
    let mut h = Harness::with_ids(25);

    let first = h.ingestor.run_discovery(None, None, None, 0).unwrap();
    let second = h.ingestor.run_discovery(None, None, None, 0).unwrap();

    assert_eq!(first.inserted, 25);
    assert_eq!(second.collected, 25);
    assert_eq!(second.inserted, 0);
    assert_eq!(h.tracker().count_by_status().unwrap().total(), 25);
}

#[test]
fn test_rediscovery_does_not_reset_progress() {
    let mut h = Harness::with_ids(4);
    h.discover_all();
    h.ingestor.run_fetch_pending(None, 0, None).unwrap();

    h.discover_all();

    let counts = h.tracker().count_by_status().unwrap();
    assert_eq!(counts.fetched, 4);
    assert_eq!(counts.pending, 0);
}

#[test]
fn test_discovery_page_failure_is_fatal_but_keeps_earlier_pages() {
    let mut discovery = FakeDiscovery::with_ids(20);
    discovery.fail_on_page = Some(1);
    let mut h = Harness::new(discovery, FakeFetcher::default());

    let err = h.ingestor.run_discovery(None, None, None, 0).unwrap_err();

    assert!(format!("{err:#}").contains("listing page 1 failed"));
    assert_eq!(h.tracker().count_by_status().unwrap().pending, PAGE_SIZE);
}

#[test]
fn test_discovery_stops_at_empty_page() {
    let mut discovery = FakeDiscovery::with_ids(20);
    discovery.empty_page_at = Some(1);
    let mut h = Harness::new(discovery, FakeFetcher::default());

    let stats = h.ingestor.run_discovery(None, None, None, 0).unwrap();

    assert_eq!(stats.collected, PAGE_SIZE);
    assert_eq!(h.discovery.pages_served.get(), 2);
    assert_eq!(h.tracker().count_by_status().unwrap().pending, PAGE_SIZE);
}

// === Fetch ===

#[test]
fn test_fetch_batches_of_five_over_twelve() {
    let mut h = Harness::with_ids(12);
    h.discover_all();

    let fetched = h.ingestor.run_fetch_pending(None, 0, Some(5)).unwrap();

    assert_eq!(fetched, 12);
    assert_eq!(h.fetcher.batch_sizes(), vec![5, 5, 2]);
    assert_eq!(h.tracker().count_by_status().unwrap().fetched, 12);
}

#[test]
fn test_fetch_stores_raw_bodies_and_metadata() {
    let mut h = Harness::with_ids(1);
    h.discover_all();
    h.ingestor.run_fetch_pending(None, 0, None).unwrap();

    let row = h.tracker().get_message(&MessageId::new(id(0))).unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Fetched);
    assert_eq!(row.subject, "Subject msg-00");
    assert_eq!(row.sender, "Alice <alice@example.com>");
    assert_eq!(row.recipients, "bob@example.com");
    assert!(row.error_message.is_none());

    let text = fs::read_to_string(row.raw_text_path.unwrap()).unwrap();
    let html = fs::read_to_string(row.raw_html_path.unwrap()).unwrap();
    assert_eq!(text, "Body of msg-00");
    assert_eq!(html, "<p>Hello from msg-00</p>");

    let labels = h.tracker().get_message_labels(&MessageId::new(id(0))).unwrap();
    let label_ids: Vec<&str> = labels.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(label_ids, vec!["INBOX", "Label_1"]);
}

#[test]
fn test_single_parse_failure_is_isolated() {
    let fetcher = FakeFetcher::default();
    fetcher.unparseable.borrow_mut().insert(id(2));
    let mut h = Harness::new(FakeDiscovery::with_ids(5), fetcher);
    h.discover_all();

    let fetched = h.ingestor.run_fetch_pending(None, 0, Some(5)).unwrap();

    assert_eq!(fetched, 4);
    let counts = h.tracker().count_by_status().unwrap();
    assert_eq!(counts.fetched, 4);
    assert_eq!(counts.failed, 1);

    let progress = h.ingestor.progress();
    assert_eq!(progress.failures.len(), 1);
    assert_eq!(progress.failures[0].message_id.as_str(), id(2));
    assert!(progress.failures[0].error.contains("malformed payload"));
    assert_eq!(progress.last_batch_failed, vec![MessageId::new(id(2))]);

    let row = h.tracker().get_message(&MessageId::new(id(2))).unwrap().unwrap();
    assert!(row.error_message.unwrap().contains("malformed payload"));
}

#[test]
fn test_missing_from_batch_response_marked_failed() {
    let fetcher = FakeFetcher {
        dropped: HashSet::from([id(1)]),
        ..FakeFetcher::default()
    };
    let mut h = Harness::new(FakeDiscovery::with_ids(3), fetcher);
    h.discover_all();

    let fetched = h.ingestor.run_fetch_pending(None, 0, None).unwrap();

    assert_eq!(fetched, 2);
    let row = h.tracker().get_message(&MessageId::new(id(1))).unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some(NOT_RETURNED));
}

#[test]
fn test_batch_level_error_fails_whole_batch_and_stops() {
    let fetcher = FakeFetcher::default();
    *fetcher.batch_failure.borrow_mut() = Some(BatchFailure::Network);
    let mut h = Harness::new(FakeDiscovery::with_ids(12), fetcher);
    h.discover_all();

    let fetched = h.ingestor.run_fetch_pending(None, 0, Some(5)).unwrap();

    assert_eq!(fetched, 0);
    assert_eq!(h.fetcher.batch_sizes(), vec![5]);
    let counts = h.tracker().count_by_status().unwrap();
    assert_eq!(counts.failed, 5);
    assert_eq!(counts.pending, 7);

    let failures = &h.ingestor.progress().failures;
    assert_eq!(failures.len(), 5);
    assert!(failures.iter().all(|f| f.error == failures[0].error));
    assert!(failures[0].error.contains("connection reset"));
}

#[test]
fn test_rate_limit_stops_fetch_stage() {
    let fetcher = FakeFetcher::default();
    *fetcher.batch_failure.borrow_mut() = Some(BatchFailure::RateLimited);
    let mut h = Harness::new(FakeDiscovery::with_ids(8), fetcher);
    h.discover_all();

    h.ingestor.run_fetch_pending(None, 0, Some(4)).unwrap();

    assert_eq!(h.fetcher.calls.borrow().len(), 1);
    assert_eq!(h.status_of(0), MessageStatus::Failed);
    assert_eq!(h.status_of(4), MessageStatus::Pending);
    assert!(h.ingestor.progress().failures[0].error.contains("Rate limited"));
}

#[test]
fn test_fetch_limit_counts_successes() {
    let mut h = Harness::with_ids(12);
    h.discover_all();

    let fetched = h.ingestor.run_fetch_pending(Some(7), 0, Some(5)).unwrap();

    assert_eq!(fetched, 7);
    assert_eq!(h.fetcher.batch_sizes(), vec![5, 2]);
    assert_eq!(h.tracker().count_by_status().unwrap().pending, 5);
}

#[test]
fn test_fixed_offset_drains_live_pool() {
    let mut h = Harness::with_ids(6);
    h.discover_all();

    let mut calls = 0;
    while h.ingestor.run_fetch_pending(Some(1), 2, None).unwrap() == 1 {
        calls += 1;
        assert!(calls <= 6, "offset drain did not terminate");
    }

    assert_eq!(calls, 4);
    assert_eq!(h.fetcher.fetched_order(), vec![id(2), id(3), id(4), id(5)]);

    let pending = h.tracker().get_pending_ids(10, 0).unwrap();
    assert_eq!(pending, vec![MessageId::new(id(0)), MessageId::new(id(1))]);
}

// === Convert ===

#[test]
fn test_convert_writes_markdown_with_label_names() {
    let mut h = Harness::with_ids(2);
    h.ingestor.sync_labels().unwrap();
    h.discover_all();
    h.ingestor.run_fetch_pending(None, 0, None).unwrap();

    let converted = h.ingestor.run_convert_pending(None, 0, None).unwrap();
    assert_eq!(converted, 2);

    let row = h.tracker().get_message(&MessageId::new(id(0))).unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Converted);
    let path = row.markdown_path.unwrap();
    assert!(path.ends_with("2024-01-15_subject-msg-00_msg-00.md"));

    let markdown = fs::read_to_string(&path).unwrap();
    assert!(markdown.starts_with("---\n"));
    assert!(markdown.contains("Work"));
    assert!(markdown.contains("Hello from msg-00"));
}

#[test]
fn test_converted_front_matter_keeps_cc_and_message_id() {
    let mut h = Harness::with_ids(1);
    h.ingestor.run(None, None, None, 0, None).unwrap();

    let row = h.tracker().get_message(&MessageId::new(id(0))).unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Converted);
    let markdown = fs::read_to_string(row.markdown_path.unwrap()).unwrap();
    let matter: serde_yaml::Value =
        serde_yaml::from_str(markdown.split("---\n").nth(1).unwrap()).unwrap();
    assert_eq!(matter["cc"].as_str(), Some("carol@example.com"));
    assert_eq!(matter["message_id"].as_str(), Some("<msg-00@mail.example.com>"));
}

#[test]
fn test_accented_subject_is_transliterated_in_file_name() {
    let fetcher = FakeFetcher {
        subject_overrides: HashMap::from([(id(0), "Café menu".to_string())]),
        ..FakeFetcher::default()
    };
    let mut h = Harness::new(FakeDiscovery::with_ids(1), fetcher);
    h.ingestor.run(None, None, None, 0, None).unwrap();

    let row = h.tracker().get_message(&MessageId::new(id(0))).unwrap().unwrap();
    assert!(row.markdown_path.unwrap().ends_with("2024-01-15_cafe-menu_msg-00.md"));
}

#[test]
fn test_convert_falls_back_to_plain_text() {
    let fetcher = FakeFetcher {
        html_overrides: HashMap::from([(id(0), "<div>   </div>".to_string())]),
        ..FakeFetcher::default()
    };
    let mut h = Harness::new(FakeDiscovery::with_ids(1), fetcher);
    h.discover_all();
    h.ingestor.run_fetch_pending(None, 0, None).unwrap();

    assert_eq!(h.ingestor.run_convert_pending(None, 0, None).unwrap(), 1);

    let row = h.tracker().get_message(&MessageId::new(id(0))).unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Converted);
    let markdown = fs::read_to_string(row.markdown_path.unwrap()).unwrap();
    assert!(markdown.contains("Body of msg-00"));
}

#[test]
fn test_convert_failure_marks_failed() {
    let mut h = Harness::with_ids(2);
    h.discover_all();
    h.ingestor.run_fetch_pending(None, 0, None).unwrap();

    // Raw files vanish between stages; nothing is left to convert
    let row = h.tracker().get_message(&MessageId::new(id(1))).unwrap().unwrap();
    fs::remove_file(row.raw_text_path.unwrap()).unwrap();
    fs::remove_file(row.raw_html_path.unwrap()).unwrap();

    let converted = h.ingestor.run_convert_pending(None, 0, None).unwrap();

    assert_eq!(converted, 1);
    assert_eq!(h.status_of(1), MessageStatus::Failed);
    let error = h.ingestor.progress().failures[0].error.clone();
    assert!(error.contains("No convertible content"));
}

#[test]
fn test_convert_never_selects_pending_rows() {
    let mut h = Harness::with_ids(3);
    h.discover_all();
    h.ingestor.run_fetch_pending(Some(1), 0, None).unwrap();

    let converted = h.ingestor.run_convert_pending(None, 0, None).unwrap();

    assert_eq!(converted, 1);
    let counts = h.tracker().count_by_status().unwrap();
    assert_eq!(counts.converted, 1);
    assert_eq!(counts.pending, 2);
    assert_eq!(h.status_of(0), MessageStatus::Converted);
}

// === Composite run ===

#[test]
fn test_run_completes_and_is_audited() {
    let mut h = Harness::with_ids(9);

    let progress = h.ingestor.run(None, None, None, 0, Some(4)).unwrap();

    assert_eq!(progress.current_stage, Stage::Complete);
    assert_eq!(progress.ids_discovered, 9);
    assert_eq!(progress.messages_fetched, 9);
    assert_eq!(progress.messages_converted, 9);
    assert_eq!(progress.messages_failed, 0);

    let runs = h.ingestor.list_runs(5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, Some(RunStatus::Completed));
    assert_eq!(runs[0].label_id, "INBOX");
    assert_eq!(runs[0].counts.messages_converted, 9);
    assert!(runs[0].completed_at.is_some());

    // Every converted row went through fetch and has both paths
    for n in 0..9 {
        let row = h.tracker().get_message(&MessageId::new(id(n))).unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Converted);
        assert!(row.has_raw_content());
        assert!(row.markdown_path.is_some());
    }
    assert_eq!(fs::read_dir(h.dir.path().join("markdown")).unwrap().count(), 9);
}

#[test]
fn test_run_limit_applies_to_discovery_only() {
    let mut h = Harness::with_ids(10);
    // Backlog from an earlier session
    h.ingestor.run_discovery(None, None, Some(2), 8).unwrap();

    let progress = h.ingestor.run(None, None, Some(3), 0, None).unwrap();

    assert_eq!(progress.ids_discovered, 3);
    assert_eq!(progress.messages_converted, 5);
}

#[test]
fn test_run_aborted_on_fatal_discovery_error() {
    let mut discovery = FakeDiscovery::with_ids(20);
    discovery.fail_on_page = Some(1);
    let mut h = Harness::new(discovery, FakeFetcher::default());

    assert!(h.ingestor.run(None, None, None, 0, None).is_err());

    assert!(matches!(h.ingestor.progress().current_stage, Stage::Error(_)));
    let runs = h.ingestor.list_runs(1).unwrap();
    assert_eq!(runs[0].status, Some(RunStatus::Aborted));
    assert_eq!(runs[0].counts.ids_discovered, PAGE_SIZE);
}

#[test]
fn test_progress_callback_sees_each_stage() {
    let mut h = Harness::with_ids(6);
    let seen: Rc<RefCell<Vec<Progress>>> = Rc::default();
    let sink = seen.clone();
    h.ingestor
        .set_progress_callback(move |p: &Progress| sink.borrow_mut().push(p.clone()));

    h.ingestor.run(None, None, None, 0, Some(3)).unwrap();

    let seen = seen.borrow();
    let stages: Vec<&Stage> = seen.iter().map(|p| &p.current_stage).collect();
    for stage in [Stage::Labels, Stage::Discovery, Stage::Fetch, Stage::Convert, Stage::Complete] {
        assert!(stages.contains(&&stage), "missing {stage}");
    }

    let last = seen.last().unwrap();
    assert_eq!(last.current_stage, Stage::Complete);
    assert_eq!(last.status_counts.converted, 6);
    assert_eq!(last.status_counts.pending, 0);
}

#[test]
fn test_retry_failed_then_refetch() {
    let fetcher = FakeFetcher::default();
    fetcher.unparseable.borrow_mut().insert(id(1));
    let mut h = Harness::new(FakeDiscovery::with_ids(3), fetcher);
    h.discover_all();
    h.ingestor.run_fetch_pending(None, 0, None).unwrap();
    assert_eq!(h.status_of(1), MessageStatus::Failed);

    assert_eq!(h.ingestor.retry_failed().unwrap(), 1);
    assert_eq!(h.ingestor.retry_failed().unwrap(), 0);
    assert_eq!(h.status_of(1), MessageStatus::Pending);

    h.fetcher.unparseable.borrow_mut().clear();
    assert_eq!(h.ingestor.run_fetch_pending(None, 0, None).unwrap(), 1);
    assert_eq!(h.status_of(1), MessageStatus::Fetched);
    assert_eq!(h.ingestor.get_status().unwrap().fetched, 3);
}

#[test]
fn test_list_labels_and_close() {
    let h = Harness::with_ids(0);
    let labels = h.ingestor.list_labels().unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[1].name, "Work");
    h.ingestor.close().unwrap();
}
