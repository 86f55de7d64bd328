//! Three-stage ingestion orchestrator
//!
//! Discovery inserts identifiers as `pending`, fetch moves them to `fetched`
//! with raw bodies on disk, convert renders them to markdown and marks them
//! `converted`. The tracking store is the only coordination point: every
//! stage reads its work queue from it and commits each transition before
//! moving on, so any stage can be stopped and resumed later.

use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::sources::{ConvertSource, DiscoverySource, FetchSource};
use crate::config::IngestorSettings;
use crate::convert::MarkdownConverter;
use crate::error::{TrackerError, is_rate_limited};
use crate::gmail::GmailClient;
use crate::models::{
    EmailHeader, FetchRun, Label, LabelId, MessageId, MessageStatus, Progress, RunCounts, RunStatus,
    Stage, StatusCounts, StatusUpdate, TrackedMessage, epoch,
};
use crate::storage::{FetchTracker, MarkdownSink, MarkdownWriter, RawEmailStore, RawSink};

/// Reason recorded for identifiers the fetch source silently dropped
pub const NOT_RETURNED: &str = "Not returned in batch response";

/// Observer invoked after each page or batch
pub type ProgressCallback = Box<dyn FnMut(&Progress)>;

/// Everything outside the tracking store the pipeline talks to
pub struct Collaborators {
    pub discovery: Rc<dyn DiscoverySource>,
    pub fetcher: Rc<dyn FetchSource>,
    pub converter: Box<dyn ConvertSource>,
    pub raw_store: Box<dyn RawSink>,
    pub writer: Box<dyn MarkdownSink>,
}

impl Collaborators {
    /// Gmail for discovery and fetch, local files for output
    pub fn gmail(client: GmailClient, settings: &IngestorSettings) -> Result<Self> {
        let client = Rc::new(client);
        Ok(Self {
            discovery: client.clone(),
            fetcher: client,
            converter: Box::new(MarkdownConverter::new()),
            raw_store: Box::new(RawEmailStore::new(&settings.output_raw_dir)?),
            writer: Box::new(MarkdownWriter::new(&settings.output_markdown_dir)?),
        })
    }
}

/// Defaults applied when a stage is called without explicit values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub label: String,
    pub page_size: usize,
    pub batch_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            label: LabelId::INBOX.to_string(),
            page_size: 100,
            batch_size: 50,
        }
    }
}

impl From<&IngestorSettings> for PipelineOptions {
    fn from(settings: &IngestorSettings) -> Self {
        Self {
            label: settings.label.clone(),
            page_size: settings.max_results_per_page,
            batch_size: settings.batch_size,
        }
    }
}

/// Aggregate result of one discovery call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    /// Identifiers taken after offset/limit were applied
    pub collected: usize,
    /// Of those, how many were not already tracked
    pub inserted: usize,
}

pub struct Ingestor {
    tracker: FetchTracker,
    discovery: Rc<dyn DiscoverySource>,
    fetcher: Rc<dyn FetchSource>,
    converter: Box<dyn ConvertSource>,
    raw_store: Box<dyn RawSink>,
    writer: Box<dyn MarkdownSink>,
    options: PipelineOptions,
    progress: Progress,
    on_progress: Option<ProgressCallback>,
}

impl Ingestor {
    pub fn new(tracker: FetchTracker, collaborators: Collaborators, options: PipelineOptions) -> Self {
        Self {
            tracker,
            discovery: collaborators.discovery,
            fetcher: collaborators.fetcher,
            converter: collaborators.converter,
            raw_store: collaborators.raw_store,
            writer: collaborators.writer,
            options,
            progress: Progress::default(),
            on_progress: None,
        }
    }

    /// Wire up the Gmail-backed pipeline described by `settings`
    pub fn from_settings(settings: &IngestorSettings) -> Result<Self> {
        settings.validate()?;
        settings.ensure_directories()?;
        let tracker = FetchTracker::open(&settings.database_path)?;
        let client = GmailClient::from_settings(settings)?;
        let collaborators = Collaborators::gmail(client, settings)?;
        Ok(Self::new(tracker, collaborators, PipelineOptions::from(settings)))
    }

    pub fn set_progress_callback(&mut self, callback: impl FnMut(&Progress) + 'static) {
        self.on_progress = Some(Box::new(callback));
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn tracker(&self) -> &FetchTracker {
        &self.tracker
    }

    pub fn close(self) -> Result<()> {
        self.tracker.close()
    }

    // === Composite run ===

    /// Label sync, discovery, fetch and convert in sequence.
    ///
    /// `limit`/`offset` apply to discovery only; fetch and convert drain
    /// whatever backlog exists. The run is audited: completed on success,
    /// aborted when a stage fails fatally.
    pub fn run(
        &mut self,
        label: Option<&str>,
        query: Option<&str>,
        limit: Option<usize>,
        offset: usize,
        batch_size: Option<usize>,
    ) -> Result<Progress> {
        let label = label.unwrap_or(&self.options.label).to_string();
        let run_id = self.tracker.start_run(&label)?;
        self.progress = Progress::new(Stage::Labels);
        log::info!("[PIPELINE] Run {} started for label {}", run_id.0, label);

        let outcome = self.run_stages(&label, query, limit, offset, batch_size);
        let counts = RunCounts {
            ids_discovered: self.progress.ids_discovered,
            messages_fetched: self.progress.messages_fetched,
            messages_converted: self.progress.messages_converted,
            messages_failed: self.progress.messages_failed,
        };

        match outcome {
            Ok(()) => {
                self.tracker.complete_run(run_id, counts, RunStatus::Completed)?;
                self.progress.current_stage = Stage::Complete;
                self.notify()?;
                log::info!("[PIPELINE] Run {} complete: {}", run_id.0, self.progress.summary());
                Ok(self.progress.clone())
            }
            Err(e) => {
                self.progress.current_stage = Stage::Error(format!("{e:#}"));
                if let Err(audit) = self.tracker.complete_run(run_id, counts, RunStatus::Aborted) {
                    log::error!("[PIPELINE] Could not record aborted run {}: {audit:#}", run_id.0);
                }
                // The store may be the thing that failed; skip the counts refresh
                self.emit();
                log::error!("[PIPELINE] Run {} aborted: {e:#}", run_id.0);
                Err(e)
            }
        }
    }

    fn run_stages(
        &mut self,
        label: &str,
        query: Option<&str>,
        limit: Option<usize>,
        offset: usize,
        batch_size: Option<usize>,
    ) -> Result<()> {
        self.sync_labels()?;
        self.run_discovery(Some(label), query, limit, offset)?;
        self.run_fetch_pending(None, 0, batch_size)?;
        self.run_convert_pending(None, 0, batch_size)?;
        Ok(())
    }

    /// Refresh the label lookup table used for front matter names.
    ///
    /// A failing label listing is logged and skipped; labels then render
    /// with their IDs.
    pub fn sync_labels(&mut self) -> Result<usize> {
        self.enter_stage(Stage::Labels)?;
        match self.discovery.list_labels() {
            Ok(labels) => {
                let stored = self.tracker.upsert_labels(&labels)?;
                log::info!("[PIPELINE] Synced {} labels", stored);
                Ok(stored)
            }
            Err(e) => {
                log::warn!("[PIPELINE] Label sync failed, continuing without names: {e:#}");
                Ok(0)
            }
        }
    }

    // === Stage 1: discovery ===

    /// Page through the source, skipping the first `offset` identifiers and
    /// taking at most `limit`, inserting unseen ones as `pending`.
    ///
    /// A failing page (rate limit included) ends the call with an error;
    /// pages already inserted stay inserted.
    pub fn run_discovery(
        &mut self,
        label: Option<&str>,
        query: Option<&str>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<DiscoveryStats> {
        let label = label.unwrap_or(&self.options.label).to_string();
        self.enter_stage(Stage::Discovery)?;

        let mut stats = DiscoveryStats::default();
        if limit == Some(0) {
            return Ok(stats);
        }
        let reached = |collected: usize| limit.is_some_and(|l| collected >= l);

        let discovery = Rc::clone(&self.discovery);
        let mut seen = 0usize;

        for page in discovery.discover_message_ids(&label, query, self.options.page_size) {
            let page = page.with_context(|| format!("Discovery failed for label {}", label))?;
            if page.is_empty() {
                log::debug!("[DISCOVERY] Empty page, stopping");
                break;
            }

            let mut taken = Vec::with_capacity(page.len());
            for stub in page {
                seen += 1;
                if seen <= offset {
                    continue;
                }
                taken.push(stub);
                if reached(stats.collected + taken.len()) {
                    break;
                }
            }

            if !taken.is_empty() {
                let inserted = self.tracker.bulk_insert_pending(&taken, &label)?;
                stats.collected += taken.len();
                stats.inserted += inserted;
                self.progress.ids_discovered += taken.len();
                self.progress.ids_new += inserted;
                self.progress.last_batch_failed.clear();
                log::info!("[DISCOVERY] Page: {} IDs ({} new)", taken.len(), inserted);
                self.notify()?;
            }

            if reached(stats.collected) {
                break;
            }
        }

        log::info!(
            "[DISCOVERY] Done: {} collected, {} new (skipped {})",
            stats.collected,
            stats.inserted,
            seen.min(offset)
        );
        Ok(stats)
    }

    // === Stage 2: fetch ===

    /// Fetch pending messages in batches until `limit` have been fetched or
    /// no pending rows remain past `offset`.
    ///
    /// `offset` is applied to the live pending pool on every read. Processed
    /// rows leave the pool, so the same `offset` keeps skipping the same
    /// leading rows. Returns the number fetched successfully.
    pub fn run_fetch_pending(
        &mut self,
        limit: Option<usize>,
        offset: usize,
        batch_size: Option<usize>,
    ) -> Result<usize> {
        let batch_size = batch_size.unwrap_or(self.options.batch_size).max(1);
        self.enter_stage(Stage::Fetch)?;

        let mut total = 0;
        while let Some(take) = next_take(limit, total, batch_size) {
            let ids = self.tracker.get_pending_ids(take, offset)?;
            if ids.is_empty() {
                break;
            }

            self.progress.last_batch_failed.clear();
            let outcome = self.fetch_batch(&ids)?;
            total += outcome.fetched;
            log::info!(
                "[FETCH] Batch of {}: {} fetched, {} failed",
                ids.len(),
                outcome.fetched,
                self.progress.last_batch_failed.len()
            );
            self.notify()?;

            if outcome.abandoned {
                break;
            }
        }

        Ok(total)
    }

    fn fetch_batch(&mut self, ids: &[MessageId]) -> Result<BatchOutcome> {
        let fetcher = Rc::clone(&self.fetcher);
        let results = match fetcher.fetch_messages_batch(ids) {
            Ok(results) => results,
            Err(e) => {
                let reason = format!("{e:#}");
                if is_rate_limited(&e) {
                    log::error!("[FETCH] Rate limited, stopping fetch stage: {}", reason);
                } else {
                    log::error!("[FETCH] Batch request failed, stopping fetch stage: {}", reason);
                }
                for id in ids {
                    self.mark_failed(id, &reason)?;
                }
                return Ok(BatchOutcome {
                    fetched: 0,
                    abandoned: true,
                });
            }
        };

        let requested: HashSet<&MessageId> = ids.iter().collect();
        let mut answered: HashSet<MessageId> = HashSet::with_capacity(ids.len());
        let mut fetched = 0;

        for (id, result) in results {
            if !requested.contains(&id) {
                log::warn!("[FETCH] Ignoring unrequested message {}", id);
                continue;
            }
            if !answered.insert(id.clone()) {
                log::warn!("[FETCH] Ignoring duplicate result for {}", id);
                continue;
            }

            let stored = result.and_then(|parsed| {
                let paths = self.raw_store.store_raw(&id, &parsed.body)?;
                Ok((parsed, paths))
            });

            match stored {
                Ok((parsed, paths)) => {
                    self.tracker.insert_message_labels(&id, &parsed.label_ids)?;
                    let update = StatusUpdate::none()
                        .with_header(&parsed.header)
                        .with_raw_paths(paths.text_string(), paths.html_string());
                    self.tracker.update_status(&id, MessageStatus::Fetched, update)?;
                    self.progress.messages_fetched += 1;
                    fetched += 1;
                    log::debug!("[FETCH] {} fetched", id);
                }
                Err(e) => self.mark_failed(&id, &format!("{e:#}"))?,
            }
        }

        for id in ids.iter().filter(|id| !answered.contains(*id)) {
            self.mark_failed(id, NOT_RETURNED)?;
        }

        Ok(BatchOutcome {
            fetched,
            abandoned: false,
        })
    }

    // === Stage 3: convert ===

    /// Convert fetched messages to markdown; same batching and offset rules
    /// as [`run_fetch_pending`](Self::run_fetch_pending). Returns the number
    /// converted successfully.
    pub fn run_convert_pending(
        &mut self,
        limit: Option<usize>,
        offset: usize,
        batch_size: Option<usize>,
    ) -> Result<usize> {
        let batch_size = batch_size.unwrap_or(self.options.batch_size).max(1);
        self.enter_stage(Stage::Convert)?;

        let mut total = 0;
        while let Some(take) = next_take(limit, total, batch_size) {
            let ids = self.tracker.get_fetched_ids(take, offset)?;
            if ids.is_empty() {
                break;
            }

            self.progress.last_batch_failed.clear();
            let mut converted = 0;
            for id in &ids {
                if self.convert_one(id)? {
                    converted += 1;
                }
            }
            total += converted;
            log::info!(
                "[CONVERT] Batch of {}: {} converted, {} failed",
                ids.len(),
                converted,
                self.progress.last_batch_failed.len()
            );
            self.notify()?;
        }

        Ok(total)
    }

    /// Returns false if the message was marked failed
    fn convert_one(&mut self, id: &MessageId) -> Result<bool> {
        let row = self
            .tracker
            .get_message(id)?
            .ok_or_else(|| TrackerError::UntrackedMessage(id.clone()))?;
        let labels = self.tracker.get_message_labels(id)?;
        let header = header_from_row(&row);

        let written = self
            .raw_store
            .load_raw(row.raw_text_path.as_deref(), row.raw_html_path.as_deref())
            .and_then(|body| self.converter.convert(id, &header, &body, &labels))
            .and_then(|email| self.writer.write_markdown(&email));

        match written {
            Ok(path) => {
                let update = StatusUpdate::markdown(path_string(path));
                self.tracker.update_status(id, MessageStatus::Converted, update)?;
                self.progress.messages_converted += 1;
                log::debug!("[CONVERT] {} converted", id);
                Ok(true)
            }
            Err(e) => {
                self.mark_failed(id, &format!("{e:#}"))?;
                Ok(false)
            }
        }
    }

    // === Queries and maintenance ===

    pub fn list_labels(&self) -> Result<Vec<Label>> {
        self.discovery.list_labels()
    }

    pub fn get_status(&self) -> Result<StatusCounts> {
        self.tracker.count_by_status()
    }

    /// Reset every failed message to pending
    pub fn retry_failed(&self) -> Result<usize> {
        let reset = self.tracker.retry_failed()?;
        log::info!("[PIPELINE] Reset {} failed messages to pending", reset);
        Ok(reset)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<FetchRun>> {
        self.tracker.list_runs(limit)
    }

    // === Internals ===

    fn mark_failed(&mut self, id: &MessageId, reason: &str) -> Result<()> {
        self.tracker
            .update_status(id, MessageStatus::Failed, StatusUpdate::error(reason))?;
        self.progress.record_failure(id, reason);
        log::warn!("[PIPELINE] {} failed: {}", id, reason);
        Ok(())
    }

    fn enter_stage(&mut self, stage: Stage) -> Result<()> {
        self.progress.current_stage = stage;
        self.progress.last_batch_failed.clear();
        self.notify()
    }

    /// Refresh store totals and hand the snapshot to the observer.
    ///
    /// Called only after the unit of work has been committed.
    fn notify(&mut self) -> Result<()> {
        if self.on_progress.is_some() {
            self.progress.status_counts = self.tracker.count_by_status()?;
        }
        self.emit();
        Ok(())
    }

    fn emit(&mut self) {
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&self.progress);
        }
    }
}

struct BatchOutcome {
    fetched: usize,
    /// The whole batch failed and the stage should stop
    abandoned: bool,
}

/// How many rows to read next, or `None` once `limit` is satisfied
fn next_take(limit: Option<usize>, done: usize, batch_size: usize) -> Option<usize> {
    match limit {
        None => Some(batch_size),
        Some(limit) => {
            let remaining = limit.saturating_sub(done);
            (remaining > 0).then(|| remaining.min(batch_size))
        }
    }
}

/// Rebuild the header fields stored at fetch time
fn header_from_row(row: &TrackedMessage) -> EmailHeader {
    let date = DateTime::parse_from_rfc3339(&row.date)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| epoch());
    let subject = if row.subject.is_empty() {
        "(no subject)"
    } else {
        row.subject.as_str()
    };
    EmailHeader {
        cc: row.cc.clone(),
        message_id_header: row.message_id_header.clone(),
        ..EmailHeader::new(subject, row.sender.as_str(), row.recipients.as_str(), date)
    }
}

fn path_string(path: PathBuf) -> String {
    path.display().to_string()
}
