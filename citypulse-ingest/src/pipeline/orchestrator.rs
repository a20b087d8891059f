use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use citypulse_core::domain::{CrawlRun, RunStatus, Source, TrustTier};
use citypulse_core::storage::Storage;
use citypulse_core::CatalogError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::observability::metrics;
use crate::pipeline::processing::dedup::{DedupOutcome, Deduplicator};
use crate::pipeline::processing::normalize::{
    CandidateEvent, ExtractionNormalizer, ExtractionService, RawRecord,
};
use crate::pipeline::processing::series::SeriesDetector;
use crate::pipeline::processing::taxonomy::{TaxonomyConfig, TaxonomyInference};
use crate::pipeline::processing::venue_resolver::VenueResolver;
use crate::similarity::{DefaultScorer, VenueNameScorer};

/// Drives one crawl run: streams raw records through normalization, venue
/// resolution, dedup, series detection, and taxonomy inference, committing
/// each record's outcome independently.
///
/// One malformed record never aborts the run; only connectivity-class
/// storage failures do, and records committed before that point stand.
/// Re-running the same source with the same inputs is idempotent.
pub struct IngestOrchestrator {
    storage: Arc<dyn Storage>,
    extraction: Arc<dyn ExtractionService>,
    normalizer: ExtractionNormalizer,
    venue_resolver: VenueResolver,
    deduplicator: Deduplicator,
    series_detector: SeriesDetector,
    taxonomy: TaxonomyInference,
    config: PipelineConfig,
}

impl IngestOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        extraction: Arc<dyn ExtractionService>,
        config: PipelineConfig,
        taxonomy_config: TaxonomyConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            normalizer: ExtractionNormalizer::new(config.confidence_floor),
            venue_resolver: VenueResolver::new(
                storage.clone(),
                Arc::new(VenueNameScorer),
                config.clone(),
            ),
            deduplicator: Deduplicator::new(
                storage.clone(),
                Arc::new(DefaultScorer),
                config.clone(),
            ),
            series_detector: SeriesDetector::new(storage.clone(), config.clone()),
            taxonomy: TaxonomyInference::new(taxonomy_config)?,
            storage,
            extraction,
            config,
        })
    }

    /// Run one ingestion pass for one source.
    pub async fn run(&self, source_id: &str, records: Vec<RawRecord>) -> Result<CrawlRun> {
        let cancel = AtomicBool::new(false);
        self.run_with_cancellation(source_id, records, &cancel).await
    }

    /// Like [`run`], but stops processing further records once `cancel` is
    /// set. Already-committed records are left intact; there is no global
    /// rollback.
    pub async fn run_with_cancellation(
        &self,
        source_id: &str,
        records: Vec<RawRecord>,
        cancel: &AtomicBool,
    ) -> Result<CrawlRun> {
        let started = std::time::Instant::now();
        let crawl_day = Utc::now().date_naive();
        let source = self.load_source(source_id).await?;

        let mut run = CrawlRun::start(source_id);
        self.storage.create_crawl_run(&mut run).await?;
        metrics::orchestrator::run_started(source_id);
        info!(source_id, records = records.len(), "crawl run started");

        for (index, record) in records.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                warn!(source_id, processed = index, "crawl run cancelled");
                run.status = RunStatus::Cancelled;
                break;
            }

            run.counts.found += 1;
            match self.process_record(record, &source, crawl_day, &mut run).await {
                Ok(()) => {}
                Err(e) if is_fatal(&e) => {
                    error!(source_id, error = %e, "storage unreachable; aborting run");
                    self.sample_error(&mut run, format!("fatal: {}", e));
                    run.status = RunStatus::Failed;
                    break;
                }
                Err(e) => {
                    // Local recovery: drop the record, count it, continue.
                    debug!(source_id, record = index, error = %e, "record dropped");
                    self.sample_error(&mut run, e.to_string());
                    run.counts.rejected += 1;
                    metrics::orchestrator::record_rejected();
                }
            }
        }

        if run.status == RunStatus::Running {
            run.status = RunStatus::Completed;
        }
        run.finished_at = Some(Utc::now());

        if run.status == RunStatus::Completed {
            self.end_of_run_maintenance(crawl_day).await;
            self.storage
                .mark_source_crawled(source_id, Utc::now())
                .await?;
        }
        self.storage.finalize_crawl_run(&run).await?;

        let elapsed = started.elapsed().as_secs_f64();
        metrics::orchestrator::run_duration(elapsed);
        match run.status {
            RunStatus::Completed => metrics::orchestrator::run_completed(source_id),
            RunStatus::Failed => metrics::orchestrator::run_failed(source_id),
            RunStatus::Cancelled => metrics::orchestrator::run_cancelled(source_id),
            RunStatus::Running => {}
        }
        info!(
            source_id,
            status = ?run.status,
            found = run.counts.found,
            new = run.counts.new,
            updated = run.counts.updated,
            duplicate = run.counts.duplicate,
            rejected = run.counts.rejected,
            elapsed_secs = elapsed,
            "crawl run finished"
        );

        Ok(run)
    }

    /// One worker per source; records within a source stay sequential so
    /// series cadence state needs no synchronization.
    pub async fn run_sources(
        self: Arc<Self>,
        batches: Vec<(String, Vec<RawRecord>)>,
    ) -> Vec<Result<CrawlRun>> {
        let mut workers = tokio::task::JoinSet::new();
        for (source_id, records) in batches {
            let orchestrator = Arc::clone(&self);
            workers.spawn(async move { orchestrator.run(&source_id, records).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = workers.join_next().await {
            results.push(joined.map_err(anyhow::Error::from).and_then(|r| r));
        }
        results
    }

    async fn process_record(
        &self,
        record: &RawRecord,
        source: &Source,
        crawl_day: NaiveDate,
        run: &mut CrawlRun,
    ) -> Result<()> {
        let Some(candidate) = self.normalize_record(record, crawl_day, run).await? else {
            return Ok(());
        };
        metrics::normalize::record_accepted();
        metrics::normalize::confidence(candidate.extraction_confidence);
        for warning in &candidate.warnings {
            debug!(title = %candidate.title, warning = %warning, "normalization warning");
        }

        // Transient storage conflicts get a bounded retry; the stages
        // themselves recover insert races internally.
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.commit_candidate(&candidate, source).await {
                Ok(outcome) => break outcome,
                Err(e) if is_conflict(&e) && attempt < self.config.storage_retry_attempts => {
                    warn!(
                        title = %candidate.title,
                        attempt,
                        "storage conflict; retrying record"
                    );
                    continue;
                }
                Err(e) if is_conflict(&e) => {
                    metrics::orchestrator::storage_retries_exhausted();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        };

        match outcome {
            DedupOutcome::Created(_) => {
                run.counts.new += 1;
                metrics::dedup::created();
            }
            DedupOutcome::Merged { fields_updated, .. } => {
                run.counts.updated += 1;
                metrics::dedup::merged();
                debug!(title = %candidate.title, ?fields_updated, "event enriched by merge");
            }
            DedupOutcome::Duplicate(_) => {
                // Expected steady state, not an error.
                run.counts.duplicate += 1;
                metrics::dedup::duplicate();
            }
        }
        Ok(())
    }

    /// Obtain a structured guess (calling the extraction service under a
    /// bounded timeout if the adapter supplied none) and validate it into a
    /// candidate. Returns `None` when the record was rejected and counted.
    async fn normalize_record(
        &self,
        record: &RawRecord,
        crawl_day: NaiveDate,
        run: &mut CrawlRun,
    ) -> Result<Option<CandidateEvent>> {
        let guess = match &record.structured_guess {
            Some(guess) => guess.clone(),
            None => {
                let timeout = Duration::from_secs(self.config.extraction_timeout_secs);
                match tokio::time::timeout(timeout, self.extraction.extract(&record.raw_content))
                    .await
                {
                    Ok(Ok(guess)) => guess,
                    Ok(Err(e)) => {
                        self.reject(run, format!("extraction failed: {}", e), "extraction_error");
                        return Ok(None);
                    }
                    // A slow extraction is a per-record outcome, not a run
                    // failure.
                    Err(_) => {
                        metrics::orchestrator::extraction_timeout();
                        self.reject(run, "extraction timed out".to_string(), "extraction_timeout");
                        return Ok(None);
                    }
                }
            }
        };

        match self.normalizer.normalize(record, &guess, crawl_day) {
            Ok(candidate) => Ok(Some(candidate)),
            Err(rejection) => {
                self.reject(run, rejection.to_string(), rejection.kind());
                Ok(None)
            }
        }
    }

    /// Venue resolution, dedup upsert, series detection, and taxonomy for
    /// one validated candidate. This is the storage-touching span retried on
    /// transient conflicts.
    async fn commit_candidate(
        &self,
        candidate: &CandidateEvent,
        source: &Source,
    ) -> Result<DedupOutcome> {
        let resolution = self
            .venue_resolver
            .resolve(&candidate.venue, candidate.extraction_confidence)
            .await?;
        debug!(
            title = %candidate.title,
            venue_id = %resolution.venue_id,
            decision = ?resolution.decision,
            confidence = resolution.confidence,
            "venue resolved"
        );

        let outcome = self
            .deduplicator
            .upsert(candidate, resolution.venue_id, source)
            .await?;

        if let DedupOutcome::Created(event_id) = outcome {
            if let Some(event) = self.storage.get_event_by_id(event_id).await? {
                self.series_detector
                    .observe(&event, candidate.recurrence_hint.as_deref())
                    .await?;
            }
            self.apply_taxonomy(event_id, candidate).await?;
        }

        Ok(outcome)
    }

    /// Tag the event — or its series, once one exists, so there is a single
    /// edit point instead of a copy per occurrence.
    async fn apply_taxonomy(
        &self,
        event_id: uuid::Uuid,
        candidate: &CandidateEvent,
    ) -> Result<()> {
        let Some(mut event) = self.storage.get_event_by_id(event_id).await? else {
            return Ok(());
        };
        let venue_type = self
            .storage
            .get_venue_by_id(event.venue_id)
            .await?
            .map(|v| v.venue_type)
            .unwrap_or(citypulse_core::domain::VenueType::Unknown);

        let assignment = self.taxonomy.infer(
            &event.title,
            candidate.description.as_deref(),
            candidate.category_hint.as_deref(),
            &candidate.genre_hints,
            venue_type,
        );
        debug!(
            title = %event.title,
            category = %assignment.category,
            signal = ?assignment.signal,
            vocabulary = %assignment.vocabulary_version,
            "taxonomy inferred"
        );

        if let Some(series_id) = event.series_id {
            if let Some(mut series) = self.storage.get_series_by_id(series_id).await? {
                if series.state == citypulse_core::domain::SeriesState::Active {
                    if series.category.is_none() {
                        series.category = Some(assignment.category);
                        series.subcategory = assignment.subcategory;
                        series.genres = assignment.genres;
                        series.updated_at = Utc::now();
                        self.storage.update_series(&series).await?;
                    }
                    return Ok(());
                }
            }
        }

        event.category = Some(assignment.category);
        event.subcategory = assignment.subcategory;
        event.genres = assignment.genres;
        event.updated_at = Utc::now();
        self.storage.update_event(&event).await?;
        Ok(())
    }

    async fn load_source(&self, source_id: &str) -> Result<Source> {
        match self.storage.get_source(source_id).await? {
            Some(source) => Ok(source),
            None => {
                // Sources are registered by operators; an unknown one still
                // gets ingested, at the lowest trust.
                warn!(source_id, "unregistered source; treating as unvetted");
                Ok(Source {
                    id: None,
                    source_id: source_id.to_string(),
                    name: source_id.to_string(),
                    active: true,
                    trust_tier: TrustTier::Unvetted,
                    last_crawled_at: None,
                    created_at: Utc::now(),
                })
            }
        }
    }

    async fn end_of_run_maintenance(&self, crawl_day: NaiveDate) {
        let cutoff = crawl_day - ChronoDuration::days(self.config.archive_after_days);
        match self.storage.archive_events_before(cutoff).await {
            Ok(0) => {}
            Ok(archived) => info!(archived, %cutoff, "archived past events"),
            Err(e) => warn!(error = %e, "archival sweep failed"),
        }
        match self.series_detector.close_stale(crawl_day).await {
            Ok(0) => {}
            Ok(closed) => info!(closed, "closed stale series"),
            Err(e) => warn!(error = %e, "series staleness sweep failed"),
        }
    }

    fn reject(&self, run: &mut CrawlRun, reason: String, kind: &str) {
        debug!(%reason, "record rejected");
        metrics::normalize::record_rejected(kind);
        metrics::orchestrator::record_rejected();
        self.sample_error(run, reason);
        run.counts.rejected += 1;
    }

    fn sample_error(&self, run: &mut CrawlRun, reason: String) {
        if run.error_samples.len() < self.config.error_sample_limit {
            run.error_samples.push(reason);
        }
    }
}

fn is_fatal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<CatalogError>()
        .map_or(false, CatalogError::is_fatal)
}

fn is_conflict(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<CatalogError>(), Some(CatalogError::Conflict(_)))
}
