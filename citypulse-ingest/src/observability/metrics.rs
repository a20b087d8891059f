//! Metrics for the ingestion pipeline, following Prometheus naming
//! conventions. Metric names live in one enum so call sites cannot drift
//! from the exported catalog.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| {
                tracing::warn!("metrics recorder not installed: {}", e);
                e
            })
    });
}

/// Render the current metrics in Prometheus exposition format, if the
/// recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// All metric names used in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Extraction normalizer
    NormalizeRecordsAccepted,
    NormalizeRecordsRejected,
    NormalizeConfidence,

    // Venue resolver
    VenueResolvedExact,
    VenueResolvedFuzzy,
    VenueCreated,
    VenueVirtualFallback,
    VenueAmbiguityFlagged,

    // Deduplicator
    DedupEventsCreated,
    DedupEventsMerged,
    DedupDuplicates,
    DedupInsertConflictsRecovered,

    // Series detector
    SeriesPromoted,
    SeriesMembersJoined,
    SeriesClosed,

    // Taxonomy inference
    TaxonomyAssigned,
    TaxonomyLowConfidence,

    // Orchestrator
    RunsStarted,
    RunsCompleted,
    RunsFailed,
    RunsCancelled,
    RunRecordsRejected,
    RunDurationSeconds,
    RunExtractionTimeouts,
    RunStorageRetriesExhausted,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::NormalizeRecordsAccepted => "cp_normalize_records_accepted_total",
            MetricName::NormalizeRecordsRejected => "cp_normalize_records_rejected_total",
            MetricName::NormalizeConfidence => "cp_normalize_confidence",

            MetricName::VenueResolvedExact => "cp_venue_resolved_exact_total",
            MetricName::VenueResolvedFuzzy => "cp_venue_resolved_fuzzy_total",
            MetricName::VenueCreated => "cp_venue_created_total",
            MetricName::VenueVirtualFallback => "cp_venue_virtual_fallback_total",
            MetricName::VenueAmbiguityFlagged => "cp_venue_ambiguity_flagged_total",

            MetricName::DedupEventsCreated => "cp_dedup_events_created_total",
            MetricName::DedupEventsMerged => "cp_dedup_events_merged_total",
            MetricName::DedupDuplicates => "cp_dedup_duplicates_total",
            MetricName::DedupInsertConflictsRecovered => {
                "cp_dedup_insert_conflicts_recovered_total"
            }

            MetricName::SeriesPromoted => "cp_series_promoted_total",
            MetricName::SeriesMembersJoined => "cp_series_members_joined_total",
            MetricName::SeriesClosed => "cp_series_closed_total",

            MetricName::TaxonomyAssigned => "cp_taxonomy_assigned_total",
            MetricName::TaxonomyLowConfidence => "cp_taxonomy_low_confidence_total",

            MetricName::RunsStarted => "cp_runs_started_total",
            MetricName::RunsCompleted => "cp_runs_completed_total",
            MetricName::RunsFailed => "cp_runs_failed_total",
            MetricName::RunsCancelled => "cp_runs_cancelled_total",
            MetricName::RunRecordsRejected => "cp_run_records_rejected_total",
            MetricName::RunDurationSeconds => "cp_run_duration_seconds",
            MetricName::RunExtractionTimeouts => "cp_run_extraction_timeouts_total",
            MetricName::RunStorageRetriesExhausted => "cp_run_storage_retries_exhausted_total",
        }
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod normalize {
    use super::MetricName;

    pub fn record_accepted() {
        ::metrics::counter!(MetricName::NormalizeRecordsAccepted.as_str()).increment(1);
    }

    pub fn record_rejected(reason: &str) {
        ::metrics::counter!(
            MetricName::NormalizeRecordsRejected.as_str(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn confidence(score: f64) {
        ::metrics::histogram!(MetricName::NormalizeConfidence.as_str()).record(score);
    }
}

pub mod venue {
    use super::MetricName;

    pub fn resolved_exact() {
        ::metrics::counter!(MetricName::VenueResolvedExact.as_str()).increment(1);
    }

    pub fn resolved_fuzzy() {
        ::metrics::counter!(MetricName::VenueResolvedFuzzy.as_str()).increment(1);
    }

    pub fn created() {
        ::metrics::counter!(MetricName::VenueCreated.as_str()).increment(1);
    }

    pub fn virtual_fallback() {
        ::metrics::counter!(MetricName::VenueVirtualFallback.as_str()).increment(1);
    }

    pub fn ambiguity_flagged() {
        ::metrics::counter!(MetricName::VenueAmbiguityFlagged.as_str()).increment(1);
    }
}

pub mod dedup {
    use super::MetricName;

    pub fn created() {
        ::metrics::counter!(MetricName::DedupEventsCreated.as_str()).increment(1);
    }

    pub fn merged() {
        ::metrics::counter!(MetricName::DedupEventsMerged.as_str()).increment(1);
    }

    pub fn duplicate() {
        ::metrics::counter!(MetricName::DedupDuplicates.as_str()).increment(1);
    }

    pub fn insert_conflict_recovered() {
        ::metrics::counter!(MetricName::DedupInsertConflictsRecovered.as_str()).increment(1);
    }
}

pub mod series {
    use super::MetricName;

    pub fn promoted() {
        ::metrics::counter!(MetricName::SeriesPromoted.as_str()).increment(1);
    }

    pub fn member_joined() {
        ::metrics::counter!(MetricName::SeriesMembersJoined.as_str()).increment(1);
    }

    pub fn closed() {
        ::metrics::counter!(MetricName::SeriesClosed.as_str()).increment(1);
    }
}

pub mod taxonomy {
    use super::MetricName;

    pub fn assigned(category: &str) {
        ::metrics::counter!(
            MetricName::TaxonomyAssigned.as_str(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    pub fn low_confidence() {
        ::metrics::counter!(MetricName::TaxonomyLowConfidence.as_str()).increment(1);
    }
}

pub mod orchestrator {
    use super::MetricName;

    pub fn run_started(source_id: &str) {
        ::metrics::counter!(
            MetricName::RunsStarted.as_str(),
            "source_id" => source_id.to_string()
        )
        .increment(1);
    }

    pub fn run_completed(source_id: &str) {
        ::metrics::counter!(
            MetricName::RunsCompleted.as_str(),
            "source_id" => source_id.to_string()
        )
        .increment(1);
    }

    pub fn run_failed(source_id: &str) {
        ::metrics::counter!(
            MetricName::RunsFailed.as_str(),
            "source_id" => source_id.to_string()
        )
        .increment(1);
    }

    pub fn run_cancelled(source_id: &str) {
        ::metrics::counter!(
            MetricName::RunsCancelled.as_str(),
            "source_id" => source_id.to_string()
        )
        .increment(1);
    }

    pub fn record_rejected() {
        ::metrics::counter!(MetricName::RunRecordsRejected.as_str()).increment(1);
    }

    pub fn extraction_timeout() {
        ::metrics::counter!(MetricName::RunExtractionTimeouts.as_str()).increment(1);
    }

    pub fn storage_retries_exhausted() {
        ::metrics::counter!(MetricName::RunStorageRetriesExhausted.as_str()).increment(1);
    }

    pub fn run_duration(secs: f64) {
        ::metrics::histogram!(MetricName::RunDurationSeconds.as_str()).record(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_follow_prometheus_conventions() {
        let counters = [
            MetricName::NormalizeRecordsAccepted,
            MetricName::VenueCreated,
            MetricName::DedupEventsMerged,
            MetricName::SeriesPromoted,
            MetricName::RunsCompleted,
        ];
        for name in counters {
            assert!(name.as_str().starts_with("cp_"));
            assert!(name.as_str().ends_with("_total"));
        }
        assert!(!MetricName::RunDurationSeconds.as_str().ends_with("_total"));
    }
}
