use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunable policy parameters for one pipeline instance.
///
/// The fuzzy thresholds and the duplicate date window carry real trade-offs
/// (too loose merges distinct events, too tight leaves visible duplicates),
/// so they are configuration to be tuned empirically, not constants baked
/// into the algorithms. All threshold comparisons are inclusive (`>=`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Extraction confidence below this floor rejects the record outright.
    pub confidence_floor: f64,
    /// Minimum similarity for a fuzzy venue-name match.
    pub venue_similarity_threshold: f64,
    /// Two venue matches scoring within this margin of each other are
    /// ambiguous; the tie-break is logged for review.
    pub venue_ambiguity_margin: f64,
    /// Maximum distance between coordinates for a fuzzy venue match when
    /// both sides are geocoded.
    pub max_venue_distance_km: f64,
    /// Minimum title similarity for cross-source near-duplicate detection.
    pub title_similarity_threshold: f64,
    /// Half-width of the dedup comparison window in days. 0 compares within
    /// the same calendar day only.
    pub duplicate_date_window_days: i64,
    /// Bounded wait for the external text-extraction service, per record.
    pub extraction_timeout_secs: u64,
    /// Retry budget for transient storage conflicts before the record is
    /// surfaced as an error sample.
    pub storage_retry_attempts: u32,
    /// Occurrences needed to confirm a series (the 3rd confirms by default).
    pub series_confirm_occurrences: usize,
    /// An open series with no new occurrence for this many expected cycles
    /// is closed.
    pub series_close_after_cycles: i64,
    /// Allowed jitter, in days, when checking cadence regularity.
    pub cadence_tolerance_days: i64,
    /// Events whose day is this far in the past get archived at run end.
    pub archive_after_days: i64,
    /// Cap on sampled per-record error reasons in a crawl-run summary.
    pub error_sample_limit: usize,
    /// Region assumed when a source supplies no city.
    pub default_city: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            venue_similarity_threshold: 0.88,
            venue_ambiguity_margin: 0.03,
            max_venue_distance_km: 1.0,
            title_similarity_threshold: 0.85,
            duplicate_date_window_days: 0,
            extraction_timeout_secs: 20,
            storage_retry_attempts: 3,
            series_confirm_occurrences: 3,
            series_close_after_cycles: 3,
            cadence_tolerance_days: 1,
            archive_after_days: 90,
            error_sample_limit: 10,
            default_city: "portland".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("confidence_floor", self.confidence_floor),
            ("venue_similarity_threshold", self.venue_similarity_threshold),
            ("title_similarity_threshold", self.title_similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within [0.0, 1.0], got {}", name, value);
            }
        }
        if self.series_confirm_occurrences < 2 {
            anyhow::bail!(
                "series_confirm_occurrences must be at least 2, got {}",
                self.series_confirm_occurrences
            );
        }
        if self.storage_retry_attempts == 0 {
            anyhow::bail!("storage_retry_attempts must be at least 1");
        }
        Ok(())
    }
}
