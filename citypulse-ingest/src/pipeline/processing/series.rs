use anyhow::Result;
use chrono::{Datelike, NaiveDate, Utc};
use citypulse_core::domain::{Cadence, Event, Series, SeriesState};
use citypulse_core::storage::Storage;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::pipeline::utils::normalize_name;

/// Detects recurring events at a venue and maintains their series grouping.
///
/// State machine per (venue, title): standalone → Candidate (2 occurrences)
/// → Active (3rd confirms the pattern) → Closed (no new occurrence for the
/// configured number of expected cycles). Closing never deletes a series or
/// its members; it only stops the series from being the default join target.
pub struct SeriesDetector {
    storage: Arc<dyn Storage>,
    config: PipelineConfig,
}

impl SeriesDetector {
    pub fn new(storage: Arc<dyn Storage>, config: PipelineConfig) -> Self {
        Self { storage, config }
    }

    /// Observe a newly created event. Returns the series id the event ended
    /// up in, if any.
    pub async fn observe(
        &self,
        event: &Event,
        recurrence_hint: Option<&str>,
    ) -> Result<Option<Uuid>> {
        if event.series_id.is_some() {
            return Ok(event.series_id);
        }
        let event_id = event.id.expect("stored event has id");
        let title_normalized = normalize_name(&event.title);

        if let Some(series) = self
            .storage
            .find_open_series(event.venue_id, &title_normalized)
            .await?
        {
            return self.join(series, event, event_id).await;
        }

        self.detect(event, event_id, &title_normalized, recurrence_hint)
            .await
    }

    async fn join(
        &self,
        mut series: Series,
        event: &Event,
        event_id: Uuid,
    ) -> Result<Option<Uuid>> {
        if series.member_event_ids.contains(&event_id) {
            return Ok(series.id);
        }

        // An occurrence off the established rhythm is a one-off with the
        // same name, not part of the series.
        if !self.fits_cadence(&series, event.event_day) {
            debug!(
                series = %series.title,
                day = %event.event_day,
                "occurrence does not fit cadence; left standalone"
            );
            return Ok(None);
        }

        let series_id = series.id.expect("stored series has id");
        series.member_event_ids.push(event_id);
        series.last_occurrence = series.last_occurrence.max(event.event_day);
        series.updated_at = Utc::now();

        let promoted = series.state == SeriesState::Candidate
            && series.member_event_ids.len() >= self.config.series_confirm_occurrences;
        if promoted {
            series.state = SeriesState::Active;
            info!(series = %series.title, "series confirmed by repeated cadence");
            crate::observability::metrics::series::promoted();
            self.adopt_member_tags(&mut series).await?;
        }

        self.storage.update_series(&series).await?;
        if promoted {
            // Confirmation moves every member's tags up to the series.
            for member_id in series.member_event_ids.clone() {
                self.bind_member(member_id, series_id, true).await?;
            }
        } else {
            self.bind_member(event_id, series_id, series.state == SeriesState::Active)
                .await?;
        }
        crate::observability::metrics::series::member_joined();

        Ok(Some(series_id))
    }

    /// No open series yet: look at the standalone history for this
    /// (venue, title) pair and materialize one once repetition shows.
    async fn detect(
        &self,
        event: &Event,
        event_id: Uuid,
        title_normalized: &str,
        recurrence_hint: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let mut occurrences: Vec<Event> = self
            .storage
            .list_events_for_venue(event.venue_id)
            .await?
            .into_iter()
            .filter(|e| e.series_id.is_none() && normalize_name(&e.title) == title_normalized)
            .collect();
        if !occurrences.iter().any(|e| e.id == Some(event_id)) {
            occurrences.push(event.clone());
        }
        occurrences.sort_by_key(|e| e.event_day);
        occurrences.dedup_by_key(|e| e.event_day);

        // A single occurrence is just an event.
        if occurrences.len() < 2 {
            return Ok(None);
        }

        let days: Vec<NaiveDate> = occurrences.iter().map(|e| e.event_day).collect();
        let Some(cadence) = compute_cadence(&days, self.config.cadence_tolerance_days) else {
            // An explicit hint from extraction substitutes for an observed
            // rhythm once two occurrences exist.
            if recurrence_hint.is_none() {
                return Ok(None);
            }
            let cadence = Cadence {
                weekday: event.event_day.weekday(),
                interval_days: 7,
            };
            return self
                .materialize(event, &occurrences, title_normalized, cadence, recurrence_hint)
                .await;
        };

        self.materialize(event, &occurrences, title_normalized, cadence, recurrence_hint)
            .await
    }

    async fn materialize(
        &self,
        event: &Event,
        occurrences: &[Event],
        title_normalized: &str,
        cadence: Cadence,
        recurrence_hint: Option<&str>,
    ) -> Result<Option<Uuid>> {
        let confirmed = occurrences.len() >= self.config.series_confirm_occurrences
            || recurrence_hint.is_some();
        let state = if confirmed {
            SeriesState::Active
        } else {
            SeriesState::Candidate
        };

        let now = Utc::now();
        let mut series = Series {
            id: None,
            title: event.title.clone(),
            title_normalized: title_normalized.to_string(),
            venue_id: event.venue_id,
            cadence,
            recurrence: recurrence_hint
                .map(str::to_string)
                .unwrap_or_else(|| cadence.describe()),
            member_event_ids: occurrences.iter().filter_map(|e| e.id).collect(),
            category: None,
            subcategory: None,
            genres: Vec::new(),
            state,
            last_occurrence: occurrences.last().expect("non-empty occurrences").event_day,
            created_at: now,
            updated_at: now,
        };

        self.storage.insert_series(&mut series).await?;
        let series_id = series.id.expect("inserted series has id");

        if state == SeriesState::Active {
            info!(
                series = %series.title,
                recurrence = %series.recurrence,
                members = series.member_event_ids.len(),
                "series materialized"
            );
            crate::observability::metrics::series::promoted();
            self.adopt_member_tags(&mut series).await?;
            self.storage.update_series(&series).await?;
        } else {
            debug!(series = %series.title, "series candidate (awaiting confirmation)");
        }

        for member_id in series.member_event_ids.clone() {
            self.bind_member(member_id, series_id, state == SeriesState::Active)
                .await?;
        }

        Ok(Some(series_id))
    }

    /// Genre/category tags move from members to the series on confirmation,
    /// leaving one edit point instead of a copy per occurrence.
    async fn adopt_member_tags(&self, series: &mut Series) -> Result<()> {
        for member_id in &series.member_event_ids {
            let Some(member) = self.storage.get_event_by_id(*member_id).await? else {
                continue;
            };
            if series.category.is_none() {
                series.category = member.category.clone();
                series.subcategory = member.subcategory.clone();
            }
            if series.genres.is_empty() && !member.genres.is_empty() {
                series.genres = member.genres.clone();
            }
        }
        Ok(())
    }

    async fn bind_member(&self, event_id: Uuid, series_id: Uuid, clear_tags: bool) -> Result<()> {
        let Some(mut member) = self.storage.get_event_by_id(event_id).await? else {
            return Ok(());
        };
        let mut changed = false;
        if member.series_id != Some(series_id) {
            member.series_id = Some(series_id);
            changed = true;
        }
        if clear_tags && (!member.genres.is_empty() || member.category.is_some()) {
            member.genres.clear();
            member.category = None;
            member.subcategory = None;
            changed = true;
        }
        if changed {
            member.updated_at = Utc::now();
            self.storage.update_event(&member).await?;
        }
        Ok(())
    }

    fn fits_cadence(&self, series: &Series, day: NaiveDate) -> bool {
        let interval = series.cadence.interval_days;
        if interval <= 0 {
            return false;
        }
        let gap = (day - series.last_occurrence).num_days();
        if gap <= 0 {
            // Same-day or back-dated corrections still belong to the series.
            return gap.abs() % interval <= self.config.cadence_tolerance_days;
        }
        let remainder = gap % interval;
        remainder <= self.config.cadence_tolerance_days
            || interval - remainder <= self.config.cadence_tolerance_days
    }

    /// Close open series that missed too many expected cycles. Run at the
    /// end of each crawl.
    pub async fn close_stale(&self, as_of: NaiveDate) -> Result<u64> {
        let mut closed = 0u64;
        for mut series in self.storage.list_open_series().await? {
            let silence = (as_of - series.last_occurrence).num_days();
            if silence > series.cadence.interval_days * self.config.series_close_after_cycles {
                series.state = SeriesState::Closed;
                series.updated_at = Utc::now();
                self.storage.update_series(&series).await?;
                info!(series = %series.title, silence_days = silence, "series closed");
                crate::observability::metrics::series::closed();
                closed += 1;
            }
        }
        Ok(closed)
    }
}

/// A regular cadence needs a shared weekday and a consistent gap between
/// consecutive occurrences.
fn compute_cadence(days: &[NaiveDate], tolerance_days: i64) -> Option<Cadence> {
    if days.len() < 2 {
        return None;
    }

    let weekday = days[0].weekday();
    if !days.iter().all(|d| d.weekday() == weekday) {
        return None;
    }

    let first_gap = (days[1] - days[0]).num_days();
    if first_gap == 0 {
        return None;
    }
    for pair in days.windows(2) {
        let gap = (pair[1] - pair[0]).num_days();
        if (gap - first_gap).abs() > tolerance_days {
            return None;
        }
    }

    Some(Cadence { weekday, interval_days: first_gap })
}
