use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use citypulse_core::domain::{Event, Source, TrustTier};
use citypulse_core::storage::Storage;
use citypulse_core::CatalogError;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::pipeline::processing::normalize::CandidateEvent;
use crate::similarity::SimilarityScorer;

/// Stable exact-duplicate key: normalized title + venue + calendar day.
/// Date-level rather than time-level so minor time corrections across
/// sources hash identically, and stable across repeated crawls of the same
/// source.
pub fn content_hash(title_normalized: &str, venue_id: Uuid, event_day: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title_normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(venue_id.as_bytes());
    hasher.update(b"|");
    hasher.update(event_day.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of upserting one candidate against the canonical event table.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    Created(Uuid),
    Merged { event_id: Uuid, fields_updated: Vec<String> },
    /// Already known with nothing new to contribute. Expected steady state,
    /// counted apart from true errors.
    Duplicate(Uuid),
}

/// Decides whether a venue-resolved candidate is a new event, an update to
/// an existing one, or a duplicate sighting.
pub struct Deduplicator {
    storage: Arc<dyn Storage>,
    scorer: Arc<dyn SimilarityScorer>,
    config: PipelineConfig,
}

impl Deduplicator {
    pub fn new(
        storage: Arc<dyn Storage>,
        scorer: Arc<dyn SimilarityScorer>,
        config: PipelineConfig,
    ) -> Self {
        Self { storage, scorer, config }
    }

    pub async fn upsert(
        &self,
        candidate: &CandidateEvent,
        venue_id: Uuid,
        source: &Source,
    ) -> Result<DedupOutcome> {
        let hash = content_hash(&candidate.title_normalized, venue_id, candidate.event_day);

        // Exact key first: same title, venue, and day.
        if let Some(existing) = self.storage.get_event_by_content_hash(&hash).await? {
            return self.merge(existing, candidate, source).await;
        }

        // Cross-source near-duplicate: same venue, tight date window, fuzzy
        // title match. Below the threshold two records are genuinely distinct
        // events (two bands can play the same venue the same night).
        if let Some(existing) = self.find_near_duplicate(candidate, venue_id).await? {
            return self.merge(existing, candidate, source).await;
        }

        self.create(candidate, venue_id, source, hash).await
    }

    async fn find_near_duplicate(
        &self,
        candidate: &CandidateEvent,
        venue_id: Uuid,
    ) -> Result<Option<Event>> {
        let window = self.config.duplicate_date_window_days;
        let mut best: Option<(f64, Event)> = None;

        for offset in -window..=window {
            let day = candidate.event_day + Duration::days(offset);
            for event in self.storage.list_events_on_day(venue_id, day).await? {
                let score = self
                    .scorer
                    .score(&candidate.title_normalized, &normalized_title(&event));
                if score < self.config.title_similarity_threshold {
                    continue;
                }
                match &best {
                    Some((best_score, _)) if *best_score >= score => {}
                    _ => best = Some((score, event)),
                }
            }
        }

        if let Some((score, event)) = &best {
            debug!(
                title = %candidate.title,
                matched = %event.title,
                score,
                "near-duplicate title match"
            );
        }
        Ok(best.map(|(_, event)| event))
    }

    async fn create(
        &self,
        candidate: &CandidateEvent,
        venue_id: Uuid,
        source: &Source,
        hash: String,
    ) -> Result<DedupOutcome> {
        let now = Utc::now();
        let mut event = Event {
            id: None,
            title: candidate.title.clone(),
            event_day: candidate.event_day,
            start_time: candidate.start_time,
            end_time: candidate.end_time,
            showtimes: candidate.showtimes.clone(),
            venue_id,
            category: None,
            subcategory: None,
            genres: Vec::new(),
            description: candidate.description.clone(),
            image_url: candidate.image_url.clone(),
            price: candidate.price.clone(),
            content_hash: hash.clone(),
            series_id: None,
            source_ids: vec![source.source_id.clone()],
            locked_fields: Vec::new(),
            archived: false,
            created_at: now,
            updated_at: now,
        };

        match self.storage.insert_event(&mut event).await {
            Ok(()) => {
                let event_id = event.id.expect("inserted event has id");
                info!(title = %event.title, day = %event.event_day, "created event");
                Ok(DedupOutcome::Created(event_id))
            }
            // Another worker inserted the same event between our lookup and
            // this insert; re-fetch and proceed as a merge.
            Err(CatalogError::Conflict(_)) => {
                crate::observability::metrics::dedup::insert_conflict_recovered();
                let existing = self
                    .storage
                    .get_event_by_content_hash(&hash)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("event insert conflict but row not found"))?;
                self.merge(existing, candidate, source).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-observation of a known event. Factual fields follow source trust,
    /// descriptive fields prefer the longer value, manually corrected fields
    /// are never overwritten.
    async fn merge(
        &self,
        mut existing: Event,
        candidate: &CandidateEvent,
        source: &Source,
    ) -> Result<DedupOutcome> {
        let event_id = existing.id.expect("stored event has id");
        let existing_tier = self.creator_tier(&existing).await;
        let incoming_wins_facts = source.trust_tier > existing_tier;
        let mut fields_updated = Vec::new();

        self.merge_times(&mut existing, candidate, incoming_wins_facts, &mut fields_updated);

        if !existing.is_locked("price") {
            if let Some(price) = &candidate.price {
                let replace = match &existing.price {
                    None => true,
                    Some(current) => incoming_wins_facts && current != price,
                };
                if replace {
                    info!(
                        event = %existing.title,
                        field = "price",
                        before = ?existing.price,
                        after = ?price,
                        "merge updated field"
                    );
                    existing.price = Some(price.clone());
                    fields_updated.push("price".to_string());
                }
            }
        }

        if !existing.is_locked("description") {
            if let Some(description) = &candidate.description {
                let longer = existing
                    .description
                    .as_deref()
                    .map_or(true, |current| description.len() > current.len());
                if longer && existing.description.as_deref() != Some(description) {
                    info!(
                        event = %existing.title,
                        field = "description",
                        before = ?existing.description,
                        after = %description,
                        "merge updated field"
                    );
                    existing.description = Some(description.clone());
                    fields_updated.push("description".to_string());
                }
            }
        }

        if !existing.is_locked("image_url") {
            if let Some(image_url) = &candidate.image_url {
                if existing.image_url.is_none() {
                    info!(
                        event = %existing.title,
                        field = "image_url",
                        before = ?existing.image_url,
                        after = %image_url,
                        "merge updated field"
                    );
                    existing.image_url = Some(image_url.clone());
                    fields_updated.push("image_url".to_string());
                }
            }
        }

        let before_sources = existing.source_ids.len();
        existing.attribute_source(&source.source_id);
        if existing.source_ids.len() > before_sources {
            info!(
                event = %existing.title,
                source = %source.source_id,
                "merge attributed new source"
            );
            fields_updated.push("source_ids".to_string());
        }

        if fields_updated.is_empty() {
            debug!(event = %existing.title, "duplicate sighting, nothing new");
            return Ok(DedupOutcome::Duplicate(event_id));
        }

        existing.updated_at = Utc::now();
        self.storage.update_event(&existing).await?;
        Ok(DedupOutcome::Merged { event_id, fields_updated })
    }

    /// A single show with several same-day showtimes stays one event with a
    /// structured showtime list, never one ambiguous record nor a pile of
    /// near-identical rows.
    fn merge_times(
        &self,
        existing: &mut Event,
        candidate: &CandidateEvent,
        incoming_wins_facts: bool,
        fields_updated: &mut Vec<String>,
    ) {
        if existing.is_locked("start_time") {
            return;
        }

        let mut showtimes_changed = false;
        for time in &candidate.showtimes {
            if !existing.showtimes.contains(time) {
                existing.showtimes.push(*time);
                showtimes_changed = true;
            }
        }

        if let Some(time) = candidate.start_time {
            match existing.start_time {
                None => {
                    info!(
                        event = %existing.title,
                        field = "start_time",
                        before = "none",
                        after = %time,
                        "merge updated field"
                    );
                    existing.start_time = Some(time);
                    fields_updated.push("start_time".to_string());
                }
                Some(current) if current != time => {
                    if incoming_wins_facts {
                        info!(
                            event = %existing.title,
                            field = "start_time",
                            before = %current,
                            after = %time,
                            "merge updated field (higher trust)"
                        );
                        existing.start_time = Some(time);
                        if !existing.showtimes.contains(&current) {
                            existing.showtimes.push(current);
                        }
                        fields_updated.push("start_time".to_string());
                    } else if !existing.showtimes.contains(&time) {
                        // Keep the established primary; record the extra
                        // showing.
                        existing.showtimes.push(time);
                        showtimes_changed = true;
                    }
                }
                Some(_) => {}
            }
        }

        if let (None, Some(end)) = (existing.end_time, candidate.end_time) {
            existing.end_time = Some(end);
            fields_updated.push("end_time".to_string());
        }

        if showtimes_changed {
            existing.showtimes.sort();
            fields_updated.push("showtimes".to_string());
        }
    }

    /// Trust tier of the source that created the event, defaulting
    /// conservatively when that source is no longer registered.
    async fn creator_tier(&self, event: &Event) -> TrustTier {
        let Some(creator) = event.source_ids.first() else {
            return TrustTier::Unvetted;
        };
        match self.storage.get_source(creator).await {
            Ok(Some(source)) => source.trust_tier,
            _ => TrustTier::Standard,
        }
    }
}

fn normalized_title(event: &Event) -> String {
    crate::pipeline::utils::normalize_name(&event.title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::normalize::VenueHint;
    use crate::similarity::DefaultScorer;
    use chrono::NaiveTime;
    use citypulse_core::storage::InMemoryStorage;

    fn test_source(source_id: &str, tier: TrustTier) -> Source {
        Source {
            id: Some(Uuid::new_v4()),
            source_id: source_id.to_string(),
            name: source_id.to_string(),
            active: true,
            trust_tier: tier,
            last_crawled_at: None,
            created_at: Utc::now(),
        }
    }

    fn test_candidate(title: &str, day: NaiveDate) -> CandidateEvent {
        CandidateEvent {
            title: title.to_string(),
            title_normalized: crate::pipeline::utils::normalize_name(title),
            event_day: day,
            start_time: None,
            end_time: None,
            showtimes: Vec::new(),
            start_utc: day.and_hms_opt(0, 0, 0).unwrap().and_utc(),
            venue: VenueHint::default(),
            price: None,
            category_hint: None,
            genre_hints: Vec::new(),
            description: None,
            image_url: None,
            recurrence_hint: None,
            source_id: "test_source".to_string(),
            extraction_confidence: 0.9,
            past_dated: false,
            warnings: Vec::new(),
        }
    }

    fn dedup(storage: Arc<dyn Storage>) -> Deduplicator {
        Deduplicator::new(storage, Arc::new(DefaultScorer), PipelineConfig::default())
    }

    async fn register(storage: &Arc<dyn Storage>, source: &Source) {
        let mut source = source.clone();
        storage.upsert_source(&mut source).await.unwrap();
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 5).unwrap()
    }

    #[tokio::test]
    async fn test_content_hash_stability() {
        let venue = Uuid::new_v4();
        let a = content_hash("jazz night", venue, day());
        let b = content_hash("jazz night", venue, day());
        assert_eq!(a, b);

        // Any of title, venue, or date changing changes the hash.
        assert_ne!(a, content_hash("jazz might", venue, day()));
        assert_ne!(a, content_hash("jazz night", Uuid::new_v4(), day()));
        assert_ne!(
            a,
            content_hash("jazz night", venue, day() + Duration::days(1))
        );
    }

    #[tokio::test]
    async fn test_repeat_sighting_same_source_is_duplicate() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dedup = dedup(storage.clone());
        let source = test_source("source_a", TrustTier::Standard);
        register(&storage, &source).await;
        let venue_id = Uuid::new_v4();
        let candidate = test_candidate("Jazz Night", day());

        let first = dedup.upsert(&candidate, venue_id, &source).await.unwrap();
        let event_id = match first {
            DedupOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };

        let second = dedup.upsert(&candidate, venue_id, &source).await.unwrap();
        assert_eq!(second, DedupOutcome::Duplicate(event_id));
    }

    #[tokio::test]
    async fn test_near_duplicate_title_merges_cross_source() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dedup = dedup(storage.clone());
        let source_a = test_source("source_a", TrustTier::Established);
        let source_b = test_source("source_b", TrustTier::Standard);
        register(&storage, &source_a).await;
        register(&storage, &source_b).await;
        let venue_id = Uuid::new_v4();

        let first = dedup
            .upsert(&test_candidate("Jazz Night", day()), venue_id, &source_a)
            .await
            .unwrap();
        let event_id = match first {
            DedupOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };

        let outcome = dedup
            .upsert(&test_candidate("JAZZ NIGHT!!", day()), venue_id, &source_b)
            .await
            .unwrap();
        match outcome {
            DedupOutcome::Merged { event_id: merged_id, fields_updated } => {
                assert_eq!(merged_id, event_id);
                assert!(fields_updated.contains(&"source_ids".to_string()));
            }
            other => panic!("expected Merged, got {:?}", other),
        }

        let event = storage.get_event_by_id(event_id).await.unwrap().unwrap();
        assert_eq!(event.source_ids, vec!["source_a", "source_b"]);
    }

    #[tokio::test]
    async fn test_distinct_titles_same_night_stay_separate() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dedup = dedup(storage.clone());
        let source = test_source("source_a", TrustTier::Standard);
        register(&storage, &source).await;
        let venue_id = Uuid::new_v4();

        dedup
            .upsert(&test_candidate("The Decibels", day()), venue_id, &source)
            .await
            .unwrap();
        let second = dedup
            .upsert(&test_candidate("Static Fuzz", day()), venue_id, &source)
            .await
            .unwrap();

        assert!(matches!(second, DedupOutcome::Created(_)));
        assert_eq!(
            storage.list_events_on_day(venue_id, day()).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_threshold_boundary_both_sides() {
        struct FixedScorer(f64);
        impl SimilarityScorer for FixedScorer {
            fn score(&self, _: &str, _: &str) -> f64 {
                self.0
            }
        }

        let source = test_source("source_a", TrustTier::Standard);
        let venue_id = Uuid::new_v4();
        let config = PipelineConfig::default();

        // Exactly at the threshold: inclusive, treated as the same event.
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        register(&storage, &source).await;
        let at = Deduplicator::new(
            storage.clone(),
            Arc::new(FixedScorer(config.title_similarity_threshold)),
            config.clone(),
        );
        at.upsert(&test_candidate("Jazz Night", day()), venue_id, &source)
            .await
            .unwrap();
        let outcome = at
            .upsert(&test_candidate("Jazz Nite", day()), venue_id, &source)
            .await
            .unwrap();
        assert!(
            matches!(outcome, DedupOutcome::Duplicate(_) | DedupOutcome::Merged { .. }),
            "at-threshold should merge, got {:?}",
            outcome
        );

        // Just below: genuinely distinct.
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        register(&storage, &source).await;
        let below = Deduplicator::new(
            storage.clone(),
            Arc::new(FixedScorer(config.title_similarity_threshold - 0.001)),
            config.clone(),
        );
        below
            .upsert(&test_candidate("Jazz Night", day()), venue_id, &source)
            .await
            .unwrap();
        let outcome = below
            .upsert(&test_candidate("Jazz Nite", day()), venue_id, &source)
            .await
            .unwrap();
        assert!(matches!(outcome, DedupOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_higher_trust_overwrites_factual_lower_does_not() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dedup = dedup(storage.clone());
        let standard = test_source("standard", TrustTier::Standard);
        let verified = test_source("verified", TrustTier::Verified);
        let unvetted = test_source("unvetted", TrustTier::Unvetted);
        register(&storage, &standard).await;
        register(&storage, &verified).await;
        register(&storage, &unvetted).await;
        let venue_id = Uuid::new_v4();

        let mut candidate = test_candidate("Jazz Night", day());
        candidate.start_time = NaiveTime::from_hms_opt(20, 0, 0);
        let created = dedup.upsert(&candidate, venue_id, &standard).await.unwrap();
        let event_id = match created {
            DedupOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };

        // Lower trust disagrees on time: primary stays, extra showing noted.
        let mut low = test_candidate("Jazz Night", day());
        low.start_time = NaiveTime::from_hms_opt(21, 0, 0);
        dedup.upsert(&low, venue_id, &unvetted).await.unwrap();
        let event = storage.get_event_by_id(event_id).await.unwrap().unwrap();
        assert_eq!(event.start_time, NaiveTime::from_hms_opt(20, 0, 0));

        // Higher trust corrects the time.
        let mut high = test_candidate("Jazz Night", day());
        high.start_time = NaiveTime::from_hms_opt(19, 30, 0);
        dedup.upsert(&high, venue_id, &verified).await.unwrap();
        let event = storage.get_event_by_id(event_id).await.unwrap().unwrap();
        assert_eq!(event.start_time, NaiveTime::from_hms_opt(19, 30, 0));
    }

    #[tokio::test]
    async fn test_locked_field_never_overwritten() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dedup = dedup(storage.clone());
        let standard = test_source("standard", TrustTier::Standard);
        let verified = test_source("verified", TrustTier::Verified);
        register(&storage, &standard).await;
        register(&storage, &verified).await;
        let venue_id = Uuid::new_v4();

        let mut candidate = test_candidate("Jazz Night", day());
        candidate.description = Some("short".to_string());
        let created = dedup.upsert(&candidate, venue_id, &standard).await.unwrap();
        let event_id = match created {
            DedupOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };

        // Operator corrected the description by hand.
        let mut event = storage.get_event_by_id(event_id).await.unwrap().unwrap();
        event.description = Some("curated copy".to_string());
        event.locked_fields.push("description".to_string());
        storage.update_event(&event).await.unwrap();

        let mut richer = test_candidate("Jazz Night", day());
        richer.description = Some("a much longer scraped description".to_string());
        dedup.upsert(&richer, venue_id, &verified).await.unwrap();

        let event = storage.get_event_by_id(event_id).await.unwrap().unwrap();
        assert_eq!(event.description.as_deref(), Some("curated copy"));
    }

    #[tokio::test]
    async fn test_longer_description_wins() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dedup = dedup(storage.clone());
        let source = test_source("source_a", TrustTier::Standard);
        register(&storage, &source).await;
        let venue_id = Uuid::new_v4();

        let mut short = test_candidate("Jazz Night", day());
        short.description = Some("Jazz.".to_string());
        let created = dedup.upsert(&short, venue_id, &source).await.unwrap();
        let event_id = match created {
            DedupOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };

        let mut long = test_candidate("Jazz Night", day());
        long.description = Some("An evening of improvised jazz standards.".to_string());
        let outcome = dedup.upsert(&long, venue_id, &source).await.unwrap();
        assert!(matches!(outcome, DedupOutcome::Merged { .. }));

        let event = storage.get_event_by_id(event_id).await.unwrap().unwrap();
        assert_eq!(
            event.description.as_deref(),
            Some("An evening of improvised jazz standards.")
        );
    }

    #[tokio::test]
    async fn test_same_day_showtimes_collapse_to_one_event() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let dedup = dedup(storage.clone());
        let source = test_source("source_a", TrustTier::Standard);
        register(&storage, &source).await;
        let venue_id = Uuid::new_v4();

        let mut matinee = test_candidate("The Seventh Seal", day());
        matinee.start_time = NaiveTime::from_hms_opt(14, 0, 0);
        let created = dedup.upsert(&matinee, venue_id, &source).await.unwrap();
        let event_id = match created {
            DedupOutcome::Created(id) => id,
            other => panic!("expected Created, got {:?}", other),
        };

        for hour in [17, 20] {
            let mut showing = test_candidate("The Seventh Seal", day());
            showing.start_time = NaiveTime::from_hms_opt(hour, 0, 0);
            let outcome = dedup.upsert(&showing, venue_id, &source).await.unwrap();
            assert!(
                matches!(outcome, DedupOutcome::Merged { .. }),
                "showing at {} should merge, got {:?}",
                hour,
                outcome
            );
        }

        let events = storage.list_events_on_day(venue_id, day()).await.unwrap();
        assert_eq!(events.len(), 1, "showtimes must not become separate events");
        let event = storage.get_event_by_id(event_id).await.unwrap().unwrap();
        assert_eq!(event.start_time, NaiveTime::from_hms_opt(14, 0, 0));
        assert_eq!(
            event.showtimes,
            vec![
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            ]
        );
    }
}
