use anyhow::Result;
use chrono::Utc;
use citypulse_core::domain::{Venue, VenueType};
use citypulse_core::storage::Storage;
use citypulse_core::CatalogError;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::pipeline::processing::normalize::VenueHint;
use crate::pipeline::utils::normalize_name;
use crate::similarity::SimilarityScorer;

/// How the resolver arrived at a venue id.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueDecision {
    /// Normalized name or known alias matched exactly.
    ExactAlias,
    /// Fuzzy similarity match; the observed variant joined the alias set.
    Fuzzy { score: f64, alias_added: bool },
    /// No match; a new canonical venue was created.
    Created,
    /// Online/remote description resolved to the region's virtual venue.
    Virtual,
}

#[derive(Debug, Clone)]
pub struct VenueResolution {
    pub venue_id: Uuid,
    pub confidence: f64,
    pub decision: VenueDecision,
}

/// Optional geocoding boundary. Coordinates stay null when no geocoder is
/// configured; nothing downstream requires them.
pub trait Geocoder: Send + Sync {
    fn geocode(&self, address: &str) -> Result<Option<(f64, f64)>>;
}

/// Venue descriptions that mean "not a physical place".
const VIRTUAL_MARKERS: &[&str] = &["online", "virtual", "zoom", "webinar", "livestream"];

/// Resolves a candidate's venue description to an existing canonical venue
/// or creates one, growing alias coverage as fuzzy matches reveal new
/// spellings.
pub struct VenueResolver {
    storage: Arc<dyn Storage>,
    scorer: Arc<dyn SimilarityScorer>,
    geocoder: Option<Box<dyn Geocoder>>,
    config: PipelineConfig,
}

impl VenueResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        scorer: Arc<dyn SimilarityScorer>,
        config: PipelineConfig,
    ) -> Self {
        Self { storage, scorer, geocoder: None, config }
    }

    pub fn with_geocoder(mut self, geocoder: Box<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub async fn resolve(
        &self,
        hint: &VenueHint,
        extraction_confidence: f64,
    ) -> Result<VenueResolution> {
        let city = hint
            .city
            .as_deref()
            .map(normalize_name)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.config.default_city.clone());

        // Virtual/remote events are legitimate and must not be lost for lack
        // of a street address.
        if self.is_virtual(hint) {
            let venue_id = self.virtual_venue(&city).await?;
            return Ok(VenueResolution {
                venue_id,
                confidence: 1.0,
                decision: VenueDecision::Virtual,
            });
        }

        let name = hint
            .name
            .clone()
            .or_else(|| hint.address.clone())
            .unwrap_or_default();
        let name_normalized = normalize_name(&name);

        // 1. Exact lookup by normalized name or alias within the region.
        if let Some(venue) = self
            .storage
            .find_venue_by_alias(&name_normalized, &city)
            .await?
        {
            let venue_id = venue.id.expect("stored venue has id");
            debug!(venue = %venue.name, "exact alias match");
            crate::observability::metrics::venue::resolved_exact();
            return Ok(VenueResolution {
                venue_id,
                confidence: 1.0,
                decision: VenueDecision::ExactAlias,
            });
        }

        // 2. Fuzzy similarity against known names and aliases, gated by
        // geographic proximity when both sides have coordinates.
        if let Some(resolution) = self.fuzzy_match(hint, &name_normalized, &city).await? {
            return Ok(resolution);
        }

        // 3. Still unmatched: create a new canonical venue.
        self.create_venue(hint, &name, &name_normalized, &city, extraction_confidence)
            .await
    }

    fn is_virtual(&self, hint: &VenueHint) -> bool {
        if !hint.is_described() {
            return true;
        }
        if let Some(name) = &hint.name {
            let normalized = normalize_name(name);
            if VIRTUAL_MARKERS
                .iter()
                .any(|m| normalized == *m || normalized.starts_with(&format!("{} ", m)))
            {
                return true;
            }
        }
        false
    }

    /// Get-or-create the singleton virtual venue for a region. Concurrent
    /// workers may race on first creation; the conflict recovery re-fetches.
    async fn virtual_venue(&self, city: &str) -> Result<Uuid> {
        let name_normalized = "virtual".to_string();
        if let Some(venue) = self
            .storage
            .find_venue_by_alias(&name_normalized, city)
            .await?
        {
            return Ok(venue.id.expect("stored venue has id"));
        }

        let mut venue = Venue {
            id: None,
            name: "Virtual".to_string(),
            name_normalized: name_normalized.clone(),
            aliases: Vec::new(),
            address: None,
            city: city.to_string(),
            latitude: None,
            longitude: None,
            venue_type: VenueType::Virtual,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        match self.storage.insert_venue(&mut venue).await {
            Ok(()) => {
                crate::observability::metrics::venue::virtual_fallback();
                Ok(venue.id.expect("inserted venue has id"))
            }
            Err(CatalogError::Conflict(_)) => {
                let existing = self
                    .storage
                    .find_venue_by_alias(&name_normalized, city)
                    .await?
                    .ok_or_else(|| {
                        anyhow::anyhow!("virtual venue conflict but row not found")
                    })?;
                Ok(existing.id.expect("stored venue has id"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fuzzy_match(
        &self,
        hint: &VenueHint,
        name_normalized: &str,
        city: &str,
    ) -> Result<Option<VenueResolution>> {
        let venues = self.storage.list_venues_in_city(city).await?;

        let mut scored: Vec<(f64, &Venue)> = Vec::new();
        for venue in &venues {
            if venue.venue_type == VenueType::Virtual {
                continue;
            }
            let best = std::iter::once(&venue.name_normalized)
                .chain(venue.aliases.iter())
                .map(|known| self.scorer.score(name_normalized, known))
                .fold(0.0_f64, f64::max);

            if best < self.config.venue_similarity_threshold {
                continue;
            }

            // Same-named venues in different parts of town are different
            // places; distance gates the match when both are geocoded.
            if let (Some(lat), Some(lng), Some(vlat), Some(vlng)) =
                (hint.latitude, hint.longitude, venue.latitude, venue.longitude)
            {
                let distance = approx_distance_km(lat, lng, vlat, vlng);
                if distance > self.config.max_venue_distance_km {
                    debug!(
                        venue = %venue.name,
                        distance_km = distance,
                        "fuzzy name match rejected by distance gate"
                    );
                    continue;
                }
            }

            scored.push((best, venue));
        }

        if scored.is_empty() {
            return Ok(None);
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let (best_score, mut best_venue) = (scored[0].0, scored[0].1);

        // Near-equal runner-up: prefer the venue with more historical events
        // and log the ambiguity for manual review rather than guessing
        // silently.
        if let Some(&(runner_score, runner_venue)) = scored.get(1) {
            if best_score - runner_score <= self.config.venue_ambiguity_margin {
                let best_id = best_venue.id.expect("stored venue has id");
                let runner_id = runner_venue.id.expect("stored venue has id");
                let best_count = self.storage.count_events_for_venue(best_id).await?;
                let runner_count = self.storage.count_events_for_venue(runner_id).await?;
                warn!(
                    candidate = %name_normalized,
                    top_match = %best_venue.name,
                    runner_up = %runner_venue.name,
                    top_score = best_score,
                    runner_score = runner_score,
                    "ambiguous venue resolution; tie-broken by event history"
                );
                crate::observability::metrics::venue::ambiguity_flagged();
                if runner_count > best_count {
                    best_venue = runner_venue;
                }
            }
        }

        let venue_id = best_venue.id.expect("stored venue has id");

        // The observed spelling becomes an alias; this is how coverage grows.
        let alias_added = !best_venue.known_as(name_normalized);
        if alias_added {
            self.storage.add_venue_alias(venue_id, name_normalized).await?;
            info!(
                venue = %best_venue.name,
                alias = %name_normalized,
                score = best_score,
                "new alias learned from fuzzy match"
            );
        }

        crate::observability::metrics::venue::resolved_fuzzy();
        Ok(Some(VenueResolution {
            venue_id,
            confidence: best_score,
            decision: VenueDecision::Fuzzy { score: best_score, alias_added },
        }))
    }

    async fn create_venue(
        &self,
        hint: &VenueHint,
        name: &str,
        name_normalized: &str,
        city: &str,
        extraction_confidence: f64,
    ) -> Result<VenueResolution> {
        let (latitude, longitude) = match (hint.latitude, hint.longitude) {
            (Some(lat), Some(lng)) => (Some(lat), Some(lng)),
            _ => self.geocode_hint(hint),
        };

        let mut venue = Venue {
            id: None,
            name: name.to_string(),
            name_normalized: name_normalized.to_string(),
            aliases: Vec::new(),
            address: hint.address.clone(),
            city: city.to_string(),
            latitude,
            longitude,
            venue_type: VenueType::Unknown,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        match self.storage.insert_venue(&mut venue).await {
            Ok(()) => {
                let venue_id = venue.id.expect("inserted venue has id");
                info!(venue = %name, %city, "created new venue");
                crate::observability::metrics::venue::created();
                Ok(VenueResolution {
                    venue_id,
                    confidence: extraction_confidence,
                    decision: VenueDecision::Created,
                })
            }
            // Another worker discovered the same venue first; re-fetch and
            // proceed as a match.
            Err(CatalogError::Conflict(_)) => {
                let existing = self
                    .storage
                    .find_venue_by_alias(name_normalized, city)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("venue insert conflict but row not found"))?;
                debug!(venue = %existing.name, "insert conflict recovered by re-fetch");
                Ok(VenueResolution {
                    venue_id: existing.id.expect("stored venue has id"),
                    confidence: 1.0,
                    decision: VenueDecision::ExactAlias,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn geocode_hint(&self, hint: &VenueHint) -> (Option<f64>, Option<f64>) {
        let (Some(geocoder), Some(address)) = (self.geocoder.as_ref(), hint.address.as_deref())
        else {
            return (None, None);
        };
        match geocoder.geocode(address) {
            Ok(Some((lat, lng))) => (Some(lat), Some(lng)),
            Ok(None) => (None, None),
            Err(e) => {
                warn!(error = %e, "geocoding failed; coordinates stay null");
                (None, None)
            }
        }
    }
}

/// Flat-earth approximation, fine at metro scale.
fn approx_distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat_diff = (lat1 - lat2) * 111.0;
    let lng_diff = (lng1 - lng2) * 111.0 * lat1.to_radians().cos();
    (lat_diff * lat_diff + lng_diff * lng_diff).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::VenueNameScorer;
    use citypulse_core::storage::InMemoryStorage;

    fn resolver(storage: Arc<dyn Storage>) -> VenueResolver {
        VenueResolver::new(storage, Arc::new(VenueNameScorer), PipelineConfig::default())
    }

    fn hint(name: &str) -> VenueHint {
        VenueHint {
            name: Some(name.to_string()),
            address: None,
            city: Some("portland".to_string()),
            latitude: None,
            longitude: None,
        }
    }

    #[tokio::test]
    async fn test_creates_then_exact_matches() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let resolver = resolver(storage.clone());

        let first = resolver.resolve(&hint("The Blue Room"), 0.9).await.unwrap();
        assert_eq!(first.decision, VenueDecision::Created);

        let second = resolver.resolve(&hint("The Blue Room"), 0.9).await.unwrap();
        assert_eq!(second.decision, VenueDecision::ExactAlias);
        assert_eq!(second.venue_id, first.venue_id);
    }

    #[tokio::test]
    async fn test_fuzzy_match_appends_alias() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let resolver = resolver(storage.clone());

        let created = resolver.resolve(&hint("The Blue Room"), 0.9).await.unwrap();

        let fuzzy = resolver.resolve(&hint("Blue Room"), 0.9).await.unwrap();
        assert_eq!(fuzzy.venue_id, created.venue_id);
        assert!(matches!(fuzzy.decision, VenueDecision::Fuzzy { alias_added: true, .. }));

        // Alias now matches exactly; no second venue row ever appears.
        let again = resolver.resolve(&hint("Blue Room"), 0.9).await.unwrap();
        assert_eq!(again.decision, VenueDecision::ExactAlias);
        assert_eq!(again.venue_id, created.venue_id);
        assert_eq!(
            storage.list_venues_in_city("portland").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unrelated_name_creates_second_venue() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let resolver = resolver(storage.clone());

        resolver.resolve(&hint("The Blue Room"), 0.9).await.unwrap();
        let other = resolver.resolve(&hint("Crystal Ballroom"), 0.9).await.unwrap();
        assert_eq!(other.decision, VenueDecision::Created);
        assert_eq!(
            storage.list_venues_in_city("portland").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_same_name_different_city_stays_distinct() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let resolver = resolver(storage.clone());

        let portland = resolver.resolve(&hint("The Blue Room"), 0.9).await.unwrap();

        let mut seattle_hint = hint("The Blue Room");
        seattle_hint.city = Some("seattle".to_string());
        let seattle = resolver.resolve(&seattle_hint, 0.9).await.unwrap();

        assert_eq!(seattle.decision, VenueDecision::Created);
        assert_ne!(portland.venue_id, seattle.venue_id);
    }

    #[tokio::test]
    async fn test_distance_gate_blocks_cross_town_fuzzy_match() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let resolver = resolver(storage.clone());

        let mut north = hint("Grand Hall");
        north.latitude = Some(45.60);
        north.longitude = Some(-122.60);
        let first = resolver.resolve(&north, 0.9).await.unwrap();

        let mut south = hint("Grand Halle");
        south.latitude = Some(45.40);
        south.longitude = Some(-122.60);
        let second = resolver.resolve(&south, 0.9).await.unwrap();

        assert_eq!(second.decision, VenueDecision::Created);
        assert_ne!(first.venue_id, second.venue_id);
    }

    #[tokio::test]
    async fn test_online_resolves_to_virtual_singleton() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let resolver = resolver(storage.clone());

        let first = resolver.resolve(&hint("Online"), 0.9).await.unwrap();
        assert_eq!(first.decision, VenueDecision::Virtual);

        let second = resolver.resolve(&hint("Zoom"), 0.9).await.unwrap();
        assert_eq!(second.decision, VenueDecision::Virtual);
        assert_eq!(first.venue_id, second.venue_id);
    }
}
