use super::traits::Storage;
use crate::domain::*;
use crate::error::{CatalogError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// In-memory storage implementation for development and testing.
///
/// Uniqueness indexes are updated under the same mutex acquisition as the
/// row insert, so the insert-or-conflict contract holds across concurrent
/// source workers. No lock is held across an await point.
pub struct InMemoryStorage {
    sources: Arc<Mutex<HashMap<String, Source>>>,
    venues: Arc<Mutex<VenueTable>>,
    events: Arc<Mutex<EventTable>>,
    series: Arc<Mutex<HashMap<Uuid, Series>>>,
    crawl_runs: Arc<Mutex<HashMap<Uuid, CrawlRun>>>,
}

#[derive(Default)]
struct VenueTable {
    rows: HashMap<Uuid, Venue>,
    /// Unique index on (name_normalized, city).
    name_index: HashMap<(String, String), Uuid>,
}

#[derive(Default)]
struct EventTable {
    rows: HashMap<Uuid, Event>,
    /// Unique index on content_hash among non-archived events.
    hash_index: HashMap<String, Uuid>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            sources: Arc::new(Mutex::new(HashMap::new())),
            venues: Arc::new(Mutex::new(VenueTable::default())),
            events: Arc::new(Mutex::new(EventTable::default())),
            series: Arc::new(Mutex::new(HashMap::new())),
            crawl_runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let sources = self.sources.lock().unwrap();
        Ok(sources.get(source_id).cloned())
    }

    async fn upsert_source(&self, source: &mut Source) -> Result<()> {
        if source.id.is_none() {
            source.id = Some(Uuid::new_v4());
        }
        let mut sources = self.sources.lock().unwrap();
        sources.insert(source.source_id.clone(), source.clone());
        debug!("Upserted source {}", source.source_id);
        Ok(())
    }

    async fn mark_source_crawled(&self, source_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut sources = self.sources.lock().unwrap();
        if let Some(source) = sources.get_mut(source_id) {
            source.last_crawled_at = Some(at);
        }
        Ok(())
    }

    async fn insert_venue(&self, venue: &mut Venue) -> Result<()> {
        let mut table = self.venues.lock().unwrap();
        let key = (venue.name_normalized.clone(), venue.city.clone());
        if table.name_index.contains_key(&key) {
            return Err(CatalogError::Conflict(format!(
                "venue ({}, {}) already exists",
                key.0, key.1
            )));
        }

        let id = Uuid::new_v4();
        venue.id = Some(id);
        table.name_index.insert(key, id);
        table.rows.insert(id, venue.clone());

        debug!("Created venue '{}' with id {}", venue.name, id);
        Ok(())
    }

    async fn get_venue_by_id(&self, venue_id: Uuid) -> Result<Option<Venue>> {
        let table = self.venues.lock().unwrap();
        Ok(table.rows.get(&venue_id).cloned())
    }

    async fn find_venue_by_alias(
        &self,
        name_normalized: &str,
        city: &str,
    ) -> Result<Option<Venue>> {
        let table = self.venues.lock().unwrap();
        // Canonical-name index first, then the alias sets.
        if let Some(id) = table
            .name_index
            .get(&(name_normalized.to_string(), city.to_string()))
        {
            return Ok(table.rows.get(id).cloned());
        }
        let venue = table
            .rows
            .values()
            .find(|v| v.active && v.city == city && v.known_as(name_normalized))
            .cloned();
        Ok(venue)
    }

    async fn list_venues_in_city(&self, city: &str) -> Result<Vec<Venue>> {
        let table = self.venues.lock().unwrap();
        let mut venues: Vec<Venue> = table
            .rows
            .values()
            .filter(|v| v.active && v.city == city)
            .cloned()
            .collect();
        venues.sort_by(|a, b| a.name_normalized.cmp(&b.name_normalized));
        Ok(venues)
    }

    async fn add_venue_alias(&self, venue_id: Uuid, alias: &str) -> Result<()> {
        let mut table = self.venues.lock().unwrap();
        let venue = table
            .rows
            .get_mut(&venue_id)
            .ok_or_else(|| CatalogError::NotFound(format!("venue {}", venue_id)))?;
        if !venue.known_as(alias) {
            venue.aliases.push(alias.to_string());
            venue.updated_at = Utc::now();
            debug!("Added alias '{}' to venue '{}'", alias, venue.name);
        }
        Ok(())
    }

    async fn update_venue(&self, venue: &Venue) -> Result<()> {
        let venue_id = venue
            .id
            .ok_or_else(|| CatalogError::MissingField("venue.id".to_string()))?;
        let mut table = self.venues.lock().unwrap();
        table.rows.insert(venue_id, venue.clone());
        Ok(())
    }

    async fn count_events_for_venue(&self, venue_id: Uuid) -> Result<usize> {
        let table = self.events.lock().unwrap();
        Ok(table.rows.values().filter(|e| e.venue_id == venue_id).count())
    }

    async fn insert_event(&self, event: &mut Event) -> Result<()> {
        let mut table = self.events.lock().unwrap();
        if table.hash_index.contains_key(&event.content_hash) {
            return Err(CatalogError::Conflict(format!(
                "event with content hash {} already exists",
                event.content_hash
            )));
        }

        let id = Uuid::new_v4();
        event.id = Some(id);
        table.hash_index.insert(event.content_hash.clone(), id);
        table.rows.insert(id, event.clone());

        debug!("Created event '{}' with id {}", event.title, id);
        Ok(())
    }

    async fn get_event_by_id(&self, event_id: Uuid) -> Result<Option<Event>> {
        let table = self.events.lock().unwrap();
        Ok(table.rows.get(&event_id).cloned())
    }

    async fn get_event_by_content_hash(&self, content_hash: &str) -> Result<Option<Event>> {
        let table = self.events.lock().unwrap();
        let event = table
            .hash_index
            .get(content_hash)
            .and_then(|id| table.rows.get(id))
            .cloned();
        Ok(event)
    }

    async fn list_events_on_day(&self, venue_id: Uuid, day: NaiveDate) -> Result<Vec<Event>> {
        let table = self.events.lock().unwrap();
        let mut events: Vec<Event> = table
            .rows
            .values()
            .filter(|e| !e.archived && e.venue_id == venue_id && e.event_day == day)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(events)
    }

    async fn list_events_for_venue(&self, venue_id: Uuid) -> Result<Vec<Event>> {
        let table = self.events.lock().unwrap();
        let mut events: Vec<Event> = table
            .rows
            .values()
            .filter(|e| !e.archived && e.venue_id == venue_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_day);
        Ok(events)
    }

    async fn update_event(&self, event: &Event) -> Result<()> {
        let event_id = event
            .id
            .ok_or_else(|| CatalogError::MissingField("event.id".to_string()))?;
        let mut table = self.events.lock().unwrap();
        table.rows.insert(event_id, event.clone());
        Ok(())
    }

    async fn archive_events_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let mut table = self.events.lock().unwrap();
        let mut archived = 0u64;
        let mut freed_hashes = Vec::new();
        for event in table.rows.values_mut() {
            if !event.archived && event.event_day < cutoff {
                event.archived = true;
                event.updated_at = Utc::now();
                freed_hashes.push(event.content_hash.clone());
                archived += 1;
            }
        }
        // Archived events no longer participate in the uniqueness window.
        for hash in freed_hashes {
            table.hash_index.remove(&hash);
        }
        Ok(archived)
    }

    async fn insert_series(&self, series: &mut Series) -> Result<()> {
        let id = Uuid::new_v4();
        series.id = Some(id);

        let mut table = self.series.lock().unwrap();
        table.insert(id, series.clone());

        debug!("Created series '{}' with id {}", series.title, id);
        Ok(())
    }

    async fn get_series_by_id(&self, series_id: Uuid) -> Result<Option<Series>> {
        let table = self.series.lock().unwrap();
        Ok(table.get(&series_id).cloned())
    }

    async fn find_open_series(
        &self,
        venue_id: Uuid,
        title_normalized: &str,
    ) -> Result<Option<Series>> {
        let table = self.series.lock().unwrap();
        let series = table
            .values()
            .find(|s| {
                s.venue_id == venue_id
                    && s.title_normalized == title_normalized
                    && s.state != SeriesState::Closed
            })
            .cloned();
        Ok(series)
    }

    async fn list_open_series(&self) -> Result<Vec<Series>> {
        let table = self.series.lock().unwrap();
        let mut open: Vec<Series> = table
            .values()
            .filter(|s| s.state != SeriesState::Closed)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.title_normalized.cmp(&b.title_normalized));
        Ok(open)
    }

    async fn update_series(&self, series: &Series) -> Result<()> {
        let series_id = series
            .id
            .ok_or_else(|| CatalogError::MissingField("series.id".to_string()))?;
        let mut table = self.series.lock().unwrap();
        table.insert(series_id, series.clone());
        Ok(())
    }

    async fn create_crawl_run(&self, run: &mut CrawlRun) -> Result<()> {
        let id = Uuid::new_v4();
        run.id = Some(id);

        let mut runs = self.crawl_runs.lock().unwrap();
        runs.insert(id, run.clone());

        debug!("Started crawl run {} for source {}", id, run.source_id);
        Ok(())
    }

    async fn finalize_crawl_run(&self, run: &CrawlRun) -> Result<()> {
        let run_id = run
            .id
            .ok_or_else(|| CatalogError::MissingField("crawl_run.id".to_string()))?;
        let mut runs = self.crawl_runs.lock().unwrap();
        runs.insert(run_id, run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_venue(name: &str, normalized: &str, city: &str) -> Venue {
        Venue {
            id: None,
            name: name.to_string(),
            name_normalized: normalized.to_string(),
            aliases: Vec::new(),
            address: None,
            city: city.to_string(),
            latitude: None,
            longitude: None,
            venue_type: VenueType::MusicVenue,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_event(title: &str, venue_id: Uuid, day: NaiveDate, hash: &str) -> Event {
        Event {
            id: None,
            title: title.to_string(),
            event_day: day,
            start_time: None,
            end_time: None,
            showtimes: Vec::new(),
            venue_id,
            category: None,
            subcategory: None,
            genres: Vec::new(),
            description: None,
            image_url: None,
            price: None,
            content_hash: hash.to_string(),
            series_id: None,
            source_ids: vec!["test_source".to_string()],
            locked_fields: Vec::new(),
            archived: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_venue_unique_constraint() {
        let storage = InMemoryStorage::new();

        let mut first = test_venue("The Blue Room", "the blue room", "portland");
        storage.insert_venue(&mut first).await.unwrap();
        assert!(first.id.is_some());

        let mut second = test_venue("The Blue Room", "the blue room", "portland");
        let err = storage.insert_venue(&mut second).await.unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));

        // Same name in another region is a different venue.
        let mut elsewhere = test_venue("The Blue Room", "the blue room", "seattle");
        storage.insert_venue(&mut elsewhere).await.unwrap();
    }

    #[tokio::test]
    async fn test_alias_lookup_after_append() {
        let storage = InMemoryStorage::new();

        let mut venue = test_venue("The Blue Room", "the blue room", "portland");
        storage.insert_venue(&mut venue).await.unwrap();
        let venue_id = venue.id.unwrap();

        storage
            .add_venue_alias(venue_id, "blue room lounge")
            .await
            .unwrap();

        let found = storage
            .find_venue_by_alias("blue room lounge", "portland")
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, Some(venue_id));

        let missing = storage
            .find_venue_by_alias("blue room lounge", "seattle")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_event_hash_constraint_and_refetch() {
        let storage = InMemoryStorage::new();
        let venue_id = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();

        let mut first = test_event("Jazz Night", venue_id, day, "hash-1");
        storage.insert_event(&mut first).await.unwrap();

        let mut second = test_event("Jazz Night", venue_id, day, "hash-1");
        let err = storage.insert_event(&mut second).await.unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));

        // Conflict recovery path: the existing row is fetchable by hash.
        let existing = storage.get_event_by_content_hash("hash-1").await.unwrap();
        assert_eq!(existing.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_archive_frees_hash_window() {
        let storage = InMemoryStorage::new();
        let venue_id = Uuid::new_v4();
        let old_day = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();

        let mut old_event = test_event("Old Show", venue_id, old_day, "hash-old");
        storage.insert_event(&mut old_event).await.unwrap();

        let archived = storage
            .archive_events_before(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(archived, 1);

        // The hash is no longer claimed by an active event.
        assert!(storage
            .get_event_by_content_hash("hash-old")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_closed_series_not_default_join_target() {
        let storage = InMemoryStorage::new();
        let venue_id = Uuid::new_v4();

        let mut series = Series {
            id: None,
            title: "Open Mic".to_string(),
            title_normalized: "open mic".to_string(),
            venue_id,
            cadence: Cadence { weekday: chrono::Weekday::Wed, interval_days: 7 },
            recurrence: "weekly on Wednesdays".to_string(),
            member_event_ids: Vec::new(),
            category: None,
            subcategory: None,
            genres: Vec::new(),
            state: SeriesState::Active,
            last_occurrence: NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        storage.insert_series(&mut series).await.unwrap();

        assert!(storage
            .find_open_series(venue_id, "open mic")
            .await
            .unwrap()
            .is_some());

        series.state = SeriesState::Closed;
        storage.update_series(&series).await.unwrap();

        assert!(storage
            .find_open_series(venue_id, "open mic")
            .await
            .unwrap()
            .is_none());
    }
}
