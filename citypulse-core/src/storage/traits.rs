use crate::domain::*;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Storage contract for the canonical catalog (venues, events, series,
/// sources, crawl runs).
///
/// Writes are short transactions scoped to a single record's outcome.
/// `insert_venue` and `insert_event` enforce natural-key uniqueness
/// atomically — `(name_normalized, city)` for venues, `content_hash` among
/// active events — and fail with `CatalogError::Conflict` when another writer
/// got there first. The correct recovery is to re-fetch the now-existing row
/// and proceed as a merge, never check-then-insert.
#[async_trait]
pub trait Storage: Send + Sync {
    // Source operations
    async fn get_source(&self, source_id: &str) -> Result<Option<Source>>;
    async fn upsert_source(&self, source: &mut Source) -> Result<()>;
    async fn mark_source_crawled(&self, source_id: &str, at: DateTime<Utc>) -> Result<()>;

    // Venue operations
    async fn insert_venue(&self, venue: &mut Venue) -> Result<()>;
    async fn get_venue_by_id(&self, venue_id: Uuid) -> Result<Option<Venue>>;
    /// Exact lookup by normalized name or alias within a metro region.
    async fn find_venue_by_alias(&self, name_normalized: &str, city: &str)
        -> Result<Option<Venue>>;
    /// All active venues in a region, for fuzzy scanning.
    async fn list_venues_in_city(&self, city: &str) -> Result<Vec<Venue>>;
    async fn add_venue_alias(&self, venue_id: Uuid, alias: &str) -> Result<()>;
    async fn update_venue(&self, venue: &Venue) -> Result<()>;
    /// Historical event count, used as the stability heuristic for ambiguous
    /// fuzzy matches.
    async fn count_events_for_venue(&self, venue_id: Uuid) -> Result<usize>;

    // Event operations
    async fn insert_event(&self, event: &mut Event) -> Result<()>;
    async fn get_event_by_id(&self, event_id: Uuid) -> Result<Option<Event>>;
    async fn get_event_by_content_hash(&self, content_hash: &str) -> Result<Option<Event>>;
    /// Active events at a venue on one calendar day (the near-duplicate
    /// comparison window).
    async fn list_events_on_day(&self, venue_id: Uuid, day: NaiveDate) -> Result<Vec<Event>>;
    async fn list_events_for_venue(&self, venue_id: Uuid) -> Result<Vec<Event>>;
    async fn update_event(&self, event: &Event) -> Result<()>;
    /// Soft-delete: archive events whose day is before the cutoff. Returns
    /// how many were archived.
    async fn archive_events_before(&self, cutoff: NaiveDate) -> Result<u64>;

    // Series operations
    async fn insert_series(&self, series: &mut Series) -> Result<()>;
    async fn get_series_by_id(&self, series_id: Uuid) -> Result<Option<Series>>;
    /// The default join target for a (venue, title) pair: candidate or active
    /// series only, never closed ones.
    async fn find_open_series(&self, venue_id: Uuid, title_normalized: &str)
        -> Result<Option<Series>>;
    /// All candidate/active series, for the staleness sweep at run end.
    async fn list_open_series(&self) -> Result<Vec<Series>>;
    async fn update_series(&self, series: &Series) -> Result<()>;

    // Crawl run operations
    async fn create_crawl_run(&self, run: &mut CrawlRun) -> Result<()>;
    async fn finalize_crawl_run(&self, run: &CrawlRun) -> Result<()>;
}
