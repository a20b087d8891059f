use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-source ranking used to break ties when merging conflicting field
/// values. Higher tiers win factual-field conflicts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrustTier {
    Unvetted,
    Standard,
    Established,
    Verified,
}

/// A registered feed (website/API). Created by operators, deactivated when it
/// stops producing usable data, never deleted so historical attribution
/// survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Option<Uuid>,
    /// Stable string key used for attribution on events (survives re-crawls).
    pub source_id: String,
    pub name: String,
    pub active: bool,
    pub trust_tier: TrustTier,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VenueType {
    MusicVenue,
    Theater,
    ComedyClub,
    Gallery,
    Bar,
    CommunitySpace,
    Outdoor,
    /// Singleton per region; online/remote events resolve here rather than
    /// being dropped for lack of a street address.
    Virtual,
    Unknown,
}

/// Canonical physical or virtual place. Two active venues must never
/// represent the same physical place; the alias set exists to prevent that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venue {
    pub id: Option<Uuid>,
    pub name: String,
    /// Lowercased, accent-folded, punctuation-collapsed form of `name`.
    /// Unique together with `city`.
    pub name_normalized: String,
    /// Alternate known names, stored normalized. Grows as fuzzy matches
    /// reveal new spellings.
    pub aliases: Vec<String>,
    pub address: Option<String>,
    /// Metro region key; same-named venues in different cities stay distinct.
    pub city: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub venue_type: VenueType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Venue {
    /// Whether `candidate` (already normalized) matches the canonical name or
    /// any known alias exactly.
    pub fn known_as(&self, candidate: &str) -> bool {
        self.name_normalized == candidate || self.aliases.iter().any(|a| a == candidate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: String,
    pub is_free: bool,
}

/// A genre tag from the controlled vocabulary, or a custom escape-hatch tag
/// flagged separately from curated ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenreTag {
    pub name: String,
    pub curated: bool,
}

/// Canonical, deduplicated occurrence. Content hash is the exact-duplicate
/// key: unique among active events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<Uuid>,
    pub title: String,
    pub event_day: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    /// One event per (title, venue, date); same-day repeat showings land here
    /// instead of becoming separate rows.
    pub showtimes: Vec<NaiveTime>,
    pub venue_id: Uuid,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    /// Cleared once the event joins a series; tags then live on the series.
    pub genres: Vec<GenreTag>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub price: Option<PriceRange>,
    /// Hex SHA-256 over normalized title + venue id + event day.
    pub content_hash: String,
    pub series_id: Option<Uuid>,
    /// Contributing sources, creator first.
    pub source_ids: Vec<String>,
    /// Manually corrected fields; merges never overwrite these.
    pub locked_fields: Vec<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn is_locked(&self, field: &str) -> bool {
        self.locked_fields.iter().any(|f| f == field)
    }

    pub fn attribute_source(&mut self, source_id: &str) {
        if !self.source_ids.iter().any(|s| s == source_id) {
            self.source_ids.push(source_id.to_string());
        }
    }
}

/// Observed repetition pattern of a series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Cadence {
    pub weekday: Weekday,
    /// Days between occurrences: 7 weekly, 14 biweekly, 28+ treated monthly.
    pub interval_days: i64,
}

impl Cadence {
    pub fn describe(&self) -> String {
        let day = match self.weekday {
            Weekday::Mon => "Mondays",
            Weekday::Tue => "Tuesdays",
            Weekday::Wed => "Wednesdays",
            Weekday::Thu => "Thursdays",
            Weekday::Fri => "Fridays",
            Weekday::Sat => "Saturdays",
            Weekday::Sun => "Sundays",
        };
        match self.interval_days {
            7 => format!("weekly on {}", day),
            14 => format!("every 2 weeks on {}", day),
            n if n >= 28 => format!("monthly on {}", day),
            n => format!("every {} days on {}", n, day),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SeriesState {
    /// Two occurrences seen; not yet materialized as a full series.
    Candidate,
    /// Third occurrence confirmed the pattern.
    Active,
    /// No new occurrence for the configured number of expected cycles.
    /// Keeps its members; just stops being the default join target.
    Closed,
}

/// Recurring-event grouping. Requires at least 2 member occurrences before
/// materialization; genres/category live here, not on members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: Option<Uuid>,
    pub title: String,
    pub title_normalized: String,
    pub venue_id: Uuid,
    pub cadence: Cadence,
    /// Human-readable recurrence, e.g. "weekly on Wednesdays".
    pub recurrence: String,
    pub member_event_ids: Vec<Uuid>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub genres: Vec<GenreTag>,
    pub state: SeriesState,
    pub last_occurrence: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Per-run outcome counts. Duplicates are expected steady state and counted
/// apart from true errors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    pub found: u64,
    pub new: u64,
    pub updated: u64,
    pub duplicate: u64,
    pub rejected: u64,
}

/// Record of one ingestion pass for one source. Immutable once finalized;
/// exists purely for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: Option<Uuid>,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: RunCounts,
    /// Bounded sample of per-record error reasons.
    pub error_samples: Vec<String>,
}

impl CrawlRun {
    pub fn start(source_id: &str) -> Self {
        Self {
            id: None,
            source_id: source_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            counts: RunCounts::default(),
            error_samples: Vec::new(),
        }
    }
}
