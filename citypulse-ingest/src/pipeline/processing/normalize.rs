use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use citypulse_core::domain::PriceRange;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::pipeline::utils::normalize_name;

/// A raw record handed over by a source adapter. Adapters fetch and
/// pre-parse; nothing beyond `source_id` and the raw content is assumed
/// reliable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub raw_content: String,
    /// Structured guess from the text-extraction model, when the adapter
    /// already ran extraction. Absent means the pipeline calls the
    /// extraction service itself.
    pub structured_guess: Option<Value>,
    pub extraction_confidence: Option<f64>,
}

/// Venue attributes carried by a candidate, before identity resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueHint {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl VenueHint {
    /// A usable venue description needs a name or at least an address
    /// fragment.
    pub fn is_described(&self) -> bool {
        self.name.as_deref().map_or(false, |n| !n.trim().is_empty())
            || self.address.as_deref().map_or(false, |a| !a.trim().is_empty())
    }
}

/// Schema-validated candidate produced by extraction. Exists only for the
/// duration of one ingestion pass; never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub title: String,
    pub title_normalized: String,
    /// Calendar day in the event's own locale; dedup keys on this.
    pub event_day: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub showtimes: Vec<NaiveTime>,
    /// Canonical timezone-aware instant. When the source supplied no offset
    /// the local wall-clock time is taken as-is and a warning is recorded.
    pub start_utc: DateTime<Utc>,
    pub venue: VenueHint,
    pub price: Option<PriceRange>,
    pub category_hint: Option<String>,
    pub genre_hints: Vec<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub recurrence_hint: Option<String>,
    pub source_id: String,
    pub extraction_confidence: f64,
    /// Back-dated relative to the crawl; flagged, not rejected, because some
    /// back-dated corrections are legitimate.
    pub past_dated: bool,
    pub warnings: Vec<String>,
}

/// Typed rejection from the extraction normalizer. These are expected
/// per-record outcomes, counted and sampled, never run failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionRejection {
    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("unparsable date: {0}")]
    UnparsableDate(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("extraction confidence {confidence:.2} below floor {floor:.2}")]
    LowConfidence { confidence: f64, floor: f64 },
}

impl ExtractionRejection {
    /// Stable label for counting rejections by kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionRejection::MissingRequiredField(_) => "missing_required_field",
            ExtractionRejection::UnparsableDate(_) => "unparsable_date",
            ExtractionRejection::SchemaViolation(_) => "schema_violation",
            ExtractionRejection::LowConfidence { .. } => "low_confidence",
        }
    }
}

/// External text-extraction model boundary. Calls may be slow or
/// rate-limited; the orchestrator awaits them under a bounded timeout and
/// maps a timeout to a per-record rejection.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(&self, raw_content: &str) -> anyhow::Result<Value>;
}

static GUESS_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema: Value =
        serde_json::from_str(include_str!("../../../schemas/candidate_event.v1.json"))
            .expect("embedded candidate schema is valid JSON");
    let schema: &'static Value = Box::leak(Box::new(schema));
    JSONSchema::options()
        .compile(schema)
        .expect("embedded candidate schema compiles")
});

/// Titles that mean "we don't know the title yet".
const PLACEHOLDER_TITLES: &[&str] = &[
    "tba",
    "tbd",
    "coming soon",
    "to be announced",
    "to be determined",
    "title tba",
];

/// Turns a raw source record plus its structured extraction guess into a
/// validated candidate or a typed rejection. Pure: all persistence happens
/// downstream.
pub struct ExtractionNormalizer {
    confidence_floor: f64,
}

impl ExtractionNormalizer {
    pub fn new(confidence_floor: f64) -> Self {
        Self { confidence_floor }
    }

    pub fn normalize(
        &self,
        record: &RawRecord,
        guess: &Value,
        crawl_day: NaiveDate,
    ) -> Result<CandidateEvent, ExtractionRejection> {
        if let Err(errors) = GUESS_SCHEMA.validate(guess) {
            let detail = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ExtractionRejection::SchemaViolation(detail));
        }

        let mut warnings = Vec::new();

        // Title: present, non-empty, not a known placeholder.
        let title = guess
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if title.is_empty() {
            return Err(ExtractionRejection::MissingRequiredField("title".to_string()));
        }
        let title_normalized = normalize_name(title);
        if PLACEHOLDER_TITLES.contains(&title_normalized.as_str()) {
            return Err(ExtractionRejection::MissingRequiredField(format!(
                "title is a placeholder: '{}'",
                title
            )));
        }

        // Start must resolve to a concrete calendar date.
        let start_raw = guess
            .get("start")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExtractionRejection::MissingRequiredField("start".to_string()))?;
        let parsed = parse_datetime(start_raw)
            .ok_or_else(|| ExtractionRejection::UnparsableDate(start_raw.to_string()))?;
        if !parsed.had_offset {
            warnings.push(format!(
                "start '{}' carried no timezone offset; using wall-clock time as-is",
                start_raw
            ));
        }

        let end_time = guess
            .get("end")
            .and_then(|v| v.as_str())
            .and_then(|raw| match parse_datetime(raw) {
                Some(end) if end.day == parsed.day => end.time,
                Some(_) => None,
                None => {
                    warnings.push(format!("ignoring unparsable end '{}'", raw));
                    None
                }
            })
            .filter(|end| match parsed.time {
                Some(start) if *end < start => {
                    warnings.push("end time precedes start time; dropped".to_string());
                    false
                }
                _ => true,
            });

        let showtimes = guess
            .get("showtimes")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        // Venue description: name or an address fragment.
        let venue = VenueHint {
            name: string_field(guess, &["venue", "name"]),
            address: string_field(guess, &["venue", "address"]),
            city: string_field(guess, &["venue", "city"]),
            latitude: number_field(guess, &["venue", "latitude"]),
            longitude: number_field(guess, &["venue", "longitude"]),
        };
        if !venue.is_described() {
            return Err(ExtractionRejection::MissingRequiredField(
                "venue name or address".to_string(),
            ));
        }

        // Better to drop a record than pollute the catalog with a low-quality
        // insertion.
        let extraction_confidence = record
            .extraction_confidence
            .or_else(|| guess.get("confidence").and_then(|v| v.as_f64()))
            .unwrap_or(1.0);
        if extraction_confidence < self.confidence_floor {
            return Err(ExtractionRejection::LowConfidence {
                confidence: extraction_confidence,
                floor: self.confidence_floor,
            });
        }

        let mut genre_hints: Vec<String> = guess
            .get("genres")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if genre_hints.len() > 3 {
            warnings.push(format!("truncating {} genre hints to 3", genre_hints.len()));
            genre_hints.truncate(3);
        }

        let past_dated = parsed.day < crawl_day;
        if past_dated {
            warnings.push(format!(
                "event day {} is before crawl day {}",
                parsed.day, crawl_day
            ));
        }

        Ok(CandidateEvent {
            title: title.to_string(),
            title_normalized,
            event_day: parsed.day,
            start_time: parsed.time,
            end_time,
            showtimes,
            start_utc: parsed.utc,
            venue,
            price: parse_price(guess.get("price")),
            category_hint: string_field(guess, &["category"]),
            genre_hints,
            description: string_field(guess, &["description"]),
            image_url: string_field(guess, &["image_url"]),
            recurrence_hint: string_field(guess, &["recurrence"]),
            source_id: record.source_id.clone(),
            extraction_confidence,
            past_dated,
            warnings,
        })
    }
}

struct ParsedStart {
    day: NaiveDate,
    time: Option<NaiveTime>,
    utc: DateTime<Utc>,
    had_offset: bool,
}

/// Accepts the date shapes sources actually emit: RFC 3339, naive
/// datetime, bare date, and US-style slashed dates.
fn parse_datetime(raw: &str) -> Option<ParsedStart> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(ParsedStart {
            day: dt.date_naive(),
            time: Some(dt.time()),
            utc: dt.with_timezone(&Utc),
            had_offset: true,
        });
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ParsedStart {
                day: naive.date(),
                time: Some(naive.time()),
                utc: naive.and_utc(),
                had_offset: false,
            });
        }
    }

    for format in ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y"] {
        if let Ok(day) = NaiveDate::parse_from_str(raw, format) {
            let midnight = day.and_hms_opt(0, 0, 0)?;
            return Some(ParsedStart {
                day,
                time: None,
                utc: midnight.and_utc(),
                had_offset: false,
            });
        }
    }

    None
}

fn string_field(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number_field(value: &Value, path: &[&str]) -> Option<f64> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_f64()
}

fn parse_price(value: Option<&Value>) -> Option<PriceRange> {
    let value = value?;
    if value.is_null() {
        return None;
    }
    let min = value.get("min").and_then(|v| v.as_f64());
    let max = value.get("max").and_then(|v| v.as_f64());
    let is_free = value
        .get("is_free")
        .and_then(|v| v.as_bool())
        .unwrap_or(max == Some(0.0));
    if min.is_none() && max.is_none() && !is_free {
        return None;
    }
    Some(PriceRange {
        min,
        max,
        currency: value
            .get("currency")
            .and_then(|v| v.as_str())
            .unwrap_or("USD")
            .to_string(),
        is_free,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_record() -> RawRecord {
        RawRecord {
            source_id: "test_source".to_string(),
            raw_content: "<html>...</html>".to_string(),
            structured_guess: None,
            extraction_confidence: Some(0.9),
        }
    }

    fn crawl_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn good_guess() -> Value {
        json!({
            "title": "Jazz Night",
            "start": "2026-03-05T20:00:00-08:00",
            "venue": { "name": "The Blue Room", "city": "portland" },
            "genres": ["jazz"],
            "description": "Weekly jazz showcase"
        })
    }

    #[test]
    fn test_normalizes_valid_guess() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let candidate = normalizer
            .normalize(&test_record(), &good_guess(), crawl_day())
            .unwrap();

        assert_eq!(candidate.title, "Jazz Night");
        assert_eq!(candidate.title_normalized, "jazz night");
        assert_eq!(candidate.event_day, NaiveDate::from_ymd_opt(2026, 3, 5).unwrap());
        assert_eq!(
            candidate.start_time,
            Some(NaiveTime::from_hms_opt(20, 0, 0).unwrap())
        );
        assert!(!candidate.past_dated);
        assert!(candidate.warnings.is_empty());
    }

    #[test]
    fn test_rejects_empty_title() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut guess = good_guess();
        guess["title"] = json!("   ");

        let err = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap_err();
        assert!(matches!(err, ExtractionRejection::MissingRequiredField(_)));
    }

    #[test]
    fn test_rejects_placeholder_title() {
        let normalizer = ExtractionNormalizer::new(0.5);
        for placeholder in ["TBA", "tbd", "Coming Soon"] {
            let mut guess = good_guess();
            guess["title"] = json!(placeholder);
            let err = normalizer
                .normalize(&test_record(), &guess, crawl_day())
                .unwrap_err();
            assert!(
                matches!(err, ExtractionRejection::MissingRequiredField(_)),
                "'{}' should be rejected",
                placeholder
            );
        }
    }

    #[test]
    fn test_rejects_unparsable_date() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut guess = good_guess();
        guess["start"] = json!("next Friday-ish");

        let err = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap_err();
        assert!(matches!(err, ExtractionRejection::UnparsableDate(_)));
    }

    #[test]
    fn test_rejects_schema_violation() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let guess = json!({ "title": 42, "start": "2026-03-05", "venue": {} });

        let err = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap_err();
        assert!(matches!(err, ExtractionRejection::SchemaViolation(_)));
    }

    #[test]
    fn test_rejects_missing_venue_description() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut guess = good_guess();
        guess["venue"] = json!({ "city": "portland" });

        let err = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap_err();
        assert!(matches!(err, ExtractionRejection::MissingRequiredField(_)));
    }

    #[test]
    fn test_rejects_low_confidence() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut record = test_record();
        record.extraction_confidence = Some(0.3);

        let err = normalizer
            .normalize(&record, &good_guess(), crawl_day())
            .unwrap_err();
        assert_eq!(
            err,
            ExtractionRejection::LowConfidence { confidence: 0.3, floor: 0.5 }
        );
    }

    #[test]
    fn test_past_date_flagged_not_rejected() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut guess = good_guess();
        guess["start"] = json!("2026-02-20");

        let candidate = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap();
        assert!(candidate.past_dated);
        assert!(!candidate.warnings.is_empty());
    }

    #[test]
    fn test_naive_datetime_gets_warning() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut guess = good_guess();
        guess["start"] = json!("2026-03-05 20:00");

        let candidate = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap();
        assert!(candidate
            .warnings
            .iter()
            .any(|w| w.contains("no timezone offset")));
    }

    #[test]
    fn test_address_fragment_is_enough_venue_description() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut guess = good_guess();
        guess["venue"] = json!({ "address": "1403 SE Belmont St" });

        let candidate = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap();
        assert!(candidate.venue.name.is_none());
        assert!(candidate.venue.is_described());
    }

    #[test]
    fn test_parses_price_and_free_flag() {
        let normalizer = ExtractionNormalizer::new(0.5);
        let mut guess = good_guess();
        guess["price"] = json!({ "min": 10.0, "max": 15.0 });

        let candidate = normalizer
            .normalize(&test_record(), &guess, crawl_day())
            .unwrap();
        let price = candidate.price.unwrap();
        assert_eq!(price.min, Some(10.0));
        assert_eq!(price.currency, "USD");
        assert!(!price.is_free);
    }
}
