use anyhow::{Context, Result};
use citypulse_core::domain::{GenreTag, VenueType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Versioned controlled vocabulary passed into inference explicitly, never a
/// hidden global, so tests can run against a controlled vocabulary and
/// vocabulary changes are auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    pub version: String,
    pub categories: Vec<String>,
    /// Valid subcategories per category.
    pub subcategories: HashMap<String, Vec<String>>,
    pub curated_genres: Vec<String>,
    pub keyword_rules: Vec<KeywordRule>,
    /// Fallback category by venue type, e.g. a comedy club defaults
    /// ambiguous events to comedy.
    pub venue_type_defaults: HashMap<String, String>,
    /// Signals below this confidence route to the `other` bucket instead of
    /// guessing a specific wrong category.
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Case-insensitive regex applied to title + description.
    pub pattern: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub genres: Vec<String>,
    pub confidence: f64,
}

impl TaxonomyConfig {
    /// The curated production vocabulary.
    pub fn default_vocabulary() -> Self {
        let mut subcategories = HashMap::new();
        subcategories.insert(
            "music".to_string(),
            vec!["live-music".to_string(), "dj".to_string(), "open-mic".to_string()],
        );
        subcategories.insert(
            "education".to_string(),
            vec!["class".to_string(), "workshop".to_string(), "lecture".to_string()],
        );
        subcategories.insert(
            "community".to_string(),
            vec!["market".to_string(), "meeting".to_string(), "volunteering".to_string()],
        );
        subcategories.insert(
            "film".to_string(),
            vec!["screening".to_string(), "festival".to_string()],
        );

        let mut venue_type_defaults = HashMap::new();
        venue_type_defaults.insert("MusicVenue".to_string(), "music".to_string());
        venue_type_defaults.insert("ComedyClub".to_string(), "comedy".to_string());
        venue_type_defaults.insert("Theater".to_string(), "theater".to_string());
        venue_type_defaults.insert("Gallery".to_string(), "arts".to_string());
        venue_type_defaults.insert("CommunitySpace".to_string(), "community".to_string());

        Self {
            version: "2026.1".to_string(),
            categories: [
                "music", "comedy", "theater", "film", "arts", "food-drink", "community",
                "education", "sports", "other",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            subcategories,
            curated_genres: [
                "jazz", "rock", "indie", "hip-hop", "electronic", "folk", "classical",
                "punk", "country", "metal", "soul", "standup", "improv", "documentary",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            keyword_rules: vec![
                KeywordRule {
                    pattern: r"\b(jazz|quartet|trio|big band)\b".to_string(),
                    category: "music".to_string(),
                    subcategory: Some("live-music".to_string()),
                    genres: vec!["jazz".to_string()],
                    confidence: 0.85,
                },
                KeywordRule {
                    pattern: r"\b(dj|dance party|club night)\b".to_string(),
                    category: "music".to_string(),
                    subcategory: Some("dj".to_string()),
                    genres: vec!["electronic".to_string()],
                    confidence: 0.8,
                },
                KeywordRule {
                    pattern: r"\b(comedy|stand-?up|improv|open mic comedy)\b".to_string(),
                    category: "comedy".to_string(),
                    subcategory: None,
                    genres: vec!["standup".to_string()],
                    confidence: 0.85,
                },
                KeywordRule {
                    pattern: r"\b(film|screening|cinema|matinee|double feature)\b".to_string(),
                    category: "film".to_string(),
                    subcategory: Some("screening".to_string()),
                    genres: Vec::new(),
                    confidence: 0.8,
                },
                KeywordRule {
                    pattern: r"\b(farmers market|night market|flea market|bazaar)\b".to_string(),
                    category: "community".to_string(),
                    subcategory: Some("market".to_string()),
                    genres: Vec::new(),
                    confidence: 0.85,
                },
                KeywordRule {
                    pattern: r"\b(workshop|class|course|lesson|seminar)\b".to_string(),
                    category: "education".to_string(),
                    subcategory: Some("workshop".to_string()),
                    genres: Vec::new(),
                    confidence: 0.75,
                },
                KeywordRule {
                    pattern: r"\b(gallery|exhibit|opening reception|art walk)\b".to_string(),
                    category: "arts".to_string(),
                    subcategory: None,
                    genres: Vec::new(),
                    confidence: 0.75,
                },
                KeywordRule {
                    pattern: r"\b(trivia|quiz night|book club)\b".to_string(),
                    category: "community".to_string(),
                    subcategory: Some("meeting".to_string()),
                    genres: Vec::new(),
                    confidence: 0.7,
                },
            ],
            venue_type_defaults,
            min_confidence: 0.55,
        }
    }
}

/// Which signal decided the category. Precedence is fixed: an explicit
/// source hint beats keyword rules, which beat the venue-type default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonomySignal {
    SourceHint,
    Keyword,
    VenueDefault,
    None,
}

#[derive(Debug, Clone)]
pub struct TaxonomyAssignment {
    pub category: String,
    pub subcategory: Option<String>,
    /// At most 3, curated tags preferred over custom ones.
    pub genres: Vec<GenreTag>,
    pub confidence: f64,
    pub signal: TaxonomySignal,
    /// Set when no signal cleared the minimum bar and the event was routed
    /// to `other`.
    pub low_confidence: bool,
    pub vocabulary_version: String,
}

pub struct TaxonomyInference {
    config: TaxonomyConfig,
    compiled_rules: Vec<Regex>,
}

impl TaxonomyInference {
    pub fn new(config: TaxonomyConfig) -> Result<Self> {
        let compiled_rules = config
            .keyword_rules
            .iter()
            .map(|rule| {
                Regex::new(&format!("(?i){}", rule.pattern))
                    .with_context(|| format!("invalid keyword pattern '{}'", rule.pattern))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, compiled_rules })
    }

    pub fn vocabulary_version(&self) -> &str {
        &self.config.version
    }

    pub fn infer(
        &self,
        title: &str,
        description: Option<&str>,
        category_hint: Option<&str>,
        genre_hints: &[String],
        venue_type: VenueType,
    ) -> TaxonomyAssignment {
        let mut rule_genres: Vec<String> = Vec::new();

        // 1. Explicit, well-formed hint from the source adapter.
        let decided = if let Some(category) = self.well_formed_hint(category_hint) {
            Some((category, None, 0.95, TaxonomySignal::SourceHint))
        } else {
            // 2. Keyword rules over title + description.
            self.best_keyword_match(title, description)
                .map(|rule| {
                    rule_genres = rule.genres.clone();
                    (
                        rule.category.clone(),
                        rule.subcategory.clone(),
                        rule.confidence,
                        TaxonomySignal::Keyword,
                    )
                })
                // 3. Venue-type default.
                .or_else(|| {
                    self.venue_default(venue_type).map(|category| {
                        (category, None, 0.6, TaxonomySignal::VenueDefault)
                    })
                })
        };

        let (category, subcategory, confidence, signal) = match decided {
            Some((category, subcategory, confidence, signal))
                if confidence >= self.config.min_confidence =>
            {
                (category, subcategory, confidence, signal)
            }
            // No signal cleared the bar: uncategorized beats wrongly
            // categorized.
            weak => {
                let confidence = weak.map(|(_, _, c, _)| c).unwrap_or(0.0);
                debug!(%title, confidence, "no taxonomy signal cleared the bar");
                crate::observability::metrics::taxonomy::low_confidence();
                return TaxonomyAssignment {
                    category: "other".to_string(),
                    subcategory: None,
                    genres: self.collect_genres(genre_hints, &[]),
                    confidence,
                    signal: TaxonomySignal::None,
                    low_confidence: true,
                    vocabulary_version: self.config.version.clone(),
                };
            }
        };

        let subcategory = subcategory.filter(|sub| {
            self.config
                .subcategories
                .get(&category)
                .map_or(false, |valid| valid.contains(sub))
        });

        crate::observability::metrics::taxonomy::assigned(&category);
        TaxonomyAssignment {
            genres: self.collect_genres(genre_hints, &rule_genres),
            category,
            subcategory,
            confidence,
            signal,
            low_confidence: false,
            vocabulary_version: self.config.version.clone(),
        }
    }

    fn well_formed_hint(&self, hint: Option<&str>) -> Option<String> {
        let hint = hint?.trim().to_lowercase();
        self.config
            .categories
            .iter()
            .find(|c| **c == hint)
            .cloned()
    }

    fn best_keyword_match(&self, title: &str, description: Option<&str>) -> Option<&KeywordRule> {
        let haystack = match description {
            Some(description) => format!("{} {}", title, description),
            None => title.to_string(),
        };

        self.config
            .keyword_rules
            .iter()
            .zip(&self.compiled_rules)
            .filter(|(_, regex)| regex.is_match(&haystack))
            .map(|(rule, _)| rule)
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    fn venue_default(&self, venue_type: VenueType) -> Option<String> {
        let key = format!("{:?}", venue_type);
        self.config.venue_type_defaults.get(&key).cloned()
    }

    /// Merge genre hints with rule genres: curated vocabulary entries first,
    /// custom tags flagged and kept only while room remains, 3 at most.
    fn collect_genres(&self, hints: &[String], rule_genres: &[String]) -> Vec<GenreTag> {
        let mut tags: Vec<GenreTag> = Vec::new();
        let mut push = |name: &str, tags: &mut Vec<GenreTag>| {
            let normalized = name.trim().to_lowercase();
            if normalized.is_empty()
                || tags.iter().any(|t: &GenreTag| t.name == normalized)
            {
                return;
            }
            let curated = self.config.curated_genres.contains(&normalized);
            tags.push(GenreTag { name: normalized, curated });
        };

        for name in rule_genres.iter().chain(hints.iter()) {
            push(name, &mut tags);
        }

        tags.sort_by_key(|t| !t.curated);
        tags.truncate(3);
        tags
    }
}
