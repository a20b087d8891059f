//! Single similarity-scoring seam for the whole pipeline.
//!
//! Venue resolution and near-duplicate detection both compare noisy strings;
//! routing every comparison through one scorer keeps accuracy tuning in one
//! place instead of scattered ad hoc call sites.

use strsim::{jaro_winkler, normalized_levenshtein};

/// Scores two already-normalized strings in [0.0, 1.0].
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;

    /// Threshold comparisons are inclusive: a score exactly at the threshold
    /// counts as a match.
    fn is_match(&self, a: &str, b: &str, threshold: f64) -> bool {
        self.score(a, b) >= threshold
    }
}

/// Default scorer for event titles: the best of normalized Levenshtein and
/// token-set overlap.
///
/// Levenshtein catches in-place typos and punctuation drift, token overlap
/// is robust to word reordering. Jaro-Winkler is deliberately absent here:
/// its shared-prefix bonus scores "Open Mic" vs "Open Mic Finals" above any
/// sane merge threshold, and those are different events.
pub struct DefaultScorer;

impl DefaultScorer {
    fn token_overlap(a: &str, b: &str) -> f64 {
        let tokens_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
        let tokens_b: std::collections::HashSet<&str> = b.split_whitespace().collect();

        if tokens_a.is_empty() && tokens_b.is_empty() {
            return 1.0;
        }
        if tokens_a.is_empty() || tokens_b.is_empty() {
            return 0.0;
        }

        let intersection = tokens_a.intersection(&tokens_b).count();
        let union = tokens_a.union(&tokens_b).count();
        intersection as f64 / union as f64
    }
}

impl SimilarityScorer for DefaultScorer {
    fn score(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        let lev = normalized_levenshtein(a, b);
        let tokens = Self::token_overlap(a, b);

        lev.max(tokens)
    }
}

/// Venue-name scorer: strips leading articles, then takes the best of
/// Jaro-Winkler, the default scorer, and token containment.
///
/// Venue naming drifts by decoration, not substance: "The Blue Room",
/// "Blue Room Lounge", and "Blue Room" are one place. Containment scores
/// the shared core instead of penalizing the extra words, and Jaro-Winkler's
/// prefix bonus helps "Crystal" find "Crystal Ballroom". Titles must NOT use
/// this scorer; "Open Mic" and "Open Mic Finals" are different events.
pub struct VenueNameScorer;

impl VenueNameScorer {
    fn strip_leading_article(s: &str) -> &str {
        for article in ["the ", "a ", "an "] {
            if let Some(rest) = s.strip_prefix(article) {
                return rest;
            }
        }
        s
    }

    fn token_containment(a: &str, b: &str) -> f64 {
        let tokens_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
        let tokens_b: std::collections::HashSet<&str> = b.split_whitespace().collect();

        let smaller = tokens_a.len().min(tokens_b.len());
        if smaller == 0 {
            return 0.0;
        }

        let intersection = tokens_a.intersection(&tokens_b).count();
        intersection as f64 / smaller as f64
    }
}

impl SimilarityScorer for VenueNameScorer {
    fn score(&self, a: &str, b: &str) -> f64 {
        let a = Self::strip_leading_article(a);
        let b = Self::strip_leading_article(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        let base = DefaultScorer.score(a, b).max(jaro_winkler(a, b));
        // Containment only counts when the shorter name has substance; a
        // single shared token between long names is noise.
        let containment = if a.split_whitespace().count().min(b.split_whitespace().count()) >= 2 {
            Self::token_containment(a, b)
        } else {
            0.0
        };

        base.max(containment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_strings_score_one() {
        let scorer = DefaultScorer;
        assert_eq!(scorer.score("the blue room", "the blue room"), 1.0);
    }

    #[test]
    fn test_empty_vs_nonempty_scores_zero() {
        let scorer = DefaultScorer;
        assert_eq!(scorer.score("", "the blue room"), 0.0);
    }

    #[test]
    fn test_close_variants_score_high() {
        let scorer = DefaultScorer;
        let score = scorer.score("the blue room", "blue room lounge");
        assert!(score >= 0.5, "variant score was {}", score);

        let score = scorer.score("jazz night", "jazz night");
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_unrelated_strings_score_low() {
        let scorer = DefaultScorer;
        let score = scorer.score("open mic comedy", "vinyl swap meet");
        assert!(score < 0.6, "unrelated score was {}", score);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        // is_match uses >=: a score exactly at the threshold matches, a score
        // epsilon below does not.
        struct FixedScorer(f64);
        impl SimilarityScorer for FixedScorer {
            fn score(&self, _: &str, _: &str) -> f64 {
                self.0
            }
        }

        assert!(FixedScorer(0.85).is_match("a", "b", 0.85));
        assert!(!FixedScorer(0.8499).is_match("a", "b", 0.85));
    }

    #[test]
    fn test_token_overlap_handles_reordering() {
        let scorer = DefaultScorer;
        let score = scorer.score("back bar at the crocodile", "the crocodile back bar");
        assert!(score >= 0.6, "reordered score was {}", score);
    }

    #[test]
    fn test_venue_scorer_ignores_leading_article() {
        let scorer = VenueNameScorer;
        assert_eq!(scorer.score("the blue room", "blue room"), 1.0);
    }

    #[test]
    fn test_venue_scorer_matches_decorated_variant() {
        let scorer = VenueNameScorer;
        let score = scorer.score("blue room lounge", "the blue room");
        assert!(score >= 0.88, "decorated variant scored {}", score);
    }

    #[test]
    fn test_venue_scorer_keeps_unrelated_names_apart() {
        let scorer = VenueNameScorer;
        let score = scorer.score("crystal ballroom", "doug fir lounge");
        assert!(score < 0.88, "unrelated venues scored {}", score);
    }

    #[test]
    fn test_default_scorer_does_not_conflate_title_supersets() {
        // The containment shortcut is venue-only; titles keep strict overlap.
        let venue = VenueNameScorer.score("open mic", "open mic finals");
        let title = DefaultScorer.score("open mic", "open mic finals");
        assert!(venue > title);
        assert!(title < 0.85, "title superset scored {}", title);
    }
}
