//! Nearest-label matching against an immutable registry snapshot.
//!
//! A [`Matcher`] copies the registry at build time and never observes later
//! enrollments. Rebuild it after every enrollment batch, before the next
//! recognition pass; [`Matcher::is_stale`] tells whether that is needed.

use crate::error::FaceError;
use crate::registry::Registry;
use crate::types::{Embedding, Label, MatchResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Euclidean distance threshold for normalized 128-d face descriptors.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

/// How the distances from a query to each of a label's reference embeddings
/// collapse into one distance for that label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Closest reference wins. A query matches a label if it resembles any
    /// one of its enrolled faces.
    #[default]
    Min,
    /// Average over all references.
    Mean,
}

impl Aggregation {
    /// `references` must be non-empty.
    fn distance(self, query: &Embedding, references: &[Embedding]) -> f32 {
        let distances = references.iter().map(|r| query.euclidean_distance(r));
        match self {
            Aggregation::Min => distances.fold(f32::INFINITY, f32::min),
            Aggregation::Mean => distances.sum::<f32>() / references.len() as f32,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Aggregation::Min => "min",
            Aggregation::Mean => "mean",
        })
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" => Ok(Aggregation::Min),
            "mean" => Ok(Aggregation::Mean),
            other => Err(format!("unknown aggregation {other:?} (expected min or mean)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Largest distance still accepted as a match (inclusive).
    pub threshold: f32,
    pub aggregation: Aggregation,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
            aggregation: Aggregation::Min,
        }
    }
}

/// Immutable snapshot of a registry plus a matching policy.
///
/// `best_match` takes `&self` and touches no shared mutable state, so one
/// snapshot can be shared behind an `Arc` and queried from many threads.
#[derive(Debug, Clone)]
pub struct Matcher {
    entries: Vec<(Label, Vec<Embedding>)>,
    dimension: Option<usize>,
    config: MatcherConfig,
    generation: u64,
}

impl Matcher {
    /// Snapshot `registry` with the given threshold and min aggregation.
    pub fn build(registry: &Registry, threshold: f32) -> Self {
        Self::with_config(
            registry,
            MatcherConfig {
                threshold,
                ..MatcherConfig::default()
            },
        )
    }

    pub fn with_config(registry: &Registry, config: MatcherConfig) -> Self {
        let entries = registry.entries().to_vec();
        tracing::debug!(
            labels = entries.len(),
            embeddings = registry.embedding_count(),
            threshold = config.threshold,
            aggregation = %config.aggregation,
            generation = registry.generation(),
            "built matcher snapshot"
        );
        Self {
            entries,
            dimension: registry.dimension(),
            config,
            generation: registry.generation(),
        }
    }

    /// Resolve `query` to the closest label.
    ///
    /// Exact distance ties go to the label enrolled first. That order is an
    /// implementation detail of one snapshot, not something to rely on.
    pub fn best_match(&self, query: &Embedding) -> Result<MatchResult, FaceError> {
        self.check_dimension(query)?;

        let mut best: Option<(&Label, f32)> = None;
        for (label, references) in &self.entries {
            let d = self.config.aggregation.distance(query, references);
            let better = match best {
                None => !d.is_nan(),
                Some((_, best_d)) => d < best_d,
            };
            if better {
                best = Some((label, d));
            }
        }

        let result = match best {
            Some((label, distance)) if distance <= self.config.threshold => MatchResult::Matched {
                label: label.clone(),
                distance,
            },
            Some((_, distance)) => MatchResult::Unknown {
                best_distance: distance,
            },
            // Empty snapshot: report the threshold as the distance.
            None => MatchResult::Unknown {
                best_distance: self.config.threshold,
            },
        };
        tracing::trace!(result = %result, "best match");
        Ok(result)
    }

    /// Match every query in parallel against this snapshot.
    ///
    /// Dimensions are checked up front, so the error returned is the one for
    /// the first bad query in input order and no matching work is done.
    pub fn best_match_all(&self, queries: &[Embedding]) -> Result<Vec<MatchResult>, FaceError> {
        for query in queries {
            self.check_dimension(query)?;
        }
        queries.par_iter().map(|q| self.best_match(q)).collect()
    }

    /// Whether `registry` changed since this snapshot was taken from it.
    pub fn is_stale(&self, registry: &Registry) -> bool {
        registry.generation() != self.generation
    }

    fn check_dimension(&self, query: &Embedding) -> Result<(), FaceError> {
        match self.dimension {
            Some(expected) if query.len() != expected => Err(FaceError::DimensionMismatch {
                expected,
                actual: query.len(),
            }),
            _ => Ok(()),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> + Clone + '_ {
        self.entries.iter().map(|(label, _)| label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    pub fn config(&self) -> MatcherConfig {
        self.config
    }

    /// Registry generation this snapshot was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::from(values)
    }

    // A at the origin, A' at distance 0.4, B at distance 0.9.
    fn alice_registry() -> Registry {
        let mut reg = Registry::new();
        reg.enroll("alice", emb(&[0.0, 0.0, 0.0])).unwrap();
        reg
    }

    #[test]
    fn test_enrolled_embedding_matches_itself() {
        let e = emb(&[0.12, -0.5, 0.33, 0.9]);
        let mut reg = Registry::new();
        reg.enroll("solo", e.clone()).unwrap();

        let result = Matcher::build(&reg, 0.6).best_match(&e).unwrap();
        assert_eq!(result, MatchResult::Matched { label: "solo".into(), distance: 0.0 });
        assert_eq!(result.confidence(), 1.0);
    }

    #[test]
    fn test_alice_scenario() {
        let matcher = Matcher::build(&alice_registry(), 0.6);

        let exact = matcher.best_match(&emb(&[0.0, 0.0, 0.0])).unwrap();
        assert_eq!(exact.label().map(Label::as_str), Some("alice"));
        assert_eq!(exact.distance(), 0.0);

        let near = matcher.best_match(&emb(&[0.4, 0.0, 0.0])).unwrap();
        assert_eq!(near.label().map(Label::as_str), Some("alice"));
        assert!((near.distance() - 0.4).abs() < 1e-6);

        let far = matcher.best_match(&emb(&[0.0, 0.9, 0.0])).unwrap();
        assert!(far.is_unknown());
        assert!((far.distance() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let matcher = Matcher::build(&alice_registry(), 0.5);
        let at = matcher.best_match(&emb(&[0.5, 0.0, 0.0])).unwrap();
        assert!(!at.is_unknown());
        let over = matcher.best_match(&emb(&[0.5001, 0.0, 0.0])).unwrap();
        assert!(over.is_unknown());
    }

    #[test]
    fn test_empty_snapshot_is_unknown_at_threshold() {
        let matcher = Matcher::build(&Registry::new(), 0.6);
        assert!(matcher.is_empty());
        for query in [emb(&[0.0; 4]), emb(&[1.0; 128])] {
            let result = matcher.best_match(&query).unwrap();
            assert_eq!(result, MatchResult::Unknown { best_distance: 0.6 });
        }
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let matcher = Matcher::build(&alice_registry(), 0.6);
        let err = matcher.best_match(&emb(&[0.0, 0.0])).unwrap_err();
        assert_eq!(err, FaceError::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_picks_closest_label() {
        let mut reg = Registry::new();
        reg.enroll("alice", emb(&[1.0, 0.0])).unwrap();
        reg.enroll("bob", emb(&[0.0, 1.0])).unwrap();
        reg.enroll("carol", emb(&[-1.0, 0.0])).unwrap();

        let matcher = Matcher::build(&reg, 0.6);
        let result = matcher.best_match(&emb(&[0.1, 0.9])).unwrap();
        assert_eq!(result.label().map(Label::as_str), Some("bob"));
    }

    #[test]
    fn test_tie_goes_to_first_enrolled() {
        let mut reg = Registry::new();
        reg.enroll("first", emb(&[1.0, 0.0])).unwrap();
        reg.enroll("second", emb(&[-1.0, 0.0])).unwrap();

        let result = Matcher::build(&reg, 2.0).best_match(&emb(&[0.0, 0.0])).unwrap();
        assert_eq!(result.label().map(Label::as_str), Some("first"));
    }

    #[test]
    fn test_min_aggregation_uses_closest_reference() {
        let mut reg = Registry::new();
        reg.enroll("alice", emb(&[0.0, 0.0])).unwrap();
        let query = emb(&[1.0, 1.0]);

        let before = Matcher::build(&reg, 0.6).best_match(&query).unwrap();
        assert!(before.is_unknown());

        // A second, closer reference can only lower the label distance.
        reg.enroll("alice", emb(&[0.9, 0.9])).unwrap();
        let after = Matcher::build(&reg, 0.6).best_match(&query).unwrap();
        assert_eq!(after.label().map(Label::as_str), Some("alice"));
        assert!(after.distance() <= before.distance());

        // And a farther one never raises it.
        reg.enroll("alice", emb(&[-5.0, -5.0])).unwrap();
        let again = Matcher::build(&reg, 0.6).best_match(&query).unwrap();
        assert_eq!(again.distance(), after.distance());
    }

    #[test]
    fn test_extra_enrollment_keeps_exact_match() {
        let a = emb(&[0.3, 0.3]);
        let mut reg = Registry::new();
        reg.enroll("alice", a.clone()).unwrap();
        reg.enroll("alice", emb(&[0.8, 0.1])).unwrap();
        reg.enroll("bob", emb(&[0.3, 0.31])).unwrap();

        let result = Matcher::build(&reg, 0.6).best_match(&a).unwrap();
        assert_eq!(result, MatchResult::Matched { label: "alice".into(), distance: 0.0 });
    }

    #[test]
    fn test_mean_aggregation() {
        let mut reg = Registry::new();
        reg.enroll_many("alice", vec![emb(&[0.0, 0.0]), emb(&[2.0, 0.0])]).unwrap();
        let config = MatcherConfig { threshold: 0.6, aggregation: Aggregation::Mean };

        let result = Matcher::with_config(&reg, config).best_match(&emb(&[0.0, 0.0])).unwrap();
        assert!(result.is_unknown());
        assert!((result.distance() - 1.0).abs() < 1e-6);

        let min = Matcher::build(&reg, 0.6).best_match(&emb(&[0.0, 0.0])).unwrap();
        assert_eq!(min.distance(), 0.0);
    }

    #[test]
    fn test_snapshot_ignores_later_enrollments() {
        let mut reg = alice_registry();
        let matcher = Matcher::build(&reg, 0.6);
        assert!(!matcher.is_stale(&reg));

        reg.enroll("bob", emb(&[5.0, 5.0, 5.0])).unwrap();
        assert!(matcher.is_stale(&reg));
        let result = matcher.best_match(&emb(&[5.0, 5.0, 5.0])).unwrap();
        assert!(result.is_unknown());

        let rebuilt = Matcher::build(&reg, 0.6);
        let result = rebuilt.best_match(&emb(&[5.0, 5.0, 5.0])).unwrap();
        assert_eq!(result.label().map(Label::as_str), Some("bob"));
    }

    #[test]
    fn test_snapshot_survives_removal() {
        let mut reg = alice_registry();
        let matcher = Matcher::build(&reg, 0.6);
        reg.remove("alice");

        let result = matcher.best_match(&emb(&[0.0, 0.0, 0.0])).unwrap();
        assert_eq!(result.label().map(Label::as_str), Some("alice"));
        assert!(Matcher::build(&reg, 0.6).best_match(&emb(&[0.0, 0.0, 0.0])).unwrap().is_unknown());
    }

    #[test]
    fn test_build_is_idempotent() {
        let mut reg = Registry::new();
        reg.enroll("alice", emb(&[0.1, 0.2])).unwrap();
        reg.enroll("bob", emb(&[0.7, -0.2])).unwrap();
        reg.enroll("alice", emb(&[0.2, 0.1])).unwrap();

        let m1 = Matcher::build(&reg, 0.6);
        let m2 = Matcher::build(&reg, 0.6);
        for q in [[0.0, 0.0], [0.5, 0.0], [0.7, -0.1], [3.0, 3.0]] {
            let q = emb(&q);
            assert_eq!(m1.best_match(&q).unwrap(), m2.best_match(&q).unwrap());
        }
    }

    #[test]
    fn test_best_match_all_matches_sequential() {
        let mut reg = Registry::new();
        reg.enroll("alice", emb(&[1.0, 0.0])).unwrap();
        reg.enroll("bob", emb(&[0.0, 1.0])).unwrap();
        let matcher = Matcher::build(&reg, 0.6);

        let queries: Vec<Embedding> = (0..64)
            .map(|i| emb(&[(i as f32) / 64.0, 1.0 - (i as f32) / 64.0]))
            .collect();
        let batch = matcher.best_match_all(&queries).unwrap();
        let sequential: Vec<MatchResult> =
            queries.iter().map(|q| matcher.best_match(q).unwrap()).collect();
        assert_eq!(batch, sequential);
    }

    #[test]
    fn test_best_match_all_reports_first_bad_query() {
        let matcher = Matcher::build(&alice_registry(), 0.6);
        let queries = vec![emb(&[0.0; 3]), emb(&[0.0; 5]), emb(&[0.0; 1])];
        let err = matcher.best_match_all(&queries).unwrap_err();
        assert_eq!(err, FaceError::DimensionMismatch { expected: 3, actual: 5 });
    }

    #[test]
    fn test_aggregation_from_str() {
        assert_eq!("MIN".parse::<Aggregation>().unwrap(), Aggregation::Min);
        assert_eq!(" mean ".parse::<Aggregation>().unwrap(), Aggregation::Mean);
        assert!("median".parse::<Aggregation>().is_err());
    }
}
