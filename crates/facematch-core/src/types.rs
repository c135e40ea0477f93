use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Bounding box for a detected face, in the detector's pixel coordinates.
///
/// The core never inspects it; it is carried alongside the match result so
/// the renderer can draw it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1], if the detector reports one.
    #[serde(default)]
    pub score: Option<f32>,
}

/// Face embedding vector (128-dimensional for the usual face descriptor nets).
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers are responsible for checking that both sides share a dimension;
    /// extra trailing values on either side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

impl From<&[f32]> for Embedding {
    fn from(values: &[f32]) -> Self {
        Self::new(values.to_vec())
    }
}

/// Identifier of an enrolled person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for Label {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Result of matching a query embedding against a matcher snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchResult {
    /// The closest label lies within the distance threshold.
    Matched { label: Label, distance: f32 },
    /// Nothing within the threshold. `best_distance` is the smallest distance
    /// seen, or the threshold itself when the snapshot was empty.
    Unknown { best_distance: f32 },
}

impl MatchResult {
    /// Text shown for results that matched no label.
    pub const UNKNOWN_LABEL: &'static str = "unknown";

    pub fn label(&self) -> Option<&Label> {
        match self {
            MatchResult::Matched { label, .. } => Some(label),
            MatchResult::Unknown { .. } => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, MatchResult::Unknown { .. })
    }

    pub fn distance(&self) -> f32 {
        match self {
            MatchResult::Matched { distance, .. } => *distance,
            MatchResult::Unknown { best_distance } => *best_distance,
        }
    }

    /// Display heuristic: `max(0, 1 - distance)`.
    ///
    /// Not a probability. Decide on [`label`](Self::label) and the distance,
    /// never on this value.
    pub fn confidence(&self) -> f32 {
        (1.0 - self.distance()).max(0.0)
    }

    /// Label with a rounded confidence percentage, e.g. `alice (60%)`.
    pub fn display_label(&self) -> String {
        let percent = (self.confidence() * 100.0).round() as u32;
        match self.label() {
            Some(label) => format!("{label} ({percent}%)"),
            None => format!("{} ({percent}%)", Self::UNKNOWN_LABEL),
        }
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.label().map_or(Self::UNKNOWN_LABEL, Label::as_str);
        write!(f, "{name} ({:.2})", self.distance())
    }
}
