//! facematch-core — Face embedding registry and nearest-label matcher.
//!
//! Labeled reference embeddings accumulate in a [`Registry`]. A [`Matcher`]
//! is an immutable snapshot of that registry and resolves query embeddings
//! to the closest label, or to unknown when nothing is within the distance
//! threshold. A [`Session`] holds the faces detected in the current image
//! and tracks which one is selected.

pub mod error;
pub mod matcher;
pub mod profile;
pub mod registry;
pub mod session;
pub mod types;

pub use error::FaceError;
pub use matcher::{Aggregation, Matcher, MatcherConfig, DEFAULT_DISTANCE_THRESHOLD};
pub use profile::{Profile, ProfileLookup};
pub use registry::Registry;
pub use session::{DetectedFace, FaceView, Session};
pub use types::{BoundingBox, Embedding, Label, MatchResult};
