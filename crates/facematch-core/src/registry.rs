//! Append-only registry of labeled reference embeddings.

use crate::error::FaceError;
use crate::types::{Embedding, Label};
use std::collections::HashMap;

/// Label → reference embeddings, in enrollment order.
///
/// The first enrollment fixes the embedding dimension for the whole
/// registry. Entries are never empty. Every successful mutation bumps
/// [`generation`](Self::generation), which matcher snapshots use to report
/// staleness.
///
/// The registry itself is not synchronized; hosts that share it between
/// threads must funnel mutation through a single writer.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<(Label, Vec<Embedding>)>,
    index: HashMap<Label, usize>,
    dimension: Option<usize>,
    generation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `embedding` to `label`, creating the entry if absent.
    pub fn enroll(&mut self, label: impl Into<Label>, embedding: Embedding) -> Result<(), FaceError> {
        self.enroll_many(label, [embedding]).map(|_| ())
    }

    /// Append all `embeddings` to `label`, or none of them.
    ///
    /// Returns the number of embeddings added. An empty input adds nothing
    /// and does not create an entry.
    pub fn enroll_many(
        &mut self,
        label: impl Into<Label>,
        embeddings: impl IntoIterator<Item = Embedding>,
    ) -> Result<usize, FaceError> {
        let embeddings: Vec<Embedding> = embeddings.into_iter().collect();
        let Some(expected) = self.validate(&embeddings)? else {
            return Ok(0);
        };

        let label = label.into();
        let added = embeddings.len();
        let existing = self.index.get(&label).copied();
        match existing {
            Some(i) => self.entries[i].1.extend(embeddings),
            None => {
                self.index.insert(label.clone(), self.entries.len());
                self.entries.push((label, embeddings));
            }
        }
        self.dimension = Some(expected);
        self.generation += 1;
        Ok(added)
    }

    /// Check `embeddings` against the registry's dimension without enrolling
    /// them. Returns the dimension they would be stored under, or `None` for
    /// an empty batch.
    pub fn validate(&self, embeddings: &[Embedding]) -> Result<Option<usize>, FaceError> {
        let Some(first) = embeddings.first() else {
            return Ok(None);
        };
        let expected = self.dimension.unwrap_or(first.len());
        match embeddings.iter().find(|e| e.len() != expected) {
            Some(bad) => Err(FaceError::DimensionMismatch {
                expected,
                actual: bad.len(),
            }),
            None => Ok(Some(expected)),
        }
    }

    /// Remove `label` and all of its embeddings.
    ///
    /// Snapshots built earlier keep matching against their own copy. Removing
    /// the last label releases the dimension.
    pub fn remove(&mut self, label: &str) -> bool {
        let Some(pos) = self.index.remove(label) else {
            return false;
        };
        self.entries.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        if self.entries.is_empty() {
            self.dimension = None;
        }
        self.generation += 1;
        true
    }

    /// Known labels in enrollment order. The iterator is cheap to clone and
    /// can be restarted by calling `labels()` again.
    pub fn labels(&self) -> impl Iterator<Item = &Label> + Clone + '_ {
        self.entries.iter().map(|(label, _)| label)
    }

    pub fn embeddings(&self, label: &str) -> Option<&[Embedding]> {
        self.index.get(label).map(|&i| self.entries[i].1.as_slice())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub(crate) fn entries(&self) -> &[(Label, Vec<Embedding>)] {
        &self.entries
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of reference embeddings across all labels.
    pub fn embedding_count(&self) -> usize {
        self.entries.iter().map(|(_, e)| e.len()).sum()
    }

    /// Dimension fixed by the first enrollment, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
