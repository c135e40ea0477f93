//! Faces detected in the current image and the user's selection among them.

use crate::error::FaceError;
use crate::matcher::{Matcher, DEFAULT_DISTANCE_THRESHOLD};
use crate::profile::ProfileLookup;
use crate::types::{BoundingBox, Embedding, MatchResult};
use serde::Serialize;
use std::sync::Arc;

/// One face from the current image with its match result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedFace<B = BoundingBox> {
    pub bounding_box: B,
    pub embedding: Embedding,
    pub result: MatchResult,
}

/// What a renderer needs to draw one face.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FaceView<'a, B = BoundingBox> {
    pub bounding_box: &'a B,
    pub result: &'a MatchResult,
    pub is_selected: bool,
}

/// Per-image detection state.
///
/// Matching uses whichever snapshot was last installed with
/// [`install_matcher`](Self::install_matcher); installing a new one does not
/// re-match the current faces until [`rematch`](Self::rematch) is called.
#[derive(Debug, Clone)]
pub struct Session<B = BoundingBox> {
    faces: Vec<DetectedFace<B>>,
    selected: Option<usize>,
    matcher: Option<Arc<Matcher>>,
}

impl<B> Default for Session<B> {
    fn default() -> Self {
        Self {
            faces: Vec::new(),
            selected: None,
            matcher: None,
        }
    }
}

impl<B> Session<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matcher(matcher: Arc<Matcher>) -> Self {
        Self {
            matcher: Some(matcher),
            ..Self::default()
        }
    }

    pub fn install_matcher(&mut self, matcher: Arc<Matcher>) {
        self.matcher = Some(matcher);
    }

    pub fn matcher(&self) -> Option<&Arc<Matcher>> {
        self.matcher.as_ref()
    }

    /// Replace the face list with a new image's detections and match each
    /// face. Clears the selection.
    ///
    /// If any embedding has the wrong dimension the call fails and the
    /// session keeps its previous faces and selection.
    pub fn set_detections(
        &mut self,
        faces: impl IntoIterator<Item = (B, Embedding)>,
    ) -> Result<(), FaceError> {
        let (boxes, embeddings): (Vec<B>, Vec<Embedding>) = faces.into_iter().unzip();
        let results = self.match_all(&embeddings)?;

        self.faces = boxes
            .into_iter()
            .zip(embeddings)
            .zip(results)
            .map(|((bounding_box, embedding), result)| DetectedFace {
                bounding_box,
                embedding,
                result,
            })
            .collect();
        self.selected = None;

        tracing::debug!(
            faces = self.faces.len(),
            recognized = self.faces.iter().filter(|f| !f.result.is_unknown()).count(),
            "detections replaced"
        );
        Ok(())
    }

    /// Recompute every face's result with the installed snapshot. The
    /// selection is kept.
    pub fn rematch(&mut self) -> Result<(), FaceError> {
        let embeddings: Vec<Embedding> = self.faces.iter().map(|f| f.embedding.clone()).collect();
        let results = self.match_all(&embeddings)?;
        for (face, result) in self.faces.iter_mut().zip(results) {
            face.result = result;
        }
        Ok(())
    }

    fn match_all(&self, embeddings: &[Embedding]) -> Result<Vec<MatchResult>, FaceError> {
        match &self.matcher {
            Some(matcher) => matcher.best_match_all(embeddings),
            None => Ok(embeddings
                .iter()
                .map(|_| MatchResult::Unknown {
                    best_distance: DEFAULT_DISTANCE_THRESHOLD,
                })
                .collect()),
        }
    }

    pub fn select(&mut self, index: usize) -> Result<(), FaceError> {
        if index >= self.faces.len() {
            return Err(FaceError::IndexOutOfRange {
                index,
                len: self.faces.len(),
            });
        }
        self.selected = Some(index);
        Ok(())
    }

    /// Drop every face and the selection; the installed snapshot stays.
    pub fn clear(&mut self) {
        self.faces.clear();
        self.selected = None;
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    pub fn selected(&self) -> Option<&DetectedFace<B>> {
        self.selected.and_then(|i| self.faces.get(i))
    }

    /// Embedding of the selected face, for enrolling it under a new label.
    pub fn selected_embedding(&self) -> Option<&Embedding> {
        self.selected().map(|f| &f.embedding)
    }

    /// Profile for the selected face's label, if a face is selected, it
    /// matched a label and `lookup` knows that label.
    pub fn selected_profile<P>(&self, lookup: &impl ProfileLookup<P>) -> Option<P> {
        let label = self.selected()?.result.label()?;
        lookup.lookup(label)
    }

    pub fn faces(&self) -> &[DetectedFace<B>] {
        &self.faces
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Faces in detection order with their selection state.
    pub fn render(&self) -> impl Iterator<Item = FaceView<'_, B>> + '_ {
        self.faces.iter().enumerate().map(move |(i, face)| FaceView {
            bounding_box: &face.bounding_box,
            result: &face.result,
            is_selected: self.selected == Some(i),
        })
    }
}
