use facematch_core::{
    BoundingBox, Embedding, FaceError, Label, MatchResult, Matcher, MatcherConfig, Profile,
    Registry, Session,
};
use facematch_store::{Store, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("no embeddings to enroll")]
    NoEmbeddings,
    #[error("embedding #{index} is empty")]
    EmptyEmbedding { index: usize },
    #[error("no face is selected")]
    NoSelection,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Knobs the engine thread runs with.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub matcher: MatcherConfig,
    pub rebuild_on_enroll: bool,
    pub queue_depth: usize,
}

/// Result of an enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub label: Label,
    pub added: usize,
    /// Reference embeddings now held for the label.
    pub total: usize,
    /// Whether the matcher snapshot was rebuilt to include them.
    pub rebuilt: bool,
}

/// One face of the current image as handed to renderers.
#[derive(Debug, Clone, Serialize)]
pub struct RecognizedFace {
    pub index: usize,
    pub bounding_box: BoundingBox,
    pub result: MatchResult,
    pub display_label: String,
    pub confidence: f32,
    pub is_selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelSummary {
    pub label: Label,
    pub embeddings: usize,
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub labels: usize,
    pub embeddings: usize,
    pub dimension: Option<usize>,
    pub registry_generation: u64,
    pub snapshot_generation: u64,
    /// The snapshot predates the latest enrollment or removal.
    pub stale: bool,
    pub matcher: MatcherConfig,
    pub faces: usize,
    pub selected: Option<usize>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        label: Label,
        embeddings: Vec<Embedding>,
        profile: Option<Profile>,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    EnrollSelected {
        profile: Profile,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Remove {
        label: Label,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Rebuild {
        reply: oneshot::Sender<EngineStatus>,
    },
    Recognize {
        faces: Vec<(BoundingBox, Embedding)>,
        reply: oneshot::Sender<Result<Vec<RecognizedFace>, EngineError>>,
    },
    Select {
        index: usize,
        reply: oneshot::Sender<Result<RecognizedFace, EngineError>>,
    },
    SelectedProfile {
        reply: oneshot::Sender<Option<Profile>>,
    },
    Labels {
        reply: oneshot::Sender<Vec<LabelSummary>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Enroll embeddings under `label`, optionally attaching a profile.
    pub async fn enroll(
        &self,
        label: Label,
        embeddings: Vec<Embedding>,
        profile: Option<Profile>,
    ) -> Result<EnrollOutcome, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            label,
            embeddings,
            profile,
            reply,
        })
        .await?
    }

    /// Enroll the selected face of the current image under `profile.name`.
    pub async fn enroll_selected(&self, profile: Profile) -> Result<EnrollOutcome, EngineError> {
        self.request(|reply| EngineRequest::EnrollSelected { profile, reply })
            .await?
    }

    pub async fn remove(&self, label: Label) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Remove { label, reply })
            .await?
    }

    /// Snapshot the registry as it is now and re-match the current image.
    pub async fn rebuild(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Rebuild { reply }).await
    }

    /// Replace the current image's detections and match them.
    pub async fn recognize(
        &self,
        faces: Vec<(BoundingBox, Embedding)>,
    ) -> Result<Vec<RecognizedFace>, EngineError> {
        self.request(|reply| EngineRequest::Recognize { faces, reply })
            .await?
    }

    pub async fn select(&self, index: usize) -> Result<RecognizedFace, EngineError> {
        self.request(|reply| EngineRequest::Select { index, reply })
            .await?
    }

    pub async fn selected_profile(&self) -> Result<Option<Profile>, EngineError> {
        self.request(|reply| EngineRequest::SelectedProfile { reply })
            .await
    }

    pub async fn labels(&self) -> Result<Vec<LabelSummary>, EngineError> {
        self.request(|reply| EngineRequest::Labels { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Everything the engine thread owns. Only that thread mutates it.
struct EngineState {
    store: Store,
    registry: Registry,
    profiles: HashMap<Label, Profile>,
    matcher: Arc<Matcher>,
    session: Session,
    settings: EngineSettings,
}

impl EngineState {
    fn load(store: Store, settings: EngineSettings) -> Result<Self, EngineError> {
        let registry = store.load_registry()?;
        let profiles = store.load_profiles()?;
        let matcher = Arc::new(Matcher::with_config(&registry, settings.matcher));
        let session = Session::with_matcher(Arc::clone(&matcher));
        Ok(Self {
            store,
            registry,
            profiles,
            matcher,
            session,
            settings,
        })
    }

    /// Snapshot the registry and re-match the current image against it.
    fn rebuild(&mut self) {
        self.matcher = Arc::new(Matcher::with_config(&self.registry, self.settings.matcher));
        self.session.install_matcher(Arc::clone(&self.matcher));
        if let Err(err) = self.session.rematch() {
            // The registry dimension changed under the current image.
            tracing::warn!(error = %err, "current detections no longer match; clearing them");
            self.session.clear();
        }
        tracing::info!(
            labels = self.matcher.len(),
            generation = self.matcher.generation(),
            faces = self.session.len(),
            "matcher snapshot rebuilt"
        );
    }

    fn enroll(
        &mut self,
        label: Label,
        embeddings: Vec<Embedding>,
        profile: Option<Profile>,
    ) -> Result<EnrollOutcome, EngineError> {
        if label.as_str().trim().is_empty() {
            return Err(EngineError::EmptyLabel);
        }
        if embeddings.is_empty() {
            return Err(EngineError::NoEmbeddings);
        }
        if let Some(index) = embeddings.iter().position(Embedding::is_empty) {
            return Err(EngineError::EmptyEmbedding { index });
        }
        // Validate and persist before touching in-memory state, so a failed
        // write leaves registry, profiles and store in agreement.
        self.registry.validate(&embeddings)?;
        self.store.enroll(&label, &embeddings, profile.as_ref())?;
        let added = self.registry.enroll_many(label.clone(), embeddings)?;
        if let Some(profile) = profile {
            self.profiles.insert(label.clone(), profile);
        }

        let rebuilt = self.settings.rebuild_on_enroll;
        if rebuilt {
            self.rebuild();
        }

        let total = self.registry.embeddings(label.as_str()).map_or(0, <[_]>::len);
        tracing::info!(label = %label, added, total, rebuilt, "enrolled");
        Ok(EnrollOutcome {
            label,
            added,
            total,
            rebuilt,
        })
    }

    fn enroll_selected(&mut self, profile: Profile) -> Result<EnrollOutcome, EngineError> {
        let embedding = self
            .session
            .selected_embedding()
            .cloned()
            .ok_or(EngineError::NoSelection)?;
        let label = profile.label();
        let outcome = self.enroll(label, vec![embedding], Some(profile))?;
        self.session.clear_selection();
        Ok(outcome)
    }

    fn remove(&mut self, label: &Label) -> Result<bool, EngineError> {
        let stored = self.store.remove_label(label.as_str())?;
        let known = self.registry.remove(label.as_str());
        self.profiles.remove(label);
        if known && self.settings.rebuild_on_enroll {
            self.rebuild();
        }
        tracing::info!(label = %label, removed = known || stored, "remove");
        Ok(known || stored)
    }

    fn recognize(&mut self, faces: Vec<(BoundingBox, Embedding)>) -> Result<Vec<RecognizedFace>, EngineError> {
        if self.matcher.is_stale(&self.registry) {
            tracing::warn!(
                snapshot = self.matcher.generation(),
                registry = self.registry.generation(),
                "recognizing against a stale snapshot; rebuild to include recent enrollments"
            );
        }
        self.session.set_detections(faces)?;
        let faces = self.rendered();
        tracing::info!(
            faces = faces.len(),
            recognized = faces.iter().filter(|f| !f.result.is_unknown()).count(),
            "recognize"
        );
        Ok(faces)
    }

    fn select(&mut self, index: usize) -> Result<RecognizedFace, EngineError> {
        self.session.select(index)?;
        self.rendered()
            .into_iter()
            .nth(index)
            .ok_or(EngineError::NoSelection)
    }

    fn rendered(&self) -> Vec<RecognizedFace> {
        self.session
            .render()
            .enumerate()
            .map(|(index, view)| RecognizedFace {
                index,
                bounding_box: *view.bounding_box,
                result: view.result.clone(),
                display_label: view.result.display_label(),
                confidence: view.result.confidence(),
                is_selected: view.is_selected,
            })
            .collect()
    }

    fn labels(&self) -> Vec<LabelSummary> {
        self.registry
            .labels()
            .map(|label| LabelSummary {
                label: label.clone(),
                embeddings: self.registry.embeddings(label.as_str()).map_or(0, <[_]>::len),
                profile: self.profiles.get(label).cloned(),
            })
            .collect()
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            labels: self.registry.len(),
            embeddings: self.registry.embedding_count(),
            dimension: self.registry.dimension(),
            registry_generation: self.registry.generation(),
            snapshot_generation: self.matcher.generation(),
            stale: self.matcher.is_stale(&self.registry),
            matcher: self.matcher.config(),
            faces: self.session.len(),
            selected: self.session.selected_index(),
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll {
                label,
                embeddings,
                profile,
                reply,
            } => {
                let _ = reply.send(self.enroll(label, embeddings, profile));
            }
            EngineRequest::EnrollSelected { profile, reply } => {
                let _ = reply.send(self.enroll_selected(profile));
            }
            EngineRequest::Remove { label, reply } => {
                let _ = reply.send(self.remove(&label));
            }
            EngineRequest::Rebuild { reply } => {
                self.rebuild();
                let _ = reply.send(self.status());
            }
            EngineRequest::Recognize { faces, reply } => {
                let _ = reply.send(self.recognize(faces));
            }
            EngineRequest::Select { index, reply } => {
                let _ = reply.send(self.select(index));
            }
            EngineRequest::SelectedProfile { reply } => {
                let _ = reply.send(self.session.selected_profile(&self.profiles));
            }
            EngineRequest::Labels { reply } => {
                let _ = reply.send(self.labels());
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the registry and profiles from `store` and builds the first
/// snapshot before returning, so a broken store fails startup. All registry,
/// store and session mutation afterwards happens on that one thread.
pub fn spawn_engine(store: Store, settings: EngineSettings) -> Result<EngineHandle, EngineError> {
    let mut state = EngineState::load(store, settings)?;
    tracing::info!(
        labels = state.registry.len(),
        embeddings = state.registry.embedding_count(),
        profiles = state.profiles.len(),
        threshold = settings.matcher.threshold,
        aggregation = %settings.matcher.aggregation,
        "engine state loaded"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(settings.queue_depth);

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                state.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facematch_core::Aggregation;

    fn settings(rebuild_on_enroll: bool) -> EngineSettings {
        EngineSettings {
            matcher: MatcherConfig {
                threshold: 0.6,
                aggregation: Aggregation::Min,
            },
            rebuild_on_enroll,
            queue_depth: 4,
        }
    }

    fn engine(rebuild_on_enroll: bool) -> EngineHandle {
        spawn_engine(Store::open_in_memory().unwrap(), settings(rebuild_on_enroll)).unwrap()
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::from(values)
    }

    fn bbox(x: f32) -> BoundingBox {
        BoundingBox { x, y: 0.0, width: 20.0, height: 20.0, score: None }
    }

    #[tokio::test]
    async fn test_enroll_recognize_select_profile() {
        let engine = engine(true);
        let outcome = engine
            .enroll("alice".into(), vec![emb(&[0.0, 0.0, 0.0])], Some(Profile::new("Alice")))
            .await
            .unwrap();
        assert_eq!(outcome.added, 1);
        assert!(outcome.rebuilt);

        let faces = engine
            .recognize(vec![(bbox(0.0), emb(&[0.4, 0.0, 0.0])), (bbox(40.0), emb(&[0.0, 0.9, 0.0]))])
            .await
            .unwrap();
        assert_eq!(faces[0].display_label, "alice (60%)");
        assert!(faces[1].result.is_unknown());

        let selected = engine.select(0).await.unwrap();
        assert!(selected.is_selected);
        assert_eq!(engine.selected_profile().await.unwrap(), Some(Profile::new("Alice")));

        engine.select(1).await.unwrap();
        assert_eq!(engine.selected_profile().await.unwrap(), None);

        let err = engine.select(5).await.unwrap_err();
        assert!(matches!(err, EngineError::Face(FaceError::IndexOutOfRange { index: 5, len: 2 })));
        assert_eq!(engine.status().await.unwrap().selected, Some(1));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_not_persisted() {
        let engine = engine(true);
        engine.enroll("alice".into(), vec![emb(&[0.0, 0.0])], None).await.unwrap();
        let err = engine
            .enroll("bob".into(), vec![emb(&[0.0, 0.0, 0.0])], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Face(FaceError::DimensionMismatch { .. })));

        let labels = engine.labels().await.unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_stale_snapshot_until_rebuild() {
        let engine = engine(false);
        engine.enroll("alice".into(), vec![emb(&[1.0, 1.0])], None).await.unwrap();
        assert!(engine.status().await.unwrap().stale);

        let faces = engine.recognize(vec![(bbox(0.0), emb(&[1.0, 1.0]))]).await.unwrap();
        assert!(faces[0].result.is_unknown());

        let status = engine.rebuild().await.unwrap();
        assert!(!status.stale);
        let faces = engine.recognize(vec![(bbox(0.0), emb(&[1.0, 1.0]))]).await.unwrap();
        assert_eq!(faces[0].result.label().map(Label::as_str), Some("alice"));
    }

    #[tokio::test]
    async fn test_enroll_selected_face() {
        let engine = engine(true);
        engine.recognize(vec![(bbox(0.0), emb(&[0.2, 0.8]))]).await.unwrap();

        let err = engine.enroll_selected(Profile::new("Carol")).await.unwrap_err();
        assert!(matches!(err, EngineError::NoSelection));

        engine.select(0).await.unwrap();
        let outcome = engine.enroll_selected(Profile::new("Carol")).await.unwrap();
        assert_eq!(outcome.label.as_str(), "Carol");

        let faces = engine.recognize(vec![(bbox(1.0), emb(&[0.2, 0.8]))]).await.unwrap();
        assert_eq!(faces[0].result.label().map(Label::as_str), Some("Carol"));
        engine.select(0).await.unwrap();
        assert_eq!(engine.selected_profile().await.unwrap(), Some(Profile::new("Carol")));
    }

    #[tokio::test]
    async fn test_registered_face_rematches_in_place() {
        let engine = engine(true);
        engine.recognize(vec![(bbox(0.0), emb(&[0.2, 0.8]))]).await.unwrap();
        engine.select(0).await.unwrap();
        engine.enroll_selected(Profile::new("Carol")).await.unwrap();
        assert_eq!(engine.status().await.unwrap().selected, None);

        let face = engine.select(0).await.unwrap();
        assert_eq!(face.result.label().map(Label::as_str), Some("Carol"));
        assert_eq!(face.display_label, "Carol (100%)");
        assert_eq!(engine.selected_profile().await.unwrap(), Some(Profile::new("Carol")));
    }

    #[tokio::test]
    async fn test_rebuild_rematches_current_image() {
        let engine = engine(false);
        engine.enroll("alice".into(), vec![emb(&[1.0, 1.0])], None).await.unwrap();
        let faces = engine.recognize(vec![(bbox(0.0), emb(&[1.0, 1.0]))]).await.unwrap();
        assert!(faces[0].result.is_unknown());

        engine.rebuild().await.unwrap();
        let face = engine.select(0).await.unwrap();
        assert_eq!(face.result.label().map(Label::as_str), Some("alice"));
    }

    #[tokio::test]
    async fn test_rebuild_clears_faces_of_old_dimension() {
        let engine = engine(true);
        engine.enroll("alice".into(), vec![emb(&[0.0, 0.0])], None).await.unwrap();
        engine.recognize(vec![(bbox(0.0), emb(&[0.0, 0.0]))]).await.unwrap();
        engine.select(0).await.unwrap();

        engine.remove("alice".into()).await.unwrap();
        assert_eq!(engine.status().await.unwrap().faces, 1);
        engine.enroll("bob".into(), vec![emb(&[0.0, 0.0, 0.0])], None).await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.faces, 0);
        assert_eq!(status.selected, None);
    }

    #[tokio::test]
    async fn test_enroll_without_embeddings_leaves_no_profile() {
        let engine = engine(true);
        let err = engine
            .enroll("ghost".into(), vec![], Some(Profile::new("Ghost")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoEmbeddings));
        assert!(engine.labels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_embedding_rejected() {
        let engine = engine(true);
        let err = engine
            .enroll("x".into(), vec![emb(&[1.0]), emb(&[])], Some(Profile::new("X")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyEmbedding { index: 1 }));
        assert_eq!(engine.status().await.unwrap().dimension, None);

        engine.enroll("x".into(), vec![emb(&[0.5; 128])], None).await.unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.dimension, Some(128));
        assert_eq!(status.labels, 1);
    }

    #[tokio::test]
    async fn test_rejected_enroll_keeps_existing_profile() {
        let engine = engine(true);
        engine.enroll("alice".into(), vec![emb(&[0.0, 0.0])], Some(Profile::new("Alice"))).await.unwrap();
        let mut updated = Profile::new("Alice");
        updated.telegram = Some("alice_tg".into());
        engine
            .enroll("alice".into(), vec![emb(&[0.0, 0.0, 0.0])], Some(updated))
            .await
            .unwrap_err();

        let labels = engine.labels().await.unwrap();
        assert_eq!(labels[0].embeddings, 1);
        assert_eq!(labels[0].profile, Some(Profile::new("Alice")));
    }

    #[tokio::test]
    async fn test_empty_label_rejected() {
        let engine = engine(true);
        let err = engine.enroll("  ".into(), vec![emb(&[1.0])], None).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyLabel));
        assert!(engine.labels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_label() {
        let engine = engine(true);
        engine.enroll("alice".into(), vec![emb(&[0.0, 0.0])], Some(Profile::new("Alice"))).await.unwrap();
        assert!(engine.remove("alice".into()).await.unwrap());
        assert!(!engine.remove("alice".into()).await.unwrap());

        let faces = engine.recognize(vec![(bbox(0.0), emb(&[0.0, 0.0]))]).await.unwrap();
        assert!(faces[0].result.is_unknown());
        assert_eq!(engine.status().await.unwrap().dimension, None);
    }
}
