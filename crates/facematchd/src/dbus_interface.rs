use crate::engine::{EngineError, EngineHandle};
use facematch_core::{BoundingBox, Embedding, Label, Profile};
use serde::Deserialize;
use zbus::interface;

pub const BUS_NAME: &str = "org.facematch.FaceMatch1";
pub const OBJECT_PATH: &str = "/org/facematch/FaceMatch1";

/// One detection from the external face detector.
#[derive(Debug, Deserialize)]
struct DetectionInput {
    bounding_box: BoundingBox,
    embedding: Embedding,
}

/// D-Bus interface for the facematch daemon.
///
/// Bus name: org.facematch.FaceMatch1
/// Object path: /org/facematch/FaceMatch1
///
/// Structured arguments and replies are JSON strings.
pub struct FaceMatchService {
    engine: EngineHandle,
}

impl FaceMatchService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn fdo_error(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Face(_)
        | EngineError::EmptyLabel
        | EngineError::NoEmbeddings
        | EngineError::EmptyEmbedding { .. }
        | EngineError::NoSelection => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(raw).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{what}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.facematch.FaceMatch1")]
impl FaceMatchService {
    /// Enroll embeddings (a JSON array of float arrays) under `label`.
    /// `profile_json` may be empty.
    async fn enroll(&self, label: &str, embeddings_json: &str, profile_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(label, "enroll requested");
        let embeddings: Vec<Embedding> = parse_json("embeddings", embeddings_json)?;
        let profile: Option<Profile> = if profile_json.trim().is_empty() {
            None
        } else {
            Some(parse_json("profile", profile_json)?)
        };
        let outcome = self
            .engine
            .enroll(Label::from(label), embeddings, profile)
            .await
            .map_err(fdo_error)?;
        to_json(&outcome)
    }

    /// Enroll the currently selected face under the profile's name.
    async fn enroll_selected(&self, profile_json: &str) -> zbus::fdo::Result<String> {
        let profile: Profile = parse_json("profile", profile_json)?;
        tracing::info!(name = %profile.name, "enroll_selected requested");
        let outcome = self.engine.enroll_selected(profile).await.map_err(fdo_error)?;
        to_json(&outcome)
    }

    async fn remove(&self, label: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(label, "remove requested");
        self.engine.remove(Label::from(label)).await.map_err(fdo_error)
    }

    /// Rebuild the matcher snapshot from the current registry.
    async fn rebuild(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.rebuild().await.map_err(fdo_error)?;
        to_json(&status)
    }

    /// Replace the current image's detections and return the matched faces.
    async fn recognize(&self, detections_json: &str) -> zbus::fdo::Result<String> {
        let detections: Vec<DetectionInput> = parse_json("detections", detections_json)?;
        tracing::info!(count = detections.len(), "recognize requested");
        let faces = detections
            .into_iter()
            .map(|d| (d.bounding_box, d.embedding))
            .collect();
        let recognized = self.engine.recognize(faces).await.map_err(fdo_error)?;
        to_json(&recognized)
    }

    async fn select(&self, index: u32) -> zbus::fdo::Result<String> {
        let face = self.engine.select(index as usize).await.map_err(fdo_error)?;
        to_json(&face)
    }

    /// Profile of the selected face, or an empty string if there is none.
    async fn selected_profile(&self) -> zbus::fdo::Result<String> {
        match self.engine.selected_profile().await.map_err(fdo_error)? {
            Some(profile) => to_json(&profile),
            None => Ok(String::new()),
        }
    }

    async fn list_labels(&self) -> zbus::fdo::Result<String> {
        let labels = self.engine.labels().await.map_err(fdo_error)?;
        to_json(&labels)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(fdo_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }
}
