//! Reading embeddings and detections handed over by the external detector.

use anyhow::{bail, Context, Result};
use facematch_core::{BoundingBox, Embedding};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One detection as the daemon expects it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingsFile {
    Many(Vec<Embedding>),
    One(Embedding),
}

/// Parse either a single embedding (`[0.1, ...]`) or a list of them.
pub fn parse_embeddings(raw: &str) -> Result<Vec<Embedding>> {
    let embeddings = match serde_json::from_str(raw).context("parsing embeddings JSON")? {
        EmbeddingsFile::Many(many) => many,
        EmbeddingsFile::One(one) => vec![one],
    };
    if embeddings.is_empty() {
        bail!("no embeddings in input");
    }
    if let Some(i) = embeddings.iter().position(Embedding::is_empty) {
        bail!("embedding #{i} is empty");
    }
    Ok(embeddings)
}

pub fn parse_detections(raw: &str) -> Result<Vec<Detection>> {
    serde_json::from_str(raw).context("parsing detections JSON")
}

pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}
