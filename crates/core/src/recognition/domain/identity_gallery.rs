use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::recognition::domain::embedding::Embedding;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read identities from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid identities JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("identity '{name}' has dimension {found}, expected {expected}")]
    Dimension {
        name: String,
        found: usize,
        expected: usize,
    },
}

/// Known faces, matched against new embeddings by cosine similarity.
#[derive(Debug, Clone)]
pub struct IdentityGallery {
    identities: Vec<(String, Embedding)>,
    threshold: f64,
}

impl IdentityGallery {
    pub fn new(threshold: f64) -> Self {
        Self {
            identities: Vec::new(),
            threshold,
        }
    }

    /// Reads `{ "name": [f32, ...], ... }`. All vectors must share one length.
    pub fn load(path: &Path, threshold: f64) -> Result<Self, GalleryError> {
        let json = fs::read_to_string(path).map_err(|source| GalleryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json, threshold)
    }

    pub fn from_json(json: &str, threshold: f64) -> Result<Self, GalleryError> {
        let entries: BTreeMap<String, Embedding> = serde_json::from_str(json)?;
        let mut gallery = Self::new(threshold);
        for (name, embedding) in entries {
            gallery.insert(name, embedding)?;
        }
        Ok(gallery)
    }

    pub fn insert(&mut self, name: String, embedding: Embedding) -> Result<(), GalleryError> {
        if let Some(expected) = self.dimension() {
            if embedding.len() != expected {
                return Err(GalleryError::Dimension {
                    name,
                    found: embedding.len(),
                    expected,
                });
            }
        }
        self.identities.push((name, embedding));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.identities.first().map(|(_, e)| e.len())
    }

    /// Name of the most similar identity, if it clears the threshold.
    pub fn identify(&self, embedding: &Embedding) -> Option<&str> {
        self.identities
            .iter()
            .map(|(name, known)| (name, known.cosine_similarity(embedding)))
            .filter(|(_, score)| *score >= self.threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, _)| name.as_str())
    }
}
