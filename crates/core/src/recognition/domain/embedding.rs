use serde::{Deserialize, Serialize};

/// Identity feature vector produced by a face embedding model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Builds an embedding scaled to unit length.
    pub fn normalized(mut values: Vec<f32>) -> Self {
        l2_normalize(&mut values);
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cosine similarity in `[-1, 1]`; 0 for mismatched lengths or zero vectors.
    pub fn cosine_similarity(&self, other: &Embedding) -> f64 {
        if self.len() != other.len() {
            return 0.0;
        }
        let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let (a, b) = (*a as f64, *b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
