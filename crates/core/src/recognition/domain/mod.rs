pub mod embedding;
pub mod face_embedder;
pub mod identity_gallery;
pub mod mask_classifier;
