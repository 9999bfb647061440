pub mod onnx_face_embedder;
pub mod onnx_mask_classifier;
mod preprocess;
