pub mod admission;
pub mod analyser_error;
pub mod face_result;
pub mod frame_analyser;
pub mod gallery_analyser;
pub mod infrastructure;
pub mod main_context;
pub mod overlay;
pub mod pipeline_logger;
pub mod region_processor;
