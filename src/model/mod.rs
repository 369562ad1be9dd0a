pub mod model_metadata;
pub mod model_storage;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{save_model_with_metadata, load_metadata, load_model_bundle, head_to_bytes, log_metadata_info, ModelBundle};
pub use config::{AppConfig, Hyperparameters, ExtractorSettings};
