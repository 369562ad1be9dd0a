pub mod ml_model;
pub mod extractor;
pub mod dataset;
pub mod training;
pub mod inference;
pub mod capture;

pub use ml_model::{ClassifierHead, ClassifierHeadConfig, NUM_CLASSES, CLASS_NAMES};
pub use extractor::{FeatureExtractor, ConvFeatureExtractor, ConvExtractorConfig};
pub use dataset::{ExampleSet, ExampleRows, ExampleItem, ExampleBatch, ExampleBatcher};
pub use training::{FitLoop, FitConfig, BatchEnd, build_loader};
pub use inference::{GesturePredictor, Prediction};
pub use capture::{load_frame, frame_tensor, collect_from_directory};
