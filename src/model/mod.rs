pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::{ArtifactMetadata, ARTIFACT_FORMAT_VERSION};
pub use model_storage::{
    artifact_path, load_metadata, load_model_with_metadata, log_metadata_info,
    save_model_with_metadata,
};
#[cfg(feature = "ml")]
pub use model_storage::{encode_model, load_model, save_model};
pub use inference_config::InferenceConfig;
pub use config::{
    AppConfig, DatasetSettings, DeviceType, LrDecaySettings, ModelSettings, OutputSettings,
    PhaseSettings, ServingSettings, TrainingSettings,
};
