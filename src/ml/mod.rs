pub mod callbacks;
pub mod inference;

#[cfg(feature = "ml")]
pub mod backbone;
#[cfg(feature = "ml")]
pub mod classifier;
#[cfg(feature = "ml")]
pub mod batcher;
#[cfg(feature = "ml")]
pub mod loss;
#[cfg(feature = "ml")]
pub mod evaluate;
#[cfg(feature = "ml")]
pub mod trainer;

pub use callbacks::{CheckpointTracker, EarlyStopping, ReduceLrOnPlateau};
pub use inference::PredictionResult;

#[cfg(feature = "ml")]
pub use backbone::{BackboneConfig, FeatureExtractor};
#[cfg(feature = "ml")]
pub use classifier::{build, BinaryClassifier, ClassifierConfig, FeatureExtractorHandle};
#[cfg(feature = "ml")]
pub use batcher::{ExampleBatch, ExampleBatcher, ExampleDataset};
#[cfg(feature = "ml")]
pub use evaluate::{evaluate, score_examples, SplitScores};
#[cfg(feature = "ml")]
pub use inference::InferenceEngine;
#[cfg(feature = "ml")]
pub use trainer::{
    CheckpointInfo, CheckpointSink, DiscardCheckpoints, EpochRecord, Phase, PhaseSummary,
    TrainingOutcome, TwoPhaseTrainer,
};
