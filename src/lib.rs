//! 2クラス画像分類器
//!
//! 転移学習による2フェーズ学習パイプラインと、学習時と同じ前処理を使う推論アダプタ。

pub mod error;
pub mod preprocess;
pub mod dataset;
pub mod metrics;
pub mod model;
pub mod ml;
pub mod serving;
#[cfg(feature = "ml")]
pub mod pipeline;

pub use error::{ClassifierError, Result};
