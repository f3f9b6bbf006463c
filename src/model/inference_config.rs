//! モデルメタデータを使用した推論設定
//!
//! 成果物のメタデータから推論に必要な情報（クラス名・入力形状・前処理）を取り出します。

use crate::model::model_metadata::ArtifactMetadata;
use crate::preprocess::{InputShape, NormalizerConfig};

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// クラス名（インデックス1が陽性クラス）
    pub class_names: Vec<String>,

    /// モデルが宣言する入力形状
    pub input_shape: InputShape,

    /// 学習時の前処理設定
    pub training_normalizer: NormalizerConfig,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ArtifactMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            input_shape: metadata.input_shape,
            training_normalizer: metadata.normalizer,
        }
    }

    /// 推論時の前処理設定
    ///
    /// リサイズ先は宣言された入力形状に従い、未確定なら元サイズのまま渡します。
    /// コントラスト補正は `enforce_training_parity` が有効で、かつ学習時に使われていた場合のみ適用します。
    pub fn serving_normalizer(&self, enforce_training_parity: bool) -> NormalizerConfig {
        let contrast = if enforce_training_parity {
            self.training_normalizer.contrast
        } else {
            None
        };
        NormalizerConfig::new(self.input_shape).with_contrast(contrast)
    }
}
