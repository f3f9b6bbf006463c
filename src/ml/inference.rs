//! モデル推論機能
//!
//! 成果物を1回だけ読み込み、以降の推論は `&self` のみで行います。
//! 並列に推論する場合はワーカーごとにエンジンを複製します（重みのテンソルは参照カウントで共有されます）。

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::metrics::{predict_label, POSITIVE_CLASS};

/// 1画像の推論結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// 予測クラス名
    pub label: String,
    pub class_index: usize,
    /// 予測クラスに対する確信度（0.5〜1.0）
    pub confidence: f32,
    /// 陽性クラスの確率
    pub score: f32,
}

impl PredictionResult {
    /// 陽性クラスの確率から結果を作成
    pub fn from_score(score: f32, class_names: &[String]) -> Result<Self> {
        if !score.is_finite() {
            return Err(ClassifierError::Backend(format!(
                "モデル出力が有限値ではありません: {}",
                score
            )));
        }
        let score = score.clamp(0.0, 1.0);
        let class_index = predict_label(score);
        let label = class_names.get(class_index).cloned().ok_or_else(|| {
            ClassifierError::ModelUnavailable(format!(
                "クラスインデックス {} に対応する名前がありません",
                class_index
            ))
        })?;
        let confidence = if class_index == POSITIVE_CLASS {
            score
        } else {
            1.0 - score
        };

        Ok(Self {
            label,
            class_index,
            confidence,
            score,
        })
    }
}

#[cfg(feature = "ml")]
pub use engine::InferenceEngine;

#[cfg(feature = "ml")]
mod engine {
    use std::path::Path;

    use burn::tensor::{backend::Backend, Tensor};
    use image::DynamicImage;

    use super::PredictionResult;
    use crate::error::{ClassifierError, Result};
    use crate::ml::classifier::BinaryClassifier;
    use crate::model::{load_model, log_metadata_info, ArtifactMetadata, InferenceConfig};
    use crate::preprocess::{decode_image, normalize, open_image, NormalizedTensor, NormalizerConfig};

    /// 推論エンジン
    ///
    /// モデルのパラメータは遅延初期化のセルを持つため `Sync` ではありませんが、`Send` です。
    /// スレッド間では参照ではなく複製を渡してください。
    #[derive(Clone)]
    pub struct InferenceEngine<B: Backend> {
        model: BinaryClassifier<B>,
        config: InferenceConfig,
        normalizer: NormalizerConfig,
        min_input_side: usize,
        device: B::Device,
    }

    impl<B: Backend> InferenceEngine<B> {
        /// モデルを読み込んで推論エンジンを初期化
        ///
        /// 読み込みに失敗した場合は `ModelUnavailable` を返します。
        pub fn load<P: AsRef<Path>>(
            model_path: P,
            device: B::Device,
            enforce_training_parity: bool,
        ) -> Result<Self> {
            let model_path = model_path.as_ref();
            let (model, metadata) = load_model::<B>(model_path, &device).map_err(|e| {
                ClassifierError::ModelUnavailable(format!("{}: {:#}", model_path.display(), e))
            })?;
            log::info!("モデルを読み込みました: {}", model_path.display());
            log_metadata_info(&metadata);
            Ok(Self::from_parts(model, &metadata, device, enforce_training_parity))
        }

        /// 構築済みのモデルとメタデータから作成
        pub fn from_parts(
            model: BinaryClassifier<B>,
            metadata: &ArtifactMetadata,
            device: B::Device,
            enforce_training_parity: bool,
        ) -> Self {
            let config = InferenceConfig::from_metadata(metadata);
            let normalizer = config.serving_normalizer(enforce_training_parity);
            if !enforce_training_parity && metadata.normalizer.contrast.is_some() {
                log::warn!("学習時のコントラスト補正を推論では適用しません");
            }
            Self {
                model,
                config,
                normalizer,
                min_input_side: metadata.model.min_input_side() as usize,
                device,
            }
        }

        pub fn config(&self) -> &InferenceConfig {
            &self.config
        }

        /// 推論時に使う前処理設定
        pub fn normalizer(&self) -> &NormalizerConfig {
            &self.normalizer
        }

        /// 推論用の前処理
        pub fn preprocess(&self, image: &DynamicImage) -> Result<NormalizedTensor> {
            let tensor = normalize(image, &self.normalizer)?;
            if tensor.height() < self.min_input_side || tensor.width() < self.min_input_side {
                return Err(ClassifierError::Preprocessing(format!(
                    "画像が小さすぎます: {}x{} (最小 {})",
                    tensor.width(),
                    tensor.height(),
                    self.min_input_side
                )));
            }
            Ok(tensor)
        }

        /// 単一画像を分類
        pub fn predict(&self, image: &DynamicImage) -> Result<PredictionResult> {
            let tensor = self.preprocess(image)?;
            let [_, height, width, _] = tensor.shape();
            let input = Tensor::<B, 1>::from_floats(tensor.to_chw().as_slice(), &self.device)
                .reshape([1, 3, height, width]);

            let scores = self
                .model
                .predict_proba(input)
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| ClassifierError::Backend(format!("推論結果の取得エラー: {:?}", e)))?;
            let score = scores.first().copied().ok_or_else(|| {
                ClassifierError::Backend("モデル出力が空です".to_string())
            })?;

            PredictionResult::from_score(score, &self.config.class_names)
        }

        /// エンコード済み画像バイト列を分類
        pub fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictionResult> {
            let image = decode_image(bytes)?;
            self.predict(&image)
        }

        /// 画像ファイルを分類
        pub fn predict_file<P: AsRef<Path>>(&self, path: P) -> Result<PredictionResult> {
            let image = open_image(path.as_ref())?;
            self.predict(&image)
        }
    }
}
