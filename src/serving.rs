//! 推論サービスの境界
//!
//! モデルを読み込めなかった場合でもサービス自体は作成でき、
//! 以降の全リクエストに `model_unavailable` を返します。
//! 画像ごとの失敗（デコード不可など）は `invalid_image` として1リクエストだけに閉じます。

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::ml::PredictionResult;

/// 推論レスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PredictionResponse {
    Prediction(PredictionResult),
    ModelUnavailable { reason: String },
    InvalidImage { reason: String },
    /// 画像にもモデル読み込みにも起因しない失敗
    PredictionFailed { reason: String },
}

impl PredictionResponse {
    /// 推論結果をレスポンスに変換
    pub fn from_result(result: Result<PredictionResult>) -> Self {
        match result {
            Ok(prediction) => Self::Prediction(prediction),
            Err(ClassifierError::ModelUnavailable(reason)) => Self::ModelUnavailable { reason },
            Err(e) if e.is_item_local() => Self::InvalidImage {
                reason: e.to_string(),
            },
            Err(e) => {
                log::error!("推論に失敗しました: {}", e);
                Self::PredictionFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn is_prediction(&self) -> bool {
        matches!(self, Self::Prediction(_))
    }
}

/// アップロード文字列を画像バイト列に変換
///
/// `data:image/png;base64,....` 形式ならカンマ以降を、そうでなければ全体をBase64として扱います。
pub fn decode_upload(upload: &str) -> Result<Vec<u8>> {
    let payload = match upload.trim().strip_prefix("data:") {
        Some(rest) => match rest.split_once(',') {
            Some((_, data)) => data,
            None => {
                return Err(ClassifierError::Preprocessing(
                    "データURLにカンマがありません".to_string(),
                ))
            }
        },
        None => upload.trim(),
    };

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ClassifierError::Preprocessing(
            "画像データが空です".to_string(),
        ));
    }

    general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ClassifierError::Preprocessing(format!("Base64のデコードに失敗しました: {}", e)))
}

#[cfg(feature = "ml")]
pub use service::PredictionService;

#[cfg(feature = "ml")]
mod service {
    use std::path::Path;

    use burn::tensor::backend::Backend;
    use image::DynamicImage;

    use super::{decode_upload, PredictionResponse};
    use crate::error::ClassifierError;
    use crate::ml::InferenceEngine;

    /// 推論サービス
    ///
    /// `Send` なので、並列処理ではワーカーごとに `clone()` して渡します。
    /// 複製しても重みは読み込み直さず、テンソルのバッファを共有します。
    #[derive(Clone)]
    pub struct PredictionService<B: Backend> {
        engine: std::result::Result<InferenceEngine<B>, String>,
    }

    impl<B: Backend> PredictionService<B> {
        /// 成果物を読み込む（失敗してもエラーにはせず、利用不可状態で作成）
        pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device, enforce_training_parity: bool) -> Self {
            match InferenceEngine::load(model_path, device, enforce_training_parity) {
                Ok(engine) => Self::from_engine(engine),
                Err(e) => {
                    log::error!("{}", e);
                    Self::unavailable(e.to_string())
                }
            }
        }

        pub fn from_engine(engine: InferenceEngine<B>) -> Self {
            Self { engine: Ok(engine) }
        }

        pub fn unavailable(reason: impl Into<String>) -> Self {
            Self {
                engine: Err(reason.into()),
            }
        }

        pub fn is_available(&self) -> bool {
            self.engine.is_ok()
        }

        pub fn engine(&self) -> Option<&InferenceEngine<B>> {
            self.engine.as_ref().ok()
        }

        fn with_engine<F>(&self, f: F) -> PredictionResponse
        where
            F: FnOnce(&InferenceEngine<B>) -> crate::error::Result<crate::ml::PredictionResult>,
        {
            match &self.engine {
                Ok(engine) => PredictionResponse::from_result(f(engine)),
                Err(reason) => PredictionResponse::from_result(Err(
                    ClassifierError::ModelUnavailable(reason.clone()),
                )),
            }
        }

        /// デコード済み画像を分類
        pub fn predict_image(&self, image: &DynamicImage) -> PredictionResponse {
            self.with_engine(|engine| engine.predict(image))
        }

        /// エンコード済み画像バイト列を分類
        pub fn predict_bytes(&self, bytes: &[u8]) -> PredictionResponse {
            self.with_engine(|engine| engine.predict_bytes(bytes))
        }

        /// データURLまたはBase64文字列を分類
        pub fn predict_upload(&self, upload: &str) -> PredictionResponse {
            self.with_engine(|engine| {
                let bytes = decode_upload(upload)?;
                engine.predict_bytes(&bytes)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_url_and_plain_base64() {
        let encoded = general_purpose::STANDARD.encode([1u8, 2, 3, 250]);
        let url = format!("data:image/png;base64,{}", encoded);
        assert_eq!(decode_upload(&url).unwrap(), vec![1, 2, 3, 250]);
        assert_eq!(decode_upload(&encoded).unwrap(), vec![1, 2, 3, 250]);
    }

    #[test]
    fn test_decode_rejects_bad_uploads() {
        assert!(matches!(
            decode_upload("data:image/png;base64"),
            Err(ClassifierError::Preprocessing(_))
        ));
        assert!(decode_upload("data:image/png;base64,").is_err());
        assert!(decode_upload("@@not base64@@").is_err());
    }

    #[test]
    fn test_response_json_is_tagged() {
        let response = PredictionResponse::Prediction(PredictionResult {
            label: "dogs".to_string(),
            class_index: 1,
            confidence: 0.75,
            score: 0.75,
        });
        let json: serde_json::Value = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "prediction");
        assert_eq!(json["label"], "dogs");

        let json = serde_json::to_value(PredictionResponse::ModelUnavailable {
            reason: "missing".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "model_unavailable");
        assert_eq!(json["reason"], "missing");
    }

    #[test]
    fn test_error_classification() {
        let response = PredictionResponse::from_result(Err(ClassifierError::Decode {
            path: None,
            reason: "bad".to_string(),
        }));
        assert!(matches!(response, PredictionResponse::InvalidImage { .. }));

        let response =
            PredictionResponse::from_result(Err(ClassifierError::Backend("gpu".to_string())));
        assert!(matches!(response, PredictionResponse::PredictionFailed { .. }));
        assert!(!response.is_prediction());
    }

    #[cfg(feature = "ml")]
    mod service_tests {
        use super::*;
        use crate::ml::classifier::build;
        use crate::ml::InferenceEngine;
        use crate::model::{ArtifactMetadata, ModelSettings};
        use crate::preprocess::{InputShape, NormalizerConfig};
        use burn_ndarray::NdArray;
        use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
        use std::io::Cursor;
        use std::thread;

        type TestBackend = NdArray<f32>;

        fn service() -> PredictionService<TestBackend> {
            let device = Default::default();
            let settings = ModelSettings {
                backbone_channels: vec![4],
                hidden_units: 4,
                bottleneck_units: 4,
                ..ModelSettings::default()
            };
            let (model, _) =
                build::<TestBackend>(&InputShape::fixed(8, 8), &settings, &device).unwrap();
            let metadata = ArtifactMetadata::new(
                vec!["cats".to_string(), "dogs".to_string()],
                InputShape::fixed(8, 8),
                NormalizerConfig::new(InputShape::fixed(8, 8)),
                settings,
            );
            PredictionService::from_engine(InferenceEngine::from_parts(model, &metadata, device, true))
        }

        fn png_data_url() -> String {
            let image = DynamicImage::ImageRgb8(RgbImage::from_fn(12, 12, |x, y| {
                Rgb([200, (x * 20) as u8, (y * 20) as u8])
            }));
            let mut bytes = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .unwrap();
            format!(
                "data:image/png;base64,{}",
                general_purpose::STANDARD.encode(&bytes)
            )
        }

        #[test]
        fn test_unavailable_model_answers_every_request() {
            let service = PredictionService::<TestBackend>::load(
                "/nonexistent/model.tar.gz",
                Default::default(),
                true,
            );
            assert!(!service.is_available());
            for _ in 0..2 {
                assert!(matches!(
                    service.predict_upload(&png_data_url()),
                    PredictionResponse::ModelUnavailable { .. }
                ));
            }
        }

        #[test]
        fn test_bad_upload_does_not_affect_next_request() {
            let service = service();
            assert!(matches!(
                service.predict_upload("data:image/png;base64,AAAA"),
                PredictionResponse::InvalidImage { .. }
            ));
            let response = service.predict_upload(&png_data_url());
            match response {
                PredictionResponse::Prediction(result) => {
                    assert!(result.confidence >= 0.5 && result.confidence <= 1.0);
                }
                other => panic!("unexpected response: {:?}", other),
            }
        }

        fn assert_send<T: Send>() {}

        #[test]
        fn test_service_and_engine_can_move_between_threads() {
            assert_send::<PredictionService<TestBackend>>();
            assert_send::<InferenceEngine<TestBackend>>();
        }

        #[test]
        fn test_worker_clones_predict_concurrently() {
            let service = service();
            let upload = png_data_url();
            let expected = match service.predict_upload(&upload) {
                PredictionResponse::Prediction(result) => result,
                other => panic!("unexpected response: {:?}", other),
            };
            let same_as_expected = |response: PredictionResponse| match response {
                PredictionResponse::Prediction(result) => {
                    result.label == expected.label && (result.score - expected.score).abs() < 1e-6
                }
                _ => false,
            };

            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let worker = service.clone();
                    let upload = upload.clone();
                    thread::spawn(move || {
                        (0..3)
                            .map(|_| worker.predict_upload(&upload))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            for handle in workers {
                for response in handle.join().unwrap() {
                    assert!(same_as_expected(response));
                }
            }

            // 元のサービスも引き続き使える
            assert!(same_as_expected(service.predict_upload(&upload)));
        }
    }
}
