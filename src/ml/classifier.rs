//! 二値分類モデル
//!
//! 特徴抽出器 → 大域平均プーリング → 分類ヘッド → 出力1ユニット（シグモイド）。

use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};

use crate::error::ClassifierError;
use crate::ml::backbone::{BackboneConfig, FeatureExtractor};
use crate::model::ModelSettings;
use crate::preprocess::InputShape;

/// モデル設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub backbone: BackboneConfig,
    #[config(default = 256)]
    pub hidden_units: usize,
    #[config(default = 128)]
    pub bottleneck_units: usize,
    #[config(default = 0.5)]
    pub input_dropout: f64,
    #[config(default = 0.3)]
    pub hidden_dropout: f64,
    #[config(default = 0.2)]
    pub output_dropout: f64,
}

impl ClassifierConfig {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self::new(BackboneConfig::new(settings.backbone_channels.clone()))
            .with_hidden_units(settings.hidden_units)
            .with_bottleneck_units(settings.bottleneck_units)
            .with_input_dropout(settings.dropout[0])
            .with_hidden_dropout(settings.dropout[1])
            .with_output_dropout(settings.dropout[2])
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> BinaryClassifier<B> {
        let features = self.backbone.output_dim();
        log::debug!(
            "[Model] 特徴抽出器: {:?} -> 特徴次元 {}",
            self.backbone.channels,
            features
        );
        log::debug!(
            "[Model] ヘッド: {} -> {} -> {} -> 1",
            features,
            self.hidden_units,
            self.bottleneck_units
        );

        BinaryClassifier {
            backbone: self.backbone.init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: ClassifierHead {
                input_dropout: DropoutConfig::new(self.input_dropout).init(),
                fc1: LinearConfig::new(features, self.hidden_units).init(device),
                norm: LayerNormConfig::new(self.hidden_units).init(device),
                hidden_dropout: DropoutConfig::new(self.hidden_dropout).init(),
                fc2: LinearConfig::new(self.hidden_units, self.bottleneck_units).init(device),
                output_dropout: DropoutConfig::new(self.output_dropout).init(),
                output: LinearConfig::new(self.bottleneck_units, 1).init(device),
                activation: Relu::new(),
            },
        }
    }
}

/// 分類ヘッド
///
/// Dropout → Dense + ReLU → LayerNorm → Dropout → Dense + ReLU → Dropout → Dense(1)
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    input_dropout: Dropout,
    fc1: Linear<B>,
    norm: LayerNorm<B>,
    hidden_dropout: Dropout,
    fc2: Linear<B>,
    output_dropout: Dropout,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    /// [batch_size, features] -> ロジット [batch_size, 1]
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.input_dropout.forward(features);
        let x = self.activation.forward(self.fc1.forward(x));
        let x = self.norm.forward(x);
        let x = self.hidden_dropout.forward(x);
        let x = self.activation.forward(self.fc2.forward(x));
        let x = self.output_dropout.forward(x);
        self.output.forward(x)
    }
}

/// 二値分類モデル
///
/// 空間方向は大域平均プーリングで潰すため、入力の高さ・幅は可変です。
#[derive(Module, Debug)]
pub struct BinaryClassifier<B: Backend> {
    pub(crate) backbone: FeatureExtractor<B>,
    pool: AdaptiveAvgPool2d,
    pub(crate) head: ClassifierHead<B>,
}

impl<B: Backend> BinaryClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, H, W]
    ///
    /// # 戻り値
    /// - ロジット [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_frozen(images, 0)
    }

    /// 特徴抽出器の先頭 `frozen_layers` 層を勾配計算から外して順伝播
    pub fn forward_frozen(&self, images: Tensor<B, 4>, frozen_layers: usize) -> Tensor<B, 2> {
        let features = self.backbone.forward_frozen(images, frozen_layers);
        let [batch_size, channels, _, _] = features.dims();
        let pooled = self.pool.forward(features).reshape([batch_size, channels]);
        self.head.forward(pooled)
    }

    /// 陽性クラスの確率 [batch_size, 1]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }

    pub fn backbone(&self) -> &FeatureExtractor<B> {
        &self.backbone
    }
}

/// 特徴抽出器の凍結状態
///
/// 先頭から `frozen_layers` 層が凍結されています。構築直後は全層凍結です。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureExtractorHandle {
    num_layers: usize,
    frozen_layers: usize,
}

impl FeatureExtractorHandle {
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            frozen_layers: num_layers,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn frozen_layers(&self) -> usize {
        self.frozen_layers
    }

    pub fn is_frozen(&self, layer: usize) -> bool {
        layer < self.frozen_layers
    }

    /// 全層を凍結
    pub fn freeze_all(&mut self) {
        self.frozen_layers = self.num_layers;
    }

    /// 先頭 `keep_frozen` 層を除いて凍結を解除
    pub fn unfreeze_except_first(&mut self, keep_frozen: usize) -> crate::error::Result<()> {
        if keep_frozen > self.num_layers {
            return Err(ClassifierError::InvalidConfig(format!(
                "凍結する層数 {} が層数 {} を超えています",
                keep_frozen, self.num_layers
            )));
        }
        self.frozen_layers = keep_frozen;
        Ok(())
    }
}

/// 入力形状とモデル設定から分類モデルを構築
///
/// 事前学習済み重みが設定されていれば特徴抽出器に読み込みます。
/// 戻り値の `FeatureExtractorHandle` は全層凍結の状態です。
pub fn build<B: Backend>(
    input_shape: &InputShape,
    settings: &ModelSettings,
    device: &B::Device,
) -> crate::error::Result<(BinaryClassifier<B>, FeatureExtractorHandle)> {
    input_shape.validate()?;
    if let Some((height, width)) = input_shape.concrete() {
        let min_side = settings.min_input_side();
        if height < min_side || width < min_side {
            return Err(ClassifierError::InvalidConfig(format!(
                "入力サイズ {} が小さすぎます (最小 {}x{})",
                input_shape, min_side, min_side
            )));
        }
    }

    let config = ClassifierConfig::from_settings(settings);
    let mut model = config.init::<B>(device);

    match &settings.pretrained_weights {
        Some(path) => {
            model.backbone = model.backbone.load_pretrained(path, device)?;
            log::info!("事前学習済みの重みを読み込みました: {}", path.display());
        }
        None => {
            log::warn!("事前学習済みの重みが指定されていません。特徴抽出器はランダム初期化です");
        }
    }

    log::info!(
        "モデルを構築しました: 入力 {}, パラメータ数 {}",
        input_shape,
        model.num_params()
    );

    let handle = FeatureExtractorHandle::new(model.backbone.num_layers());
    Ok((model, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_settings() -> ModelSettings {
        ModelSettings {
            backbone_channels: vec![4, 8],
            hidden_units: 8,
            bottleneck_units: 4,
            ..ModelSettings::default()
        }
    }

    #[test]
    fn test_logits_shape_and_probabilities() {
        let device = Default::default();
        let (model, handle) =
            build::<TestBackend>(&InputShape::fixed(8, 8), &small_settings(), &device).unwrap();
        assert_eq!(handle.num_layers(), 2);
        assert_eq!(handle.frozen_layers(), 2);

        let images = Tensor::<TestBackend, 4>::ones([3, 3, 8, 8], &device);
        assert_eq!(model.forward(images.clone()).dims(), [3, 1]);

        let probs = model.predict_proba(images).into_data().to_vec::<f32>().unwrap();
        assert!(probs.iter().all(|p| *p > 0.0 && *p < 1.0));
    }

    #[test]
    fn test_accepts_variable_spatial_size() {
        let device = Default::default();
        let (model, _) =
            build::<TestBackend>(&InputShape::dynamic(), &small_settings(), &device).unwrap();
        for (h, w) in [(8, 8), (12, 20), (16, 4)] {
            let images = Tensor::<TestBackend, 4>::zeros([1, 3, h, w], &device);
            assert_eq!(model.forward(images).dims(), [1, 1]);
        }
    }

    #[test]
    fn test_rejects_too_small_input() {
        let device = Default::default();
        let result = build::<TestBackend>(&InputShape::fixed(2, 8), &small_settings(), &device);
        assert!(matches!(result, Err(ClassifierError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_pretrained_weights_is_error() {
        let device = Default::default();
        let settings = ModelSettings {
            pretrained_weights: Some("/nonexistent/backbone".into()),
            ..small_settings()
        };
        assert!(build::<TestBackend>(&InputShape::fixed(8, 8), &settings, &device).is_err());
    }

    #[test]
    fn test_handle_freeze_controls() {
        let mut handle = FeatureExtractorHandle::new(4);
        assert!(handle.is_frozen(3));
        handle.unfreeze_except_first(1).unwrap();
        assert!(handle.is_frozen(0));
        assert!(!handle.is_frozen(1));
        assert!(handle.unfreeze_except_first(5).is_err());
        handle.freeze_all();
        assert_eq!(handle.frozen_layers(), 4);
    }

    #[test]
    fn test_config_from_settings() {
        let config = ClassifierConfig::from_settings(&ModelSettings::default());
        assert_eq!(config.backbone.channels, vec![32, 64, 128, 256]);
        assert_eq!(config.hidden_units, 256);
        assert_eq!(config.bottleneck_units, 128);
        assert!((config.input_dropout - 0.5).abs() < 1e-12);
        assert!((config.output_dropout - 0.2).abs() < 1e-12);
    }
}
