//! 特徴抽出器（バックボーン）
//!
//! 各層は Conv 3x3 (same padding) + ReLU + MaxPool 2x2 です。
//! 層単位で凍結できるよう、層を `Vec<ConvBlock>` として保持します。

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    record::{DefaultFileRecorder, FileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor},
};

use crate::error::ClassifierError;
use crate::preprocess::InputShape;

/// 特徴抽出器の設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// 各層の出力チャネル数
    pub channels: Vec<usize>,
}

impl BackboneConfig {
    /// 特徴抽出器を初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeatureExtractor<B> {
        let mut in_channels = InputShape::CHANNELS as usize;
        let mut blocks = Vec::with_capacity(self.channels.len());

        for &out_channels in &self.channels {
            blocks.push(ConvBlock {
                conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device),
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                activation: Relu::new(),
            });
            in_channels = out_channels;
        }

        FeatureExtractor { blocks }
    }

    pub fn num_layers(&self) -> usize {
        self.channels.len()
    }

    /// 出力特徴の次元（最終層のチャネル数）
    pub fn output_dim(&self) -> usize {
        self.channels.last().copied().unwrap_or(InputShape::CHANNELS as usize)
    }
}

/// 凍結単位となる1層
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

/// 特徴抽出器
#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    pub(crate) blocks: Vec<ConvBlock<B>>,
}

impl<B: Backend> FeatureExtractor<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: [batch_size, 3, H, W]
    ///
    /// # 戻り値
    /// - 特徴マップ [batch_size, C, H / 2^層数, W / 2^層数]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_frozen(images, 0)
    }

    /// 先頭 `frozen_layers` 層の出力を計算グラフから切り離して順伝播
    ///
    /// 切り離した層には勾配が流れないため、その層のパラメータは更新されません。
    pub fn forward_frozen(&self, images: Tensor<B, 4>, frozen_layers: usize) -> Tensor<B, 4> {
        let mut x = images;
        for (index, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if index + 1 == frozen_layers {
                x = x.detach();
            }
        }
        x
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// 事前学習済みの重みを読み込む
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> crate::error::Result<Self> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| {
                ClassifierError::Artifact(format!(
                    "事前学習済みの重みを読み込めません ({}): {:?}",
                    path.display(),
                    e
                ))
            })
    }

    /// 重みを保存（別の学習の事前学習済み重みとして使える）
    ///
    /// レコーダーが拡張子を付け替えるため、実際に書き込んだパスを返します。
    pub fn save_weights(&self, path: &Path) -> crate::error::Result<PathBuf> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let written = path.with_extension(
            <DefaultFileRecorder<FullPrecisionSettings> as FileRecorder<B>>::file_extension(),
        );
        if let Some(parent) = written.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|e| {
                ClassifierError::Artifact(format!(
                    "特徴抽出器の重みを保存できません ({}): {:?}",
                    path.display(),
                    e
                ))
            })?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_output_shape_halves_per_layer() {
        let device = Default::default();
        let backbone = BackboneConfig::new(vec![4, 8]).init::<TestBackend>(&device);
        assert_eq!(backbone.num_layers(), 2);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 12], &device);
        let features = backbone.forward(images);
        assert_eq!(features.dims(), [2, 8, 4, 3]);
    }

    #[test]
    fn test_frozen_forward_matches_plain_forward() {
        let device = Default::default();
        let backbone = BackboneConfig::new(vec![4, 4]).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);

        let plain = backbone.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let frozen = backbone
            .forward_frozen(images, 1)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(plain, frozen);
    }

    #[test]
    fn test_weights_roundtrip_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("backbone");
        let device = Default::default();
        let config = BackboneConfig::new(vec![4]);

        let original = config.init::<TestBackend>(&device);
        let written = original.save_weights(&path).unwrap();
        assert_eq!(written, tmp.path().join("backbone.mpk"));
        assert!(written.exists());

        let restored = config
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &device)
            .unwrap();

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device);
        let expected = original.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = restored.forward(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_missing_pretrained_file_is_error() {
        let device = Default::default();
        let result = BackboneConfig::new(vec![4])
            .init::<TestBackend>(&device)
            .load_pretrained(Path::new("/nonexistent/weights"), &device);
        assert!(matches!(result, Err(ClassifierError::Artifact(_))));
    }
}
