//! 画像正規化
//!
//! 任意サイズの画像を固定形状の `[1, H, W, 3]` テンソル（値域 0.0〜1.0）へ変換します。
//!
//! 処理順序は固定です:
//! 1. RGB 3チャネルへ変換
//! 2. `target` が確定サイズならリサイズ（バイリニア）。未確定なら元サイズのまま
//! 3. （任意）輝度チャネルのみ CLAHE でコントラスト補正
//! 4. 255 で割って 0.0〜1.0 へスケーリング
//! 5. 先頭にバッチ次元を付与

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::preprocess::contrast::enhance_contrast;

/// モデル入力形状
///
/// 高さ・幅は `None` の場合「未確定」を表します。チャネル数は常に3です。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub channels: u32,
}

impl InputShape {
    pub const CHANNELS: u32 = 3;

    /// 確定サイズの入力形状
    pub fn fixed(height: u32, width: u32) -> Self {
        Self {
            height: Some(height),
            width: Some(width),
            channels: Self::CHANNELS,
        }
    }

    /// 空間サイズ未確定の入力形状
    pub fn dynamic() -> Self {
        Self {
            height: None,
            width: None,
            channels: Self::CHANNELS,
        }
    }

    /// 高さと幅の両方が確定している場合のみ `(height, width)` を返す
    pub fn concrete(&self) -> Option<(u32, u32)> {
        match (self.height, self.width) {
            (Some(h), Some(w)) => Some((h, w)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels != Self::CHANNELS {
            return Err(ClassifierError::InvalidConfig(format!(
                "チャネル数は3である必要があります: {}",
                self.channels
            )));
        }
        if self.height == Some(0) || self.width == Some(0) {
            return Err(ClassifierError::InvalidConfig(
                "入力サイズに0は指定できません".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for InputShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dim = |d: Option<u32>| d.map_or_else(|| "?".to_string(), |v| v.to_string());
        write!(f, "{}x{}x{}", dim(self.height), dim(self.width), self.channels)
    }
}

/// 局所コントラスト補正（CLAHE）のパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContrastEnhancement {
    /// ヒストグラムのクリップ上限（タイル平均ビン高さに対する倍率）
    pub clip_limit: f32,
    /// タイル分割数 `[横, 縦]`
    pub tile_grid: [u32; 2],
}

impl Default for ContrastEnhancement {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: [8, 8],
        }
    }
}

/// 正規化設定
///
/// 学習時の設定は成果物メタデータに記録され、推論側で同じ値が使われます。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    pub target: InputShape,
    #[serde(default)]
    pub contrast: Option<ContrastEnhancement>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            target: InputShape::fixed(224, 224),
            contrast: Some(ContrastEnhancement::default()),
        }
    }
}

impl NormalizerConfig {
    pub fn new(target: InputShape) -> Self {
        Self {
            target,
            contrast: Some(ContrastEnhancement::default()),
        }
    }

    pub fn with_contrast(mut self, contrast: Option<ContrastEnhancement>) -> Self {
        self.contrast = contrast;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        if let Some(contrast) = &self.contrast {
            if !(contrast.clip_limit.is_finite() && contrast.clip_limit > 0.0) {
                return Err(ClassifierError::InvalidConfig(format!(
                    "clip_limit は正の値である必要があります: {}",
                    contrast.clip_limit
                )));
            }
            if contrast.tile_grid.contains(&0) {
                return Err(ClassifierError::InvalidConfig(
                    "tile_grid に0は指定できません".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// 正規化済みテンソル
///
/// 形状は `[1, height, width, 3]`、HWC順で平坦化して保持します。
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl NormalizedTensor {
    /// HWC順のデータからテンソルを作成
    pub fn from_hwc(data: Vec<f32>, height: usize, width: usize) -> Result<Self> {
        let expected = height * width * 3;
        if data.len() != expected || expected == 0 {
            return Err(ClassifierError::Preprocessing(format!(
                "テンソルサイズが不正です: {} (期待: {}x{}x3)",
                data.len(),
                height,
                width
            )));
        }
        Ok(Self { data, height, width })
    }

    /// `[batch, height, width, channels]`
    pub fn shape(&self) -> [usize; 4] {
        [1, self.height, self.width, 3]
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn pixel(&self, y: usize, x: usize, channel: usize) -> f32 {
        self.data[(y * self.width + x) * 3 + channel]
    }

    /// CHW順に並べ替えたデータ（Burn の Conv2d 入力用）
    pub fn to_chw(&self) -> Vec<f32> {
        let plane = self.height * self.width;
        let mut out = vec![0.0f32; plane * 3];
        for (i, px) in self.data.chunks_exact(3).enumerate() {
            out[i] = px[0];
            out[plane + i] = px[1];
            out[2 * plane + i] = px[2];
        }
        out
    }
}

/// デコード済み画像を正規化
pub fn normalize(image: &DynamicImage, config: &NormalizerConfig) -> Result<NormalizedTensor> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ClassifierError::Preprocessing(
            "空の画像は正規化できません".to_string(),
        ));
    }

    let rgb: RgbImage = image.to_rgb8();

    let rgb = match config.target.concrete() {
        Some((h, w)) if rgb.height() != h || rgb.width() != w => {
            image::imageops::resize(&rgb, w, h, FilterType::Triangle)
        }
        _ => rgb,
    };

    let rgb = match &config.contrast {
        Some(params) => enhance_contrast(&rgb, params),
        None => rgb,
    };

    let (width, height) = rgb.dimensions();
    let data = rgb
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 255.0)
        .collect();

    NormalizedTensor::from_hwc(data, height as usize, width as usize)
}

/// バイト列を画像としてデコード
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| ClassifierError::Decode {
        path: None,
        reason: e.to_string(),
    })
}

/// ファイルを画像として読み込む
///
/// 形式は拡張子ではなく先頭バイトから判定します（拡張子が実際の形式と異なる場合があるため）。
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    let decode_error = |reason: String| ClassifierError::Decode {
        path: Some(path.to_path_buf()),
        reason,
    };
    ImageReader::open(path)
        .map_err(|e| decode_error(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_error(e.to_string()))?
        .decode()
        .map_err(|e| decode_error(e.to_string()))
}

/// ファイルを読み込んで正規化
pub fn normalize_file(path: &Path, config: &NormalizerConfig) -> Result<NormalizedTensor> {
    let image = open_image(path)?;
    normalize(&image, config)
}

/// バイト列をデコードして正規化
///
/// 失敗時はエラーを送出せず `None` を返します。
pub fn normalize_bytes(bytes: &[u8], config: &NormalizerConfig) -> Option<NormalizedTensor> {
    match decode_image(bytes).and_then(|img| normalize(&img, config)) {
        Ok(tensor) => Some(tensor),
        Err(e) => {
            log::warn!("画像の正規化に失敗しました: {}", e);
            None
        }
    }
}
