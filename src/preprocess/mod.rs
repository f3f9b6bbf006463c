//! 画像前処理
//!
//! 学習・評価・推論のすべてが `normalizer` の同じ関数を通ります。
//! `augment` は学習データ専用です。

pub mod normalizer;
pub mod contrast;
pub mod augment;

pub use normalizer::{
    decode_image, normalize, normalize_bytes, normalize_file, open_image, ContrastEnhancement,
    InputShape, NormalizedTensor, NormalizerConfig,
};
pub use contrast::{clahe, enhance_contrast, lab_to_rgb, rgb_to_lab};
pub use augment::{AugmentationConfig, Augmenter};
