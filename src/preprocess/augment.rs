//! 学習データ拡張
//!
//! 正規化済みテンソル（0.0〜1.0）に対してランダムなアフィン変換・チャネルシフト・
//! 反転・明度変化を適用します。検証・テストデータには使用しません。

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::preprocess::normalizer::NormalizedTensor;

/// データ拡張設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// 回転角の範囲（度）
    pub rotation_range: f32,
    /// 横方向シフト（幅に対する割合）
    pub width_shift_range: f32,
    /// 縦方向シフト（高さに対する割合）
    pub height_shift_range: f32,
    /// せん断角の範囲（度）
    pub shear_range: f32,
    /// ズーム範囲: [1 - zoom, 1 + zoom]
    pub zoom_range: f32,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
    /// 明度倍率の範囲 [min, max]
    pub brightness_range: [f32; 2],
    /// チャネルシフト量（0〜255スケール）
    pub channel_shift_range: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 30.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.3,
            horizontal_flip: true,
            vertical_flip: true,
            brightness_range: [0.8, 1.2],
            channel_shift_range: 20.0,
        }
    }
}

impl AugmentationConfig {
    /// 何も変換しない設定
    pub fn identity() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            vertical_flip: false,
            brightness_range: [1.0, 1.0],
            channel_shift_range: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("rotation_range", self.rotation_range),
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
            ("shear_range", self.shear_range),
            ("channel_shift_range", self.channel_shift_range),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ClassifierError::InvalidConfig(format!(
                    "{} は0以上である必要があります: {}",
                    name, value
                )));
            }
        }
        if !(0.0..1.0).contains(&self.zoom_range) {
            return Err(ClassifierError::InvalidConfig(format!(
                "zoom_range は [0, 1) の範囲で指定してください: {}",
                self.zoom_range
            )));
        }
        let [lo, hi] = self.brightness_range;
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            return Err(ClassifierError::InvalidConfig(format!(
                "brightness_range が不正です: [{}, {}]",
                lo, hi
            )));
        }
        Ok(())
    }
}

/// 1回分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
struct TransformParams {
    theta: f32,
    shift_y: f32,
    shift_x: f32,
    shear: f32,
    zoom_y: f32,
    zoom_x: f32,
    flip_horizontal: bool,
    flip_vertical: bool,
    brightness: f32,
    channel_shift: f32,
}

/// データ拡張器
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    fn sample<R: Rng>(&self, rng: &mut R, height: usize, width: usize) -> TransformParams {
        let c = &self.config;
        let zoom = |rng: &mut R| {
            if c.zoom_range > 0.0 {
                rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range)
            } else {
                1.0
            }
        };
        let [lo, hi] = c.brightness_range;

        TransformParams {
            theta: symmetric(rng, c.rotation_range).to_radians(),
            shift_y: symmetric(rng, c.height_shift_range) * height as f32,
            shift_x: symmetric(rng, c.width_shift_range) * width as f32,
            shear: symmetric(rng, c.shear_range).to_radians(),
            zoom_y: zoom(rng),
            zoom_x: zoom(rng),
            flip_horizontal: c.horizontal_flip && rng.gen_bool(0.5),
            flip_vertical: c.vertical_flip && rng.gen_bool(0.5),
            brightness: if hi > lo { rng.gen_range(lo..=hi) } else { lo },
            channel_shift: symmetric(rng, c.channel_shift_range) / 255.0,
        }
    }

    /// ランダムに拡張したテンソルを返す
    pub fn apply<R: Rng>(&self, input: &NormalizedTensor, rng: &mut R) -> NormalizedTensor {
        let params = self.sample(rng, input.height(), input.width());
        transform(input, &params)
    }
}

// 出力座標→入力座標の逆写像でサンプリングする（拡大・縮小、せん断、平行移動、回転の順）
fn transform(input: &NormalizedTensor, p: &TransformParams) -> NormalizedTensor {
    let (h, w) = (input.height(), input.width());
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;
    let (sin_t, cos_t) = p.theta.sin_cos();
    let (sin_s, cos_s) = p.shear.sin_cos();

    let mut out = vec![0.0f32; h * w * 3];

    for y in 0..h {
        for x in 0..w {
            let mut r = (y as f32 - cy) * p.zoom_y;
            let mut c = (x as f32 - cx) * p.zoom_x;

            let sheared_r = r - sin_s * c;
            c *= cos_s;
            r = sheared_r + p.shift_y;
            c += p.shift_x;

            let src_r = cos_t * r - sin_t * c + cy;
            let src_c = sin_t * r + cos_t * c + cx;

            let dst = (y * w + x) * 3;
            sample_bilinear(input, src_r, src_c, &mut out[dst..dst + 3]);
        }
    }

    if p.channel_shift != 0.0 {
        let (lo, hi) = out
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        for v in out.iter_mut() {
            *v = (*v + p.channel_shift).clamp(lo, hi);
        }
    }

    if p.flip_horizontal {
        for row in out.chunks_exact_mut(w * 3) {
            for x in 0..w / 2 {
                for ch in 0..3 {
                    row.swap(x * 3 + ch, (w - 1 - x) * 3 + ch);
                }
            }
        }
    }

    if p.flip_vertical {
        let stride = w * 3;
        for y in 0..h / 2 {
            let (top, bottom) = out.split_at_mut((h - 1 - y) * stride);
            top[y * stride..(y + 1) * stride].swap_with_slice(&mut bottom[..stride]);
        }
    }

    if p.brightness != 1.0 {
        for v in out.iter_mut() {
            *v = (*v * p.brightness).clamp(0.0, 1.0);
        }
    }

    // 形状は入力と同じなので失敗しない
    NormalizedTensor::from_hwc(out, h, w).unwrap_or_else(|_| input.clone())
}

// 画像外は最近傍の端ピクセルで埋める
fn sample_bilinear(input: &NormalizedTensor, r: f32, c: f32, dst: &mut [f32]) {
    let (h, w) = (input.height(), input.width());
    let r = r.clamp(0.0, (h - 1) as f32);
    let c = c.clamp(0.0, (w - 1) as f32);
    let r0 = r.floor() as usize;
    let c0 = c.floor() as usize;
    let r1 = (r0 + 1).min(h - 1);
    let c1 = (c0 + 1).min(w - 1);
    let fr = r - r0 as f32;
    let fc = c - c0 as f32;

    for (ch, out) in dst.iter_mut().enumerate() {
        let top = input.pixel(r0, c0, ch) * (1.0 - fc) + input.pixel(r0, c1, ch) * fc;
        let bottom = input.pixel(r1, c0, ch) * (1.0 - fc) + input.pixel(r1, c1, ch) * fc;
        *out = top * (1.0 - fr) + bottom * fr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(h: usize, w: usize) -> NormalizedTensor {
        let data = (0..h * w * 3).map(|i| (i % 97) as f32 / 97.0).collect();
        NormalizedTensor::from_hwc(data, h, w).unwrap()
    }

    fn params() -> TransformParams {
        TransformParams {
            theta: 0.0,
            shift_y: 0.0,
            shift_x: 0.0,
            shear: 0.0,
            zoom_y: 1.0,
            zoom_x: 1.0,
            flip_horizontal: false,
            flip_vertical: false,
            brightness: 1.0,
            channel_shift: 0.0,
        }
    }

    #[test]
    fn test_identity_config_is_noop() {
        let input = ramp(9, 7);
        let augmenter = Augmenter::new(AugmentationConfig::identity());
        let mut rng = StdRng::seed_from_u64(1);
        let out = augmenter.apply(&input, &mut rng);
        for (a, b) in input.as_slice().iter().zip(out.as_slice()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_same_seed_same_result() {
        let input = ramp(16, 16);
        let augmenter = Augmenter::new(AugmentationConfig::default());
        let a = augmenter.apply(&input, &mut StdRng::seed_from_u64(7));
        let b = augmenter.apply(&input, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_output_stays_in_unit_range() {
        let input = ramp(12, 20);
        let augmenter = Augmenter::new(AugmentationConfig {
            brightness_range: [1.5, 2.0],
            channel_shift_range: 80.0,
            ..AugmentationConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            let out = augmenter.apply(&input, &mut rng);
            assert_eq!(out.shape(), input.shape());
            assert!(out.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_horizontal_flip() {
        let input = ramp(3, 4);
        let out = transform(&input, &TransformParams { flip_horizontal: true, ..params() });
        for y in 0..3 {
            for x in 0..4 {
                for ch in 0..3 {
                    assert_eq!(out.pixel(y, x, ch), input.pixel(y, 3 - x, ch));
                }
            }
        }
    }

    #[test]
    fn test_vertical_flip() {
        let input = ramp(5, 2);
        let out = transform(&input, &TransformParams { flip_vertical: true, ..params() });
        for y in 0..5 {
            for x in 0..2 {
                assert_eq!(out.pixel(y, x, 1), input.pixel(4 - y, x, 1));
            }
        }
    }

    #[test]
    fn test_shift_fills_with_edge_pixels() {
        let input = ramp(4, 4);
        // 入力座標 = 出力座標 + 1 なので、右端列は端ピクセルで埋まる
        let out = transform(&input, &TransformParams { shift_x: 1.0, ..params() });
        assert!((out.pixel(0, 0, 0) - input.pixel(0, 1, 0)).abs() < 1e-6);
        assert!((out.pixel(0, 3, 0) - input.pixel(0, 3, 0)).abs() < 1e-6);
    }

    #[test]
    fn test_validate() {
        assert!(AugmentationConfig::default().validate().is_ok());
        let bad = AugmentationConfig {
            zoom_range: 1.0,
            ..AugmentationConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
