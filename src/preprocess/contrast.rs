//! 局所コントラスト補正
//!
//! RGB を L*a*b* に変換し、輝度 L のみに CLAHE（コントラスト制限付き適応ヒストグラム平坦化）
//! を適用してから RGB に戻します。色差 a/b は浮動小数のまま保持します。
//!
//! L は 8bit 表現（L × 255 / 100）でヒストグラム化します。

use image::{Rgb, RgbImage};

use crate::preprocess::normalizer::ContrastEnhancement;

const HIST_SIZE: usize = 256;

// D65 白色点
const XN: f32 = 0.950456;
const ZN: f32 = 1.088754;

const LAB_EPSILON: f32 = 0.008856;
const LAB_KAPPA: f32 = 903.3;

/// 輝度チャネルのみ CLAHE で補正した画像を返す
pub fn enhance_contrast(image: &RgbImage, params: &ContrastEnhancement) -> RgbImage {
    let (width, height) = image.dimensions();
    let pixel_count = (width * height) as usize;

    let mut lightness = Vec::with_capacity(pixel_count);
    let mut chroma = Vec::with_capacity(pixel_count);

    for px in image.pixels() {
        let [l, a, b] = rgb_to_lab(px.0);
        lightness.push((l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8);
        chroma.push((a, b));
    }

    let equalized = clahe(
        &lightness,
        width as usize,
        height as usize,
        params.clip_limit,
        params.tile_grid,
    );

    let mut out = RgbImage::new(width, height);
    for (i, px) in out.pixels_mut().enumerate() {
        let l = equalized[i] as f32 * 100.0 / 255.0;
        let (a, b) = chroma[i];
        *px = Rgb(lab_to_rgb([l, a, b]));
    }
    out
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

fn lab_f_inv(f: f32) -> f32 {
    let cube = f * f * f;
    if cube > LAB_EPSILON {
        cube
    } else {
        (f - 16.0 / 116.0) / 7.787
    }
}

/// 8bit RGB → L*a*b*（L: 0〜100, a/b: 符号付き）
pub fn rgb_to_lab(rgb: [u8; 3]) -> [f32; 3] {
    let r = srgb_to_linear(rgb[0] as f32 / 255.0);
    let g = srgb_to_linear(rgb[1] as f32 / 255.0);
    let b = srgb_to_linear(rgb[2] as f32 / 255.0);

    let x = (0.412453 * r + 0.357580 * g + 0.180423 * b) / XN;
    let y = 0.212671 * r + 0.715160 * g + 0.072169 * b;
    let z = (0.019334 * r + 0.119193 * g + 0.950227 * b) / ZN;

    let fx = lab_f(x);
    let fy = lab_f(y);
    let fz = lab_f(z);

    let l = if y > LAB_EPSILON {
        116.0 * fy - 16.0
    } else {
        LAB_KAPPA * y
    };

    [l, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// L*a*b* → 8bit RGB（範囲外は飽和）
pub fn lab_to_rgb(lab: [f32; 3]) -> [u8; 3] {
    let [l, a, b] = lab;

    let (y, fy) = if l > LAB_KAPPA * LAB_EPSILON {
        let fy = (l + 16.0) / 116.0;
        (fy * fy * fy, fy)
    } else {
        let y = l / LAB_KAPPA;
        (y, 7.787 * y + 16.0 / 116.0)
    };

    let x = lab_f_inv(a / 500.0 + fy) * XN;
    let z = lab_f_inv(fy - b / 200.0) * ZN;

    let r = 3.240479 * x - 1.537150 * y - 0.498535 * z;
    let g = -0.969256 * x + 1.875991 * y + 0.041556 * z;
    let bl = 0.055648 * x - 0.204043 * y + 1.057311 * z;

    let to_u8 = |c: f32| (linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0).round().clamp(0.0, 255.0) as u8;
    [to_u8(r), to_u8(g), to_u8(bl)]
}

// reflect-101 で画像外の座標を折り返す
fn reflect_101(i: usize, len: usize) -> usize {
    if len == 1 {
        0
    } else if i < len {
        i
    } else {
        2 * (len - 1) - i
    }
}

/// 1チャネル 8bit 画像に CLAHE を適用
///
/// `tile_grid` は `[横, 縦]` のタイル数。画像がタイル数で割り切れない場合は
/// reflect-101 で右端・下端をパディングした領域でヒストグラムを作ります。
pub fn clahe(
    plane: &[u8],
    width: usize,
    height: usize,
    clip_limit: f32,
    tile_grid: [u32; 2],
) -> Vec<u8> {
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let grid_x = (tile_grid[0] as usize).clamp(1, width);
    let grid_y = (tile_grid[1] as usize).clamp(1, height);
    let tile_w = width.div_ceil(grid_x);
    let tile_h = height.div_ceil(grid_y);
    let tile_area = tile_w * tile_h;

    let clip = if clip_limit > 0.0 {
        ((clip_limit * tile_area as f32 / HIST_SIZE as f32) as usize).max(1)
    } else {
        usize::MAX
    };
    let lut_scale = 255.0 / tile_area as f32;

    // タイルごとのルックアップテーブル
    let mut luts = vec![[0u8; HIST_SIZE]; grid_x * grid_y];

    for ty in 0..grid_y {
        for tx in 0..grid_x {
            let mut hist = [0usize; HIST_SIZE];
            for y in ty * tile_h..(ty + 1) * tile_h {
                let sy = reflect_101(y, height);
                for x in tx * tile_w..(tx + 1) * tile_w {
                    let sx = reflect_101(x, width);
                    hist[plane[sy * width + sx] as usize] += 1;
                }
            }

            if clip != usize::MAX {
                let mut clipped = 0usize;
                for bin in hist.iter_mut() {
                    if *bin > clip {
                        clipped += *bin - clip;
                        *bin = clip;
                    }
                }

                let batch = clipped / HIST_SIZE;
                let mut residual = clipped - batch * HIST_SIZE;
                for bin in hist.iter_mut() {
                    *bin += batch;
                }
                if residual != 0 {
                    let step = (HIST_SIZE / residual).max(1);
                    let mut i = 0;
                    while i < HIST_SIZE && residual > 0 {
                        hist[i] += 1;
                        residual -= 1;
                        i += step;
                    }
                }
            }

            let lut = &mut luts[ty * grid_x + tx];
            let mut sum = 0usize;
            for (i, count) in hist.iter().enumerate() {
                sum += count;
                lut[i] = (sum as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    // 隣接4タイルのLUTをバイリニア補間
    let mut out = vec![0u8; width * height];
    let inv_tw = 1.0 / tile_w as f32;
    let inv_th = 1.0 / tile_h as f32;

    for y in 0..height {
        let tyf = y as f32 * inv_th - 0.5;
        let ty1_raw = tyf.floor();
        let ya = tyf - ty1_raw;
        let ty1 = (ty1_raw as isize).max(0) as usize;
        let ty2 = ((ty1_raw as isize + 1) as usize).min(grid_y - 1);

        for x in 0..width {
            let txf = x as f32 * inv_tw - 0.5;
            let tx1_raw = txf.floor();
            let xa = txf - tx1_raw;
            let tx1 = (tx1_raw as isize).max(0) as usize;
            let tx2 = ((tx1_raw as isize + 1) as usize).min(grid_x - 1);

            let v = plane[y * width + x] as usize;
            let top = luts[ty1 * grid_x + tx1][v] as f32 * (1.0 - xa)
                + luts[ty1 * grid_x + tx2][v] as f32 * xa;
            let bottom = luts[ty2 * grid_x + tx1][v] as f32 * (1.0 - xa)
                + luts[ty2 * grid_x + tx2][v] as f32 * xa;
            let res = top * (1.0 - ya) + bottom * ya;

            out[y * width + x] = res.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}
