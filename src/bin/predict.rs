//! 推論用CLI
//!
//! 画像ファイルまたはデータURLを分類し、1件ごとにJSONを1行出力します。

#![recursion_limit = "256"]

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn_ndarray::NdArray;
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use serde::Serialize;

use pet_classifier_lib::model::{AppConfig, DeviceType};
use pet_classifier_lib::serving::{PredictionResponse, PredictionService};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Wgpu,
    Cpu,
}

#[derive(Debug, Parser)]
#[command(name = "predict", version, about = "学習済みモデルで画像を分類します")]
struct Cli {
    /// 分類する画像ファイル
    images: Vec<PathBuf>,

    /// 設定ファイル（存在しなければデフォルト設定）
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 成果物（tar.gz）のパス
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 標準入力からデータURL（またはBase64文字列）を読み込む
    #[arg(long)]
    stdin: bool,

    /// 学習時のコントラスト補正を推論で適用しない
    #[arg(long)]
    no_parity: bool,

    /// 計算デバイス
    #[arg(long, value_enum)]
    device: Option<DeviceArg>,
}

#[derive(Serialize)]
struct Line<'a> {
    input: &'a str,
    #[serde(flatten)]
    response: PredictionResponse,
}

fn emit(input: &str, response: PredictionResponse) -> Result<bool> {
    let ok = response.is_prediction();
    println!("{}", serde_json::to_string(&Line { input, response })?);
    Ok(ok)
}

fn run<B: Backend>(cli: &Cli, config: &AppConfig, device: B::Device) -> Result<usize> {
    let model_path = cli
        .model
        .clone()
        .unwrap_or_else(|| config.serving.model_path.clone());
    let parity = config.serving.enforce_training_parity && !cli.no_parity;
    let service = PredictionService::<B>::load(&model_path, device, parity);

    let mut failures = 0;

    if cli.stdin {
        let mut upload = String::new();
        std::io::stdin()
            .read_to_string(&mut upload)
            .context("標準入力の読み込みに失敗しました")?;
        if !emit("<stdin>", service.predict_upload(&upload))? {
            failures += 1;
        }
    }

    for path in &cli.images {
        let input = path.to_string_lossy();
        let response = match std::fs::read(path) {
            Ok(bytes) => service.predict_bytes(&bytes),
            Err(e) => PredictionResponse::InvalidImage {
                reason: format!("ファイルを読み込めません: {}", e),
            },
        };
        if !emit(&input, response)? {
            failures += 1;
        }
    }

    Ok(failures)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.images.is_empty() && !cli.stdin {
        anyhow::bail!("画像ファイルを指定するか --stdin を指定してください");
    }

    let config = AppConfig::load_or_default(&cli.config);
    let device_type = match cli.device {
        Some(DeviceArg::Wgpu) => DeviceType::Wgpu,
        Some(DeviceArg::Cpu) => DeviceType::Cpu,
        None => config.device_type,
    };

    let failures = match device_type {
        DeviceType::Wgpu => run::<Wgpu>(&cli, &config, WgpuDevice::default())?,
        DeviceType::Cpu => run::<NdArray<f32>>(&cli, &config, Default::default())?,
    };

    if failures > 0 {
        anyhow::bail!("{} 件の分類に失敗しました", failures);
    }
    Ok(())
}
