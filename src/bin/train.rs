//! 学習用CLI
//!
//! 設定ファイル（JSON）を読み込み、コマンドライン引数で上書きしてから学習パイプラインを実行します。

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::{Parser, ValueEnum};
use env_logger::Env;

use pet_classifier_lib::ml::EpochRecord;
use pet_classifier_lib::model::{AppConfig, DeviceType};
use pet_classifier_lib::pipeline::{run_training, TrainingReport};
use pet_classifier_lib::preprocess::InputShape;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Wgpu,
    Cpu,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Wgpu => DeviceType::Wgpu,
            DeviceArg::Cpu => DeviceType::Cpu,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "train", version, about = "2クラス画像分類器を転移学習で学習します")]
struct Cli {
    /// 設定ファイル（存在しなければデフォルト設定）
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// クラスごとのサブディレクトリを持つデータセットのルート
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// 入力画像サイズ（正方形）
    #[arg(long)]
    image_size: Option<u32>,

    /// 成果物（tar.gz）の出力先
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 計算デバイス
    #[arg(long, value_enum)]
    device: Option<DeviceArg>,

    /// フェーズA（分類ヘッドのみ）のエポック数
    #[arg(long)]
    head_epochs: Option<usize>,

    /// フェーズB（微調整）のエポック数
    #[arg(long)]
    fine_tune_epochs: Option<usize>,

    /// 学習後の特徴抽出器の重みを書き出す（次の学習の事前学習済み重みに使える）
    #[arg(long)]
    export_backbone: Option<PathBuf>,

    /// 成果物の入力形状を未確定（任意サイズ）として宣言
    #[arg(long)]
    dynamic_input: bool,

    /// 上書き後の設定を設定ファイルに保存
    #[arg(long)]
    save_config: bool,
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(dir) = &cli.data_dir {
        config.dataset.data_dir = dir.clone();
    }
    if let Some(size) = cli.image_size {
        config.preprocessing.target = InputShape::fixed(size, size);
    }
    if let Some(output) = &cli.output {
        config.output.artifact_path = output.clone();
    }
    if let Some(device) = cli.device {
        config.device_type = device.into();
    }
    if let Some(epochs) = cli.head_epochs {
        config.training.head_phase.epochs = epochs;
    }
    if let Some(epochs) = cli.fine_tune_epochs {
        config.training.fine_tune_phase.epochs = epochs;
    }
    if let Some(path) = &cli.export_backbone {
        config.output.backbone_path = Some(path.clone());
    }
    if cli.dynamic_input {
        config.model.dynamic_input = true;
    }
}

fn log_epoch(record: &EpochRecord) {
    log::info!(
        "[{}] Epoch {} (通算 {}): loss={:.4}, acc={:.4}, val_loss={:.4}, val_acc={:.4}, lr={:.2e}",
        record.phase,
        record.epoch,
        record.global_epoch,
        record.train_loss,
        record.train_accuracy,
        record.val_loss,
        record.val_accuracy,
        record.learning_rate
    );
}

fn print_summary(report: &TrainingReport) {
    println!("\n=== 学習結果 ===");
    println!(
        "読み込み: {} = {}, {} = {} (スキップ {})",
        report.class_names[0],
        report.loaded_per_class[0],
        report.class_names[1],
        report.loaded_per_class[1],
        report.skipped.len()
    );
    println!(
        "分割: 学習 {} / 検証 {} / テスト {}",
        report.split_sizes.train, report.split_sizes.validation, report.split_sizes.test
    );
    for phase in &report.phases {
        println!(
            "フェーズ {}: {} エポック{}",
            phase.phase,
            phase.epochs_run,
            if phase.stopped_early { "（早期終了）" } else { "" }
        );
    }
    if let Some(best) = &report.best_checkpoint {
        println!(
            "最良チェックポイント: {} エポック {} (検証正解率 {:.4})",
            best.phase, best.epoch, best.val_accuracy
        );
    }
    println!("{}", report.evaluation.summary());
    println!("成果物: {}", report.artifact_path.display());
    if let Some(path) = &report.backbone_path {
        println!("特徴抽出器の重み: {}", path.display());
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_or_default(&cli.config);
    apply_overrides(&mut config, &cli);

    if cli.save_config {
        config.save(&cli.config)?;
        log::info!("設定を保存しました: {}", cli.config.display());
    }

    let report = match config.device_type {
        DeviceType::Wgpu => {
            run_training::<Autodiff<Wgpu>, _>(&config, WgpuDevice::default(), log_epoch)?
        }
        DeviceType::Cpu => {
            run_training::<Autodiff<NdArray<f32>>, _>(&config, Default::default(), log_epoch)?
        }
    };

    print_summary(&report);
    Ok(())
}
