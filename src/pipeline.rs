//! 学習パイプライン
//!
//! 読み込み → 分割 → クラス重み → モデル構築 → 2フェーズ学習 → テスト評価 の順に実行し、
//! 成果物（tar.gz）・学習レポート（JSON）・学習履歴（CSV）を書き出します。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::Serialize;

use crate::dataset::{compute_class_weights, split, DatasetLoader, SkippedFile, NUM_CLASSES};
use crate::error::ClassifierError;
use crate::metrics::EvaluationReport;
use crate::ml::{
    build, evaluate, BinaryClassifier, CheckpointInfo, CheckpointSink, EpochRecord, ExampleDataset,
    PhaseSummary, TwoPhaseTrainer,
};
use crate::model::{save_model, AppConfig, ArtifactMetadata};

/// 分割サイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitSizes {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

/// 学習レポート
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub class_names: Vec<String>,
    pub data_dir: PathBuf,
    /// クラスごとの読み込み成功数
    pub loaded_per_class: [usize; NUM_CLASSES],
    pub skipped: Vec<SkippedFile>,
    pub split_sizes: SplitSizes,
    pub class_weights: [f64; NUM_CLASSES],
    pub history: Vec<EpochRecord>,
    pub best_checkpoint: Option<CheckpointInfo>,
    pub phases: Vec<PhaseSummary>,
    pub evaluation: EvaluationReport,
    pub artifact_path: PathBuf,
    /// 書き出した特徴抽出器の重み
    pub backbone_path: Option<PathBuf>,
    pub trained_at: String,
}

impl TrainingReport {
    /// JSONファイルとして保存
    pub fn save_json(&self, path: &Path) -> Result<()> {
        create_parent_dir(path)?;
        let json = serde_json::to_string_pretty(self).context("Failed to serialize training report")?;
        fs::write(path, json).with_context(|| format!("Failed to write report: {:?}", path))?;
        Ok(())
    }
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }
    Ok(())
}

/// 学習履歴をCSVで保存
pub fn write_history_csv(path: &Path, history: &[EpochRecord]) -> Result<()> {
    create_parent_dir(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create history file: {:?}", path))?;
    for record in history {
        writer.serialize(record).context("Failed to write history row")?;
    }
    writer.flush().context("Failed to flush history file")?;
    Ok(())
}

/// チェックポイントを成果物ファイルとして保存
///
/// 書き込みは一時ファイル経由で置き換えるため、常に完了したエポックの重みだけが見えます。
pub struct ArtifactCheckpointSink {
    path: PathBuf,
    metadata: ArtifactMetadata,
    written: Option<PathBuf>,
}

impl ArtifactCheckpointSink {
    pub fn new(path: PathBuf, metadata: ArtifactMetadata) -> Self {
        Self {
            path,
            metadata,
            written: None,
        }
    }

    /// 最後に書き込んだ成果物のパス
    pub fn written(&self) -> Option<&Path> {
        self.written.as_deref()
    }

    fn write<B: Backend>(&mut self, model: &BinaryClassifier<B>, metadata: &ArtifactMetadata) -> Result<PathBuf> {
        let path = save_model(&self.path, model, metadata)?;
        self.written = Some(path.clone());
        Ok(path)
    }
}

impl<B: Backend> CheckpointSink<B> for ArtifactCheckpointSink {
    fn save(
        &mut self,
        model: &BinaryClassifier<B>,
        checkpoint: &CheckpointInfo,
    ) -> crate::error::Result<()> {
        let metadata = self.metadata.clone().with_checkpoint(
            checkpoint.phase.to_string(),
            checkpoint.epoch,
            checkpoint.val_accuracy,
            checkpoint.global_epoch,
        );
        let path = self
            .write(model, &metadata)
            .map_err(|e| ClassifierError::Artifact(format!("{:#}", e)))?;
        log::info!(
            "チェックポイントを保存しました: {} (検証正解率 {:.4})",
            path.display(),
            checkpoint.val_accuracy
        );
        Ok(())
    }
}

/// 学習パイプラインを実行
///
/// `progress` はエポック終了ごとに呼ばれます。
pub fn run_training<B, F>(config: &AppConfig, device: B::Device, progress: F) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    F: FnMut(&EpochRecord),
{
    config.validate()?;
    config.display();

    let class_names = config.dataset.class_names.clone();
    let batch_size = config.training.batch_size;

    // 1. 読み込み
    log::info!("[1/5] データセットを読み込み中: {}", config.dataset.data_dir.display());
    let loader = DatasetLoader::new(config.preprocessing);
    let loaded = loader.load(&config.dataset.data_dir, &class_names)?;
    let loaded_per_class = loaded.class_counts;
    let skipped = loaded.skipped.clone();
    if !skipped.is_empty() {
        log::warn!("{} 件のファイルをスキップしました", skipped.len());
    }

    // 2. 分割とクラス重み
    log::info!("[2/5] データセットを分割中");
    let dataset_split = split(
        loaded.examples,
        config.training.test_fraction,
        config.training.val_fraction,
        config.training.seed,
    )?;
    let (train_len, val_len, test_len) = dataset_split.sizes();
    let split_sizes = SplitSizes {
        train: train_len,
        validation: val_len,
        test: test_len,
    };
    let weights = compute_class_weights(&dataset_split.train)?;

    // 3. モデル構築
    log::info!("[3/5] モデルを構築中");
    let (model, handle) = build::<B>(&config.preprocessing.target, &config.model, &device)?;

    // 4. 学習
    log::info!("[4/5] 学習を開始");
    let metadata = ArtifactMetadata::new(
        class_names.clone(),
        config.declared_input_shape(),
        config.preprocessing,
        config.model.clone(),
    );
    let mut sink = ArtifactCheckpointSink::new(config.output.artifact_path.clone(), metadata.clone());

    let test = dataset_split.test;
    let train = ExampleDataset::new(dataset_split.train)?;
    let validation = ExampleDataset::new(dataset_split.validation)?;

    let trainer = TwoPhaseTrainer::<B>::new(
        config.training.clone(),
        config.augmentation.clone(),
        device.clone(),
    );
    let outcome = trainer.fit(model, handle, &train, &validation, weights, &mut sink, progress)?;

    // 最良モデルを最終成果物として書き直す（学習エポック総数を記録）
    let final_metadata = match &outcome.best_checkpoint {
        Some(checkpoint) => metadata.with_checkpoint(
            checkpoint.phase.to_string(),
            checkpoint.epoch,
            checkpoint.val_accuracy,
            outcome.history.len(),
        ),
        None => ArtifactMetadata {
            epochs_trained: outcome.history.len(),
            ..metadata
        },
    };
    let artifact_path = sink.write(&outcome.model, &final_metadata)?;
    log::info!("モデルを保存しました: {}", artifact_path.display());

    let backbone_path = match &config.output.backbone_path {
        Some(path) => {
            let written = outcome.model.backbone().save_weights(path)?;
            log::info!("特徴抽出器の重みを保存しました: {}", written.display());
            Some(written)
        }
        None => None,
    };

    // 5. 評価
    log::info!("[5/5] テスト分割を評価中");
    let evaluation = evaluate(&outcome.model, &test, &class_names, batch_size, &device)?;
    log::info!("\n{}", evaluation.summary());

    let report = TrainingReport {
        class_names,
        data_dir: config.dataset.data_dir.clone(),
        loaded_per_class,
        skipped,
        split_sizes,
        class_weights: weights.as_array(),
        history: outcome.history,
        best_checkpoint: outcome.best_checkpoint,
        phases: outcome.phases,
        evaluation,
        artifact_path,
        backbone_path,
        trained_at: final_metadata.trained_at,
    };

    report.save_json(&config.output.report_path)?;
    write_history_csv(&config.output.history_path, &report.history)?;
    log::info!(
        "レポートを保存しました: {}, {}",
        config.output.report_path.display(),
        config.output.history_path.display()
    );

    Ok(report)
}
