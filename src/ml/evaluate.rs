//! 検証・テスト分割の推論と評価
//!
//! 拡張は行わず、読み込み時に正規化済みのテンソルをそのまま使います。

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, ElementConversion},
};

use crate::dataset::LabeledExample;
use crate::error::{ClassifierError, Result};
use crate::metrics::{predict_label, EvaluationReport};
use crate::ml::batcher::{ExampleBatch, ExampleBatcher};
use crate::ml::classifier::BinaryClassifier;
use crate::ml::loss::{batch_loss, unweighted_bce};

/// 分割全体のロジット・正解ラベル・重みなし損失
#[derive(Debug, Clone, PartialEq)]
pub struct SplitScores {
    pub logits: Vec<f32>,
    pub labels: Vec<usize>,
    /// サンプル平均の損失（空なら NaN）
    pub loss: f64,
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

impl SplitScores {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 陽性クラスの確率
    pub fn probabilities(&self) -> Vec<f32> {
        self.logits.iter().map(|&z| sigmoid(z)).collect()
    }

    pub fn accuracy(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let correct = self
            .probabilities()
            .iter()
            .zip(&self.labels)
            .filter(|(&p, &y)| predict_label(p) == y)
            .count();
        correct as f64 / self.len() as f64
    }
}

/// バッチ単位で推論してロジットと損失を集める
///
/// 損失は学習時と同じ `BinaryCrossEntropyLoss`（重みなし）で計算し、
/// バッチ平均をサンプル数で重み付けして分割全体の平均にします。
pub fn score_examples<B: Backend>(
    model: &BinaryClassifier<B>,
    examples: &[LabeledExample],
    batch_size: usize,
    device: &B::Device,
) -> Result<SplitScores> {
    if batch_size == 0 {
        return Err(ClassifierError::InvalidConfig(
            "batch_size は1以上が必要です".to_string(),
        ));
    }

    let batcher = ExampleBatcher::new();
    let criterion = unweighted_bce::<B>(device);
    let mut logits = Vec::with_capacity(examples.len());
    let mut labels = Vec::with_capacity(examples.len());
    let mut loss_sum = 0.0f64;

    for chunk in examples.chunks(batch_size) {
        let batch: ExampleBatch<B> = batcher.batch(chunk.to_vec(), device);
        let output = model.forward(batch.images);
        let loss: f32 = batch_loss(&criterion, output.clone(), batch.targets).into_scalar().elem();
        loss_sum += loss as f64 * chunk.len() as f64;

        let output = output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Backend(format!("推論結果の取得エラー: {:?}", e)))?;
        logits.extend(output);
        labels.extend(batch.labels);
    }

    let loss = if examples.is_empty() {
        f64::NAN
    } else {
        loss_sum / examples.len() as f64
    };
    Ok(SplitScores { logits, labels, loss })
}

/// テスト分割を評価
pub fn evaluate<B: Backend>(
    model: &BinaryClassifier<B>,
    test: &[LabeledExample],
    class_names: &[String],
    batch_size: usize,
    device: &B::Device,
) -> Result<EvaluationReport> {
    if test.is_empty() {
        return Err(ClassifierError::InvalidConfig(
            "テスト分割が空です".to_string(),
        ));
    }

    log::info!("テスト分割を評価中: {} 枚", test.len());
    let scores = score_examples(model, test, batch_size, device)?;
    let report = EvaluationReport::from_scores(
        &scores.labels,
        &scores.probabilities(),
        scores.loss,
        class_names,
    )?;
    log::info!(
        "テスト正解率: {:.4}, 適合率: {:.4}, 再現率: {:.4}, F1: {:.4}",
        report.accuracy,
        report.precision,
        report.recall,
        report.f1
    );
    Ok(report)
}
