//! テスト分割の評価指標
//!
//! スコア（シグモイド出力）を閾値 0.5 で二値化し、正解率・適合率・再現率・F1・
//! 混同行列・クラス別レポートを計算します。陽性クラスはインデックス1です。

pub mod report;

use serde::{Deserialize, Serialize};

use crate::dataset::NUM_CLASSES;
use crate::error::{ClassifierError, Result};

pub use report::{ClassMetrics, ClassificationReport};

/// 陽性と判定する閾値（スコア >= 閾値 で陽性）
pub const DECISION_THRESHOLD: f32 = 0.5;

/// 陽性クラスのインデックス
pub const POSITIVE_CLASS: usize = 1;

/// スコアからクラスを決める
pub fn predict_label(score: f32) -> usize {
    if score >= DECISION_THRESHOLD {
        POSITIVE_CLASS
    } else {
        1 - POSITIVE_CLASS
    }
}

pub(crate) fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// 混同行列（行: 正解, 列: 予測）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub matrix: [[usize; NUM_CLASSES]; NUM_CLASSES],
}

impl ConfusionMatrix {
    pub fn from_labels(y_true: &[usize], y_pred: &[usize]) -> Self {
        let mut matrix = [[0usize; NUM_CLASSES]; NUM_CLASSES];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            matrix[t][p] += 1;
        }
        Self { matrix }
    }

    pub fn true_positives(&self) -> usize {
        self.matrix[POSITIVE_CLASS][POSITIVE_CLASS]
    }

    pub fn false_positives(&self) -> usize {
        self.matrix[1 - POSITIVE_CLASS][POSITIVE_CLASS]
    }

    pub fn false_negatives(&self) -> usize {
        self.matrix[POSITIVE_CLASS][1 - POSITIVE_CLASS]
    }

    pub fn true_negatives(&self) -> usize {
        self.matrix[1 - POSITIVE_CLASS][1 - POSITIVE_CLASS]
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..NUM_CLASSES).map(|k| self.matrix[k][k]).sum()
    }

    /// クラス `k` の正解件数
    pub fn support(&self, k: usize) -> usize {
        self.matrix[k].iter().sum()
    }

    /// クラス `k` と予測された件数
    pub fn predicted(&self, k: usize) -> usize {
        self.matrix.iter().map(|row| row[k]).sum()
    }
}

/// 評価結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub num_examples: usize,
    /// 重みなし二値交差エントロピー
    pub loss: f64,
    pub accuracy: f64,
    /// 陽性クラスの適合率
    pub precision: f64,
    /// 陽性クラスの再現率
    pub recall: f64,
    pub f1: f64,
    pub threshold: f32,
    pub confusion_matrix: ConfusionMatrix,
    pub classification_report: ClassificationReport,
}

impl EvaluationReport {
    /// 正解ラベル・スコア・損失から評価結果を作成
    ///
    /// 損失は推論時に損失モジュールで計算済みのものを受け取ります。
    pub fn from_scores(
        labels: &[usize],
        scores: &[f32],
        loss: f64,
        class_names: &[String],
    ) -> Result<Self> {
        if labels.len() != scores.len() {
            return Err(ClassifierError::InvalidConfig(format!(
                "ラベル数とスコア数が一致しません: {} != {}",
                labels.len(),
                scores.len()
            )));
        }
        if labels.is_empty() {
            return Err(ClassifierError::InvalidConfig(
                "評価対象のサンプルがありません".to_string(),
            ));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= NUM_CLASSES) {
            return Err(ClassifierError::InvalidConfig(format!(
                "ラベルが範囲外です: {}",
                bad
            )));
        }

        let predictions: Vec<usize> = scores.iter().map(|&s| predict_label(s)).collect();
        let cm = ConfusionMatrix::from_labels(labels, &predictions);

        let tp = cm.true_positives() as f64;
        let precision = safe_div(tp, tp + cm.false_positives() as f64);
        let recall = safe_div(tp, tp + cm.false_negatives() as f64);
        let f1 = safe_div(2.0 * precision * recall, precision + recall);

        Ok(Self {
            num_examples: labels.len(),
            loss,
            accuracy: safe_div(cm.correct() as f64, cm.total() as f64),
            precision,
            recall,
            f1,
            threshold: DECISION_THRESHOLD,
            confusion_matrix: cm,
            classification_report: ClassificationReport::from_confusion(&cm, class_names),
        })
    }

    /// コンソール向けの要約
    pub fn summary(&self) -> String {
        let m = &self.confusion_matrix.matrix;
        format!(
            "テスト結果 ({} 枚)\n正解率: {:.4}\n適合率: {:.4}\n再現率: {:.4}\nF1: {:.4}\n損失: {:.4}\n\n{}\n混同行列 (行: 正解, 列: 予測)\n  [{:>5} {:>5}]\n  [{:>5} {:>5}]",
            self.num_examples,
            self.accuracy,
            self.precision,
            self.recall,
            self.f1,
            self.loss,
            self.classification_report,
            m[0][0],
            m[0][1],
            m[1][0],
            m[1][1],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["cat".to_string(), "dog".to_string()]
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(predict_label(0.5), 1);
        assert_eq!(predict_label(0.4999), 0);
        assert_eq!(predict_label(0.99), 1);
    }

    #[test]
    fn test_confusion_matrix_counts() {
        let cm = ConfusionMatrix::from_labels(&[0, 0, 1, 1, 1], &[0, 1, 1, 0, 1]);
        assert_eq!(cm.matrix, [[1, 1], [1, 2]]);
        assert_eq!(cm.true_positives(), 2);
        assert_eq!(cm.false_positives(), 1);
        assert_eq!(cm.false_negatives(), 1);
        assert_eq!(cm.true_negatives(), 1);
        assert_eq!(cm.total(), 5);
        assert_eq!(cm.support(1), 3);
        assert_eq!(cm.predicted(1), 3);
    }

    #[test]
    fn test_metrics_from_scores() {
        let labels = [0, 0, 1, 1, 1];
        let scores = [0.1, 0.7, 0.8, 0.2, 0.5];
        let report = EvaluationReport::from_scores(&labels, &scores, 0.42, &names()).unwrap();
        assert!((report.accuracy - 0.6).abs() < 1e-12);
        assert!((report.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.f1 - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.loss, 0.42);
    }

    #[test]
    fn test_no_positive_predictions_gives_zero_not_nan() {
        let report = EvaluationReport::from_scores(&[0, 1], &[0.1, 0.2], 0.7, &names()).unwrap();
        assert_eq!(report.precision, 0.0);
        assert_eq!(report.recall, 0.0);
        assert_eq!(report.f1, 0.0);
        assert!((report.accuracy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_perfect_predictions_summary() {
        let report =
            EvaluationReport::from_scores(&[0, 1, 1], &[0.0, 1.0, 0.999], 0.001, &names())
                .unwrap();
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.f1, 1.0);
        assert!(report.summary().contains("損失: 0.0010"));
    }

    #[test]
    fn test_rejects_mismatched_or_empty_input() {
        assert!(EvaluationReport::from_scores(&[0, 1], &[0.3], 0.0, &names()).is_err());
        assert!(EvaluationReport::from_scores(&[], &[], 0.0, &names()).is_err());
        assert!(EvaluationReport::from_scores(&[2], &[0.3], 0.0, &names()).is_err());
    }
}
