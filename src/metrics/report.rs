//! クラス別レポート（precision / recall / f1-score / support）

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dataset::NUM_CLASSES;
use crate::metrics::{safe_div, ConfusionMatrix};

/// 1クラス分（または平均）の指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// クラス別レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub class_names: Vec<String>,
    pub per_class: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

impl ClassificationReport {
    pub fn from_confusion(cm: &ConfusionMatrix, class_names: &[String]) -> Self {
        let total = cm.total();

        let per_class: Vec<ClassMetrics> = (0..NUM_CLASSES)
            .map(|k| {
                let tp = cm.matrix[k][k] as f64;
                let precision = safe_div(tp, cm.predicted(k) as f64);
                let recall = safe_div(tp, cm.support(k) as f64);
                ClassMetrics {
                    precision,
                    recall,
                    f1: safe_div(2.0 * precision * recall, precision + recall),
                    support: cm.support(k),
                }
            })
            .collect();

        let n = per_class.len() as f64;
        let macro_avg = ClassMetrics {
            precision: per_class.iter().map(|m| m.precision).sum::<f64>() / n,
            recall: per_class.iter().map(|m| m.recall).sum::<f64>() / n,
            f1: per_class.iter().map(|m| m.f1).sum::<f64>() / n,
            support: total,
        };

        let weighted = |f: fn(&ClassMetrics) -> f64| {
            safe_div(
                per_class.iter().map(|m| f(m) * m.support as f64).sum::<f64>(),
                total as f64,
            )
        };
        let weighted_avg = ClassMetrics {
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1: weighted(|m| m.f1),
            support: total,
        };

        let class_names = (0..NUM_CLASSES)
            .map(|k| {
                class_names
                    .get(k)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", k))
            })
            .collect();

        Self {
            class_names,
            per_class,
            accuracy: safe_div(cm.correct() as f64, total as f64),
            macro_avg,
            weighted_avg,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .class_names
            .iter()
            .map(|n| n.chars().count())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(12);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for (name, m) in self.class_names.iter().zip(&self.per_class) {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name, m.precision, m.recall, m.f1, m.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        for (label, m) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                label, m.precision, m.recall, m.f1, m.support
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_class_and_averages() {
        // 正解0: 8件（うち6件正解）、正解1: 2件（うち1件正解）
        let cm = ConfusionMatrix {
            matrix: [[6, 2], [1, 1]],
        };
        let names = vec!["cat".to_string(), "dog".to_string()];
        let report = ClassificationReport::from_confusion(&cm, &names);

        let cat = report.per_class[0];
        assert!((cat.precision - 6.0 / 7.0).abs() < 1e-12);
        assert!((cat.recall - 0.75).abs() < 1e-12);
        assert_eq!(cat.support, 8);

        let dog = report.per_class[1];
        assert!((dog.precision - 1.0 / 3.0).abs() < 1e-12);
        assert!((dog.recall - 0.5).abs() < 1e-12);

        assert!((report.accuracy - 0.7).abs() < 1e-12);
        assert!((report.macro_avg.recall - 0.625).abs() < 1e-12);
        assert!((report.weighted_avg.recall - 0.7).abs() < 1e-12);
        assert_eq!(report.weighted_avg.support, 10);
    }

    #[test]
    fn test_display_contains_rows() {
        let cm = ConfusionMatrix {
            matrix: [[3, 0], [0, 3]],
        };
        let report = ClassificationReport::from_confusion(&cm, &["cat".to_string()]);
        let text = report.to_string();
        assert!(text.contains("precision"));
        assert!(text.contains("cat"));
        assert!(text.contains("class_1"));
        assert!(text.contains("weighted avg"));
    }
}
