//! クラス不均衡の補正
//!
//! 重み = 学習件数 / (クラス数 × そのクラスの件数)。少数クラスほど大きくなります。

use serde::{Deserialize, Serialize};

use crate::dataset::{LabeledExample, NUM_CLASSES};
use crate::error::{ClassifierError, Result};

/// クラスごとの損失重み（常に正で有限）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights([f64; NUM_CLASSES]);

impl ClassWeights {
    /// 全クラス同じ重み
    pub fn uniform() -> Self {
        Self([1.0; NUM_CLASSES])
    }

    pub fn get(&self, class_index: usize) -> f64 {
        self.0[class_index]
    }

    pub fn as_array(&self) -> [f64; NUM_CLASSES] {
        self.0
    }
}

/// ラベル列からクラス重みを計算
///
/// 学習分割に存在しないクラスがある場合はエラーです（重み0にはしない）。
pub fn class_weights_from_labels(labels: &[usize]) -> Result<ClassWeights> {
    let mut counts = [0usize; NUM_CLASSES];
    for &label in labels {
        if label >= NUM_CLASSES {
            return Err(ClassifierError::InvalidConfig(format!(
                "ラベルが範囲外です: {}",
                label
            )));
        }
        counts[label] += 1;
    }

    let total = labels.len() as f64;
    let mut weights = [0.0f64; NUM_CLASSES];
    for (k, &count) in counts.iter().enumerate() {
        if count == 0 {
            return Err(ClassifierError::MissingClass {
                class_name: format!("#{}", k),
                reason: "学習分割にサンプルがありません".to_string(),
            });
        }
        weights[k] = total / (NUM_CLASSES as f64 * count as f64);
    }

    Ok(ClassWeights(weights))
}

/// 学習分割からクラス重みを計算
pub fn compute_class_weights(train: &[LabeledExample]) -> Result<ClassWeights> {
    let labels: Vec<usize> = train.iter().map(|e| e.label()).collect();
    let weights = class_weights_from_labels(&labels)?;
    log::info!("クラス重み: {:?}", weights.as_array());
    Ok(weights)
}
