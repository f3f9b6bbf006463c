//! データセットの読み込み・分割・クラス重み計算

pub mod loader;
pub mod split;
pub mod balance;

use std::path::PathBuf;

use crate::error::{ClassifierError, Result};
use crate::preprocess::NormalizedTensor;

pub use loader::{DatasetLoader, LoadedDataset, SkippedFile, IMAGE_EXTENSIONS};
pub use split::{plan_split, split, DatasetSplit, SplitIndices};
pub use balance::{class_weights_from_labels, compute_class_weights, ClassWeights};

/// クラス数（2クラス固定）
pub const NUM_CLASSES: usize = 2;

/// ラベル付きサンプル
///
/// 作成後は変更しません。ラベルは 0 または 1 です。
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledExample {
    tensor: NormalizedTensor,
    label: usize,
    source: Option<PathBuf>,
}

impl LabeledExample {
    pub fn new(tensor: NormalizedTensor, label: usize) -> Result<Self> {
        if label >= NUM_CLASSES {
            return Err(ClassifierError::InvalidConfig(format!(
                "ラベルは 0 または 1 である必要があります: {}",
                label
            )));
        }
        Ok(Self {
            tensor,
            label,
            source: None,
        })
    }

    pub fn with_source(mut self, source: PathBuf) -> Self {
        self.source = Some(source);
        self
    }

    pub fn tensor(&self) -> &NormalizedTensor {
        &self.tensor
    }

    pub fn label(&self) -> usize {
        self.label
    }

    pub fn source(&self) -> Option<&PathBuf> {
        self.source.as_ref()
    }
}

/// クラスごとの件数
pub fn count_by_class(examples: &[LabeledExample]) -> [usize; NUM_CLASSES] {
    let mut counts = [0usize; NUM_CLASSES];
    for example in examples {
        counts[example.label()] += 1;
    }
    counts
}
