//! データセットとバッチャー

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::dataset::LabeledExample;
use crate::error::{ClassifierError, Result};

/// 分割済みサンプルのデータセット
pub struct ExampleDataset {
    examples: Vec<LabeledExample>,
}

impl ExampleDataset {
    /// 全サンプルが同じ空間サイズであることを確認して作成
    pub fn new(examples: Vec<LabeledExample>) -> Result<Self> {
        if let Some(first) = examples.first() {
            let expected = first.tensor().shape();
            if let Some(bad) = examples.iter().find(|e| e.tensor().shape() != expected) {
                return Err(ClassifierError::Preprocessing(format!(
                    "画像サイズが揃っていません: {:?} と {:?}",
                    expected,
                    bad.tensor().shape()
                )));
            }
        }
        Ok(Self { examples })
    }

    pub fn examples(&self) -> &[LabeledExample] {
        &self.examples
    }

    pub fn labels(&self) -> Vec<usize> {
        self.examples.iter().map(|e| e.label()).collect()
    }
}

impl Dataset<LabeledExample> for ExampleDataset {
    fn get(&self, index: usize) -> Option<LabeledExample> {
        self.examples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.examples.len()
    }
}

/// バッチャー
///
/// クラス重みは損失モジュール側で正解クラスから引くため、ここでは持ちません。
#[derive(Clone, Debug, Default)]
pub struct ExampleBatcher;

impl ExampleBatcher {
    pub fn new() -> Self {
        Self
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ExampleBatch<B: Backend> {
    /// [batch_size, 3, H, W]
    pub images: Tensor<B, 4>,
    /// クラス番号 [batch_size]
    pub targets: Tensor<B, 1, Int>,
    pub labels: Vec<usize>,
}

impl<B: Backend> Batcher<B, LabeledExample, ExampleBatch<B>> for ExampleBatcher {
    fn batch(&self, items: Vec<LabeledExample>, device: &B::Device) -> ExampleBatch<B> {
        let batch_size = items.len();
        let (height, width) = items
            .first()
            .map(|e| (e.tensor().height(), e.tensor().width()))
            .unwrap_or((0, 0));

        let mut pixels = Vec::with_capacity(batch_size * 3 * height * width);
        let mut targets = Vec::with_capacity(batch_size);
        let mut labels = Vec::with_capacity(batch_size);

        for item in &items {
            pixels.extend(item.tensor().to_chw());
            targets.push(item.label() as i64);
            labels.push(item.label());
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device)
            .reshape([batch_size, 3, height, width]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);

        ExampleBatch {
            images,
            targets,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::NormalizedTensor;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn example(value: f32, h: usize, w: usize, label: usize) -> LabeledExample {
        let tensor = NormalizedTensor::from_hwc(vec![value; h * w * 3], h, w).unwrap();
        LabeledExample::new(tensor, label).unwrap()
    }

    #[test]
    fn test_batch_shapes_and_targets() {
        let items = vec![
            example(0.1, 4, 6, 0),
            example(0.9, 4, 6, 1),
            example(0.5, 4, 6, 1),
        ];

        let batch: ExampleBatch<TestBackend> =
            ExampleBatcher::new().batch(items, &Default::default());
        assert_eq!(batch.images.dims(), [3, 3, 4, 6]);
        assert_eq!(batch.targets.dims(), [3]);
        assert_eq!(batch.labels, vec![0, 1, 1]);

        let targets: Vec<i64> = batch
            .targets
            .into_data()
            .iter::<i64>()
            .collect();
        assert_eq!(targets, vec![0, 1, 1]);
    }

    #[test]
    fn test_images_are_channel_first() {
        let mut data = vec![0.0f32; 2 * 2 * 3];
        // 画素 (0,1) の G チャネル
        data[(1) * 3 + 1] = 1.0;
        let tensor = NormalizedTensor::from_hwc(data, 2, 2).unwrap();
        let item = LabeledExample::new(tensor, 0).unwrap();

        let batch: ExampleBatch<TestBackend> =
            ExampleBatcher::new().batch(vec![item], &Default::default());
        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        // CHW: チャネル1 の先頭 4 要素のうち (y=0, x=1)
        assert_eq!(pixels[4 + 1], 1.0);
        assert_eq!(pixels.iter().filter(|v| **v == 1.0).count(), 1);
    }

    #[test]
    fn test_dataset_rejects_mixed_sizes() {
        let result = ExampleDataset::new(vec![example(0.0, 4, 4, 0), example(0.0, 4, 5, 1)]);
        assert!(matches!(result, Err(ClassifierError::Preprocessing(_))));

        let dataset = ExampleDataset::new(vec![example(0.0, 4, 4, 0), example(0.0, 4, 4, 1)])
            .unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(1).map(|e| e.label()), Some(1));
        assert!(dataset.get(2).is_none());
        assert_eq!(dataset.labels(), vec![0, 1]);
    }
}
