//! 二値交差エントロピー（ロジット入力）
//!
//! 学習・検証・テストのすべてで `BinaryCrossEntropyLoss` を使います。
//! 学習時のみクラス重みを付け、重みは各サンプルの正解クラスに応じて掛かります。

use burn::{
    nn::loss::{BinaryCrossEntropyLoss, BinaryCrossEntropyLossConfig},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::dataset::ClassWeights;

/// クラス重み付きの損失（学習用）
pub fn weighted_bce<B: Backend>(weights: &ClassWeights, device: &B::Device) -> BinaryCrossEntropyLoss<B> {
    let weights = weights.as_array().iter().map(|&w| w as f32).collect();
    BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .with_weights(Some(weights))
        .init(device)
}

/// 重みなしの損失（検証・テスト用）
pub fn unweighted_bce<B: Backend>(device: &B::Device) -> BinaryCrossEntropyLoss<B> {
    BinaryCrossEntropyLossConfig::new().with_logits(true).init(device)
}

/// ロジット [batch_size, 1] と正解ラベル [batch_size] からバッチ平均の損失
pub fn batch_loss<B: Backend>(
    loss: &BinaryCrossEntropyLoss<B>,
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [batch_size, _] = logits.dims();
    loss.forward(logits.reshape([batch_size]), targets)
}
