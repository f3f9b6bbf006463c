//! 2フェーズ学習
//!
//! フェーズA: 特徴抽出器を全層凍結し、分類ヘッドのみを大きめの学習率で学習。
//! フェーズB: 先頭 K 層を除いて凍結を解除し、小さい学習率で微調整。
//!
//! 各フェーズで Adam を新しく作り、早期終了と学習率減衰の状態もフェーズごとにリセットします。
//! 最良チェックポイント（検証正解率）は両フェーズを通して追跡します。

use std::fmt;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    nn::loss::BinaryCrossEntropyLoss,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{activation::sigmoid, backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::dataset::{ClassWeights, LabeledExample};
use crate::error::{ClassifierError, Result};
use crate::metrics::predict_label;
use crate::ml::backbone::ConvBlock;
use crate::ml::batcher::{ExampleBatch, ExampleBatcher, ExampleDataset};
use crate::ml::callbacks::{CheckpointTracker, EarlyStopping, ReduceLrOnPlateau};
use crate::ml::classifier::{BinaryClassifier, ClassifierHead, FeatureExtractorHandle};
use crate::ml::evaluate::score_examples;
use crate::ml::loss::{batch_loss, weighted_bce};
use crate::model::{PhaseSettings, TrainingSettings};
use crate::preprocess::{AugmentationConfig, Augmenter};

/// 学習フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// 分類ヘッドのみ
    Head,
    /// 微調整
    FineTune,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Head => write!(f, "head"),
            Phase::FineTune => write!(f, "fine_tune"),
        }
    }
}

/// 1エポック分の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub phase: Phase,
    /// フェーズ内のエポック番号（1始まり）
    pub epoch: usize,
    /// 両フェーズ通しのエポック番号（1始まり）
    pub global_epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// 保存したチェックポイントの情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub phase: Phase,
    pub epoch: usize,
    pub global_epoch: usize,
    pub val_accuracy: f64,
    pub val_loss: f64,
}

/// フェーズの結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub epochs_run: usize,
    pub stopped_early: bool,
    /// 早期終了で復元したエポック
    pub restored_epoch: Option<usize>,
    pub best_val_loss: f64,
    pub final_learning_rate: f64,
}

/// フェーズ内の学習状態
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub phase: Phase,
    pub epoch: usize,
    pub learning_rate: f64,
    pub best_val_loss: f64,
    pub early_stopping_wait: usize,
    pub lr_decay_wait: usize,
}

impl TrainingState {
    fn start(phase: Phase, learning_rate: f64) -> Self {
        Self {
            phase,
            epoch: 0,
            learning_rate,
            best_val_loss: f64::INFINITY,
            early_stopping_wait: 0,
            lr_decay_wait: 0,
        }
    }
}

/// 最良チェックポイントの保存先
pub trait CheckpointSink<B: Backend> {
    fn save(&mut self, model: &BinaryClassifier<B>, checkpoint: &CheckpointInfo) -> Result<()>;
}

/// 保存しない（メモリ上の最良モデルのみ使う）
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardCheckpoints;

impl<B: Backend> CheckpointSink<B> for DiscardCheckpoints {
    fn save(&mut self, _model: &BinaryClassifier<B>, _checkpoint: &CheckpointInfo) -> Result<()> {
        Ok(())
    }
}

/// 学習結果
pub struct TrainingOutcome<B: Backend> {
    /// 検証正解率が最良だったモデル
    pub model: BinaryClassifier<B>,
    pub best_checkpoint: Option<CheckpointInfo>,
    pub history: Vec<EpochRecord>,
    pub phases: Vec<PhaseSummary>,
}

// 両フェーズにまたがる状態
struct RunState<B: Backend> {
    global_epoch: usize,
    checkpoints: CheckpointTracker,
    best_model: Option<BinaryClassifier<B>>,
    best_checkpoint: Option<CheckpointInfo>,
    history: Vec<EpochRecord>,
}

/// 2フェーズ学習器
pub struct TwoPhaseTrainer<B: AutodiffBackend> {
    settings: TrainingSettings,
    augmenter: Augmenter,
    device: B::Device,
}

impl<B: AutodiffBackend> TwoPhaseTrainer<B> {
    pub fn new(settings: TrainingSettings, augmentation: AugmentationConfig, device: B::Device) -> Self {
        Self {
            settings,
            augmenter: Augmenter::new(augmentation),
            device,
        }
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// 2フェーズ学習を実行
    ///
    /// `progress` はエポック終了ごとに呼ばれます。
    #[allow(clippy::too_many_arguments)]
    pub fn fit<F>(
        &self,
        model: BinaryClassifier<B>,
        mut handle: FeatureExtractorHandle,
        train: &ExampleDataset,
        validation: &ExampleDataset,
        weights: ClassWeights,
        sink: &mut dyn CheckpointSink<B::InnerBackend>,
        mut progress: F,
    ) -> Result<TrainingOutcome<B::InnerBackend>>
    where
        F: FnMut(&EpochRecord),
    {
        if train.is_empty() || validation.is_empty() {
            return Err(ClassifierError::InvalidConfig(format!(
                "学習 ({}) と検証 ({}) の分割は空にできません",
                train.len(),
                validation.len()
            )));
        }
        if self.settings.batch_size == 0 {
            return Err(ClassifierError::InvalidConfig(
                "batch_size は1以上が必要です".to_string(),
            ));
        }

        let mut run = RunState {
            global_epoch: 0,
            checkpoints: CheckpointTracker::new(),
            best_model: None,
            best_checkpoint: None,
            history: Vec::new(),
        };
        let batcher = ExampleBatcher::new();
        let criterion = weighted_bce::<B>(&weights, &self.device);

        handle.freeze_all();
        log::info!("=== フェーズA: 分類ヘッドの学習 ===");
        let (model, head_summary) = self.run_phase(
            Phase::Head,
            self.settings.head_phase,
            model,
            &handle,
            train,
            validation,
            &batcher,
            &criterion,
            sink,
            &mut run,
            &mut progress,
        )?;

        handle.unfreeze_except_first(self.settings.fine_tune_frozen_layers)?;
        log::info!(
            "=== フェーズB: 微調整 (先頭 {} / {} 層は凍結) ===",
            handle.frozen_layers(),
            handle.num_layers()
        );
        let (model, fine_tune_summary) = self.run_phase(
            Phase::FineTune,
            self.settings.fine_tune_phase,
            model,
            &handle,
            train,
            validation,
            &batcher,
            &criterion,
            sink,
            &mut run,
            &mut progress,
        )?;

        let best = match run.best_model {
            Some(best) => best,
            None => {
                log::warn!("チェックポイントが保存されなかったため最終エポックのモデルを使用します");
                model.valid()
            }
        };

        if let Some(checkpoint) = &run.best_checkpoint {
            log::info!(
                "最良モデル: {} フェーズ エポック {} (検証正解率 {:.4})",
                checkpoint.phase,
                checkpoint.epoch,
                checkpoint.val_accuracy
            );
        }

        Ok(TrainingOutcome {
            model: best,
            best_checkpoint: run.best_checkpoint,
            history: run.history,
            phases: vec![head_summary, fine_tune_summary],
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase<F>(
        &self,
        phase: Phase,
        phase_settings: PhaseSettings,
        mut model: BinaryClassifier<B>,
        handle: &FeatureExtractorHandle,
        train: &ExampleDataset,
        validation: &ExampleDataset,
        batcher: &ExampleBatcher,
        criterion: &BinaryCrossEntropyLoss<B>,
        sink: &mut dyn CheckpointSink<B::InnerBackend>,
        run: &mut RunState<B::InnerBackend>,
        progress: &mut F,
    ) -> Result<(BinaryClassifier<B>, PhaseSummary)>
    where
        F: FnMut(&EpochRecord),
    {
        let decay = self.settings.lr_decay;
        let frozen = handle.frozen_layers();
        let num_layers = handle.num_layers();

        let mut head_optim = AdamConfig::new().init::<B, ClassifierHead<B>>();
        let mut block_optim = AdamConfig::new().init::<B, ConvBlock<B>>();
        let mut early_stopping = EarlyStopping::new(self.settings.early_stopping_patience);
        let mut plateau = ReduceLrOnPlateau::new(decay.factor, decay.patience, decay.min_lr, decay.min_delta);
        let mut state = TrainingState::start(phase, phase_settings.learning_rate);
        let mut summary = PhaseSummary {
            phase,
            epochs_run: 0,
            stopped_early: false,
            restored_epoch: None,
            best_val_loss: f64::INFINITY,
            final_learning_rate: phase_settings.learning_rate,
        };

        log::info!(
            "エポック数: {}, 学習率: {}, 学習対象の層: {}/{}",
            phase_settings.epochs,
            phase_settings.learning_rate,
            num_layers - frozen,
            num_layers
        );

        for epoch in 1..=phase_settings.epochs {
            run.global_epoch += 1;
            state.epoch = epoch;

            let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(run.global_epoch as u64));
            let mut order: Vec<usize> = (0..train.len()).collect();
            order.shuffle(&mut rng);

            let mut loss_sum = 0.0f64;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for chunk in order.chunks(self.settings.batch_size) {
                let items = chunk
                    .iter()
                    .filter_map(|&index| train.get(index))
                    .map(|example| {
                        let augmented = self.augmenter.apply(example.tensor(), &mut rng);
                        LabeledExample::new(augmented, example.label())
                    })
                    .collect::<Result<Vec<_>>>()?;
                let batch: ExampleBatch<B> = batcher.batch(items, &self.device);
                let batch_len = batch.labels.len();

                let logits = model.forward_frozen(batch.images, frozen);
                let loss = batch_loss(criterion, logits.clone(), batch.targets);

                let probabilities = sigmoid(logits.detach())
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| ClassifierError::Backend(format!("出力の取得エラー: {:?}", e)))?;
                correct += probabilities
                    .iter()
                    .zip(&batch.labels)
                    .filter(|(&p, &y)| predict_label(p) == y)
                    .count();
                loss_sum += loss.clone().into_scalar().elem::<f64>() * batch_len as f64;
                seen += batch_len;

                let mut grads = loss.backward();

                let head_grads = GradientsParams::from_module(&mut grads, &model.head);
                model.head = head_optim.step(state.learning_rate, model.head, head_grads);

                if frozen < num_layers {
                    let blocks = std::mem::take(&mut model.backbone.blocks);
                    model.backbone.blocks = blocks
                        .into_iter()
                        .enumerate()
                        .map(|(index, block)| {
                            if index < frozen {
                                block
                            } else {
                                let block_grads = GradientsParams::from_module(&mut grads, &block);
                                block_optim.step(state.learning_rate, block, block_grads)
                            }
                        })
                        .collect();
                }

                log::debug!("  バッチ {} 枚, 損失 {:.5}", batch_len, loss_sum / seen as f64);
            }

            let valid_model = model.valid();
            let val_scores = score_examples(
                &valid_model,
                validation.examples(),
                self.settings.batch_size,
                &self.device,
            )?;

            let record = EpochRecord {
                phase,
                epoch,
                global_epoch: run.global_epoch,
                train_loss: loss_sum / seen.max(1) as f64,
                train_accuracy: correct as f64 / seen.max(1) as f64,
                val_loss: val_scores.loss,
                val_accuracy: val_scores.accuracy(),
                learning_rate: state.learning_rate,
            };

            log::info!(
                "[{}] エポック {}/{}: loss={:.4}, acc={:.4}, val_loss={:.4}, val_acc={:.4}, lr={:.2e}",
                phase,
                epoch,
                phase_settings.epochs,
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy,
                record.learning_rate
            );

            if run.checkpoints.observe(record.val_accuracy) {
                let checkpoint = CheckpointInfo {
                    phase,
                    epoch,
                    global_epoch: run.global_epoch,
                    val_accuracy: record.val_accuracy,
                    val_loss: record.val_loss,
                };
                sink.save(&valid_model, &checkpoint)?;
                log::info!(
                    "  検証正解率が改善しました ({:.4})。チェックポイントを保存しました",
                    record.val_accuracy
                );
                run.best_model = Some(valid_model);
                run.best_checkpoint = Some(checkpoint);
            }

            let stop = early_stopping.observe(epoch, record.val_loss, || model.clone());

            let next_lr = plateau.observe(record.val_loss, state.learning_rate);
            if next_lr < state.learning_rate {
                log::info!("  学習率を減衰: {:.2e} -> {:.2e}", state.learning_rate, next_lr);
            }
            state.learning_rate = next_lr;
            state.best_val_loss = early_stopping.best();
            state.early_stopping_wait = early_stopping.wait();
            state.lr_decay_wait = plateau.wait();

            summary.epochs_run = epoch;
            progress(&record);
            run.history.push(record);

            if stop {
                summary.stopped_early = true;
                summary.restored_epoch = early_stopping.best_epoch();
                if let Some(best) = early_stopping.take_best() {
                    model = best;
                }
                log::info!(
                    "  早期終了: {} エポック改善なし。エポック {:?} の重みを復元しました",
                    state.early_stopping_wait,
                    summary.restored_epoch
                );
                break;
            }
        }

        summary.best_val_loss = state.best_val_loss;
        summary.final_learning_rate = state.learning_rate;
        Ok((model, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::classifier::build;
    use crate::model::ModelSettings;
    use crate::preprocess::{InputShape, NormalizedTensor};
    use burn::tensor::Tensor;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;
    type InnerBackend = NdArray<f32>;

    fn synthetic(n: usize) -> Vec<LabeledExample> {
        (0..n)
            .map(|i| {
                let label = i % 2;
                let base = if label == 0 { 0.15 } else { 0.85 };
                let data = (0..8 * 8 * 3)
                    .map(|j| base + ((i * 7 + j) % 5) as f32 * 0.01)
                    .collect();
                let tensor = NormalizedTensor::from_hwc(data, 8, 8).unwrap();
                LabeledExample::new(tensor, label).unwrap()
            })
            .collect()
    }

    fn settings() -> TrainingSettings {
        TrainingSettings {
            batch_size: 4,
            seed: 3,
            head_phase: PhaseSettings {
                epochs: 2,
                learning_rate: 1e-2,
            },
            fine_tune_phase: PhaseSettings {
                epochs: 2,
                learning_rate: 1e-3,
            },
            fine_tune_frozen_layers: 1,
            early_stopping_patience: 5,
            ..TrainingSettings::default()
        }
    }

    fn small_model() -> (BinaryClassifier<TestBackend>, FeatureExtractorHandle) {
        let model_settings = ModelSettings {
            backbone_channels: vec![8, 16],
            hidden_units: 8,
            bottleneck_units: 4,
            ..ModelSettings::default()
        };
        build::<TestBackend>(&InputShape::fixed(8, 8), &model_settings, &Default::default())
            .unwrap()
    }

    fn datasets() -> (ExampleDataset, ExampleDataset) {
        (
            ExampleDataset::new(synthetic(12)).unwrap(),
            ExampleDataset::new(synthetic(6)).unwrap(),
        )
    }

    #[derive(Default)]
    struct RecordingSink {
        saved: Vec<CheckpointInfo>,
        last_output: Option<Vec<f32>>,
    }

    impl CheckpointSink<InnerBackend> for RecordingSink {
        fn save(&mut self, model: &BinaryClassifier<InnerBackend>, checkpoint: &CheckpointInfo) -> Result<()> {
            self.saved.push(checkpoint.clone());
            self.last_output = Some(fixed_input_output(model));
            Ok(())
        }
    }

    fn fixed_input_output(model: &BinaryClassifier<InnerBackend>) -> Vec<f32> {
        let images = Tensor::<InnerBackend, 4>::ones([1, 3, 8, 8], &Default::default());
        model.forward(images).into_data().to_vec::<f32>().unwrap()
    }

    fn block_output(model: &BinaryClassifier<InnerBackend>, index: usize) -> Vec<f32> {
        let images = Tensor::<InnerBackend, 4>::ones([1, 3, 8, 8], &Default::default());
        let x = model.backbone.blocks[0].forward(images);
        let x = if index == 1 { model.backbone.blocks[1].forward(x) } else { x };
        x.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_runs_both_phases_and_returns_best_checkpoint() {
        let (model, handle) = small_model();
        let (train, validation) = datasets();
        let weights = ClassWeights::uniform();
        let trainer = TwoPhaseTrainer::<TestBackend>::new(
            settings(),
            AugmentationConfig::default(),
            Default::default(),
        );

        let mut sink = RecordingSink::default();
        let mut reported = Vec::new();
        let outcome = trainer
            .fit(model, handle, &train, &validation, weights, &mut sink, |r| {
                reported.push(r.global_epoch)
            })
            .unwrap();

        assert_eq!(outcome.history.len(), 4);
        assert_eq!(reported, vec![1, 2, 3, 4]);
        assert_eq!(outcome.phases.len(), 2);
        assert_eq!(outcome.phases[0].phase, Phase::Head);
        assert_eq!(outcome.phases[1].phase, Phase::FineTune);
        assert!(outcome.history.iter().all(|r| r.train_loss.is_finite()));

        // 最初のエポックは必ず保存され、以降は厳密に改善したときのみ
        assert!(!sink.saved.is_empty());
        assert_eq!(sink.saved[0].global_epoch, 1);
        for pair in sink.saved.windows(2) {
            assert!(pair[1].val_accuracy > pair[0].val_accuracy);
        }

        let best = outcome.best_checkpoint.clone().unwrap();
        let max_acc = outcome
            .history
            .iter()
            .map(|r| r.val_accuracy)
            .fold(f64::MIN, f64::max);
        assert_eq!(best.val_accuracy, max_acc);
        assert_eq!(sink.saved.last(), Some(&best));
        assert_eq!(sink.last_output, Some(fixed_input_output(&outcome.model)));
    }

    #[test]
    fn test_early_stopping_restores_best_weights() {
        let (model, mut handle) = small_model();
        handle.freeze_all();
        let (train, validation) = datasets();
        let settings = TrainingSettings {
            early_stopping_patience: 1,
            ..settings()
        };
        let trainer =
            TwoPhaseTrainer::<TestBackend>::new(settings, AugmentationConfig::identity(), Default::default());
        let batcher = ExampleBatcher::new();
        let criterion = weighted_bce::<TestBackend>(&ClassWeights::uniform(), &Default::default());
        let mut run = RunState {
            global_epoch: 0,
            checkpoints: CheckpointTracker::new(),
            best_model: None,
            best_checkpoint: None,
            history: Vec::new(),
        };

        // 大きな学習率で検証損失を振動させ、途中で早期終了させる
        let (restored, summary) = trainer
            .run_phase(
                Phase::Head,
                PhaseSettings {
                    epochs: 20,
                    learning_rate: 0.5,
                },
                model,
                &handle,
                &train,
                &validation,
                &batcher,
                &criterion,
                &mut DiscardCheckpoints,
                &mut run,
                &mut |_: &EpochRecord| {},
            )
            .unwrap();

        assert!(summary.stopped_early);
        assert!(summary.epochs_run < 20);
        let restored_epoch = summary.restored_epoch.unwrap();
        assert!(restored_epoch < summary.epochs_run);

        let best_in_history = run
            .history
            .iter()
            .map(|r| r.val_loss)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(summary.best_val_loss, best_in_history);
        assert_eq!(run.history[restored_epoch - 1].val_loss, best_in_history);
        let last = run.history.last().unwrap();
        assert!(last.val_loss >= summary.best_val_loss);

        // 返されたモデルは最終エポックではなく最良エポックの重み
        let rescored = score_examples(
            &restored.valid(),
            validation.examples(),
            trainer.settings().batch_size,
            &Default::default(),
        )
        .unwrap();
        assert!((rescored.loss - summary.best_val_loss).abs() < 1e-9);
    }

    #[test]
    fn test_head_phase_leaves_backbone_untouched() {
        let (model, handle) = small_model();
        let initial = model.valid();
        let (train, validation) = datasets();
        let settings = TrainingSettings {
            fine_tune_phase: PhaseSettings {
                epochs: 0,
                learning_rate: 1e-3,
            },
            ..settings()
        };
        let trainer =
            TwoPhaseTrainer::<TestBackend>::new(settings, AugmentationConfig::default(), Default::default());
        let outcome = trainer
            .fit(model, handle, &train, &validation, ClassWeights::uniform(), &mut DiscardCheckpoints, |_| {})
            .unwrap();

        assert_eq!(block_output(&initial, 1), block_output(&outcome.model, 1));
    }

    #[test]
    fn test_fine_tune_keeps_first_layers_frozen() {
        let (model, handle) = small_model();
        let initial = model.valid();
        let (train, validation) = datasets();
        let settings = TrainingSettings {
            head_phase: PhaseSettings {
                epochs: 0,
                learning_rate: 1e-3,
            },
            fine_tune_phase: PhaseSettings {
                epochs: 2,
                learning_rate: 5e-2,
            },
            fine_tune_frozen_layers: 1,
            ..settings()
        };
        let trainer =
            TwoPhaseTrainer::<TestBackend>::new(settings, AugmentationConfig::identity(), Default::default());
        let outcome = trainer
            .fit(model, handle, &train, &validation, ClassWeights::uniform(), &mut DiscardCheckpoints, |_| {})
            .unwrap();

        assert_eq!(block_output(&initial, 0), block_output(&outcome.model, 0));
        assert_ne!(block_output(&initial, 1), block_output(&outcome.model, 1));
    }

    #[test]
    fn test_rejects_empty_splits() {
        let (model, handle) = small_model();
        let train = ExampleDataset::new(synthetic(4)).unwrap();
        let empty = ExampleDataset::new(Vec::new()).unwrap();
        let trainer =
            TwoPhaseTrainer::<TestBackend>::new(settings(), AugmentationConfig::identity(), Default::default());
        let result = trainer.fit(model, handle, &train, &empty, ClassWeights::uniform(), &mut DiscardCheckpoints, |_| {});
        assert!(result.is_err());
    }
}
