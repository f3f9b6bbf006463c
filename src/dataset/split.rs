//! 層化分割
//!
//! まずテスト分を切り出し、残りから検証分を切り出す2段階の層化分割です。
//! 各段階の件数は `ceil(割合 × 件数)`、クラスごとの割り当ては最大剰余法で決めます。
//! 同じシードなら同じ分割になります。

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::{LabeledExample, NUM_CLASSES};
use crate::error::{ClassifierError, Result};

/// 層化に必要なクラスごとの最小件数
const MIN_PER_CLASS: usize = 2;

/// 分割結果（元配列のインデックス）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

/// 学習・検証・テストの3分割
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub train: Vec<LabeledExample>,
    pub validation: Vec<LabeledExample>,
    pub test: Vec<LabeledExample>,
}

impl DatasetSplit {
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.train.len(), self.validation.len(), self.test.len())
    }
}

fn validate_fraction(name: &str, fraction: f64) -> Result<()> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(ClassifierError::InvalidConfig(format!(
            "{} は (0, 1) の範囲で指定してください: {}",
            name, fraction
        )));
    }
    Ok(())
}

// 浮動小数の誤差で 30.000000001 が 31 にならないようにする
fn holdout_size(fraction: f64, n: usize) -> usize {
    (fraction * n as f64 - 1e-9).ceil().max(0.0) as usize
}

/// 最大剰余法で `total` 件をクラス件数に比例配分（同率は小さいクラス番号を優先）
fn allocate(class_counts: &[usize; NUM_CLASSES], total: usize) -> [usize; NUM_CLASSES] {
    let n: usize = class_counts.iter().sum();
    let mut quota = [0usize; NUM_CLASSES];
    if n == 0 {
        return quota;
    }

    let mut remainders = Vec::with_capacity(NUM_CLASSES);
    for (k, &count) in class_counts.iter().enumerate() {
        let exact = count as f64 * total as f64 / n as f64;
        quota[k] = exact.floor() as usize;
        remainders.push((exact - exact.floor(), k));
    }

    let mut left = total - quota.iter().sum::<usize>();
    remainders.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    for &(_, k) in remainders.iter().cycle() {
        if left == 0 {
            break;
        }
        if quota[k] < class_counts[k] {
            quota[k] += 1;
            left -= 1;
        }
    }

    // 各クラスを少なくとも1件は残す
    for k in 0..NUM_CLASSES {
        if class_counts[k] > 0 && quota[k] >= class_counts[k] {
            quota[k] = class_counts[k] - 1;
        }
    }
    quota
}

/// `pool` を (残す側, 取り出す側) に層化して分ける
fn stratified_holdout(
    pool: &[usize],
    labels: &[usize],
    fraction: f64,
    rng: &mut StdRng,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let n = pool.len();
    let n_holdout = holdout_size(fraction, n);
    if n_holdout < NUM_CLASSES || n - n_holdout < NUM_CLASSES {
        return Err(ClassifierError::InvalidConfig(format!(
            "{} 件を割合 {} で層化分割できません（取り出し {} 件）",
            n, fraction, n_holdout
        )));
    }

    let mut by_class: [Vec<usize>; NUM_CLASSES] = Default::default();
    for &index in pool {
        by_class[labels[index]].push(index);
    }
    let counts = [by_class[0].len(), by_class[1].len()];
    let quota = allocate(&counts, n_holdout);

    let mut keep = Vec::with_capacity(n - n_holdout);
    let mut holdout = Vec::with_capacity(n_holdout);
    for (members, &take) in by_class.iter_mut().zip(quota.iter()) {
        members.shuffle(rng);
        holdout.extend_from_slice(&members[..take]);
        keep.extend_from_slice(&members[take..]);
    }

    keep.shuffle(rng);
    holdout.shuffle(rng);
    Ok((keep, holdout))
}

/// ラベル列から分割インデックスを決める
pub fn plan_split(
    labels: &[usize],
    test_fraction: f64,
    val_fraction: f64,
    seed: u64,
) -> Result<SplitIndices> {
    validate_fraction("test_fraction", test_fraction)?;
    validate_fraction("val_fraction", val_fraction)?;

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
    for (class_index, &count) in counts.iter().enumerate() {
        if count < MIN_PER_CLASS {
            return Err(ClassifierError::InsufficientExamples {
                class_index,
                count,
                required: MIN_PER_CLASS,
            });
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let all: Vec<usize> = (0..labels.len()).collect();

    let (rest, test) = stratified_holdout(&all, labels, test_fraction, &mut rng)?;
    let (train, validation) = stratified_holdout(&rest, labels, val_fraction, &mut rng)?;

    Ok(SplitIndices {
        train,
        validation,
        test,
    })
}

/// サンプルを学習・検証・テストに層化分割
pub fn split(
    examples: Vec<LabeledExample>,
    test_fraction: f64,
    val_fraction: f64,
    seed: u64,
) -> Result<DatasetSplit> {
    let labels: Vec<usize> = examples.iter().map(|e| e.label()).collect();
    let plan = plan_split(&labels, test_fraction, val_fraction, seed)?;

    let mut slots: Vec<Option<LabeledExample>> = examples.into_iter().map(Some).collect();
    let mut take = |indices: &[usize]| -> Vec<LabeledExample> {
        indices.iter().filter_map(|&i| slots[i].take()).collect()
    };

    let split = DatasetSplit {
        train: take(&plan.train),
        validation: take(&plan.validation),
        test: take(&plan.test),
    };

    log::info!(
        "分割: 学習 {} / 検証 {} / テスト {}",
        split.train.len(),
        split.validation.len(),
        split.test.len()
    );
    Ok(split)
}
