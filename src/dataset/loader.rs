//! 学習データの読み込み
//!
//! `root/<クラス名>/*.{jpg,jpeg,png,bmp}` を走査し、各画像を正規化します。
//! 壊れた画像はスキップして記録し、読み込み全体は中断しません。

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;

use crate::dataset::{LabeledExample, NUM_CLASSES};
use crate::error::{ClassifierError, Result};
use crate::preprocess::{normalize_file, NormalizerConfig};

/// 対象とする画像拡張子（大文字小文字は区別しない）
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// スキップしたファイル
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub class_index: usize,
    pub reason: String,
}

/// 読み込み結果
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub examples: Vec<LabeledExample>,
    pub class_names: Vec<String>,
    /// クラスごとの読み込み成功数
    pub class_counts: [usize; NUM_CLASSES],
    pub skipped: Vec<SkippedFile>,
}

impl LoadedDataset {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// データセットローダー
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    normalizer: NormalizerConfig,
}

impl DatasetLoader {
    pub fn new(normalizer: NormalizerConfig) -> Self {
        Self { normalizer }
    }

    pub fn normalizer(&self) -> &NormalizerConfig {
        &self.normalizer
    }

    /// 拡張子が対象画像かどうか
    pub fn is_image_file(path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
    }

    /// ディレクトリ内の画像ファイルをファイル名順で列挙
    pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && Self::is_image_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// クラス名の順序でラベルを割り当てて読み込む
    ///
    /// クラスディレクトリが無い、または有効画像が0枚のクラスは設定エラーです。
    /// 全体で0枚の場合は空データセットエラーです。
    pub fn load(&self, root: &Path, class_names: &[String]) -> Result<LoadedDataset> {
        if class_names.len() != NUM_CLASSES {
            return Err(ClassifierError::InvalidConfig(format!(
                "クラス名はちょうど{}個必要です: {:?}",
                NUM_CLASSES, class_names
            )));
        }
        if !root.is_dir() {
            return Err(ClassifierError::EmptyDataset(root.to_path_buf()));
        }

        let mut examples = Vec::new();
        let mut skipped = Vec::new();
        let mut class_counts = [0usize; NUM_CLASSES];

        for (class_index, class_name) in class_names.iter().enumerate() {
            let class_dir = root.join(class_name);
            if !class_dir.is_dir() {
                return Err(ClassifierError::MissingClass {
                    class_name: class_name.clone(),
                    reason: format!("ディレクトリが存在しません: {}", class_dir.display()),
                });
            }

            let files = Self::list_images(&class_dir)?;
            log::info!("クラス '{}' を読み込み中: {} ファイル", class_name, files.len());

            // 並列にデコードしても collect でファイル順は保たれる
            let outcomes: Vec<(PathBuf, Result<LabeledExample>)> = files
                .into_par_iter()
                .map(|path| {
                    let outcome = normalize_file(&path, &self.normalizer)
                        .and_then(|tensor| LabeledExample::new(tensor, class_index))
                        .map(|example| example.with_source(path.clone()));
                    (path, outcome)
                })
                .collect();

            for (path, outcome) in outcomes {
                match outcome {
                    Ok(example) => {
                        class_counts[class_index] += 1;
                        examples.push(example);
                    }
                    Err(e) if e.is_item_local() => {
                        log::warn!("画像をスキップしました: {}: {}", path.display(), e);
                        skipped.push(SkippedFile {
                            path,
                            class_index,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            log::info!(
                "  クラス '{}': {} 枚読み込み",
                class_name,
                class_counts[class_index]
            );
        }

        if examples.is_empty() {
            return Err(ClassifierError::EmptyDataset(root.to_path_buf()));
        }

        if let Some(index) = class_counts.iter().position(|&count| count == 0) {
            return Err(ClassifierError::MissingClass {
                class_name: class_names[index].clone(),
                reason: "有効な画像が1枚もありません".to_string(),
            });
        }

        log::info!(
            "データセット読み込み完了: {} 枚 (スキップ {} 件)",
            examples.len(),
            skipped.len()
        );

        Ok(LoadedDataset {
            examples,
            class_names: class_names.to_vec(),
            class_counts,
            skipped,
        })
    }
}
