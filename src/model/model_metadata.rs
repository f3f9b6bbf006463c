//! モデルメタデータの定義
//!
//! 成果物（tar.gz）に同梱し、推論側は再学習なしでこの情報だけから前処理とモデル構成を復元します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::config::ModelSettings;
use crate::preprocess::{InputShape, NormalizerConfig};

/// 成果物の形式バージョン
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub format_version: u32,

    /// クラス名（インデックス1が陽性クラス）
    pub class_names: Vec<String>,

    /// モデルが受け付ける入力形状（高さ・幅は未確定の場合あり、チャネルは常に3）
    pub input_shape: InputShape,

    /// 学習時の前処理設定
    pub normalizer: NormalizerConfig,

    /// モデル構成
    pub model: ModelSettings,

    /// 最良チェックポイントの検証正解率
    #[serde(default)]
    pub best_val_accuracy: Option<f64>,

    /// 最良チェックポイントのフェーズ
    #[serde(default)]
    pub best_phase: Option<String>,

    /// 最良チェックポイントのフェーズ内エポック
    #[serde(default)]
    pub best_epoch: Option<usize>,

    /// 保存時点までに学習したエポック数（両フェーズ通し）
    #[serde(default)]
    pub epochs_trained: usize,

    /// モデルの学習時刻（RFC 3339）
    pub trained_at: String,
}

impl ArtifactMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        input_shape: InputShape,
        normalizer: NormalizerConfig,
        model: ModelSettings,
    ) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            class_names,
            input_shape,
            normalizer,
            model,
            best_val_accuracy: None,
            best_phase: None,
            best_epoch: None,
            epochs_trained: 0,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// チェックポイント情報を記録
    pub fn with_checkpoint(
        mut self,
        phase: impl Into<String>,
        epoch: usize,
        val_accuracy: f64,
        epochs_trained: usize,
    ) -> Self {
        self.best_phase = Some(phase.into());
        self.best_epoch = Some(epoch);
        self.best_val_accuracy = Some(val_accuracy);
        self.epochs_trained = epochs_trained;
        self.trained_at = chrono::Local::now().to_rfc3339();
        self
    }

    /// 推論に使えるかを検証
    pub fn validate(&self) -> Result<()> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            anyhow::bail!(
                "未対応の成果物バージョンです: {} (対応: {})",
                self.format_version,
                ARTIFACT_FORMAT_VERSION
            );
        }
        if self.class_names.len() != 2 {
            anyhow::bail!("クラス名はちょうど2個必要です: {:?}", self.class_names);
        }
        if self.model.backbone_channels.is_empty() {
            anyhow::bail!("モデル構成に特徴抽出器の層がありません");
        }
        self.input_shape.validate()?;
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
