//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・データセット・前処理・モデル・学習・推論の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::error::{ClassifierError, Result};
use crate::preprocess::{AugmentationConfig, InputShape, NormalizerConfig};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// クラスごとのサブディレクトリを持つルート
    pub data_dir: PathBuf,
    /// クラス名（インデックス1が陽性クラス）
    pub class_names: Vec<String>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/train"),
            class_names: vec!["cats".to_string(), "dogs".to_string()],
        }
    }
}

/// モデル構成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 特徴抽出器の各層の出力チャネル数
    pub backbone_channels: Vec<usize>,
    /// 事前学習済み特徴抽出器の重み（burnレコード）
    #[serde(default)]
    pub pretrained_weights: Option<PathBuf>,
    pub hidden_units: usize,
    pub bottleneck_units: usize,
    /// 全結合層の前・中間・出力前のドロップアウト率
    pub dropout: [f64; 3],
    /// 成果物に入力の高さ・幅を未確定として記録する
    #[serde(default)]
    pub dynamic_input: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            backbone_channels: vec![32, 64, 128, 256],
            pretrained_weights: None,
            hidden_units: 256,
            bottleneck_units: 128,
            dropout: [0.5, 0.3, 0.2],
            dynamic_input: false,
        }
    }
}

impl ModelSettings {
    /// 特徴抽出器の層数
    pub fn num_layers(&self) -> usize {
        self.backbone_channels.len()
    }

    /// 受け付ける最小の辺長（層ごとに 2x2 プーリング）
    pub fn min_input_side(&self) -> u32 {
        1u32 << self.num_layers().min(16)
    }
}

/// フェーズごとの学習設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseSettings {
    pub epochs: usize,
    pub learning_rate: f64,
}

/// 学習率減衰の設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrDecaySettings {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    pub min_delta: f64,
}

impl Default for LrDecaySettings {
    fn default() -> Self {
        Self {
            factor: 0.2,
            patience: 8,
            min_lr: 1e-7,
            min_delta: 1e-4,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// バッチサイズ
    pub batch_size: usize,
    /// ランダムシード
    pub seed: u64,
    /// テスト分割の割合
    pub test_fraction: f64,
    /// テストを除いた残りに対する検証分割の割合
    pub val_fraction: f64,
    /// フェーズA（特徴抽出器を凍結して分類ヘッドのみ学習）
    pub head_phase: PhaseSettings,
    /// フェーズB（微調整）
    pub fine_tune_phase: PhaseSettings,
    /// フェーズBでも凍結したままにする先頭層の数
    pub fine_tune_frozen_layers: usize,
    /// 検証損失が改善しないまま許容するエポック数
    pub early_stopping_patience: usize,
    pub lr_decay: LrDecaySettings,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            seed: 42,
            test_fraction: 0.15,
            val_fraction: 0.15,
            head_phase: PhaseSettings {
                epochs: 20,
                learning_rate: 1e-3,
            },
            fine_tune_phase: PhaseSettings {
                epochs: 30,
                learning_rate: 1e-4,
            },
            fine_tune_frozen_layers: 2,
            early_stopping_patience: 15,
            lr_decay: LrDecaySettings::default(),
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingSettings {
    /// 使用するモデルファイルのパス
    pub model_path: PathBuf,
    /// 学習時と同じコントラスト補正を推論時にも適用する
    pub enforce_training_parity: bool,
}

impl Default for ServingSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/pet_classifier.tar.gz"),
            enforce_training_parity: true,
        }
    }
}

/// 出力先設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub artifact_path: PathBuf,
    pub report_path: PathBuf,
    pub history_path: PathBuf,
    /// 学習後の特徴抽出器の重みの書き出し先（`model.pretrained_weights` にそのまま指定できる）
    #[serde(default)]
    pub backbone_path: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("models/pet_classifier.tar.gz"),
            report_path: PathBuf::from("models/training_report.json"),
            history_path: PathBuf::from("models/training_history.csv"),
            backbone_path: None,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub preprocessing: NormalizerConfig,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub serving: ServingSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

fn invalid(message: String) -> ClassifierError {
    ClassifierError::InvalidConfig(message)
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value < 1.0) {
        return Err(invalid(format!(
            "{} は (0, 1) の範囲で指定してください: {}",
            name, value
        )));
    }
    Ok(())
}

fn check_learning_rate(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(invalid(format!("{} は正の値が必要です: {}", name, value)));
    }
    Ok(())
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("設定ファイルの形式が不正です: {}", path.display()))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    log::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}",
                        path.display(),
                        e
                    );
                    log::warn!("デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("設定ファイルを保存できません: {}", path.display()))?;
        Ok(())
    }

    /// 学習を始める前の検証
    pub fn validate(&self) -> Result<()> {
        if self.dataset.class_names.len() != 2 {
            return Err(invalid(format!(
                "クラス名はちょうど2個必要です: {:?}",
                self.dataset.class_names
            )));
        }
        if self.dataset.class_names[0] == self.dataset.class_names[1] {
            return Err(invalid("クラス名が重複しています".to_string()));
        }

        self.preprocessing.validate()?;
        let Some((height, width)) = self.preprocessing.target.concrete() else {
            return Err(invalid(
                "学習時は前処理の入力サイズ（高さ・幅）を指定してください".to_string(),
            ));
        };
        self.augmentation.validate()?;

        let model = &self.model;
        if model.backbone_channels.is_empty() || model.backbone_channels.contains(&0) {
            return Err(invalid(format!(
                "backbone_channels が不正です: {:?}",
                model.backbone_channels
            )));
        }
        let min_side = model.min_input_side();
        if height < min_side || width < min_side {
            return Err(invalid(format!(
                "入力サイズ {}x{} は {} 層の特徴抽出器には小さすぎます（最小 {}x{}）",
                height,
                width,
                model.num_layers(),
                min_side,
                min_side
            )));
        }
        if model.hidden_units == 0 || model.bottleneck_units == 0 {
            return Err(invalid("全結合層のユニット数は1以上が必要です".to_string()));
        }
        if let Some(p) = model.dropout.iter().find(|p| !(0.0..1.0).contains(*p)) {
            return Err(invalid(format!("ドロップアウト率は [0, 1) が必要です: {}", p)));
        }

        let training = &self.training;
        if training.batch_size == 0 {
            return Err(invalid("batch_size は1以上が必要です".to_string()));
        }
        check_fraction("test_fraction", training.test_fraction)?;
        check_fraction("val_fraction", training.val_fraction)?;
        check_learning_rate("head_phase.learning_rate", training.head_phase.learning_rate)?;
        check_learning_rate(
            "fine_tune_phase.learning_rate",
            training.fine_tune_phase.learning_rate,
        )?;
        if training.fine_tune_frozen_layers > model.num_layers() {
            return Err(invalid(format!(
                "fine_tune_frozen_layers ({}) が層数 ({}) を超えています",
                training.fine_tune_frozen_layers,
                model.num_layers()
            )));
        }
        if training.early_stopping_patience == 0 {
            return Err(invalid("early_stopping_patience は1以上が必要です".to_string()));
        }

        let decay = &training.lr_decay;
        if !(decay.factor > 0.0 && decay.factor < 1.0) {
            return Err(invalid(format!(
                "lr_decay.factor は (0, 1) が必要です: {}",
                decay.factor
            )));
        }
        if decay.patience == 0 || decay.min_lr < 0.0 || decay.min_delta < 0.0 {
            return Err(invalid(format!("lr_decay の設定が不正です: {:?}", decay)));
        }
        Ok(())
    }

    /// 成果物に記録する入力形状
    pub fn declared_input_shape(&self) -> InputShape {
        if self.model.dynamic_input {
            InputShape::dynamic()
        } else {
            self.preprocessing.target
        }
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        log::info!("=== アプリケーション設定 ===");
        log::info!("計算デバイス: {}", self.device_type);
        log::info!("データセット: {}", self.dataset.data_dir.display());
        log::info!("クラス: {}", self.dataset.class_names.join(", "));
        log::info!(
            "入力サイズ: {} (コントラスト補正: {})",
            self.preprocessing.target,
            if self.preprocessing.contrast.is_some() { "有効" } else { "無効" }
        );
        log::info!("特徴抽出器: {:?}", self.model.backbone_channels);
        log::info!(
            "バッチサイズ: {}, シード: {}",
            self.training.batch_size,
            self.training.seed
        );
        log::info!(
            "フェーズA: {} エポック @ {}, フェーズB: {} エポック @ {} (先頭 {} 層を凍結)",
            self.training.head_phase.epochs,
            self.training.head_phase.learning_rate,
            self.training.fine_tune_phase.epochs,
            self.training.fine_tune_phase.learning_rate,
            self.training.fine_tune_frozen_layers
        );
        log::info!("出力先: {}", self.output.artifact_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.head_phase.epochs, 20);
        assert_eq!(config.training.fine_tune_phase.epochs, 30);
        assert_eq!(config.preprocessing.target, InputShape::fixed(224, 224));
        assert!(config.serving.enforce_training_parity);
        config.validate().unwrap();
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model, deserialized.model);
        assert_eq!(config.training.lr_decay, deserialized.training.lr_decay);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"device_type": "Cpu"}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.dataset.class_names.len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.training.seed = 7;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.seed, 7);

        let fallback = AppConfig::load_or_default(tmp.path().join("missing.json"));
        assert_eq!(fallback.training.seed, 42);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.dataset.class_names = vec!["only".to_string()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.test_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.fine_tune_frozen_layers = 9;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.preprocessing.target = InputShape::fixed(8, 8);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.preprocessing.target = InputShape::dynamic();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_declared_input_shape() {
        let mut config = AppConfig::default();
        assert_eq!(config.declared_input_shape(), InputShape::fixed(224, 224));
        config.model.dynamic_input = true;
        assert_eq!(config.declared_input_shape().concrete(), None);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
