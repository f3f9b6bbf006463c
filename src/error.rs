//! ライブラリ共通のエラー型
//!
//! 画像単位の失敗（デコード・前処理）と、実行全体を無効にする失敗
//! （空データセット・クラス欠落・モデル利用不可）を型で区別します。

use std::path::PathBuf;

/// 分類パイプラインのエラー
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// 1ファイルを画像として読めなかった（呼び出し側でスキップする）
    #[error("画像をデコードできません: {path:?}: {reason}")]
    Decode {
        path: Option<PathBuf>,
        reason: String,
    },

    /// 読み込み後に有効な画像が1枚もない
    #[error("学習データがありません: {0}")]
    EmptyDataset(PathBuf),

    /// 宣言されたクラスのディレクトリが無い、または画像が0枚
    #[error("クラス '{class_name}' が利用できません: {reason}")]
    MissingClass { class_name: String, reason: String },

    /// 成果物から推論用モデルを構築できなかった
    #[error("モデルが利用できません: {0}")]
    ModelUnavailable(String),

    /// 推論時の前処理失敗（不正なアップロードなど）
    #[error("前処理エラー: {0}")]
    Preprocessing(String),

    /// 層化分割に必要な件数が足りない
    #[error("クラス {class_index} のサンプルが不足しています: {count} 件 (最低 {required} 件)")]
    InsufficientExamples {
        class_index: usize,
        count: usize,
        required: usize,
    },

    #[error("設定が不正です: {0}")]
    InvalidConfig(String),

    #[error("成果物エラー: {0}")]
    Artifact(String),

    #[error("バックエンドエラー: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

impl ClassifierError {
    /// 1サンプルに閉じた失敗か（ローダーが吸収してよいか）
    pub fn is_item_local(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Preprocessing(_))
    }
}
