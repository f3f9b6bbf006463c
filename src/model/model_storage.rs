//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力形状、前処理設定など）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! 保存は一時ファイルへ書き出してから置き換えるため、読み込み側が書きかけの成果物を見ることはありません。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ArtifactMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先パスを正規化（.gz で終わらない場合は拡張子を付与）
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .context(format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 戻り値は実際に書き込んだパスです。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ArtifactMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let partial_path = temporary_path(&tar_gz_path);
    let write_result = (|| -> Result<()> {
        let file = File::create(&partial_path)
            .context(format!("Failed to create tar.gz file: {:?}", partial_path))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut tar_builder = Builder::new(encoder);

        let json_str = metadata.to_json_string()?;
        append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
        append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

        let encoder = tar_builder
            .into_inner()
            .context("Failed to finalize tar.gz archive")?;
        let file = encoder.finish().context("Failed to finish gzip stream")?;
        file.sync_all().context("Failed to flush tar.gz file")?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&partial_path);
        return Err(e);
    }

    std::fs::rename(&partial_path, &tar_gz_path).context(format!(
        "Failed to move {:?} to {:?}",
        partial_path, tar_gz_path
    ))?;

    Ok(tar_gz_path)
}

fn read_entries(
    tar_gz_path: &Path,
    want_metadata: bool,
    want_model: bool,
) -> Result<(Option<ArtifactMetadata>, Option<Vec<u8>>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt = None;
    let mut model_binary_opt = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) if want_metadata => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ArtifactMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) if want_model => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }

        if (!want_metadata || metadata_opt.is_some()) && (!want_model || model_binary_opt.is_some()) {
            break;
        }
    }

    Ok((metadata_opt, model_binary_opt))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ArtifactMetadata> {
    read_entries(tar_gz_path, true, false)?
        .0
        .ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ArtifactMetadata, Vec<u8>)> {
    match read_entries(tar_gz_path, true, true)? {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &ArtifactMetadata) {
    log::info!("=== モデルメタデータ ===");
    log::info!("クラス: {}", metadata.class_names.join(", "));
    log::info!("入力形状: {}", metadata.input_shape);
    log::info!(
        "前処理: {} / コントラスト補正: {}",
        metadata.normalizer.target,
        if metadata.normalizer.contrast.is_some() { "あり" } else { "なし" }
    );
    log::info!("特徴抽出器チャネル: {:?}", metadata.model.backbone_channels);
    if let (Some(phase), Some(epoch), Some(acc)) = (
        &metadata.best_phase,
        metadata.best_epoch,
        metadata.best_val_accuracy,
    ) {
        log::info!("最良チェックポイント: {} エポック {} (検証正解率 {:.4})", phase, epoch, acc);
    }
    log::info!("学習エポック数: {}", metadata.epochs_trained);
    log::info!("学習日時: {}", metadata.trained_at);
}

#[cfg(feature = "ml")]
mod burn_io {
    use super::*;
    use burn::{
        module::Module,
        record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
        tensor::backend::Backend,
    };

    use crate::ml::classifier::{BinaryClassifier, ClassifierConfig};

    /// モデルの重みをバイト列に変換
    pub fn encode_model<B: Backend>(model: &BinaryClassifier<B>) -> Result<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        recorder
            .record(model.clone().into_record(), ())
            .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
    }

    /// モデルをメタデータと共に保存
    pub fn save_model<B: Backend>(
        output_path: &Path,
        model: &BinaryClassifier<B>,
        metadata: &ArtifactMetadata,
    ) -> Result<PathBuf> {
        let binary = encode_model(model)?;
        save_model_with_metadata(output_path, metadata, &binary)
    }

    /// 成果物からモデルを復元
    ///
    /// モデル構成はメタデータから組み立て、事前学習済み重みファイルは参照しません。
    pub fn load_model<B: Backend>(
        tar_gz_path: &Path,
        device: &B::Device,
    ) -> Result<(BinaryClassifier<B>, ArtifactMetadata)> {
        let (metadata, model_binary) = load_model_with_metadata(tar_gz_path)?;
        metadata.validate()?;

        let model = ClassifierConfig::from_settings(&metadata.model).init::<B>(device);

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

        Ok((model.load_record(record), metadata))
    }
}

#[cfg(feature = "ml")]
pub use burn_io::{encode_model, load_model, save_model};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::ModelSettings;
    use crate::preprocess::{InputShape, NormalizerConfig};
    use tempfile::tempdir;

    fn metadata() -> ArtifactMetadata {
        ArtifactMetadata::new(
            vec!["cats".to_string(), "dogs".to_string()],
            InputShape::fixed(64, 64),
            NormalizerConfig::default(),
            ModelSettings::default(),
        )
    }

    #[test]
    fn test_save_and_load_raw_artifact() {
        let dir = tempdir().unwrap();
        let written =
            save_model_with_metadata(&dir.path().join("nested/model"), &metadata(), &[1, 2, 3, 4])
                .unwrap();
        assert!(written.to_string_lossy().ends_with("model.tar.gz"));
        assert!(written.exists());
        assert!(!temporary_path(&written).exists());

        let (meta, binary) = load_model_with_metadata(&written).unwrap();
        assert_eq!(meta, metadata_with_time(&meta));
        assert_eq!(binary, vec![1, 2, 3, 4]);
        assert_eq!(load_metadata(&written).unwrap().class_names, meta.class_names);
    }

    fn metadata_with_time(loaded: &ArtifactMetadata) -> ArtifactMetadata {
        ArtifactMetadata {
            trained_at: loaded.trained_at.clone(),
            ..metadata()
        }
    }

    #[test]
    fn test_overwrite_replaces_previous_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("best.tar.gz");
        save_model_with_metadata(&path, &metadata(), &[1]).unwrap();
        save_model_with_metadata(&path, &metadata().with_checkpoint("head", 3, 0.8, 3), &[9, 9])
            .unwrap();

        let (meta, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(binary, vec![9, 9]);
        assert_eq!(meta.best_epoch, Some(3));
    }

    #[test]
    fn test_missing_or_corrupt_artifact_is_error() {
        let dir = tempdir().unwrap();
        assert!(load_metadata(&dir.path().join("absent.tar.gz")).is_err());

        let garbage = dir.path().join("garbage.tar.gz");
        std::fs::write(&garbage, b"not an archive").unwrap();
        assert!(load_model_with_metadata(&garbage).is_err());
    }

    #[cfg(feature = "ml")]
    #[test]
    fn test_model_roundtrip_preserves_outputs() {
        use crate::ml::classifier::build;
        use burn::tensor::Tensor;
        use burn_ndarray::NdArray;

        type TestBackend = NdArray<f32>;
        let device = Default::default();
        let settings = ModelSettings {
            backbone_channels: vec![4, 8],
            hidden_units: 8,
            bottleneck_units: 4,
            ..ModelSettings::default()
        };
        let (model, _) =
            build::<TestBackend>(&InputShape::fixed(8, 8), &settings, &device).unwrap();

        let dir = tempdir().unwrap();
        let meta = ArtifactMetadata {
            model: settings,
            ..metadata()
        };
        let path = save_model(&dir.path().join("model.tar.gz"), &model, &meta).unwrap();
        let (restored, restored_meta) = load_model::<TestBackend>(&path, &device).unwrap();
        assert_eq!(restored_meta.model, meta.model);

        let input = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device);
        let a = model.predict_proba(input.clone()).into_data().to_vec::<f32>().unwrap();
        let b = restored.predict_proba(input).into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}
