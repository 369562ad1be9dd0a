//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、形状、ハイパーパラメータなど）
//! - head.bin        - 分類ヘッドの重み
//! - extractor.bin   - 特徴抽出器の重み

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::ml::{
    ClassifierHead, ClassifierHeadConfig, ConvExtractorConfig, ConvFeatureExtractor, NUM_CLASSES,
};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const HEAD_ENTRY: &str = "head.bin";
const EXTRACTOR_ENTRY: &str = "extractor.bin";

/// 復元済みモデル一式
pub struct ModelBundle<B: Backend> {
    pub metadata: ModelMetadata,
    pub extractor: ConvFeatureExtractor<B>,
    pub head: ClassifierHead<B>,
}

fn tar_gz_path(output_path: &Path) -> PathBuf {
    // output_pathがすでに.gzで終わっている場合はそのまま、そうでなければ拡張子を追加
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// 分類ヘッドの重みをバイト列へ
pub fn head_to_bytes<B: Backend>(head: &ClassifierHead<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(head.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("分類ヘッドの書き出しエラー: {:?}", e))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// # 戻り値
/// - 実際に書き込んだファイルパス
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    head_binary: &[u8],
    extractor_binary: &[u8],
) -> Result<PathBuf> {
    let path = tar_gz_path(output_path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let file = File::create(&path).with_context(|| format!("Failed to create tar.gz file: {:?}", path))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    append_entry(&mut builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut builder, HEAD_ENTRY, head_binary)?;
    append_entry(&mut builder, EXTRACTOR_ENTRY, extractor_binary)?;

    builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    tracing::info!(path = %path.display(), "モデルを保存しました");
    Ok(path)
}

/// アーカイブ内の全エントリを読み込む
fn read_entries(tar_gz_path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = File::open(tar_gz_path).with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer)?;
        entries.push((name, buffer));
    }
    Ok(entries)
}

fn take_entry(entries: &mut Vec<(String, Vec<u8>)>, name: &str) -> Result<Vec<u8>> {
    let index = entries
        .iter()
        .position(|(entry, _)| entry == name)
        .ok_or_else(|| anyhow::anyhow!("{} not found in tar.gz archive", name))?;
    Ok(entries.swap_remove(index).1)
}

/// Tar.gzからモデルメタデータだけを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_entries(tar_gz_path)?;
    let json = String::from_utf8(take_entry(&mut entries, METADATA_ENTRY)?)
        .context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json)
}

/// Tar.gzからメタデータ・特徴抽出器・分類ヘッドを復元
pub fn load_model_bundle<B: Backend>(tar_gz_path: &Path, device: &B::Device) -> Result<ModelBundle<B>> {
    let mut entries = read_entries(tar_gz_path)?;

    let json = String::from_utf8(take_entry(&mut entries, METADATA_ENTRY)?)
        .context("metadata.json is not valid UTF-8")?;
    let metadata = ModelMetadata::from_json_string(&json)?;
    if metadata.class_names.len() != NUM_CLASSES {
        anyhow::bail!(
            "metadata lists {} classes, expected {}",
            metadata.class_names.len(),
            NUM_CLASSES
        );
    }

    let extractor = ConvExtractorConfig::new()
        .with_image_size(metadata.image_size)
        .init::<B>(device)?
        .load_weights(take_entry(&mut entries, EXTRACTOR_ENTRY)?, device)?;

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(take_entry(&mut entries, HEAD_ENTRY)?, device)
        .map_err(|e| anyhow::anyhow!("分類ヘッドの読み込みエラー: {:?}", e))?;
    let head = ClassifierHeadConfig::new(metadata.feature_shape, metadata.dense_units())
        .init::<B>(device)
        .load_record(record);

    Ok(ModelBundle {
        metadata,
        extractor,
        head,
    })
}

/// メタデータをログへ出力
pub fn log_metadata_info(metadata: &ModelMetadata) {
    tracing::info!(
        classes = %metadata.class_names.join(", "),
        image_size = metadata.image_size,
        feature_shape = ?metadata.feature_shape,
        dense_units = metadata.dense_units(),
        examples = metadata.example_count,
        steps = metadata.steps,
        final_loss = ?metadata.final_loss,
        trained_at = %metadata.trained_at,
        "モデルメタデータ"
    );
}
