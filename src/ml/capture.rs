//! ディスク上のフレーム画像からのサンプル収集
//!
//! `data_dir/<クラス名>/*.png` の構成を想定し、クラス名の並び順をラベルIDとして使います。

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};

use crate::ml::{ExampleSet, FeatureExtractor};

/// ImageNetの平均と標準偏差
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "png" || ext == "jpg" || ext == "jpeg"
        })
        .unwrap_or(false)
}

/// 画像を読み込んでリサイズ・正規化
///
/// # 戻り値
/// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
pub fn load_frame(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("画像の読み込みに失敗しました: {}", path.display()))?
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let mut data = Vec::with_capacity(3 * size * size);
    for channel in 0..3 {
        for pixel in img.pixels() {
            let value = pixel[channel] as f32 / 255.0;
            data.push((value - MEAN[channel]) / STD[channel]);
        }
    }

    Ok(data)
}

/// 正規化済みピクセル列を [1, 3, size, size] のテンソルへ
pub fn frame_tensor<B: Backend>(pixels: Vec<f32>, size: usize, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(pixels, [1, 3, size, size]), device)
}

/// クラスディレクトリ内の画像パス一覧（名前順）
fn class_images(class_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(class_dir)
        .with_context(|| format!("ディレクトリを読めません: {}", class_dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// サンプルディレクトリから特徴を抽出してサンプル集合へ追加
///
/// 存在しないクラスディレクトリは警告のみでスキップする。
///
/// # 戻り値
/// - クラスごとの追加件数（`class_names` と同じ順）
pub fn collect_from_directory<B, E>(
    data_dir: &Path,
    class_names: &[String],
    extractor: &E,
    examples: &mut ExampleSet<B>,
    device: &B::Device,
) -> Result<Vec<usize>>
where
    B: Backend,
    E: FeatureExtractor<B> + ?Sized,
{
    let size = extractor.input_size();
    let mut counts = vec![0; class_names.len()];

    for (label, class_name) in class_names.iter().enumerate() {
        let class_dir = data_dir.join(class_name);
        if !class_dir.is_dir() {
            tracing::warn!(class = %class_name, dir = %class_dir.display(), "クラスディレクトリが存在しません");
            continue;
        }

        for path in class_images(&class_dir)? {
            let pixels = load_frame(&path, size)?;
            let features = extractor.extract(frame_tensor::<B>(pixels, size, device));
            examples.add_example(features, label)?;
            counts[label] += 1;
        }

        tracing::info!(class = %class_name, count = counts[label], "サンプルを読み込みました");
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ConvExtractorConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn write_image(path: &Path, shade: u8) {
        let img = image::RgbImage::from_pixel(24, 24, image::Rgb([shade, shade / 2, 255 - shade]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_load_frame_normalizes_and_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        image::RgbImage::from_pixel(30, 30, image::Rgb([255, 255, 255]))
            .save(&path)
            .unwrap();

        let data = load_frame(&path, 18).unwrap();
        assert_eq!(data.len(), 3 * 18 * 18);
        let expected_red = (1.0 - MEAN[0]) / STD[0];
        assert!((data[0] - expected_red).abs() < 1e-4);
    }

    #[test]
    fn test_collect_from_directory_labels_by_class_order() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = ["up", "down", "left", "right"].iter().map(|s| s.to_string()).collect();

        std::fs::create_dir(dir.path().join("up")).unwrap();
        write_image(&dir.path().join("up").join("a.png"), 10);
        write_image(&dir.path().join("up").join("b.png"), 20);
        std::fs::write(dir.path().join("up").join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("right")).unwrap();
        write_image(&dir.path().join("right").join("c.png"), 200);

        let device = Default::default();
        let extractor = ConvExtractorConfig::new()
            .with_image_size(18)
            .init::<TestBackend>(&device)
            .unwrap();
        let mut examples = ExampleSet::new();

        let counts = collect_from_directory(dir.path(), &names, &extractor, &mut examples, &device).unwrap();

        assert_eq!(counts, vec![2, 0, 0, 1]);
        assert_eq!(examples.len(), 3);
        assert_eq!(examples.class_counts(), [2, 0, 0, 1]);
        assert_eq!(examples.feature_shape(), Some(extractor.output_shape()));
    }
}
