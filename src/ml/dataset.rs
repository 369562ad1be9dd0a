//! 学習サンプルの蓄積
//!
//! キャプチャ側が特徴抽出器の出力とラベルを1件ずつ追加していき、
//! 学習時には [`ExampleRows`] として `DataLoader` へ渡します。

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};

use crate::error::TrainError;
use crate::ml::NUM_CLASSES;

/// ラベル付き特徴サンプル集合
///
/// 不変条件: `xs` と `ys` の先頭次元（サンプル数）は常に一致する。
/// 空の状態も有効で、学習を試みた時点で初めてエラーになる。
#[derive(Debug, Clone)]
pub struct ExampleSet<B: Backend> {
    xs: Option<Tensor<B, 4>>,  // [n, c, h, w]
    ys: Option<Tensor<B, 1, Int>>, // [n]
    labels: Vec<usize>,
}

impl<B: Backend> Default for ExampleSet<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ExampleSet<B> {
    pub fn new() -> Self {
        Self {
            xs: None,
            ys: None,
            labels: Vec::new(),
        }
    }

    /// 特徴とラベルを追加
    ///
    /// `features` は [k, c, h, w]。k件すべてに同じラベルを付ける。
    pub fn add_example(&mut self, features: Tensor<B, 4>, label: usize) -> Result<(), TrainError> {
        if label >= NUM_CLASSES {
            return Err(TrainError::InvalidLabel {
                label,
                classes: NUM_CLASSES,
            });
        }

        let [count, c, h, w] = features.dims();
        if count == 0 {
            return Ok(());
        }
        if let Some(expected) = self.feature_shape() {
            if expected != [c, h, w] {
                return Err(TrainError::ShapeMismatch {
                    expected,
                    actual: [c, h, w],
                });
            }
        }

        let device = features.device();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(vec![label as i64; count], [count]),
            &device,
        );
        let features = features.detach();

        self.xs = Some(match self.xs.take() {
            Some(xs) => Tensor::cat(vec![xs, features], 0),
            None => features,
        });
        self.ys = Some(match self.ys.take() {
            Some(ys) => Tensor::cat(vec![ys, targets], 0),
            None => targets,
        });
        self.labels.extend(std::iter::repeat(label).take(count));

        Ok(())
    }

    /// サンプル数
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 1サンプルあたりの特徴形状 [c, h, w]
    pub fn feature_shape(&self) -> Option<[usize; 3]> {
        self.xs.as_ref().map(|xs| {
            let [_, c, h, w] = xs.dims();
            [c, h, w]
        })
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    /// 特徴テンソル [n, c, h, w]
    pub fn xs(&self) -> Option<&Tensor<B, 4>> {
        self.xs.as_ref()
    }

    /// ラベルテンソル [n]
    pub fn ys(&self) -> Option<&Tensor<B, 1, Int>> {
        self.ys.as_ref()
    }

    /// 全サンプルを破棄
    pub fn clear(&mut self) {
        self.xs = None;
        self.ys = None;
        self.labels.clear();
    }

    /// DataLoader用の行データ（空ならNone）
    pub fn rows(&self) -> Option<ExampleRows> {
        let shape = self.feature_shape()?;
        let features: Vec<f32> = self.xs.as_ref()?.clone().into_data().iter::<f32>().collect();
        Some(ExampleRows {
            features,
            shape,
            labels: self.labels.clone(),
        })
    }

    /// ラベル検証を通さずに組み立てる（壊れた集合を再現するテスト用）
    #[cfg(test)]
    pub(crate) fn from_unchecked(xs: Tensor<B, 4>, labels: Vec<usize>) -> Self {
        let device = xs.device();
        let targets: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let ys = Tensor::from_data(TensorData::new(targets, [labels.len()]), &device);
        Self {
            xs: Some(xs),
            ys: Some(ys),
            labels,
        }
    }
}

/// 1サンプル分の特徴とラベル
#[derive(Debug, Clone)]
pub struct ExampleItem {
    pub features: Vec<f32>, // c * h * w
    pub label: usize,
}

/// [`ExampleSet`] を平坦化した行データ
#[derive(Debug, Clone)]
pub struct ExampleRows {
    features: Vec<f32>,
    shape: [usize; 3],
    labels: Vec<usize>,
}

impl ExampleRows {
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// 対応するバッチャー
    pub fn batcher(&self) -> ExampleBatcher {
        ExampleBatcher { shape: self.shape }
    }
}

impl Dataset<ExampleItem> for ExampleRows {
    fn get(&self, index: usize) -> Option<ExampleItem> {
        let [c, h, w] = self.shape;
        let stride = c * h * w;
        let label = *self.labels.get(index)?;
        let features = self
            .features
            .get(index * stride..(index + 1) * stride)?
            .to_vec();
        Some(ExampleItem { features, label })
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ExampleBatch<B: Backend> {
    pub xs: Tensor<B, 4>,      // [batch, c, h, w]
    pub ys: Tensor<B, 1, Int>, // [batch]
}

/// 行データをバッチテンソルへまとめる
#[derive(Debug, Clone)]
pub struct ExampleBatcher {
    shape: [usize; 3],
}

impl<B: Backend> Batcher<B, ExampleItem, ExampleBatch<B>> for ExampleBatcher {
    fn batch(&self, items: Vec<ExampleItem>, device: &B::Device) -> ExampleBatch<B> {
        let [c, h, w] = self.shape;
        let batch_size = items.len();

        let mut features = Vec::with_capacity(batch_size * c * h * w);
        let mut targets = Vec::with_capacity(batch_size);
        for item in items {
            features.extend_from_slice(&item.features);
            targets.push(item.label as i64);
        }

        let xs = Tensor::<B, 4>::from_data(TensorData::new(features, [batch_size, c, h, w]), device);
        let ys = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [batch_size]), device);

        ExampleBatch { xs, ys }
    }
}
