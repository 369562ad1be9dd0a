//! 学習済みヘッドによるジェスチャー推論

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};

use crate::ml::{ClassifierHead, FeatureExtractor};

/// 1フレーム分の予測結果
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub probability: f32,
}

/// 推論エンジン（特徴抽出器 + 分類ヘッド）
pub struct GesturePredictor<B: Backend, E: FeatureExtractor<B>> {
    extractor: E,
    head: ClassifierHead<B>,
    class_names: Vec<String>,
}

impl<B: Backend, E: FeatureExtractor<B>> GesturePredictor<B, E> {
    pub fn new(extractor: E, head: ClassifierHead<B>, class_names: Vec<String>) -> Self {
        Self {
            extractor,
            head,
            class_names,
        }
    }

    /// フレームのバッチを分類
    ///
    /// # 引数
    /// - `frames`: 正規化済みフレーム [batch_size, 3, size, size]
    pub fn classify(&self, frames: Tensor<B, 4>) -> Result<Vec<Prediction>> {
        let features = self.extractor.extract(frames);
        let (classes, probs) = self.head.predict(features);
        let [batch_size, num_classes] = probs.dims();

        let classes: Vec<usize> = classes
            .into_data()
            .iter::<i64>()
            .map(|class| class as usize)
            .collect();
        let probs: Vec<f32> = probs.into_data().iter::<f32>().collect();

        let mut predictions = Vec::with_capacity(batch_size);
        for (row, &class_index) in classes.iter().enumerate() {
            let label = self
                .class_names
                .get(class_index)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?;
            predictions.push(Prediction {
                class_index,
                label,
                probability: probs[row * num_classes + class_index],
            });
        }

        Ok(predictions)
    }

    /// 単一フレーム [3, size, size] を分類
    pub fn classify_frame(&self, frame: Tensor<B, 3>) -> Result<Prediction> {
        self.classify(frame.unsqueeze_dim(0))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn input_size(&self) -> usize {
        self.extractor.input_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{ClassifierHeadConfig, ConvExtractorConfig, CLASS_NAMES};
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_classify_returns_named_predictions() {
        let device = Default::default();
        let extractor = ConvExtractorConfig::new()
            .with_image_size(18)
            .init::<TestBackend>(&device)
            .unwrap();
        let head = ClassifierHeadConfig::new(extractor.output_shape(), 4).init(&device);
        let names: Vec<String> = CLASS_NAMES.iter().map(|n| n.to_string()).collect();
        let predictor = GesturePredictor::new(extractor, head, names);

        let frames = Tensor::<TestBackend, 4>::random([2, 3, 18, 18], Distribution::Default, &device);
        let predictions = predictor.classify(frames).unwrap();

        assert_eq!(predictions.len(), 2);
        for prediction in &predictions {
            assert!(prediction.class_index < 4);
            assert_eq!(prediction.label, CLASS_NAMES[prediction.class_index]);
            assert!(prediction.probability >= 0.25 - 1e-4 && prediction.probability <= 1.0);
        }

        let single = predictor
            .classify_frame(Tensor::zeros([3, 18, 18], &device))
            .unwrap();
        assert!(single.class_index < 4);
    }
}
