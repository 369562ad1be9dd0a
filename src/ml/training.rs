//! 分類ヘッドの学習ループ
//!
//! [`FitLoop`] は1バッチずつ進むイテレータ的な学習ループです。
//! 呼び出し側は `next_batch()` の合間に制御をイベントループへ戻せます。
//! バッチ分割とエポックごとのシャッフルは Burn の `DataLoader` に任せます。

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use serde::Serialize;

use crate::error::{panic_message, TrainError};
use crate::ml::dataset::{ExampleBatch, ExampleItem, ExampleRows};
use crate::ml::{ClassifierHead, ExampleSet};

/// fit呼び出し1回分の設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    /// シャッフル用シード（Noneなら毎回ランダム）
    pub seed: Option<u64>,
}

/// バッチ終了時の進捗
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEnd {
    /// 0始まりのエポック番号
    pub epoch: usize,
    /// エポック内の0始まりバッチ番号
    pub batch: usize,
    /// 全エポック通しての0始まりステップ番号
    pub step: usize,
    /// このバッチのサンプル数（最終バッチは端数になり得る）
    pub size: usize,
    /// このバッチのカテゴリカル交差エントロピー
    pub loss: f64,
}

/// 行データからシャッフル付きデータローダーを作成
pub fn build_loader<B: Backend>(
    rows: ExampleRows,
    batch_size: usize,
    shuffle_seed: u64,
    device: B::Device,
) -> Arc<dyn DataLoader<B, ExampleBatch<B>>> {
    DataLoaderBuilder::<B, ExampleItem, ExampleBatch<B>>::new(rows.batcher())
        .batch_size(batch_size)
        .shuffle(shuffle_seed)
        .set_device(device)
        .build(rows)
}

/// バッチ単位で進む学習ループ
///
/// 各エポックでローダーが `ceil(n / batch_size)` バッチを返す。
pub struct FitLoop<B: AutodiffBackend> {
    model: ClassifierHead<B>,
    optimizer: OptimizerAdaptor<Adam, ClassifierHead<B>, B>,
    loss_fn: CrossEntropyLoss<B>,
    loader: Arc<dyn DataLoader<B, ExampleBatch<B>>>,
    /// 現在のエポックで未処理のバッチ
    pending: VecDeque<ExampleBatch<B>>,
    config: FitConfig,
    epoch: usize,
    batch: usize,
    step: usize,
    failed: bool,
}

impl<B: AutodiffBackend> FitLoop<B> {
    /// 学習ループを準備（Adam + カテゴリカル交差エントロピー）
    pub fn new(
        model: ClassifierHead<B>,
        examples: &ExampleSet<B>,
        config: FitConfig,
    ) -> Result<Self, TrainError> {
        let (Some(rows), Some(xs)) = (examples.rows(), examples.xs()) else {
            return Err(TrainError::NoExamples);
        };
        if config.batch_size == 0 {
            return Err(TrainError::ZeroBatchSize {
                examples: examples.len(),
                fraction: 0.0,
            });
        }

        let device = xs.device();
        let seed = config.seed.unwrap_or_else(rand::random);
        let loader = build_loader::<B>(rows, config.batch_size, seed, device.clone());
        let loss_fn = CrossEntropyLossConfig::new().init(&device);

        Ok(Self {
            model,
            optimizer: AdamConfig::new().init::<B, ClassifierHead<B>>(),
            loss_fn,
            loader,
            pending: VecDeque::new(),
            config,
            epoch: 0,
            batch: 0,
            step: 0,
            failed: false,
        })
    }

    /// 1エポックあたりのバッチ数
    pub fn batches_per_epoch(&self) -> usize {
        self.loader.num_items().div_ceil(self.config.batch_size)
    }

    /// 全エポック合計のバッチ数
    pub fn total_batches(&self) -> usize {
        self.batches_per_epoch() * self.config.epochs
    }

    /// 完了済みステップ数
    pub fn steps_done(&self) -> usize {
        self.step
    }

    fn fail(&mut self, payload: Box<dyn std::any::Any + Send>) -> Option<Result<BatchEnd, TrainError>> {
        self.failed = true;
        self.pending.clear();
        Some(Err(TrainError::Runtime(panic_message(payload))))
    }

    /// 次のバッチを1つ処理する。全エポック完了後は `None`。
    ///
    /// 数値ランタイム内のpanicは [`TrainError::Runtime`] に変換され、以降は `None` を返す。
    pub fn next_batch(&mut self) -> Option<Result<BatchEnd, TrainError>> {
        if self.failed || self.epoch >= self.config.epochs {
            return None;
        }

        // ローダーのイテレータはローダーを借用するので、エポック単位で取り出しておく
        if self.pending.is_empty() {
            let loader = &self.loader;
            match panic::catch_unwind(AssertUnwindSafe(|| loader.iter().collect::<VecDeque<_>>())) {
                Ok(batches) => self.pending = batches,
                Err(payload) => return self.fail(payload),
            }
            self.batch = 0;
        }
        let batch = self.pending.pop_front()?;
        let size = batch.ys.dims()[0];

        let lr = self.config.learning_rate;
        let model = self.model.clone();
        let loss_fn = &self.loss_fn;
        let optimizer = &mut self.optimizer;

        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            let logits = model.forward(batch.xs);
            let loss = loss_fn.forward(logits, batch.ys);
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let model = optimizer.step(lr, model, grads);
            (model, loss_value)
        }));

        let (model, loss) = match outcome {
            Ok(result) => result,
            Err(payload) => return self.fail(payload),
        };
        self.model = model;

        if !loss.is_finite() {
            tracing::warn!(step = self.step, loss, "損失が有限値ではありません");
        }

        let event = BatchEnd {
            epoch: self.epoch,
            batch: self.batch,
            step: self.step,
            size,
            loss,
        };

        self.step += 1;
        self.batch += 1;
        if self.pending.is_empty() {
            self.epoch += 1;
        }

        Some(Ok(event))
    }

    /// 学習済みモデルを取り出す
    pub fn into_model(self) -> ClassifierHead<B> {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ClassifierHeadConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::{Distribution, Tensor};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn example_set(n: usize) -> ExampleSet<TestBackend> {
        let device = Default::default();
        let mut set = ExampleSet::new();
        for i in 0..n {
            let features =
                Tensor::<TestBackend, 4>::random([1, 3, 2, 2], Distribution::Default, &device);
            set.add_example(features, i % 4).unwrap();
        }
        set
    }

    fn fit_loop(n: usize, batch_size: usize, epochs: usize) -> FitLoop<TestBackend> {
        let device = Default::default();
        let head = ClassifierHeadConfig::new([3, 2, 2], 6).init::<TestBackend>(&device);
        FitLoop::new(
            head,
            &example_set(n),
            FitConfig {
                batch_size,
                epochs,
                learning_rate: 1e-2,
                seed: Some(7),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_batch_count_includes_partial_batch() {
        let mut fit = fit_loop(10, 4, 2);
        assert_eq!(fit.batches_per_epoch(), 3);
        assert_eq!(fit.total_batches(), 6);

        let mut sizes = Vec::new();
        let mut steps = Vec::new();
        while let Some(batch) = fit.next_batch() {
            let batch = batch.unwrap();
            sizes.push(batch.size);
            steps.push(batch.step);
        }

        assert_eq!(sizes, vec![4, 4, 2, 4, 4, 2]);
        assert_eq!(steps, (0..6).collect::<Vec<_>>());
        assert_eq!(fit.steps_done(), 6);
        assert!(fit.next_batch().is_none());
    }

    #[test]
    fn test_epoch_and_batch_numbers() {
        let mut fit = fit_loop(6, 3, 2);
        let events: Vec<BatchEnd> = std::iter::from_fn(|| fit.next_batch())
            .map(Result::unwrap)
            .collect();

        let positions: Vec<(usize, usize)> = events.iter().map(|e| (e.epoch, e.batch)).collect();
        assert_eq!(positions, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert!(events.iter().all(|e| e.loss.is_finite() && e.loss >= 0.0));
    }

    #[test]
    fn test_empty_examples_are_rejected() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new([3, 2, 2], 6).init::<TestBackend>(&device);
        let result = FitLoop::new(
            head,
            &ExampleSet::new(),
            FitConfig {
                batch_size: 1,
                epochs: 1,
                learning_rate: 1e-3,
                seed: None,
            },
        );
        assert!(matches!(result, Err(TrainError::NoExamples)));
    }

    #[test]
    fn test_shape_panic_becomes_runtime_error() {
        let device = Default::default();
        // 入力次元が合わないヘッドを意図的に渡す
        let head = ClassifierHeadConfig::new([5, 1, 1], 6).init::<TestBackend>(&device);
        let mut fit = FitLoop::new(
            head,
            &example_set(4),
            FitConfig {
                batch_size: 2,
                epochs: 1,
                learning_rate: 1e-3,
                seed: Some(1),
            },
        )
        .unwrap();

        assert!(matches!(fit.next_batch(), Some(Err(TrainError::Runtime(_)))));
        assert!(fit.next_batch().is_none());
    }

    #[test]
    fn test_loader_visits_every_example_once_per_epoch() {
        let device = Default::default();
        let set = example_set(10);
        let loader = build_loader::<TestBackend>(set.rows().unwrap(), 4, 3, device);

        // 2回目のiterでも全サンプルを1回ずつ返す
        for _ in 0..2 {
            let batches: Vec<_> = loader.iter().collect();
            assert_eq!(
                batches.iter().map(|b| b.ys.dims()[0]).collect::<Vec<_>>(),
                vec![4, 4, 2]
            );

            let mut labels: Vec<i64> = batches
                .into_iter()
                .flat_map(|b| b.ys.into_data().iter::<i64>().collect::<Vec<_>>())
                .collect();
            labels.sort();
            assert_eq!(labels, vec![0, 0, 0, 1, 1, 1, 2, 2, 3, 3]);
        }
    }

    #[test]
    fn test_same_seed_gives_same_losses() {
        let device = Default::default();
        let set = example_set(8);
        let head = ClassifierHeadConfig::new([3, 2, 2], 6).init::<TestBackend>(&device);
        let config = FitConfig {
            batch_size: 3,
            epochs: 2,
            learning_rate: 1e-2,
            seed: Some(11),
        };

        let losses = |head: ClassifierHead<TestBackend>| -> Vec<f64> {
            let mut fit = FitLoop::new(head, &set, config).unwrap();
            std::iter::from_fn(|| fit.next_batch())
                .map(|b| b.unwrap().loss)
                .collect()
        };

        let first = losses(head.clone());
        let second = losses(head);
        assert_eq!(first.len(), 6);
        assert_eq!(first, second);
    }
}
