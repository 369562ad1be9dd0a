//! 学習トリガーのワークフロー
//!
//! UIの「Train」操作1回につき [`TrainingController::train`] を1回呼び出します。
//! ステータス文字列や予測フラグへ直接書き込む代わりに、
//! [`TrainingEvent`] をチャネルへ流し、結果は型付きで返します。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use burn::module::Module;
use burn::tensor::backend::AutodiffBackend;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, TrainError};
use crate::ml::{ClassifierHead, ClassifierHeadConfig, ExampleSet, FeatureExtractor, FitConfig, FitLoop};
use crate::model::Hyperparameters;
use crate::types::{TrainerState, TrainingEvent};

/// 実効バッチサイズ `floor(example_count * fraction)`
///
/// 0またはNaNになる場合は設定エラー。
pub fn effective_batch_size(example_count: usize, fraction: f64) -> Result<usize, TrainError> {
    let size = (example_count as f64 * fraction).floor();
    if size.is_nan() || size < 1.0 {
        return Err(TrainError::ZeroBatchSize {
            examples: example_count,
            fraction,
        });
    }
    Ok(size as usize)
}

/// 学習1回分の結果
#[derive(Debug)]
pub enum TrainOutcome<B: AutodiffBackend> {
    /// 学習済みモデル（所有権は呼び出し側へ）
    Trained(ClassifierHead<B>),
    /// 特徴抽出器が未準備のため何もしなかった
    Skipped,
}

impl<B: AutodiffBackend> TrainOutcome<B> {
    pub fn into_model(self) -> Option<ClassifierHead<B>> {
        match self {
            TrainOutcome::Trained(model) => Some(model),
            TrainOutcome::Skipped => None,
        }
    }
}

fn lock_state(state: &Mutex<TrainerState>) -> MutexGuard<'_, TrainerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 学習中フラグのRAIIガード
///
/// releaseせずにドロップされた場合（Futureの破棄など）は `Idle` に戻す。
struct TrainingGuard {
    state: Arc<Mutex<TrainerState>>,
    released: bool,
}

impl TrainingGuard {
    fn acquire(state: &Arc<Mutex<TrainerState>>) -> Result<Self, TrainError> {
        let mut current = lock_state(state);
        if *current == TrainerState::Training {
            return Err(TrainError::AlreadyTraining);
        }
        *current = TrainerState::Training;

        Ok(Self {
            state: state.clone(),
            released: false,
        })
    }

    fn release(mut self, next: TrainerState) {
        *lock_state(&self.state) = next;
        self.released = true;
    }
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        if !self.released {
            *lock_state(&self.state) = TrainerState::Idle;
        }
    }
}

fn emit(events: &UnboundedSender<TrainingEvent>, event: TrainingEvent) {
    if events.send(event).is_err() {
        debug!("イベントの受信側が閉じられています");
    }
}

/// 転移学習の学習コントローラー
pub struct TrainingController<B: AutodiffBackend> {
    device: B::Device,
    state: Arc<Mutex<TrainerState>>,
    /// 推論ループと共有する「予測中」フラグ
    predicting: Arc<AtomicBool>,
    seed: Option<u64>,
}

impl<B: AutodiffBackend> TrainingController<B> {
    pub fn new(device: B::Device, predicting: Arc<AtomicBool>) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(TrainerState::Idle)),
            predicting,
            seed: None,
        }
    }

    /// シャッフル用シードを固定
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn state(&self) -> TrainerState {
        *lock_state(&self.state)
    }

    pub fn is_training(&self) -> bool {
        self.state() == TrainerState::Training
    }

    /// 学習を1回実行
    ///
    /// - 学習中の再トリガーは [`TrainError::AlreadyTraining`]（実行中の学習には影響しない）
    /// - 失敗時はログ出力し、最後のイベントとして `Failed` を送ってからエラーを返す
    pub async fn train<E>(
        &self,
        extractor: Option<&E>,
        examples: &ExampleSet<B>,
        hyperparameters: &Hyperparameters,
        events: &UnboundedSender<TrainingEvent>,
    ) -> Result<TrainOutcome<B>, TrainError>
    where
        E: FeatureExtractor<B> + ?Sized,
    {
        let guard = match TrainingGuard::acquire(&self.state) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("学習中のため再トリガーを無視します");
                return Err(e);
            }
        };

        // 学習中に設定が変わっても影響を受けないようにコピーしておく
        let hyperparameters = *hyperparameters;
        self.predicting.store(false, Ordering::SeqCst);

        let result = self.run(extractor, examples, hyperparameters, events).await;
        match &result {
            Ok(_) => guard.release(TrainerState::Idle),
            Err(e) => {
                error!(error = %e, user_correctable = e.is_user_correctable(), "学習に失敗しました");
                emit(events, TrainingEvent::Failed { message: e.to_string() });
                guard.release(TrainerState::Failed);
            }
        }
        result
    }

    async fn run<E>(
        &self,
        extractor: Option<&E>,
        examples: &ExampleSet<B>,
        hyperparameters: Hyperparameters,
        events: &UnboundedSender<TrainingEvent>,
    ) -> Result<TrainOutcome<B>, TrainError>
    where
        E: FeatureExtractor<B> + ?Sized,
    {
        // 前提条件は非同期処理に入る前に確認する
        hyperparameters.validate()?;
        if examples.is_empty() {
            return Err(TrainError::NoExamples);
        }
        let Some(extractor) = extractor else {
            debug!("特徴抽出器が未準備のため学習をスキップします");
            emit(events, TrainingEvent::Skipped);
            return Ok(TrainOutcome::Skipped);
        };

        let example_count = examples.len();
        info!(
            examples = example_count,
            epochs = hyperparameters.epochs,
            learning_rate = hyperparameters.learning_rate,
            batch_size_fraction = hyperparameters.batch_size_fraction,
            dense_units = hyperparameters.dense_units,
            "学習を開始します"
        );
        emit(
            events,
            TrainingEvent::Started {
                examples: example_count,
                epochs: hyperparameters.epochs,
            },
        );

        // 保留中のUI更新を反映させるため2回譲る
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let input_shape = extractor.output_shape();
        if let Some(actual) = examples.feature_shape() {
            if actual != input_shape {
                return Err(TrainError::ShapeMismatch {
                    expected: input_shape,
                    actual,
                });
            }
        }

        let head_config = ClassifierHeadConfig::new(input_shape, hyperparameters.dense_units);
        let model = panic::catch_unwind(AssertUnwindSafe(|| head_config.init::<B>(&self.device)))
            .map_err(|payload| TrainError::Runtime(panic_message(payload)))?;
        emit(
            events,
            TrainingEvent::ModelBuilt {
                input_features: model.input_features(),
                hidden_units: model.hidden_units(),
                output_units: model.output_units(),
            },
        );

        let batch_size = effective_batch_size(example_count, hyperparameters.batch_size_fraction)?;
        let mut fit = FitLoop::new(
            model,
            examples,
            FitConfig {
                batch_size,
                epochs: hyperparameters.epochs,
                learning_rate: hyperparameters.learning_rate,
                seed: self.seed,
            },
        )?;
        debug!(
            batch_size,
            total_batches = fit.total_batches(),
            "学習ループを準備しました"
        );

        let mut final_loss = None;
        while let Some(batch) = fit.next_batch() {
            let batch = batch?;
            debug!(epoch = batch.epoch, batch = batch.batch, loss = batch.loss, "バッチ完了");
            final_loss = Some(batch.loss);
            emit(events, TrainingEvent::Batch(batch));

            // バッチごとにイベントループへ制御を戻す
            tokio::task::yield_now().await;
        }

        let steps = fit.steps_done();
        let model = fit.into_model();
        info!(steps, params = model.num_params(), final_loss = ?final_loss, "学習が完了しました");
        emit(events, TrainingEvent::Completed { steps, final_loss });

        Ok(TrainOutcome::Trained(model))
    }
}
