//! 学習トリガー全体のシナリオテスト

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Distribution, Tensor};
use tokio::sync::mpsc;

use gesture_trainer::ml::{ExampleSet, FeatureExtractor, NUM_CLASSES};
use gesture_trainer::model::Hyperparameters;
use gesture_trainer::{TrainError, TrainOutcome, TrainerState, TrainingController, TrainingEvent};

type TestBackend = Autodiff<NdArray<f32>>;

struct FixedShapeExtractor;

impl FeatureExtractor<TestBackend> for FixedShapeExtractor {
    fn output_shape(&self) -> [usize; 3] {
        [4, 3, 3]
    }

    fn input_size(&self) -> usize {
        18
    }

    fn extract(&self, frames: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
        frames
    }
}

fn examples(n: usize) -> ExampleSet<TestBackend> {
    let device = Default::default();
    let mut set = ExampleSet::new();
    for i in 0..n {
        let features = Tensor::<TestBackend, 4>::random([1, 4, 3, 3], Distribution::Default, &device);
        set.add_example(features, i % NUM_CLASSES).unwrap();
    }
    set
}

fn setup() -> (
    TrainingController<TestBackend>,
    Arc<AtomicBool>,
    mpsc::UnboundedSender<TrainingEvent>,
    mpsc::UnboundedReceiver<TrainingEvent>,
) {
    let predicting = Arc::new(AtomicBool::new(true));
    let controller = TrainingController::new(Default::default(), predicting.clone()).with_seed(Some(7));
    let (tx, rx) = mpsc::unbounded_channel();
    (controller, predicting, tx, rx)
}

fn collect(rx: &mut mpsc::UnboundedReceiver<TrainingEvent>) -> Vec<TrainingEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn forty_examples_train_for_six_batches() {
    let (controller, predicting, tx, mut rx) = setup();
    let set = examples(40);
    let hyperparameters = Hyperparameters {
        epochs: 2,
        batch_size_fraction: 0.4,
        dense_units: 8,
        ..Hyperparameters::default()
    };

    let outcome = controller
        .train(Some(&FixedShapeExtractor), &set, &hyperparameters, &tx)
        .await
        .unwrap();
    let events = collect(&mut rx);

    // 16件のバッチ → 16, 16, 8 を2エポック
    let batches: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrainingEvent::Batch(b) => Some(b.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 6);
    assert_eq!(
        batches.iter().map(|b| b.size).collect::<Vec<_>>(),
        vec![16, 16, 8, 16, 16, 8]
    );
    assert!(batches.iter().all(|b| b.loss.is_finite()));

    assert_eq!(events.first().and_then(|e| e.status_text()).as_deref(), Some("Training..."));
    assert_eq!(
        events.iter().filter(|e| matches!(e, TrainingEvent::Completed { .. })).count(),
        1
    );
    assert!(matches!(events.last(), Some(TrainingEvent::Completed { steps: 6, .. })));
    assert!(events.contains(&TrainingEvent::ModelBuilt {
        input_features: 36,
        hidden_units: 8,
        output_units: NUM_CLASSES,
    }));

    let model = outcome.into_model().unwrap();
    let logits = model.forward(set.xs().unwrap().clone());
    assert_eq!(logits.dims(), [40, NUM_CLASSES]);

    assert!(!predicting.load(Ordering::SeqCst));
    assert_eq!(controller.state(), TrainerState::Idle);
}

#[tokio::test]
async fn empty_example_set_reports_add_examples() {
    let (controller, _, tx, mut rx) = setup();

    let err = controller
        .train(Some(&FixedShapeExtractor), &examples(0), &Hyperparameters::default(), &tx)
        .await
        .err()
        .unwrap();
    assert_eq!(err, TrainError::NoExamples);

    let events = collect(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, TrainingEvent::ModelBuilt { .. })));
    assert_eq!(
        events.last().and_then(|e| e.status_text()).as_deref(),
        Some("Add some examples before training!")
    );
    assert_eq!(controller.state(), TrainerState::Failed);
}

#[tokio::test]
async fn tiny_fraction_fails_with_zero_batch_size() {
    let (controller, _, tx, mut rx) = setup();
    let hyperparameters = Hyperparameters {
        batch_size_fraction: 0.1,
        ..Hyperparameters::default()
    };

    let err = controller
        .train(Some(&FixedShapeExtractor), &examples(3), &hyperparameters, &tx)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::ZeroBatchSize { examples: 3, .. }));

    let events = collect(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, TrainingEvent::Batch(_))));
    assert!(matches!(events.last(), Some(TrainingEvent::Failed { .. })));
}

#[tokio::test]
async fn missing_extractor_leaves_state_idle() {
    let (controller, predicting, tx, mut rx) = setup();

    let outcome = controller
        .train::<FixedShapeExtractor>(None, &examples(5), &Hyperparameters::default(), &tx)
        .await
        .unwrap();
    assert!(matches!(outcome, TrainOutcome::Skipped));
    assert_eq!(collect(&mut rx), vec![TrainingEvent::Skipped]);
    assert!(!predicting.load(Ordering::SeqCst));
    assert_eq!(controller.state(), TrainerState::Idle);
}
