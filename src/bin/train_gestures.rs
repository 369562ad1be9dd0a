//! ジェスチャー分類ヘッドの学習・推論CLI
//!
//! - `train`:   `data_dir/<クラス名>/*.png` から特徴を集めて分類ヘッドを学習
//! - `predict`: 保存済みモデルで1枚の画像を分類

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use gesture_trainer::logging::init_tracing;
use gesture_trainer::ml::{
    collect_from_directory, frame_tensor, load_frame, ConvExtractorConfig, ExampleSet, FeatureExtractor,
    GesturePredictor,
};
use gesture_trainer::model::{
    head_to_bytes, load_model_bundle, log_metadata_info, save_model_with_metadata, AppConfig, ModelMetadata,
};
use gesture_trainer::{TrainOutcome, TrainingController, TrainingEvent};

#[cfg(feature = "wgpu")]
type InnerBackend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
type InnerBackend = burn::backend::NdArray<f32>;
type TrainBackend = burn::backend::Autodiff<InnerBackend>;

#[derive(Parser, Debug)]
#[command(name = "train_gestures", about = "Train a hand-gesture classifier head on frozen image features")]
struct Args {
    /// 設定ファイル（省略時は gesture_trainer.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// サンプル画像から分類ヘッドを学習
    Train {
        /// クラス名ごとのサブディレクトリを持つサンプルディレクトリ
        #[arg(long)]
        data_dir: PathBuf,

        /// 学習済みモデルの保存先（.tar.gz）
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        learning_rate: Option<f64>,

        /// バッチサイズ（サンプル数に対する割合）
        #[arg(long)]
        batch_size_fraction: Option<f64>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        dense_units: Option<usize>,
    },
    /// 保存済みモデルで画像を分類
    Predict {
        #[arg(long)]
        model: PathBuf,

        #[arg(long)]
        image: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load_or_default_from(path),
        None => AppConfig::load_or_default(),
    };

    match args.command {
        Command::Train {
            data_dir,
            output,
            learning_rate,
            batch_size_fraction,
            epochs,
            dense_units,
        } => {
            if let Some(value) = learning_rate {
                config.hyperparameters.learning_rate = value;
            }
            if let Some(value) = batch_size_fraction {
                config.hyperparameters.batch_size_fraction = value;
            }
            if let Some(value) = epochs {
                config.hyperparameters.epochs = value;
            }
            if let Some(value) = dense_units {
                config.hyperparameters.dense_units = value;
            }
            config.validate()?;

            run_train(&mut config, &data_dir, output.as_deref()).await?;

            config.update_last_data_dir(&data_dir);
            match &args.config {
                Some(path) => config.save(path)?,
                None => config.save_default()?,
            }
        }
        Command::Predict { model, image } => run_predict(&model, &image)?,
    }

    Ok(())
}

async fn run_train(config: &mut AppConfig, data_dir: &Path, output: Option<&Path>) -> Result<()> {
    let device = Default::default();

    let mut extractor = ConvExtractorConfig::new()
        .with_image_size(config.extractor.image_size)
        .init::<TrainBackend>(&device)?;
    if let Some(weights) = &config.extractor.weights_path {
        extractor = extractor.load_weights(std::fs::read(weights)?, &device)?;
    }

    let mut examples = ExampleSet::new();
    let counts = collect_from_directory(data_dir, &config.class_names, &extractor, &mut examples, &device)?;
    for (name, count) in config.class_names.iter().zip(&counts) {
        println!("{:>6}: {} examples", name, count);
    }

    let predicting = Arc::new(AtomicBool::new(false));
    let controller = TrainingController::<TrainBackend>::new(device, predicting.clone()).with_seed(config.seed);

    let (tx, mut rx) = mpsc::unbounded_channel::<TrainingEvent>();
    let printer = tokio::spawn(async move {
        let mut summary = (0, None);
        while let Some(event) = rx.recv().await {
            if let Some(status) = event.status_text() {
                println!("{}", status);
            }
            if let TrainingEvent::Completed { steps, final_loss } = &event {
                summary = (*steps, *final_loss);
            }
            if event.is_terminal() {
                break;
            }
        }
        summary
    });

    let outcome = controller
        .train(Some(&extractor), &examples, &config.hyperparameters, &tx)
        .await;
    drop(tx);
    let (steps, final_loss) = printer.await?;

    let model = match outcome? {
        TrainOutcome::Trained(model) => model,
        TrainOutcome::Skipped => return Ok(()),
    };
    predicting.store(true, Ordering::SeqCst);
    println!("Training complete. Ready to predict.");

    if let Some(output) = output {
        let metadata = ModelMetadata::new(
            config.class_names.clone(),
            extractor.input_size(),
            extractor.output_shape(),
            config.hyperparameters,
            examples.len(),
            steps,
            final_loss,
        );
        let written = save_model_with_metadata(output, &metadata, &head_to_bytes(&model)?, &extractor.to_bytes()?)?;
        println!("Model saved to {}", written.display());
        config.update_last_model_path(&written);
    }

    Ok(())
}

fn run_predict(model_path: &Path, image_path: &Path) -> Result<()> {
    let device = Default::default();
    let bundle = load_model_bundle::<InnerBackend>(model_path, &device)?;
    log_metadata_info(&bundle.metadata);

    let predictor = GesturePredictor::new(bundle.extractor, bundle.head, bundle.metadata.class_names);
    let size = predictor.input_size();
    let frame = frame_tensor::<InnerBackend>(load_frame(image_path, size)?, size, &device);

    for prediction in predictor.classify(frame)? {
        println!("{}", serde_json::to_string(&prediction)?);
    }
    Ok(())
}
