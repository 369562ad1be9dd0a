//! 手のジェスチャー（上下左右）を認識する分類ヘッドの学習ライブラリ
//!
//! 凍結済みの特徴抽出器が出力した特徴量とラベルから小さな分類ヘッドを学習し、
//! 進捗を [`TrainingEvent`] として通知します。

pub mod error;
pub mod logging;
pub mod ml;
pub mod model;
pub mod train_controller;
pub mod types;

pub use error::TrainError;
pub use train_controller::{effective_batch_size, TrainOutcome, TrainingController};
pub use types::{TrainerState, TrainingEvent, IDLE_STATUS};
