//! 学習ワークフローのエラー定義

use thiserror::Error;

/// 学習トリガー1回分で起こり得る失敗
///
/// - 前提条件エラー: [`TrainError::NoExamples`]
/// - 設定エラー: [`TrainError::ZeroBatchSize`], [`TrainError::InvalidHyperparameter`]
/// - 実行時エラー: [`TrainError::ShapeMismatch`], [`TrainError::Runtime`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainError {
    #[error("Add some examples before training!")]
    NoExamples,

    #[error(
        "batch size is zero ({examples} examples x fraction {fraction}): \
         choose a larger fraction or collect more examples"
    )]
    ZeroBatchSize { examples: usize, fraction: f64 },

    #[error("invalid hyperparameter {name}: {value}")]
    InvalidHyperparameter { name: &'static str, value: String },

    #[error("feature shape mismatch: extractor produces {expected:?}, examples hold {actual:?}")]
    ShapeMismatch { expected: [usize; 3], actual: [usize; 3] },

    #[error("label {label} is out of range for {classes} classes")]
    InvalidLabel { label: usize, classes: usize },

    #[error("training is already in progress")]
    AlreadyTraining,

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainError {
    /// ユーザー操作（設定変更・サンプル追加）で解消できるエラーか
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            TrainError::NoExamples
                | TrainError::ZeroBatchSize { .. }
                | TrainError::InvalidHyperparameter { .. }
                | TrainError::InvalidLabel { .. }
        )
    }
}

/// panicペイロードから表示用メッセージを取り出す
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic in ML runtime".to_string()
    }
}
