use serde::Serialize;

use crate::ml::BatchEnd;

/// 学習コントローラーの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainerState {
    Idle,     // 待機中
    Training, // 学習中（再トリガーは拒否）
    Failed,   // 直前の学習が失敗（再トリガー可）
}

impl std::fmt::Display for TrainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainerState::Idle => write!(f, "idle"),
            TrainerState::Training => write!(f, "training"),
            TrainerState::Failed => write!(f, "failed"),
        }
    }
}

/// 学習中にUI側へ流すイベント
///
/// 1回の学習で `Started` → `ModelBuilt` → `Batch`* → `Completed` の順に届く。
/// 失敗時は最後のイベントが必ず `Failed` になる。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingEvent {
    Started {
        examples: usize,
        epochs: usize,
    },
    /// 特徴抽出器が未準備のため何もしなかった
    Skipped,
    ModelBuilt {
        input_features: usize,
        hidden_units: usize,
        output_units: usize,
    },
    Batch(BatchEnd),
    Completed {
        steps: usize,
        final_loss: Option<f64>,
    },
    Failed {
        message: String,
    },
}

/// 学習ボタンのアイドル時ラベル
pub const IDLE_STATUS: &str = "Train Model";

impl TrainingEvent {
    /// ステータス表示文字列。`None` ならステータスは変更しない。
    ///
    /// 完了時の「予測可能」表示は呼び出し側が決める。
    pub fn status_text(&self) -> Option<String> {
        match self {
            TrainingEvent::Started { .. } => Some("Training...".to_string()),
            TrainingEvent::Skipped => Some(IDLE_STATUS.to_string()),
            TrainingEvent::Batch(batch) => Some(format!("Loss: {:.5}", batch.loss)),
            TrainingEvent::Failed { message } => Some(message.clone()),
            TrainingEvent::ModelBuilt { .. } | TrainingEvent::Completed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrainingEvent::Skipped | TrainingEvent::Completed { .. } | TrainingEvent::Failed { .. }
        )
    }
}
