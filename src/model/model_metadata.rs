//! モデルメタデータの定義
//!
//! 学習済みヘッドと一緒にtar.gzへ保存され、推論時のモデル復元に使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::Hyperparameters;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - head.bin: 分類ヘッドの重み
/// - extractor.bin: 特徴抽出器の重み
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（出力ユニット順）
    /// 例: ["up", "down", "left", "right"]
    pub class_names: Vec<String>,

    /// 特徴抽出器の入力サイズ（正方形）
    pub image_size: usize,

    /// 特徴抽出器の出力形状 [channels, height, width]
    pub feature_shape: [usize; 3],

    /// 学習時のハイパーパラメータ
    pub hyperparameters: Hyperparameters,

    /// 学習に使ったサンプル数
    pub example_count: usize,

    /// 学習の総ステップ数
    pub steps: usize,

    /// 最終バッチの損失
    #[serde(default)]
    pub final_loss: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        image_size: usize,
        feature_shape: [usize; 3],
        hyperparameters: Hyperparameters,
        example_count: usize,
        steps: usize,
        final_loss: Option<f64>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_names,
            image_size,
            feature_shape,
            hyperparameters,
            example_count,
            steps,
            final_loss,
            trained_at,
        }
    }

    /// 隠れ層のユニット数
    pub fn dense_units(&self) -> usize {
        self.hyperparameters.dense_units
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
