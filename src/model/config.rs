//! アプリケーション設定管理モジュール
//!
//! ハイパーパラメータや特徴抽出器の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrainError;
use crate::ml::{CLASS_NAMES, NUM_CLASSES};

/// 学習ハイパーパラメータ
///
/// 学習トリガーごとに1回だけコピーされ、学習中に変更されても反映されません。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// Adamの学習率
    pub learning_rate: f64,
    /// 収集済みサンプル数に対するバッチサイズの割合 (0, 1]
    pub batch_size_fraction: f64,
    /// エポック数
    pub epochs: usize,
    /// 隠れ層のユニット数
    pub dense_units: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            batch_size_fraction: 0.4,
            epochs: 20,
            dense_units: 100,
        }
    }
}

impl Hyperparameters {
    /// 値の範囲をチェック
    pub fn validate(&self) -> Result<(), TrainError> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainError::InvalidHyperparameter {
                name: "learning_rate",
                value: self.learning_rate.to_string(),
            });
        }
        // NaNと0以下はバッチサイズ導出側でZeroBatchSizeとして扱う
        if self.batch_size_fraction > 1.0 {
            return Err(TrainError::InvalidHyperparameter {
                name: "batch_size_fraction",
                value: self.batch_size_fraction.to_string(),
            });
        }
        if self.epochs == 0 {
            return Err(TrainError::InvalidHyperparameter {
                name: "epochs",
                value: self.epochs.to_string(),
            });
        }
        if self.dense_units == 0 {
            return Err(TrainError::InvalidHyperparameter {
                name: "dense_units",
                value: self.dense_units.to_string(),
            });
        }
        Ok(())
    }
}

/// 特徴抽出器の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorSettings {
    /// 入力フレームサイズ（正方形、ピクセル）
    pub image_size: usize,
    /// 学習済み重みファイル（Burnバイナリレコード）
    #[serde(default)]
    pub weights_path: Option<String>,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            image_size: 48,
            weights_path: None,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 学習ハイパーパラメータ
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    /// ジェスチャークラス名（出力層のユニット順）
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,
    /// 特徴抽出器設定
    #[serde(default)]
    pub extractor: ExtractorSettings,
    /// シャッフル用シード（未指定ならエントロピーから生成）
    #[serde(default)]
    pub seed: Option<u64>,
    /// 最後に使用したサンプルディレクトリ
    #[serde(default)]
    pub last_data_dir: Option<String>,
    /// 最後に保存したモデルのパス
    #[serde(default)]
    pub last_model_path: Option<String>,
}

fn default_class_names() -> Vec<String> {
    CLASS_NAMES.iter().map(|name| name.to_string()).collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hyperparameters: Hyperparameters::default(),
            class_names: default_class_names(),
            extractor: ExtractorSettings::default(),
            seed: None,
            last_data_dir: None,
            last_model_path: None,
        }
    }
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("gesture_trainer.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "設定ファイルを読み込みました");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "設定ファイルの読み込みに失敗しました。デフォルト設定を使用します"
                );
                Self::default()
            }
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// デフォルトパスに設定を保存する
    pub fn save_default(&self) -> anyhow::Result<()> {
        let path = Self::default_path();
        self.save(&path)?;
        tracing::info!(path = %path.display(), "設定ファイルを保存しました");
        Ok(())
    }

    /// 設定全体の整合性チェック
    pub fn validate(&self) -> anyhow::Result<()> {
        self.hyperparameters.validate()?;
        if self.class_names.len() != NUM_CLASSES {
            anyhow::bail!(
                "class_names must list exactly {} gestures, found {}",
                NUM_CLASSES,
                self.class_names.len()
            );
        }
        Ok(())
    }

    /// 最後に使用したサンプルディレクトリを更新
    pub fn update_last_data_dir<P: AsRef<Path>>(&mut self, path: P) {
        self.last_data_dir = Some(path.as_ref().to_string_lossy().to_string());
    }

    /// 最後に保存したモデルのパスを更新
    pub fn update_last_model_path<P: AsRef<Path>>(&mut self, path: P) {
        self.last_model_path = Some(path.as_ref().to_string_lossy().to_string());
    }
}
