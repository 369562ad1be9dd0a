//! 分類ヘッドの定義
//!
//! 凍結済み特徴抽出器の出力の上に載せる、学習対象の小さな全結合ネットワークです。

use burn::{
    config::Config,
    module::Module,
    nn::{Initializer, Linear, LinearConfig, Relu},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
};

/// クラス数（出力層のユニット数）
pub const NUM_CLASSES: usize = 4;

/// クラス名の定義
pub const CLASS_NAMES: [&str; NUM_CLASSES] = ["up", "down", "left", "right"];

/// 分散スケーリング初期化（fan_in、正規分布、scale=1.0）
fn variance_scaling() -> Initializer {
    Initializer::KaimingNormal {
        gain: 1.0,
        fan_out_only: false,
    }
}

/// 分類ヘッド設定
#[derive(Config, Debug)]
pub struct ClassifierHeadConfig {
    /// 特徴抽出器の1サンプルあたりの出力形状 [channels, height, width]
    pub input_shape: [usize; 3],
    /// 隠れ層のユニット数
    pub dense_units: usize,
    /// 出力クラス数
    #[config(default = 4)]
    pub num_classes: usize,
}

impl ClassifierHeadConfig {
    /// 平坦化後の特徴次元
    pub fn input_features(&self) -> usize {
        self.input_shape.iter().product()
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        let d = self.input_features();

        tracing::debug!(
            input_shape = ?self.input_shape,
            features = d,
            hidden = self.dense_units,
            classes = self.num_classes,
            "分類ヘッドを初期化します"
        );

        ClassifierHead {
            hidden: LinearConfig::new(d, self.dense_units)
                .with_bias(true)
                .with_initializer(variance_scaling())
                .init(device),
            output: LinearConfig::new(self.dense_units, self.num_classes)
                .with_bias(false)
                .with_initializer(variance_scaling())
                .init(device),
            activation: Relu::new(),
        }
    }
}

/// 分類ヘッド
///
/// # アーキテクチャ
/// - Flatten: [batch, c, h, w] -> [batch, c*h*w]（学習パラメータなし）
/// - FC: d -> dense_units + ReLU（バイアスあり）
/// - FC: dense_units -> num_classes（バイアスなし）
/// - Softmax（予測時）
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    hidden: Linear<B>,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `features`: 特徴抽出器の出力 [batch_size, c, h, w]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x: Tensor<B, 2> = features.flatten(1, 3);
        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);
        self.output.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn forward_probs(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(features), 1)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], 確率 [batch_size, num_classes])
    pub fn predict(&self, features: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let probs = self.forward_probs(features);
        (probs.clone().argmax(1), probs)
    }

    /// 平坦化後の入力次元
    pub fn input_features(&self) -> usize {
        self.hidden.weight.val().dims()[0]
    }

    /// 隠れ層のユニット数
    pub fn hidden_units(&self) -> usize {
        self.hidden.weight.val().dims()[1]
    }

    /// 出力層のユニット数
    pub fn output_units(&self) -> usize {
        self.output.weight.val().dims()[1]
    }
}
