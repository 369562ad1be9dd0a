//! 凍結済み特徴抽出器
//!
//! 学習ワークフローから見ると特徴抽出器は不透明な関数です。
//! [`FeatureExtractor`] トレイトで形状と変換だけを公開します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Relu,
    },
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};

/// フレーム [batch, 3, size, size] から特徴 [batch, c, h, w] への凍結済み変換
pub trait FeatureExtractor<B: Backend> {
    /// 1サンプルあたりの出力形状 [channels, height, width]
    fn output_shape(&self) -> [usize; 3];

    /// 入力フレームサイズ（正方形）
    fn input_size(&self) -> usize;

    /// 特徴を抽出（勾配は追跡しない）
    fn extract(&self, frames: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// 畳み込み特徴抽出器の設定
#[derive(Config, Debug)]
pub struct ConvExtractorConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 48)]
    pub image_size: usize,
}

impl ConvExtractorConfig {
    /// 最終特徴マップの一辺
    ///
    /// Conv(3x3, padding無し)で2減少、Pool(2x2)で半分（切り捨て）
    pub fn feature_map_size(&self) -> usize {
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        let after_pool2 = after_conv2 / 2;
        after_pool2.saturating_sub(2)
    }

    /// 特徴抽出器を初期化（パラメータは凍結される）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvFeatureExtractor<B>> {
        let feature_map_size = self.feature_map_size();
        if feature_map_size == 0 {
            anyhow::bail!(
                "入力サイズが小さすぎます: {}x{} (最小18x18が必要)",
                self.image_size,
                self.image_size
            );
        }

        tracing::debug!(
            image_size = self.image_size,
            feature_map = feature_map_size,
            "特徴抽出器を初期化します"
        );

        let extractor = ConvFeatureExtractor {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).init(),
            conv3: Conv2dConfig::new([64, 128], [3, 3]).init(device),
            activation: Relu::new(),
            image_size: self.image_size,
        };

        Ok(extractor.no_grad())
    }
}

/// 畳み込み特徴抽出器
///
/// - {Conv 3x3 + ReLU + MaxPool 2x2} x 2層
/// - Conv 3x3 + ReLU
/// - 出力: 128 x s x s（s = [`ConvExtractorConfig::feature_map_size`]）
#[derive(Module, Debug)]
pub struct ConvFeatureExtractor<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    activation: Relu,
    image_size: usize,
}

impl<B: Backend> ConvFeatureExtractor<B> {
    /// Burnバイナリレコードから重みを復元
    pub fn load_weights(self, bytes: Vec<u8>, device: &B::Device) -> Result<Self> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(bytes, device)
            .map_err(|e| anyhow::anyhow!("特徴抽出器の重み読み込みエラー: {:?}", e))?;
        Ok(self.load_record(record).no_grad())
    }

    /// 重みをBurnバイナリレコードとして書き出す
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        recorder
            .record(self.clone().into_record(), ())
            .map_err(|e| anyhow::anyhow!("特徴抽出器の重み書き出しエラー: {:?}", e))
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        self.activation.forward(x)
    }
}

impl<B: Backend> FeatureExtractor<B> for ConvFeatureExtractor<B> {
    fn output_shape(&self) -> [usize; 3] {
        let s = ConvExtractorConfig::new()
            .with_image_size(self.image_size)
            .feature_map_size();
        [128, s, s]
    }

    fn input_size(&self) -> usize {
        self.image_size
    }

    fn extract(&self, frames: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(frames).detach()
    }
}
