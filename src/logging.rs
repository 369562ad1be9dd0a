//! ログ出力の初期化

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// tracingサブスクライバを初期化
///
/// ログレベルは `RUST_LOG` で上書きできる（既定は info）。
/// すでに初期化済みの場合は何もしない。
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
