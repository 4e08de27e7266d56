//! # Logging Setup / 日志初始化
//!
//! Installs a compact `tracing-subscriber` formatter filtered by `RUST_LOG`,
//! falling back to a caller-supplied directive.
//!
//! 安装一个紧凑格式的 `tracing-subscriber`，按 `RUST_LOG` 过滤，
//! 未设置时使用调用方提供的默认指令。

use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `default_directive`.
pub const LOG_ENV: &str = "RUST_LOG";

/// Installs the global subscriber.
///
/// Returns `true` if this call installed it and `false` if a subscriber was
/// already in place, so calling it from every test is harmless.
///
/// 安装全局订阅者。若已存在订阅者则返回 `false`，因此可在每个测试中调用。
///
/// # Arguments / 参数
/// * `default_directive` - Filter used when `RUST_LOG` is unset or invalid,
///                         e.g. `"test_conductor=debug"`
///                         `RUST_LOG` 未设置或无效时使用的过滤指令
pub fn init_logging(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(default_directive))
        .with_target(false)
        .with_test_writer()
        .compact()
        .try_init()
        .is_ok()
}

fn build_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive))
}
