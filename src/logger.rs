// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 日志初始化 (env_logger); `RUST_LOG` 优先于传入的默认级别
use log::LevelFilter;

/// 解析 "trace" / "debug" / "info" / "warn" / "error" / "off", 其余按 info 处理
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// 可重复调用; 已初始化时静默返回
pub fn init(default_level: LevelFilter) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level.as_str()),
    );
    builder.format_timestamp_millis();
    if builder.try_init().is_err() {
        log::debug!("logger already initialized");
    }
}
