use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/** \brief 日志文件名，位于 logging.dir 下。 */
pub const LOG_FILE_NAME: &str = "easychat.log";

/**
 * \brief 初始化全局日志：RUST_LOG 优先，否则使用配置中的级别；可选写入日志文件。
 * \return 文件日志的刷新守卫，需在进程生命周期内持有。重复初始化时不做任何事。
 */
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.level);

    let (file_layer, guard) = if config.file {
        std::fs::create_dir_all(&config.dir)?;
        let appender = tracing_appender::rolling::never(&config.dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let initialised = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .is_ok();

    Ok(if initialised { guard } else { None })
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
