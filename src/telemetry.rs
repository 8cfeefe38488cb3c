//! 日志与追踪系统
//! 初始化结构化日志，并登记审计与防火墙指标的描述

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
pub fn init_telemetry(config: &AppConfig) {
    // RUST_LOG 优先于配置中的日志级别
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // 根据配置选择日志格式
    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        "Telemetry initialized"
    );
}

/// 登记指标描述
/// metrics 0.24 的指标在首次使用时创建，这里只补充说明
pub fn init_metrics() {
    metrics::describe_counter!(
        "firewall_evaluations_total",
        "Firewall evaluations by firewall type and outcome"
    );
    metrics::describe_histogram!(
        "firewall_evaluation_seconds",
        "Latency of a single classifier invocation"
    );
    metrics::describe_counter!("audit_writes_total", "Audit records appended, by record kind");
    metrics::describe_counter!("http_requests_total", "HTTP requests by method and status");
    metrics::describe_gauge!("db_pool_size", "Audit database pool connections");
    metrics::describe_gauge!("db_pool_idle", "Idle audit database pool connections");
    tracing::debug!("Metrics initialized");
}
