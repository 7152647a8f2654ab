//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标服务句柄
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health`。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notification_deliveries_total",
        "Delivery attempts by channel and outcome"
    );
    metrics::describe_histogram!(
        "notification_delivery_duration_seconds",
        "Provider send duration in seconds"
    );
    metrics::describe_counter!(
        "notification_jobs_skipped_total",
        "Jobs acknowledged without sending"
    );
    metrics::describe_counter!(
        "notification_job_retries_total",
        "Jobs rescheduled with backoff"
    );
    metrics::describe_counter!(
        "notification_jobs_exhausted_total",
        "Jobs that reached the terminal failed state"
    );
    metrics::describe_counter!(
        "notification_bridge_events_total",
        "Events consumed by the bridge by result"
    );
    metrics::describe_counter!(
        "notification_ingested_total",
        "Notifications accepted by the ingestion gateway"
    );
    metrics::describe_gauge!(
        "notification_worker_in_flight",
        "Jobs currently being processed per channel"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "指标服务已启动");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "指标服务异常退出");
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次投递尝试
///
/// outcome 取值：sent / retry / failed
#[inline]
pub fn record_delivery(channel: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "notification_deliveries_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "notification_delivery_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(duration_secs);
}

/// 记录被跳过的任务（通道不匹配、已终态等）
#[inline]
pub fn record_job_skipped(channel: &str, reason: &str) {
    metrics::counter!(
        "notification_jobs_skipped_total",
        "channel" => channel.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_retry(channel: &str, attempt: u32) {
    metrics::counter!(
        "notification_job_retries_total",
        "channel" => channel.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_exhausted(channel: &str) {
    metrics::counter!(
        "notification_jobs_exhausted_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// 记录桥接消费结果
///
/// result 取值：enqueued / duplicate / terminal / dropped / error
#[inline]
pub fn record_bridge_event(result: &str) {
    metrics::counter!(
        "notification_bridge_events_total",
        "result" => result.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_ingested(channel: &str) {
    metrics::counter!(
        "notification_ingested_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

#[inline]
pub fn set_in_flight(channel: &str, count: f64) {
    metrics::gauge!(
        "notification_worker_in_flight",
        "channel" => channel.to_string()
    )
    .set(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_delivery("email", "sent", 0.1);
        record_job_skipped("sms", "channel_mismatch");
        record_job_retry("whatsapp", 2);
        record_job_exhausted("email");
        record_bridge_event("enqueued");
        record_ingested("sms");
        set_in_flight("email", 3.0);
    }
}
