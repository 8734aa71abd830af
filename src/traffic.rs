//! # 在途流量
//!
//! 记录在途请求数，供优雅关闭等待排空；启用监控时定期输出统计日志。

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// 在途流量统计
#[derive(Debug, Default)]
pub struct TrafficMonitor {
    in_flight: AtomicU64,
    total: AtomicU64,
    drained: Notify,
}

/// 请求结束时自动减少在途计数
#[derive(Debug)]
pub struct InFlightGuard {
    monitor: Arc<TrafficMonitor>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.monitor.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.monitor.drained.notify_waiters();
        }
    }
}

impl TrafficMonitor {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            monitor: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// 等待在途请求归零，超时返回 `false`
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// 输出一条统计日志
    pub fn report(&self) {
        linfo!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Traffic,
            "traffic_report",
            "流量统计",
            in_flight = self.in_flight(),
            total = self.total()
        );
    }
}

/// 在途计数中间件；流式响应在响应体结束前仍计为在途
pub async fn track_in_flight(State(monitor): State<Arc<TrafficMonitor>>, request: Request, next: Next) -> Response {
    let guard = monitor.enter();
    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    let stream = body.into_data_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drains_when_guards_drop() {
        let monitor = TrafficMonitor::new();
        let first = monitor.enter();
        let second = monitor.enter();
        assert_eq!(monitor.in_flight(), 2);
        assert!(!monitor.wait_drained(Duration::from_millis(20)).await);

        drop(first);
        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.wait_drained(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(second);
        assert!(waiter.await.unwrap());
        assert_eq!(monitor.total(), 2);
    }
}
