//! # 优雅关闭
//!
//! 收到 SIGINT/SIGTERM 后停止接收新连接，等待在途请求排空（有超时），
//! 随后逆序停止后台任务并关闭缓存后端。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::watch;

use crate::logging::{LogComponent, LogStage};
use crate::{lerror, linfo};

/// 关闭协调器
#[derive(Clone)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// 发起关闭，只有第一次调用生效
    pub fn initiate_shutdown(&self) {
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            linfo!(
                "system",
                LogStage::Shutdown,
                LogComponent::Main,
                "shutdown_initiated",
                "开始优雅关闭"
            );
            let _ = self.tx.send(true);
        }
    }

    /// 等待关闭通知，可直接用作 axum 的 graceful shutdown future
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 等待 SIGINT 或 SIGTERM 后发起关闭
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Main,
                    "signal_handler_failed",
                    "无法监听 Ctrl+C",
                    error = %e
                );
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    lerror!(
                        "system",
                        LogStage::Shutdown,
                        LogComponent::Main,
                        "signal_handler_failed",
                        "无法监听 SIGTERM",
                        error = %e
                    );
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
            () = self.wait() => return,
        }
        self.initiate_shutdown();
    }
}
