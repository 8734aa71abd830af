//! # Relay Gateway 主程序

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use relay_gateway::{
    Result,
    app::{AppResources, AppServices, AppTasks},
    config::{OptionWatcher, default_config_path, load_config},
    lerror, linfo, lwarn,
    logging::{self, LogComponent, LogStage},
    server::{self, ServerState},
    shutdown::ShutdownCoordinator,
};

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "relay-gateway", version, about = "多租户 LLM API 网关")]
struct Cli {
    /// 配置文件路径，默认 `config/config.{RUST_ENV}.toml`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别，覆盖配置文件中的 `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    /// 只校验配置后退出
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    logging::init_logging(Some(&level));
    logging::set_sample_ratio(config.logging.sample_ratio);

    if cli.check {
        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Main,
            "config_check",
            "配置检查通过"
        );
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    if let Err(e) = run(Arc::new(config), config_path).await {
        lerror!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "service_failed",
            "服务异常退出",
            error = %e
        );
        return Err(e);
    }

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_shutdown",
        "服务正常关闭"
    );
    Ok(())
}

async fn run(config: Arc<relay_gateway::AppConfig>, config_path: PathBuf) -> Result<()> {
    let resources = AppResources::build(Arc::clone(&config)).await?;

    // 持有监控器直到退出
    let _watcher = if config_path.exists() {
        Some(OptionWatcher::new(&config_path, resources.options())?)
    } else {
        None
    };

    let services = AppServices::initialize(&resources).await?;
    let tasks = AppTasks::initialize(&services).await?;
    let scheduler = tasks.scheduler();
    scheduler.start_all().await?;

    let router = server::create_router(ServerState::new(Arc::clone(&services)));
    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;

    let shutdown = ShutdownCoordinator::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.wait_for_signal().await });
    }

    let mut server_task = tokio::spawn(server::serve(listener, router, shutdown.clone()));
    let server_result = tokio::select! {
        joined = &mut server_task => Some(joined),
        () = shutdown.wait() => None,
    };

    if let Some(joined) = server_result {
        // 服务提前退出，仍然停止后台任务
        let _ = scheduler.shutdown().await;
        return match joined {
            Ok(result) => result,
            Err(e) => Err(relay_gateway::RelayError::internal_with_source("HTTP 服务任务异常", e)),
        };
    }

    let graceful = Duration::from_secs(config.traffic.graceful_timeout_secs);
    let traffic = services.traffic();
    if traffic.wait_drained(graceful).await {
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "traffic_drained",
            "在途请求已排空"
        );
    } else {
        lwarn!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "drain_timeout",
            "等待在途请求超时，强制关闭",
            in_flight = traffic.in_flight()
        );
    }
    server_task.abort();

    scheduler.shutdown().await?;
    resources.cache().backend.close().await?;
    Ok(())
}
