use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info, warn};

use jobflow::plans_file::{check_plan_definitions, load_plan_definitions};
use jobflow::shutdown::wait_for_shutdown_signal;
use jobflow::{Application, ShutdownManager};
use jobflow_core::{init_logging, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jobflow")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式作业编排调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时查找 config/jobflow.toml 与 jobflow.toml"),
        )
        .arg(
            Arg::new("plans")
                .short('p')
                .long("plans")
                .value_name("FILE")
                .help("启动时加载的计划定义文件（JSON）"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("进程内worker数量"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("只校验计划文件，不启动"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if let Some(plans) = matches.get_one::<String>("plans") {
        config.embedded.plans_file = Some(plans.clone());
    }
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.embedded.worker_count = *workers;
    }
    config.validate()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    if matches.get_flag("check") {
        let path = config
            .embedded
            .plans_file
            .as_deref()
            .context("--check 需要通过 --plans 或配置指定计划文件")?;
        let definitions = load_plan_definitions(Path::new(path))?;
        let checked = check_plan_definitions(&definitions)?;
        info!("计划文件 {} 校验通过，共 {} 个计划", path, checked);
        return Ok(());
    }

    info!("启动 jobflow {}", env!("CARGO_PKG_VERSION"));
    let app = Application::new(config).await?;
    let shutdown = ShutdownManager::new();

    let run = {
        let shutdown = shutdown.clone();
        async move { app.run(&shutdown).await }
    };
    let mut app_handle = tokio::spawn(run);

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        result = &mut app_handle => {
            // 未收到信号就退出，说明启动失败
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("应用任务异常退出: {e}")),
            };
        }
    }
    info!("收到关闭信号，开始优雅关闭...");
    shutdown.shutdown();

    match tokio::time::timeout(Duration::from_secs(60), app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用运行失败: {e:#}"),
        Ok(Err(e)) => error!("应用任务异常退出: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    Ok(())
}
