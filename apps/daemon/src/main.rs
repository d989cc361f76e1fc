//! saftbus 守护进程入口
//!
//! 获取单例锁，绑定 socket 池，然后在事件循环中服务客户端直到收到 Ctrl+C / SIGTERM。

mod daemon;
mod singleton;

use anyhow::{Context, Result};
use clap::Parser;
use daemon::Daemon;
use saftbus::BusConfig;
use singleton::SingletonLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// saftbus 守护进程
///
/// 持有对象注册表，通过固定大小的 Unix socket 池向本机客户端提供方法调用与信号
#[derive(Parser, Debug)]
#[command(name = "saftbusd")]
#[command(about = "saftbus daemon - local IPC bus over a Unix socket pool", long_about = None)]
#[command(version)]
struct Args {
    /// socket 基础路径（槽位文件为 <base>00 .. <base>NN）
    ///
    /// 默认: $SAFTBUS_SOCKET_PATH 或 /var/run/saftbus/saftbus
    #[arg(long)]
    socket_base: Option<PathBuf>,

    /// socket 池大小（同时连接的客户端上限）
    ///
    /// 默认: $SAFTBUS_POOL_SIZE 或 32
    #[arg(long)]
    pool_size: Option<usize>,

    /// 锁文件路径
    ///
    /// 默认: <socket-base>.lock
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// 写客户端的超时（毫秒），超时的客户端按断开处理
    #[arg(long, default_value = "1000")]
    write_timeout_ms: u64,
}

impl Args {
    fn bus_config(&self) -> BusConfig {
        let mut config = BusConfig::from_env().write_timeout(Duration::from_millis(self.write_timeout_ms));
        if let Some(base) = &self.socket_base {
            config.socket_base = base.clone();
        }
        if let Some(size) = self.pool_size {
            config.pool_size = size;
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("saftbus=info".parse()?)
                .add_directive("saftbusd=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.bus_config();
    let lock_file = args
        .lock_file
        .clone()
        .unwrap_or_else(|| singleton::default_lock_file(&config.socket_base));

    // 1. 单例锁必须先于绑定：绑定会删除已存在的 socket 文件
    let lock = SingletonLock::try_lock(&lock_file)
        .with_context(|| format!("another saftbusd may be running (lock file {})", lock_file.display()))?;

    // 2. Ctrl+C / SIGTERM 只置位标志，由事件循环检查后退出
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Release))
            .context("failed to install signal handler")?;
    }

    info!(
        "socket base {}, {} slots, lock file {}",
        config.socket_base.display(),
        config.pool_size,
        lock.path().display()
    );

    // 3. 绑定并运行
    let daemon = Daemon::new(config, shutdown).context("failed to start saftbusd")?;
    daemon.run();

    // 先释放 socket（删除槽位文件），再释放锁
    drop(daemon);
    drop(lock);
    Ok(())
}
