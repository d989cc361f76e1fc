//! 总线配置

use saftbus_protocol::{DEFAULT_POOL_SIZE, DEFAULT_SOCKET_BASE};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// socket 基础路径的环境变量
pub const ENV_SOCKET_PATH: &str = "SAFTBUS_SOCKET_PATH";

/// 池大小的环境变量
pub const ENV_POOL_SIZE: &str = "SAFTBUS_POOL_SIZE";

/// 默认的客户端信号队列上限
pub const DEFAULT_SIGNAL_QUEUE_LIMIT: usize = 1024;

/// 服务端与客户端共用的配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// socket 基础路径（槽位文件为 `<base>00` .. `<base>NN`）
    pub socket_base: PathBuf,
    /// socket 池大小
    pub pool_size: usize,
    /// 客户端 `call_sync` 的默认超时（`None` 表示一直等待）
    pub call_timeout: Option<Duration>,
    /// 客户端等待 `CLIENT_REGISTERED` 的超时
    pub handshake_timeout: Duration,
    /// 服务端写超时（超时视为客户端断开）
    pub write_timeout: Duration,
    /// 客户端在 `call_sync` 期间最多缓存的信号帧数（满时丢弃最旧的）
    pub signal_queue_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            socket_base: PathBuf::from(DEFAULT_SOCKET_BASE),
            pool_size: DEFAULT_POOL_SIZE,
            call_timeout: None,
            handshake_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            signal_queue_limit: DEFAULT_SIGNAL_QUEUE_LIMIT,
        }
    }
}

impl BusConfig {
    /// 默认配置，再用环境变量覆盖
    ///
    /// 无法解析的 `SAFTBUS_POOL_SIZE` 会被忽略（并打印警告）。
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var(ENV_SOCKET_PATH)
            && !base.is_empty()
        {
            config.socket_base = PathBuf::from(base);
        }
        if let Ok(size) = std::env::var(ENV_POOL_SIZE) {
            match size.parse::<usize>() {
                Ok(n) if n > 0 => config.pool_size = n,
                _ => warn!("ignoring invalid {}={:?}", ENV_POOL_SIZE, size),
            }
        }
        config
    }

    /// 以指定基础路径构造（其余取默认值）
    pub fn with_socket_base(base: impl Into<PathBuf>) -> Self {
        Self {
            socket_base: base.into(),
            ..Self::default()
        }
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn signal_queue_limit(mut self, limit: usize) -> Self {
        self.signal_queue_limit = limit.max(1);
        self
    }

    /// 第 `index` 个槽位的 socket 路径
    pub fn slot_path(&self, index: usize) -> PathBuf {
        saftbus_protocol::slot_path(&self.socket_base, index)
    }
}
