//! 服务端启动错误
//!
//! 只有启动阶段（创建目录、绑定、监听）的失败会以错误形式返回；
//! 运行期间单个客户端的 IO 失败一律按断开处理，不会传播到事件循环。

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// 槽位 socket 绑定/监听失败
    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 配置无效（例如池大小为 0）
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
