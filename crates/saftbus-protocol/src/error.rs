//! 错误类型定义
//!
//! - [`BusError`]: 客户端可见的统一错误（类型 + 描述），本地失败与远端失败表现一致
//! - [`ProtocolError`]: 帧读写层的错误（断开、未知标签、编码失败等）

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// 错误分类
///
/// 在 `METHOD_ERROR` 帧中随错误描述一起传输，客户端按原分类重新抛出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 参数无效
    InvalidArgs,
    /// 未知方法
    UnknownMethod,
    /// 未知属性
    UnknownProperty,
    /// 未知对象（接口 + 路径未注册）
    UnknownObject,
    /// IO 失败（包括所有传输层失败）
    IoError,
    /// 访问被拒绝
    AccessDenied,
    /// 通用失败
    Failed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgs => "invalid arguments",
            ErrorKind::UnknownMethod => "unknown method",
            ErrorKind::UnknownProperty => "unknown property",
            ErrorKind::UnknownObject => "unknown object",
            ErrorKind::IoError => "I/O error",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 总线错误（分类 + 描述）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    pub fn unknown_method(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownMethod, message)
    }

    pub fn unknown_property(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownProperty, message)
    }

    pub fn unknown_object(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownObject, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<io::Error> for BusError {
    fn from(e: io::Error) -> Self {
        BusError::io(e.to_string())
    }
}

/// 传输层错误一律归为 IO 失败，调用方只需处理一种错误类型
impl From<ProtocolError> for BusError {
    fn from(e: ProtocolError) -> Self {
        BusError::io(e.to_string())
    }
}

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// 对端关闭连接（帧头或负载读取中遇到 EOF）
    #[error("Peer disconnected")]
    Disconnected,

    /// 未知消息类型标签
    #[error("Unknown message tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// 对端声明的负载长度超过上限
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// 负载编解码失败
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// 收到的消息类型与当前请求不匹配
    #[error("Unexpected message: {0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(#[source] io::Error),
}

impl ProtocolError {
    /// 是否为连接已断开（EOF / 对端重置）
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Disconnected => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// 是否为读写超时
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Disconnected
        } else {
            ProtocolError::Io(e)
        }
    }
}
