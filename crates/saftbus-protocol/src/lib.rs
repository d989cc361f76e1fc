//! # Saftbus Protocol
//!
//! saftbus 总线的线协议定义（无 socket 依赖）
//!
//! ## 模块
//!
//! - `value`: 通用参数容器 [`Value`]（方法参数、返回值、信号参数）
//! - `message`: 两个方向的消息类型标签
//! - `frame`: 帧编解码（1 字节标签 + 4 字节长度 + 负载）
//! - `payload`: 各消息的负载记录
//! - `error`: 错误分类（[`BusError`]）与协议错误（[`ProtocolError`]）
//!
//! ## 字节序
//!
//! 帧头中的长度字段使用小端字节序，负载使用 bincode 编码。
//!
//! ```text
//! +------+----------------+---------------------------+
//! | tag  | length (u32 LE)| payload (length bytes)    |
//! +------+----------------+---------------------------+
//! ```

pub mod error;
pub mod frame;
pub mod message;
pub mod payload;
pub mod value;

pub use error::{BusError, ErrorKind, ProtocolError};
pub use frame::{Frame, FRAME_HEADER_LEN, MAX_PAYLOAD_LEN, encode_frame, read_frame, write_frame};
pub use message::{ClientMessage, ServerMessage};
pub use payload::*;
pub use value::Value;

/// 属性访问使用的固定接口名
///
/// 属性读写复用方法调用路径：外层接口名固定为此值，
/// 内层参数为 `(真实接口名, 属性名[, 新值])`。
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// 属性读取方法名
pub const PROPERTIES_GET: &str = "Get";

/// 属性写入方法名
pub const PROPERTIES_SET: &str = "Set";

/// 属性变化信号名
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// 守护进程本地发出信号时使用的发送者名
pub const DAEMON_SENDER: &str = "saftbus";

/// 会话结束时发给本地订阅者的合成信号名
pub const SESSION_ENDED: &str = "SessionEnded";

/// 默认 socket 基础路径（实际文件为 `<base>00` .. `<base>NN`）
pub const DEFAULT_SOCKET_BASE: &str = "/var/run/saftbus/saftbus";

/// 默认 socket 池大小
pub const DEFAULT_POOL_SIZE: usize = 32;

/// 协议版本（`SAFTBUS_CTL_HELLO` 的回复内容）
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 生成某个池槽位的 socket 路径
///
/// ```rust
/// use saftbus_protocol::slot_path;
///
/// let path = slot_path("/tmp/saftbus", 3);
/// assert_eq!(path.to_str(), Some("/tmp/saftbus03"));
/// ```
pub fn slot_path(base: impl AsRef<std::path::Path>, index: usize) -> std::path::PathBuf {
    let mut name = base.as_ref().as_os_str().to_os_string();
    name.push(format!("{:02}", index));
    std::path::PathBuf::from(name)
}
