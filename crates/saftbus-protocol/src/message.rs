//! 消息类型标签
//!
//! 两个方向各自一套互不重叠的标签：客户端 → 守护进程使用 `0x01..0x7F`，
//! 守护进程 → 客户端使用 `0x81..0xFF`。

use crate::error::ProtocolError;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 客户端 → 守护进程
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ClientMessage {
    SenderId = 0x01,       // 握手：客户端自选的会话 ID
    MethodCall = 0x02,     // 方法调用
    PropertyGet = 0x03,    // 属性读取（负载同 MethodCall）
    PropertySet = 0x04,    // 属性写入（负载同 MethodCall）
    SignalFd = 0x05,       // 传递专用信号管道描述符
    SignalRemoveFd = 0x06, // 移除专用信号管道
    SignalFlightTime = 0x07, // 上报信号飞行时间（统计用）
    GetSaftbusIndex = 0x08,  // 查询注册 ID

    // 总线控制子协议
    CtlHello = 0x10,
    CtlStatus = 0x11,
    CtlGetState = 0x12,
    CtlEnableStats = 0x13,
    CtlDisableStats = 0x14,
    CtlEnableLogging = 0x15,
    CtlDisableLogging = 0x16,
}

/// 守护进程 → 客户端
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ServerMessage {
    ClientRegistered = 0x81, // 握手确认
    MethodReply = 0x82,      // 方法返回值
    MethodError = 0x83,      // 方法错误
    Signal = 0x84,           // 信号
    PropertyChanged = 0x85,  // 属性变化通知
    PropertyValue = 0x86,    // PropertyGet 的回复
}

impl ClientMessage {
    /// 从标签字节解析
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        Self::try_from(tag).map_err(|_| ProtocolError::UnknownTag(tag))
    }

    /// 是否属于总线控制子协议
    pub fn is_control(self) -> bool {
        matches!(
            self,
            ClientMessage::CtlHello
                | ClientMessage::CtlStatus
                | ClientMessage::CtlGetState
                | ClientMessage::CtlEnableStats
                | ClientMessage::CtlDisableStats
                | ClientMessage::CtlEnableLogging
                | ClientMessage::CtlDisableLogging
        )
    }

    /// 服务端是否会回复此请求
    ///
    /// `SignalFd`、`SignalRemoveFd`、`SignalFlightTime` 为单向消息。
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            ClientMessage::SignalFd | ClientMessage::SignalRemoveFd | ClientMessage::SignalFlightTime
        )
    }
}

impl ServerMessage {
    /// 从标签字节解析
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        Self::try_from(tag).map_err(|_| ProtocolError::UnknownTag(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directions_are_disjoint() {
        for tag in 0u8..=255 {
            let client = ClientMessage::try_from(tag).is_ok();
            let server = ServerMessage::try_from(tag).is_ok();
            assert!(!(client && server), "tag 0x{tag:02X} used in both directions");
        }
    }

    #[test]
    fn test_tag_values() {
        assert_eq!(u8::from(ClientMessage::SenderId), 0x01);
        assert_eq!(u8::from(ClientMessage::CtlDisableLogging), 0x16);
        assert_eq!(u8::from(ServerMessage::MethodReply), 0x82);
        assert_eq!(
            ServerMessage::from_tag(0x86).unwrap(),
            ServerMessage::PropertyValue
        );
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            ClientMessage::from_tag(0x7E),
            Err(ProtocolError::UnknownTag(0x7E))
        ));
        assert!(matches!(
            ServerMessage::from_tag(0x01),
            Err(ProtocolError::UnknownTag(0x01))
        ));
    }

    #[test]
    fn test_one_way_messages() {
        assert!(!ClientMessage::SignalFd.expects_reply());
        assert!(!ClientMessage::SignalFlightTime.expects_reply());
        assert!(ClientMessage::MethodCall.expects_reply());
        assert!(ClientMessage::CtlStatus.is_control());
        assert!(!ClientMessage::PropertyGet.is_control());
    }
}
