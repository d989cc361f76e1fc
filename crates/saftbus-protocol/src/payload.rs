//! 消息负载记录
//!
//! 每种带负载的消息对应一个 serde 记录，字段顺序即线上顺序。

use crate::error::{BusError, ErrorKind};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `SENDER_ID`：客户端自选的会话 ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderId {
    pub id: String,
}

/// `CLIENT_REGISTERED`：握手确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistered {
    /// 服务端确认的会话 ID
    pub id: String,
    /// 客户端占用的池槽位
    pub slot: u32,
}

/// `METHOD_CALL` / `PROPERTY_GET` / `PROPERTY_SET`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub object_path: String,
    /// 调用方会话 ID
    pub sender: String,
    pub interface: String,
    /// 方法名（属性访问时为 `Get` / `Set`）
    pub member: String,
    pub args: Value,
}

/// `METHOD_REPLY` / `PROPERTY_VALUE`：单元素元组包装的返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodReply {
    pub value: Value,
}

/// `METHOD_ERROR`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<BusError> for MethodError {
    fn from(e: BusError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
        }
    }
}

impl From<MethodError> for BusError {
    fn from(e: MethodError) -> Self {
        BusError::new(e.kind, e.message)
    }
}

/// `SIGNAL` / `PROPERTY_CHANGED`
///
/// 时间戳在发射时打上，接收方据此计算信号飞行时间。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub object_path: String,
    pub interface: String,
    pub member: String,
    pub sec: i64,
    pub nsec: u32,
    pub args: Value,
}

impl SignalMessage {
    /// 构造信号并打上当前时间戳
    pub fn new(
        object_path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Value,
    ) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            object_path: object_path.into(),
            interface: interface.into(),
            member: member.into(),
            sec: now.as_secs() as i64,
            nsec: now.subsec_nanos(),
            args,
        }
    }

    /// 发射时刻
    pub fn emitted_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.sec.max(0) as u64, self.nsec)
    }

    /// 从发射到现在的飞行时间（时钟回拨时为 0）
    pub fn flight_time(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.emitted_at())
            .unwrap_or_default()
    }
}

/// `SIGNAL_FD` / `SIGNAL_REMOVE_FD`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFdRequest {
    pub object_path: String,
    pub interface: String,
    /// 客户端分配的管道编号（同一接口 + 路径下唯一）
    pub id: u64,
}

/// `SIGNAL_FLIGHT_TIME`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightTime {
    pub micros: u64,
}

/// `GET_SAFTBUS_INDEX`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexQuery {
    pub object_path: String,
    pub interface: String,
}

/// 已注册对象条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub id: u32,
    pub interface: String,
    pub object_path: String,
}

/// 池槽位状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub index: u32,
    /// 是否有客户端占用
    pub active: bool,
    /// 握手后的会话 ID
    pub session: Option<String>,
    /// 该会话的专用信号管道数量
    pub proxy_pipes: u32,
}

/// `SAFTBUS_CTL_STATUS` 的回复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStatus {
    pub version: String,
    pub objects: Vec<ObjectEntry>,
    pub slots: Vec<SlotStatus>,
    pub subscriptions: u32,
    pub stats_enabled: bool,
    pub logging_enabled: bool,
}

impl BusStatus {
    /// 当前占用的槽位数
    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }
}

/// `SAFTBUS_CTL_GET_STATE` 的回复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusState {
    pub status: BusStatus,
    pub method_calls: u64,
    pub signals_emitted: u64,
    /// 信号飞行时间直方图：(桶上界微秒, 计数)，桶按 2 的幂划分
    pub flight_time_histogram: Vec<(u64, u64)>,
}
