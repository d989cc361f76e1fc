//! 客户端连接
//!
//! 一个 [`ProxyConnection`] 占用服务端 socket 池中的一个槽位，
//! 提供同步的请求/应答原语。
//!
//! # 并发
//!
//! 协议严格一问一答、不支持流水线：整个往返过程都持有互斥锁，
//! 多个线程共享同一连接时会被串行化。需要并行调用的线程应各自创建连接
//! （它们会占用不同的槽位）。
//!
//! # 信号
//!
//! 服务端会随时把信号写到 socket 上。`call_sync` 等待应答期间收到的信号帧
//! 被放入队列，由 [`ProxyConnection::take_signals`] /
//! [`ProxyConnection::watch_signals`] 在事件循环中取出。
//!
//! # 失败
//!
//! 任何传输层失败（包括超时）都会把连接标记为损坏，之后的调用立即返回
//! `IoError`；超时与断开等价。

use crate::config::BusConfig;
use crate::fdpass;
use crate::mainloop::{MainContext, Source, SourceId, Watch};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use saftbus_protocol::{
    BusError, BusState, BusStatus, ClientMessage, ClientRegistered, FlightTime, Frame, IndexQuery,
    MethodCall, MethodError, MethodReply, PROPERTIES_GET, PROPERTIES_INTERFACE, PROPERTIES_SET,
    ProtocolError, SenderId, ServerMessage, SignalFdRequest, SignalMessage, Value, read_frame,
    write_frame,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 进程内会话计数（会话 ID 为 `:<pid>.<n>`）
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 进程共享连接
static SHARED: Mutex<Weak<ProxyConnection>> = Mutex::new(Weak::new());

fn next_session_id() -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!(":{}.{}", std::process::id(), n)
}

/// 从 socket 收到的信号帧
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// `Signal` 或 `PropertyChanged`
    pub kind: ServerMessage,
    pub signal: SignalMessage,
}

impl Incoming {
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let kind = frame.server_message()?;
        match kind {
            ServerMessage::Signal | ServerMessage::PropertyChanged => Ok(Self {
                kind,
                signal: frame.decode()?,
            }),
            other => Err(ProtocolError::Unexpected(format!(
                "{:?} where a signal was expected",
                other
            ))),
        }
    }

    pub fn is_properties_changed(&self) -> bool {
        self.kind == ServerMessage::PropertyChanged
    }
}

struct Channel {
    stream: UnixStream,
    pending: VecDeque<Frame>,
    pending_limit: usize,
    /// 因队列已满丢弃的信号帧总数
    dropped: u64,
}

impl Channel {
    fn new(stream: UnixStream, pending_limit: usize) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
            pending_limit: pending_limit.max(1),
            dropped: 0,
        }
    }

    /// 缓存一个信号帧；队列满时丢弃最旧的
    fn enqueue(&mut self, frame: Frame) {
        if self.pending.len() >= self.pending_limit {
            self.pending.pop_front();
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                warn!(
                    "signal queue full ({} frames), {} signals dropped so far",
                    self.pending_limit, self.dropped
                );
            }
        }
        self.pending.push_back(frame);
    }

    /// 写请求并读取应答，期间收到的信号帧入队
    fn exchange<T: Serialize + ?Sized>(
        &mut self,
        tag: ClientMessage,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<Frame, ProtocolError> {
        self.stream.set_read_timeout(timeout.filter(|t| !t.is_zero()))?;
        write_frame(&mut self.stream, tag, payload)?;
        loop {
            let frame = read_frame(&mut self.stream)?;
            match frame.server_message()? {
                ServerMessage::Signal | ServerMessage::PropertyChanged => self.enqueue(frame),
                _ => return Ok(frame),
            }
        }
    }

    fn send<T: Serialize + ?Sized>(&mut self, tag: ClientMessage, payload: &T) -> Result<(), ProtocolError> {
        write_frame(&mut self.stream, tag, payload)
    }

    fn readable(&self) -> bool {
        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
    }
}

/// 客户端连接
pub struct ProxyConnection {
    channel: Mutex<Channel>,
    broken: AtomicBool,
    session_id: String,
    slot: usize,
    config: BusConfig,
    raw_fd: RawFd,
    next_pipe_id: AtomicU64,
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnection")
            .field("session_id", &self.session_id)
            .field("slot", &self.slot)
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl ProxyConnection {
    /// 连接到总线
    ///
    /// 依次尝试槽位 `0..pool_size`，连接成功并完成 `SENDER_ID` 握手即返回。
    /// 握手失败（槽位刚被别的客户端抢占、握手超时）时继续尝试下一个槽位。
    ///
    /// # 错误
    /// 所有槽位都失败时返回 `IoError`（全部占用、守护进程未运行、无权限
    /// 只能从错误信息区分）。
    pub fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let session_id = next_session_id();
        let mut last_error: Option<String> = None;

        for slot in 0..config.pool_size {
            let path = config.slot_path(slot);
            let stream = match UnixStream::connect(&path) {
                Ok(stream) => stream,
                Err(e) => {
                    trace!("slot {} ({}): {}", slot, path.display(), e);
                    last_error = Some(e.to_string());
                    continue;
                },
            };

            match handshake(stream, &session_id, config.handshake_timeout) {
                Ok((stream, registered)) => {
                    debug!(
                        "connected to {} as {} (slot {})",
                        path.display(),
                        registered.id,
                        registered.slot
                    );
                    let raw_fd = stream.as_raw_fd();
                    return Ok(Self {
                        channel: Mutex::new(Channel::new(stream, config.signal_queue_limit)),
                        broken: AtomicBool::new(false),
                        session_id,
                        slot: registered.slot as usize,
                        config: config.clone(),
                        raw_fd,
                        next_pipe_id: AtomicU64::new(1),
                    });
                },
                Err(e) => {
                    debug!("slot {}: handshake failed: {}", slot, e);
                    last_error = Some(e.to_string());
                },
            }
        }

        Err(BusError::io(format!(
            "cannot connect to saftbus at {}NN ({} slots): {}",
            config.socket_base.display(),
            config.pool_size,
            last_error.as_deref().unwrap_or("no slots configured")
        )))
    }

    /// 由已完成握手的流构造（测试用）
    #[cfg(test)]
    pub(crate) fn from_stream(stream: UnixStream, session_id: &str, config: BusConfig) -> Self {
        let raw_fd = stream.as_raw_fd();
        Self {
            channel: Mutex::new(Channel::new(stream, config.signal_queue_limit)),
            broken: AtomicBool::new(false),
            session_id: session_id.to_string(),
            slot: 0,
            config,
            raw_fd,
            next_pipe_id: AtomicU64::new(1),
        }
    }

    /// 进程共享连接（按需创建；之前的连接被释放或损坏时重新创建）
    ///
    /// 配置取自 [`BusConfig::from_env`]。
    pub fn shared() -> Result<Arc<Self>, BusError> {
        let mut slot = SHARED.lock();
        if let Some(conn) = slot.upgrade()
            && !conn.is_broken()
        {
            return Ok(conn);
        }
        let conn = Arc::new(Self::connect(&BusConfig::from_env())?);
        *slot = Arc::downgrade(&conn);
        Ok(conn)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 占用的服务端槽位
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// 分配一个专用管道编号
    pub fn next_pipe_id(&self) -> u64 {
        self.next_pipe_id.fetch_add(1, Ordering::Relaxed)
    }

    fn with_channel<R>(
        &self,
        f: impl FnOnce(&mut Channel) -> Result<R, ProtocolError>,
    ) -> Result<R, BusError> {
        let mut channel = self.channel.lock();
        if self.is_broken() {
            return Err(BusError::io("saftbus connection is broken"));
        }
        f(&mut channel).map_err(|e| {
            warn!("saftbus connection {} failed: {}", self.session_id, e);
            self.broken.store(true, Ordering::Release);
            BusError::from(e)
        })
    }

    fn round_trip<T: Serialize + ?Sized>(
        &self,
        tag: ClientMessage,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<Frame, BusError> {
        let timeout = timeout.or(self.config.call_timeout);
        self.with_channel(|ch| ch.exchange(tag, payload, timeout))
    }

    /// 同步方法调用
    ///
    /// `timeout` 为 `None` 时使用配置中的默认超时。
    pub fn call_sync(
        &self,
        object_path: &str,
        interface: &str,
        member: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BusError> {
        let call = MethodCall {
            object_path: object_path.to_string(),
            sender: self.session_id.clone(),
            interface: interface.to_string(),
            member: member.to_string(),
            args,
        };
        let frame = self.round_trip(ClientMessage::MethodCall, &call, timeout)?;
        self.reply_value(frame, ServerMessage::MethodReply)
    }

    /// 读取属性（`PROPERTY_GET`）
    pub fn get_property(&self, object_path: &str, interface: &str, name: &str) -> Result<Value, BusError> {
        let call = MethodCall {
            object_path: object_path.to_string(),
            sender: self.session_id.clone(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: PROPERTIES_GET.to_string(),
            args: Value::tuple([Value::from(interface), Value::from(name)]),
        };
        let frame = self.round_trip(ClientMessage::PropertyGet, &call, None)?;
        self.reply_value(frame, ServerMessage::PropertyValue)
    }

    /// 写入属性（`PROPERTY_SET`）
    pub fn set_property(
        &self,
        object_path: &str,
        interface: &str,
        name: &str,
        value: Value,
    ) -> Result<(), BusError> {
        let call = MethodCall {
            object_path: object_path.to_string(),
            sender: self.session_id.clone(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: PROPERTIES_SET.to_string(),
            args: Value::tuple([Value::from(interface), Value::from(name), value]),
        };
        let frame = self.round_trip(ClientMessage::PropertySet, &call, None)?;
        self.reply_value(frame, ServerMessage::MethodReply).map(|_| ())
    }

    /// 解析应答帧：`METHOD_ERROR` 按原分类返回错误，其他非预期类型视为协议错误
    fn reply_value(&self, frame: Frame, expected: ServerMessage) -> Result<Value, BusError> {
        let reply: MethodReply = self.decode_reply(frame, expected)?;
        Ok(reply.value)
    }

    fn decode_reply<T: DeserializeOwned>(&self, frame: Frame, expected: ServerMessage) -> Result<T, BusError> {
        let kind = frame.server_message().map_err(|e| self.protocol_violation(e))?;
        if kind == ServerMessage::MethodError {
            let err: MethodError = frame.decode().map_err(|e| self.protocol_violation(e))?;
            return Err(err.into());
        }
        if kind != expected {
            return Err(self.protocol_violation(ProtocolError::Unexpected(format!(
                "{:?} (expected {:?})",
                kind, expected
            ))));
        }
        frame.decode().map_err(|e| self.protocol_violation(e))
    }

    fn protocol_violation(&self, e: ProtocolError) -> BusError {
        warn!("saftbus connection {}: {}", self.session_id, e);
        self.broken.store(true, Ordering::Release);
        BusError::from(e)
    }

    /// 把管道写端传给服务端，之后该 (接口, 路径) 的信号改走管道
    pub fn send_proxy_signal_fd(
        &self,
        fd: BorrowedFd<'_>,
        object_path: &str,
        interface: &str,
        id: u64,
    ) -> Result<(), BusError> {
        let request = SignalFdRequest {
            object_path: object_path.to_string(),
            interface: interface.to_string(),
            id,
        };
        self.with_channel(|ch| {
            ch.send(ClientMessage::SignalFd, &request)?;
            fdpass::send_fd(&ch.stream, fd)?;
            Ok(())
        })
    }

    /// 撤销专用管道
    pub fn remove_proxy_signal_fd(&self, object_path: &str, interface: &str, id: u64) -> Result<(), BusError> {
        let request = SignalFdRequest {
            object_path: object_path.to_string(),
            interface: interface.to_string(),
            id,
        };
        self.with_channel(|ch| ch.send(ClientMessage::SignalRemoveFd, &request))
    }

    /// 上报信号飞行时间（统计用，单向）
    pub fn report_signal_flight_time(&self, flight_time: Duration) -> Result<(), BusError> {
        let payload = FlightTime {
            micros: u64::try_from(flight_time.as_micros()).unwrap_or(u64::MAX),
        };
        self.with_channel(|ch| ch.send(ClientMessage::SignalFlightTime, &payload))
    }

    /// 查询 (接口, 路径) 的注册 ID
    pub fn get_saftbus_index(&self, object_path: &str, interface: &str) -> Result<u32, BusError> {
        let query = IndexQuery {
            object_path: object_path.to_string(),
            interface: interface.to_string(),
        };
        let frame = self.round_trip(ClientMessage::GetSaftbusIndex, &query, None)?;
        let value = self.reply_value(frame, ServerMessage::MethodReply)?;
        value
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| BusError::io(format!("unexpected index value: {}", value.type_name())))
    }

    /// `SAFTBUS_CTL_HELLO`：返回守护进程版本
    pub fn ctl_hello(&self) -> Result<String, BusError> {
        let frame = self.round_trip(ClientMessage::CtlHello, &(), None)?;
        match self.reply_value(frame, ServerMessage::MethodReply)? {
            Value::Str(version) => Ok(version),
            other => Err(BusError::io(format!("unexpected hello reply: {}", other.type_name()))),
        }
    }

    /// `SAFTBUS_CTL_STATUS`
    pub fn ctl_status(&self) -> Result<BusStatus, BusError> {
        let frame = self.round_trip(ClientMessage::CtlStatus, &(), None)?;
        self.decode_reply(frame, ServerMessage::MethodReply)
    }

    /// `SAFTBUS_CTL_GET_STATE`
    pub fn ctl_state(&self) -> Result<BusState, BusError> {
        let frame = self.round_trip(ClientMessage::CtlGetState, &(), None)?;
        self.decode_reply(frame, ServerMessage::MethodReply)
    }

    /// 开关服务端统计，返回新状态
    pub fn set_statistics(&self, enabled: bool) -> Result<bool, BusError> {
        let tag = if enabled {
            ClientMessage::CtlEnableStats
        } else {
            ClientMessage::CtlDisableStats
        };
        self.ctl_toggle(tag)
    }

    /// 开关服务端消息日志，返回新状态
    pub fn set_logging(&self, enabled: bool) -> Result<bool, BusError> {
        let tag = if enabled {
            ClientMessage::CtlEnableLogging
        } else {
            ClientMessage::CtlDisableLogging
        };
        self.ctl_toggle(tag)
    }

    fn ctl_toggle(&self, tag: ClientMessage) -> Result<bool, BusError> {
        let frame = self.round_trip(tag, &(), None)?;
        self.reply_value(frame, ServerMessage::MethodReply)?
            .as_bool()
            .ok_or_else(|| BusError::io("unexpected toggle reply"))
    }

    /// 取出已到达的信号（不阻塞）
    ///
    /// 先返回 `call_sync` 期间入队的信号，再读取 socket 上已就绪的帧。
    /// 读到 EOF 时连接被标记为损坏。
    pub fn take_signals(&self) -> Vec<Incoming> {
        let mut channel = self.channel.lock();
        let mut frames: Vec<Frame> = channel.pending.drain(..).collect();

        if !self.is_broken() {
            // 帧一旦开始到达，剩余部分很快就会到，用握手超时兜底
            if let Err(e) = channel
                .stream
                .set_read_timeout(Some(self.config.handshake_timeout))
            {
                warn!("saftbus connection {}: cannot set read timeout: {}", self.session_id, e);
                self.broken.store(true, Ordering::Release);
            }
            while !self.is_broken() && channel.readable() {
                match read_frame(&mut channel.stream) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => {
                        if e.is_disconnect() {
                            debug!("saftbus connection {} closed by daemon", self.session_id);
                        } else {
                            warn!("saftbus connection {}: {}", self.session_id, e);
                        }
                        self.broken.store(true, Ordering::Release);
                        break;
                    },
                }
            }
        }
        drop(channel);

        frames
            .iter()
            .filter_map(|frame| match Incoming::from_frame(frame) {
                Ok(incoming) => Some(incoming),
                Err(e) => {
                    warn!("discarding frame from daemon: {}", e);
                    None
                },
            })
            .collect()
    }

    fn has_pending(&self) -> bool {
        self.channel
            .try_lock()
            .is_some_and(|ch| !ch.pending.is_empty())
    }

    /// 在事件循环中接收共享 socket 上的信号
    ///
    /// 同一连接只应注册一次（信号取出后即被消费）。连接损坏后 source 自动移除。
    pub fn watch_signals<F>(self: &Arc<Self>, ctx: &MainContext, callback: F) -> SourceId
    where
        F: FnMut(&Incoming) + 'static,
    {
        ctx.add_source(SignalWatch {
            connection: Arc::clone(self),
            callback,
        })
    }
}

/// 共享 socket 的信号 source
///
/// 除了 socket 可读，`call_sync` 期间入队的信号也会让 poll 立即返回。
struct SignalWatch<F> {
    connection: Arc<ProxyConnection>,
    callback: F,
}

impl<F: FnMut(&Incoming)> Source for SignalWatch<F> {
    fn prepare(&mut self, watches: &mut Vec<Watch>) -> Option<Duration> {
        watches.push(Watch {
            fd: self.connection.raw_fd,
            interest: PollFlags::POLLIN,
        });
        self.connection.has_pending().then_some(Duration::ZERO)
    }

    fn dispatch(&mut self, ready: &[PollFlags], _elapsed: Duration) -> ControlFlow<()> {
        let readable = ready.first().is_some_and(|f| !f.is_empty());
        if readable || self.connection.has_pending() {
            for incoming in self.connection.take_signals() {
                (self.callback)(&incoming);
            }
        }
        if self.connection.is_broken() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// 握手：发送 `SENDER_ID`，等待 `CLIENT_REGISTERED`
fn handshake(
    mut stream: UnixStream,
    session_id: &str,
    timeout: Duration,
) -> Result<(UnixStream, ClientRegistered), ProtocolError> {
    stream.set_read_timeout(Some(timeout).filter(|t| !t.is_zero()))?;
    write_frame(
        &mut stream,
        ClientMessage::SenderId,
        &SenderId {
            id: session_id.to_string(),
        },
    )?;
    let frame = read_frame(&mut stream)?;
    match frame.server_message()? {
        ServerMessage::ClientRegistered => {
            let registered: ClientRegistered = frame.decode()?;
            Ok((stream, registered))
        },
        other => Err(ProtocolError::Unexpected(format!(
            "{:?} during handshake",
            other
        ))),
    }
}
