//! 服务端连接（socket 池 + 对象注册表 + 订阅表 + 分发器）
//!
//! 所有状态都只在运行事件循环的线程上访问，用 `RefCell` 而不是锁。
//! 调用对象操作或订阅回调之前，所有表格的借用都已释放，
//! 因此对象可以在被调用期间发射信号、注册/注销对象或订阅信号。

use super::registry::ObjectRegistry;
use super::socket::{ProxyPipe, Socket};
use super::stats::Statistics;
use super::subscription::{SignalEvent, SignalFilter, SubscriptionId, SubscriptionTable};
use super::vtable::{CallContext, MethodInvocation, ObjectOps};
use crate::config::BusConfig;
use crate::error::ServerError;
use crate::fdpass;
use crate::mainloop::MainContext;
use nix::poll::PollFlags;
use saftbus_protocol::{
    BusError, BusState, BusStatus, ClientMessage, ClientRegistered, DAEMON_SENDER, FlightTime,
    Frame, IndexQuery, MethodCall, MethodError, MethodReply, PROPERTIES_CHANGED, PROPERTIES_GET,
    PROPERTIES_INTERFACE, PROPERTIES_SET, PROTOCOL_VERSION, ProtocolError, SESSION_ENDED, SenderId,
    ServerMessage, SignalFdRequest, SignalMessage, SlotStatus, Value, encode_frame, read_frame,
    write_frame,
};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::{self, Permissions};
use std::ops::ControlFlow;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, trace, warn};

/// 一次 `dispatch` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// 消息已处理
    Handled,
    /// 消息无法识别或负载损坏，已丢弃（连接保持）
    NotHandled,
    /// 连接已断开并完成清理
    Disconnected,
}

pub struct Connection {
    config: BusConfig,
    ctx: MainContext,
    weak_self: Weak<Connection>,
    sockets: RefCell<Vec<Socket>>,
    registry: RefCell<ObjectRegistry>,
    subscriptions: RefCell<SubscriptionTable>,
    stats: RefCell<Statistics>,
    logging: Cell<bool>,
}

impl Connection {
    /// 创建 socket 池并开始监听
    ///
    /// 目录不存在时会创建并放开权限。任何槽位绑定失败都会使整个启动失败。
    pub fn bind(ctx: &MainContext, config: BusConfig) -> Result<Rc<Connection>, ServerError> {
        if config.pool_size == 0 {
            return Err(ServerError::Config("pool size must be at least 1".into()));
        }
        if let Some(dir) = config.socket_base.parent()
            && !dir.as_os_str().is_empty()
            && !dir.exists()
        {
            fs::create_dir_all(dir)?;
            fs::set_permissions(dir, Permissions::from_mode(0o777))?;
            info!("created socket directory {}", dir.display());
        }

        let sockets = (0..config.pool_size)
            .map(|i| Socket::new(i, config.slot_path(i)))
            .collect();

        let conn = Rc::new_cyclic(|weak| Connection {
            config,
            ctx: ctx.clone(),
            weak_self: weak.clone(),
            sockets: RefCell::new(sockets),
            registry: RefCell::new(ObjectRegistry::new()),
            subscriptions: RefCell::new(SubscriptionTable::new()),
            stats: RefCell::new(Statistics::new()),
            logging: Cell::new(false),
        });

        for index in 0..conn.config.pool_size {
            conn.arm_socket(index).map_err(|source| ServerError::Bind {
                path: conn.config.slot_path(index),
                source,
            })?;
        }
        info!(
            "saftbus listening on {}00..{:02} ({} slots)",
            conn.config.socket_base.display(),
            conn.config.pool_size - 1,
            conn.config.pool_size
        );
        Ok(conn)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn context(&self) -> &MainContext {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // 对象
    // ------------------------------------------------------------------

    /// 注册对象，返回注册 ID
    pub fn register_object(
        &self,
        object_path: &str,
        interface: &str,
        ops: impl ObjectOps + 'static,
    ) -> Result<u32, BusError> {
        let id = self
            .registry
            .borrow_mut()
            .register(object_path, interface, Rc::new(ops))?;
        debug!("registered {} at {} (id {})", interface, object_path, id);
        Ok(id)
    }

    /// 注销对象，并关闭所有会话中该 (接口, 路径) 的专用管道
    pub fn unregister_object(&self, id: u32) -> bool {
        let Some(registration) = self.registry.borrow_mut().unregister(id) else {
            return false;
        };
        let mut closed = 0;
        for socket in self.sockets.borrow_mut().iter_mut() {
            if let Some(session) = socket.session_mut() {
                closed += session.remove_bucket(&registration.interface, &registration.object_path);
            }
        }
        debug!(
            "unregistered {} at {} (id {}, {} proxy pipes closed)",
            registration.interface, registration.object_path, id, closed
        );
        true
    }

    pub fn object_id(&self, interface: &str, object_path: &str) -> Option<u32> {
        self.registry.borrow().id_of(interface, object_path)
    }

    pub fn object_count(&self) -> usize {
        self.registry.borrow().len()
    }

    // ------------------------------------------------------------------
    // 信号
    // ------------------------------------------------------------------

    /// 订阅信号（本地回调）
    pub fn signal_subscribe<F>(&self, filter: SignalFilter, callback: F) -> SubscriptionId
    where
        F: FnMut(&SignalEvent<'_>) + 'static,
    {
        self.subscriptions.borrow_mut().subscribe(filter, callback)
    }

    /// 取消订阅（发射期间延迟到发射结束）
    pub fn signal_unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.borrow_mut().unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    /// 以 `sender` 为发送者过滤条件的有效订阅数
    pub fn subscription_count_for(&self, sender: &str) -> usize {
        self.subscriptions.borrow().count_for_sender(sender)
    }

    /// 发射信号
    ///
    /// 时间戳只打一次。先投递给匹配的本地订阅（发送者为 `"saftbus"`），
    /// 再写到每个活动 socket：若该会话为这个 (接口, 路径) 登记了专用管道，
    /// 则写到管道，否则写到 socket。`destination` 非空时只投递给该会话。
    ///
    /// 某个 socket 写失败只会触发该 socket 的断开处理，不影响其他目标。
    ///
    /// # 返回
    /// 成功写出的帧数（socket 与管道合计）
    pub fn emit_signal(
        &self,
        object_path: &str,
        interface: &str,
        name: &str,
        destination: Option<&str>,
        args: Value,
    ) -> usize {
        let signal = SignalMessage::new(object_path, interface, name, args);
        self.deliver_local(&signal);
        let delivered = self.broadcast(ServerMessage::Signal, &signal, interface, destination);

        self.stats.borrow_mut().record_signal();
        if self.logging.get() {
            info!(
                "signal {}.{} on {} delivered to {} targets",
                interface, name, object_path, delivered
            );
        }
        delivered
    }

    /// 发射属性变化通知（`PROPERTY_CHANGED` 帧）
    ///
    /// 参数为 `(接口, {属性: 新值}, [失效属性])`，按真实接口名匹配专用管道。
    pub fn emit_properties_changed(
        &self,
        object_path: &str,
        interface: &str,
        changed: BTreeMap<String, Value>,
        invalidated: Vec<String>,
    ) -> usize {
        let args = Value::tuple([
            Value::from(interface),
            Value::Map(changed),
            Value::Array(invalidated.into_iter().map(Value::Str).collect()),
        ]);
        let signal = SignalMessage::new(object_path, PROPERTIES_INTERFACE, PROPERTIES_CHANGED, args);
        self.deliver_local(&signal);
        let delivered = self.broadcast(ServerMessage::PropertyChanged, &signal, interface, None);

        self.stats.borrow_mut().record_signal();
        if self.logging.get() {
            info!(
                "properties of {} on {} changed, delivered to {} targets",
                interface, object_path, delivered
            );
        }
        delivered
    }

    fn deliver_local(&self, signal: &SignalMessage) -> usize {
        let event = SignalEvent {
            sender: DAEMON_SENDER,
            object_path: &signal.object_path,
            interface: &signal.interface,
            member: &signal.member,
            args: &signal.args,
        };
        SubscriptionTable::emit(&self.subscriptions, &event)
    }

    fn broadcast(
        &self,
        tag: ServerMessage,
        signal: &SignalMessage,
        route_interface: &str,
        destination: Option<&str>,
    ) -> usize {
        let bytes = match encode_frame(tag, signal) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode signal {}: {}", signal.member, e);
                return 0;
            },
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for socket in self.sockets.borrow_mut().iter_mut() {
            if !socket.is_active() {
                continue;
            }
            if let Some(dest) = destination
                && socket.session_id() != Some(dest)
            {
                continue;
            }

            let path = &signal.object_path;
            match socket.session_mut() {
                Some(session) if session.has_pipes_for(route_interface, path) => {
                    delivered += session.write_pipes(route_interface, path, &bytes);
                },
                _ => match socket.write_all(&bytes) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("signal write to slot {} failed: {}", socket.index(), e);
                        failed.push(socket.index());
                    },
                },
            }
        }

        for index in failed {
            self.handle_disconnect(index);
        }
        delivered
    }

    // ------------------------------------------------------------------
    // socket 生命周期
    // ------------------------------------------------------------------

    /// （重新）创建槽位的监听 socket 并注册 accept 回调
    fn arm_socket(&self, index: usize) -> std::io::Result<()> {
        let fd = self.sockets.borrow_mut()[index].listen()?;
        let weak = self.weak_self.clone();
        let source = self.ctx.add_io(fd, PollFlags::POLLIN, move |_| match weak.upgrade() {
            Some(conn) => conn.on_accept(index),
            None => ControlFlow::Break(()),
        });
        if let Some(old) = self.sockets.borrow_mut()[index].set_source(source) {
            self.ctx.remove_source(old);
        }
        trace!("slot {} waiting for client", index);
        Ok(())
    }

    fn on_accept(&self, index: usize) -> ControlFlow<()> {
        let accepted = self.sockets.borrow_mut()[index].accept(self.config.write_timeout);
        match accepted {
            Ok(Some(fd)) => {
                info!("client connected on slot {}", index);
                let weak = self.weak_self.clone();
                let source = self.ctx.add_io(fd, PollFlags::POLLIN, move |_| {
                    let Some(conn) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    match conn.dispatch(index) {
                        Dispatch::Disconnected => ControlFlow::Break(()),
                        Dispatch::Handled | Dispatch::NotHandled => ControlFlow::Continue(()),
                    }
                });
                // 监听回调本身返回 Break，不需要再 remove_source
                self.sockets.borrow_mut()[index].set_source(source);
                ControlFlow::Break(())
            },
            Ok(None) => ControlFlow::Continue(()),
            Err(e) => {
                warn!("accept on slot {} failed: {}", index, e);
                ControlFlow::Continue(())
            },
        }
    }

    /// 断开处理
    ///
    /// 关闭连接；向该会话的订阅者投递一个空参数的 `SessionEnded` 信号，
    /// 然后移除这些订阅；关闭该会话的所有专用管道；重新监听该槽位。
    /// 对已空闲的槽位调用是无操作。
    pub fn handle_disconnect(&self, index: usize) {
        let (session, source) = {
            let mut sockets = self.sockets.borrow_mut();
            let Some(socket) = sockets.get_mut(index) else {
                return;
            };
            if !socket.is_active() {
                return;
            }
            (socket.close(), socket.take_source())
        };
        if let Some(source) = source {
            self.ctx.remove_source(source);
        }

        match &session {
            Some(session) => {
                let id = session.id();
                let event = SignalEvent {
                    sender: id,
                    object_path: "",
                    interface: "",
                    member: SESSION_ENDED,
                    args: &Value::Unit,
                };
                let notified = SubscriptionTable::emit_selected(&self.subscriptions, &event, |f| {
                    f.sender.as_deref() == Some(id)
                });
                let removed = self.subscriptions.borrow_mut().unsubscribe_sender(id);
                info!(
                    "session {} on slot {} disconnected ({} subscriptions notified, {} removed, {} proxy pipes closed)",
                    id,
                    index,
                    notified,
                    removed,
                    session.pipe_count()
                );
            },
            None => info!("client on slot {} disconnected before handshake", index),
        }
        drop(session);

        if let Err(e) = self.arm_socket(index) {
            error!("failed to re-arm slot {}: {}", index, e);
        }
    }

    // ------------------------------------------------------------------
    // 分发
    // ------------------------------------------------------------------

    /// 处理槽位 `index` 上的一条消息
    pub fn dispatch(&self, index: usize) -> Dispatch {
        let Some(stream) = self.sockets.borrow().get(index).and_then(Socket::stream) else {
            return Dispatch::NotHandled;
        };

        let frame = match read_frame(&mut &*stream) {
            Ok(frame) => frame,
            Err(e) => {
                if e.is_disconnect() {
                    debug!("slot {}: peer closed", index);
                } else {
                    warn!("slot {}: read failed: {}", index, e);
                }
                self.handle_disconnect(index);
                return Dispatch::Disconnected;
            },
        };

        let message = match frame.client_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("slot {}: {}, frame dropped", index, e);
                return Dispatch::NotHandled;
            },
        };
        trace!("slot {}: {:?} ({} bytes)", index, message, frame.payload.len());

        match self.handle_message(index, &stream, message, &frame) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                debug!("slot {}: {:?} failed: {}", index, message, e);
                self.handle_disconnect(index);
                Dispatch::Disconnected
            },
        }
    }

    /// 返回 `Err` 表示传输层失败（调用方按断开处理）
    fn handle_message(
        &self,
        index: usize,
        stream: &UnixStream,
        message: ClientMessage,
        frame: &Frame,
    ) -> Result<Dispatch, ProtocolError> {
        match message {
            ClientMessage::SenderId => {
                let Some(hello) = self.decode::<SenderId>(index, stream, message, frame)? else {
                    return Ok(Dispatch::NotHandled);
                };
                self.sockets.borrow_mut()[index].set_session_id(hello.id.clone());
                info!("slot {}: session {} registered", index, hello.id);
                reply(
                    stream,
                    ServerMessage::ClientRegistered,
                    &ClientRegistered {
                        id: hello.id,
                        slot: index as u32,
                    },
                )?;
            },
            ClientMessage::MethodCall | ClientMessage::PropertyGet | ClientMessage::PropertySet => {
                let Some(call) = self.decode::<MethodCall>(index, stream, message, frame)? else {
                    return Ok(Dispatch::NotHandled);
                };
                let result = self.invoke(index, &call);
                self.stats.borrow_mut().record_call();
                if self.logging.get() {
                    info!(
                        "{} -> {} {}.{}: {}",
                        call.sender,
                        call.object_path,
                        call.interface,
                        call.member,
                        if result.is_ok() { "ok" } else { "error" }
                    );
                }
                match result {
                    Ok(value) => {
                        let tag = if message == ClientMessage::PropertyGet {
                            ServerMessage::PropertyValue
                        } else {
                            ServerMessage::MethodReply
                        };
                        reply(stream, tag, &MethodReply { value })?;
                    },
                    Err(e) => reply(stream, ServerMessage::MethodError, &MethodError::from(e))?,
                }
            },
            ClientMessage::SignalFd => {
                let request = frame.decode::<SignalFdRequest>();
                // 无论负载是否有效，都要取走紧随其后的描述符
                let fd = fdpass::recv_fd(stream)?;
                let request = match request {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("slot {}: malformed SIGNAL_FD: {}", index, e);
                        return Ok(Dispatch::NotHandled);
                    },
                };
                let pipe = ProxyPipe::new(request.id, fd, self.config.write_timeout)?;
                let mut sockets = self.sockets.borrow_mut();
                match sockets[index].session_mut() {
                    Some(session) => {
                        if session.add_pipe(&request.interface, &request.object_path, pipe) {
                            debug!(
                                "session {}: proxy pipe {} for {} at {}",
                                session.id(),
                                request.id,
                                request.interface,
                                request.object_path
                            );
                        } else {
                            warn!(
                                "session {}: duplicate proxy pipe id {} rejected",
                                session.id(),
                                request.id
                            );
                        }
                    },
                    None => warn!("slot {}: SIGNAL_FD before handshake, descriptor closed", index),
                }
            },
            ClientMessage::SignalRemoveFd => {
                let Some(request) = self.decode::<SignalFdRequest>(index, stream, message, frame)?
                else {
                    return Ok(Dispatch::NotHandled);
                };
                let removed = self.sockets.borrow_mut()[index]
                    .session_mut()
                    .is_some_and(|s| s.remove_pipe(&request.interface, &request.object_path, request.id));
                if !removed {
                    debug!("slot {}: no proxy pipe {} to remove", index, request.id);
                }
            },
            ClientMessage::SignalFlightTime => {
                let Some(flight) = self.decode::<FlightTime>(index, stream, message, frame)? else {
                    return Ok(Dispatch::NotHandled);
                };
                self.stats.borrow_mut().record_flight_time(flight.micros);
            },
            ClientMessage::GetSaftbusIndex => {
                let Some(query) = self.decode::<IndexQuery>(index, stream, message, frame)? else {
                    return Ok(Dispatch::NotHandled);
                };
                match self.object_id(&query.interface, &query.object_path) {
                    Some(id) => reply(
                        stream,
                        ServerMessage::MethodReply,
                        &MethodReply {
                            value: Value::UInt32(id),
                        },
                    )?,
                    None => reply(
                        stream,
                        ServerMessage::MethodError,
                        &MethodError::from(BusError::unknown_object(format!(
                            "{} at {}",
                            query.interface, query.object_path
                        ))),
                    )?,
                }
            },
            ClientMessage::CtlHello => {
                reply(
                    stream,
                    ServerMessage::MethodReply,
                    &MethodReply {
                        value: Value::from(PROTOCOL_VERSION),
                    },
                )?;
            },
            ClientMessage::CtlStatus => reply(stream, ServerMessage::MethodReply, &self.status())?,
            ClientMessage::CtlGetState => reply(stream, ServerMessage::MethodReply, &self.state())?,
            ClientMessage::CtlEnableStats | ClientMessage::CtlDisableStats => {
                let on = message == ClientMessage::CtlEnableStats;
                self.set_statistics(on);
                reply(
                    stream,
                    ServerMessage::MethodReply,
                    &MethodReply {
                        value: Value::Bool(on),
                    },
                )?;
            },
            ClientMessage::CtlEnableLogging | ClientMessage::CtlDisableLogging => {
                let on = message == ClientMessage::CtlEnableLogging;
                self.set_logging(on);
                reply(
                    stream,
                    ServerMessage::MethodReply,
                    &MethodReply {
                        value: Value::Bool(on),
                    },
                )?;
            },
        }
        Ok(Dispatch::Handled)
    }

    /// 解码负载；损坏时记录日志，需要回复的请求回一个 `InvalidArgs` 错误
    fn decode<T: serde::de::DeserializeOwned>(
        &self,
        index: usize,
        stream: &UnixStream,
        message: ClientMessage,
        frame: &Frame,
    ) -> Result<Option<T>, ProtocolError> {
        match frame.decode::<T>() {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                warn!("slot {}: malformed {:?} payload: {}", index, message, e);
                if message.expects_reply() {
                    let err = BusError::invalid_args(format!("malformed {:?} payload", message));
                    reply(stream, ServerMessage::MethodError, &MethodError::from(err))?;
                }
                Ok(None)
            },
        }
    }

    /// 调用对象操作（属性访问走固定的属性接口）
    fn invoke(&self, index: usize, call: &MethodCall) -> Result<Value, BusError> {
        let session_id = self.sockets.borrow()[index].session_id().map(str::to_owned);
        let sender = if call.sender.is_empty() {
            session_id.as_deref().unwrap_or_default()
        } else {
            call.sender.as_str()
        };

        if call.interface == PROPERTIES_INTERFACE {
            let interface = call
                .args
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| BusError::invalid_args("expected (interface, property[, value])"))?;
            let property = call
                .args
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| BusError::invalid_args("expected (interface, property[, value])"))?;
            let ops = self.lookup(interface, &call.object_path)?;
            let ctx = CallContext::new(self, sender, &call.object_path, interface);
            return match call.member.as_str() {
                PROPERTIES_GET => guarded(interface, property, || ops.get_property(&ctx, property)),
                PROPERTIES_SET => {
                    let value = call
                        .args
                        .get(2)
                        .cloned()
                        .ok_or_else(|| BusError::invalid_args("Set requires a value"))?;
                    guarded(interface, property, || {
                        ops.set_property(&ctx, property, value).map(|()| Value::Unit)
                    })
                },
                other => Err(BusError::unknown_method(format!(
                    "{}.{}",
                    PROPERTIES_INTERFACE, other
                ))),
            };
        }

        let ops = self.lookup(&call.interface, &call.object_path)?;
        let ctx = CallContext::new(self, sender, &call.object_path, &call.interface);
        guarded(&call.interface, &call.member, || {
            let mut invocation = MethodInvocation::new(call.member.clone(), call.args.clone());
            ops.method_call(&ctx, &mut invocation);
            invocation.into_result()
        })
    }

    fn lookup(&self, interface: &str, object_path: &str) -> Result<Rc<dyn ObjectOps>, BusError> {
        self.registry
            .borrow()
            .lookup(interface, object_path)
            .ok_or_else(|| BusError::unknown_object(format!("{} at {}", interface, object_path)))
    }

    // ------------------------------------------------------------------
    // 诊断
    // ------------------------------------------------------------------

    pub fn set_statistics(&self, enabled: bool) {
        self.stats.borrow_mut().set_enabled(enabled);
        info!("statistics {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_logging(&self, enabled: bool) {
        self.logging.set(enabled);
        info!("message logging {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn active_sockets(&self) -> usize {
        self.sockets.borrow().iter().filter(|s| s.is_active()).count()
    }

    /// 已握手的会话 ID（按槽位顺序）
    pub fn session_ids(&self) -> Vec<String> {
        self.sockets
            .borrow()
            .iter()
            .filter_map(|s| s.session_id().map(str::to_owned))
            .collect()
    }

    /// 专用管道数量（`session` 为 `None` 时统计全部会话）
    pub fn proxy_pipe_count(&self, session: Option<&str>) -> usize {
        self.sockets
            .borrow()
            .iter()
            .filter_map(Socket::session)
            .filter(|s| session.is_none_or(|id| s.id() == id))
            .map(|s| s.pipe_count())
            .sum()
    }

    pub fn status(&self) -> BusStatus {
        let slots = self
            .sockets
            .borrow()
            .iter()
            .map(|s| SlotStatus {
                index: s.index() as u32,
                active: s.is_active(),
                session: s.session_id().map(str::to_owned),
                proxy_pipes: s.session().map(|x| x.pipe_count() as u32).unwrap_or(0),
            })
            .collect();
        BusStatus {
            version: PROTOCOL_VERSION.to_string(),
            objects: self.registry.borrow().entries(),
            slots,
            subscriptions: self.subscription_count() as u32,
            stats_enabled: self.stats.borrow().is_enabled(),
            logging_enabled: self.logging.get(),
        }
    }

    pub fn state(&self) -> BusState {
        let stats = self.stats.borrow();
        BusState {
            status: self.status(),
            method_calls: stats.method_calls(),
            signals_emitted: stats.signals_emitted(),
            flight_time_histogram: stats.histogram(),
        }
    }
}

/// 运行一个对象操作；实现 panic 时转换为 `Failed`，事件循环继续运行
fn guarded<T>(
    interface: &str,
    member: &str,
    op: impl FnOnce() -> Result<T, BusError>,
) -> Result<T, BusError> {
    panic::catch_unwind(AssertUnwindSafe(op)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("{}.{} panicked: {}", interface, member, reason);
        Err(BusError::failed(format!("{}.{} panicked: {}", interface, member, reason)))
    })
}

impl Drop for Connection {
    fn drop(&mut self) {
        for socket in self.sockets.get_mut().iter_mut() {
            if let Some(source) = socket.take_source() {
                self.ctx.remove_source(source);
            }
            socket.close();
        }
    }
}

fn reply<T: Serialize + ?Sized>(
    stream: &UnixStream,
    tag: ServerMessage,
    payload: &T,
) -> Result<(), ProtocolError> {
    let mut writer = stream;
    write_frame(&mut writer, tag, payload)
}
