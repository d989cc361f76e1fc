//! 远程对象代理
//!
//! [`Proxy`] 把一个 [`ProxyConnection`] 绑定到一个 (对象路径, 接口)，
//! 转发方法调用和属性访问，并在事件循环中把到达的信号分发给注册的处理函数。
//!
//! 信号有两条来路：
//!
//! - 共享 socket：通过 [`ProxyConnection::watch_signals`] 取出，再交给
//!   [`Proxy::dispatcher`] 返回的分发器
//! - 专用管道：[`Proxy::attach`] 创建管道、把写端传给守护进程并监听读端，
//!   之后该 (接口, 路径) 的信号只走管道
//!
//! 代理默认不缓存任何东西；[`Proxy::enable_property_cache`] 开启后，
//! 读取过的属性会被缓存，并由 `PropertiesChanged` 更新或失效。

use super::proxy_connection::{Incoming, ProxyConnection};
use crate::mainloop::{MainContext, SourceId};
use nix::poll::PollFlags;
use saftbus_protocol::{
    BusError, PROPERTIES_INTERFACE, ProtocolError, ServerMessage, SignalMessage, Value, read_frame,
};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::os::fd::{AsFd, AsRawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type SignalHandler = Box<dyn FnMut(&SignalMessage)>;
type PropertiesHandler = Box<dyn FnMut(&BTreeMap<String, Value>, &[String])>;

/// 代理的共享状态（事件循环回调与代理本身共同持有）
struct ProxyState {
    connection: Arc<ProxyConnection>,
    object_path: String,
    interface: String,
    signal_handlers: RefCell<Vec<SignalHandler>>,
    properties_handlers: RefCell<Vec<PropertiesHandler>>,
    cache: RefCell<Option<BTreeMap<String, Value>>>,
    report_flight_time: Cell<bool>,
}

impl ProxyState {
    fn matches(&self, signal: &SignalMessage) -> bool {
        if signal.object_path != self.object_path {
            return false;
        }
        signal.interface == self.interface
            || (signal.interface == PROPERTIES_INTERFACE
                && signal.args.arg0_str() == Some(self.interface.as_str()))
    }

    fn dispatch(&self, incoming: &Incoming) -> bool {
        if !self.matches(&incoming.signal) {
            return false;
        }

        if self.report_flight_time.get()
            && let Err(e) = self
                .connection
                .report_signal_flight_time(incoming.signal.flight_time())
        {
            debug!("failed to report flight time: {}", e);
        }

        if incoming.kind == ServerMessage::PropertyChanged {
            self.properties_changed(&incoming.signal.args);
        } else {
            // 处理函数可能在回调中注册新的处理函数：先取出，调用完再合并
            let mut handlers = std::mem::take(&mut *self.signal_handlers.borrow_mut());
            for handler in handlers.iter_mut() {
                handler(&incoming.signal);
            }
            let mut slot = self.signal_handlers.borrow_mut();
            handlers.append(&mut slot);
            *slot = handlers;
        }
        true
    }

    fn properties_changed(&self, args: &Value) {
        let empty = BTreeMap::new();
        let changed = args.get(1).and_then(Value::as_map).unwrap_or(&empty);
        let invalidated: Vec<String> = args
            .get(2)
            .and_then(Value::as_slice)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        if let Some(cache) = self.cache.borrow_mut().as_mut() {
            for (name, value) in changed {
                cache.insert(name.clone(), value.clone());
            }
            for name in &invalidated {
                cache.remove(name);
            }
        }

        let mut handlers = std::mem::take(&mut *self.properties_handlers.borrow_mut());
        for handler in handlers.iter_mut() {
            handler(changed, &invalidated);
        }
        let mut slot = self.properties_handlers.borrow_mut();
        handlers.append(&mut slot);
        *slot = handlers;
    }
}

struct Attachment {
    ctx: MainContext,
    source: SourceId,
    pipe_id: u64,
}

/// 远程对象代理
pub struct Proxy {
    state: Rc<ProxyState>,
    attachment: RefCell<Option<Attachment>>,
}

/// 共享 socket 信号的分发器（可在 `watch_signals` 回调中使用）
#[derive(Clone)]
pub struct SignalDispatcher {
    state: Rc<ProxyState>,
}

impl SignalDispatcher {
    /// 信号属于该代理时分发并返回 `true`
    pub fn dispatch(&self, incoming: &Incoming) -> bool {
        self.state.dispatch(incoming)
    }
}

impl Proxy {
    /// 使用进程共享连接创建代理
    pub fn new(object_path: &str, interface: &str) -> Result<Self, BusError> {
        Ok(Self::with_connection(
            ProxyConnection::shared()?,
            object_path,
            interface,
        ))
    }

    /// 使用指定连接创建代理（不做任何 IO）
    pub fn with_connection(connection: Arc<ProxyConnection>, object_path: &str, interface: &str) -> Self {
        Self {
            state: Rc::new(ProxyState {
                connection,
                object_path: object_path.to_string(),
                interface: interface.to_string(),
                signal_handlers: RefCell::new(Vec::new()),
                properties_handlers: RefCell::new(Vec::new()),
                cache: RefCell::new(None),
                report_flight_time: Cell::new(false),
            }),
            attachment: RefCell::new(None),
        }
    }

    pub fn object_path(&self) -> &str {
        &self.state.object_path
    }

    pub fn interface(&self) -> &str {
        &self.state.interface
    }

    pub fn connection(&self) -> &Arc<ProxyConnection> {
        &self.state.connection
    }

    /// 方法调用
    pub fn call(&self, method: &str, args: Value) -> Result<Value, BusError> {
        self.call_with_timeout(method, args, None)
    }

    pub fn call_with_timeout(
        &self,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BusError> {
        self.state.connection.call_sync(
            &self.state.object_path,
            &self.state.interface,
            method,
            args,
            timeout,
        )
    }

    /// 读取属性（缓存开启且命中时不访问守护进程）
    pub fn get_property(&self, name: &str) -> Result<Value, BusError> {
        if let Some(value) = self
            .state
            .cache
            .borrow()
            .as_ref()
            .and_then(|cache| cache.get(name))
        {
            return Ok(value.clone());
        }

        let value = self.state.connection.get_property(
            &self.state.object_path,
            &self.state.interface,
            name,
        )?;
        if let Some(cache) = self.state.cache.borrow_mut().as_mut() {
            cache.insert(name.to_string(), value.clone());
        }
        Ok(value)
    }

    /// 写入属性（缓存中的旧值失效）
    pub fn set_property(&self, name: &str, value: Value) -> Result<(), BusError> {
        if let Some(cache) = self.state.cache.borrow_mut().as_mut() {
            cache.remove(name);
        }
        self.state.connection.set_property(
            &self.state.object_path,
            &self.state.interface,
            name,
            value,
        )
    }

    /// 开关属性缓存（关闭时清空）
    pub fn enable_property_cache(&self, enabled: bool) {
        let mut cache = self.state.cache.borrow_mut();
        match (enabled, cache.is_some()) {
            (true, false) => *cache = Some(BTreeMap::new()),
            (false, _) => *cache = None,
            _ => {},
        }
    }

    /// 收到信号时向守护进程上报飞行时间
    pub fn report_flight_time(&self, enabled: bool) {
        self.state.report_flight_time.set(enabled);
    }

    /// 注册信号处理函数（该代理的所有信号，属性变化除外）
    pub fn connect_signal<F>(&self, handler: F)
    where
        F: FnMut(&SignalMessage) + 'static,
    {
        self.state.signal_handlers.borrow_mut().push(Box::new(handler));
    }

    /// 注册属性变化处理函数：`(变化的属性, 失效的属性)`
    pub fn connect_properties_changed<F>(&self, handler: F)
    where
        F: FnMut(&BTreeMap<String, Value>, &[String]) + 'static,
    {
        self.state
            .properties_handlers
            .borrow_mut()
            .push(Box::new(handler));
    }

    /// 信号是否属于该代理（路径相同，且接口相同或为针对该接口的属性变化）
    pub fn matches(&self, signal: &SignalMessage) -> bool {
        self.state.matches(signal)
    }

    /// 分发一个信号，属于该代理时返回 `true`
    pub fn dispatch(&self, incoming: &Incoming) -> bool {
        self.state.dispatch(incoming)
    }

    pub fn dispatcher(&self) -> SignalDispatcher {
        SignalDispatcher {
            state: Rc::clone(&self.state),
        }
    }

    /// 创建专用信号管道并在 `ctx` 中监听
    ///
    /// 已经 attach 过时不做任何事。
    pub fn attach(&self, ctx: &MainContext) -> Result<(), BusError> {
        if self.attachment.borrow().is_some() {
            return Ok(());
        }

        let (mut reader, writer) = std::io::pipe()?;
        let state = &self.state;
        let pipe_id = state.connection.next_pipe_id();
        state.connection.send_proxy_signal_fd(
            writer.as_fd(),
            &state.object_path,
            &state.interface,
            pipe_id,
        )?;
        drop(writer);

        // reader 移入回调：source 存活期间描述符一直有效
        let fd = reader.as_raw_fd();
        let callback_state = Rc::clone(state);
        let source = ctx.add_io(fd, PollFlags::POLLIN, move |_| {
            match read_frame(&mut reader).and_then(|frame| Incoming::from_frame(&frame)) {
                Ok(incoming) => {
                    callback_state.dispatch(&incoming);
                    ControlFlow::Continue(())
                },
                Err(ProtocolError::Disconnected) => {
                    debug!("proxy pipe for {} closed by daemon", callback_state.object_path);
                    ControlFlow::Break(())
                },
                Err(e) => {
                    warn!("bad frame on proxy pipe for {}: {}", callback_state.object_path, e);
                    ControlFlow::Continue(())
                },
            }
        });

        *self.attachment.borrow_mut() = Some(Attachment {
            ctx: ctx.clone(),
            source,
            pipe_id,
        });
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.borrow().is_some()
    }

    /// 撤销专用管道，之后该代理的信号回到共享 socket
    pub fn detach(&self) {
        let Some(attachment) = self.attachment.borrow_mut().take() else {
            return;
        };
        attachment.ctx.remove_source(attachment.source);
        if let Err(e) = self.state.connection.remove_proxy_signal_fd(
            &self.state.object_path,
            &self.state.interface,
            attachment.pipe_id,
        ) {
            debug!("failed to remove proxy pipe {}: {}", attachment.pipe_id, e);
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.detach();
    }
}
