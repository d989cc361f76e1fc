//! 守护进程主体
//!
//! 在单线程事件循环里运行一个 [`Connection`]，并在固定路径上注册一个
//! 内置对象，供客户端确认守护进程存活、查询版本和池状态。

use saftbus::{BusConfig, BusError, CallContext, Connection, MainContext, MainLoop, ServerError, VTable, Value};
use saftbus_protocol::PROTOCOL_VERSION;
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// 内置对象路径
pub const DAEMON_PATH: &str = "/de/gsi/saftbus";

/// 内置对象接口
pub const DAEMON_INTERFACE: &str = "de.gsi.saftbus.Daemon";

/// 检查退出标志的间隔
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub struct Daemon {
    main_loop: MainLoop,
    connection: Rc<Connection>,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    /// 绑定 socket 池并注册内置对象
    ///
    /// `shutdown` 被置位后，[`Daemon::run`] 在下一次检查时返回。
    pub fn new(config: BusConfig, shutdown: Arc<AtomicBool>) -> Result<Self, ServerError> {
        let main_loop = MainLoop::new(MainContext::new());
        let connection = Connection::bind(main_loop.context(), config)?;
        connection
            .register_object(DAEMON_PATH, DAEMON_INTERFACE, daemon_object())
            .map_err(|e| ServerError::Config(format!("cannot register {}: {}", DAEMON_PATH, e)))?;

        Ok(Self {
            main_loop,
            connection,
            shutdown,
        })
    }

    /// 运行事件循环直到收到退出请求
    pub fn run(&self) {
        let quit = self.main_loop.quit_handle();
        let shutdown = Arc::clone(&self.shutdown);
        self.main_loop.context().add_timeout(SHUTDOWN_POLL, move || {
            if shutdown.load(Ordering::Acquire) {
                quit.quit();
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        info!("saftbusd {} running", PROTOCOL_VERSION);
        self.main_loop.run();
        if !self.shutdown.load(Ordering::Acquire) {
            warn!("main loop stopped without a shutdown request");
        }
        info!(
            "saftbusd stopping ({} clients connected)",
            self.connection.active_sockets()
        );
    }
}

fn daemon_object() -> VTable {
    VTable::new()
        .method("Echo", |_, args| Ok(args.clone()))
        .method("Ping", |ctx, _| Ok(Value::from(format!("pong {}", ctx.sender()))))
        .method("ListObjects", |ctx, _| Ok(list_objects(ctx)))
        .method("EmitTestSignal", |ctx, args| {
            let name = args
                .arg0_str()
                .ok_or_else(|| BusError::invalid_args("expected (signal name, ...)"))?;
            let delivered = ctx.emit_signal(name, args.clone());
            Ok(Value::from(delivered as u32))
        })
        .property("Version", |_| Ok(Value::from(PROTOCOL_VERSION)))
        .property("PoolSize", |ctx| {
            Ok(Value::from(ctx.connection().config().pool_size as u32))
        })
        .property("ActiveClients", |ctx| {
            Ok(Value::from(ctx.connection().active_sockets() as u32))
        })
}

/// `[(id, interface, path)]`
fn list_objects(ctx: &CallContext<'_>) -> Value {
    let objects = ctx
        .connection()
        .status()
        .objects
        .into_iter()
        .map(|entry| {
            Value::tuple([
                Value::from(entry.id),
                Value::from(entry.interface),
                Value::from(entry.object_path),
            ])
        })
        .collect();
    Value::Array(objects)
}
