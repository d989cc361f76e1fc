//! # Saftbus
//!
//! 基于 Unix socket 的轻量进程间总线。一个守护进程持有对象注册表，
//! 客户端通过固定大小的 socket 池连接，进行同步方法调用、属性访问并接收信号。
//!
//! ## 模块
//!
//! - [`mainloop`]: 单线程 poll 事件循环（[`MainContext`] / [`MainLoop`]）
//! - [`server`]: socket 池、对象注册表、信号订阅与分发（[`Connection`]）
//! - [`client`]: 客户端连接与代理（[`ProxyConnection`] / [`Proxy`]）
//! - [`config`]: 路径、池大小与超时配置
//!
//! ## 线程模型
//!
//! 服务端完全单线程，所有回调都在事件循环线程上执行。
//! 客户端连接可在线程间共享，但一问一答的往返会被串行化。
//!
//! ## 示例
//!
//! ```rust,no_run
//! use saftbus::{BusConfig, Connection, MainContext, MainLoop, VTable};
//!
//! let ctx = MainContext::new();
//! let conn = Connection::bind(&ctx, BusConfig::from_env())?;
//! let echo = VTable::new().method("Echo", |_ctx, args| Ok(args.clone()));
//! conn.register_object("/demo", "demo.Echo", echo)?;
//! MainLoop::new(ctx).run();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod fdpass;
pub mod mainloop;
pub mod server;

pub use client::{Incoming, Proxy, ProxyConnection, SignalDispatcher};
pub use config::BusConfig;
pub use error::ServerError;
pub use mainloop::{MainContext, MainLoop, QuitHandle, SourceId};
pub use server::{CallContext, Connection, MethodInvocation, ObjectOps, SignalEvent, SignalFilter, VTable};

pub use saftbus_protocol::{BusError, ErrorKind, SignalMessage, Value};
