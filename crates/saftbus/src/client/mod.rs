//! 客户端：到守护进程的连接与远程对象代理

mod proxy;
mod proxy_connection;

pub use proxy::{Proxy, SignalDispatcher};
pub use proxy_connection::{Incoming, ProxyConnection};
