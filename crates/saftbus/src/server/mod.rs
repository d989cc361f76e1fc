//! 服务端：socket 池、对象注册表、信号订阅与消息分发

mod connection;
mod registry;
mod socket;
mod stats;
mod subscription;
mod vtable;

pub use connection::{Connection, Dispatch};
pub use registry::{ObjectRegistry, Registration};
pub use socket::{ClientSession, PipeWrite, ProxyPipe, Socket};
pub use stats::Statistics;
pub use subscription::{SignalCallback, SignalEvent, SignalFilter, SubscriptionId, SubscriptionTable};
pub use vtable::{CallContext, MethodInvocation, ObjectOps, VTable};
