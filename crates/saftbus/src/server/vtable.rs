//! 对象操作表
//!
//! 注册到总线上的对象只需要提供三种操作：方法调用、属性读取、属性写入。
//! 总线不关心这些操作内部做什么（例如访问寄存器映射的硬件）。

use super::connection::Connection;
use saftbus_protocol::{BusError, Value};
use std::collections::HashMap;
use std::rc::Rc;

/// 一次调用的上下文
pub struct CallContext<'a> {
    connection: &'a Connection,
    sender: &'a str,
    object_path: &'a str,
    interface: &'a str,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        connection: &'a Connection,
        sender: &'a str,
        object_path: &'a str,
        interface: &'a str,
    ) -> Self {
        Self {
            connection,
            sender,
            object_path,
            interface,
        }
    }

    /// 所在的总线连接（用于在调用过程中发射信号）
    pub fn connection(&self) -> &'a Connection {
        self.connection
    }

    /// 调用方会话 ID（客户端自报，不做校验）
    pub fn sender(&self) -> &'a str {
        self.sender
    }

    pub fn object_path(&self) -> &'a str {
        self.object_path
    }

    pub fn interface(&self) -> &'a str {
        self.interface
    }

    /// 以被调用对象的路径和接口发射信号
    pub fn emit_signal(&self, name: &str, args: Value) -> usize {
        self.connection
            .emit_signal(self.object_path, self.interface, name, None, args)
    }
}

/// 方法调用载体
///
/// 被调用方填入返回值或错误；两者都没有填写时视为无返回值。
#[derive(Debug)]
pub struct MethodInvocation {
    method: String,
    args: Value,
    outcome: Option<Result<Value, BusError>>,
}

impl MethodInvocation {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
            outcome: None,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn return_value(&mut self, value: Value) {
        self.outcome = Some(Ok(value));
    }

    pub fn return_error(&mut self, error: BusError) {
        self.outcome = Some(Err(error));
    }

    /// 填入一个 `Result`
    pub fn complete(&mut self, result: Result<Value, BusError>) {
        self.outcome = Some(result);
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    /// 取出结果（未填写时为 `Value::Unit`）
    pub fn into_result(self) -> Result<Value, BusError> {
        self.outcome.unwrap_or(Ok(Value::Unit))
    }
}

/// 对象操作三元组
pub trait ObjectOps {
    /// 方法调用
    fn method_call(&self, ctx: &CallContext<'_>, invocation: &mut MethodInvocation);

    /// 属性读取
    fn get_property(&self, _ctx: &CallContext<'_>, name: &str) -> Result<Value, BusError> {
        Err(BusError::unknown_property(name))
    }

    /// 属性写入
    fn set_property(&self, _ctx: &CallContext<'_>, name: &str, _value: Value) -> Result<(), BusError> {
        Err(BusError::unknown_property(name))
    }
}

impl<T: ObjectOps + ?Sized> ObjectOps for Rc<T> {
    fn method_call(&self, ctx: &CallContext<'_>, invocation: &mut MethodInvocation) {
        (**self).method_call(ctx, invocation)
    }

    fn get_property(&self, ctx: &CallContext<'_>, name: &str) -> Result<Value, BusError> {
        (**self).get_property(ctx, name)
    }

    fn set_property(&self, ctx: &CallContext<'_>, name: &str, value: Value) -> Result<(), BusError> {
        (**self).set_property(ctx, name, value)
    }
}

type MethodFn = Box<dyn Fn(&CallContext<'_>, &Value) -> Result<Value, BusError>>;
type GetterFn = Box<dyn Fn(&CallContext<'_>) -> Result<Value, BusError>>;
type SetterFn = Box<dyn Fn(&CallContext<'_>, Value) -> Result<(), BusError>>;

struct Property {
    get: GetterFn,
    set: Option<SetterFn>,
}

/// 基于闭包的操作表
///
/// ```rust
/// use saftbus::server::VTable;
/// use saftbus_protocol::{BusError, Value};
///
/// let vtable = VTable::new()
///     .method("Echo", |_ctx, args| Ok(args.clone()))
///     .method("Fail", |_ctx, _args| Err(BusError::invalid_args("always")))
///     .property("Capacity", |_ctx| Ok(Value::from(42u32)));
/// assert!(vtable.has_method("Echo"));
/// assert!(vtable.has_property("Capacity"));
/// ```
#[derive(Default)]
pub struct VTable {
    methods: HashMap<String, MethodFn>,
    properties: HashMap<String, Property>,
}

impl VTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext<'_>, &Value) -> Result<Value, BusError> + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }

    /// 只读属性
    pub fn property<G>(mut self, name: impl Into<String>, get: G) -> Self
    where
        G: Fn(&CallContext<'_>) -> Result<Value, BusError> + 'static,
    {
        self.properties.insert(
            name.into(),
            Property {
                get: Box::new(get),
                set: None,
            },
        );
        self
    }

    /// 可写属性
    pub fn writable_property<G, S>(mut self, name: impl Into<String>, get: G, set: S) -> Self
    where
        G: Fn(&CallContext<'_>) -> Result<Value, BusError> + 'static,
        S: Fn(&CallContext<'_>, Value) -> Result<(), BusError> + 'static,
    {
        self.properties.insert(
            name.into(),
            Property {
                get: Box::new(get),
                set: Some(Box::new(set)),
            },
        );
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }
}

impl ObjectOps for VTable {
    fn method_call(&self, ctx: &CallContext<'_>, invocation: &mut MethodInvocation) {
        let result = match self.methods.get(invocation.method()) {
            Some(f) => f(ctx, invocation.args()),
            None => Err(BusError::unknown_method(invocation.method())),
        };
        invocation.complete(result);
    }

    fn get_property(&self, ctx: &CallContext<'_>, name: &str) -> Result<Value, BusError> {
        match self.properties.get(name) {
            Some(prop) => (prop.get)(ctx),
            None => Err(BusError::unknown_property(name)),
        }
    }

    fn set_property(&self, ctx: &CallContext<'_>, name: &str, value: Value) -> Result<(), BusError> {
        match self.properties.get(name) {
            Some(Property { set: Some(set), .. }) => set(ctx, value),
            Some(_) => Err(BusError::access_denied(format!("property {} is read-only", name))),
            None => Err(BusError::unknown_property(name)),
        }
    }
}
