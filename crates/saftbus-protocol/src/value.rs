//! 通用参数容器
//!
//! [`Value`] 是方法参数、返回值、属性值和信号参数共用的带标签联合体。
//! 总线本身不解释其内容，只负责编码、成帧和路由。

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 带标签的通用值
///
/// # 编码
///
/// 使用 bincode 编码为连续字节缓冲区，[`Value::encoded_len`] 返回编码后的字节数。
///
/// # 示例
///
/// ```rust
/// use saftbus_protocol::Value;
///
/// let args = Value::tuple([Value::from("MyInterface"), Value::from("Capacity")]);
/// let bytes = args.to_bytes().unwrap();
/// assert_eq!(Value::from_bytes(&bytes).unwrap(), args);
/// assert_eq!(args.arg0_str(), Some("MyInterface"));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// 空值（无返回值的方法）
    #[default]
    Unit,
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    /// 同类元素序列
    Array(Vec<Value>),
    /// 定长异构序列（方法参数列表）
    Tuple(Vec<Value>),
    /// 字符串键字典（属性集合）
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// 由任意值序列构造元组
    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    /// 编码为字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// 从字节解码
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// 编码后的字节数
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(0)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 以 i64 读取任意有符号/无符号整数（超出范围的 u64 返回 None）
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::UInt16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// 以 u64 读取任意非负整数
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Byte(v) => Some(v.into()),
            Value::UInt16(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::UInt64(v) => Some(v),
            Value::Int16(v) => u64::try_from(v).ok(),
            Value::Int32(v) => u64::try_from(v).ok(),
            Value::Int64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// 元组或数组的元素切片
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// 元组/数组中第 `index` 个元素
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.as_slice().and_then(|items| items.get(index))
    }

    /// 第一个参数的字符串值（信号订阅的 arg0 过滤使用）
    ///
    /// 对元组取第一个元素；对单个字符串直接返回。
    pub fn arg0_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => self.get(0).and_then(Value::as_str),
        }
    }

    /// 类型名（错误消息使用）
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Tuple(_) => "tuple",
            Value::Map(_) => "map",
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening() {
        assert_eq!(Value::Byte(7).as_i64(), Some(7));
        assert_eq!(Value::Int16(-3).as_i64(), Some(-3));
        assert_eq!(Value::UInt32(42).as_u64(), Some(42));
        assert_eq!(Value::Int32(-1).as_u64(), None);
        assert_eq!(Value::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(Value::Str("1".into()).as_i64(), None);
    }

    #[test]
    fn test_arg0() {
        let v = Value::tuple([Value::from("owner"), Value::from(3u32)]);
        assert_eq!(v.arg0_str(), Some("owner"));
        assert_eq!(Value::from("direct").arg0_str(), Some("direct"));
        assert_eq!(Value::tuple([Value::from(1i32)]).arg0_str(), None);
        assert_eq!(Value::Unit.arg0_str(), None);
    }

    #[test]
    fn test_nested_container_bytes() {
        let mut props = BTreeMap::new();
        props.insert("Capacity".to_string(), Value::from(42u32));
        props.insert("Name".to_string(), Value::from("tr0"));
        let v = Value::tuple([
            Value::from("de.gsi.saftlib.TimingReceiver"),
            Value::Map(props),
            Value::Array(vec![Value::from(1.5f64), Value::from(-2.0f64)]),
        ]);

        let bytes = v.to_bytes().unwrap();
        assert_eq!(bytes.len(), v.encoded_len());
        assert_eq!(Value::from_bytes(&bytes).unwrap(), v);
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let bytes = Value::from("hello").to_bytes().unwrap();
        let err = Value::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(_)), "unexpected error: {err}");
    }
}
