//! 命令行参数与 [`Value`] 之间的转换
//!
//! 参数可带类型前缀：`u8:` `i16:` `u16:` `i32:` `u32:` `i64:` `u64:` `f:` `b:` `s:`。
//! 不带前缀时，能解析为整数的按 `Int64`，`true`/`false` 按 `Bool`，其他按字符串。

use saftbus::Value;
use std::fmt::Write;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid argument {input:?}: {reason}")]
pub struct ValueArgError {
    input: String,
    reason: String,
}

pub fn parse_value(input: &str) -> Result<Value, ValueArgError> {
    let fail = |reason: &dyn std::fmt::Display| ValueArgError {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let Some((prefix, rest)) = input.split_once(':') else {
        return Ok(untyped(input));
    };
    let value = match prefix {
        "u8" => Value::Byte(rest.parse().map_err(|e| fail(&e))?),
        "i16" => Value::Int16(rest.parse().map_err(|e| fail(&e))?),
        "u16" => Value::UInt16(rest.parse().map_err(|e| fail(&e))?),
        "i32" => Value::Int32(rest.parse().map_err(|e| fail(&e))?),
        "u32" => Value::UInt32(rest.parse().map_err(|e| fail(&e))?),
        "i64" => Value::Int64(rest.parse().map_err(|e| fail(&e))?),
        "u64" => Value::UInt64(rest.parse().map_err(|e| fail(&e))?),
        "f" => Value::Double(rest.parse().map_err(|e| fail(&e))?),
        "b" => Value::Bool(rest.parse().map_err(|e| fail(&e))?),
        "s" => Value::Str(rest.to_string()),
        // 不认识的前缀（例如对象路径里的冒号）整体按字符串
        _ => untyped(input),
    };
    Ok(value)
}

fn untyped(input: &str) -> Value {
    if let Ok(n) = input.parse::<i64>() {
        return Value::Int64(n);
    }
    match input {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::from(input),
    }
}

/// 单行可读形式
pub fn render(value: &Value) -> String {
    let mut out = String::new();
    render_into(&mut out, value);
    out
}

fn render_into(out: &mut String, value: &Value) {
    let _ = match value {
        Value::Unit => write!(out, "()"),
        Value::Bool(v) => write!(out, "{}", v),
        Value::Byte(v) => write!(out, "{}", v),
        Value::Int16(v) => write!(out, "{}", v),
        Value::UInt16(v) => write!(out, "{}", v),
        Value::Int32(v) => write!(out, "{}", v),
        Value::UInt32(v) => write!(out, "{}", v),
        Value::Int64(v) => write!(out, "{}", v),
        Value::UInt64(v) => write!(out, "{}", v),
        Value::Double(v) => write!(out, "{}", v),
        Value::Str(v) => write!(out, "{:?}", v),
        Value::Array(items) => {
            out.push('[');
            render_seq(out, items);
            out.push(']');
            Ok(())
        },
        Value::Tuple(items) => {
            out.push('(');
            render_seq(out, items);
            out.push(')');
            Ok(())
        },
        Value::Map(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{:?}: ", key);
                render_into(out, item);
            }
            out.push('}');
            Ok(())
        },
    };
}

fn render_seq(out: &mut String, items: &[Value]) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        render_into(out, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_prefixed() {
        assert_eq!(parse_value("u32:42"), Ok(Value::UInt32(42)));
        assert_eq!(parse_value("i16:-7"), Ok(Value::Int16(-7)));
        assert_eq!(parse_value("f:0.5"), Ok(Value::Double(0.5)));
        assert_eq!(parse_value("b:false"), Ok(Value::Bool(false)));
        assert_eq!(parse_value("s:12"), Ok(Value::from("12")));
        assert!(parse_value("u8:300").is_err());
        assert!(parse_value("b:yes").is_err());
    }

    #[test]
    fn test_parse_untyped() {
        assert_eq!(parse_value("-3"), Ok(Value::Int64(-3)));
        assert_eq!(parse_value("true"), Ok(Value::Bool(true)));
        assert_eq!(parse_value("MyInterface"), Ok(Value::from("MyInterface")));
        assert_eq!(parse_value("x:y"), Ok(Value::from("x:y")));
    }

    #[test]
    fn test_render_nested() {
        let mut map = BTreeMap::new();
        map.insert("Capacity".to_string(), Value::UInt32(42));
        let value = Value::tuple([
            Value::from("a"),
            Value::Array(vec![Value::Bool(true), Value::Unit]),
            Value::Map(map),
        ]);
        assert_eq!(render(&value), r#"("a", [true, ()], {"Capacity": 42})"#);
    }
}
