//! 帧编解码
//!
//! 每个帧 = 1 字节标签 + 4 字节小端长度 + 恰好 `length` 字节的负载。
//!
//! # 读写约定
//!
//! - 写：整帧先拼接到一个缓冲区，再用 `write_all` 写出；部分写入在内部重试，
//!   直到写完或描述符出错，调用方看到的是原子的一次写入。
//! - 读：循环读取直到收满 `length` 字节；任何位置的 EOF 都视为对端断开
//!   （[`ProtocolError::Disconnected`]），而不是解析错误。
//! - 读取从不超出当前帧的边界，因此紧跟在帧后的、携带 `SCM_RIGHTS`
//!   附属数据的字节不会被普通 `read` 吞掉。

use crate::error::ProtocolError;
use crate::message::{ClientMessage, ServerMessage};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};

/// 帧头长度（标签 1 字节 + 长度 4 字节）
pub const FRAME_HEADER_LEN: usize = 5;

/// 单帧负载上限（16 MiB）
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// 一个完整的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// 编码负载并构造帧
    pub fn new<T: Serialize + ?Sized>(tag: impl Into<u8>, payload: &T) -> Result<Self, ProtocolError> {
        let payload = bincode::serialize(payload)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            tag: tag.into(),
            payload,
        })
    }

    /// 解码负载
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// 按客户端 → 守护进程方向解析标签
    pub fn client_message(&self) -> Result<ClientMessage, ProtocolError> {
        ClientMessage::from_tag(self.tag)
    }

    /// 按守护进程 → 客户端方向解析标签
    pub fn server_message(&self) -> Result<ServerMessage, ProtocolError> {
        ServerMessage::from_tag(self.tag)
    }

    /// 序列化为线上字节（帧头 + 负载）
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.push(self.tag);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// 编码一个帧为线上字节
///
/// 信号广播时只编码一次，然后把同一份字节写到每个目标。
pub fn encode_frame<T: Serialize + ?Sized>(
    tag: impl Into<u8>,
    payload: &T,
) -> Result<Vec<u8>, ProtocolError> {
    Ok(Frame::new(tag, payload)?.to_bytes())
}

/// 编码并写出一个帧
pub fn write_frame<W: Write + ?Sized, T: Serialize + ?Sized>(
    writer: &mut W,
    tag: impl Into<u8>,
    payload: &T,
) -> Result<(), ProtocolError> {
    let bytes = encode_frame(tag, payload)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// 读取一个完整帧
///
/// # 返回
/// - `Ok(Frame)`: 完整帧
/// - `Err(ProtocolError::Disconnected)`: 帧头或负载读取中遇到 EOF
/// - `Err(ProtocolError::PayloadTooLarge)`: 长度字段超过 [`MAX_PAYLOAD_LEN`]
/// - `Err(ProtocolError::Io)`: 其他 IO 错误（包括读超时）
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;

    let tag = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    Ok(Frame { tag, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::MethodCall;
    use crate::value::Value;
    use proptest::prelude::*;
    use std::io::{self, Cursor};

    /// 每次最多写入 3 字节的写端，用于验证部分写入的重试
    struct Trickle {
        out: Vec<u8>,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(3);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// 每次最多读出 2 字节的读端
    struct Dribble<'a> {
        data: &'a [u8],
    }

    impl Read for Dribble<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(2).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn sample_call() -> MethodCall {
        MethodCall {
            object_path: "/de/gsi/saftlib/tr0".to_string(),
            sender: ":42.1".to_string(),
            interface: "de.gsi.saftlib.TimingReceiver".to_string(),
            member: "InjectEvent".to_string(),
            args: Value::tuple([Value::from(0x1234u64), Value::from(7u64)]),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode_frame(ClientMessage::MethodCall, &sample_call()).unwrap();
        assert_eq!(bytes[0], 0x02);
        let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(len, bytes.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn test_partial_writes_and_reads() {
        let mut sink = Trickle { out: Vec::new() };
        write_frame(&mut sink, ClientMessage::MethodCall, &sample_call()).unwrap();

        let mut source = Dribble { data: &sink.out };
        let frame = read_frame(&mut source).unwrap();
        assert_eq!(frame.client_message().unwrap(), ClientMessage::MethodCall);
        assert_eq!(frame.decode::<MethodCall>().unwrap(), sample_call());
    }

    #[test]
    fn test_eof_before_header_is_disconnect() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            read_frame(&mut empty),
            Err(ProtocolError::Disconnected)
        ));
    }

    #[test]
    fn test_eof_inside_payload_is_disconnect() {
        let bytes = encode_frame(ServerMessage::MethodReply, &Value::from("truncated")).unwrap();
        let mut cut = Cursor::new(bytes[..bytes.len() - 2].to_vec());
        assert!(matches!(read_frame(&mut cut), Err(ProtocolError::Disconnected)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = vec![0x82u8];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_reader_stops_at_frame_boundary() {
        let mut bytes = encode_frame(ClientMessage::CtlHello, &()).unwrap();
        bytes.push(0xEE);
        let mut cursor = Cursor::new(bytes);
        let frame = read_frame(&mut cursor).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(cursor.position(), FRAME_HEADER_LEN as u64);
    }

    proptest! {
        /// 在任意位置截断的帧都报告为断开，而不是解析错误
        #[test]
        fn prop_truncation_is_disconnect(
            member in "[A-Za-z]{1,24}",
            args in prop::collection::vec(any::<i64>(), 0..16),
            cut_seed in any::<usize>(),
        ) {
            let call = MethodCall {
                member,
                args: Value::Array(args.into_iter().map(Value::from).collect()),
                ..sample_call()
            };
            let bytes = encode_frame(ClientMessage::MethodCall, &call).unwrap();
            let cut = cut_seed % bytes.len();
            let mut cursor = Cursor::new(bytes[..cut].to_vec());
            prop_assert!(matches!(
                read_frame(&mut cursor),
                Err(ProtocolError::Disconnected)
            ));
        }
    }
}
