//! 池槽位 socket
//!
//! 每个槽位对应一个固定路径 `<base>NN`，同一时刻最多服务一个客户端：
//!
//! - 空闲：持有监听 socket，路径存在
//! - 活动：accept 之后立即关闭监听 socket 并删除路径文件，
//!   其他客户端无法再连到这个槽位，而是继续尝试下一个
//! - 断开后重新创建监听 socket（不复用旧描述符）
//!
//! 槽位本身不注册事件源，由 [`Connection`](super::Connection) 驱动。

use crate::fdpass;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::mainloop::SourceId;

/// 专用信号管道
#[derive(Debug)]
pub struct ProxyPipe {
    pub id: u64,
    file: File,
    /// 帧已写出一部分后等待剩余部分的上限（零表示一直等待）
    write_timeout: Duration,
}

/// 管道写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeWrite {
    Delivered,
    /// 管道已满（一个字节都没写出），本条信号被丢弃
    Dropped,
    /// 读端已关闭，或帧写到一半超时，管道需要关闭
    Broken,
}

impl ProxyPipe {
    /// 接管描述符并设为非阻塞（信号发射永远不会因慢客户端而阻塞）
    pub fn new(id: u64, fd: OwnedFd, write_timeout: Duration) -> io::Result<Self> {
        fdpass::set_nonblocking(fd.as_fd())?;
        Ok(Self {
            id,
            file: File::from(fd),
            write_timeout,
        })
    }

    /// 写一整帧
    ///
    /// 第一个字节之前遇到 `EAGAIN` 时丢弃整帧；一旦写出任何字节，
    /// 就等待管道可写直到整帧写完，否则读端的帧边界会被破坏。
    pub fn write_frame(&mut self, bytes: &[u8]) -> PipeWrite {
        let deadline = (!self.write_timeout.is_zero()).then(|| Instant::now() + self.write_timeout);
        let mut written = 0;
        while written < bytes.len() {
            match self.file.write(&bytes[written..]) {
                Ok(0) => {
                    debug!("proxy pipe {} accepted no bytes, closing it", self.id);
                    return PipeWrite::Broken;
                },
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if written == 0 {
                        warn!("proxy pipe {} is full, signal dropped", self.id);
                        return PipeWrite::Dropped;
                    }
                    if !self.wait_writable(deadline) {
                        warn!(
                            "proxy pipe {} stalled mid-frame ({} of {} bytes), closing it",
                            self.id,
                            written,
                            bytes.len()
                        );
                        return PipeWrite::Broken;
                    }
                },
                Err(e) => {
                    debug!("proxy pipe {} closed: {}", self.id, e);
                    return PipeWrite::Broken;
                },
            }
        }
        PipeWrite::Delivered
    }

    /// 等待管道可写；超过截止时间返回 `false`
    fn wait_writable(&self, deadline: Option<Instant>) -> bool {
        let timeout = match deadline {
            None => PollTimeout::NONE,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return false;
                }
                PollTimeout::from(left.as_millis().clamp(1, u16::MAX as u128) as u16)
            },
        };
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, timeout) {
            // POLLERR/POLLHUP 也算就绪，下一次 write 会报告 EPIPE
            Ok(n) => n > 0,
            Err(Errno::EINTR) => true,
            Err(e) => {
                debug!("poll on proxy pipe {} failed: {}", self.id, e);
                false
            },
        }
    }
}

type PipeKey = (String, String);

/// 一个已握手客户端的会话状态
#[derive(Debug)]
pub struct ClientSession {
    id: String,
    /// (接口, 路径) → 管道编号 → 管道
    pipes: BTreeMap<PipeKey, BTreeMap<u64, ProxyPipe>>,
}

impl ClientSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pipes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 添加专用管道；编号重复时返回 `false`（新描述符被关闭）
    pub fn add_pipe(&mut self, interface: &str, object_path: &str, pipe: ProxyPipe) -> bool {
        let bucket = self
            .pipes
            .entry((interface.to_string(), object_path.to_string()))
            .or_default();
        if bucket.contains_key(&pipe.id) {
            return false;
        }
        bucket.insert(pipe.id, pipe);
        true
    }

    pub fn remove_pipe(&mut self, interface: &str, object_path: &str, id: u64) -> bool {
        let key = (interface.to_string(), object_path.to_string());
        let Some(bucket) = self.pipes.get_mut(&key) else {
            return false;
        };
        let removed = bucket.remove(&id).is_some();
        if bucket.is_empty() {
            self.pipes.remove(&key);
        }
        removed
    }

    /// 关闭某个 (接口, 路径) 下的所有管道，返回数量
    pub fn remove_bucket(&mut self, interface: &str, object_path: &str) -> usize {
        self.pipes
            .remove(&(interface.to_string(), object_path.to_string()))
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub fn has_pipes_for(&self, interface: &str, object_path: &str) -> bool {
        self.pipes
            .contains_key(&(interface.to_string(), object_path.to_string()))
    }

    /// 把一帧写到某个 (接口, 路径) 下的所有管道，返回成功写入的数量
    ///
    /// 损坏的管道会被关闭并移除。
    pub fn write_pipes(&mut self, interface: &str, object_path: &str, bytes: &[u8]) -> usize {
        let key = (interface.to_string(), object_path.to_string());
        let Some(bucket) = self.pipes.get_mut(&key) else {
            return 0;
        };

        let mut delivered = 0;
        bucket.retain(|_, pipe| match pipe.write_frame(bytes) {
            PipeWrite::Delivered => {
                delivered += 1;
                true
            },
            PipeWrite::Dropped => true,
            PipeWrite::Broken => false,
        });
        if bucket.is_empty() {
            self.pipes.remove(&key);
        }
        delivered
    }

    pub fn pipe_count(&self) -> usize {
        self.pipes.values().map(BTreeMap::len).sum()
    }
}

/// 一个池槽位
pub struct Socket {
    index: usize,
    path: PathBuf,
    listener: Option<UnixListener>,
    stream: Option<Rc<UnixStream>>,
    session: Option<ClientSession>,
    source: Option<SourceId>,
}

impl Socket {
    pub fn new(index: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
            listener: None,
            stream: None,
            session: None,
            source: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 创建新的监听 socket（删除残留文件、绑定、放开权限）
    pub fn listen(&mut self) -> io::Result<RawFd> {
        self.listener = None;
        match fs::remove_file(&self.path) {
            Ok(()) => trace!("removed stale socket {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&self.path)?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(&self.path, Permissions::from_mode(0o777))?;

        let fd = listener.as_raw_fd();
        self.listener = Some(listener);
        Ok(fd)
    }

    /// 接受一个客户端
    ///
    /// # 返回
    /// - `Ok(Some(fd))`: 已接受，返回连接描述符；监听 socket 已关闭、路径已删除
    /// - `Ok(None)`: 暂无连接（或槽位不在监听）
    pub fn accept(&mut self, io_timeout: Duration) -> io::Result<Option<RawFd>> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(None);
        };
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };

        // 槽位被占用：其他客户端 connect 会失败并转向下一个槽位
        self.listener = None;
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("failed to unlink {}: {}", self.path.display(), e);
        }

        stream.set_nonblocking(false)?;
        let timeout = (!io_timeout.is_zero()).then_some(io_timeout);
        stream.set_write_timeout(timeout)?;
        stream.set_read_timeout(timeout)?;

        let fd = stream.as_raw_fd();
        self.stream = Some(Rc::new(stream));
        Ok(Some(fd))
    }

    /// 关闭当前连接，返回会话（如果已握手）
    pub fn close(&mut self) -> Option<ClientSession> {
        if let Some(stream) = self.stream.take() {
            // 其他地方可能还持有 Rc，先 shutdown 让它们的读写立即失败
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.session.take()
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn stream(&self) -> Option<Rc<UnixStream>> {
        self.stream.clone()
    }

    /// 写一帧到连接（整帧写完或出错）
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        match self.stream.as_deref() {
            Some(mut stream) => stream.write_all(bytes),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut ClientSession> {
        self.session.as_mut()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(ClientSession::id)
    }

    /// 记录握手后的会话 ID（重复握手只更新 ID，保留已有管道）
    pub fn set_session_id(&mut self, id: String) {
        match self.session.as_mut() {
            Some(session) => session.id = id,
            None => self.session = Some(ClientSession::new(id)),
        }
    }

    pub fn set_source(&mut self, source: SourceId) -> Option<SourceId> {
        self.source.replace(source)
    }

    pub fn take_source(&mut self) -> Option<SourceId> {
        self.source.take()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.listener.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}
