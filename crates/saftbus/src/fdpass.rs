//! 描述符传递（`SCM_RIGHTS`）
//!
//! `SIGNAL_FD` 帧之后紧跟一个携带描述符的单字节消息。发送端用 `sendmsg`，
//! 接收端用 `recvmsg`；收到的描述符立即包装为 [`OwnedFd`]，任何出错路径上都会被关闭。

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, SockaddrStorage, UnixAddr, recvmsg, sendmsg,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// 携带描述符的占位字节
const MARKER: u8 = 0xFD;

/// 通过 `stream` 发送一个描述符
///
/// 内核会在接收进程中复制该描述符，发送方保留自己的副本。
pub fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> io::Result<()> {
    let data = [MARKER];
    let iov = [IoSlice::new(&data)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    loop {
        match sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(1) => return Ok(()),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("sendmsg wrote {} bytes (expected 1)", n),
                ));
            },
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// 从 `stream` 接收一个描述符
///
/// # 错误
/// - `UnexpectedEof`: 对端已关闭
/// - `InvalidData`: 消息中没有描述符
pub fn recv_fd(stream: &UnixStream) -> io::Result<OwnedFd> {
    let mut data = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let (bytes, received) = loop {
        let mut iov = [IoSliceMut::new(&mut data)];
        match recvmsg::<SockaddrStorage>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                let mut received: Vec<RawFd> = Vec::new();
                if let Ok(cmsgs) = msg.cmsgs() {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            received.extend(fds);
                        }
                    }
                }
                break (msg.bytes, received);
            },
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    };

    // SAFETY: 描述符刚由内核安装到本进程，尚无其他所有者
    let mut owned: Vec<OwnedFd> = received
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if bytes == 0 && owned.is_empty() {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    if owned.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected a file descriptor in ancillary data",
        ));
    }
    // 多余的描述符随 Vec 一起关闭
    Ok(owned.swap_remove(0))
}

/// 设置描述符为非阻塞模式
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl 只读写描述符标志，描述符在借用期间有效
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
