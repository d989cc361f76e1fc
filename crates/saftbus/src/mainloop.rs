//! 单线程协作式事件循环
//!
//! [`MainContext`] 持有一组动态变化的 [`Source`]，每轮迭代：
//!
//! 1. 把上一轮缓冲的新增/移除操作合并进活动集合
//! 2. 收集所有 source 的描述符和最短超时
//! 3. 阻塞在 `poll()` 中
//! 4. 依次调用每个 source 的 `dispatch`，返回 `ControlFlow::Break` 的 source
//!    在本轮结束时移出活动集合
//!
//! # 动态修改
//!
//! 回调中调用 [`MainContext::add_source`] / [`MainContext::remove_source`] 不会修改
//! 正在遍历的集合：新增在下一轮开始时才生效；移除同样在下一轮生效，
//! 但本轮内已被移除的 source 不会再被 dispatch（避免对已关闭的描述符回调）。
//!
//! # 定时器
//!
//! 定时器以“剩余时间”计数，每轮减去两次 dispatch 之间实际流逝的时间，
//! 而不是固定步长，因为 `poll()` 的实际等待时间本身是可变的。
//!
//! # 线程模型
//!
//! `MainContext` 基于 `Rc`，不可跨线程；服务端的所有对象分发、信号发射和
//! socket 生命周期切换都发生在运行它的线程上，因此相关表格不需要加锁。

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

pub use nix::poll::PollFlags as IoCondition;

/// Source 句柄（单调递增，不复用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

/// 一个待监听的描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watch {
    pub fd: RawFd,
    pub interest: PollFlags,
}

/// 事件源
///
/// 每个 source 可以贡献零个或多个描述符，以及一个可选的最长等待时间。
pub trait Source {
    /// poll 之前调用
    ///
    /// 把需要监听的描述符追加到 `watches`，返回本 source 能接受的最长等待时间
    /// （`None` 表示不限制）。
    fn prepare(&mut self, watches: &mut Vec<Watch>) -> Option<Duration>;

    /// poll 之后调用（每轮都会调用）
    ///
    /// - `ready`: 与 `prepare` 登记顺序一致的 revents，未就绪为空集合
    /// - `elapsed`: 距本 source 上次 dispatch（或加入）的实际时间
    fn dispatch(&mut self, ready: &[PollFlags], elapsed: Duration) -> ControlFlow<()>;
}

/// 描述符就绪回调
pub struct IoSource<F> {
    fd: RawFd,
    interest: PollFlags,
    callback: F,
}

impl<F> IoSource<F>
where
    F: FnMut(PollFlags) -> ControlFlow<()>,
{
    pub fn new(fd: RawFd, interest: PollFlags, callback: F) -> Self {
        Self {
            fd,
            interest,
            callback,
        }
    }
}

impl<F> Source for IoSource<F>
where
    F: FnMut(PollFlags) -> ControlFlow<()>,
{
    fn prepare(&mut self, watches: &mut Vec<Watch>) -> Option<Duration> {
        watches.push(Watch {
            fd: self.fd,
            interest: self.interest,
        });
        None
    }

    fn dispatch(&mut self, ready: &[PollFlags], _elapsed: Duration) -> ControlFlow<()> {
        match ready.first() {
            Some(flags) if !flags.is_empty() => (self.callback)(*flags),
            _ => ControlFlow::Continue(()),
        }
    }
}

/// 周期定时器
pub struct TimeoutSource<F> {
    interval: Duration,
    remaining: Duration,
    callback: F,
}

impl<F> TimeoutSource<F>
where
    F: FnMut() -> ControlFlow<()>,
{
    pub fn new(interval: Duration, callback: F) -> Self {
        Self {
            interval,
            remaining: interval,
            callback,
        }
    }

    /// 距下次触发的剩余时间
    pub fn remaining(&self) -> Duration {
        self.remaining
    }
}

impl<F> Source for TimeoutSource<F>
where
    F: FnMut() -> ControlFlow<()>,
{
    fn prepare(&mut self, _watches: &mut Vec<Watch>) -> Option<Duration> {
        Some(self.remaining)
    }

    fn dispatch(&mut self, _ready: &[PollFlags], elapsed: Duration) -> ControlFlow<()> {
        self.remaining = self.remaining.saturating_sub(elapsed);
        if !self.remaining.is_zero() {
            return ControlFlow::Continue(());
        }
        self.remaining = self.interval;
        (self.callback)()
    }
}

struct SourceEntry {
    id: SourceId,
    source: Box<dyn Source>,
    last_seen: Instant,
}

#[derive(Default)]
struct ContextInner {
    next_id: Cell<u64>,
    active: RefCell<Vec<SourceEntry>>,
    pending_add: RefCell<Vec<SourceEntry>>,
    pending_remove: RefCell<HashSet<SourceId>>,
}

/// 事件循环上下文（可廉价克隆的句柄）
#[derive(Clone, Default)]
pub struct MainContext {
    inner: Rc<ContextInner>,
}

impl MainContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个 source（下一轮迭代开始时生效）
    pub fn add_source(&self, source: impl Source + 'static) -> SourceId {
        let id = SourceId(self.inner.next_id.get() + 1);
        self.inner.next_id.set(id.0);
        self.inner.pending_add.borrow_mut().push(SourceEntry {
            id,
            source: Box::new(source),
            last_seen: Instant::now(),
        });
        id
    }

    /// 监听描述符
    ///
    /// `fd` 的生命周期由调用方保证：描述符关闭前必须先移除 source
    /// （或由回调返回 `ControlFlow::Break`）。
    pub fn add_io<F>(&self, fd: RawFd, interest: PollFlags, callback: F) -> SourceId
    where
        F: FnMut(PollFlags) -> ControlFlow<()> + 'static,
    {
        self.add_source(IoSource::new(fd, interest, callback))
    }

    /// 周期定时器
    pub fn add_timeout<F>(&self, interval: Duration, callback: F) -> SourceId
    where
        F: FnMut() -> ControlFlow<()> + 'static,
    {
        self.add_source(TimeoutSource::new(interval, callback))
    }

    /// 移除 source（下一轮迭代开始时生效，本轮内不再 dispatch）
    pub fn remove_source(&self, id: SourceId) {
        self.inner.pending_remove.borrow_mut().insert(id);
    }

    /// 活动 + 待加入的 source 数量（不含已标记移除的）
    pub fn source_count(&self) -> usize {
        let removed = self.inner.pending_remove.borrow();
        let active = self.inner.active.borrow();
        let pending = self.inner.pending_add.borrow();
        active
            .iter()
            .chain(pending.iter())
            .filter(|e| !removed.contains(&e.id))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.source_count() == 0
    }

    /// 合并缓冲的新增/移除操作
    fn splice(&self, now: Instant) {
        let removed: HashSet<SourceId> = std::mem::take(&mut *self.inner.pending_remove.borrow_mut());
        let added: Vec<SourceEntry> = std::mem::take(&mut *self.inner.pending_add.borrow_mut());

        let mut active = self.inner.active.borrow_mut();
        if !removed.is_empty() {
            active.retain(|e| !removed.contains(&e.id));
        }
        for mut entry in added {
            if removed.contains(&entry.id) {
                continue;
            }
            entry.last_seen = now;
            active.push(entry);
        }
    }

    /// 执行一轮迭代
    ///
    /// # 参数
    /// - `may_block`: 为 `false` 时 poll 立即返回
    ///
    /// # 返回
    /// 是否有描述符就绪
    pub fn iteration(&self, may_block: bool) -> bool {
        self.splice(Instant::now());

        // 取出活动集合：回调期间的新增/移除只会写入缓冲区
        let mut active = std::mem::take(&mut *self.inner.active.borrow_mut());
        if active.is_empty() {
            trace!("main context has no sources");
            return false;
        }

        let mut watches = Vec::new();
        let mut ranges = Vec::with_capacity(active.len());
        let mut timeout: Option<Duration> = None;
        for entry in active.iter_mut() {
            let start = watches.len();
            let wait = entry.source.prepare(&mut watches);
            ranges.push(start..watches.len());
            timeout = match (timeout, wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        let poll_timeout = if !may_block {
            PollTimeout::ZERO
        } else {
            match timeout {
                None => PollTimeout::NONE,
                // 向上取整到毫秒，避免亚毫秒的剩余时间导致空转
                Some(d) => PollTimeout::from(d.as_micros().div_ceil(1000).min(u16::MAX as u128) as u16),
            }
        };

        let revents = {
            // SAFETY: 描述符在对应 source 存活期间有效（见 `add_io` 的约定）
            let mut fds: Vec<PollFd> = watches
                .iter()
                .map(|w| PollFd::new(unsafe { BorrowedFd::borrow_raw(w.fd) }, w.interest))
                .collect();
            match poll(&mut fds, poll_timeout) {
                Ok(_) => fds
                    .iter()
                    .map(|p| p.revents().unwrap_or(PollFlags::empty()))
                    .collect(),
                Err(Errno::EINTR) => vec![PollFlags::empty(); watches.len()],
                Err(e) => {
                    warn!("poll failed: {}", e);
                    vec![PollFlags::empty(); watches.len()]
                },
            }
        };

        let now = Instant::now();
        let any_ready = revents.iter().any(|f: &PollFlags| !f.is_empty());
        let mut keep = Vec::with_capacity(active.len());
        for (mut entry, range) in active.drain(..).zip(ranges) {
            if self.inner.pending_remove.borrow().contains(&entry.id) {
                continue;
            }
            let elapsed = now.saturating_duration_since(entry.last_seen);
            entry.last_seen = now;
            match entry.source.dispatch(&revents[range], elapsed) {
                ControlFlow::Continue(()) => keep.push(entry),
                ControlFlow::Break(()) => trace!("source {:?} finished", entry.id),
            }
        }

        // 回调期间 active 一直为空，直接放回
        *self.inner.active.borrow_mut() = keep;
        any_ready
    }
}

/// 主循环
///
/// ```rust
/// use saftbus::mainloop::{MainContext, MainLoop};
/// use std::ops::ControlFlow;
/// use std::time::Duration;
///
/// let ctx = MainContext::new();
/// let main_loop = MainLoop::new(ctx.clone());
/// let quit = main_loop.quit_handle();
/// ctx.add_timeout(Duration::from_millis(5), move || {
///     quit.quit();
///     ControlFlow::Break(())
/// });
/// main_loop.run();
/// ```
pub struct MainLoop {
    ctx: MainContext,
    running: Rc<Cell<bool>>,
}

/// 可在回调中捕获的退出句柄
#[derive(Clone)]
pub struct QuitHandle {
    running: Rc<Cell<bool>>,
}

impl QuitHandle {
    pub fn quit(&self) {
        self.running.set(false);
    }
}

impl MainLoop {
    pub fn new(ctx: MainContext) -> Self {
        Self {
            ctx,
            running: Rc::new(Cell::new(false)),
        }
    }

    pub fn context(&self) -> &MainContext {
        &self.ctx
    }

    pub fn quit_handle(&self) -> QuitHandle {
        QuitHandle {
            running: self.running.clone(),
        }
    }

    pub fn quit(&self) {
        self.running.set(false);
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// 运行直到 `quit()` 或上下文中不再有任何 source
    pub fn run(&self) {
        self.running.set(true);
        while self.running.get() {
            if self.ctx.is_empty() {
                warn!("main loop has nothing left to watch, stopping");
                break;
            }
            self.ctx.iteration(true);
        }
        self.running.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_timeout_fires_after_elapsed_time() {
        let ctx = MainContext::new();
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();
        ctx.add_timeout(Duration::from_millis(20), move || {
            counter.set(counter.get() + 1);
            ControlFlow::Continue(())
        });

        let start = Instant::now();
        while fired.get() == 0 {
            ctx.iteration(true);
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_timeout_break_removes_source() {
        let ctx = MainContext::new();
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();
        ctx.add_timeout(Duration::from_millis(1), move || {
            counter.set(counter.get() + 1);
            ControlFlow::Break(())
        });

        for _ in 0..5 {
            ctx.iteration(true);
        }
        assert_eq!(fired.get(), 1);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_io_source_readable() {
        let ctx = MainContext::new();
        let (mut a, b) = UnixStream::pair().unwrap();
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        ctx.add_io(b.as_raw_fd(), PollFlags::POLLIN, move |events| {
            assert!(events.contains(PollFlags::POLLIN));
            flag.set(true);
            ControlFlow::Break(())
        });

        // 无数据：非阻塞迭代不触发
        assert!(!ctx.iteration(false));
        assert!(!seen.get());

        a.write_all(b"x").unwrap();
        assert!(ctx.iteration(true));
        assert!(seen.get());
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_source_added_during_dispatch_waits_for_next_iteration() {
        let ctx = MainContext::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let inner_ctx = ctx.clone();
        let log = order.clone();
        ctx.add_timeout(Duration::ZERO, move || {
            log.borrow_mut().push("outer");
            let log2 = log.clone();
            inner_ctx.add_timeout(Duration::ZERO, move || {
                log2.borrow_mut().push("inner");
                ControlFlow::Break(())
            });
            ControlFlow::Break(())
        });

        ctx.iteration(false);
        assert_eq!(*order.borrow(), vec!["outer"]);
        assert_eq!(ctx.source_count(), 1);

        ctx.iteration(false);
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_source_removed_during_dispatch_is_skipped() {
        let ctx = MainContext::new();
        let second_ran = Rc::new(Cell::new(false));

        // 第一个 source 移除第二个：同一轮内第二个不应再被 dispatch
        let victim = Rc::new(Cell::new(None::<SourceId>));
        let victim_ref = victim.clone();
        let remover_ctx = ctx.clone();
        ctx.add_timeout(Duration::ZERO, move || {
            if let Some(id) = victim_ref.get() {
                remover_ctx.remove_source(id);
            }
            ControlFlow::Break(())
        });
        let flag = second_ran.clone();
        let id = ctx.add_timeout(Duration::ZERO, move || {
            flag.set(true);
            ControlFlow::Continue(())
        });
        victim.set(Some(id));

        ctx.iteration(false);
        assert!(!second_ran.get());
        ctx.iteration(false);
        assert!(!second_ran.get());
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_earliest_timeout_bounds_poll() {
        let ctx = MainContext::new();
        ctx.add_timeout(Duration::from_secs(60), || ControlFlow::Continue(()));
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        ctx.add_timeout(Duration::from_millis(10), move || {
            flag.set(true);
            ControlFlow::Break(())
        });

        let start = Instant::now();
        while !fired.get() {
            ctx.iteration(true);
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_main_loop_quit() {
        let ctx = MainContext::new();
        let main_loop = MainLoop::new(ctx.clone());
        let quit = main_loop.quit_handle();
        let ticks = Rc::new(Cell::new(0u32));
        let counter = ticks.clone();
        ctx.add_timeout(Duration::from_millis(1), move || {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                quit.quit();
            }
            ControlFlow::Continue(())
        });

        main_loop.run();
        assert_eq!(ticks.get(), 3);
        assert!(!main_loop.is_running());
    }
}
