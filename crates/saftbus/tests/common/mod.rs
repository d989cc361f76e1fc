//! 集成测试共享工具：在后台线程上运行一个完整的服务端事件循环

#![allow(dead_code)]

use crossbeam_channel::{Sender, bounded, unbounded};
use saftbus::{BusConfig, Connection, MainContext, MainLoop, ProxyConnection};
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

type Command = Box<dyn FnOnce(&Rc<Connection>) + Send>;

/// 后台服务端
///
/// `Connection` 不能跨线程，测试通过 [`TestBus::with_connection`]
/// 把闭包投递到服务端线程上执行。
pub struct TestBus {
    pub config: BusConfig,
    commands: Sender<Command>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _dir: TempDir,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl TestBus {
    pub fn start(pool_size: usize) -> Self {
        Self::start_with(pool_size, |_| {})
    }

    /// 启动服务端；`setup` 在事件循环开始前于服务端线程上执行
    pub fn start_with<F>(pool_size: usize, setup: F) -> Self
    where
        F: FnOnce(&Rc<Connection>) + Send + 'static,
    {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::with_socket_base(dir.path().join("saftbus"))
            .pool_size(pool_size)
            .call_timeout(Some(Duration::from_secs(5)));

        let (commands, command_rx) = unbounded::<Command>();
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let config = config.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let main_loop = MainLoop::new(MainContext::new());
                let conn = match Connection::bind(main_loop.context(), config) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    },
                };
                setup(&conn);

                let quit = main_loop.quit_handle();
                let weak = Rc::downgrade(&conn);
                main_loop
                    .context()
                    .add_timeout(Duration::from_millis(2), move || {
                        if stop.load(Ordering::Acquire) {
                            quit.quit();
                            return ControlFlow::Break(());
                        }
                        if let Some(conn) = weak.upgrade() {
                            while let Ok(command) = command_rx.try_recv() {
                                command(&conn);
                            }
                        }
                        ControlFlow::Continue(())
                    });

                let _ = ready_tx.send(Ok(()));
                main_loop.run();
                drop(conn);
            })
        };

        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server thread did not start")
            .expect("server failed to bind");

        Self {
            config,
            commands,
            stop,
            thread: Some(thread),
            _dir: dir,
        }
    }

    /// 在服务端线程上执行闭包并取回结果
    pub fn with_connection<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Rc<Connection>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.commands
            .send(Box::new(move |conn| {
                let _ = tx.send(f(conn));
            }))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("server thread did not answer")
    }

    pub fn connect(&self) -> ProxyConnection {
        ProxyConnection::connect(&self.config).expect("failed to connect to test bus")
    }

    /// 轮询服务端状态直到条件成立
    pub fn wait_for<F>(&self, what: &str, mut check: F)
    where
        F: FnMut(&TestBus) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for TestBus {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
