//! 信号广播、专用管道与客户端代理

mod common;

use common::TestBus;
use saftbus::{Incoming, MainContext, Proxy, ProxyConnection, SignalFilter, VTable, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn start_bus() -> TestBus {
    TestBus::start_with(4, |conn| {
        let vtable = VTable::new()
            .method("Echo", |_, args| Ok(args.clone()))
            .property("Capacity", |_| Ok(Value::from(42u32)));
        conn.register_object("/x", "MyInterface", vtable).unwrap();
    })
}

fn wait_signals(client: &ProxyConnection, count: usize) -> Vec<Incoming> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut signals = Vec::new();
    while signals.len() < count {
        assert!(Instant::now() < deadline, "expected {} signals, got {}", count, signals.len());
        signals.extend(client.take_signals());
        thread::sleep(Duration::from_millis(2));
    }
    signals
}

fn spin_until(ctx: &MainContext, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "main context made no progress");
        ctx.iteration(false);
        thread::sleep(Duration::from_millis(1));
    }
}

fn pipe_count(bus: &TestBus, session: &str) -> usize {
    let session = session.to_string();
    bus.with_connection(move |conn| conn.proxy_pipe_count(Some(&session)))
}

#[test]
fn test_broadcast_fan_out() {
    let bus = start_bus();
    let clients: Vec<_> = (0..3).map(|_| bus.connect()).collect();

    let delivered = bus.with_connection(|conn| {
        conn.emit_signal("/x", "MyInterface", "Tick", None, Value::from(5u32))
    });
    assert_eq!(delivered, 3);

    let received: Vec<Incoming> = clients
        .iter()
        .map(|client| {
            let mut signals = wait_signals(client, 1);
            assert_eq!(signals.len(), 1);
            signals.remove(0)
        })
        .collect();
    assert_eq!(received[0].signal.member, "Tick");
    assert_eq!(received[0].signal.args, Value::from(5u32));
    // 时间戳只打一次，所有接收者拿到相同的负载
    assert!(received.iter().all(|s| *s == received[0]));
}

#[test]
fn test_destination_limits_delivery() {
    let bus = start_bus();
    let a = bus.connect();
    let b = bus.connect();

    let target = b.session_id().to_string();
    let delivered = bus.with_connection(move |conn| {
        conn.emit_signal("/x", "MyInterface", "Private", Some(&target), Value::Unit)
    });
    assert_eq!(delivered, 1);

    let signals = wait_signals(&b, 1);
    assert_eq!(signals[0].signal.member, "Private");
    thread::sleep(Duration::from_millis(20));
    assert!(a.take_signals().is_empty());
}

#[test]
fn test_local_subscription_sees_daemon_sender() {
    let bus = start_bus();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    bus.with_connection(move |conn| {
        let filter = SignalFilter::new().sender("saftbus").member("Tick");
        conn.signal_subscribe(filter, move |event| {
            assert_eq!(event.object_path, "/x");
            counter.fetch_add(1, Ordering::SeqCst);
        });
    });

    // 没有客户端时信号只投递给本地订阅
    let delivered = bus.with_connection(|conn| {
        conn.emit_signal("/x", "MyInterface", "Tick", None, Value::Unit);
        conn.emit_signal("/x", "MyInterface", "Tock", None, Value::Unit)
    });
    assert_eq!(delivered, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_proxy_pipe_delivery_and_property_cache() {
    let bus = start_bus();
    let client = Arc::new(bus.connect());
    let ctx = MainContext::new();

    let proxy = Proxy::with_connection(Arc::clone(&client), "/x", "MyInterface");
    let ticks = Rc::new(RefCell::new(Vec::new()));
    let changes = Rc::new(RefCell::new(Vec::new()));
    {
        let ticks = Rc::clone(&ticks);
        proxy.connect_signal(move |signal| ticks.borrow_mut().push(signal.member.clone()));
        let changes = Rc::clone(&changes);
        proxy.connect_properties_changed(move |changed, _invalidated| {
            changes.borrow_mut().push(changed.clone());
        });
    }
    proxy.enable_property_cache(true);
    assert_eq!(proxy.get_property("Capacity").unwrap(), Value::UInt32(42));

    proxy.attach(&ctx).unwrap();
    assert!(proxy.is_attached());
    let session = client.session_id().to_string();
    bus.wait_for("proxy pipe", |bus| pipe_count(bus, &session) == 1);

    let delivered =
        bus.with_connection(|conn| conn.emit_signal("/x", "MyInterface", "Tick", None, Value::Unit));
    assert_eq!(delivered, 1);
    spin_until(&ctx, || ticks.borrow().len() == 1);
    // 走管道的信号不会再出现在 socket 上
    assert!(client.take_signals().is_empty());

    bus.with_connection(|conn| {
        let mut changed = BTreeMap::new();
        changed.insert("Capacity".to_string(), Value::from(43u32));
        conn.emit_properties_changed("/x", "MyInterface", changed, Vec::new())
    });
    spin_until(&ctx, || changes.borrow().len() == 1);
    assert_eq!(changes.borrow()[0].get("Capacity"), Some(&Value::UInt32(43)));
    // 服务端仍返回 42：读到 43 说明命中了缓存
    assert_eq!(proxy.get_property("Capacity").unwrap(), Value::UInt32(43));
    assert_eq!(ticks.borrow().len(), 1);

    proxy.detach();
    bus.wait_for("proxy pipe removed", |bus| pipe_count(bus, &session) == 0);

    bus.with_connection(|conn| conn.emit_signal("/x", "MyInterface", "Tock", None, Value::Unit));
    let signals = wait_signals(&client, 1);
    assert!(proxy.dispatch(&signals[0]));
    assert_eq!(*ticks.borrow(), vec!["Tick".to_string(), "Tock".to_string()]);
}

#[test]
fn test_watch_signals_on_shared_socket() {
    let bus = start_bus();
    let client = Arc::new(bus.connect());
    let ctx = MainContext::new();

    let proxy = Proxy::with_connection(Arc::clone(&client), "/x", "MyInterface");
    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = Rc::clone(&seen);
        proxy.connect_signal(move |signal| seen.borrow_mut().push(signal.args.clone()));
    }
    let dispatcher = proxy.dispatcher();
    let unmatched = Rc::new(RefCell::new(0));
    {
        let unmatched = Rc::clone(&unmatched);
        client.watch_signals(&ctx, move |incoming| {
            if !dispatcher.dispatch(incoming) {
                *unmatched.borrow_mut() += 1;
            }
        });
    }

    bus.with_connection(|conn| {
        conn.emit_signal("/x", "MyInterface", "Tick", None, Value::from(1u32));
        conn.emit_signal("/y", "MyInterface", "Tick", None, Value::from(2u32));
        conn.emit_signal("/x", "MyInterface", "Tick", None, Value::from(3u32));
    });
    spin_until(&ctx, || seen.borrow().len() == 2 && *unmatched.borrow() == 1);
    assert_eq!(*seen.borrow(), vec![Value::from(1u32), Value::from(3u32)]);

    // call_sync 期间到达的信号先入队，随后由 watch 取出
    bus.with_connection(|conn| {
        conn.emit_signal("/x", "MyInterface", "Tick", None, Value::from(4u32))
    });
    assert_eq!(
        client
            .call_sync("/x", "MyInterface", "Echo", Value::Unit, None)
            .unwrap(),
        Value::Unit
    );
    spin_until(&ctx, || seen.borrow().len() == 3);
}

#[test]
fn test_flight_time_reported_when_enabled() {
    let bus = start_bus();
    let client = Arc::new(bus.connect());
    assert!(client.set_statistics(true).unwrap());

    let proxy = Proxy::with_connection(Arc::clone(&client), "/x", "MyInterface");
    proxy.report_flight_time(true);

    bus.with_connection(|conn| conn.emit_signal("/x", "MyInterface", "Tick", None, Value::Unit));
    for incoming in wait_signals(&client, 1) {
        assert!(proxy.dispatch(&incoming));
    }

    let state = client.ctl_state().unwrap();
    assert_eq!(state.signals_emitted, 1);
    let samples: u64 = state.flight_time_histogram.iter().map(|(_, n)| n).sum();
    assert_eq!(samples, 1);
}
