//! 信号订阅表
//!
//! 发射期间订阅表被遍历，而回调可能在遍历中取消订阅（包括取消自己）。
//! 因此发射期间的取消只做标记，等最外层发射结束后再统一清除。

use saftbus_protocol::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::warn;

/// 订阅句柄（单调递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// 投递给订阅者的信号
#[derive(Debug, Clone, Copy)]
pub struct SignalEvent<'a> {
    pub sender: &'a str,
    pub object_path: &'a str,
    pub interface: &'a str,
    pub member: &'a str,
    pub args: &'a Value,
}

/// 订阅过滤条件（`None` 表示不限制）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalFilter {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub object_path: Option<String>,
    pub arg0: Option<String>,
}

impl SignalFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn object_path(mut self, object_path: impl Into<String>) -> Self {
        self.object_path = Some(object_path.into());
        self
    }

    pub fn arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    pub fn matches(&self, event: &SignalEvent<'_>) -> bool {
        fn field(want: &Option<String>, got: &str) -> bool {
            want.as_deref().is_none_or(|w| w == got)
        }
        field(&self.sender, event.sender)
            && field(&self.interface, event.interface)
            && field(&self.member, event.member)
            && field(&self.object_path, event.object_path)
            && self
                .arg0
                .as_deref()
                .is_none_or(|w| event.args.arg0_str() == Some(w))
    }
}

pub type SignalCallback = Box<dyn FnMut(&SignalEvent<'_>)>;

struct Subscription {
    filter: SignalFilter,
    callback: Rc<RefCell<SignalCallback>>,
}

#[derive(Default)]
pub struct SubscriptionTable {
    next_id: u64,
    entries: BTreeMap<u64, Subscription>,
    /// 嵌套发射深度
    emitting: u32,
    /// 发射期间被取消、待清除的句柄
    erased: BTreeSet<u64>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, filter: SignalFilter, callback: F) -> SubscriptionId
    where
        F: FnMut(&SignalEvent<'_>) + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        let callback: SignalCallback = Box::new(callback);
        self.entries.insert(
            id,
            Subscription {
                filter,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        SubscriptionId(id)
    }

    /// 取消订阅
    ///
    /// 发射期间只做标记；返回句柄在调用前是否有效。
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        if self.emitting > 0 {
            self.erased.insert(id.0);
        } else {
            self.entries.remove(&id.0);
        }
        true
    }

    /// 取消所有 sender 过滤条件等于 `sender` 的订阅，返回数量
    pub fn unsubscribe_sender(&mut self, sender: &str) -> usize {
        let ids: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|(id, s)| {
                s.filter.sender.as_deref() == Some(sender) && !self.erased.contains(id)
            })
            .map(|(id, _)| SubscriptionId(*id))
            .collect();
        for id in &ids {
            self.unsubscribe(*id);
        }
        ids.len()
    }

    pub fn is_live(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id.0) && !self.erased.contains(&id.0)
    }

    /// 有效订阅数量（不含待清除的）
    pub fn len(&self) -> usize {
        self.entries.len() - self.erased.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 以 sender 过滤条件等于 `sender` 的有效订阅数量
    pub fn count_for_sender(&self, sender: &str) -> usize {
        self.entries
            .iter()
            .filter(|(id, s)| {
                s.filter.sender.as_deref() == Some(sender) && !self.erased.contains(id)
            })
            .count()
    }

    fn begin_emit(&mut self) {
        self.emitting += 1;
    }

    fn end_emit(&mut self) {
        self.emitting = self.emitting.saturating_sub(1);
        if self.emitting == 0 && !self.erased.is_empty() {
            for id in std::mem::take(&mut self.erased) {
                self.entries.remove(&id);
            }
        }
    }

    fn collect(
        &self,
        select: impl Fn(&SignalFilter) -> bool,
    ) -> Vec<(SubscriptionId, Rc<RefCell<SignalCallback>>)> {
        self.entries
            .iter()
            .filter(|(id, s)| !self.erased.contains(id) && select(&s.filter))
            .map(|(id, s)| (SubscriptionId(*id), Rc::clone(&s.callback)))
            .collect()
    }

    /// 把信号投递给所有匹配的订阅，返回调用的回调数量
    ///
    /// 表格在回调期间不被借用，回调可以自由地订阅/取消订阅。
    pub fn emit(table: &RefCell<Self>, event: &SignalEvent<'_>) -> usize {
        Self::emit_selected(table, event, |filter| filter.matches(event))
    }

    /// 按自定义条件投递
    pub fn emit_selected(
        table: &RefCell<Self>,
        event: &SignalEvent<'_>,
        select: impl Fn(&SignalFilter) -> bool,
    ) -> usize {
        let targets = {
            let mut t = table.borrow_mut();
            t.begin_emit();
            t.collect(select)
        };

        let mut called = 0;
        for (id, callback) in targets {
            // 同一轮中被前面的回调取消的订阅不再调用
            if !table.borrow().is_live(id) {
                continue;
            }
            match callback.try_borrow_mut() {
                Ok(mut f) => {
                    (*f)(event);
                    called += 1;
                },
                Err(_) => warn!("subscription {:?} re-entered during its own emission, skipped", id),
            }
        }

        table.borrow_mut().end_emit();
        called
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn event<'a>(member: &'a str, args: &'a Value) -> SignalEvent<'a> {
        SignalEvent {
            sender: "saftbus",
            object_path: "/de/gsi/saftlib/tr0",
            interface: "de.gsi.saftlib.TimingReceiver",
            member,
            args,
        }
    }

    #[test]
    fn test_filter_matching() {
        let args = Value::tuple([Value::from("owner-a"), Value::from(1u32)]);
        let ev = event("Locked", &args);

        assert!(SignalFilter::new().matches(&ev));
        assert!(SignalFilter::new().member("Locked").arg0("owner-a").matches(&ev));
        assert!(!SignalFilter::new().member("Unlocked").matches(&ev));
        assert!(!SignalFilter::new().arg0("owner-b").matches(&ev));
        assert!(!SignalFilter::new().sender(":1.1").matches(&ev));
        assert!(
            SignalFilter::new()
                .interface("de.gsi.saftlib.TimingReceiver")
                .object_path("/de/gsi/saftlib/tr0")
                .matches(&ev)
        );
    }

    #[test]
    fn test_unsubscribe_self_during_emit_is_deferred() {
        let table = Rc::new(RefCell::new(SubscriptionTable::new()));
        let calls = Rc::new(Cell::new(0));

        let own_id = Rc::new(Cell::new(None));
        let (t, c, me) = (table.clone(), calls.clone(), own_id.clone());
        let id = table.borrow_mut().subscribe(
            SignalFilter::new(),
            move |_| {
                c.set(c.get() + 1);
                if let Some(id) = me.get() {
                    assert!(t.borrow_mut().unsubscribe(id));
                }
            },
        );
        own_id.set(Some(id));

        let args = Value::Unit;
        assert_eq!(SubscriptionTable::emit(&table, &event("Tick", &args)), 1);
        assert!(!table.borrow().is_live(id));
        assert!(table.borrow().is_empty());
        assert_eq!(SubscriptionTable::emit(&table, &event("Tick", &args)), 0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_unsubscribe_other_during_emit_skips_it() {
        let table = Rc::new(RefCell::new(SubscriptionTable::new()));
        let second_calls = Rc::new(Cell::new(0));

        let victim = Rc::new(Cell::new(None));
        let (t, v) = (table.clone(), victim.clone());
        table.borrow_mut().subscribe(
            SignalFilter::new(),
            move |_| {
                if let Some(id) = v.get() {
                    t.borrow_mut().unsubscribe(id);
                }
            },
        );
        let c = second_calls.clone();
        let id = table
            .borrow_mut()
            .subscribe(SignalFilter::new(), move |_| c.set(c.get() + 1));
        victim.set(Some(id));

        let args = Value::Unit;
        assert_eq!(SubscriptionTable::emit(&table, &event("Tick", &args)), 1);
        assert_eq!(second_calls.get(), 0);
        assert_eq!(table.borrow().len(), 1);
    }

    #[test]
    fn test_subscribe_during_emit_not_called_this_round() {
        let table = Rc::new(RefCell::new(SubscriptionTable::new()));
        let late_calls = Rc::new(Cell::new(0));

        let (t, c) = (table.clone(), late_calls.clone());
        table.borrow_mut().subscribe(
            SignalFilter::new().member("Tick"),
            move |_| {
                let c = c.clone();
                t.borrow_mut()
                    .subscribe(SignalFilter::new().member("Tick"), move |_| c.set(c.get() + 1));
            },
        );

        let args = Value::Unit;
        SubscriptionTable::emit(&table, &event("Tick", &args));
        assert_eq!(late_calls.get(), 0);
        assert_eq!(table.borrow().len(), 2);
    }

    #[test]
    fn test_unsubscribe_sender() {
        let mut table = SubscriptionTable::new();
        table.subscribe(SignalFilter::new().sender(":1.1"), |_| {});
        table.subscribe(SignalFilter::new().sender(":1.1").member("X"), |_| {});
        let other = table.subscribe(SignalFilter::new().sender(":1.2"), |_| {});

        assert_eq!(table.count_for_sender(":1.1"), 2);
        assert_eq!(table.unsubscribe_sender(":1.1"), 2);
        assert_eq!(table.count_for_sender(":1.1"), 0);
        assert!(table.is_live(other));
        assert!(!table.unsubscribe(SubscriptionId(999)));
    }
}
