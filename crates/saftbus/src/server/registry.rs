//! 对象注册表
//!
//! (接口名, 对象路径) → 注册 ID → 操作表。
//!
//! - 同一 (接口, 路径) 同时最多只有一个有效注册
//! - ID 从 1 开始单调递增，进程生命周期内不复用，
//!   注销后的旧 ID 不会指向新对象

use super::vtable::ObjectOps;
use saftbus_protocol::{BusError, ObjectEntry};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// 一条注册记录
pub struct Registration {
    pub id: u32,
    pub object_path: String,
    pub interface: String,
    pub ops: Rc<dyn ObjectOps>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("object_path", &self.object_path)
            .field("interface", &self.interface)
            .finish_non_exhaustive()
    }
}

pub struct ObjectRegistry {
    next_id: u32,
    objects: BTreeMap<u32, Registration>,
    index: HashMap<(String, String), u32>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            objects: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// 注册对象
    ///
    /// # 错误
    /// (接口, 路径) 已被占用时返回 `Failed`。
    pub fn register(
        &mut self,
        object_path: &str,
        interface: &str,
        ops: Rc<dyn ObjectOps>,
    ) -> Result<u32, BusError> {
        let key = (interface.to_string(), object_path.to_string());
        if let Some(existing) = self.index.get(&key) {
            return Err(BusError::failed(format!(
                "{} at {} is already registered (id {})",
                interface, object_path, existing
            )));
        }

        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| BusError::failed("registration ids exhausted"))?;

        self.index.insert(key, id);
        self.objects.insert(
            id,
            Registration {
                id,
                object_path: object_path.to_string(),
                interface: interface.to_string(),
                ops,
            },
        );
        Ok(id)
    }

    /// 注销对象，返回被移除的记录
    pub fn unregister(&mut self, id: u32) -> Option<Registration> {
        let registration = self.objects.remove(&id)?;
        self.index
            .remove(&(registration.interface.clone(), registration.object_path.clone()));
        Some(registration)
    }

    /// 查找 (接口, 路径) 对应的注册 ID
    pub fn id_of(&self, interface: &str, object_path: &str) -> Option<u32> {
        self.index
            .get(&(interface.to_string(), object_path.to_string()))
            .copied()
    }

    /// 查找操作表（克隆出 `Rc`，调用期间不占用注册表）
    pub fn lookup(&self, interface: &str, object_path: &str) -> Option<Rc<dyn ObjectOps>> {
        let id = self.id_of(interface, object_path)?;
        self.objects.get(&id).map(|r| Rc::clone(&r.ops))
    }

    pub fn get(&self, id: u32) -> Option<&Registration> {
        self.objects.get(&id)
    }

    /// 所有注册条目（按 ID 排序）
    pub fn entries(&self) -> Vec<ObjectEntry> {
        self.objects
            .values()
            .map(|r| ObjectEntry {
                id: r.id,
                interface: r.interface.clone(),
                object_path: r.object_path.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
