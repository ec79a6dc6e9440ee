//! 引用计数的共享缓冲区.
//!
//! 源帧、码流缓冲区与 QP 表都以 [`Buffer`] 形式在应用与编码器之间传递.
//! 最后一个强引用释放时调用注册的释放回调 (通常用于把内存还给池).
//! [`BufferView`] 是不持有所有权的别名视图, 不会延长缓冲区生命周期.
//!
//! 每个缓冲区可挂载任意类型的元数据 (每种类型最多一个), 例如码流分段表或图像布局.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// 释放回调: 收回底层数据
pub type ReleaseFn = Box<dyn FnOnce(Vec<u8>) + Send>;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    name: String,
    data: Mutex<Vec<u8>>,
    metas: Mutex<Vec<(TypeId, Box<dyn Any + Send>)>>,
    on_release: Mutex<Option<ReleaseFn>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let release = self
            .on_release
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(release) = release {
            let data = std::mem::take(self.data.get_mut().unwrap_or_else(PoisonError::into_inner));
            release(data);
        }
    }
}

/// 共享缓冲区句柄
///
/// `clone()` 增加引用计数, 句柄全部释放后触发释放回调.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Inner>,
}

impl Buffer {
    /// 分配指定大小的零初始化缓冲区
    pub fn new(size: usize, name: &str) -> Self {
        Self::from_vec(vec![0u8; size], name)
    }

    /// 从已有数据创建缓冲区
    pub fn from_vec(data: Vec<u8>, name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                data: Mutex::new(data),
                metas: Mutex::new(Vec::new()),
                on_release: Mutex::new(None),
            }),
        }
    }

    /// 创建带释放回调的缓冲区
    pub fn with_release(data: Vec<u8>, name: &str, on_release: ReleaseFn) -> Self {
        let buf = Self::from_vec(data, name);
        *lock(&buf.inner.on_release) = Some(on_release);
        buf
    }

    /// 唯一标识
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 调试名称
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 数据大小 (字节)
    pub fn size(&self) -> usize {
        lock(&self.inner.data).len()
    }

    /// 当前强引用数
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 两个句柄是否指向同一缓冲区
    pub fn ptr_eq(a: &Buffer, b: &Buffer) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// 锁定数据
    ///
    /// 与 [`Buffer::with_meta`] 同时使用时, 先锁数据再访问元数据.
    pub fn lock_data(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.inner.data)
    }

    /// 复制数据的快照
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock_data().clone()
    }

    /// 创建不持有所有权的别名视图
    pub fn view(&self) -> BufferView {
        BufferView {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 挂载元数据, 同类型的旧元数据被替换
    pub fn add_meta<T: Any + Send>(&self, meta: T) {
        let mut metas = lock(&self.inner.metas);
        let key = TypeId::of::<T>();
        if let Some(slot) = metas.iter_mut().find(|(id, _)| *id == key) {
            slot.1 = Box::new(meta);
        } else {
            metas.push((key, Box::new(meta)));
        }
    }

    /// 是否挂载了指定类型的元数据
    pub fn has_meta<T: Any + Send>(&self) -> bool {
        let key = TypeId::of::<T>();
        lock(&self.inner.metas).iter().any(|(id, _)| *id == key)
    }

    /// 访问指定类型的元数据, 未挂载时返回 `None`
    pub fn with_meta<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut metas = lock(&self.inner.metas);
        let key = TypeId::of::<T>();
        metas
            .iter_mut()
            .find(|(id, _)| *id == key)
            .and_then(|(_, meta)| meta.downcast_mut::<T>())
            .map(f)
    }

    /// 取下指定类型的元数据
    pub fn remove_meta<T: Any + Send>(&self) -> Option<T> {
        let mut metas = lock(&self.inner.metas);
        let key = TypeId::of::<T>();
        let pos = metas.iter().position(|(id, _)| *id == key)?;
        let (_, meta) = metas.remove(pos);
        meta.downcast::<T>().ok().map(|b| *b)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("size", &self.size())
            .finish()
    }
}

/// 缓冲区别名视图 (不持有所有权)
#[derive(Clone)]
pub struct BufferView {
    inner: Weak<Inner>,
}

impl BufferView {
    /// 缓冲区仍存活时取得强引用
    pub fn upgrade(&self) -> Option<Buffer> {
        self.inner.upgrade().map(|inner| Buffer { inner })
    }

    /// 缓冲区是否已释放
    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_release_callback_on_last_ref() {
        let (tx, rx) = mpsc::channel();
        let buf = Buffer::with_release(
            vec![1, 2, 3],
            "stream",
            Box::new(move |data| {
                let _ = tx.send(data);
            }),
        );
        let second = buf.clone();
        assert_eq!(buf.ref_count(), 2);
        drop(buf);
        assert!(rx.try_recv().is_err(), "仍有引用时不应触发释放");
        drop(second);
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_view_does_not_keep_alive() {
        let buf = Buffer::new(16, "src");
        let view = buf.view();
        assert!(view.upgrade().is_some());
        drop(buf);
        assert!(view.is_released());
        assert!(view.upgrade().is_none());
    }

    #[test]
    fn test_typed_metadata() {
        #[derive(Debug, PartialEq)]
        struct Tag(u32);

        let buf = Buffer::new(4, "meta");
        assert!(!buf.has_meta::<Tag>());
        buf.add_meta(Tag(1));
        buf.add_meta(Tag(7));
        assert_eq!(buf.with_meta(|t: &mut Tag| t.0), Some(7));
        buf.with_meta(|t: &mut Tag| t.0 += 1);
        assert_eq!(buf.remove_meta::<Tag>(), Some(Tag(8)));
        assert!(buf.with_meta(|t: &mut Tag| t.0).is_none());
    }
}
