//! 在途帧记录池与计数信号量.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};

/// 同时在途的编码命令上限
pub const ENC_MAX_CMD: usize = 10;

/// 定长记录池, 空闲 id 按 FIFO 复用
#[derive(Debug)]
pub struct FramePool<T> {
    records: Vec<Option<T>>,
    free: VecDeque<usize>,
}

impl<T> FramePool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).collect(),
        }
    }

    /// 占用一条记录, 池满时返回 None
    pub fn acquire(&mut self, record: T) -> Option<usize> {
        let id = self.free.pop_front()?;
        self.records[id] = Some(record);
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.records.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.records.get_mut(id).and_then(Option::as_mut)
    }

    /// 归还记录, id 回到空闲队列尾部
    pub fn release(&mut self, id: usize) -> Option<T> {
        let record = self.records.get_mut(id)?.take()?;
        self.free.push_back(id);
        Some(record)
    }

    /// 取出全部在用记录
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for id in 0..self.records.len() {
            if let Some(record) = self.release(id) {
                out.push(record);
            }
        }
        out
    }

    pub fn in_use(&self) -> usize {
        self.records.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }
}

/// 计数信号量
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    total: usize,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            total: permits,
            cond: Condvar::new(),
        }
    }

    /// 阻塞直到取得一个许可
    pub fn acquire(&self) {
        let guard = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = self
            .cond
            .wait_while(guard, |p| *p == 0)
            .unwrap_or_else(PoisonError::into_inner);
        *guard -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut guard = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard == 0 {
            return false;
        }
        *guard -= 1;
        true
    }

    pub fn release(&self) {
        let mut guard = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard < self.total {
            *guard += 1;
        }
        self.cond.notify_all();
    }

    /// 阻塞直到所有许可都已归还
    pub fn wait_idle(&self) {
        let guard = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .cond
            .wait_while(guard, |p| *p < self.total)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
