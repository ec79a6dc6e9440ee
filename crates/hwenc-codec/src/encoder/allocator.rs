//! DMA 内存分配接口.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hwenc_core::{Buffer, EncError, EncResult};
use log::debug;

/// 硬件可见内存的分配器
pub trait Allocator: Send + Sync {
    /// 分配 `size` 字节
    fn alloc(&self, size: usize, name: &str) -> EncResult<Buffer>;

    /// 释放 (句柄全部释放后内存才真正回收)
    fn free(&self, buffer: Buffer);

    /// CPU 可见地址
    fn virtual_addr(&self, buffer: &Buffer) -> usize;

    /// 设备可见地址
    fn physical_addr(&self, buffer: &Buffer) -> u64;
}

/// 以进程堆内存模拟的分配器
///
/// 可设置总量上限, 超出时返回 [`EncError::OutOfMemory`].
#[derive(Debug, Default)]
pub struct HostAllocator {
    limit: Option<usize>,
    in_use: Arc<AtomicUsize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带总量上限的分配器
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            in_use: Arc::default(),
        }
    }

    /// 当前已分配的字节数
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Allocator for HostAllocator {
    fn alloc(&self, size: usize, name: &str) -> EncResult<Buffer> {
        let prev = self.in_use.fetch_add(size, Ordering::AcqRel);
        if let Some(limit) = self.limit.filter(|&limit| prev + size > limit) {
            self.in_use.fetch_sub(size, Ordering::AcqRel);
            return Err(EncError::OutOfMemory(format!(
                "分配 {} ({} 字节) 失败, 已用 {} / {} 字节",
                name, size, prev, limit
            )));
        }
        debug!("分配 {}: {} 字节", name, size);
        let in_use = Arc::clone(&self.in_use);
        Ok(Buffer::with_release(
            vec![0u8; size],
            name,
            Box::new(move |data| {
                in_use.fetch_sub(data.len(), Ordering::AcqRel);
            }),
        ))
    }

    fn free(&self, buffer: Buffer) {
        drop(buffer);
    }

    fn virtual_addr(&self, buffer: &Buffer) -> usize {
        buffer.lock_data().as_ptr() as usize
    }

    fn physical_addr(&self, buffer: &Buffer) -> u64 {
        // 没有 IOMMU, 用缓冲区 id 构造一个稳定的伪地址
        buffer.id() << 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_and_release() {
        let alloc = HostAllocator::with_limit(1000);
        let a = alloc.alloc(600, "a").unwrap();
        assert_eq!(alloc.in_use(), 600);
        assert!(matches!(alloc.alloc(600, "b"), Err(EncError::OutOfMemory(_))));
        assert_eq!(alloc.in_use(), 600, "失败的分配不应计入");
        alloc.free(a);
        assert_eq!(alloc.in_use(), 0);
        assert!(alloc.alloc(1000, "c").is_ok());
    }

    #[test]
    fn test_addresses_are_stable() {
        let alloc = HostAllocator::new();
        let buf = alloc.alloc(16, "x").unwrap();
        assert_eq!(alloc.physical_addr(&buf), alloc.physical_addr(&buf.clone()));
        assert_ne!(alloc.virtual_addr(&buf), 0);
    }
}
