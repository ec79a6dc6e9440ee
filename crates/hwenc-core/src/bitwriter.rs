//! 定长比特流写入器.
//!
//! 在调用方提供的固定容量字节缓冲区上按位写入, 是所有 NAL 单元序列化的基础设施.
//!
//! 按大端位序写入 (MSB first). 写入超出容量时置位溢出标志, 之后的写入不再修改缓冲区,
//! 但位计数继续前进, 便于诊断超出了多少.

/// 定长比特流写入器
///
/// # 示例
/// ```
/// use hwenc_core::bitwriter::BitstreamLite;
///
/// let mut buf = [0u8; 4];
/// let mut bs = BitstreamLite::new(&mut buf);
/// bs.put_bits(4, 0b1011);
/// bs.put_bits(4, 0b0001);
/// bs.put_ue(3);
/// bs.rbsp_trailing_bits();
/// assert!(!bs.is_overflow());
/// assert_eq!(bs.bytes_written(), 2);
/// assert_eq!(&buf[..2], &[0b1011_0001, 0b0010_0100]);
/// ```
pub struct BitstreamLite<'a> {
    /// 目标缓冲区
    data: &'a mut [u8],
    /// 已写入位数
    bit_count: usize,
    /// 容量 (位)
    max_bits: usize,
    /// 是否已溢出
    overflow: bool,
}

impl<'a> BitstreamLite<'a> {
    /// 以整个缓冲区为容量创建写入器
    pub fn new(data: &'a mut [u8]) -> Self {
        let max_bits = data.len() * 8;
        Self {
            data,
            bit_count: 0,
            max_bits,
            overflow: false,
        }
    }

    /// 以指定位容量创建写入器, 容量不会超过缓冲区本身
    pub fn with_max_bits(data: &'a mut [u8], max_bits: usize) -> Self {
        let max_bits = max_bits.min(data.len() * 8);
        Self {
            data,
            bit_count: 0,
            max_bits,
            overflow: false,
        }
    }

    /// 重置写入位置并清除溢出标志
    pub fn reset(&mut self) {
        self.bit_count = 0;
        self.overflow = false;
    }

    /// 已写入 (或跳过) 的位数
    pub fn bits_written(&self) -> usize {
        self.bit_count
    }

    /// 已写入的完整字节数 (向上取整)
    pub fn bytes_written(&self) -> usize {
        self.bit_count.div_ceil(8)
    }

    /// 容量 (位)
    pub fn max_bits(&self) -> usize {
        self.max_bits
    }

    /// 剩余可写位数
    pub fn remaining_bits(&self) -> usize {
        self.max_bits.saturating_sub(self.bit_count)
    }

    /// 是否已溢出
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// 缓冲区起始处的数据
    pub fn data(&self) -> &[u8] {
        let end = self.bytes_written().min(self.max_bits.div_ceil(8));
        &self.data[..end]
    }

    /// 当前写入位置所在字节开始的剩余缓冲区
    pub fn cur_data(&mut self) -> &mut [u8] {
        let limit = self.max_bits / 8;
        let pos = (self.bit_count / 8).min(limit);
        &mut self.data[pos..limit]
    }

    /// 当前写入位置的字节偏移
    pub fn byte_offset(&self) -> usize {
        self.bit_count / 8
    }

    /// 回填已写入区域内的一个字节, 超出容量或尚未写到的位置忽略
    pub fn patch_byte(&mut self, offset: usize, value: u8) {
        if offset < self.bytes_written() && offset < self.max_bits / 8 {
            self.data[offset] = value;
        }
    }

    /// 写入 1 个位
    pub fn put_bit(&mut self, bit: u8) {
        self.put_bits(1, u32::from(bit & 1));
    }

    /// 写入 N 个位 (最多 32 位)
    ///
    /// 值的低 N 位被写入, 高位在前.
    pub fn put_bits(&mut self, n: u32, value: u32) {
        debug_assert!(n <= 32, "put_bits: n={} 超过 32 位", n);
        if n == 0 {
            return;
        }

        if self.overflow || self.bit_count + n as usize > self.max_bits {
            self.overflow = true;
            self.bit_count += n as usize;
            return;
        }

        let mut remaining = n;
        while remaining > 0 {
            let byte_idx = self.bit_count / 8;
            let used = (self.bit_count % 8) as u32;
            let available = 8 - used;
            let to_write = remaining.min(available);

            let shift = remaining - to_write;
            let bits = ((u64::from(value) >> shift) & ((1u64 << to_write) - 1)) as u8;

            // 新字节先清零, 保证 skip 后重写的字节不带旧数据
            if used == 0 {
                self.data[byte_idx] = 0;
            }
            self.data[byte_idx] |= bits << (available - to_write);

            self.bit_count += to_write as usize;
            remaining -= to_write;
        }
    }

    /// 写入 N 位无符号数
    pub fn put_u(&mut self, n: u32, value: u32) {
        self.put_bits(n, value);
    }

    /// 写入 N 位有符号数 (二进制补码截断)
    pub fn put_i(&mut self, n: u32, value: i32) {
        let mask = if n >= 32 { u32::MAX } else { (1u32 << n) - 1 };
        self.put_bits(n, (value as u32) & mask);
    }

    /// 写入无符号指数哥伦布码 ue(v)
    pub fn put_ue(&mut self, value: u32) {
        let v = u64::from(value) + 1;
        let info_len = 63 - v.leading_zeros();
        // 前导零
        for _ in 0..info_len {
            self.put_bit(0);
        }
        self.put_bit(1);
        let info = v - (1u64 << info_len);
        if info_len > 0 {
            if info_len > 32 {
                self.put_bits(info_len - 32, (info >> 32) as u32);
                self.put_bits(32, info as u32);
            } else {
                self.put_bits(info_len, info as u32);
            }
        }
    }

    /// 写入有符号指数哥伦布码 se(v)
    pub fn put_se(&mut self, value: i32) {
        let abs = value.unsigned_abs();
        let mapped = if value > 0 { 2 * abs - 1 } else { 2 * abs };
        self.put_ue(mapped);
    }

    /// 写入字节序列
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put_bits(8, u32::from(b));
        }
    }

    /// 用指定位值填充到字节边界
    pub fn align_with_bits(&mut self, bit: u8) {
        while self.bit_count % 8 != 0 {
            self.put_bit(bit);
        }
    }

    /// 用 0 填充到字节边界
    pub fn align_to_byte(&mut self) {
        self.align_with_bits(0);
    }

    /// SEI 负载结束: 未对齐时写入 1 再补 0
    pub fn end_of_sei_payload(&mut self) {
        if self.bit_count % 8 != 0 {
            self.put_bit(1);
            self.align_with_bits(0);
        }
    }

    /// RBSP 尾部比特: 停止位 1 后补 0 至字节对齐
    pub fn rbsp_trailing_bits(&mut self) {
        self.put_bit(1);
        self.align_with_bits(0);
    }

    /// 跳过 N 位 (不写数据)
    ///
    /// 用于调用方直接写入 `cur_data()` 之后前移写入位置.
    pub fn skip_bits(&mut self, n: usize) {
        if self.bit_count + n > self.max_bits {
            self.overflow = true;
        }
        self.bit_count += n;
    }
}
