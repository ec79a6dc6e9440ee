//! RBSP 比特流读取器.
//!
//! 按大端位序读取已去除防竞争字节的 RBSP 数据, 用于码流检查与头部校验.

use crate::{EncError, EncResult};

/// RBSP 比特流读取器
///
/// # 示例
/// ```
/// use hwenc_core::bitreader::BitReader;
///
/// let data = [0b1011_0001, 0b0100_0000];
/// let mut br = BitReader::new(&data);
/// assert_eq!(br.read_bits(4).unwrap(), 0b1011);
/// assert_eq!(br.read_bits(4).unwrap(), 0b0001);
/// assert_eq!(br.read_ue().unwrap(), 1);
/// ```
pub struct BitReader<'a> {
    /// 源数据
    data: &'a [u8],
    /// 当前字节索引
    byte_pos: usize,
    /// 当前字节中的位位置 (0-7, 0 表示最高位)
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    /// 创建新的读取器
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// 获取已读取的总位数
    pub fn bits_read(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos as usize
    }

    /// 获取剩余可读位数
    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.bits_read())
    }

    /// 读取 1 个位
    pub fn read_bit(&mut self) -> EncResult<u32> {
        let byte = *self.data.get(self.byte_pos).ok_or(EncError::Eof)?;
        let bit = (byte >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        Ok(u32::from(bit))
    }

    /// 读取 N 个位 (最多 32 位)
    pub fn read_bits(&mut self, n: u32) -> EncResult<u32> {
        if n > 32 {
            return Err(EncError::InvalidArgument(format!(
                "read_bits: n={} 超过 32 位",
                n
            )));
        }
        if n as usize > self.bits_left() {
            return Err(EncError::Eof);
        }
        let mut result = 0u64;
        for _ in 0..n {
            result = (result << 1) | u64::from(self.read_bit()?);
        }
        Ok(result as u32)
    }

    /// 读取布尔标志
    pub fn read_flag(&mut self) -> EncResult<bool> {
        Ok(self.read_bit()? == 1)
    }

    /// 读取无符号指数哥伦布码 ue(v)
    pub fn read_ue(&mut self) -> EncResult<u32> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(EncError::InvalidData("Exp-Golomb 前导零过多".into()));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }

    /// 读取有符号指数哥伦布码 se(v)
    pub fn read_se(&mut self) -> EncResult<i32> {
        let code = self.read_ue()?;
        // 映射: 0→0, 1→1, 2→-1, 3→2, 4→-2, ...
        let value = code.div_ceil(2) as i32;
        if code & 1 == 0 { Ok(-value) } else { Ok(value) }
    }

    /// 是否已字节对齐
    pub fn is_aligned(&self) -> bool {
        self.bit_pos == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bits_across_bytes() {
        let data = [0b1010_1010, 0b1111_0000];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_bits(3).unwrap(), 0b101);
        assert_eq!(br.read_bits(9).unwrap(), 0b0_1010_1111);
        assert_eq!(br.bits_left(), 4);
        assert!(matches!(br.read_bits(5), Err(EncError::Eof)));
    }

    #[test]
    fn test_read_se_mapping() {
        // ue: 1 | 010 | 011 | 00100 | 00101
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_se().unwrap(), 0);
        assert_eq!(br.read_se().unwrap(), 1);
        assert_eq!(br.read_se().unwrap(), -1);
        assert_eq!(br.read_se().unwrap(), 2);
        assert_eq!(br.read_se().unwrap(), -2);
    }
}
