//! Annex-B NAL 单元输出.
//!
//! 起始码 + NAL 头部 + 加入防竞争字节的 RBSP 负载, 以及填充数据 NAL.

use hwenc_core::BitstreamLite;
use serde::{Deserialize, Serialize};

use super::{Codec, NalHeader};

/// 起始码长度策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartCodeMode {
    /// 参数集与 SEI 用 4 字节, 其余 3 字节
    #[default]
    Auto,
    /// 总是 3 字节
    ThreeBytes,
    /// 总是 4 字节
    FourBytes,
}

/// 写入起始码
pub fn write_start_code(bs: &mut BitstreamLite, codec: Codec, nut: u8, mode: StartCodeMode) {
    let zero_byte = match mode {
        StartCodeMode::Auto => codec.needs_zero_byte(nut),
        StartCodeMode::ThreeBytes => false,
        StartCodeMode::FourBytes => true,
    };
    if zero_byte {
        bs.put_bits(8, 0x00);
    }
    bs.put_bits(8, 0x00);
    bs.put_bits(8, 0x00);
    bs.put_bits(8, 0x01);
}

/// 写入负载并插入防竞争字节
///
/// 已输出的最后两个字节为 `00 00` 且下一个字节 ≤ 0x03 时, 先插入 0x03.
/// 每个输入字节恰好输出一次.
pub fn anti_emulate(bs: &mut BitstreamLite, payload: &[u8]) {
    let mut zeros = 0usize;
    for &byte in payload {
        if zeros >= 2 && byte & 0xFC == 0 {
            bs.put_bits(8, 0x03);
            zeros = 0;
        }
        bs.put_bits(8, u32::from(byte));
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
    }
}

/// 输出完整 NAL: 起始码, 头部, 防竞争处理后的 RBSP
///
/// `rbsp_bits` 为 RBSP 的有效位数, 向上取整到字节.
pub fn flush_nal(
    bs: &mut BitstreamLite,
    codec: Codec,
    nut: u8,
    header: &NalHeader,
    rbsp: &[u8],
    rbsp_bits: usize,
    mode: StartCodeMode,
) {
    write_start_code(bs, codec, nut, mode);
    bs.put_bytes(header.as_bytes());
    let len = rbsp_bits.div_ceil(8).min(rbsp.len());
    if len > 0 {
        anti_emulate(bs, &rbsp[..len]);
    }
}

/// 输出填充数据 NAL, 返回实际写入的字节数 (含起始码与头部)
///
/// `budget` 为整个 NAL 的目标字节数. 缓冲区剩余空间不足时截断,
/// 由调用方比较返回值与 `budget`. `dont_fill` 时只写一个 0xFF 标记,
/// 其余字节留给应用层填充.
pub fn write_filler_data(
    bs: &mut BitstreamLite,
    codec: Codec,
    nut: u8,
    header: &NalHeader,
    budget: usize,
    dont_fill: bool,
    mode: StartCodeMode,
) -> usize {
    let start = bs.bits_written();
    write_start_code(bs, codec, nut, mode);
    bs.put_bytes(header.as_bytes());

    let header_bytes = (bs.bits_written() - start) / 8;
    let space_left = (bs.max_bits() / 8).saturating_sub(bs.bits_written() / 8);
    // 末尾 0x80 占一个字节
    let to_write = budget.saturating_sub(header_bytes).min(space_left).saturating_sub(1);

    if to_write > 0 {
        let cur = bs.cur_data();
        if dont_fill {
            cur[0] = 0xFF;
        } else {
            cur[..to_write].fill(0xFF);
        }
        bs.skip_bits(to_write * 8);
    }
    bs.put_bits(8, 0x80);

    (bs.bits_written() - start) / 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annexb::remove_emulation_prevention;

    fn emulate(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; payload.len() * 2 + 4];
        let mut bs = BitstreamLite::new(&mut buf);
        anti_emulate(&mut bs, payload);
        let n = bs.bytes_written();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_anti_emulate_inserts_03() {
        assert_eq!(emulate(&[0x00, 0x00, 0x01]), vec![0x00, 0x00, 0x03, 0x01]);
        assert_eq!(emulate(&[0x00, 0x00, 0x00, 0x00]), vec![0x00, 0x00, 0x03, 0x00, 0x00]);
        assert_eq!(emulate(&[0x00, 0x00, 0x04]), vec![0x00, 0x00, 0x04]);
        assert_eq!(emulate(&[0x00, 0x00, 0x03, 0x00, 0x00, 0x02]), vec![
            0x00, 0x00, 0x03, 0x03, 0x00, 0x00, 0x03, 0x02
        ]);
    }

    #[test]
    fn test_anti_emulate_short_payload_verbatim() {
        assert_eq!(emulate(&[]), Vec::<u8>::new());
        assert_eq!(emulate(&[0x00]), vec![0x00]);
        assert_eq!(emulate(&[0x00, 0x00]), vec![0x00, 0x00]);
    }

    #[test]
    fn test_anti_emulate_never_emits_start_code_prefix() {
        // 确定性伪随机输入, 偏向 0x00..0x03
        let mut seed = 7u32;
        let mut payload = Vec::new();
        for _ in 0..4096 {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let v = (seed >> 16) as u8;
            payload.push(if v & 0x80 != 0 { v & 0x03 } else { v });
        }
        let out = emulate(&payload);
        for w in out.windows(3) {
            assert!(!(w[0] == 0 && w[1] == 0 && w[2] < 0x03), "输出中出现 {:02X?}", w);
        }
        assert_eq!(remove_emulation_prevention(&out), payload);
    }

    #[test]
    fn test_flush_nal_hevc_sps_uses_four_byte_start_code() {
        let mut buf = [0u8; 16];
        let mut bs = BitstreamLite::new(&mut buf);
        let header = NalHeader::hevc(33, 0, 0);
        flush_nal(&mut bs, Codec::Hevc, 33, &header, &[0xAB, 0x80], 9, StartCodeMode::Auto);
        let n = bs.bytes_written();
        assert_eq!(&buf[..n], &[0, 0, 0, 1, 0x42, 0x01, 0xAB, 0x80]);
    }

    #[test]
    fn test_flush_nal_forced_three_byte_start_code() {
        let mut buf = [0u8; 16];
        let mut bs = BitstreamLite::new(&mut buf);
        let header = NalHeader::avc(7, 1);
        flush_nal(&mut bs, Codec::Avc, 7, &header, &[0x42], 8, StartCodeMode::ThreeBytes);
        let n = bs.bytes_written();
        assert_eq!(&buf[..n], &[0, 0, 1, 0x27, 0x42]);
    }

    #[test]
    fn test_filler_fits_budget() {
        let mut buf = [0u8; 32];
        let mut bs = BitstreamLite::new(&mut buf);
        let header = NalHeader::hevc(38, 0, 0);
        let written = write_filler_data(&mut bs, Codec::Hevc, 38, &header, 12, false, StartCodeMode::Auto);
        assert_eq!(written, 12);
        assert_eq!(&buf[..6], &[0, 0, 0, 1, 0x4C, 0x01]);
        assert!(buf[6..11].iter().all(|&b| b == 0xFF));
        assert_eq!(buf[11], 0x80);
    }

    #[test]
    fn test_filler_clipped_to_buffer() {
        let mut buf = [0u8; 10];
        let mut bs = BitstreamLite::new(&mut buf);
        let header = NalHeader::avc(12, 0);
        let written = write_filler_data(&mut bs, Codec::Avc, 12, &header, 100, false, StartCodeMode::Auto);
        assert_eq!(written, 10, "应截断到缓冲区容量");
        assert!(!bs.is_overflow());
        assert_eq!(&buf[..5], &[0, 0, 0, 1, 0x0C]);
        assert!(buf[5..9].iter().all(|&b| b == 0xFF));
        assert_eq!(buf[9], 0x80);
    }

    #[test]
    fn test_filler_dont_fill_marks_first_byte_only() {
        let mut buf = [0x11u8; 16];
        let mut bs = BitstreamLite::new(&mut buf);
        let header = NalHeader::avc(12, 0);
        let written = write_filler_data(&mut bs, Codec::Avc, 12, &header, 10, true, StartCodeMode::Auto);
        assert_eq!(written, 10);
        assert_eq!(buf[5], 0xFF);
        assert!(buf[6..9].iter().all(|&b| b == 0x11), "应用层填充区不应被写入");
        assert_eq!(buf[9], 0x80);
    }
}
