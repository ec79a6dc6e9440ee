//! Annex-B 码流检查工具.
//!
//! 按起始码切分 NAL 单元并去除防竞争字节, 供测试与命令行工具校验输出码流.

use crate::nal::Codec;

/// Annex-B 码流中的一个 NAL 单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnexBNal {
    /// 起始码在码流中的偏移
    pub offset: usize,
    /// 起始码长度 (3 或 4)
    pub start_code_len: usize,
    /// NAL 类型编号
    pub nut: u8,
    /// NAL 数据 (含头部, 未去除防竞争字节)
    pub data: Vec<u8>,
}

impl AnnexBNal {
    /// 去除头部与防竞争字节后的 RBSP
    pub fn rbsp(&self, codec: Codec) -> Vec<u8> {
        let header_len = match codec {
            Codec::Avc => 1,
            Codec::Hevc => 2,
        };
        remove_emulation_prevention(self.data.get(header_len..).unwrap_or(&[]))
    }
}

/// 查找所有起始码位置
fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut positions = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                positions.push((i, 3));
                i += 3;
                continue;
            } else if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                positions.push((i, 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    positions
}

/// 按起始码切分 Annex-B 码流
///
/// 填充数据 NAL 以 0x80 结尾, 因此不会剥离尾部零字节以外的任何内容.
pub fn split_annex_b(data: &[u8], codec: Codec) -> Vec<AnnexBNal> {
    let starts = find_start_codes(data);
    let mut nals = Vec::with_capacity(starts.len());

    for (i, &(start, sc_len)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(data.len(), |&(next, _)| next);
        let nal_start = start + sc_len;
        let mut nal_end = end;
        while nal_end > nal_start && data[nal_end - 1] == 0x00 {
            nal_end -= 1;
        }
        if nal_end <= nal_start {
            continue;
        }
        let first = data[nal_start];
        let nut = match codec {
            Codec::Avc => first & 0x1F,
            Codec::Hevc => (first >> 1) & 0x3F,
        };
        nals.push(AnnexBNal {
            offset: start,
            start_code_len: sc_len,
            nut,
            data: data[nal_start..nal_end].to_vec(),
        });
    }
    nals
}

/// 移除防竞争字节 (0x000003 → 0x0000)
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let is_emulation_prevention =
            i + 2 < data.len() && data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x03;
        if is_emulation_prevention {
            rbsp.push(0x00);
            rbsp.push(0x00);
            i += 3;
        } else {
            rbsp.push(data[i]);
            i += 1;
        }
    }

    rbsp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0C, // VPS
            0x00, 0x00, 0x01, 0x26, 0x01, 0xAF, // IDR
            0x00, 0x00, 0x00, 0x01, 0x4C, 0x01, 0xFF, 0x80, // FD
        ];
        let nals = split_annex_b(&data, Codec::Hevc);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0].nut, 32);
        assert_eq!(nals[0].start_code_len, 4);
        assert_eq!(nals[1].nut, 19);
        assert_eq!(nals[1].data, vec![0x26, 0x01, 0xAF]);
        assert_eq!(nals[2].nut, 38);
        assert_eq!(nals[2].offset, 13);
        assert_eq!(nals[2].start_code_len, 4);
    }

    #[test]
    fn test_rbsp_strips_header_and_emulation_bytes() {
        let data = [0x00, 0x00, 0x01, 0x06, 0x05, 0x00, 0x00, 0x03, 0x01, 0x80];
        let nals = split_annex_b(&data, Codec::Avc);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nut, 6);
        assert_eq!(nals[0].rbsp(Codec::Avc), vec![0x05, 0x00, 0x00, 0x01, 0x80]);
    }
}
