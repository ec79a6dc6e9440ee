//! 码流缓冲区的分段元数据.
//!
//! 编码完成的码流缓冲区不是一段连续的 Annex-B 数据: 配置 NAL 写在缓冲区头部的
//! 预留区, 硬件把 slice 数据写在预留区之后, 填充数据紧随其后.
//! [`StreamMetaData`] 按输出顺序记录每一段的偏移、长度与标志, 下游按分段顺序拼接.

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

/// 码流缓冲区头部预留区大小 (配置 NAL 与前缀 SEI)
pub const MAX_HEADER_SIZE: usize = 4096;
/// 配置 NAL (AUD/VPS/SPS/PPS/SEI) 可用的最大字节数, 从偏移 0 开始
pub const MAX_CONFIG_HEADER_SIZE: usize = 2048;
/// 外部前缀 SEI 预留区大小, 位于头部预留区末尾
pub const MAX_SEI_SIZE: usize = 2048;
/// 每帧最大 slice 数
pub const MAX_ENC_SLICE: usize = 200;
/// 每个码流缓冲区最多的分段数
pub const MAX_SECTION: usize = 2 * (MAX_ENC_SLICE + 2);

bitflags! {
    /// 分段标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u32 {
        /// 数据来自前缀 SEI
        const SEI_PREFIX = 0x01;
        /// 数据属于 IDR 访问单元 (随机访问点)
        const SYNC = 0x02;
        /// 帧结束标记 (零长度分段)
        const END_FRAME = 0x04;
        /// 数据为 SPS/PPS/VPS/AUD
        const CONFIG = 0x08;
        /// 数据为填充数据
        const FILLER = 0x10;
        /// 未初始化的填充数据, 由应用层填写
        const APP_FILLER = 0x20;
    }
}

/// 码流分段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSection {
    /// 起始偏移 (相对缓冲区起点, 字节)
    pub offset: u32,
    /// 长度 (字节)
    pub length: u32,
    /// 标志
    pub flags: SectionFlags,
}

impl StreamSection {
    /// 结束偏移 (不含)
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.length)
    }
}

/// 码流缓冲区元数据: 有序分段表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetaData {
    sections: Vec<StreamSection>,
    max_sections: usize,
    /// 时间层 id
    pub temporal_id: u8,
}

impl Default for StreamMetaData {
    fn default() -> Self {
        Self::new(MAX_SECTION)
    }
}

impl StreamMetaData {
    /// 创建指定容量的分段表
    pub fn new(max_sections: usize) -> Self {
        Self {
            sections: Vec::with_capacity(max_sections),
            max_sections,
            temporal_id: 0,
        }
    }

    /// 所有分段
    pub fn sections(&self) -> &[StreamSection] {
        &self.sections
    }

    /// 分段数
    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    /// 最大分段数
    pub fn max_sections(&self) -> usize {
        self.max_sections
    }

    /// 追加分段, 分段表已满时返回 `None`
    pub fn add_section(&mut self, offset: u32, length: u32, flags: SectionFlags) -> Option<usize> {
        self.insert_section(self.sections.len(), offset, length, flags)
    }

    fn insert_section(&mut self, index: usize, offset: u32, length: u32, flags: SectionFlags) -> Option<usize> {
        if self.sections.len() >= self.max_sections {
            return None;
        }
        self.sections.insert(index, StreamSection { offset, length, flags });
        Some(index)
    }

    /// 修改分段位置
    pub fn change_section(&mut self, id: usize, offset: u32, length: u32) {
        if let Some(s) = self.sections.get_mut(id) {
            s.offset = offset;
            s.length = length;
        }
    }

    /// 设置分段标志
    pub fn set_section_flags(&mut self, id: usize, flags: SectionFlags) {
        if let Some(s) = self.sections.get_mut(id) {
            s.flags = flags;
        }
    }

    /// 清空分段表
    pub fn clear_all_sections(&mut self) {
        self.sections.clear();
    }

    /// 最后一个带有指定标志的分段
    pub fn last_section_of_flag(&self, flag: SectionFlags) -> Option<usize> {
        self.sections.iter().rposition(|s| s.flags.intersects(flag))
    }

    /// 最后一个分段的结束偏移
    pub fn offset_after_last_section(&self) -> u32 {
        self.sections.last().map_or(0, StreamSection::end)
    }

    /// 未被任何分段占用的起始偏移 (所有分段的最大结束偏移)
    pub fn unused_stream_part(&self) -> u32 {
        self.sections.iter().map(StreamSection::end).max().unwrap_or(0)
    }

    /// 为所有分段添加标志
    pub fn add_flags_to_all_sections(&mut self, flags: SectionFlags) {
        for s in &mut self.sections {
            s.flags |= flags;
        }
    }

    /// 登记 SEI 分段
    ///
    /// 前缀 SEI 插在最后一个前缀 SEI 分段之后 (没有时插在最后一个配置分段之后),
    /// 后缀 SEI 直接追加.
    pub fn add_sei_section(&mut self, is_prefix: bool, offset: u32, length: u32) -> Option<usize> {
        if !is_prefix {
            return self.add_section(offset, length, SectionFlags::empty());
        }
        let index = self
            .last_section_of_flag(SectionFlags::SEI_PREFIX)
            .or_else(|| self.last_section_of_flag(SectionFlags::CONFIG))
            .map_or(0, |i| i + 1);
        self.insert_section(index, offset, length, SectionFlags::SEI_PREFIX)
    }

    /// 帧结束标记的数量
    pub fn end_frame_count(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.flags.contains(SectionFlags::END_FRAME))
            .count()
    }

    /// 按分段顺序拼接出连续的 Annex-B 数据
    ///
    /// 越界的分段被截断到缓冲区末尾.
    pub fn collect(&self, data: &[u8]) -> Bytes {
        let range = |s: &StreamSection| {
            let start = (s.offset as usize).min(data.len());
            start..(s.end() as usize).min(data.len())
        };
        let total = self.sections.iter().map(|s| range(s).len()).sum();
        let mut out = BytesMut::with_capacity(total);
        for s in &self.sections {
            out.extend_from_slice(&data[range(s)]);
        }
        out.freeze()
    }
}

/// 编码图像元数据, 挂载在返回给应用的码流缓冲区上
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureMeta {
    /// slice 类型
    pub slice_type: crate::picture::SliceType,
    /// 是否跳过编码
    pub skipped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_section_respects_capacity() {
        let mut meta = StreamMetaData::new(2);
        assert_eq!(meta.add_section(0, 10, SectionFlags::CONFIG), Some(0));
        assert_eq!(meta.add_section(10, 5, SectionFlags::empty()), Some(1));
        assert_eq!(meta.add_section(15, 5, SectionFlags::empty()), None);
        assert_eq!(meta.num_sections(), 2);
    }

    #[test]
    fn test_prefix_sei_inserted_after_config() {
        let mut meta = StreamMetaData::default();
        meta.add_section(0, 20, SectionFlags::CONFIG);
        meta.add_section(20, 8, SectionFlags::CONFIG);
        meta.add_section(4096, 100, SectionFlags::empty());
        meta.add_section(0, 0, SectionFlags::END_FRAME);

        assert_eq!(meta.add_sei_section(true, 2048, 12), Some(2));
        assert_eq!(meta.add_sei_section(true, 2060, 12), Some(3));
        assert_eq!(meta.add_sei_section(false, 4196, 30), Some(6));
        let flags: Vec<_> = meta.sections().iter().map(|s| s.flags).collect();
        assert_eq!(flags[2], SectionFlags::SEI_PREFIX);
        assert_eq!(flags[3], SectionFlags::SEI_PREFIX);
        assert_eq!(flags[5], SectionFlags::END_FRAME);
        assert_eq!(meta.unused_stream_part(), 4226);
    }

    #[test]
    fn test_prefix_sei_goes_first_without_config() {
        let mut meta = StreamMetaData::default();
        meta.add_section(4096, 100, SectionFlags::empty());
        assert_eq!(meta.add_sei_section(true, 2048, 12), Some(0));
        assert_eq!(meta.sections()[1].offset, 4096);
    }

    #[test]
    fn test_sync_flag_marks_all_sections() {
        let mut meta = StreamMetaData::default();
        meta.add_section(0, 20, SectionFlags::CONFIG);
        meta.add_section(4096, 100, SectionFlags::empty());
        meta.add_flags_to_all_sections(SectionFlags::SYNC);
        assert!(meta.sections().iter().all(|s| s.flags.contains(SectionFlags::SYNC)));
        assert!(meta.sections()[0].flags.contains(SectionFlags::CONFIG));
        assert_eq!(meta.last_section_of_flag(SectionFlags::CONFIG), Some(0));
        assert_eq!(meta.last_section_of_flag(SectionFlags::FILLER), None);
    }

    #[test]
    fn test_collect_follows_section_order() {
        let mut data = vec![0u8; 16];
        data[..4].copy_from_slice(&[1, 2, 3, 4]);
        data[8..12].copy_from_slice(&[5, 6, 7, 8]);
        let mut meta = StreamMetaData::default();
        meta.add_section(8, 4, SectionFlags::empty());
        meta.add_section(0, 2, SectionFlags::CONFIG);
        meta.add_section(0, 0, SectionFlags::END_FRAME);
        meta.add_section(14, 10, SectionFlags::FILLER);
        assert_eq!(&meta.collect(&data)[..], &[5, 6, 7, 8, 1, 2, 0, 0]);
    }

    #[test]
    fn test_section_end_saturates() {
        let mut meta = StreamMetaData::default();
        meta.add_section(4, 4, SectionFlags::empty());
        meta.add_section(u32::MAX - 1, 10, SectionFlags::FILLER);
        assert_eq!(meta.sections()[1].end(), u32::MAX);
        assert_eq!(meta.offset_after_last_section(), u32::MAX);
        assert_eq!(meta.unused_stream_part(), u32::MAX);
        let data: Vec<u8> = (0..16).collect();
        assert_eq!(&meta.collect(&data)[..], &[4, 5, 6, 7]);
    }
}
