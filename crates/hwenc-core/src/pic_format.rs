//! 源图像格式定义.
//!
//! 描述编码通道期望的源帧存储格式 (FourCC, 色度采样, 位深), 以及
//! 硬件对行跨度 (pitch) 与平面大小的要求.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 硬件 DMA 突发对齐 (字节), 源帧行跨度必须是它的整数倍
pub const BURST_ALIGNMENT: u32 = 32;

/// 图像尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimension {
    /// 宽度 (像素)
    pub width: u32,
    /// 高度 (像素)
    pub height: u32,
}

impl Dimension {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 是否在另一尺寸范围之内
    pub fn fits_in(&self, max: &Dimension) -> bool {
        self.width <= max.width && self.height <= max.height
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 色度采样模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaMode {
    /// 仅亮度
    Mono,
    /// 4:2:0
    Chroma420,
    /// 4:2:2
    Chroma422,
}

impl ChromaMode {
    /// chroma_format_idc
    pub fn format_idc(&self) -> u32 {
        match self {
            Self::Mono => 0,
            Self::Chroma420 => 1,
            Self::Chroma422 => 2,
        }
    }
}

/// 源帧 FourCC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FourCc {
    /// 8 位 4:2:0 半平面 (Y + UV 交错)
    Nv12,
    /// 8 位 4:2:0 平面
    I420,
    /// 8 位 4:2:2 半平面
    Nv16,
    /// 8 位灰度
    Y800,
    /// 10 位 (16 位存储) 4:2:0 半平面
    P010,
    /// 10 位 (16 位存储) 4:2:2 半平面
    P210,
    /// 10 位 (16 位存储) 灰度
    Y010,
}

impl FourCc {
    /// 按色度模式与位深选择编码器接受的源格式 (平面或半平面)
    pub fn for_source(chroma: ChromaMode, bit_depth: u8, semi_planar: bool) -> Self {
        let high = bit_depth > 8;
        match (chroma, high) {
            (ChromaMode::Mono, false) => Self::Y800,
            (ChromaMode::Mono, true) => Self::Y010,
            (ChromaMode::Chroma420, false) if semi_planar => Self::Nv12,
            (ChromaMode::Chroma420, false) => Self::I420,
            (ChromaMode::Chroma420, true) => Self::P010,
            (ChromaMode::Chroma422, false) => Self::Nv16,
            (ChromaMode::Chroma422, true) => Self::P210,
        }
    }

    /// 四字符代码
    pub fn code(&self) -> [u8; 4] {
        *match self {
            Self::Nv12 => b"NV12",
            Self::I420 => b"I420",
            Self::Nv16 => b"NV16",
            Self::Y800 => b"Y800",
            Self::P010 => b"P010",
            Self::P210 => b"P210",
            Self::Y010 => b"Y010",
        }
    }

    /// 色度采样模式
    pub fn chroma_mode(&self) -> ChromaMode {
        match self {
            Self::Y800 | Self::Y010 => ChromaMode::Mono,
            Self::Nv12 | Self::I420 | Self::P010 => ChromaMode::Chroma420,
            Self::Nv16 | Self::P210 => ChromaMode::Chroma422,
        }
    }

    /// 有效位深
    pub fn bit_depth(&self) -> u8 {
        match self {
            Self::Nv12 | Self::I420 | Self::Nv16 | Self::Y800 => 8,
            Self::P010 | Self::P210 | Self::Y010 => 10,
        }
    }

    /// 每个样本占用字节数
    pub fn bytes_per_sample(&self) -> u32 {
        if self.bit_depth() > 8 { 2 } else { 1 }
    }

    /// 是否为半平面格式
    pub fn is_semi_planar(&self) -> bool {
        matches!(self, Self::Nv12 | Self::Nv16 | Self::P010 | Self::P210)
    }

    /// 亮度平面的最小行跨度 (字节), 按突发对齐
    pub fn min_pitch(&self, width: u32) -> u32 {
        (width * self.bytes_per_sample()).next_multiple_of(BURST_ALIGNMENT)
    }

    /// 色度平面的行跨度 (由亮度跨度推导)
    pub fn chroma_pitch(&self, luma_pitch: u32) -> u32 {
        match self.chroma_mode() {
            ChromaMode::Mono => 0,
            _ if self.is_semi_planar() => luma_pitch,
            _ => luma_pitch / 2,
        }
    }

    /// 色度平面数据总大小 (字节)
    pub fn chroma_size(&self, luma_pitch: u32, stride_height: u32) -> usize {
        let rows = match self.chroma_mode() {
            ChromaMode::Mono => 0,
            ChromaMode::Chroma420 => stride_height / 2,
            ChromaMode::Chroma422 => stride_height,
        } as usize;
        let planes = if self.is_semi_planar() { 1 } else { 2 };
        self.chroma_pitch(luma_pitch) as usize * rows * planes
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// 源帧的平面布局元数据, 挂载在源帧 [`Buffer`](crate::buffer::Buffer) 上
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixMapMeta {
    /// 图像尺寸
    pub dim: Dimension,
    /// 存储格式
    pub fourcc: FourCc,
    /// 亮度行跨度 (字节)
    pub luma_pitch: u32,
    /// 色度行跨度 (字节)
    pub chroma_pitch: u32,
    /// 色度平面在缓冲区中的偏移 (字节)
    pub chroma_offset: usize,
}

impl PixMapMeta {
    /// 按最小行跨度构造紧凑布局
    pub fn packed(dim: Dimension, fourcc: FourCc) -> Self {
        let luma_pitch = fourcc.min_pitch(dim.width);
        Self {
            dim,
            fourcc,
            luma_pitch,
            chroma_pitch: fourcc.chroma_pitch(luma_pitch),
            chroma_offset: luma_pitch as usize * dim.height as usize,
        }
    }

    /// 布局需要的最小缓冲区大小
    pub fn required_size(&self) -> usize {
        let luma = self.luma_pitch as usize * self.dim.height as usize;
        let chroma = self.fourcc.chroma_size(self.luma_pitch, self.dim.height);
        self.chroma_offset.max(luma) + chroma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_source() {
        assert_eq!(FourCc::for_source(ChromaMode::Chroma420, 8, true), FourCc::Nv12);
        assert_eq!(FourCc::for_source(ChromaMode::Chroma420, 8, false), FourCc::I420);
        assert_eq!(FourCc::for_source(ChromaMode::Chroma420, 10, true), FourCc::P010);
        assert_eq!(FourCc::for_source(ChromaMode::Mono, 8, true), FourCc::Y800);
    }

    #[test]
    fn test_pitch_and_plane_sizes() {
        assert_eq!(FourCc::Nv12.min_pitch(1920), 1920);
        assert_eq!(FourCc::Nv12.min_pitch(1910), 1920);
        assert_eq!(FourCc::P010.min_pitch(1920), 3840);
        assert_eq!(FourCc::Nv12.chroma_size(1920, 1088), 1920 * 544);
        assert_eq!(FourCc::I420.chroma_size(1920, 1088), 960 * 544 * 2);
        assert_eq!(FourCc::Y800.chroma_size(1920, 1088), 0);
        assert_eq!(FourCc::Nv16.to_string(), "NV16");
    }

    #[test]
    fn test_packed_pixmap_layout() {
        let meta = PixMapMeta::packed(Dimension::new(64, 32), FourCc::Nv12);
        assert_eq!(meta.luma_pitch, 64);
        assert_eq!(meta.chroma_offset, 64 * 32);
        assert_eq!(meta.required_size(), 64 * 32 * 3 / 2);
    }
}
