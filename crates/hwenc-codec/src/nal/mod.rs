//! NAL 单元类型与头部.
//!
//! H.264 NAL 头部为 1 字节:
//! - forbidden_zero_bit (1 bit)
//! - nal_ref_idc (2 bits)
//! - nal_unit_type (5 bits)
//!
//! H.265 NAL 头部为 2 字节:
//! - forbidden_zero_bit (1 bit)
//! - nal_unit_type (6 bits)
//! - nuh_layer_id (6 bits)
//! - nuh_temporal_id_plus1 (3 bits)

pub mod emitter;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use emitter::{StartCodeMode, anti_emulate, flush_nal, write_filler_data, write_start_code};

/// 编码标准
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    /// H.264 / AVC
    Avc,
    /// H.265 / HEVC
    Hevc,
}

impl Codec {
    /// 默认 LCU 尺寸 (log2): AVC 宏块 16, HEVC CTB 32
    pub fn default_lcu_log2(&self) -> u8 {
        match self {
            Self::Avc => 4,
            Self::Hevc => 5,
        }
    }

    /// 该 NAL 类型是否需要 4 字节起始码 (多出的 zero_byte)
    pub fn needs_zero_byte(&self, nut: u8) -> bool {
        match self {
            Self::Avc => (AvcNalType::Sei.type_id()..=AvcNalType::SubSps.type_id()).contains(&nut),
            Self::Hevc => (HevcNalType::Vps.type_id()..=HevcNalType::SuffixSei.type_id()).contains(&nut),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avc => write!(f, "AVC"),
            Self::Hevc => write!(f, "HEVC"),
        }
    }
}

/// H.264 NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AvcNalType {
    /// 非 IDR 图像的编码 slice
    Slice,
    /// IDR 图像的编码 slice
    SliceIdr,
    /// 补充增强信息
    Sei,
    /// 序列参数集
    Sps,
    /// 图像参数集
    Pps,
    /// 访问单元分隔符
    Aud,
    /// 序列结束
    EndOfSequence,
    /// 码流结束
    EndOfStream,
    /// 填充数据
    FillerData,
    /// SPS 扩展
    SpsExt,
    /// 前缀 NAL
    Prefix,
    /// 子集 SPS
    SubSps,
    /// 未知类型
    Unknown(u8),
}

impl AvcNalType {
    /// 从类型编号创建
    pub fn from_type_id(id: u8) -> Self {
        match id {
            1 => Self::Slice,
            5 => Self::SliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::FillerData,
            13 => Self::SpsExt,
            14 => Self::Prefix,
            15 => Self::SubSps,
            _ => Self::Unknown(id),
        }
    }

    /// 获取类型编号
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Slice => 1,
            Self::SliceIdr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::Aud => 9,
            Self::EndOfSequence => 10,
            Self::EndOfStream => 11,
            Self::FillerData => 12,
            Self::SpsExt => 13,
            Self::Prefix => 14,
            Self::SubSps => 15,
            Self::Unknown(id) => *id,
        }
    }

    /// 是否为 VCL NAL
    pub fn is_vcl(&self) -> bool {
        (1..=5).contains(&self.type_id())
    }
}

/// H.265 NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HevcNalType {
    /// TRAIL_N
    TrailN,
    /// TRAIL_R
    TrailR,
    /// IDR_W_RADL
    IdrWRadl,
    /// IDR_N_LP
    IdrNLp,
    /// CRA_NUT
    Cra,
    /// VPS
    Vps,
    /// SPS
    Sps,
    /// PPS
    Pps,
    /// AUD
    Aud,
    /// EOS
    Eos,
    /// EOB
    Eob,
    /// FD
    FillerData,
    /// PREFIX_SEI
    PrefixSei,
    /// SUFFIX_SEI
    SuffixSei,
    /// 其他类型
    Unknown(u8),
}

impl HevcNalType {
    /// 从类型编号创建
    pub fn from_type_id(id: u8) -> Self {
        match id {
            0 => Self::TrailN,
            1 => Self::TrailR,
            19 => Self::IdrWRadl,
            20 => Self::IdrNLp,
            21 => Self::Cra,
            32 => Self::Vps,
            33 => Self::Sps,
            34 => Self::Pps,
            35 => Self::Aud,
            36 => Self::Eos,
            37 => Self::Eob,
            38 => Self::FillerData,
            39 => Self::PrefixSei,
            40 => Self::SuffixSei,
            _ => Self::Unknown(id),
        }
    }

    /// 获取类型编号
    pub fn type_id(&self) -> u8 {
        match self {
            Self::TrailN => 0,
            Self::TrailR => 1,
            Self::IdrWRadl => 19,
            Self::IdrNLp => 20,
            Self::Cra => 21,
            Self::Vps => 32,
            Self::Sps => 33,
            Self::Pps => 34,
            Self::Aud => 35,
            Self::Eos => 36,
            Self::Eob => 37,
            Self::FillerData => 38,
            Self::PrefixSei => 39,
            Self::SuffixSei => 40,
            Self::Unknown(id) => *id,
        }
    }

    /// 是否为 VCL NAL
    pub fn is_vcl(&self) -> bool {
        self.type_id() < 32
    }
}

/// 已序列化的 NAL 头部 (1 或 2 字节)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NalHeader {
    bytes: [u8; 2],
    size: usize,
}

impl NalHeader {
    /// H.264 头部
    pub fn avc(nut: u8, nal_ref_idc: u8) -> Self {
        Self {
            bytes: [((nal_ref_idc & 0x03) << 5) | (nut & 0x1F), 0],
            size: 1,
        }
    }

    /// H.265 头部
    pub fn hevc(nut: u8, layer_id: u8, temporal_id: u8) -> Self {
        Self {
            bytes: [
                ((nut & 0x3F) << 1) | ((layer_id >> 5) & 0x01),
                ((layer_id & 0x1F) << 3) | ((temporal_id + 1) & 0x07),
            ],
            size: 2,
        }
    }

    /// 头部字节
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size]
    }

    /// 头部长度 (字节)
    pub fn len(&self) -> usize {
        self.size
    }

    /// 是否为空头部
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// 一种编码标准下编码器会用到的 NAL 类型集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nuts {
    /// 编码标准
    pub codec: Codec,
    /// 访问单元分隔符
    pub aud: u8,
    /// 视频参数集 (仅 HEVC)
    pub vps: Option<u8>,
    /// 序列参数集
    pub sps: u8,
    /// 图像参数集
    pub pps: u8,
    /// 填充数据
    pub filler: u8,
    /// 前缀 SEI
    pub sei_prefix: u8,
    /// 后缀 SEI
    pub sei_suffix: u8,
    /// 序列结束
    pub eos: u8,
}

impl Nuts {
    /// 按编码标准选择 NAL 类型集合
    pub fn for_codec(codec: Codec) -> Self {
        match codec {
            Codec::Avc => Self {
                codec,
                aud: AvcNalType::Aud.type_id(),
                vps: None,
                sps: AvcNalType::Sps.type_id(),
                pps: AvcNalType::Pps.type_id(),
                filler: AvcNalType::FillerData.type_id(),
                sei_prefix: AvcNalType::Sei.type_id(),
                sei_suffix: AvcNalType::Sei.type_id(),
                eos: AvcNalType::EndOfSequence.type_id(),
            },
            Codec::Hevc => Self {
                codec,
                aud: HevcNalType::Aud.type_id(),
                vps: Some(HevcNalType::Vps.type_id()),
                sps: HevcNalType::Sps.type_id(),
                pps: HevcNalType::Pps.type_id(),
                filler: HevcNalType::FillerData.type_id(),
                sei_prefix: HevcNalType::PrefixSei.type_id(),
                sei_suffix: HevcNalType::SuffixSei.type_id(),
                eos: HevcNalType::Eos.type_id(),
            },
        }
    }

    /// 构造 NAL 头部, AVC 忽略 layer/temporal id, HEVC 忽略 nal_ref_idc
    pub fn header(&self, nut: u8, nal_ref_idc: u8, layer_id: u8, temporal_id: u8) -> NalHeader {
        match self.codec {
            Codec::Avc => NalHeader::avc(nut, nal_ref_idc),
            Codec::Hevc => NalHeader::hevc(nut, layer_id, temporal_id),
        }
    }
}
