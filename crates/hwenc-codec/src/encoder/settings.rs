//! 编码通道配置.
//!
//! [`EncSettings`] 可由 JSON 文件加载, 缺省字段取默认值.

use hwenc_core::{ChromaMode, Dimension, EncError, EncResult, FourCc};
use serde::{Deserialize, Serialize};

use crate::nal::{Codec, StartCodeMode};
use crate::sei::{HdrSeis, SeiFlags};
use crate::stream::MAX_ENC_SLICE;

/// QP 合法范围
pub const MIN_QP: i16 = 0;
pub const MAX_QP: i16 = 51;
/// 环路滤波 beta/tc 偏移范围
pub const LF_OFFSET_RANGE: std::ops::RangeInclusive<i8> = -6..=6;
/// 色度 QP 偏移范围
pub const CHROMA_QP_OFFSET_RANGE: std::ops::RangeInclusive<i8> = -12..=12;

/// 编码档次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Profile {
    AvcBaseline,
    AvcMain,
    AvcHigh,
    AvcHigh10,
    AvcHigh422,
    #[default]
    HevcMain,
    HevcMain10,
    HevcMain422_10,
}

impl Profile {
    /// 所属编码标准
    pub fn codec(&self) -> Codec {
        match self {
            Self::AvcBaseline | Self::AvcMain | Self::AvcHigh | Self::AvcHigh10 | Self::AvcHigh422 => Codec::Avc,
            Self::HevcMain | Self::HevcMain10 | Self::HevcMain422_10 => Codec::Hevc,
        }
    }

    /// profile_idc
    pub fn profile_idc(&self) -> u8 {
        match self {
            Self::AvcBaseline => 66,
            Self::AvcMain => 77,
            Self::AvcHigh => 100,
            Self::AvcHigh10 => 110,
            Self::AvcHigh422 => 122,
            Self::HevcMain => 1,
            Self::HevcMain10 => 2,
            Self::HevcMain422_10 => 4,
        }
    }

    /// AVC constraint_set0..5 标志 (bit0 = constraint_set0_flag)
    pub fn constraint_flags(&self) -> u8 {
        match self {
            // constrained baseline
            Self::AvcBaseline => 0b0000_0011,
            Self::AvcMain => 0b0000_0010,
            _ => 0,
        }
    }

    /// 档次允许的最大位深
    pub fn max_bit_depth(&self) -> u8 {
        match self {
            Self::AvcHigh10 | Self::AvcHigh422 | Self::HevcMain10 | Self::HevcMain422_10 => 10,
            _ => 8,
        }
    }

    /// 档次是否允许该色度采样
    pub fn supports_chroma(&self, chroma: ChromaMode) -> bool {
        match chroma {
            ChromaMode::Chroma420 => true,
            ChromaMode::Mono => !matches!(self, Self::AvcBaseline | Self::AvcMain | Self::HevcMain | Self::HevcMain10),
            ChromaMode::Chroma422 => matches!(self, Self::AvcHigh422 | Self::HevcMain422_10),
        }
    }
}

/// GOP 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GopParam {
    /// GOP 长度 (I 帧间隔)
    pub length: u32,
    /// 连续 B 帧数
    pub num_b: u32,
    /// IDR 间隔 (帧), 0 表示只有首帧
    pub freq_idr: u32,
    /// 是否启用长期参考
    pub enable_lt: bool,
    /// 长期参考帧间隔, 0 表示关闭
    pub freq_lt: u32,
}

impl Default for GopParam {
    fn default() -> Self {
        Self {
            length: 30,
            num_b: 0,
            freq_idr: 0,
            enable_lt: false,
            freq_lt: 0,
        }
    }
}

/// 码率控制模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RcMode {
    ConstQp,
    #[default]
    Cbr,
    Vbr,
    CappedVbr,
}

/// 码率控制参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcParam {
    pub mode: RcMode,
    /// 目标码率 (bps)
    pub target_bit_rate: u32,
    /// 最大码率 (bps)
    pub max_bit_rate: u32,
    /// 帧率 (整数部分, 配合 clk_ratio)
    pub frame_rate: u16,
    /// 时钟比, 1000 表示整数帧率, 1001 表示 NTSC 帧率
    pub clk_ratio: u16,
    /// 初始 QP, -1 表示自动
    pub init_qp: i16,
    /// 每种 slice 类型的最小 QP (I, P, B)
    pub min_qp: [i16; 3],
    /// 每种 slice 类型的最大 QP (I, P, B)
    pub max_qp: [i16; 3],
    /// I/P QP 差
    pub ip_delta: i16,
    /// P/B QP 差
    pub pb_delta: i16,
    /// CPB 大小 (90 kHz 时钟)
    pub cpb_size: u32,
    /// 初始移除延迟 (90 kHz 时钟)
    pub initial_rem_delay: u32,
    /// 每种 slice 类型的最大图像大小 (bit), 0 表示不限制
    pub max_picture_size: [u32; 3],
    /// 是否启用自动 QP
    pub auto_qp: bool,
}

impl Default for RcParam {
    fn default() -> Self {
        Self {
            mode: RcMode::Cbr,
            target_bit_rate: 4_000_000,
            max_bit_rate: 4_000_000,
            frame_rate: 30,
            clk_ratio: 1000,
            init_qp: -1,
            min_qp: [MIN_QP; 3],
            max_qp: [MAX_QP; 3],
            ip_delta: -1,
            pb_delta: -1,
            cpb_size: 135_000,
            initial_rem_delay: 135_000,
            max_picture_size: [0; 3],
            auto_qp: false,
        }
    }
}

impl RcParam {
    /// CPB 大小 (bit)
    pub fn cpb_size_bits(&self) -> u32 {
        let bits = u64::from(self.cpb_size) * u64::from(self.max_bit_rate) / 90_000;
        bits.min(u64::from(u32::MAX)) as u32
    }
}

/// 填充数据模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FillerMode {
    #[default]
    Disable,
    /// 编码器写入完整的填充数据
    Enable,
    /// 只写填充 NAL 框架, 负载由应用填写
    App,
}

/// QP 表使用方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QpTableMode {
    #[default]
    None,
    /// QP 表给出相对码控 QP 的偏移
    Relative,
    /// QP 表给出绝对 QP
    Absolute,
}

/// 编码通道配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncSettings {
    pub profile: Profile,
    /// level × 10 (例如 51 表示 5.1)
    pub level: u8,
    /// HEVC 高 tier
    pub high_tier: bool,
    /// 编码尺寸
    pub width: u32,
    pub height: u32,
    /// 动态分辨率允许的最大尺寸, 0 表示与编码尺寸相同
    pub max_width: u32,
    pub max_height: u32,
    /// LCU 尺寸 (log2), 0 表示取编码标准默认值
    pub lcu_log2: u8,
    /// 源帧格式
    pub fourcc: FourCc,
    pub gop: GopParam,
    pub rc: RcParam,
    pub enable_aud: bool,
    pub filler: FillerMode,
    pub sei_flags: SeiFlags,
    /// 子帧低延迟模式: 每个 slice 单独返回
    pub subframe_latency: bool,
    /// IDR 也写 recovery point SEI
    pub force_rp_on_idr: bool,
    pub start_code: StartCodeMode,
    /// 环路滤波 beta_offset_div2
    pub beta_offset: i8,
    /// 环路滤波 tc_offset_div2
    pub tc_offset: i8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    /// 每帧 slice 数
    pub num_slices: u16,
    pub hdr: HdrSeis,
    pub qp_table: QpTableMode,
    /// 参考帧数 (list0)
    pub num_ref_idx: u8,
    /// AVC 熵编码使用 CABAC
    pub cabac: bool,
    /// 隔行 (场) 编码
    pub interlaced: bool,
}

impl Default for EncSettings {
    fn default() -> Self {
        Self {
            profile: Profile::HevcMain,
            level: 51,
            high_tier: false,
            width: 1920,
            height: 1080,
            max_width: 0,
            max_height: 0,
            lcu_log2: 0,
            fourcc: FourCc::Nv12,
            gop: GopParam::default(),
            rc: RcParam::default(),
            enable_aud: true,
            filler: FillerMode::Disable,
            sei_flags: SeiFlags::empty(),
            subframe_latency: false,
            force_rp_on_idr: false,
            start_code: StartCodeMode::Auto,
            beta_offset: 0,
            tc_offset: 0,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            num_slices: 1,
            hdr: HdrSeis::default(),
            qp_table: QpTableMode::None,
            num_ref_idx: 1,
            cabac: true,
            interlaced: false,
        }
    }
}

impl EncSettings {
    /// 编码标准
    pub fn codec(&self) -> Codec {
        self.profile.codec()
    }

    /// 编码尺寸
    pub fn dim(&self) -> Dimension {
        Dimension::new(self.width, self.height)
    }

    /// 最大尺寸
    pub fn max_dim(&self) -> Dimension {
        Dimension::new(self.max_width.max(self.width), self.max_height.max(self.height))
    }

    /// LCU 尺寸 (log2)
    pub fn lcu_log2(&self) -> u8 {
        if self.lcu_log2 == 0 {
            self.codec().default_lcu_log2()
        } else {
            self.lcu_log2
        }
    }

    /// 位深
    pub fn bit_depth(&self) -> u8 {
        self.fourcc.bit_depth()
    }

    /// 色度采样
    pub fn chroma_mode(&self) -> ChromaMode {
        self.fourcc.chroma_mode()
    }

    /// 检查配置一致性
    pub fn validate(&self) -> EncResult<()> {
        let codec = self.codec();
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(EncError::InvalidArgument(format!(
                "编码尺寸 {}x{} 必须为非零偶数",
                self.width, self.height
            )));
        }
        let lcu_range = match codec {
            Codec::Avc => 4..=4,
            Codec::Hevc => 4..=6,
        };
        if !lcu_range.contains(&self.lcu_log2()) {
            return Err(EncError::InvalidArgument(format!(
                "{} 不支持 LCU 尺寸 {}",
                codec,
                1u32 << self.lcu_log2()
            )));
        }
        if self.bit_depth() > self.profile.max_bit_depth() {
            return Err(EncError::Unsupported(format!(
                "档次 {:?} 不支持 {} 位源格式 {}",
                self.profile,
                self.bit_depth(),
                self.fourcc
            )));
        }
        if !self.profile.supports_chroma(self.chroma_mode()) {
            return Err(EncError::Unsupported(format!(
                "档次 {:?} 不支持色度格式 {:?}",
                self.profile,
                self.chroma_mode()
            )));
        }
        if self.level < 10 || self.level > 62 {
            return Err(EncError::InvalidArgument(format!("无效 level: {}", self.level)));
        }
        if self.gop.length == 0 {
            return Err(EncError::InvalidArgument("GOP 长度不能为 0".into()));
        }
        if self.rc.frame_rate == 0 || self.rc.clk_ratio == 0 {
            return Err(EncError::InvalidArgument("帧率与时钟比不能为 0".into()));
        }
        if self.rc.mode != RcMode::ConstQp && self.rc.target_bit_rate == 0 {
            return Err(EncError::InvalidArgument("码率控制模式下目标码率不能为 0".into()));
        }
        for slice in 0..3 {
            check_qp_bounds(self.rc.min_qp[slice], self.rc.max_qp[slice])?;
        }
        if self.num_slices == 0 || usize::from(self.num_slices) > MAX_ENC_SLICE {
            return Err(EncError::InvalidArgument(format!(
                "slice 数 {} 超出范围 1..={}",
                self.num_slices, MAX_ENC_SLICE
            )));
        }
        check_lf_offset("beta", self.beta_offset)?;
        check_lf_offset("tc", self.tc_offset)?;
        check_chroma_offsets(self.cb_qp_offset, self.cr_qp_offset)?;
        if self.num_ref_idx == 0 {
            return Err(EncError::InvalidArgument("参考帧数不能为 0".into()));
        }
        Ok(())
    }
}

/// QP 取值检查, -1 表示自动
pub fn check_qp(qp: i16) -> EncResult<()> {
    if !(-1..=MAX_QP).contains(&qp) {
        return Err(EncError::InvalidArgument(format!("QP {} 超出范围 -1..={}", qp, MAX_QP)));
    }
    Ok(())
}

/// QP 上下界检查
pub fn check_qp_bounds(min: i16, max: i16) -> EncResult<()> {
    if min < MIN_QP || max > MAX_QP || min > max {
        return Err(EncError::InvalidArgument(format!("无效 QP 范围 [{}; {}]", min, max)));
    }
    Ok(())
}

/// 环路滤波偏移检查
pub fn check_lf_offset(name: &str, offset: i8) -> EncResult<()> {
    if !LF_OFFSET_RANGE.contains(&offset) {
        return Err(EncError::InvalidArgument(format!("环路滤波 {} 偏移 {} 超出范围 -6..=6", name, offset)));
    }
    Ok(())
}

/// 色度 QP 偏移检查
pub fn check_chroma_offsets(cb: i8, cr: i8) -> EncResult<()> {
    if !CHROMA_QP_OFFSET_RANGE.contains(&cb) || !CHROMA_QP_OFFSET_RANGE.contains(&cr) {
        return Err(EncError::InvalidArgument(format!("色度 QP 偏移 [{}; {}] 超出范围 -12..=12", cb, cr)));
    }
    Ok(())
}
