//! 硬件上报的编码图像状态.

use hwenc_core::{Dimension, EncError};
use serde::{Deserialize, Serialize};

/// slice 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SliceType {
    B,
    #[default]
    P,
    I,
}

impl SliceType {
    /// AUD 的 primary_pic_type / pic_type
    pub fn primary_pic_type(&self) -> u32 {
        match self {
            Self::I => 0,
            Self::P => 1,
            Self::B => 2,
        }
    }

    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I)
    }

    /// 在按 (I, P, B) 排列的码控参数数组中的下标
    pub fn rc_index(&self) -> usize {
        match self {
            Self::I => 0,
            Self::P => 1,
            Self::B => 2,
        }
    }
}

/// 图像结构 (帧/场)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PicStruct {
    #[default]
    Frame,
    Top,
    Bottom,
    TopBottom,
    BottomTop,
    TopBottomTop,
    BottomTopBottom,
    FrameDoubling,
    FrameTripling,
}

impl PicStruct {
    /// pic_struct 语法元素值
    pub fn id(&self) -> u32 {
        *self as u32
    }

    /// 本图像占用的场数, 用于 CPB 移除延迟累加
    pub fn field_count(&self) -> u32 {
        match self {
            Self::Frame => 2,
            Self::Top | Self::Bottom => 1,
            Self::TopBottom | Self::BottomTop => 2,
            Self::TopBottomTop | Self::BottomTopBottom => 3,
            Self::FrameDoubling => 4,
            Self::FrameTripling => 6,
        }
    }

    /// pic_timing 中的 NumClockTS (H.264 表 D-1)
    pub fn num_clock_ts(&self) -> u32 {
        match self {
            Self::Frame | Self::Top | Self::Bottom => 1,
            Self::TopBottom | Self::BottomTop | Self::FrameDoubling => 2,
            Self::TopBottomTop | Self::BottomTopBottom | Self::FrameTripling => 3,
        }
    }
}

/// 硬件写入码流缓冲区的一段 slice 数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamPart {
    /// 偏移 (相对缓冲区起点)
    pub offset: u32,
    /// 长度
    pub size: u32,
}

/// 硬件实际使用的 tile 划分 (LCU 单位)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TileLayout {
    pub column_widths: Vec<u16>,
    pub row_heights: Vec<u16>,
}

impl TileLayout {
    /// 是否真正划分了多个 tile
    pub fn is_split(&self) -> bool {
        self.column_widths.len() > 1 || self.row_heights.len() > 1
    }
}

/// 硬件确认生效的高层语法变化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HlsInfo {
    /// 分辨率已切换
    pub resolution_changed: bool,
    /// 新的参数集 id
    pub nal_id: u8,
    /// 环路滤波偏移已变化
    pub lf_offset_changed: bool,
    /// beta_offset_div2
    pub beta_offset: i8,
    /// tc_offset_div2
    pub tc_offset: i8,
    /// 帧率已变化 (frame_rate, clk_ratio)
    pub frame_rate: Option<(u16, u16)>,
    /// 当前生效的色度 QP 偏移 (cb, cr)
    pub chroma_qp_offsets: Option<(i8, i8)>,
}

/// 编码器错误码, 由 `last_error()` 查询
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    Success,
    /// 帧被跳过 (码率控制), 属于警告
    WarnSkipped,
    /// LCU 码流超限, 属于警告
    WarnLcuOverflow,
    /// 码流缓冲区不足
    StreamOverflow,
    /// 内存不足
    NoMemory,
    /// 通道资源不足
    ChannelResource,
    /// 参数无效
    InvalidArgument,
    /// 源缓冲区不匹配
    SourceMismatch,
    /// 不支持
    Unsupported,
    /// 调度器失败
    Scheduler,
    /// 其他错误
    Internal,
}

impl ErrorCode {
    /// 是否为真正的错误 (警告不算)
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success | Self::WarnSkipped | Self::WarnLcuOverflow)
    }
}

impl From<&EncError> for ErrorCode {
    fn from(e: &EncError) -> Self {
        match e {
            EncError::InvalidArgument(_) => Self::InvalidArgument,
            EncError::Unsupported(_) => Self::Unsupported,
            EncError::OutOfMemory(_) => Self::NoMemory,
            EncError::CapacityOverflow(_) => Self::StreamOverflow,
            EncError::SourceFormatMismatch(_) => Self::SourceMismatch,
            EncError::Scheduler(_) => Self::Scheduler,
            _ => Self::Internal,
        }
    }
}

/// 一个 slice (或整帧) 编码完成后的状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PicStatus {
    /// slice 类型
    pub slice_type: SliceType,
    /// 是否为 IDR
    pub is_idr: bool,
    /// 是否为本帧第一个 slice
    pub is_first_slice: bool,
    /// 是否为本帧最后一个 slice
    pub is_last_slice: bool,
    /// 恢复点计数 (非零表示逐步刷新的恢复点)
    pub recovery_cnt: u32,
    /// 时间层 id
    pub temporal_id: u8,
    /// 图像结构
    pub pic_struct: PicStruct,
    /// DPB 输出延迟
    pub dpb_output_delay: u32,
    /// 需要写入的填充字节数
    pub filler: usize,
    /// slice 数据分段
    pub stream_parts: Vec<StreamPart>,
    /// PPS 的初始 QP
    pub pps_qp: i32,
    /// CU 级 QP 差分深度
    pub cu_qp_delta_depth: u8,
    /// tile 划分, None 表示单 tile
    pub tiles: Option<TileLayout>,
    /// 编码尺寸
    pub pic_dim: Dimension,
    /// 高层语法变化
    pub hls: HlsInfo,
    /// 错误码
    pub error: ErrorCode,
}

impl PicStatus {
    /// 是否为随机访问点 (需要重发 SPS/VPS)
    pub fn is_random_access_point(&self) -> bool {
        self.is_idr || self.recovery_cnt > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_count() {
        assert_eq!(PicStruct::Frame.field_count(), 2);
        assert_eq!(PicStruct::Top.field_count(), 1);
        assert_eq!(PicStruct::FrameTripling.field_count(), 6);
        assert_eq!(PicStruct::BottomTop.id(), 4);
    }

    #[test]
    fn test_error_code_severity() {
        assert!(!ErrorCode::WarnSkipped.is_error());
        assert!(ErrorCode::StreamOverflow.is_error());
        let code = ErrorCode::from(&EncError::InvalidArgument("qp".into()));
        assert_eq!(code, ErrorCode::InvalidArgument);
    }
}
