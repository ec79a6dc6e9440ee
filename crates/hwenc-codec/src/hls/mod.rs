//! 高层语法 (参数集与 SEI) 状态.
//!
//! 每个编码通道持有一份当前生效的 VPS/SPS/PPS. 通道创建时由配置生成,
//! 之后根据硬件上报的图像状态逐帧更新, 并决定本帧是否必须重写 PPS/AUD.
//! 参数集与 SEI 的 RBSP 序列化通过 [`RbspWriter`] 完成, AVC 与 HEVC 各有实现.

pub mod avc;
pub mod hevc;

use hwenc_core::BitstreamLite;

use crate::encoder::settings::{EncSettings, RcMode, RcParam};
use crate::nal::Codec;
use crate::picture::{PicStatus, SliceType};

pub use avc::{AvcParamSets, AvcPps, AvcSps};
pub use hevc::{HevcParamSets, HevcPps, HevcSps, HevcVps, ProfileTierLevel};

/// CPB 时序数据, 供 BP/PT SEI 使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeiData {
    /// 初始 CPB 移除延迟 (90 kHz)
    pub initial_cpb_removal_delay: u32,
    /// 初始 CPB 移除偏移 (90 kHz)
    pub initial_cpb_removal_offset: u32,
    /// 自上一个 I 帧以来累计的 CPB 移除延迟 (场)
    pub cpb_removal_delay: u32,
}

impl SeiData {
    /// 由码控参数初始化
    pub fn new(rc: &RcParam) -> Self {
        Self {
            initial_cpb_removal_delay: rc.initial_rem_delay,
            initial_cpb_removal_offset: rc.cpb_size.saturating_sub(rc.initial_rem_delay),
            cpb_removal_delay: 0,
        }
    }

    /// 写完一帧的 SEI 之后推进 CPB 移除延迟: I 帧清零, 然后按场数累加
    pub fn advance(&mut self, status: &PicStatus) {
        if status.slice_type == SliceType::I {
            self.cpb_removal_delay = 0;
        }
        self.cpb_removal_delay += status.pic_struct.field_count();
    }
}

/// 假想参考解码器参数 (单个 CPB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HrdParams {
    pub nal_hrd: bool,
    pub vcl_hrd: bool,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: u32,
    pub cpb_size_value_minus1: u32,
    pub cbr: bool,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
    pub low_delay: bool,
}

impl HrdParams {
    /// 由码控参数计算 CPB 码率与大小
    pub fn from_rc(rc: &RcParam, cpb_delay_length_minus1: u8) -> Self {
        let (bit_rate_value_minus1, bit_rate_scale) = decompose(rc.max_bit_rate >> 6);
        let (cpb_size_value_minus1, cpb_size_scale) = decompose(rc.cpb_size_bits() >> 4);
        Self {
            nal_hrd: false,
            vcl_hrd: true,
            bit_rate_scale,
            cpb_size_scale,
            bit_rate_value_minus1,
            cpb_size_value_minus1,
            cbr: rc.mode == RcMode::Cbr,
            initial_cpb_removal_delay_length_minus1: 31,
            au_cpb_removal_delay_length_minus1: cpb_delay_length_minus1,
            dpb_output_delay_length_minus1: cpb_delay_length_minus1,
            time_offset_length: 0,
            low_delay: false,
        }
    }

    /// 是否存在 NAL 或 VCL HRD
    pub fn present(&self) -> bool {
        self.nal_hrd || self.vcl_hrd
    }

    /// BP SEI 中初始延迟字段的位数
    pub fn initial_cpb_len(&self) -> u32 {
        u32::from(self.initial_cpb_removal_delay_length_minus1) + 1
    }

    /// PT SEI 中 CPB 移除延迟字段的位数
    pub fn au_cpb_len(&self) -> u32 {
        u32::from(self.au_cpb_removal_delay_length_minus1) + 1
    }

    /// PT SEI 中 DPB 输出延迟字段的位数
    pub fn dpb_output_len(&self) -> u32 {
        u32::from(self.dpb_output_delay_length_minus1) + 1
    }

    /// 写入单个 CPB 的码率/大小/CBR (AVC hrd_parameters 与 HEVC sub_layer_hrd_parameters 共用)
    fn write_cpb(&self, bs: &mut BitstreamLite) {
        bs.put_ue(self.bit_rate_value_minus1);
        bs.put_ue(self.cpb_size_value_minus1);
        bs.put_bit(u8::from(self.cbr));
    }
}

/// value = (value_minus1 + 1) << scale, 尽量把 2 的幂次移入 scale (最大 15)
fn decompose(mut value: u32) -> (u32, u8) {
    let mut scale = 0u8;
    while value != 0 && scale < 15 && value % 2 == 0 {
        value >>= 1;
        scale += 1;
    }
    (value.saturating_sub(1), scale)
}

/// VUI 中的定时信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VuiTiming {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
}

impl VuiTiming {
    /// `ticks_per_frame` 为每帧的时钟节拍数 (AVC 为 2, HEVC 为 1)
    pub fn new(frame_rate: u16, clk_ratio: u16, ticks_per_frame: u32) -> Self {
        Self {
            num_units_in_tick: u32::from(clk_ratio),
            time_scale: u32::from(frame_rate) * 1000 * ticks_per_frame,
        }
    }
}

/// 视频信号描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSignal {
    pub video_format: u8,
    pub full_range: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

impl Default for VideoSignal {
    fn default() -> Self {
        // 未指定格式, BT.709
        Self {
            video_format: 5,
            full_range: false,
            colour_primaries: 1,
            transfer_characteristics: 1,
            matrix_coefficients: 1,
        }
    }
}

impl VideoSignal {
    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_bits(3, u32::from(self.video_format));
        bs.put_bit(u8::from(self.full_range));
        bs.put_bit(1); // colour_description_present_flag
        bs.put_bits(8, u32::from(self.colour_primaries));
        bs.put_bits(8, u32::from(self.transfer_characteristics));
        bs.put_bits(8, u32::from(self.matrix_coefficients));
    }
}

/// 裁剪窗口 (色度采样单位)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropWindow {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl CropWindow {
    /// 按编码对齐后的尺寸计算右/下裁剪量
    pub fn for_alignment(coded_w: u32, coded_h: u32, width: u32, height: u32, settings: &EncSettings) -> Self {
        let (unit_x, unit_y) = match settings.chroma_mode() {
            hwenc_core::ChromaMode::Chroma420 => (2, 2),
            hwenc_core::ChromaMode::Chroma422 => (2, 1),
            hwenc_core::ChromaMode::Mono => (1, 1),
        };
        Self {
            left: 0,
            right: coded_w.saturating_sub(width) / unit_x,
            top: 0,
            bottom: coded_h.saturating_sub(height) / unit_y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_ue(self.left);
        bs.put_ue(self.right);
        bs.put_ue(self.top);
        bs.put_ue(self.bottom);
    }
}

/// 参数集与 SEI 的 RBSP 序列化接口
///
/// 写入的是不含 NAL 头部与防竞争字节的 RBSP, 由调用方交给 NAL 输出.
pub trait RbspWriter: Send {
    /// 编码标准
    fn codec(&self) -> Codec;

    /// 访问单元分隔符
    fn write_aud(&self, bs: &mut BitstreamLite, slice_type: SliceType) {
        bs.put_bits(3, slice_type.primary_pic_type());
        bs.rbsp_trailing_bits();
    }

    /// 是否有 VPS
    fn has_vps(&self) -> bool {
        false
    }

    /// 视频参数集
    fn write_vps(&self, _bs: &mut BitstreamLite) {}

    /// 序列参数集
    fn write_sps(&self, bs: &mut BitstreamLite);

    /// 图像参数集
    fn write_pps(&self, bs: &mut BitstreamLite);

    /// 是否支持 active parameter sets SEI
    fn has_aps(&self) -> bool {
        false
    }

    /// active parameter sets SEI 消息
    fn write_sei_aps(&self, _bs: &mut BitstreamLite) {}

    /// buffering period SEI 消息
    fn write_sei_bp(&self, bs: &mut BitstreamLite, sei: &SeiData);

    /// recovery point SEI 消息
    fn write_sei_rp(&self, bs: &mut BitstreamLite, recovery_cnt: u32);

    /// picture timing SEI 消息
    fn write_sei_pt(&self, bs: &mut BitstreamLite, sei: &SeiData, status: &PicStatus);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::PicStruct;

    #[test]
    fn test_decompose() {
        assert_eq!(decompose(4_000_000 >> 6), (15624, 2));
        assert_eq!(decompose(7), (6, 0));
        assert_eq!(decompose(0), (0, 0));
        assert_eq!(decompose(1 << 20), (31, 15));
    }

    #[test]
    fn test_cpb_removal_delay_accumulates_fields() {
        let mut sei = SeiData::default();
        let mut status = PicStatus {
            slice_type: SliceType::I,
            ..Default::default()
        };
        sei.advance(&status);
        assert_eq!(sei.cpb_removal_delay, 2);

        status.slice_type = SliceType::P;
        sei.advance(&status);
        status.pic_struct = PicStruct::Top;
        sei.advance(&status);
        assert_eq!(sei.cpb_removal_delay, 5);

        status.slice_type = SliceType::I;
        status.pic_struct = PicStruct::Frame;
        sei.advance(&status);
        assert_eq!(sei.cpb_removal_delay, 2, "I 帧应重置累计延迟");
    }

    #[test]
    fn test_vui_timing_ntsc() {
        let timing = VuiTiming::new(30, 1001, 2);
        assert_eq!(timing.num_units_in_tick, 1001);
        assert_eq!(timing.time_scale, 60_000);
    }
}
