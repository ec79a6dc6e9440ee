//! 动态命令接收方.
//!
//! [`CommandManager`](crate::command_manager::CommandManager) 把命令文件中的条目
//! 翻译为 [`CommandsSender`] 调用. [`EncoderCommandsSender`] 将其转发给编码通道,
//! 调用失败只记录警告, 不中断编码.

use hwenc_codec::{Encoder, SliceType};
use hwenc_core::EncResult;
use log::{debug, warn};

/// 命令文件支持的全部动态命令
pub trait CommandsSender {
    fn notify_scene_change(&mut self, lookahead: u32);
    fn notify_is_long_term(&mut self);
    fn notify_use_long_term(&mut self);
    fn restart_gop(&mut self);
    fn restart_gop_recovery_point(&mut self);
    fn set_gop_length(&mut self, length: u32);
    fn set_num_b(&mut self, num_b: u32);
    fn set_freq_idr(&mut self, freq_idr: u32);
    fn set_frame_rate(&mut self, frame_rate: u16, clk_ratio: u16);
    fn set_bit_rate(&mut self, bit_rate: u32);
    fn set_max_bit_rate(&mut self, target: u32, max: u32);
    fn set_qp(&mut self, qp: i16);
    fn set_qp_offset(&mut self, offset: i16);
    fn set_qp_bounds(&mut self, min_qp: i16, max_qp: i16);
    fn set_qp_bounds_per_frame_type(&mut self, slice_type: SliceType, min_qp: i16, max_qp: i16);
    fn set_qp_ip_delta(&mut self, delta: i16);
    fn set_qp_pb_delta(&mut self, delta: i16);
    /// 切换到第 `index` 个输入分辨率
    fn set_dynamic_input(&mut self, index: usize);
    fn set_lf_beta_offset(&mut self, offset: i8);
    fn set_lf_tc_offset(&mut self, offset: i8);
    fn set_cost_mode(&mut self, cost_mode: bool);
    fn set_max_picture_size(&mut self, max_size: u32);
    fn set_max_picture_size_per_frame_type(&mut self, slice_type: SliceType, max_size: u32);
    fn set_qp_chroma_offsets(&mut self, cb: i8, cr: i8);
    fn set_auto_qp(&mut self, auto_qp: bool);
    /// 切换到第 `index` 组 HDR SEI
    fn set_hdr_index(&mut self, index: usize);
}

/// 转发到编码通道的命令接收方
pub struct EncoderCommandsSender<'a> {
    encoder: &'a Encoder,
    input_index: Option<usize>,
    hdr_index: Option<usize>,
}

impl<'a> EncoderCommandsSender<'a> {
    pub fn new(encoder: &'a Encoder) -> Self {
        Self {
            encoder,
            input_index: None,
            hdr_index: None,
        }
    }

    /// 上一帧之后请求的输入分辨率索引
    pub fn has_input_changed(&self) -> Option<usize> {
        self.input_index
    }

    /// 上一帧之后请求的 HDR SEI 索引
    pub fn has_hdr_changed(&self) -> Option<usize> {
        self.hdr_index
    }

    pub fn reset(&mut self) {
        self.input_index = None;
        self.hdr_index = None;
    }

    fn check(&self, name: &str, result: EncResult<()>) {
        match result {
            Ok(()) => debug!("{} 已暂存", name),
            Err(e) => warn!("{} 失败: {} (last error {:?})", name, e, self.encoder.last_error()),
        }
    }
}

impl CommandsSender for EncoderCommandsSender<'_> {
    fn notify_scene_change(&mut self, lookahead: u32) {
        self.check("notify_scene_change", self.encoder.notify_scene_change(lookahead));
    }

    fn notify_is_long_term(&mut self) {
        self.check("notify_is_long_term", self.encoder.notify_is_long_term());
    }

    fn notify_use_long_term(&mut self) {
        self.check("notify_use_long_term", self.encoder.notify_use_long_term());
    }

    fn restart_gop(&mut self) {
        self.check("restart_gop", self.encoder.restart_gop());
    }

    fn restart_gop_recovery_point(&mut self) {
        self.check("restart_gop_recovery_point", self.encoder.restart_gop_recovery_point());
    }

    fn set_gop_length(&mut self, length: u32) {
        self.check("set_gop_length", self.encoder.set_gop_length(length));
    }

    fn set_num_b(&mut self, num_b: u32) {
        self.check("set_gop_num_b", self.encoder.set_gop_num_b(num_b));
    }

    fn set_freq_idr(&mut self, freq_idr: u32) {
        self.check("set_freq_idr", self.encoder.set_freq_idr(freq_idr));
    }

    fn set_frame_rate(&mut self, frame_rate: u16, clk_ratio: u16) {
        self.check("set_frame_rate", self.encoder.set_frame_rate(frame_rate, clk_ratio));
    }

    fn set_bit_rate(&mut self, bit_rate: u32) {
        self.check("set_bit_rate", self.encoder.set_bit_rate(bit_rate));
    }

    fn set_max_bit_rate(&mut self, target: u32, max: u32) {
        self.check("set_max_bit_rate", self.encoder.set_max_bit_rate(target, max));
    }

    fn set_qp(&mut self, qp: i16) {
        self.check("set_qp", self.encoder.set_qp(qp));
    }

    fn set_qp_offset(&mut self, offset: i16) {
        self.check("set_qp_offset", self.encoder.set_qp_offset(offset));
    }

    fn set_qp_bounds(&mut self, min_qp: i16, max_qp: i16) {
        self.check("set_qp_bounds", self.encoder.set_qp_bounds(min_qp, max_qp));
    }

    fn set_qp_bounds_per_frame_type(&mut self, slice_type: SliceType, min_qp: i16, max_qp: i16) {
        self.check(
            "set_qp_bounds_per_frame_type",
            self.encoder.set_qp_bounds_per_frame_type(slice_type, min_qp, max_qp),
        );
    }

    fn set_qp_ip_delta(&mut self, delta: i16) {
        self.check("set_qp_ip_delta", self.encoder.set_qp_ip_delta(delta));
    }

    fn set_qp_pb_delta(&mut self, delta: i16) {
        self.check("set_qp_pb_delta", self.encoder.set_qp_pb_delta(delta));
    }

    fn set_dynamic_input(&mut self, index: usize) {
        self.input_index = Some(index);
    }

    fn set_lf_beta_offset(&mut self, offset: i8) {
        self.check("set_loop_filter_beta_offset", self.encoder.set_loop_filter_beta_offset(offset));
    }

    fn set_lf_tc_offset(&mut self, offset: i8) {
        self.check("set_loop_filter_tc_offset", self.encoder.set_loop_filter_tc_offset(offset));
    }

    fn set_cost_mode(&mut self, cost_mode: bool) {
        self.check("set_cost_mode", self.encoder.set_cost_mode(cost_mode));
    }

    fn set_max_picture_size(&mut self, max_size: u32) {
        self.check("set_max_picture_size", self.encoder.set_max_picture_size(max_size));
    }

    fn set_max_picture_size_per_frame_type(&mut self, slice_type: SliceType, max_size: u32) {
        let mut sizes = self.encoder.settings().rc.max_picture_size;
        sizes[slice_type.rc_index()] = max_size;
        self.check(
            "set_max_picture_size_per_frame_type",
            self.encoder.set_max_picture_size_per_frame_type(sizes),
        );
    }

    fn set_qp_chroma_offsets(&mut self, cb: i8, cr: i8) {
        self.check("set_qp_chroma_offsets", self.encoder.set_qp_chroma_offsets(cb, cr));
    }

    fn set_auto_qp(&mut self, auto_qp: bool) {
        self.check("set_auto_qp", self.encoder.set_auto_qp(auto_qp));
    }

    fn set_hdr_index(&mut self, index: usize) {
        self.hdr_index = Some(index);
    }
}
