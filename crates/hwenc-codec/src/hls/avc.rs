//! H.264 参数集与 SEI.

use hwenc_core::{BitstreamLite, ChromaMode};

use super::{CropWindow, HrdParams, RbspWriter, SeiData, VideoSignal, VuiTiming};
use crate::encoder::settings::EncSettings;
use crate::nal::Codec;
use crate::picture::PicStatus;
use crate::sei::{begin_sei, end_sei, payload_type};

/// 带 chroma_format_idc 等扩展字段的 profile_idc (H.264 7.3.2.1.1)
const HIGH_PROFILE_IDCS: [u8; 9] = [100, 110, 122, 244, 44, 83, 86, 118, 128];

/// 每帧两个时钟节拍 (场)
const AVC_TICKS_PER_FRAME: u32 = 2;

/// H.264 VUI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcVui {
    pub video_signal: Option<VideoSignal>,
    pub chroma_loc_info_present: bool,
    pub timing: Option<VuiTiming>,
    pub fixed_frame_rate: bool,
    pub hrd: HrdParams,
    pub pic_struct_present: bool,
}

/// H.264 序列参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcSps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub sps_id: u8,
    pub chroma_format_idc: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u32,
    pub log2_max_poc_lsb_minus4: u32,
    pub max_num_ref_frames: u32,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only: bool,
    pub direct_8x8_inference: bool,
    pub crop: CropWindow,
    pub vui: Option<AvcVui>,
}

impl AvcSps {
    /// 由通道配置生成
    pub fn generate(settings: &EncSettings, max_ref: u32) -> Self {
        let profile = settings.profile;
        let bit_depth = settings.bit_depth();
        let rc = &settings.rc;
        let mut sps = Self {
            profile_idc: profile.profile_idc(),
            constraint_flags: profile.constraint_flags(),
            level_idc: settings.level,
            sps_id: 0,
            chroma_format_idc: settings.chroma_mode().format_idc(),
            bit_depth_luma_minus8: bit_depth - 8,
            bit_depth_chroma_minus8: bit_depth - 8,
            log2_max_frame_num_minus4: 0,
            log2_max_poc_lsb_minus4: 2,
            max_num_ref_frames: max_ref,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only: true,
            direct_8x8_inference: true,
            crop: CropWindow::default(),
            vui: Some(AvcVui {
                video_signal: Some(VideoSignal::default()),
                chroma_loc_info_present: settings.chroma_mode() == ChromaMode::Chroma420,
                timing: Some(VuiTiming::new(rc.frame_rate, rc.clk_ratio, AVC_TICKS_PER_FRAME)),
                fixed_frame_rate: false,
                hrd: HrdParams::from_rc(rc, 31),
                pic_struct_present: true,
            }),
        };
        sps.set_resolution(settings.width, settings.height, settings);
        sps
    }

    /// 按新分辨率更新宏块数与裁剪窗口
    pub fn set_resolution(&mut self, width: u32, height: u32, settings: &EncSettings) {
        let mb_w = width.div_ceil(16);
        let mb_h = height.div_ceil(16);
        self.pic_width_in_mbs_minus1 = mb_w - 1;
        self.pic_height_in_map_units_minus1 = mb_h - 1;
        self.crop = CropWindow::for_alignment(mb_w * 16, mb_h * 16, width, height, settings);
    }

    /// 逐帧更新: 分辨率变化时重算尺寸与 id, 帧率变化时更新 VUI 定时信息
    pub fn update(&mut self, status: &PicStatus, settings: &EncSettings) {
        if let (Some((frame_rate, clk_ratio)), Some(vui)) = (status.hls.frame_rate, self.vui.as_mut()) {
            vui.timing = Some(VuiTiming::new(frame_rate, clk_ratio, AVC_TICKS_PER_FRAME));
        }
        if !status.hls.resolution_changed {
            return;
        }
        self.set_resolution(status.pic_dim.width, status.pic_dim.height, settings);
        self.sps_id = status.hls.nal_id;
    }

    fn has_high_profile_syntax(&self) -> bool {
        HIGH_PROFILE_IDCS.contains(&self.profile_idc)
    }

    fn hrd(&self) -> Option<&HrdParams> {
        self.vui.as_ref().map(|v| &v.hrd).filter(|h| h.present())
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_bits(8, u32::from(self.profile_idc));
        for i in 0..6 {
            bs.put_bit((self.constraint_flags >> i) & 1);
        }
        bs.put_bits(2, 0);
        bs.put_bits(8, u32::from(self.level_idc));
        bs.put_ue(u32::from(self.sps_id));

        if self.has_high_profile_syntax() {
            bs.put_ue(self.chroma_format_idc);
            bs.put_ue(u32::from(self.bit_depth_luma_minus8));
            bs.put_ue(u32::from(self.bit_depth_chroma_minus8));
            bs.put_bit(0); // qpprime_y_zero_transform_bypass_flag
            bs.put_bit(0); // seq_scaling_matrix_present_flag
        }

        bs.put_ue(self.log2_max_frame_num_minus4);
        bs.put_ue(0); // pic_order_cnt_type
        bs.put_ue(self.log2_max_poc_lsb_minus4);
        bs.put_ue(self.max_num_ref_frames);
        bs.put_bit(0); // gaps_in_frame_num_value_allowed_flag
        bs.put_ue(self.pic_width_in_mbs_minus1);
        bs.put_ue(self.pic_height_in_map_units_minus1);
        bs.put_bit(u8::from(self.frame_mbs_only));
        if !self.frame_mbs_only {
            bs.put_bit(0); // mb_adaptive_frame_field_flag
        }
        bs.put_bit(u8::from(self.direct_8x8_inference));
        bs.put_bit(u8::from(!self.crop.is_empty()));
        if !self.crop.is_empty() {
            self.crop.write(bs);
        }

        bs.put_bit(u8::from(self.vui.is_some()));
        if let Some(vui) = &self.vui {
            write_vui(bs, vui);
        }
        bs.rbsp_trailing_bits();
    }
}

fn write_vui(bs: &mut BitstreamLite, vui: &AvcVui) {
    bs.put_bit(0); // aspect_ratio_info_present_flag
    bs.put_bit(0); // overscan_info_present_flag
    bs.put_bit(u8::from(vui.video_signal.is_some()));
    if let Some(signal) = &vui.video_signal {
        signal.write(bs);
    }
    bs.put_bit(u8::from(vui.chroma_loc_info_present));
    if vui.chroma_loc_info_present {
        bs.put_ue(0);
        bs.put_ue(0);
    }
    bs.put_bit(u8::from(vui.timing.is_some()));
    if let Some(timing) = &vui.timing {
        bs.put_bits(32, timing.num_units_in_tick);
        bs.put_bits(32, timing.time_scale);
        bs.put_bit(u8::from(vui.fixed_frame_rate));
    }

    let hrd = &vui.hrd;
    bs.put_bit(u8::from(hrd.nal_hrd));
    if hrd.nal_hrd {
        write_hrd(bs, hrd);
    }
    bs.put_bit(u8::from(hrd.vcl_hrd));
    if hrd.vcl_hrd {
        write_hrd(bs, hrd);
    }
    if hrd.present() {
        bs.put_bit(u8::from(hrd.low_delay));
    }
    bs.put_bit(u8::from(vui.pic_struct_present));
    bs.put_bit(0); // bitstream_restriction_flag
}

fn write_hrd(bs: &mut BitstreamLite, hrd: &HrdParams) {
    bs.put_ue(0); // cpb_cnt_minus1
    bs.put_bits(4, u32::from(hrd.bit_rate_scale));
    bs.put_bits(4, u32::from(hrd.cpb_size_scale));
    hrd.write_cpb(bs);
    bs.put_bits(5, u32::from(hrd.initial_cpb_removal_delay_length_minus1));
    bs.put_bits(5, u32::from(hrd.au_cpb_removal_delay_length_minus1));
    bs.put_bits(5, u32::from(hrd.dpb_output_delay_length_minus1));
    bs.put_bits(5, u32::from(hrd.time_offset_length));
}

/// H.264 图像参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcPps {
    pub pps_id: u8,
    pub sps_id: u8,
    pub entropy_coding_mode: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub pic_init_qp_minus26: i32,
    pub chroma_qp_index_offset: i32,
    pub second_chroma_qp_index_offset: i32,
    pub deblocking_filter_control_present: bool,
    pub constrained_intra_pred: bool,
    pub transform_8x8_mode: bool,
}

impl AvcPps {
    /// 由通道配置生成
    pub fn generate(settings: &EncSettings, sps: &AvcSps) -> Self {
        let num_ref = u32::from(settings.num_ref_idx.max(1));
        Self {
            pps_id: 0,
            sps_id: sps.sps_id,
            entropy_coding_mode: settings.cabac && sps.profile_idc != 66,
            num_ref_idx_l0_active_minus1: num_ref - 1,
            num_ref_idx_l1_active_minus1: 0,
            pic_init_qp_minus26: 0,
            chroma_qp_index_offset: i32::from(settings.cb_qp_offset).clamp(-12, 12),
            second_chroma_qp_index_offset: i32::from(settings.cr_qp_offset).clamp(-12, 12),
            deblocking_filter_control_present: true,
            constrained_intra_pred: false,
            transform_8x8_mode: sps.has_high_profile_syntax(),
        }
    }

    /// 逐帧更新, 返回是否必须重写 PPS
    pub fn update(&mut self, status: &PicStatus) -> bool {
        let init_qp = status.pps_qp - 26;
        let mut changed = init_qp != self.pic_init_qp_minus26;
        self.pic_init_qp_minus26 = init_qp;
        if status.hls.resolution_changed {
            self.pps_id = status.hls.nal_id;
            self.sps_id = status.hls.nal_id;
            changed = true;
        }
        changed
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_ue(u32::from(self.pps_id));
        bs.put_ue(u32::from(self.sps_id));
        bs.put_bit(u8::from(self.entropy_coding_mode));
        bs.put_bit(0); // bottom_field_pic_order_in_frame_present_flag
        bs.put_ue(0); // num_slice_groups_minus1
        bs.put_ue(self.num_ref_idx_l0_active_minus1);
        bs.put_ue(self.num_ref_idx_l1_active_minus1);
        bs.put_bit(0); // weighted_pred_flag
        bs.put_bits(2, 0); // weighted_bipred_idc
        bs.put_se(self.pic_init_qp_minus26);
        bs.put_se(0); // pic_init_qs_minus26
        bs.put_se(self.chroma_qp_index_offset);
        bs.put_bit(u8::from(self.deblocking_filter_control_present));
        bs.put_bit(u8::from(self.constrained_intra_pred));
        bs.put_bit(0); // redundant_pic_cnt_present_flag
        if self.transform_8x8_mode || self.second_chroma_qp_index_offset != self.chroma_qp_index_offset {
            bs.put_bit(u8::from(self.transform_8x8_mode));
            bs.put_bit(0); // pic_scaling_matrix_present_flag
            bs.put_se(self.second_chroma_qp_index_offset);
        }
        bs.rbsp_trailing_bits();
    }
}

/// 一个 AVC 层的参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcParamSets {
    pub sps: AvcSps,
    pub pps: AvcPps,
}

impl AvcParamSets {
    pub fn generate(settings: &EncSettings, max_ref: u32) -> Self {
        let sps = AvcSps::generate(settings, max_ref);
        let pps = AvcPps::generate(settings, &sps);
        Self { sps, pps }
    }
}

impl RbspWriter for AvcParamSets {
    fn codec(&self) -> Codec {
        Codec::Avc
    }

    fn write_sps(&self, bs: &mut BitstreamLite) {
        self.sps.write(bs);
    }

    fn write_pps(&self, bs: &mut BitstreamLite) {
        self.pps.write(bs);
    }

    fn write_sei_bp(&self, bs: &mut BitstreamLite, sei: &SeiData) {
        let bookmark = begin_sei(bs, payload_type::BUFFERING_PERIOD);
        bs.put_ue(u32::from(self.sps.sps_id));
        if let Some(hrd) = self.sps.hrd() {
            let len = hrd.initial_cpb_len();
            for present in [hrd.nal_hrd, hrd.vcl_hrd] {
                if present {
                    bs.put_bits(len, sei.initial_cpb_removal_delay);
                    bs.put_bits(len, sei.initial_cpb_removal_offset);
                }
            }
        }
        bs.end_of_sei_payload();
        end_sei(bs, bookmark);
    }

    fn write_sei_rp(&self, bs: &mut BitstreamLite, recovery_cnt: u32) {
        let bookmark = begin_sei(bs, payload_type::RECOVERY_POINT);
        bs.put_ue(recovery_cnt);
        bs.put_bit(1); // exact_match_flag
        bs.put_bit(0); // broken_link_flag
        bs.put_bits(2, 0); // changing_slice_group_idc
        bs.end_of_sei_payload();
        end_sei(bs, bookmark);
    }

    fn write_sei_pt(&self, bs: &mut BitstreamLite, sei: &SeiData, status: &PicStatus) {
        let bookmark = begin_sei(bs, payload_type::PIC_TIMING);
        if let Some(hrd) = self.sps.hrd() {
            bs.put_bits(hrd.au_cpb_len(), sei.cpb_removal_delay);
            bs.put_bits(hrd.dpb_output_len(), status.dpb_output_delay);
        }
        if self.sps.vui.as_ref().is_some_and(|v| v.pic_struct_present) {
            bs.put_bits(4, status.pic_struct.id());
            // clock_timestamp_flag 全部为 0
            bs.put_bits(status.pic_struct.num_clock_ts(), 0);
        }
        bs.end_of_sei_payload();
        end_sei(bs, bookmark);
    }
}
