//! H.265 参数集与 SEI.

use hwenc_core::{BitstreamLite, ChromaMode};

use super::{CropWindow, HrdParams, RbspWriter, SeiData, VideoSignal, VuiTiming};
use crate::encoder::settings::{EncSettings, Profile, QpTableMode, RcMode};
use crate::nal::Codec;
use crate::picture::{PicStatus, TileLayout};
use crate::sei::{begin_sei, end_sei, payload_type};

/// 每帧一个时钟节拍
const HEVC_TICKS_PER_FRAME: u32 = 1;

/// 最小 CB 尺寸 (log2), 编码宽高按此对齐
const LOG2_MIN_CB_SIZE: u8 = 3;

/// general profile_tier_level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub tier: bool,
    pub profile_idc: u8,
    /// general_profile_compatibility_flag[j] 位于 bit (31 - j)
    pub compatibility_flags: u32,
    pub progressive_source: bool,
    pub interlaced_source: bool,
    pub non_packed_constraint: bool,
    pub frame_only_constraint: bool,
    /// RExt 档次的 max_12bit ... lower_bit_rate 等约束位 (高位对齐的 16 位)
    pub rext_flags: u16,
    pub level_idc: u8,
}

impl ProfileTierLevel {
    pub fn generate(settings: &EncSettings) -> Self {
        let profile_idc = settings.profile.profile_idc();
        let compat = |ids: &[u32]| ids.iter().fold(0u32, |acc, j| acc | (1 << (31 - j)));
        let (compatibility_flags, rext_flags) = match settings.profile {
            Profile::HevcMain => (compat(&[1, 2]), 0),
            Profile::HevcMain10 => (compat(&[2]), 0),
            // max_12bit, max_10bit, max_422, lower_bit_rate
            _ => (compat(&[u32::from(profile_idc)]), 0xD080),
        };
        Self {
            tier: settings.high_tier,
            profile_idc,
            compatibility_flags,
            progressive_source: !settings.interlaced,
            interlaced_source: settings.interlaced,
            non_packed_constraint: false,
            frame_only_constraint: !settings.interlaced,
            rext_flags,
            // level × 30, 配置中的 level 已乘以 10
            level_idc: settings.level.saturating_mul(3),
        }
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_bits(2, 0); // general_profile_space
        bs.put_bit(u8::from(self.tier));
        bs.put_bits(5, u32::from(self.profile_idc));
        bs.put_bits(32, self.compatibility_flags);
        bs.put_bit(u8::from(self.progressive_source));
        bs.put_bit(u8::from(self.interlaced_source));
        bs.put_bit(u8::from(self.non_packed_constraint));
        bs.put_bit(u8::from(self.frame_only_constraint));
        bs.put_bits(16, u32::from(self.rext_flags));
        bs.put_bits(28, 0);
        bs.put_bits(8, u32::from(self.level_idc));
    }
}

/// 子层排序信息 (只有一个时间子层)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubLayerOrdering {
    pub max_dec_pic_buffering_minus1: u32,
    pub max_num_reorder_pics: u32,
    pub max_latency_increase_plus1: u32,
}

impl SubLayerOrdering {
    fn generate(settings: &EncSettings, max_ref: u32) -> Self {
        let reorder = settings.gop.num_b.min(1);
        Self {
            max_dec_pic_buffering_minus1: max_ref.max(reorder),
            max_num_reorder_pics: reorder,
            max_latency_increase_plus1: 0,
        }
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_bit(1); // sub_layer_ordering_info_present_flag
        bs.put_ue(self.max_dec_pic_buffering_minus1);
        bs.put_ue(self.max_num_reorder_pics);
        bs.put_ue(self.max_latency_increase_plus1);
    }
}

/// H.265 视频参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcVps {
    pub vps_id: u8,
    pub base_layer_internal: bool,
    pub base_layer_available: bool,
    pub max_layers_minus1: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting: bool,
    pub ptl: ProfileTierLevel,
    pub ordering: SubLayerOrdering,
}

impl HevcVps {
    pub fn generate(settings: &EncSettings, max_ref: u32) -> Self {
        Self {
            vps_id: 0,
            base_layer_internal: true,
            base_layer_available: true,
            max_layers_minus1: 0,
            max_sub_layers_minus1: 0,
            temporal_id_nesting: true,
            ptl: ProfileTierLevel::generate(settings),
            ordering: SubLayerOrdering::generate(settings, max_ref),
        }
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_bits(4, u32::from(self.vps_id));
        bs.put_bit(u8::from(self.base_layer_internal));
        bs.put_bit(u8::from(self.base_layer_available));
        bs.put_bits(6, u32::from(self.max_layers_minus1));
        bs.put_bits(3, u32::from(self.max_sub_layers_minus1));
        bs.put_bit(u8::from(self.temporal_id_nesting));
        bs.put_bits(16, 0xFFFF); // vps_reserved_0xffff_16bits
        self.ptl.write(bs);
        self.ordering.write(bs);
        bs.put_bits(6, 0); // vps_max_layer_id
        bs.put_ue(0); // vps_num_layer_sets_minus1
        bs.put_bit(0); // vps_timing_info_present_flag
        bs.put_bit(0); // vps_extension_flag
        bs.rbsp_trailing_bits();
    }
}

/// H.265 VUI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcVui {
    pub video_signal: Option<VideoSignal>,
    pub chroma_loc_info_present: bool,
    pub field_seq: bool,
    pub frame_field_info_present: bool,
    pub timing: Option<VuiTiming>,
    pub hrd: HrdParams,
}

impl HevcVui {
    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_bit(0); // aspect_ratio_info_present_flag
        bs.put_bit(0); // overscan_info_present_flag
        bs.put_bit(u8::from(self.video_signal.is_some()));
        if let Some(signal) = &self.video_signal {
            signal.write(bs);
        }
        bs.put_bit(u8::from(self.chroma_loc_info_present));
        if self.chroma_loc_info_present {
            bs.put_ue(0);
            bs.put_ue(0);
        }
        bs.put_bit(0); // neutral_chroma_indication_flag
        bs.put_bit(u8::from(self.field_seq));
        bs.put_bit(u8::from(self.frame_field_info_present));
        bs.put_bit(0); // default_display_window_flag

        bs.put_bit(u8::from(self.timing.is_some()));
        if let Some(timing) = &self.timing {
            bs.put_bits(32, timing.num_units_in_tick);
            bs.put_bits(32, timing.time_scale);
            bs.put_bit(0); // vui_poc_proportional_to_timing_flag
            bs.put_bit(u8::from(self.hrd.present()));
            if self.hrd.present() {
                write_hrd(bs, &self.hrd);
            }
        }
        bs.put_bit(0); // bitstream_restriction_flag
    }
}

/// hrd_parameters(commonInfPresentFlag = 1, maxNumSubLayersMinus1 = 0)
fn write_hrd(bs: &mut BitstreamLite, hrd: &HrdParams) {
    bs.put_bit(u8::from(hrd.nal_hrd));
    bs.put_bit(u8::from(hrd.vcl_hrd));
    if hrd.present() {
        bs.put_bit(0); // sub_pic_hrd_params_present_flag
        bs.put_bits(4, u32::from(hrd.bit_rate_scale));
        bs.put_bits(4, u32::from(hrd.cpb_size_scale));
        bs.put_bits(5, u32::from(hrd.initial_cpb_removal_delay_length_minus1));
        bs.put_bits(5, u32::from(hrd.au_cpb_removal_delay_length_minus1));
        bs.put_bits(5, u32::from(hrd.dpb_output_delay_length_minus1));
    }
    bs.put_bit(0); // fixed_pic_rate_general_flag
    bs.put_bit(0); // fixed_pic_rate_within_cvs_flag
    bs.put_bit(u8::from(hrd.low_delay));
    if !hrd.low_delay {
        bs.put_ue(0); // cpb_cnt_minus1
    }
    for present in [hrd.nal_hrd, hrd.vcl_hrd] {
        if present {
            hrd.write_cpb(bs);
        }
    }
}

/// H.265 序列参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcSps {
    pub vps_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting: bool,
    pub ptl: ProfileTierLevel,
    pub sps_id: u8,
    pub chroma_format_idc: u32,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window: CropWindow,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_poc_lsb_minus4: u32,
    pub ordering: SubLayerOrdering,
    pub log2_min_cb_size_minus3: u32,
    pub log2_diff_max_min_cb_size: u32,
    pub log2_min_tb_size_minus2: u32,
    pub log2_diff_max_min_tb_size: u32,
    pub max_transform_hierarchy_depth_inter: u32,
    pub max_transform_hierarchy_depth_intra: u32,
    pub sample_adaptive_offset: bool,
    pub long_term_ref_pics_present: bool,
    pub temporal_mvp: bool,
    pub strong_intra_smoothing: bool,
    pub vui: Option<HevcVui>,
}

impl HevcSps {
    pub fn generate(settings: &EncSettings, vps: &HevcVps) -> Self {
        let lcu_log2 = u32::from(settings.lcu_log2());
        let bit_depth = settings.bit_depth();
        let rc = &settings.rc;
        let mut sps = Self {
            vps_id: vps.vps_id,
            max_sub_layers_minus1: vps.max_sub_layers_minus1,
            temporal_id_nesting: vps.temporal_id_nesting,
            ptl: vps.ptl,
            sps_id: 0,
            chroma_format_idc: settings.chroma_mode().format_idc(),
            pic_width_in_luma_samples: 0,
            pic_height_in_luma_samples: 0,
            conformance_window: CropWindow::default(),
            bit_depth_luma_minus8: bit_depth - 8,
            bit_depth_chroma_minus8: bit_depth - 8,
            log2_max_poc_lsb_minus4: 4,
            ordering: vps.ordering,
            log2_min_cb_size_minus3: u32::from(LOG2_MIN_CB_SIZE) - 3,
            log2_diff_max_min_cb_size: lcu_log2 - u32::from(LOG2_MIN_CB_SIZE),
            log2_min_tb_size_minus2: 0,
            // 最大 TB 32x32
            log2_diff_max_min_tb_size: lcu_log2.min(5) - 2,
            max_transform_hierarchy_depth_inter: 1,
            max_transform_hierarchy_depth_intra: 1,
            sample_adaptive_offset: true,
            long_term_ref_pics_present: settings.gop.enable_lt || settings.gop.freq_lt > 0,
            temporal_mvp: true,
            strong_intra_smoothing: lcu_log2 > 4,
            vui: Some(HevcVui {
                video_signal: Some(VideoSignal::default()),
                chroma_loc_info_present: settings.chroma_mode() == ChromaMode::Chroma420,
                field_seq: settings.interlaced,
                frame_field_info_present: settings.interlaced,
                timing: Some(VuiTiming::new(rc.frame_rate, rc.clk_ratio, HEVC_TICKS_PER_FRAME)),
                hrd: HrdParams::from_rc(rc, 30),
            }),
        };
        sps.set_resolution(settings.width, settings.height, settings);
        sps
    }

    /// 编码尺寸按最小 CB 对齐, 多出部分由一致性窗口裁掉
    pub fn set_resolution(&mut self, width: u32, height: u32, settings: &EncSettings) {
        let align = 1u32 << LOG2_MIN_CB_SIZE;
        let coded_w = width.next_multiple_of(align);
        let coded_h = height.next_multiple_of(align);
        self.pic_width_in_luma_samples = coded_w;
        self.pic_height_in_luma_samples = coded_h;
        self.conformance_window = CropWindow::for_alignment(coded_w, coded_h, width, height, settings);
    }

    /// 首个 slice 上根据分辨率/帧率变化重新生成
    pub fn update(&mut self, status: &PicStatus, settings: &EncSettings) {
        if !status.is_first_slice {
            return;
        }
        if status.hls.resolution_changed {
            self.set_resolution(status.pic_dim.width, status.pic_dim.height, settings);
            self.sps_id = status.hls.nal_id;
        }
        if let (Some((frame_rate, clk_ratio)), Some(vui)) = (status.hls.frame_rate, self.vui.as_mut()) {
            vui.timing = Some(VuiTiming::new(frame_rate, clk_ratio, HEVC_TICKS_PER_FRAME));
        }
    }

    fn hrd(&self) -> Option<&HrdParams> {
        self.vui.as_ref().filter(|v| v.timing.is_some()).map(|v| &v.hrd).filter(|h| h.present())
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_bits(4, u32::from(self.vps_id));
        bs.put_bits(3, u32::from(self.max_sub_layers_minus1));
        bs.put_bit(u8::from(self.temporal_id_nesting));
        self.ptl.write(bs);
        bs.put_ue(u32::from(self.sps_id));
        bs.put_ue(self.chroma_format_idc);
        bs.put_ue(self.pic_width_in_luma_samples);
        bs.put_ue(self.pic_height_in_luma_samples);
        bs.put_bit(u8::from(!self.conformance_window.is_empty()));
        if !self.conformance_window.is_empty() {
            self.conformance_window.write(bs);
        }
        bs.put_ue(u32::from(self.bit_depth_luma_minus8));
        bs.put_ue(u32::from(self.bit_depth_chroma_minus8));
        bs.put_ue(self.log2_max_poc_lsb_minus4);
        self.ordering.write(bs);
        bs.put_ue(self.log2_min_cb_size_minus3);
        bs.put_ue(self.log2_diff_max_min_cb_size);
        bs.put_ue(self.log2_min_tb_size_minus2);
        bs.put_ue(self.log2_diff_max_min_tb_size);
        bs.put_ue(self.max_transform_hierarchy_depth_inter);
        bs.put_ue(self.max_transform_hierarchy_depth_intra);
        bs.put_bit(0); // scaling_list_enabled_flag
        bs.put_bit(0); // amp_enabled_flag
        bs.put_bit(u8::from(self.sample_adaptive_offset));
        bs.put_bit(0); // pcm_enabled_flag
        bs.put_ue(0); // num_short_term_ref_pic_sets
        bs.put_bit(u8::from(self.long_term_ref_pics_present));
        if self.long_term_ref_pics_present {
            bs.put_ue(0); // num_long_term_ref_pics_sps
        }
        bs.put_bit(u8::from(self.temporal_mvp));
        bs.put_bit(u8::from(self.strong_intra_smoothing));
        bs.put_bit(u8::from(self.vui.is_some()));
        if let Some(vui) = &self.vui {
            vui.write(bs);
        }
        bs.put_bit(0); // sps_extension_present_flag
        bs.rbsp_trailing_bits();
    }
}

/// H.265 图像参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcPps {
    pub pps_id: u8,
    pub sps_id: u8,
    pub sign_data_hiding: bool,
    pub cabac_init_present: bool,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub init_qp_minus26: i32,
    pub constrained_intra_pred: bool,
    pub transform_skip: bool,
    pub cu_qp_delta_enabled: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub tiles: Option<TileLayout>,
    pub loop_filter_across_slices: bool,
    pub deblocking_filter_override_enabled: bool,
    pub deblocking_filter_disabled: bool,
    pub beta_offset_div2: i32,
    pub tc_offset_div2: i32,
    pub log2_parallel_merge_level_minus2: u32,
}

impl HevcPps {
    pub fn generate(settings: &EncSettings, sps: &HevcSps) -> Self {
        let num_ref = u32::from(settings.num_ref_idx.max(1));
        Self {
            pps_id: 0,
            sps_id: sps.sps_id,
            sign_data_hiding: false,
            cabac_init_present: false,
            num_ref_idx_l0_default_active_minus1: num_ref - 1,
            num_ref_idx_l1_default_active_minus1: 0,
            init_qp_minus26: 0,
            constrained_intra_pred: false,
            transform_skip: false,
            cu_qp_delta_enabled: settings.rc.mode != RcMode::ConstQp || settings.qp_table != QpTableMode::None,
            diff_cu_qp_delta_depth: 0,
            cb_qp_offset: i32::from(settings.cb_qp_offset),
            cr_qp_offset: i32::from(settings.cr_qp_offset),
            tiles: None,
            loop_filter_across_slices: true,
            deblocking_filter_override_enabled: false,
            deblocking_filter_disabled: false,
            beta_offset_div2: i32::from(settings.beta_offset),
            tc_offset_div2: i32::from(settings.tc_offset),
            log2_parallel_merge_level_minus2: 0,
        }
    }

    /// 逐 slice 更新, 返回是否必须重写 PPS
    ///
    /// 只有首个 slice 上的 id 变化 (分辨率切换) 或 PPS 内容变化会强制重写,
    /// 环路滤波偏移跟随硬件确认生效.
    pub fn update(&mut self, status: &PicStatus) -> bool {
        let before = self.clone();

        self.init_qp_minus26 = status.pps_qp - 26;
        self.diff_cu_qp_delta_depth = u32::from(status.cu_qp_delta_depth);
        self.tiles = status.tiles.clone().filter(TileLayout::is_split);
        if let Some((cb, cr)) = status.hls.chroma_qp_offsets {
            self.cb_qp_offset = i32::from(cb);
            self.cr_qp_offset = i32::from(cr);
        }
        if status.hls.lf_offset_changed {
            self.beta_offset_div2 = i32::from(status.hls.beta_offset);
            self.tc_offset_div2 = i32::from(status.hls.tc_offset);
        }

        let mut force = *self != before;
        if status.is_first_slice && (status.hls.resolution_changed || status.hls.nal_id != self.pps_id) {
            self.pps_id = status.hls.nal_id;
            if status.hls.resolution_changed {
                self.sps_id = status.hls.nal_id;
            }
            force = true;
        }
        force
    }

    fn write(&self, bs: &mut BitstreamLite) {
        bs.put_ue(u32::from(self.pps_id));
        bs.put_ue(u32::from(self.sps_id));
        bs.put_bit(0); // dependent_slice_segments_enabled_flag
        bs.put_bit(0); // output_flag_present_flag
        bs.put_bits(3, 0); // num_extra_slice_header_bits
        bs.put_bit(u8::from(self.sign_data_hiding));
        bs.put_bit(u8::from(self.cabac_init_present));
        bs.put_ue(self.num_ref_idx_l0_default_active_minus1);
        bs.put_ue(self.num_ref_idx_l1_default_active_minus1);
        bs.put_se(self.init_qp_minus26);
        bs.put_bit(u8::from(self.constrained_intra_pred));
        bs.put_bit(u8::from(self.transform_skip));
        bs.put_bit(u8::from(self.cu_qp_delta_enabled));
        if self.cu_qp_delta_enabled {
            bs.put_ue(self.diff_cu_qp_delta_depth);
        }
        bs.put_se(self.cb_qp_offset);
        bs.put_se(self.cr_qp_offset);
        bs.put_bit(0); // pps_slice_chroma_qp_offsets_present_flag
        bs.put_bit(0); // weighted_pred_flag
        bs.put_bit(0); // weighted_bipred_flag
        bs.put_bit(0); // transquant_bypass_enabled_flag
        bs.put_bit(u8::from(self.tiles.is_some()));
        bs.put_bit(0); // entropy_coding_sync_enabled_flag
        if let Some(tiles) = &self.tiles {
            let cols = tiles.column_widths.len().max(1) as u32;
            let rows = tiles.row_heights.len().max(1) as u32;
            bs.put_ue(cols - 1);
            bs.put_ue(rows - 1);
            bs.put_bit(0); // uniform_spacing_flag
            // 最后一列/行的尺寸由解码端推导
            for &w in tiles.column_widths.iter().take(cols as usize - 1) {
                bs.put_ue(u32::from(w.max(1)) - 1);
            }
            for &h in tiles.row_heights.iter().take(rows as usize - 1) {
                bs.put_ue(u32::from(h.max(1)) - 1);
            }
            bs.put_bit(1); // loop_filter_across_tiles_enabled_flag
        }
        bs.put_bit(u8::from(self.loop_filter_across_slices));
        bs.put_bit(1); // deblocking_filter_control_present_flag
        bs.put_bit(u8::from(self.deblocking_filter_override_enabled));
        bs.put_bit(u8::from(self.deblocking_filter_disabled));
        if !self.deblocking_filter_disabled {
            bs.put_se(self.beta_offset_div2);
            bs.put_se(self.tc_offset_div2);
        }
        bs.put_bit(0); // pps_scaling_list_data_present_flag
        bs.put_bit(0); // lists_modification_present_flag
        bs.put_ue(self.log2_parallel_merge_level_minus2);
        bs.put_bit(0); // slice_segment_header_extension_present_flag
        bs.put_bit(0); // pps_extension_present_flag
        bs.rbsp_trailing_bits();
    }
}

/// 一个 HEVC 层的参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcParamSets {
    pub vps: HevcVps,
    pub sps: HevcSps,
    pub pps: HevcPps,
}

impl HevcParamSets {
    pub fn generate(settings: &EncSettings, max_ref: u32) -> Self {
        let vps = HevcVps::generate(settings, max_ref);
        let sps = HevcSps::generate(settings, &vps);
        let pps = HevcPps::generate(settings, &sps);
        Self { vps, sps, pps }
    }
}

impl RbspWriter for HevcParamSets {
    fn codec(&self) -> Codec {
        Codec::Hevc
    }

    fn has_vps(&self) -> bool {
        true
    }

    fn write_vps(&self, bs: &mut BitstreamLite) {
        self.vps.write(bs);
    }

    fn write_sps(&self, bs: &mut BitstreamLite) {
        self.sps.write(bs);
    }

    fn write_pps(&self, bs: &mut BitstreamLite) {
        self.pps.write(bs);
    }

    fn has_aps(&self) -> bool {
        true
    }

    fn write_sei_aps(&self, bs: &mut BitstreamLite) {
        let bookmark = begin_sei(bs, payload_type::ACTIVE_PARAMETER_SETS);
        bs.put_bits(4, u32::from(self.vps.vps_id));
        bs.put_bit(0); // full_random_access_flag
        bs.put_bit(1); // no_parameter_set_update_flag
        bs.put_ue(0); // num_sps_ids_minus1
        bs.put_ue(u32::from(self.sps.sps_id));
        let first = u8::from(self.vps.base_layer_internal);
        for _ in first..=self.vps.max_layers_minus1 {
            bs.put_ue(0); // layer_sps_idx
        }
        bs.end_of_sei_payload();
        end_sei(bs, bookmark);
    }

    fn write_sei_bp(&self, bs: &mut BitstreamLite, sei: &SeiData) {
        let bookmark = begin_sei(bs, payload_type::BUFFERING_PERIOD);
        bs.put_ue(u32::from(self.sps.sps_id));
        if let Some(hrd) = self.sps.hrd() {
            bs.put_bit(0); // irap_cpb_params_present_flag
            bs.put_bit(0); // concatenation_flag
            bs.put_bits(hrd.au_cpb_len(), 0); // au_cpb_removal_delay_delta_minus1
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
        bs.put_se(recovery_cnt.min(i32::MAX as u32) as i32);
        bs.put_bit(1); // exact_match_flag
        bs.put_bit(0); // broken_link_flag
        bs.end_of_sei_payload();
        end_sei(bs, bookmark);
    }

    fn write_sei_pt(&self, bs: &mut BitstreamLite, sei: &SeiData, status: &PicStatus) {
        let bookmark = begin_sei(bs, payload_type::PIC_TIMING);
        if self.sps.vui.as_ref().is_some_and(|v| v.frame_field_info_present) {
            bs.put_bits(4, status.pic_struct.id());
            bs.put_bits(2, 0); // source_scan_type: 隔行
            bs.put_bit(0); // duplicate_flag
        }
        if let Some(hrd) = self.sps.hrd() {
            // 累计值以场为单位, HEVC 每帧一个时钟节拍
            let ticks = sei.cpb_removal_delay * HEVC_TICKS_PER_FRAME / 2;
            bs.put_bits(hrd.au_cpb_len(), ticks.saturating_sub(1));
            bs.put_bits(hrd.dpb_output_len(), status.dpb_output_delay);
        }
        bs.end_of_sei_payload();
        end_sei(bs, bookmark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::HlsInfo;
    use hwenc_core::{BitReader, Dimension, FourCc};

    fn settings() -> EncSettings {
        EncSettings {
            profile: Profile::HevcMain,
            level: 51,
            width: 1920,
            height: 1080,
            ..Default::default()
        }
    }

    fn rbsp(f: impl FnOnce(&mut BitstreamLite)) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut bs = BitstreamLite::new(&mut buf);
        f(&mut bs);
        assert!(!bs.is_overflow());
        let n = bs.bytes_written();
        buf.truncate(n);
        buf
    }

    fn read_ptl(r: &mut BitReader) -> (u32, u32, u32, u32) {
        assert_eq!(r.read_bits(2).unwrap(), 0, "profile_space");
        let tier = r.read_bits(1).unwrap();
        let profile = r.read_bits(5).unwrap();
        let compat = r.read_bits(32).unwrap();
        r.read_bits(4).unwrap();
        r.read_bits(16).unwrap();
        r.read_bits(28).unwrap();
        let level = r.read_bits(8).unwrap();
        (tier, profile, compat, level)
    }

    #[test]
    fn test_vps_layout() {
        let sets = HevcParamSets::generate(&settings(), 2);
        let data = rbsp(|bs| sets.write_vps(bs));
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_bits(4).unwrap(), 0, "vps_id");
        assert_eq!(r.read_bits(2).unwrap(), 0b11);
        assert_eq!(r.read_bits(6).unwrap(), 0);
        assert_eq!(r.read_bits(3).unwrap(), 0);
        assert_eq!(r.read_bits(1).unwrap(), 1);
        assert_eq!(r.read_bits(16).unwrap(), 0xFFFF);
        let (tier, profile, compat, level) = read_ptl(&mut r);
        assert_eq!(tier, 0);
        assert_eq!(profile, 1);
        assert_eq!(compat, 0x6000_0000, "Main 兼容 Main 与 Main10");
        assert_eq!(level, 153);
        assert_eq!(r.read_bits(1).unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2, "max_dec_pic_buffering_minus1");
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 0);
    }

    #[test]
    fn test_sps_dimensions_and_conformance_window() {
        let sets = HevcParamSets::generate(&settings(), 1);
        let data = rbsp(|bs| sets.write_sps(bs));
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_bits(8).unwrap(), 0b0000_0001, "vps_id/max_sub_layers/nesting");
        read_ptl(&mut r);
        assert_eq!(r.read_ue().unwrap(), 0, "sps_id");
        assert_eq!(r.read_ue().unwrap(), 1, "4:2:0");
        assert_eq!(r.read_ue().unwrap(), 1920);
        assert_eq!(r.read_ue().unwrap(), 1080, "1080 已按 8 对齐");
        assert!(!r.read_flag().unwrap(), "无需一致性窗口");
        assert_eq!(r.read_ue().unwrap(), 0, "8 bit");
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 4, "log2_max_poc_lsb_minus4");
        assert!(r.read_flag().unwrap());
        r.read_ue().unwrap();
        r.read_ue().unwrap();
        r.read_ue().unwrap();
        assert_eq!(r.read_ue().unwrap(), 0, "min CB 8x8");
        assert_eq!(r.read_ue().unwrap(), 2, "LCU 32x32");
    }

    #[test]
    fn test_sps_conformance_window_for_odd_height() {
        let s = EncSettings {
            width: 1366,
            height: 766,
            ..settings()
        };
        let sps = HevcParamSets::generate(&s, 1).sps;
        assert_eq!(sps.pic_width_in_luma_samples, 1368);
        assert_eq!(sps.pic_height_in_luma_samples, 768);
        assert_eq!(sps.conformance_window.right, 1);
        assert_eq!(sps.conformance_window.bottom, 1);
    }

    #[test]
    fn test_main422_10_ptl() {
        let s = EncSettings {
            profile: Profile::HevcMain422_10,
            fourcc: FourCc::P210,
            ..settings()
        };
        let ptl = ProfileTierLevel::generate(&s);
        assert_eq!(ptl.profile_idc, 4);
        assert_eq!(ptl.compatibility_flags, 1 << 27);
        assert_eq!(ptl.rext_flags, 0xD080);
        let sps = HevcParamSets::generate(&s, 1).sps;
        assert_eq!(sps.chroma_format_idc, 2);
        assert_eq!(sps.bit_depth_luma_minus8, 2);
    }

    #[test]
    fn test_pps_forced_on_new_id() {
        let s = settings();
        let mut sets = HevcParamSets::generate(&s, 1);
        let mut status = PicStatus {
            is_first_slice: true,
            pps_qp: 26,
            ..Default::default()
        };
        assert!(!sets.pps.update(&status), "内容与 id 均未变化");

        status.hls = HlsInfo {
            resolution_changed: true,
            nal_id: 2,
            ..Default::default()
        };
        status.pic_dim = Dimension::new(1280, 720);
        sets.sps.update(&status, &s);
        assert!(sets.pps.update(&status));
        assert_eq!(sets.pps.pps_id, 2);
        assert_eq!(sets.pps.sps_id, 2);
        assert_eq!(sets.sps.sps_id, 2);
        assert_eq!(sets.sps.pic_height_in_luma_samples, 720);
        assert!(sets.sps.conformance_window.is_empty());
    }

    #[test]
    fn test_pps_tiles_and_lf_offsets() {
        let mut sets = HevcParamSets::generate(&settings(), 1);
        let status = PicStatus {
            pps_qp: 26,
            cu_qp_delta_depth: 1,
            tiles: Some(TileLayout {
                column_widths: vec![30, 30],
                row_heights: vec![34],
            }),
            hls: HlsInfo {
                lf_offset_changed: true,
                beta_offset: -2,
                tc_offset: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(sets.pps.update(&status));
        assert_eq!(sets.pps.beta_offset_div2, -2);
        assert_eq!(sets.pps.tc_offset_div2, 3);
        assert!(sets.pps.tiles.is_some());

        let data = rbsp(|bs| sets.write_pps(bs));
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_bits(7).unwrap(), 0);
        r.read_ue().unwrap();
        r.read_ue().unwrap();
        assert_eq!(r.read_se().unwrap(), 0, "init_qp_minus26");
        assert_eq!(r.read_bits(2).unwrap(), 0);
        assert!(r.read_flag().unwrap(), "cu_qp_delta_enabled");
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_se().unwrap(), 0);
        assert_eq!(r.read_se().unwrap(), 0);
        assert_eq!(r.read_bits(4).unwrap(), 0);
        assert!(r.read_flag().unwrap(), "tiles_enabled");
        assert!(!r.read_flag().unwrap());
        assert_eq!(r.read_ue().unwrap(), 1, "两列");
        assert_eq!(r.read_ue().unwrap(), 0, "一行");
        assert!(!r.read_flag().unwrap());
        assert_eq!(r.read_ue().unwrap(), 29);
        assert!(r.read_flag().unwrap());
        assert!(r.read_flag().unwrap(), "loop_filter_across_slices");
        assert!(r.read_flag().unwrap(), "deblocking control");
        assert!(!r.read_flag().unwrap());
        assert!(!r.read_flag().unwrap());
        assert_eq!(r.read_se().unwrap(), -2);
        assert_eq!(r.read_se().unwrap(), 3);
    }

    #[test]
    fn test_pps_follows_reported_chroma_offsets() {
        let mut sets = HevcParamSets::generate(&settings(), 1);
        let mut status = PicStatus {
            pps_qp: 26,
            hls: HlsInfo {
                chroma_qp_offsets: Some((0, 0)),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!sets.pps.update(&status), "偏移未变化");

        status.hls.chroma_qp_offsets = Some((3, -2));
        assert!(sets.pps.update(&status), "色度偏移变化强制重写 PPS");
        assert_eq!((sets.pps.cb_qp_offset, sets.pps.cr_qp_offset), (3, -2));

        let data = rbsp(|bs| sets.write_pps(bs));
        let mut r = BitReader::new(&data);
        r.read_ue().unwrap();
        r.read_ue().unwrap();
        r.read_bits(7).unwrap();
        r.read_ue().unwrap();
        r.read_ue().unwrap();
        r.read_se().unwrap();
        r.read_bits(2).unwrap();
        if r.read_flag().unwrap() {
            r.read_ue().unwrap();
        }
        assert_eq!(r.read_se().unwrap(), 3, "pps_cb_qp_offset");
        assert_eq!(r.read_se().unwrap(), -2, "pps_cr_qp_offset");

        // 未上报时保持原值
        status.hls.chroma_qp_offsets = None;
        assert!(!sets.pps.update(&status));
        assert_eq!(sets.pps.cb_qp_offset, 3);
    }

    #[test]
    fn test_active_parameter_sets_sei() {
        let sets = HevcParamSets::generate(&settings(), 1);
        let data = rbsp(|bs| sets.write_sei_aps(bs));
        // vps_id 0000, 0, 1, ue(0), ue(0): 恰好一个字节, 无需停止位
        assert_eq!(data, vec![129, 1, 0b0000_0111]);
    }
}
