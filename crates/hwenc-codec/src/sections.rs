//! 码流分段组装.
//!
//! 每个 slice 编码完成后, 根据图像状态决定本帧需要 (重新) 输出哪些 NAL:
//! AUD, VPS/SPS/PPS, 前缀 SEI, slice 数据与填充数据, 并把它们登记为码流缓冲区的分段.
//!
//! 配置 NAL 先序列化到一个临时缓冲区, 再加上起始码、头部和防竞争字节写入码流
//! 缓冲区头部的预留区. slice 数据由硬件写好且已做防竞争处理, 这里只登记位置.

use hwenc_core::{BitstreamLite, EncError, EncResult};
use log::{debug, warn};

use crate::encoder::settings::FillerMode;
use crate::hls::{RbspWriter, SeiData};
use crate::nal::{Codec, Nuts, StartCodeMode, flush_nal, write_filler_data};
use crate::picture::{PicStatus, SliceType};
use crate::sei::{self, HdrSeis, SUBFRAME_UUID, SeiFlags};
use crate::stream::{MAX_CONFIG_HEADER_SIZE, MAX_HEADER_SIZE, MAX_SEI_SIZE, SectionFlags, StreamMetaData};

/// 参数集 NAL 的 nal_ref_idc
const PARAM_SET_REF_IDC: u8 = 1;

/// 生成一帧配置 NAL 所需的输入
pub struct NalsData<'a> {
    /// 当前层的参数集与 SEI 序列化
    pub writer: &'a dyn RbspWriter,
    /// CPB 时序
    pub sei: &'a SeiData,
    /// HDR SEI 内容
    pub hdr: &'a HdrSeis,
    /// 通道请求的 SEI
    pub sei_flags: SeiFlags,
    pub must_write_aud: bool,
    pub must_write_pps: bool,
    /// 动态 HDR 已更新, 需要重发 ST 2094-40
    pub must_write_dyn_hdr: bool,
    pub force_rp_on_idr: bool,
    /// 子帧低延迟: 附带 slice 数的 user data SEI
    pub subframe_latency: bool,
    pub num_slices: u16,
    pub filler: FillerMode,
    pub start_code: StartCodeMode,
    pub layer_id: u8,
}

/// 本帧需要写入的前缀 SEI
pub fn prefix_sei_flags(nals: &NalsData, status: &PicStatus, write_sps: bool) -> SeiFlags {
    let mut flags = SeiFlags::PT;
    if status.slice_type == SliceType::I {
        flags |= SeiFlags::BP;
        if !status.is_idr || nals.force_rp_on_idr {
            flags |= SeiFlags::RP;
        }
    } else if status.recovery_cnt > 0 {
        flags |= SeiFlags::RP;
    }
    if write_sps {
        flags |= SeiFlags::MDCV | SeiFlags::CLL | SeiFlags::ATC;
    }
    flags |= SeiFlags::ST2094_10;
    if write_sps || nals.must_write_dyn_hdr {
        flags |= SeiFlags::ST2094_40;
    }
    // 没有内容的 HDR SEI 不写
    let writable = nals.hdr.available() | (SeiFlags::all() - SeiFlags::HDR);
    flags & nals.sei_flags.prefix() & writable
}

/// 写入码流缓冲区头部预留区的配置 NAL
struct ConfigWriter<'s, 'b> {
    out: BitstreamLite<'b>,
    meta: &'s mut StreamMetaData,
    nuts: Nuts,
    start_code: StartCodeMode,
    layer_id: u8,
    tmp: Vec<u8>,
}

impl ConfigWriter<'_, '_> {
    /// 序列化一个 NAL 并登记分段
    fn write_nal(
        &mut self,
        nut: u8,
        ref_idc: u8,
        temporal_id: u8,
        flags: SectionFlags,
        write_rbsp: impl FnOnce(&mut BitstreamLite),
    ) -> EncResult<()> {
        let mut rbsp = BitstreamLite::new(&mut self.tmp);
        write_rbsp(&mut rbsp);
        if rbsp.is_overflow() {
            return Err(EncError::CapacityOverflow(format!(
                "NAL 类型 {} 的负载超过 {} 字节",
                nut, MAX_HEADER_SIZE
            )));
        }
        let rbsp_bits = rbsp.bits_written();

        let start = self.out.byte_offset();
        let header = self.nuts.header(nut, ref_idc, self.layer_id, temporal_id);
        flush_nal(
            &mut self.out,
            self.nuts.codec,
            nut,
            &header,
            &self.tmp,
            rbsp_bits,
            self.start_code,
        );
        if self.out.is_overflow() {
            return Err(EncError::CapacityOverflow(format!(
                "配置 NAL 超过头部预留区 {} 字节",
                MAX_CONFIG_HEADER_SIZE
            )));
        }
        let len = self.out.byte_offset() - start;
        self.meta
            .add_section(start as u32, len as u32, flags)
            .ok_or_else(|| EncError::CapacityOverflow("码流分段表已满".into()))?;
        Ok(())
    }
}

/// 写入首个 slice 上的配置 NAL
fn write_config_nals(
    stream: &mut [u8],
    meta: &mut StreamMetaData,
    nals: &NalsData,
    status: &PicStatus,
) -> EncResult<()> {
    let writer = nals.writer;
    let nuts = Nuts::for_codec(writer.codec());
    let tid = status.temporal_id;
    let mut cw = ConfigWriter {
        out: BitstreamLite::with_max_bits(stream, MAX_CONFIG_HEADER_SIZE * 8),
        meta,
        nuts,
        start_code: nals.start_code,
        layer_id: nals.layer_id,
        tmp: vec![0u8; MAX_HEADER_SIZE],
    };

    if nals.must_write_aud {
        cw.write_nal(nuts.aud, 0, tid, SectionFlags::CONFIG, |bs| {
            writer.write_aud(bs, status.slice_type)
        })?;
    }

    let write_sps = status.is_random_access_point();
    let vps_nut = nuts.vps.filter(|_| write_sps && nals.layer_id == 0 && writer.has_vps());
    if let Some(vps) = vps_nut {
        cw.write_nal(vps, 0, 0, SectionFlags::CONFIG, |bs| writer.write_vps(bs))?;
    }
    if write_sps {
        cw.write_nal(nuts.sps, PARAM_SET_REF_IDC, 0, SectionFlags::CONFIG, |bs| {
            writer.write_sps(bs)
        })?;
    }
    if status.slice_type == SliceType::I || status.recovery_cnt > 0 || nals.must_write_pps {
        cw.write_nal(nuts.pps, PARAM_SET_REF_IDC, 0, SectionFlags::CONFIG, |bs| {
            writer.write_pps(bs)
        })?;
    }

    let flags = prefix_sei_flags(nals, status, write_sps);
    if flags.intersects(SeiFlags::BP | SeiFlags::PT) && writer.has_aps() {
        cw.write_nal(nuts.sei_prefix, 0, tid, SectionFlags::SEI_PREFIX, |bs| {
            writer.write_sei_aps(bs);
            sei::close_sei(bs);
        })?;
    }
    if !flags.is_empty() {
        let hdr = nals.hdr;
        cw.write_nal(nuts.sei_prefix, 0, tid, SectionFlags::SEI_PREFIX, |bs| {
            if flags.contains(SeiFlags::BP) {
                writer.write_sei_bp(bs, nals.sei);
            }
            if flags.contains(SeiFlags::RP) {
                writer.write_sei_rp(bs, status.recovery_cnt);
            }
            if flags.contains(SeiFlags::PT) {
                writer.write_sei_pt(bs, nals.sei, status);
            }
            if let Some(mdcv) = hdr.mdcv.as_ref().filter(|_| flags.contains(SeiFlags::MDCV)) {
                sei::write_mastering_display_colour_volume(bs, mdcv);
            }
            if let Some(cll) = hdr.cll.as_ref().filter(|_| flags.contains(SeiFlags::CLL)) {
                sei::write_content_light_level(bs, cll);
            }
            if let Some(atc) = hdr.atc.as_ref().filter(|_| flags.contains(SeiFlags::ATC)) {
                sei::write_alternative_transfer_characteristics(bs, atc);
            }
            if let Some(app) = hdr.st2094_10.as_deref().filter(|_| flags.contains(SeiFlags::ST2094_10)) {
                sei::write_st2094_10(bs, app);
            }
            if let Some(app) = hdr.st2094_40.as_deref().filter(|_| flags.contains(SeiFlags::ST2094_40)) {
                sei::write_st2094_40(bs, app);
            }
            sei::close_sei(bs);
        })?;
    }

    if nals.subframe_latency {
        let num_slices = nals.num_slices.min(u16::from(u8::MAX)) as u8;
        cw.write_nal(nuts.sei_prefix, 0, tid, SectionFlags::SEI_PREFIX, |bs| {
            sei::write_user_data_unregistered(bs, &SUBFRAME_UUID, num_slices)
        })?;
    }
    Ok(())
}

/// 写入填充数据 NAL, 缓冲区不足时截断并告警
fn write_filler_section(
    stream: &mut [u8],
    meta: &mut StreamMetaData,
    nals: &NalsData,
    status: &PicStatus,
) -> EncResult<()> {
    let codec = nals.writer.codec();
    let nuts = Nuts::for_codec(codec);
    let offset = meta.unused_stream_part().max(MAX_HEADER_SIZE as u32) as usize;
    let Some(room) = stream.get_mut(offset..) else {
        warn!("码流缓冲区已满, 丢弃 {} 字节填充数据", status.filler);
        return Ok(());
    };

    let app = nals.filler == FillerMode::App;
    let header = nuts.header(nuts.filler, 0, nals.layer_id, status.temporal_id);
    let mut bs = BitstreamLite::new(room);
    let written = write_filler_data(&mut bs, codec, nuts.filler, &header, status.filler, app, nals.start_code);
    if bs.is_overflow() {
        warn!("码流缓冲区剩余空间不足以写入填充 NAL, 请求 {} 字节", status.filler);
        return Ok(());
    }
    if written < status.filler {
        warn!("填充数据被截断: 请求 {} 字节, 实际写入 {} 字节", status.filler, written);
    }

    let flags = if app { SectionFlags::APP_FILLER } else { SectionFlags::FILLER };
    meta.add_section(offset as u32, written as u32, flags)
        .ok_or_else(|| EncError::CapacityOverflow("码流分段表已满".into()))?;
    Ok(())
}

/// 为一个编码完成的 slice 生成码流分段
///
/// 首个 slice 写配置 NAL, 每个 slice 登记硬件写入的数据段与填充数据,
/// 最后一个 slice 追加帧结束标记, IDR 帧的所有分段标记为同步点.
pub fn generate_sections(
    stream: &mut [u8],
    meta: &mut StreamMetaData,
    nals: &NalsData,
    status: &PicStatus,
) -> EncResult<()> {
    let before = meta.num_sections();
    let full = || EncError::CapacityOverflow("码流分段表已满".into());

    if status.is_first_slice {
        write_config_nals(stream, meta, nals, status)?;
    }

    for part in &status.stream_parts {
        meta.add_section(part.offset, part.size, SectionFlags::empty())
            .ok_or_else(full)?;
    }

    let want_filler = nals.filler != FillerMode::Disable && status.filler > 0;
    if want_filler || (nals.subframe_latency && status.is_last_slice) {
        write_filler_section(stream, meta, nals, status)?;
    }

    if status.is_last_slice {
        meta.add_section(0, 0, SectionFlags::END_FRAME).ok_or_else(full)?;
    }
    if status.is_idr {
        meta.add_flags_to_all_sections(SectionFlags::SYNC);
    }

    debug!(
        "{:?} slice: 新增 {} 个分段 (共 {})",
        status.slice_type,
        meta.num_sections() - before,
        meta.num_sections()
    );
    Ok(())
}

/// 写入应用提供的 SEI 并登记分段, 返回分段索引
///
/// 前缀 SEI 追加在最后一个前缀 SEI 之后, 位于头部预留区内, 最多写到
/// `MAX_HEADER_SIZE`; 后缀 SEI 写在所有已用数据之后.
#[allow(clippy::too_many_arguments)]
pub fn write_sei_section(
    stream: &mut [u8],
    meta: &mut StreamMetaData,
    codec: Codec,
    is_prefix: bool,
    payload_type: u32,
    payload: &[u8],
    temporal_id: u8,
    start_code: StartCodeMode,
) -> EncResult<usize> {
    let nuts = Nuts::for_codec(codec);
    let (offset, end) = if is_prefix {
        let offset = meta
            .last_section_of_flag(SectionFlags::SEI_PREFIX)
            .map_or(MAX_HEADER_SIZE - MAX_SEI_SIZE, |i| meta.sections()[i].end() as usize);
        (offset, MAX_HEADER_SIZE.min(stream.len()))
    } else {
        let offset = meta.unused_stream_part().max(MAX_HEADER_SIZE as u32) as usize;
        (offset, stream.len())
    };
    if offset >= end {
        return Err(EncError::CapacityOverflow(format!("SEI 写入位置 {} 已无剩余空间", offset)));
    }

    let mut rbsp_buf = vec![0u8; end - offset];
    let mut rbsp = BitstreamLite::new(&mut rbsp_buf);
    sei::write_external_sei(&mut rbsp, payload_type, payload);
    if rbsp.is_overflow() {
        return Err(EncError::CapacityOverflow(format!(
            "SEI 负载 {} 字节超出剩余空间 {} 字节",
            payload.len(),
            end - offset
        )));
    }
    let rbsp_bits = rbsp.bits_written();

    let nut = if is_prefix { nuts.sei_prefix } else { nuts.sei_suffix };
    let header = nuts.header(nut, 0, 0, temporal_id);
    let mut out = BitstreamLite::new(&mut stream[offset..end]);
    flush_nal(&mut out, codec, nut, &header, &rbsp_buf, rbsp_bits, start_code);
    if out.is_overflow() {
        return Err(EncError::CapacityOverflow(format!(
            "SEI NAL 超出剩余空间 {} 字节",
            end - offset
        )));
    }

    meta.add_sei_section(is_prefix, offset as u32, out.byte_offset() as u32)
        .ok_or_else(|| EncError::CapacityOverflow("码流分段表已满".into()))
}
