//! 编码通道.
//!
//! [`Encoder`] 是应用侧的编码通道句柄: 接收源帧与码流缓冲区, 暂存动态参数,
//! 通过 [`Scheduler`] 驱动硬件, 并在 slice 编码完成后补全码流头部.
//! 标准相关的高层语法由 [`HighLevelEncoder`] 的 AVC/HEVC 实现负责.

pub mod allocator;
pub mod avc;
pub mod context;
pub mod hevc;
pub mod pool;
pub mod scheduler;
pub mod settings;
pub mod source_checker;

use hwenc_core::EncResult;

use crate::hls::{RbspWriter, SeiData};
use crate::nal::Codec;
use crate::picture::PicStatus;
use crate::sections::{NalsData, generate_sections};
use crate::stream::StreamMetaData;

pub use allocator::{Allocator, HostAllocator};
pub use avc::AvcEncoder;
pub use context::{EncodedCallback, EncodedEvent, Encoder};
pub use hevc::HevcEncoder;
pub use pool::{ENC_MAX_CMD, FramePool, Semaphore};
pub use scheduler::{
    ChannelId, Completion, EncInfo, EncOptions, EndEncodingFn, RecPicture, RequestInfo, RequestOptions, Scheduler,
};
pub use settings::{EncSettings, FillerMode, GopParam, Profile, QpTableMode, RcMode, RcParam};
pub use source_checker::SourceChecker;

/// 一个编码完成的 slice 的上下文
pub struct SliceContext<'a> {
    pub settings: &'a EncSettings,
    pub status: &'a PicStatus,
    /// 应用更新过动态 HDR 元数据, 尚未写入码流
    pub dyn_hdr_changed: bool,
}

/// 标准相关的高层语法处理
pub trait HighLevelEncoder: Send {
    fn codec(&self) -> Codec;

    /// 根据图像状态更新参数集, 并为该 slice 生成码流分段
    fn write_sections(&mut self, ctx: &SliceContext, stream: &mut [u8], meta: &mut StreamMetaData) -> EncResult<()>;

    /// 最后一个 slice 完成后是否可以归还源帧
    fn should_release_source(&self, _status: &PicStatus) -> bool {
        true
    }
}

/// 按配置创建对应标准的高层语法处理
pub fn create_high_level_encoder(settings: &EncSettings) -> Box<dyn HighLevelEncoder> {
    match settings.codec() {
        Codec::Avc => Box::new(AvcEncoder::new(settings)),
        Codec::Hevc => Box::new(HevcEncoder::new(settings)),
    }
}

/// DPB 中参考帧的最大数目
fn max_ref(settings: &EncSettings) -> u32 {
    u32::from(settings.num_ref_idx) + 1
}

/// 两种标准共用的分段生成流程
fn write_layer_sections(
    writer: &dyn RbspWriter,
    sei: &mut SeiData,
    ctx: &SliceContext,
    must_write_pps: bool,
    stream: &mut [u8],
    meta: &mut StreamMetaData,
) -> EncResult<()> {
    let settings = ctx.settings;
    {
        let nals = NalsData {
            writer,
            sei,
            hdr: &settings.hdr,
            sei_flags: settings.sei_flags,
            must_write_aud: settings.enable_aud,
            must_write_pps,
            must_write_dyn_hdr: ctx.dyn_hdr_changed,
            force_rp_on_idr: settings.force_rp_on_idr,
            subframe_latency: settings.subframe_latency,
            num_slices: settings.num_slices,
            filler: settings.filler,
            start_code: settings.start_code,
            layer_id: 0,
        };
        generate_sections(stream, meta, &nals, ctx.status)?;
    }
    if ctx.status.is_last_slice {
        sei.advance(ctx.status);
    }
    Ok(())
}
