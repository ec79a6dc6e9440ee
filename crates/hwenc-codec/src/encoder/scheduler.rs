//! 调度器接口.
//!
//! 调度器负责与硬件 (或固件) 通信: 创建通道、提交帧、接收码流缓冲区,
//! 并在每个 slice 编码完成后从它自己的线程回调编码器.
//! 同一通道的回调按提交顺序到达.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use hwenc_core::{Buffer, Dimension, EncResult, FourCc};

use super::settings::{EncSettings, GopParam, RcParam};
use crate::picture::{PicStatus, PicStruct};

bitflags! {
    /// 随帧提交的动态参数变更请求
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestOptions: u32 {
        /// 场景切换, 提前量见 `scene_change_delay`
        const SCENE_CHANGE = 1 << 0;
        /// 当前帧作为长期参考
        const IS_LONG_TERM = 1 << 1;
        /// 当前帧参考长期参考帧
        const USE_LONG_TERM = 1 << 2;
        /// 重新开始 GOP (IDR)
        const RESTART_GOP = 1 << 3;
        /// 以恢复点方式重新开始 GOP
        const RESTART_GOP_RECOVERY_POINT = 1 << 4;
        /// 码控或 GOP 参数已更新
        const UPDATE_PARAMS = 1 << 5;
        /// 固定 QP
        const SET_QP = 1 << 6;
        /// QP 偏移
        const SET_QP_OFFSET = 1 << 7;
        /// 输入分辨率变化
        const SET_INPUT_RESOLUTION = 1 << 8;
        /// 环路滤波偏移变化
        const SET_LF_OFFSETS = 1 << 9;
        /// 色度 QP 偏移变化
        const SET_CHROMA_OFFSETS = 1 << 10;
        /// 运动估计代价模式
        const UPDATE_COST_MODE = 1 << 11;
    }
}

bitflags! {
    /// 逐帧编码选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EncOptions: u32 {
        /// 使用随帧提交的 QP 表
        const USE_QP_TABLE = 1 << 0;
        /// QP 表为相对值
        const RELATIVE_QP = 1 << 1;
    }
}

/// 通道句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 暂存的动态参数, 随下一帧一起提交
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub options: RequestOptions,
    /// 场景切换提前的帧数
    pub scene_change_delay: u32,
    pub qp: i16,
    pub qp_offset: i16,
    pub cost_mode: bool,
    pub input_dim: Dimension,
    pub rc: RcParam,
    pub gop: GopParam,
    /// (beta_offset_div2, tc_offset_div2)
    pub lf_offsets: (i8, i8),
    /// (cb, cr)
    pub chroma_offsets: (i8, i8),
}

impl RequestInfo {
    /// 是否有待提交的变更
    pub fn is_pending(&self) -> bool {
        !self.options.is_empty()
    }
}

/// 一帧的编码参数
#[derive(Debug, Clone)]
pub struct EncInfo {
    /// 帧池中的记录 id, 编码完成时原样带回
    pub frame_id: usize,
    pub options: EncOptions,
    pub pic_struct: PicStruct,
    pub qp_table: Option<Buffer>,
}

/// 重建图像
#[derive(Debug, Clone)]
pub struct RecPicture {
    pub buffer: Buffer,
    pub dim: Dimension,
    pub fourcc: FourCc,
}

/// 调度器回调事件
#[derive(Debug, Clone)]
pub enum Completion {
    /// 一个 slice (或整帧) 编码完成, 数据写入了 `stream_id` 对应的码流缓冲区
    Encoded {
        status: PicStatus,
        frame_id: usize,
        stream_id: u64,
    },
    /// 调度器归还了未使用的码流缓冲区
    StreamReleased { stream_id: u64 },
    /// 调度器不再使用该源帧
    SourceReleased { frame_id: usize },
    /// 流结束
    EndOfStream,
}

/// 编码完成回调
pub type EndEncodingFn = Arc<dyn Fn(Completion) + Send + Sync>;

/// 硬件调度器
pub trait Scheduler: Send + Sync {
    /// 创建编码通道
    fn create_channel(&self, settings: &EncSettings, ep1: &Buffer, on_end: EndEncodingFn) -> EncResult<ChannelId>;

    /// 销毁编码通道
    fn destroy_channel(&self, chan: ChannelId) -> EncResult<()>;

    /// 提交一帧
    fn encode_one_frame(&self, chan: ChannelId, info: EncInfo, request: &RequestInfo, frame: &Buffer)
        -> EncResult<()>;

    /// 不再提交新帧, 已提交的帧编码完成后回调 [`Completion::EndOfStream`]
    fn flush(&self, chan: ChannelId) -> EncResult<()>;

    /// 提供码流缓冲区, 硬件从 `offset` 开始写 slice 数据
    fn put_stream_buffer(&self, chan: ChannelId, stream: &Buffer, stream_id: u64, offset: usize) -> EncResult<()>;

    /// 取得一帧重建图像
    fn get_rec_picture(&self, chan: ChannelId) -> Option<RecPicture>;

    /// 归还重建图像
    fn release_rec_picture(&self, chan: ChannelId, rec: RecPicture) -> EncResult<()>;
}
