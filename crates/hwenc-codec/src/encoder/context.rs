//! 编码通道上下文与动态命令.
//!
//! 应用线程调用 [`Encoder::process`]、[`Encoder::put_stream_buffer`] 与各个 setter,
//! 调度器线程回调编码完成事件. 两边共享的状态 (帧池、在途源帧、码流缓冲区队列、
//! 高层语法) 由同一把互斥锁保护. 调用调度器与用户回调时都不持有这把锁,
//! 因为同步调度器会在 `encode_one_frame` 内部直接回调.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hwenc_core::{Buffer, Dimension, EncError, EncResult};
use log::{debug, info, warn};

use super::allocator::Allocator;
use super::pool::{ENC_MAX_CMD, FramePool, Semaphore};
use super::scheduler::{
    ChannelId, Completion, EncInfo, EncOptions, EndEncodingFn, RecPicture, RequestInfo, RequestOptions, Scheduler,
};
use super::settings::{
    EncSettings, MAX_QP, QpTableMode, RcMode, check_chroma_offsets, check_lf_offset, check_qp, check_qp_bounds,
};
use super::source_checker::SourceChecker;
use super::{HighLevelEncoder, SliceContext, create_high_level_encoder};
use crate::picture::{ErrorCode, PicStatus, PicStruct, SliceType};
use crate::sections::write_sei_section;
use crate::sei::HdrSeis;
use crate::stream::{MAX_HEADER_SIZE, PictureMeta, StreamMetaData};

/// 同时交给调度器的码流缓冲区上限
pub const MAX_STREAM_BUFFER: usize = 32;
/// EP1 (lambda 与 QP 边信息) 缓冲区大小
const EP1_SIZE: usize = 4096;

/// 交给应用的编码事件
#[derive(Debug, Clone)]
pub enum EncodedEvent {
    /// 码流缓冲区已填好. 最后一个 slice 附带源帧, 编码器随后不再持有它
    Stream { stream: Buffer, source: Option<Buffer> },
    /// 未使用的码流缓冲区被归还
    ReleasedStream(Buffer),
    /// 未编码的源帧被归还
    ReleasedSource(Buffer),
    /// 流结束, 之后不再有事件
    EndOfStream,
}

/// 应用注册的事件回调, 在调度器线程上调用
pub type EncodedCallback = Box<dyn Fn(EncodedEvent) + Send + Sync>;

struct FrameInfo {
    source: Buffer,
    qp_table: Option<Buffer>,
}

/// 已发送给调度器的码流缓冲区, 按发送顺序排列
#[derive(Default)]
struct StreamRing {
    slots: VecDeque<(u64, Buffer)>,
    next_id: u64,
}

impl StreamRing {
    fn is_full(&self) -> bool {
        self.slots.len() >= MAX_STREAM_BUFFER
    }

    fn push(&mut self, stream: Buffer) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.push_back((id, stream));
        id
    }

    /// 编码完成的缓冲区必须是最早发送的那个
    fn pop(&mut self, stream_id: u64) -> EncResult<Buffer> {
        match self.slots.front() {
            Some((id, _)) if *id == stream_id => {
                self.slots.pop_front().map(|(_, s)| s).ok_or_else(unreachable_ring)
            }
            Some((id, _)) => Err(EncError::Internal(format!(
                "码流缓冲区返回顺序错误: 期望 {}, 实际 {}",
                id, stream_id
            ))),
            None => Err(EncError::Internal(format!(
                "收到未发送的码流缓冲区 {}",
                stream_id
            ))),
        }
    }

    fn remove(&mut self, stream_id: u64) -> Option<Buffer> {
        let pos = self.slots.iter().position(|(id, _)| *id == stream_id)?;
        self.slots.remove(pos).map(|(_, s)| s)
    }

    fn drain(&mut self) -> Vec<Buffer> {
        self.slots.drain(..).map(|(_, s)| s).collect()
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

fn unreachable_ring() -> EncError {
    EncError::Internal("码流缓冲区队列状态不一致".into())
}

struct ChannelState {
    settings: EncSettings,
    hl: Box<dyn HighLevelEncoder>,
    frames: FramePool<FrameInfo>,
    /// 在途源帧, 按指针比较查找
    sources: Vec<Buffer>,
    streams: StreamRing,
    request: RequestInfo,
    checker: SourceChecker,
    last_error: ErrorCode,
    dyn_hdr_changed: bool,
    eos: bool,
}

impl ChannelState {
    fn new(settings: EncSettings) -> Self {
        let checker = SourceChecker::new(settings.dim(), settings.max_dim(), settings.fourcc);
        Self {
            hl: create_high_level_encoder(&settings),
            frames: FramePool::new(ENC_MAX_CMD),
            sources: Vec::with_capacity(ENC_MAX_CMD),
            streams: StreamRing::default(),
            request: RequestInfo::default(),
            checker,
            last_error: ErrorCode::Success,
            dyn_hdr_changed: false,
            eos: false,
            settings,
        }
    }

    /// 取出暂存的请求, 附上当前配置
    fn take_request(&mut self) -> RequestInfo {
        let mut request = std::mem::take(&mut self.request);
        let s = &self.settings;
        request.rc = s.rc;
        request.gop = s.gop;
        request.lf_offsets = (s.beta_offset, s.tc_offset);
        request.chroma_offsets = (s.cb_qp_offset, s.cr_qp_offset);
        request
    }

    /// 提交失败后重新暂存
    fn restore_request(&mut self, request: RequestInfo) {
        if self.request.is_pending() {
            self.request.options |= request.options;
        } else {
            self.request = request;
        }
    }

    fn remove_source(&mut self, source: &Buffer) {
        if let Some(pos) = self.sources.iter().position(|s| Buffer::ptr_eq(s, source)) {
            self.sources.swap_remove(pos);
        }
    }

    /// 归还帧记录, 返回其源帧
    fn release_frame(&mut self, frame_id: usize) -> Option<Buffer> {
        let info = self.frames.release(frame_id)?;
        self.remove_source(&info.source);
        drop(info.qp_table);
        Some(info.source)
    }

    fn write_sections(&mut self, stream: &Buffer, status: &PicStatus) -> EncResult<()> {
        let ctx = SliceContext {
            settings: &self.settings,
            status,
            dyn_hdr_changed: self.dyn_hdr_changed,
        };
        let hl = &mut self.hl;
        let mut data = stream.lock_data();
        stream
            .with_meta::<StreamMetaData, _>(|meta| {
                meta.temporal_id = status.temporal_id;
                hl.write_sections(&ctx, data.as_mut_slice(), meta)
            })
            .unwrap_or_else(|| Err(EncError::Internal("码流缓冲区缺少分段元数据".into())))?;
        if status.is_first_slice {
            self.dyn_hdr_changed = false;
        }
        Ok(())
    }
}

/// 调度器回调与应用线程共享的部分
struct Shared {
    state: Mutex<ChannelState>,
    in_flight: Semaphore,
    callback: EncodedCallback,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end_encoding(&self, completion: Completion) {
        match completion {
            Completion::Encoded {
                status,
                frame_id,
                stream_id,
            } => self.on_encoded(&status, frame_id, stream_id),
            Completion::StreamReleased { stream_id } => {
                let stream = self.lock().streams.remove(stream_id);
                if let Some(stream) = stream {
                    (self.callback)(EncodedEvent::ReleasedStream(stream));
                }
            }
            Completion::SourceReleased { frame_id } => {
                let source = self.lock().release_frame(frame_id);
                if let Some(source) = source {
                    self.in_flight.release();
                    (self.callback)(EncodedEvent::ReleasedSource(source));
                }
            }
            Completion::EndOfStream => {
                info!("编码通道流结束");
                (self.callback)(EncodedEvent::EndOfStream);
            }
        }
    }

    fn on_encoded(&self, status: &PicStatus, frame_id: usize, stream_id: u64) {
        let mut state = self.lock();
        let stream = match state.streams.pop(stream_id) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{}", e);
                state.last_error = ErrorCode::Internal;
                return;
            }
        };

        state.last_error = status.error;
        let skipped = status.error == ErrorCode::WarnSkipped;
        if status.error.is_error() || skipped {
            debug!("帧 {} 未生成分段: {:?}", frame_id, status.error);
        } else if let Err(e) = state.write_sections(&stream, status) {
            warn!("码流分段生成失败: {}", e);
            state.last_error = ErrorCode::from(&e);
        }
        stream.add_meta(PictureMeta {
            slice_type: status.slice_type,
            skipped,
        });

        let source = if status.is_last_slice && state.hl.should_release_source(status) {
            state.release_frame(frame_id)
        } else {
            None
        };
        drop(state);

        if source.is_some() {
            self.in_flight.release();
        }
        (self.callback)(EncodedEvent::Stream { stream, source });
    }
}

/// 编码通道
pub struct Encoder {
    shared: Arc<Shared>,
    scheduler: Arc<dyn Scheduler>,
    allocator: Arc<dyn Allocator>,
    channel: ChannelId,
    ep1: Option<Buffer>,
}

impl Encoder {
    /// 创建编码通道
    ///
    /// 任何一步失败都会返回错误, 已分配的资源随之释放.
    pub fn create(
        scheduler: Arc<dyn Scheduler>,
        allocator: Arc<dyn Allocator>,
        settings: EncSettings,
        callback: EncodedCallback,
    ) -> EncResult<Self> {
        settings.validate()?;
        let ep1 = allocator.alloc(EP1_SIZE, "ep1")?;

        let summary = format!(
            "{:?} level {}.{} {}x{} {:?}",
            settings.profile,
            settings.level / 10,
            settings.level % 10,
            settings.width,
            settings.height,
            settings.rc.mode
        );
        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState::new(settings.clone())),
            in_flight: Semaphore::new(ENC_MAX_CMD - 1),
            callback,
        });
        let weak = Arc::downgrade(&shared);
        let on_end: EndEncodingFn = Arc::new(move |completion| {
            if let Some(shared) = weak.upgrade() {
                shared.end_encoding(completion);
            }
        });
        let channel = scheduler.create_channel(&settings, &ep1, on_end)?;
        info!("创建编码通道 {}: {}", channel, summary);

        Ok(Self {
            shared,
            scheduler,
            allocator,
            channel,
            ep1: Some(ep1),
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// 当前配置 (含已暂存的修改)
    pub fn settings(&self) -> EncSettings {
        self.shared.lock().settings.clone()
    }

    /// 最近一次操作或编码完成的错误码
    pub fn last_error(&self) -> ErrorCode {
        self.shared.lock().last_error
    }

    /// 已发送但尚未返回的码流缓冲区数
    pub fn pending_streams(&self) -> usize {
        self.shared.lock().streams.len()
    }

    /// 阻塞直到所有已提交的帧都编码完成
    pub fn wait_readiness(&self) {
        self.shared.in_flight.wait_idle();
    }

    fn fail<T>(state: &mut ChannelState, e: EncError) -> EncResult<T> {
        state.last_error = ErrorCode::from(&e);
        Err(e)
    }

    /// 提供一个码流缓冲区, 头部 `MAX_HEADER_SIZE` 字节留给配置 NAL
    pub fn put_stream_buffer(&self, stream: Buffer) -> EncResult<()> {
        let stream_id = {
            let mut state = self.shared.lock();
            if stream.size() <= MAX_HEADER_SIZE {
                return Self::fail(
                    &mut state,
                    EncError::InvalidArgument(format!(
                        "码流缓冲区 {} 字节, 不足以容纳 {} 字节头部预留区",
                        stream.size(),
                        MAX_HEADER_SIZE
                    )),
                );
            }
            if state.streams.is_full() {
                return Self::fail(
                    &mut state,
                    EncError::InvalidArgument(format!("已发送 {} 个码流缓冲区, 队列已满", MAX_STREAM_BUFFER)),
                );
            }
            stream.remove_meta::<PictureMeta>();
            stream.add_meta(StreamMetaData::default());
            state.streams.push(stream.clone())
        };

        if let Err(e) = self
            .scheduler
            .put_stream_buffer(self.channel, &stream, stream_id, MAX_HEADER_SIZE)
        {
            let mut state = self.shared.lock();
            state.streams.remove(stream_id);
            return Self::fail(&mut state, e);
        }
        Ok(())
    }

    /// 提交一帧; `None` 表示流结束
    pub fn process(&self, frame: Option<&Buffer>, qp_table: Option<&Buffer>) -> EncResult<()> {
        let Some(frame) = frame else {
            return self.end_of_stream();
        };

        let qp_mode = {
            let mut state = self.shared.lock();
            if state.eos {
                return Self::fail(&mut state, EncError::Eof);
            }
            if let Err(e) = state.checker.check(frame) {
                warn!("源帧不可用: {}", e);
                return Self::fail(&mut state, e);
            }
            if qp_table.is_some() && state.settings.qp_table == QpTableMode::None {
                return Self::fail(
                    &mut state,
                    EncError::InvalidArgument("通道未启用 QP 表, 不能随帧提交".into()),
                );
            }
            state.settings.qp_table
        };

        self.shared.in_flight.acquire();
        let (info, request) = {
            let mut state = self.shared.lock();
            let record = FrameInfo {
                source: frame.clone(),
                qp_table: qp_table.cloned(),
            };
            let Some(frame_id) = state.frames.acquire(record) else {
                drop(state);
                self.shared.in_flight.release();
                return Err(EncError::Internal("帧记录池已满".into()));
            };
            state.sources.push(frame.clone());

            let mut options = EncOptions::empty();
            if qp_table.is_some() {
                options |= EncOptions::USE_QP_TABLE;
                if qp_mode == QpTableMode::Relative {
                    options |= EncOptions::RELATIVE_QP;
                }
            }
            let info = EncInfo {
                frame_id,
                options,
                pic_struct: PicStruct::Frame,
                qp_table: qp_table.cloned(),
            };
            (info, state.take_request())
        };

        let frame_id = info.frame_id;
        if !request.options.is_empty() {
            debug!("帧 {} 携带参数变更 {:?}", frame_id, request.options);
        }
        if let Err(e) = self.scheduler.encode_one_frame(self.channel, info, &request, frame) {
            warn!("提交帧失败: {}", e);
            let mut state = self.shared.lock();
            state.release_frame(frame_id);
            state.restore_request(request);
            let result = Self::fail(&mut state, e);
            drop(state);
            self.shared.in_flight.release();
            return result;
        }
        Ok(())
    }

    fn end_of_stream(&self) -> EncResult<()> {
        {
            let mut state = self.shared.lock();
            if state.eos {
                return Ok(());
            }
            state.eos = true;
        }
        info!("编码通道 {} 请求结束", self.channel);
        self.scheduler.flush(self.channel)
    }

    /// 向已编码的码流缓冲区写入一个 SEI, 返回分段索引
    pub fn add_sei(
        &self,
        stream: &Buffer,
        is_prefix: bool,
        payload_type: u32,
        payload: &[u8],
        temporal_id: u8,
    ) -> EncResult<usize> {
        let (codec, start_code) = {
            let state = self.shared.lock();
            (state.settings.codec(), state.settings.start_code)
        };
        let result = {
            let mut data = stream.lock_data();
            stream
                .with_meta::<StreamMetaData, _>(|meta| {
                    write_sei_section(
                        data.as_mut_slice(),
                        meta,
                        codec,
                        is_prefix,
                        payload_type,
                        payload,
                        temporal_id,
                        start_code,
                    )
                })
                .unwrap_or_else(|| Err(EncError::InvalidArgument("码流缓冲区没有分段元数据".into())))
        };
        if let Err(e) = &result {
            self.shared.lock().last_error = ErrorCode::from(e);
        }
        result
    }

    pub fn get_rec_picture(&self) -> Option<RecPicture> {
        self.scheduler.get_rec_picture(self.channel)
    }

    pub fn release_rec_picture(&self, rec: RecPicture) -> EncResult<()> {
        self.scheduler.release_rec_picture(self.channel, rec)
    }

    /// 校验并暂存一次修改, 随下一帧提交
    fn stage(&self, options: RequestOptions, f: impl FnOnce(&mut ChannelState) -> EncResult<()>) -> EncResult<()> {
        let mut state = self.shared.lock();
        if let Err(e) = f(&mut state) {
            return Self::fail(&mut state, e);
        }
        state.request.options |= options;
        Ok(())
    }

    /// 场景切换将在 `ahead` 帧之后发生
    pub fn notify_scene_change(&self, ahead: u32) -> EncResult<()> {
        self.stage(RequestOptions::SCENE_CHANGE, |s| {
            s.request.scene_change_delay = ahead;
            Ok(())
        })
    }

    pub fn notify_is_long_term(&self) -> EncResult<()> {
        self.stage(RequestOptions::IS_LONG_TERM, |_| Ok(()))
    }

    pub fn notify_use_long_term(&self) -> EncResult<()> {
        self.stage(RequestOptions::USE_LONG_TERM, |_| Ok(()))
    }

    pub fn restart_gop(&self) -> EncResult<()> {
        self.stage(RequestOptions::RESTART_GOP, |_| Ok(()))
    }

    pub fn restart_gop_recovery_point(&self) -> EncResult<()> {
        self.stage(RequestOptions::RESTART_GOP_RECOVERY_POINT, |_| Ok(()))
    }

    pub fn set_gop_length(&self, length: u32) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            if length == 0 || s.settings.gop.num_b >= length {
                return Err(EncError::InvalidArgument(format!(
                    "GOP 长度 {} 必须大于 B 帧数 {}",
                    length, s.settings.gop.num_b
                )));
            }
            s.settings.gop.length = length;
            Ok(())
        })
    }

    pub fn set_gop_num_b(&self, num_b: u32) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            if num_b >= s.settings.gop.length {
                return Err(EncError::InvalidArgument(format!(
                    "B 帧数 {} 必须小于 GOP 长度 {}",
                    num_b, s.settings.gop.length
                )));
            }
            s.settings.gop.num_b = num_b;
            Ok(())
        })
    }

    pub fn set_freq_idr(&self, freq_idr: u32) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            s.settings.gop.freq_idr = freq_idr;
            Ok(())
        })
    }

    pub fn set_frame_rate(&self, frame_rate: u16, clk_ratio: u16) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            if frame_rate == 0 || clk_ratio == 0 {
                return Err(EncError::InvalidArgument(format!(
                    "无效帧率 {}/{}",
                    frame_rate, clk_ratio
                )));
            }
            s.settings.rc.frame_rate = frame_rate;
            s.settings.rc.clk_ratio = clk_ratio;
            Ok(())
        })
    }

    pub fn set_cost_mode(&self, cost_mode: bool) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_COST_MODE, |s| {
            s.request.cost_mode = cost_mode;
            Ok(())
        })
    }

    /// 切换输入分辨率, 不能超过通道的最大分辨率
    pub fn set_input_resolution(&self, dim: Dimension) -> EncResult<()> {
        self.stage(RequestOptions::SET_INPUT_RESOLUTION, |s| {
            s.checker.update_resolution(dim)?;
            s.request.input_dim = dim;
            Ok(())
        })
    }

    /// 目标码率 (bps), CBR 下同时设置最大码率
    pub fn set_bit_rate(&self, bit_rate: u32) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            if bit_rate == 0 {
                return Err(EncError::InvalidArgument("码率不能为 0".into()));
            }
            s.settings.rc.target_bit_rate = bit_rate;
            if s.settings.rc.mode == RcMode::Cbr {
                s.settings.rc.max_bit_rate = bit_rate;
            }
            Ok(())
        })
    }

    pub fn set_max_bit_rate(&self, target: u32, max: u32) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            if target == 0 || max < target {
                return Err(EncError::InvalidArgument(format!(
                    "无效码率: 目标 {} 最大 {}",
                    target, max
                )));
            }
            s.settings.rc.target_bit_rate = target;
            s.settings.rc.max_bit_rate = max;
            Ok(())
        })
    }

    /// 所有 slice 类型的最大图像大小 (bit)
    pub fn set_max_picture_size(&self, max_size: u32) -> EncResult<()> {
        self.set_max_picture_size_per_frame_type([max_size; 3])
    }

    /// 按 (I, P, B) 设置最大图像大小 (bit)
    pub fn set_max_picture_size_per_frame_type(&self, max_sizes: [u32; 3]) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            s.settings.rc.max_picture_size = max_sizes;
            Ok(())
        })
    }

    pub fn set_qp(&self, qp: i16) -> EncResult<()> {
        self.stage(RequestOptions::SET_QP, |s| {
            check_qp(qp)?;
            s.request.qp = qp;
            Ok(())
        })
    }

    pub fn set_qp_offset(&self, offset: i16) -> EncResult<()> {
        self.stage(RequestOptions::SET_QP_OFFSET, |s| {
            if !(-MAX_QP..=MAX_QP).contains(&offset) {
                return Err(EncError::InvalidArgument(format!("QP 偏移 {} 超出范围", offset)));
            }
            s.request.qp_offset = offset;
            Ok(())
        })
    }

    pub fn set_qp_bounds(&self, min_qp: i16, max_qp: i16) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            check_qp_bounds(min_qp, max_qp)?;
            s.settings.rc.min_qp = [min_qp; 3];
            s.settings.rc.max_qp = [max_qp; 3];
            Ok(())
        })
    }

    pub fn set_qp_bounds_per_frame_type(&self, slice_type: SliceType, min_qp: i16, max_qp: i16) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            check_qp_bounds(min_qp, max_qp)?;
            let idx = slice_type.rc_index();
            s.settings.rc.min_qp[idx] = min_qp;
            s.settings.rc.max_qp[idx] = max_qp;
            Ok(())
        })
    }

    pub fn set_qp_ip_delta(&self, delta: i16) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            check_delta("I/P", delta)?;
            s.settings.rc.ip_delta = delta;
            Ok(())
        })
    }

    pub fn set_qp_pb_delta(&self, delta: i16) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            check_delta("P/B", delta)?;
            s.settings.rc.pb_delta = delta;
            Ok(())
        })
    }

    pub fn set_qp_chroma_offsets(&self, cb: i8, cr: i8) -> EncResult<()> {
        self.stage(RequestOptions::SET_CHROMA_OFFSETS, |s| {
            check_chroma_offsets(cb, cr)?;
            s.settings.cb_qp_offset = cb;
            s.settings.cr_qp_offset = cr;
            Ok(())
        })
    }

    pub fn set_auto_qp(&self, auto_qp: bool) -> EncResult<()> {
        self.stage(RequestOptions::UPDATE_PARAMS, |s| {
            s.settings.rc.auto_qp = auto_qp;
            Ok(())
        })
    }

    pub fn set_loop_filter_beta_offset(&self, offset: i8) -> EncResult<()> {
        self.stage(RequestOptions::SET_LF_OFFSETS, |s| {
            check_lf_offset("beta", offset)?;
            s.settings.beta_offset = offset;
            Ok(())
        })
    }

    pub fn set_loop_filter_tc_offset(&self, offset: i8) -> EncResult<()> {
        self.stage(RequestOptions::SET_LF_OFFSETS, |s| {
            check_lf_offset("tc", offset)?;
            s.settings.tc_offset = offset;
            Ok(())
        })
    }

    /// 更新 HDR SEI 内容, 动态 HDR (ST 2094-40) 在下一帧重发
    pub fn set_hdr_seis(&self, hdr: HdrSeis) -> EncResult<()> {
        self.stage(RequestOptions::empty(), |s| {
            s.settings.hdr = hdr;
            s.dyn_hdr_changed = true;
            Ok(())
        })
    }
}

fn check_delta(name: &str, delta: i16) -> EncResult<()> {
    if !(-1..=MAX_QP).contains(&delta) {
        return Err(EncError::InvalidArgument(format!("{} QP 差 {} 超出范围 -1..={}", name, delta, MAX_QP)));
    }
    Ok(())
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if let Err(e) = self.scheduler.destroy_channel(self.channel) {
            warn!("销毁编码通道 {} 失败: {}", self.channel, e);
        }
        let (streams, sources) = {
            let mut state = self.shared.lock();
            state.sources.clear();
            let sources: Vec<_> = state.frames.drain().into_iter().map(|f| f.source).collect();
            (state.streams.drain(), sources)
        };
        debug!(
            "编码通道 {} 归还 {} 个码流缓冲区, {} 个源帧",
            self.channel,
            streams.len(),
            sources.len()
        );
        for stream in streams {
            (self.shared.callback)(EncodedEvent::ReleasedStream(stream));
        }
        for source in sources {
            (self.shared.callback)(EncodedEvent::ReleasedSource(source));
        }
        if let Some(ep1) = self.ep1.take() {
            self.allocator.free(ep1);
        }
        info!("编码通道 {} 已销毁", self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::allocator::HostAllocator;
    use crate::picture::StreamPart;
    use crate::stream::SectionFlags;
    use hwenc_core::{FourCc, PixMapMeta};

    /// 记录调用并由测试手动触发回调的调度器
    #[derive(Default)]
    struct ManualScheduler {
        on_end: Mutex<Option<EndEncodingFn>>,
        frames: Mutex<Vec<(EncInfo, RequestInfo)>>,
        streams: Mutex<Vec<u64>>,
        fail_encode: Mutex<bool>,
    }

    impl ManualScheduler {
        fn complete(&self, completion: Completion) {
            let on_end = self.on_end.lock().unwrap().clone().unwrap();
            on_end(completion);
        }
    }

    impl Scheduler for ManualScheduler {
        fn create_channel(&self, _: &EncSettings, _: &Buffer, on_end: EndEncodingFn) -> EncResult<ChannelId> {
            *self.on_end.lock().unwrap() = Some(on_end);
            Ok(ChannelId(3))
        }

        fn destroy_channel(&self, _: ChannelId) -> EncResult<()> {
            Ok(())
        }

        fn encode_one_frame(&self, _: ChannelId, info: EncInfo, request: &RequestInfo, _: &Buffer) -> EncResult<()> {
            if *self.fail_encode.lock().unwrap() {
                return Err(EncError::Scheduler("硬件忙".into()));
            }
            self.frames.lock().unwrap().push((info, request.clone()));
            Ok(())
        }

        fn flush(&self, _: ChannelId) -> EncResult<()> {
            self.complete(Completion::EndOfStream);
            Ok(())
        }

        fn put_stream_buffer(&self, _: ChannelId, _: &Buffer, stream_id: u64, offset: usize) -> EncResult<()> {
            assert_eq!(offset, MAX_HEADER_SIZE);
            self.streams.lock().unwrap().push(stream_id);
            Ok(())
        }

        fn get_rec_picture(&self, _: ChannelId) -> Option<RecPicture> {
            None
        }

        fn release_rec_picture(&self, _: ChannelId, _: RecPicture) -> EncResult<()> {
            Ok(())
        }
    }

    type Events = Arc<Mutex<Vec<EncodedEvent>>>;

    fn create(settings: EncSettings) -> (Encoder, Arc<ManualScheduler>, Events) {
        let sched = Arc::new(ManualScheduler::default());
        let events: Events = Arc::default();
        let sink = Arc::clone(&events);
        let enc = Encoder::create(
            sched.clone(),
            Arc::new(HostAllocator::new()),
            settings,
            Box::new(move |e| sink.lock().unwrap().push(e)),
        )
        .unwrap();
        (enc, sched, events)
    }

    fn small_settings() -> EncSettings {
        EncSettings {
            width: 320,
            height: 240,
            ..Default::default()
        }
    }

    fn frame(width: u32, height: u32) -> Buffer {
        let meta = PixMapMeta::packed(Dimension::new(width, height), FourCc::Nv12);
        let buf = Buffer::new(meta.required_size(), "src");
        buf.add_meta(meta);
        buf
    }

    fn idr_status() -> PicStatus {
        PicStatus {
            slice_type: SliceType::I,
            is_idr: true,
            is_first_slice: true,
            is_last_slice: true,
            pps_qp: 30,
            pic_dim: Dimension::new(320, 240),
            stream_parts: vec![StreamPart {
                offset: MAX_HEADER_SIZE as u32,
                size: 32,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_mismatched_source() {
        let (enc, sched, _) = create(small_settings());
        let err = enc.process(Some(&frame(640, 480)), None).unwrap_err();
        assert!(matches!(err, EncError::SourceFormatMismatch(_)));
        assert_eq!(enc.last_error(), ErrorCode::SourceMismatch);
        assert!(sched.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_staged_request_sent_once() {
        let (enc, sched, _) = create(small_settings());
        assert!(enc.set_qp(60).is_err());
        assert_eq!(enc.last_error(), ErrorCode::InvalidArgument);
        assert!(enc.set_loop_filter_beta_offset(7).is_err());

        enc.set_bit_rate(2_000_000).unwrap();
        enc.notify_scene_change(3).unwrap();
        enc.process(Some(&frame(320, 240)), None).unwrap();
        enc.process(Some(&frame(320, 240)), None).unwrap();

        let frames = sched.frames.lock().unwrap();
        let (_, first) = &frames[0];
        assert!(first.options.contains(RequestOptions::UPDATE_PARAMS | RequestOptions::SCENE_CHANGE));
        assert_eq!(first.scene_change_delay, 3);
        assert_eq!(first.rc.target_bit_rate, 2_000_000);
        assert_eq!(first.rc.max_bit_rate, 2_000_000, "CBR 下最大码率跟随目标码率");
        assert!(frames[1].1.options.is_empty(), "暂存的请求只随一帧提交");
        assert_ne!(frames[0].0.frame_id, frames[1].0.frame_id);
    }

    #[test]
    fn test_failed_submit_keeps_request() {
        let (enc, sched, _) = create(small_settings());
        enc.restart_gop().unwrap();
        *sched.fail_encode.lock().unwrap() = true;
        assert!(enc.process(Some(&frame(320, 240)), None).is_err());
        assert_eq!(enc.last_error(), ErrorCode::Scheduler);

        *sched.fail_encode.lock().unwrap() = false;
        enc.process(Some(&frame(320, 240)), None).unwrap();
        let frames = sched.frames.lock().unwrap();
        assert!(frames[0].1.options.contains(RequestOptions::RESTART_GOP));
    }

    #[test]
    fn test_completion_writes_sections_and_returns_source() {
        let (enc, sched, events) = create(small_settings());
        let stream = Buffer::new(MAX_HEADER_SIZE + 1024, "stream");
        enc.put_stream_buffer(stream.clone()).unwrap();
        let src = frame(320, 240);
        enc.process(Some(&src), None).unwrap();

        let frame_id = sched.frames.lock().unwrap()[0].0.frame_id;
        let stream_id = sched.streams.lock().unwrap()[0];
        sched.complete(Completion::Encoded {
            status: idr_status(),
            frame_id,
            stream_id,
        });
        enc.wait_readiness();

        let events = events.lock().unwrap();
        let EncodedEvent::Stream { stream: out, source } = &events[0] else {
            panic!("应当返回码流缓冲区: {:?}", events[0]);
        };
        assert!(Buffer::ptr_eq(out, &stream));
        assert!(Buffer::ptr_eq(source.as_ref().unwrap(), &src));
        let meta = out.with_meta::<StreamMetaData, _>(|m| m.clone()).unwrap();
        assert_eq!(meta.end_frame_count(), 1);
        assert!(meta.sections()[0].flags.contains(SectionFlags::CONFIG | SectionFlags::SYNC));
        let pic = out.with_meta::<PictureMeta, _>(|m| *m).unwrap();
        assert_eq!(pic.slice_type, SliceType::I);
        assert_eq!(enc.pending_streams(), 0);
        assert_eq!(enc.last_error(), ErrorCode::Success);
    }

    #[test]
    fn test_skipped_picture_has_no_sections() {
        let (enc, sched, events) = create(small_settings());
        let stream = Buffer::new(MAX_HEADER_SIZE + 256, "stream");
        enc.put_stream_buffer(stream).unwrap();
        enc.process(Some(&frame(320, 240)), None).unwrap();
        let mut status = idr_status();
        status.error = ErrorCode::WarnSkipped;
        sched.complete(Completion::Encoded {
            status,
            frame_id: 0,
            stream_id: 0,
        });

        let events = events.lock().unwrap();
        let EncodedEvent::Stream { stream, .. } = &events[0] else {
            panic!("应当返回码流缓冲区");
        };
        assert_eq!(stream.with_meta::<StreamMetaData, _>(|m| m.num_sections()), Some(0));
        assert!(stream.with_meta::<PictureMeta, _>(|m| m.skipped).unwrap());
        assert_eq!(enc.last_error(), ErrorCode::WarnSkipped);
    }

    #[test]
    fn test_stream_ring_capacity() {
        let (enc, _, _) = create(small_settings());
        for _ in 0..MAX_STREAM_BUFFER {
            enc.put_stream_buffer(Buffer::new(MAX_HEADER_SIZE + 16, "s")).unwrap();
        }
        assert!(enc.put_stream_buffer(Buffer::new(MAX_HEADER_SIZE + 16, "s")).is_err());
        assert!(enc.put_stream_buffer(Buffer::new(MAX_HEADER_SIZE, "tiny")).is_err());
        assert_eq!(enc.pending_streams(), MAX_STREAM_BUFFER);
    }

    #[test]
    fn test_end_of_stream_and_drop() {
        let (enc, _, events) = create(small_settings());
        enc.put_stream_buffer(Buffer::new(MAX_HEADER_SIZE + 16, "s")).unwrap();
        enc.process(Some(&frame(320, 240)), None).unwrap();
        enc.process(None, None).unwrap();
        assert!(matches!(enc.process(Some(&frame(320, 240)), None), Err(EncError::Eof)));
        drop(enc);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], EncodedEvent::EndOfStream));
        assert!(matches!(events[1], EncodedEvent::ReleasedStream(_)));
        assert!(matches!(events[2], EncodedEvent::ReleasedSource(_)));
    }

    #[test]
    fn test_input_resolution_limited_by_max() {
        let (enc, _, _) = create(EncSettings {
            max_width: 640,
            max_height: 480,
            ..small_settings()
        });
        assert!(enc.set_input_resolution(Dimension::new(1280, 720)).is_err());
        enc.set_input_resolution(Dimension::new(640, 480)).unwrap();
        enc.process(Some(&frame(640, 480)), None).unwrap();
    }
}
