//! 软件环回调度器.
//!
//! 不驱动任何硬件: 每帧生成一个 (或每 slice 一个) 合成的 slice NAL, 写在码流缓冲区
//! 头部预留区之后, 并按 I/P GOP 结构上报图像状态. 用于命令行工具与测试.
//!
//! 可以同步运行 (在 `encode_one_frame`/`put_stream_buffer` 的调用线程上直接回调),
//! 也可以在独立的工作线程上回调.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use hwenc_core::{BitstreamLite, Buffer, Dimension, EncError, EncResult, FourCc};
use log::{debug, trace, warn};

use crate::encoder::scheduler::{
    ChannelId, Completion, EncInfo, EndEncodingFn, RecPicture, RequestInfo, RequestOptions, Scheduler,
};
use crate::encoder::settings::{EncSettings, FillerMode, GopParam, RcMode, RcParam};
use crate::nal::{AvcNalType, Codec, HevcNalType, NalHeader, StartCodeMode, flush_nal};
use crate::picture::{ErrorCode, HlsInfo, PicStatus, SliceType, StreamPart};

/// 保留的重建图像数
const MAX_REC_PICTURES: usize = 2;
/// 从源帧采样写入合成 slice 的字节数
const SLICE_SAMPLE_BYTES: usize = 16;

struct Job {
    info: EncInfo,
    request: RequestInfo,
    source: Buffer,
}

struct ChannelCtx {
    codec: Codec,
    num_slices: u16,
    subframe: bool,
    filler: FillerMode,
    start_code: StartCodeMode,
    rc: RcParam,
    gop: GopParam,
    dim: Dimension,
    fourcc: FourCc,
    /// (cb, cr)
    chroma_offsets: (i8, i8),
    on_end: EndEncodingFn,

    streams: VecDeque<(u64, Buffer, usize)>,
    jobs: VecDeque<Job>,
    recs: VecDeque<RecPicture>,

    frame_count: u64,
    since_idr: u32,
    gop_pos: u32,
    nal_id: u8,
    qp: i16,
    pumping: bool,
    flushing: bool,
    eos_sent: bool,
}

impl ChannelCtx {
    fn new(settings: &EncSettings, on_end: EndEncodingFn) -> Self {
        Self {
            codec: settings.codec(),
            num_slices: settings.num_slices.max(1),
            subframe: settings.subframe_latency,
            filler: settings.filler,
            start_code: settings.start_code,
            rc: settings.rc,
            gop: settings.gop,
            dim: settings.dim(),
            fourcc: settings.fourcc,
            chroma_offsets: (settings.cb_qp_offset, settings.cr_qp_offset),
            on_end,
            streams: VecDeque::new(),
            jobs: VecDeque::new(),
            recs: VecDeque::new(),
            frame_count: 0,
            since_idr: 0,
            gop_pos: 0,
            nal_id: 0,
            qp: if settings.rc.init_qp >= 0 { settings.rc.init_qp } else { 30 },
            pumping: false,
            flushing: false,
            eos_sent: false,
        }
    }

    fn stream_buffers_needed(&self) -> usize {
        if self.subframe { usize::from(self.num_slices) } else { 1 }
    }

    /// 取出下一批回调, 没有可以完成的工作时返回 None
    fn next_batch(&mut self) -> Option<Vec<Completion>> {
        if !self.jobs.is_empty() {
            if self.streams.len() < self.stream_buffers_needed() {
                trace!("等待码流缓冲区");
                return None;
            }
            let job = self.jobs.pop_front()?;
            return Some(self.encode(job));
        }
        if self.flushing && !self.eos_sent {
            self.eos_sent = true;
            return Some(vec![Completion::EndOfStream]);
        }
        None
    }

    /// 应用随帧提交的参数变更, 返回本帧要上报的高层语法变化
    fn apply_request(&mut self, request: &RequestInfo) -> HlsInfo {
        let mut hls = HlsInfo::default();
        let options = request.options;
        if options.contains(RequestOptions::UPDATE_PARAMS) {
            if (request.rc.frame_rate, request.rc.clk_ratio) != (self.rc.frame_rate, self.rc.clk_ratio) {
                hls.frame_rate = Some((request.rc.frame_rate, request.rc.clk_ratio));
            }
            self.rc = request.rc;
            self.gop = request.gop;
        }
        if options.contains(RequestOptions::SET_INPUT_RESOLUTION) {
            self.dim = request.input_dim;
            self.nal_id = self.nal_id.wrapping_add(1);
            hls.resolution_changed = true;
        }
        if options.contains(RequestOptions::SET_LF_OFFSETS) {
            hls.lf_offset_changed = true;
            (hls.beta_offset, hls.tc_offset) = request.lf_offsets;
        }
        if options.contains(RequestOptions::SET_CHROMA_OFFSETS) {
            self.chroma_offsets = request.chroma_offsets;
        }
        if options.contains(RequestOptions::SET_QP) && request.qp >= 0 {
            self.qp = request.qp;
        }
        hls.nal_id = self.nal_id;
        hls.chroma_qp_offsets = Some(self.chroma_offsets);
        hls
    }

    /// 按 GOP 结构决定图像类型: (slice 类型, 是否 IDR, 恢复点计数)
    fn picture_type(&mut self, options: RequestOptions) -> (SliceType, bool, u32) {
        let is_idr = self.frame_count == 0
            || options.contains(RequestOptions::RESTART_GOP)
            || (self.gop.freq_idr > 0 && self.since_idr >= self.gop.freq_idr);
        if is_idr {
            self.since_idr = 0;
            self.gop_pos = 0;
        }
        let mut recovery_cnt = 0;
        if !is_idr && options.contains(RequestOptions::RESTART_GOP_RECOVERY_POINT) {
            recovery_cnt = self.gop.length;
            self.gop_pos = 1;
        }
        let slice_type = if recovery_cnt == 0 && self.gop_pos % self.gop.length.max(1) == 0 {
            SliceType::I
        } else {
            SliceType::P
        };
        self.since_idr += 1;
        self.gop_pos += 1;
        (slice_type, is_idr, recovery_cnt)
    }

    /// CBR 下每帧的填充预算
    fn filler_budget(&self, written: usize) -> usize {
        if self.filler == FillerMode::Disable || self.rc.mode != RcMode::Cbr {
            return 0;
        }
        let per_frame = u64::from(self.rc.target_bit_rate) * u64::from(self.rc.clk_ratio)
            / (8 * 1000 * u64::from(self.rc.frame_rate.max(1)));
        (per_frame as usize).saturating_sub(written)
    }

    fn encode(&mut self, job: Job) -> Vec<Completion> {
        let hls = self.apply_request(&job.request);
        let (slice_type, is_idr, recovery_cnt) = self.picture_type(job.request.options);
        let frame_idx = self.frame_count;
        self.frame_count += 1;

        let base = PicStatus {
            slice_type,
            is_idr,
            recovery_cnt,
            pic_struct: job.info.pic_struct,
            pps_qp: i32::from(self.qp),
            pic_dim: self.dim,
            hls,
            ..Default::default()
        };
        debug!(
            "环回编码第 {} 帧: {:?}{} qp {}",
            frame_idx,
            slice_type,
            if is_idr { " (IDR)" } else { "" },
            self.qp
        );

        let num_slices = self.num_slices;
        let mut completions = Vec::new();
        let mut parts = Vec::new();
        let mut written = 0usize;
        let mut error = ErrorCode::Success;
        let mut current: Option<(u64, Buffer, usize)> = None;

        for slice in 0..num_slices {
            if current.is_none() {
                current = self.streams.pop_front();
            }
            let Some((stream_id, stream, cursor)) = current.as_mut() else {
                break;
            };
            let stream_id = *stream_id;
            let slice_info = SliceInfo {
                index: slice,
                slice_type,
                is_idr,
                frame_idx,
            };
            match write_slice(stream, *cursor, self.codec, self.start_code, &slice_info, &job.source) {
                Some(len) => {
                    parts.push(StreamPart {
                        offset: *cursor as u32,
                        size: len as u32,
                    });
                    *cursor += len;
                    written += len;
                }
                None => {
                    warn!("码流缓冲区 {} 容纳不下第 {} 个 slice", stream_id, slice);
                    error = ErrorCode::StreamOverflow;
                }
            }

            let is_last = slice + 1 == num_slices;
            if self.subframe || is_last {
                let status = PicStatus {
                    is_first_slice: !self.subframe || slice == 0,
                    is_last_slice: is_last,
                    filler: if is_last { self.filler_budget(written) } else { 0 },
                    stream_parts: std::mem::take(&mut parts),
                    error,
                    ..base.clone()
                };
                completions.push(Completion::Encoded {
                    status,
                    frame_id: job.info.frame_id,
                    stream_id,
                });
                current = None;
            }
        }

        self.keep_rec_picture(&job.source);
        completions
    }

    fn keep_rec_picture(&mut self, source: &Buffer) {
        if self.recs.len() >= MAX_REC_PICTURES {
            self.recs.pop_front();
        }
        self.recs.push_back(RecPicture {
            buffer: Buffer::from_vec(source.to_vec(), "rec"),
            dim: self.dim,
            fourcc: self.fourcc,
        });
    }
}

struct SliceInfo {
    index: u16,
    slice_type: SliceType,
    is_idr: bool,
    frame_idx: u64,
}

/// 写入一个合成 slice NAL, 返回写入的字节数; 空间不足时返回 None
fn write_slice(
    stream: &Buffer,
    offset: usize,
    codec: Codec,
    start_code: StartCodeMode,
    slice: &SliceInfo,
    source: &Buffer,
) -> Option<usize> {
    let mut rbsp_buf = [0u8; 64];
    let mut rbsp = BitstreamLite::new(&mut rbsp_buf);
    rbsp.put_ue(u32::from(slice.index));
    rbsp.put_ue(match slice.slice_type {
        SliceType::P => 0,
        SliceType::B => 1,
        SliceType::I => 2,
    });
    rbsp.put_bits(16, (slice.frame_idx & 0xFFFF) as u32);
    {
        let data = source.lock_data();
        let step = (data.len() / SLICE_SAMPLE_BYTES).max(1);
        for &byte in data.iter().step_by(step).take(SLICE_SAMPLE_BYTES) {
            rbsp.put_bits(8, u32::from(byte));
        }
    }
    rbsp.rbsp_trailing_bits();
    let rbsp_bits = rbsp.bits_written();

    let (nut, header) = match codec {
        Codec::Avc => {
            let nut = if slice.is_idr { AvcNalType::SliceIdr } else { AvcNalType::Slice }.type_id();
            (nut, NalHeader::avc(nut, 2))
        }
        Codec::Hevc => {
            let nut = if slice.is_idr { HevcNalType::IdrWRadl } else { HevcNalType::TrailR }.type_id();
            (nut, NalHeader::hevc(nut, 0, 0))
        }
    };

    let mut data = stream.lock_data();
    let room = data.get_mut(offset..)?;
    let mut out = BitstreamLite::new(room);
    flush_nal(&mut out, codec, nut, &header, &rbsp_buf, rbsp_bits, start_code);
    if out.is_overflow() {
        return None;
    }
    Some(out.byte_offset())
}

#[derive(Default)]
struct Inner {
    channels: Mutex<HashMap<u32, ChannelCtx>>,
    next_id: AtomicU32,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, ChannelCtx>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_channel<R>(&self, chan: ChannelId, f: impl FnOnce(&mut ChannelCtx) -> R) -> EncResult<R> {
        let mut channels = self.lock();
        let ctx = channels
            .get_mut(&chan.0)
            .ok_or_else(|| EncError::Scheduler(format!("通道 {} 不存在", chan)))?;
        Ok(f(ctx))
    }

    /// 完成所有就绪的工作, 回调时不持有锁
    ///
    /// 回调里再次触发的 pump 直接返回, 由外层循环继续处理, 保证回调顺序.
    fn pump(&self, chan: ChannelId) {
        let started = self.with_channel(chan, |ctx| {
            if ctx.pumping {
                false
            } else {
                ctx.pumping = true;
                true
            }
        });
        if !matches!(started, Ok(true)) {
            return;
        }
        loop {
            let batch = self.with_channel(chan, |ctx| match ctx.next_batch() {
                Some(completions) => Some((Arc::clone(&ctx.on_end), completions)),
                None => {
                    ctx.pumping = false;
                    None
                }
            });
            let Ok(Some((on_end, completions))) = batch else {
                return;
            };
            for completion in completions {
                on_end(completion);
            }
        }
    }
}

/// 软件环回调度器
pub struct LoopbackScheduler {
    inner: Arc<Inner>,
    worker: Option<(Sender<ChannelId>, JoinHandle<()>)>,
}

impl LoopbackScheduler {
    /// 同步模式: 在调用线程上回调
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            worker: None,
        }
    }

    /// 线程模式: 在独立工作线程上回调
    pub fn threaded() -> EncResult<Self> {
        let inner: Arc<Inner> = Arc::default();
        let (tx, rx) = mpsc::channel::<ChannelId>();
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("hwenc-loopback".into())
            .spawn(move || {
                for chan in rx {
                    worker_inner.pump(chan);
                }
            })?;
        Ok(Self {
            inner,
            worker: Some((tx, handle)),
        })
    }

    fn kick(&self, chan: ChannelId) {
        match &self.worker {
            Some((tx, _)) => {
                if tx.send(chan).is_err() {
                    warn!("环回工作线程已退出");
                }
            }
            None => self.inner.pump(chan),
        }
    }
}

impl Default for LoopbackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LoopbackScheduler {
    fn drop(&mut self) {
        if let Some((tx, handle)) = self.worker.take() {
            drop(tx);
            if handle.join().is_err() {
                warn!("环回工作线程异常退出");
            }
        }
    }
}

impl Scheduler for LoopbackScheduler {
    fn create_channel(&self, settings: &EncSettings, _ep1: &Buffer, on_end: EndEncodingFn) -> EncResult<ChannelId> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().insert(id, ChannelCtx::new(settings, on_end));
        debug!("环回调度器创建通道 #{}", id);
        Ok(ChannelId(id))
    }

    fn destroy_channel(&self, chan: ChannelId) -> EncResult<()> {
        self.inner
            .lock()
            .remove(&chan.0)
            .map(|_| ())
            .ok_or_else(|| EncError::Scheduler(format!("通道 {} 不存在", chan)))
    }

    fn encode_one_frame(&self, chan: ChannelId, info: EncInfo, request: &RequestInfo, frame: &Buffer) -> EncResult<()> {
        self.inner.with_channel(chan, |ctx| {
            if ctx.flushing {
                return Err(EncError::Eof);
            }
            ctx.jobs.push_back(Job {
                info,
                request: request.clone(),
                source: frame.clone(),
            });
            Ok(())
        })??;
        self.kick(chan);
        Ok(())
    }

    fn flush(&self, chan: ChannelId) -> EncResult<()> {
        self.inner.with_channel(chan, |ctx| ctx.flushing = true)?;
        self.kick(chan);
        Ok(())
    }

    fn put_stream_buffer(&self, chan: ChannelId, stream: &Buffer, stream_id: u64, offset: usize) -> EncResult<()> {
        self.inner
            .with_channel(chan, |ctx| ctx.streams.push_back((stream_id, stream.clone(), offset)))?;
        self.kick(chan);
        Ok(())
    }

    fn get_rec_picture(&self, chan: ChannelId) -> Option<RecPicture> {
        self.inner.with_channel(chan, |ctx| ctx.recs.pop_front()).ok().flatten()
    }

    fn release_rec_picture(&self, _chan: ChannelId, rec: RecPicture) -> EncResult<()> {
        drop(rec);
        Ok(())
    }
}
