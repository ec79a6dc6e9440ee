//! 编码主循环.
//!
//! 每帧依次: 应用命令文件中到期的命令, 生成合成源帧与可选的 QP 表, 提交编码,
//! 再处理编码器回调送回的事件 (写出码流, 重新提交码流缓冲区).
//! 回调在调度器线程上执行, 事件经 channel 转交主线程处理.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use hwenc_codec::{
    Allocator, EncSettings, EncodedCallback, EncodedEvent, Encoder, HdrSeis, HostAllocator, LoopbackScheduler,
    MAX_HEADER_SIZE, QpTableMode, Scheduler,
};
use hwenc_core::{Buffer, Dimension, FourCc, PixMapMeta};
use hwenc_qp::{QpControl, QpFrameParams, QpGenerator, QpMode};
use log::{debug, info, warn};

use crate::command_manager::CommandManager;
use crate::commands_sender::EncoderCommandsSender;
use crate::sink::{BitstreamSink, flags_summary};

/// 一次编码任务的全部参数
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub settings: EncSettings,
    pub num_frames: u32,
    pub output: PathBuf,
    pub cmd_file: Option<PathBuf>,
    pub lookahead: usize,
    pub qp_mode: QpMode,
    pub qp_folder: PathBuf,
    pub roi_file: Option<PathBuf>,
    /// 动态输入分辨率, 索引 0 为编码尺寸, 之后依次为这里的条目
    pub dyn_inputs: Vec<Dimension>,
    /// `HDRIndex` 命令可选的 HDR SEI
    pub hdr_seis: Vec<HdrSeis>,
    pub num_stream_buffers: usize,
    /// 调度器在独立线程上编码
    pub threaded: bool,
}

impl JobConfig {
    pub fn new(settings: EncSettings, num_frames: u32, output: PathBuf) -> Self {
        Self {
            settings,
            num_frames,
            output,
            cmd_file: None,
            lookahead: 1,
            qp_mode: QpMode::Uniform,
            qp_folder: PathBuf::from("."),
            roi_file: None,
            dyn_inputs: Vec::new(),
            hdr_seis: Vec::new(),
            num_stream_buffers: 4,
            threaded: false,
        }
    }
}

/// 编码结果统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub frames_submitted: u32,
    pub frames_written: u64,
    pub bytes_written: u64,
}

/// 按行填充渐变亮度的合成源帧, 色度取中间值
pub fn synthetic_frame(dim: Dimension, fourcc: FourCc, index: u32) -> Buffer {
    let meta = PixMapMeta::packed(dim, fourcc);
    let mut data = vec![0x80u8; meta.required_size()];
    let pitch = meta.luma_pitch as usize;
    let luma = pitch * dim.height as usize;
    for (y, row) in data[..luma].chunks_exact_mut(pitch).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = (x + y + index as usize) as u8;
        }
    }
    let frame = Buffer::from_vec(data, "source");
    frame.add_meta(meta);
    frame
}

fn stream_buffer_size(settings: &EncSettings) -> usize {
    MAX_HEADER_SIZE + (settings.max_dim().width as usize * settings.max_dim().height as usize).max(64 * 1024)
}

fn qp_generator(job: &JobConfig, settings: &EncSettings, dim: Dimension) -> QpGenerator {
    let control = QpControl {
        mode: job.qp_mode,
        relative: settings.qp_table == QpTableMode::Relative,
    };
    let generator =
        QpGenerator::new(settings.codec(), dim, settings.lcu_log2(), control).with_tables_folder(&job.qp_folder);
    match &job.roi_file {
        Some(path) => generator.with_roi_file(path),
        None => generator,
    }
}

/// slice QP 取初始 QP, 上下界取各 slice 类型中最紧的一组
fn qp_frame_params(settings: &EncSettings, frame_id: u32) -> QpFrameParams {
    let rc = &settings.rc;
    let min_qp = rc.min_qp.iter().copied().max().unwrap_or_default();
    let max_qp = rc.max_qp.iter().copied().min().unwrap_or_default();
    let slice_qp = if rc.init_qp < 0 { 30 } else { rc.init_qp };
    QpFrameParams {
        frame_id,
        slice_qp: slice_qp.clamp(min_qp, max_qp.max(min_qp)),
        min_qp,
        max_qp,
    }
}

/// 编码器与主线程之间的码流处理
struct StreamPump<'a> {
    encoder: &'a Encoder,
    events: Receiver<EncodedEvent>,
    sink: BitstreamSink<std::io::BufWriter<File>>,
    eos: bool,
}

impl StreamPump<'_> {
    fn handle(&mut self, event: EncodedEvent) -> Result<()> {
        match event {
            EncodedEvent::Stream { stream, source } => {
                let report = self
                    .sink
                    .write_stream(&stream)
                    .context("写出码流失败")?;
                info!(
                    "码流 {:?}{}: {} 字节, {} 段 [{}]{}",
                    report.slice_type,
                    if report.skipped { " (skip)" } else { "" },
                    report.bytes,
                    report.sections,
                    flags_summary(report.flags),
                    if source.is_some() { ", 源帧已归还" } else { "" },
                );
                if !self.eos {
                    self.encoder.put_stream_buffer(stream).context("重新提交码流缓冲区失败")?;
                }
            }
            EncodedEvent::ReleasedStream(stream) => debug!("码流缓冲区 {} 已归还", stream.name()),
            EncodedEvent::ReleasedSource(source) => debug!("源帧 {} 未编码即归还", source.id()),
            EncodedEvent::EndOfStream => self.eos = true,
        }
        Ok(())
    }

    /// 处理已到达的事件, 不阻塞
    fn drain(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.handle(event)?;
        }
        Ok(())
    }

    /// 空闲码流缓冲区不足 `needed` 个时阻塞等待编码器归还
    fn wait_stream_buffers(&mut self, needed: usize) -> Result<()> {
        while !self.eos && self.encoder.pending_streams() < needed {
            let event = self.events.recv().context("编码器事件通道已关闭")?;
            self.handle(event)?;
        }
        Ok(())
    }

    /// 阻塞直到流结束
    fn wait_end_of_stream(&mut self) -> Result<()> {
        while !self.eos {
            let event = self.events.recv().context("编码器事件通道已关闭")?;
            self.handle(event)?;
        }
        Ok(())
    }
}

/// 执行编码任务
pub fn run(job: &JobConfig) -> Result<RunSummary> {
    let mut settings = job.settings.clone();
    if job.qp_mode != QpMode::Uniform && settings.qp_table == QpTableMode::None {
        info!("QP 表模式 {:?} 需要 QP 表, 通道改为相对 QP", job.qp_mode);
        settings.qp_table = QpTableMode::Relative;
    }
    if job.qp_mode == QpMode::Roi && job.roi_file.is_none() {
        bail!("ROI 模式需要 --roi-file");
    }

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback: EncodedCallback = Box::new(move |event| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(event);
        }
    });
    let scheduler: Arc<dyn Scheduler> = if job.threaded {
        Arc::new(LoopbackScheduler::threaded().context("启动调度线程失败")?)
    } else {
        Arc::new(LoopbackScheduler::new())
    };
    let allocator = Arc::new(HostAllocator::new());
    let encoder = Encoder::create(scheduler, allocator.clone(), settings.clone(), callback)
        .context("创建编码通道失败")?;

    let sink = BitstreamSink::create(&job.output)
        .with_context(|| format!("创建输出文件 {} 失败", job.output.display()))?;
    let mut pump = StreamPump {
        encoder: &encoder,
        events: rx,
        sink,
        eos: false,
    };

    let stream_size = stream_buffer_size(&settings);
    let per_frame = if settings.subframe_latency { usize::from(settings.num_slices) } else { 1 };
    for _ in 0..job.num_stream_buffers.max(per_frame) {
        let stream = allocator.alloc(stream_size, "stream").context("分配码流缓冲区失败")?;
        encoder.put_stream_buffer(stream).context("提交码流缓冲区失败")?;
    }

    let mut commands = match &job.cmd_file {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("打开命令文件 {} 失败", path.display()))?;
            Some(
                CommandManager::new(BufReader::new(file), job.lookahead, settings.gop.freq_lt)
                    .with_context(|| format!("命令文件 {} 解析失败", path.display()))?,
            )
        }
        None => None,
    };
    if let Some(commands) = &commands {
        debug!("命令文件预读 {} 个条目", commands.pending().count());
    }
    let mut sender = EncoderCommandsSender::new(&encoder);

    let mut dim = settings.dim();
    let mut qp_gen = (job.qp_mode != QpMode::Uniform).then(|| qp_generator(job, &settings, dim));
    let mut summary = RunSummary::default();

    for frame_id in 0..job.num_frames {
        if let Some(commands) = commands.as_mut() {
            commands
                .process(&mut sender, frame_id)
                .with_context(|| format!("第 {} 帧的命令解析失败", frame_id))?;
        }
        if let Some(index) = sender.has_input_changed() {
            let target = if index == 0 { Some(settings.dim()) } else { job.dyn_inputs.get(index - 1).copied() };
            match target {
                Some(target) => match encoder.set_input_resolution(target) {
                    Ok(()) => {
                        info!("第 {} 帧起输入分辨率切换为 {}", frame_id, target);
                        dim = target;
                        if qp_gen.is_some() {
                            qp_gen = Some(qp_generator(job, &settings, dim));
                        }
                    }
                    Err(e) => warn!("切换输入分辨率 {} 失败: {}", target, e),
                },
                None => warn!("没有第 {} 个动态输入", index),
            }
        }
        if let Some(index) = sender.has_hdr_changed() {
            match job.hdr_seis.get(index) {
                Some(hdr) => {
                    if let Err(e) = encoder.set_hdr_seis(hdr.clone()) {
                        warn!("更新 HDR SEI 失败: {}", e);
                    }
                }
                None => warn!("没有第 {} 组 HDR SEI", index),
            }
        }
        sender.reset();

        let qp_table = match qp_gen.as_mut() {
            Some(generator) => {
                let table = Buffer::new(generator.layout().table_size(), "qp_table");
                let params = qp_frame_params(&encoder.settings(), frame_id);
                let used = generator
                    .generate(&params, table.lock_data().as_mut_slice())
                    .with_context(|| format!("第 {} 帧 QP 表生成失败", frame_id))?;
                used.then_some(table)
            }
            None => None,
        };

        pump.wait_stream_buffers(per_frame)?;
        let source = synthetic_frame(dim, settings.fourcc, frame_id);
        encoder
            .process(Some(&source), qp_table.as_ref())
            .with_context(|| format!("提交第 {} 帧失败 (last error {:?})", frame_id, encoder.last_error()))?;
        summary.frames_submitted += 1;
        pump.drain()?;
    }

    encoder.process(None, None).context("结束编码失败")?;
    pump.wait_end_of_stream()?;
    pump.sink.flush().context("写出码流失败")?;

    summary.frames_written = pump.sink.frames();
    summary.bytes_written = pump.sink.total_bytes();
    info!(
        "编码完成: 提交 {} 帧, 写出 {} 帧, {} 字节",
        summary.frames_submitted, summary.frames_written, summary.bytes_written
    );
    Ok(summary)
}
